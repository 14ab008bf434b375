use std::sync::Arc;

use serde::de::DeserializeOwned;
use socketioxide::extract::{Data, SocketRef};
use tokio::sync::mpsc;

use expertly_shared::errors::{AppError, AppResult, ErrorCode};
use expertly_shared::middleware::decode_token;
use expertly_shared::types::{
    commands, ErrorEvent, EventKind, RoomCommand, SendMessageCommand, ServerEvent, TypingCommand,
};

use crate::rooms::SessionId;
use crate::AppState;

fn session_id(socket: &SocketRef) -> SessionId {
    SessionId(socket.id.to_string())
}

fn parse<T: DeserializeOwned>(payload: serde_json::Value) -> AppResult<T> {
    serde_json::from_value(payload)
        .map_err(|e| AppError::new(ErrorCode::ValidationError, format!("malformed command: {e}")))
}

pub async fn on_connect_with_state(socket: SocketRef, state: Arc<AppState>) {
    let user_id = match authenticate_socket(&socket, &state) {
        Ok(id) => id,
        Err(e) => {
            let (_, message) = e.code_and_message();
            tracing::warn!(error = %message, "messaging socket auth failed");
            let _ = socket.emit(
                EventKind::Error.as_str(),
                &ErrorEvent {
                    code: "AUTH_FAILED".into(),
                    message,
                    client_key: None,
                },
            );
            socket.disconnect().ok();
            return;
        }
    };

    socket.extensions.insert(user_id.clone());
    let session = session_id(&socket);

    // Everything the hub routes to this session goes out through here.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.chat.connect(session.clone(), user_id.clone(), tx);

    let outbound = socket.clone();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let data = match event.data() {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(error = %e, event = %event.kind(), "failed to serialize event");
                    continue;
                }
            };
            if let Err(e) = outbound.emit(event.kind().as_str(), &data) {
                tracing::debug!(error = %e, sid = %outbound.id, "emit failed");
            }
        }
    });

    tracing::info!(user_id = %user_id, sid = %socket.id, "messaging socket connected");
    let _ = socket.emit("connected", &serde_json::json!({ "user_id": user_id }));

    socket.on(commands::JOIN, {
        let state = state.clone();
        move |socket: SocketRef, Data::<serde_json::Value>(payload)| {
            let state = state.clone();
            async move { on_join(socket, payload, &state).await; }
        }
    });

    socket.on(commands::LEAVE, {
        let state = state.clone();
        move |socket: SocketRef, Data::<serde_json::Value>(payload)| {
            let state = state.clone();
            async move { on_leave(socket, payload, &state); }
        }
    });

    socket.on(commands::SEND, {
        let state = state.clone();
        move |socket: SocketRef, Data::<serde_json::Value>(payload)| {
            let state = state.clone();
            async move { on_send(socket, payload, &state).await; }
        }
    });

    socket.on(commands::TYPING, {
        let state = state.clone();
        move |socket: SocketRef, Data::<serde_json::Value>(payload)| {
            let state = state.clone();
            async move { on_typing(socket, payload, &state); }
        }
    });

    socket.on(commands::MARK_READ, {
        let state = state.clone();
        move |socket: SocketRef, Data::<serde_json::Value>(payload)| {
            let state = state.clone();
            async move { on_mark_read(socket, payload, &state).await; }
        }
    });

    socket.on_disconnect({
        let state = state.clone();
        move |socket: SocketRef| {
            let state = state.clone();
            async move {
                state.chat.disconnect(&session_id(&socket));
                tracing::info!(sid = %socket.id, "messaging socket disconnected");
            }
        }
    });
}

async fn on_join(socket: SocketRef, payload: serde_json::Value, state: &Arc<AppState>) {
    let session = session_id(&socket);
    let result = match parse::<RoomCommand>(payload) {
        Ok(cmd) => state.chat.join(&session, cmd.conversation_id).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        state.chat.report_error(&session, &e, None);
    }
}

fn on_leave(socket: SocketRef, payload: serde_json::Value, state: &Arc<AppState>) {
    let session = session_id(&socket);
    match parse::<RoomCommand>(payload) {
        Ok(cmd) => state.chat.leave(&session, cmd.conversation_id),
        Err(e) => state.chat.report_error(&session, &e, None),
    }
}

async fn on_send(socket: SocketRef, payload: serde_json::Value, state: &Arc<AppState>) {
    let session = session_id(&socket);
    // Read before parsing so even a malformed command can be correlated.
    let client_key = payload
        .get("client_key")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string);

    let result = match (parse::<SendMessageCommand>(payload), get_user_id(&socket)) {
        (Ok(cmd), Some(sender_id)) => state.chat.send_message(&sender_id, cmd).await.map(|_| ()),
        (Err(e), _) => Err(e),
        (_, None) => Err(AppError::unauthorized("session is not authenticated")),
    };
    if let Err(e) = result {
        tracing::debug!(sid = %socket.id, error = %e, "message.send rejected");
        state.chat.report_error(&session, &e, client_key);
    }
}

fn on_typing(socket: SocketRef, payload: serde_json::Value, state: &Arc<AppState>) {
    let session = session_id(&socket);
    let result = parse::<TypingCommand>(payload)
        .and_then(|cmd| state.chat.typing(&session, cmd.conversation_id, cmd.is_typing));
    if let Err(e) = result {
        state.chat.report_error(&session, &e, None);
    }
}

async fn on_mark_read(socket: SocketRef, payload: serde_json::Value, state: &Arc<AppState>) {
    let session = session_id(&socket);
    let result = match (parse::<RoomCommand>(payload), get_user_id(&socket)) {
        (Ok(cmd), Some(reader_id)) => state.chat.mark_read(cmd.conversation_id, &reader_id).await.map(|_| ()),
        (Err(e), _) => Err(e),
        (_, None) => Err(AppError::unauthorized("session is not authenticated")),
    };
    if let Err(e) = result {
        state.chat.report_error(&session, &e, None);
    }
}

fn get_user_id(socket: &SocketRef) -> Option<String> {
    socket.extensions.get::<String>()
}

fn authenticate_socket(socket: &SocketRef, state: &Arc<AppState>) -> AppResult<String> {
    let connect_info = socket.req_parts();

    // Token comes from the query string: ?token=xxx
    let query = connect_info.uri.query().unwrap_or_default();
    let token = token_from_query(query)
        .ok_or_else(|| AppError::unauthorized("missing token query parameter"))?;

    let claims = decode_token(&token, &state.config.jwt_secret)?;
    Ok(claims.sub)
}

fn token_from_query(query: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=')?;
        (key == "token" && !value.is_empty()).then(|| value.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_read_from_query() {
        assert_eq!(token_from_query("EIO=4&transport=websocket&token=abc.def"), Some("abc.def".into()));
        assert_eq!(token_from_query("EIO=4&token="), None);
        assert_eq!(token_from_query(""), None);
    }

    #[test]
    fn malformed_command_is_a_validation_error() {
        let err = parse::<RoomCommand>(serde_json::json!({ "conversation_id": "nope" })).unwrap_err();
        assert_eq!(err.code_and_message().0, "E0002");
    }
}
