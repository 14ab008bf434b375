/// Failure reported by a [`crate::ChatTransport`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    Disconnected(String),

    /// The server answered with a structured error.
    #[error("{code}: {message}")]
    Rejected { code: String, message: String },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error("invalid message: {0}")]
    InvalidPayload(String),

    #[error("send failed: {0}")]
    Send(TransportError),

    #[error("attachment upload failed: {0}")]
    Upload(TransportError),

    /// The provisional entry was removed while its upload was in flight.
    #[error("send cancelled")]
    Cancelled,
}
