pub mod api;
pub mod auth;
pub mod chat;
pub mod event;
pub mod pagination;
pub mod realtime;

pub use api::*;
pub use auth::*;
pub use chat::*;
pub use event::*;
pub use pagination::*;
pub use realtime::*;
