//! Client half of expertly messaging.
//!
//! [`ConversationTimeline`] holds what a user sees in one open conversation:
//! confirmed messages plus provisional ones inserted before the server
//! answered. [`ChatSession`] drives a timeline over any [`ChatTransport`].

pub mod conversations;
pub mod error;
pub mod session;
pub mod timeline;
pub mod typing;

pub use conversations::ConversationList;
pub use error::{ClientError, TransportError};
pub use session::{AttachmentFile, ChatSession, ChatTransport};
pub use timeline::{ClientAction, ConversationTimeline, EntryId, PendingSend, Reconciled, TimelineEntry};
pub use typing::{RemoteTyping, TypingTracker};
