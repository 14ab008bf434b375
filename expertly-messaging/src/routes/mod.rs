pub mod attachments;
pub mod conversations;
pub mod health;
pub mod messages;
