pub mod publisher;

pub use publisher::{DomainEvents, NoopEvents, RabbitPublisher};
