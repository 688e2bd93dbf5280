//! Cluster message bus mechanics: topic-based publish/subscribe.
//!
//! The job engine treats the bus as an unreliable, at-least-once transport.
//! Nothing here knows about jobs; the well-known topic names live in [`topics`].

pub mod bus;
pub mod in_memory_bus;
pub mod message;
pub mod topics;

pub use bus::{BusError, MessageBus, Subscription, TopicFilter};
pub use in_memory_bus::InMemoryMessageBus;
pub use message::BusMessage;
