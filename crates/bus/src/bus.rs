//! Message bus abstraction (mechanics only).
//!
//! The bus distributes notifications between management nodes. It carries no
//! state of its own: the job store is the source of truth, and a message only
//! tells a receiver that something may have changed and is worth re-checking.
//!
//! ## Delivery Guarantees
//!
//! - **At-least-once**: a message may arrive more than once
//! - **No cross-topic ordering**: messages on different topics may interleave arbitrarily
//! - **Fire-and-forget**: subscribers that fall away are dropped silently
//!
//! Every consumer must therefore be idempotent and tolerate duplicate or
//! out-of-order delivery.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

use thiserror::Error;

use crate::message::BusMessage;

/// Bus failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Internal lock poisoning in an in-process implementation.
    #[error("message bus state poisoned")]
    Poisoned,

    /// Transport-level failure (network, broker, serialization).
    #[error("transport error: {0}")]
    Transport(String),
}

/// Which topics a subscription wants to see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Every message published on the bus.
    All,
    /// Only messages whose topic is in the set.
    Topics(HashSet<String>),
}

impl TopicFilter {
    pub fn topic(topic: impl Into<String>) -> Self {
        Self::Topics(HashSet::from([topic.into()]))
    }

    pub fn topics<I, T>(topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self::Topics(topics.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topics(set) => set.contains(topic),
        }
    }
}

/// A subscription to a stream of bus messages.
///
/// Subscriptions are designed for single-threaded consumption. Dropping the
/// subscription unsubscribes it (the bus prunes it on the next publish).
///
/// ```ignore
/// let sub = bus.subscribe(TopicFilter::topic("job.state"));
/// loop {
///     match sub.recv_timeout(Duration::from_millis(250)) {
///         Ok(msg) => handle(msg),
///         Err(RecvTimeoutError::Timeout) => continue,
///         Err(RecvTimeoutError::Disconnected) => break,
///     }
/// }
/// ```
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Topic-based publish/subscribe bus shared by all management nodes.
///
/// The trait requires `Send + Sync`; publishers on many worker threads may
/// publish concurrently.
pub trait MessageBus: Send + Sync {
    /// Publish a message to every subscription whose filter matches its topic.
    fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    /// Open a subscription for the given topics.
    fn subscribe(&self, filter: TopicFilter) -> Subscription<BusMessage>;
}

impl<B> MessageBus for Arc<B>
where
    B: MessageBus + ?Sized,
{
    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        (**self).publish(message)
    }

    fn subscribe(&self, filter: TopicFilter) -> Subscription<BusMessage> {
        (**self).subscribe(filter)
    }
}
