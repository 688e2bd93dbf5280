//! In-memory message bus for tests/dev and single-node deployments.

use std::sync::{Mutex, mpsc};

use tracing::trace;

use crate::bus::{BusError, MessageBus, Subscription, TopicFilter};
use crate::message::BusMessage;

/// In-process pub/sub bus.
///
/// - No IO, no async
/// - Best-effort fan-out to every matching subscription
/// - Dead subscriptions are pruned while publishing
#[derive(Debug, Default)]
pub struct InMemoryMessageBus {
    subscribers: Mutex<Vec<(TopicFilter, mpsc::Sender<BusMessage>)>>,
}

impl InMemoryMessageBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions (as of the last publish).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl MessageBus for InMemoryMessageBus {
    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let mut subs = self.subscribers.lock().map_err(|_| BusError::Poisoned)?;

        trace!(topic = message.topic(), subscribers = subs.len(), "publishing bus message");

        subs.retain(|(filter, tx)| {
            if !filter.matches(message.topic()) {
                return true;
            }
            tx.send(message.clone()).is_ok()
        });

        Ok(())
    }

    fn subscribe(&self, filter: TopicFilter) -> Subscription<BusMessage> {
        let (tx, rx) = mpsc::channel();

        // A poisoned lock still yields a subscription; it just never receives.
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push((filter, tx));
        }

        Subscription::new(rx)
    }
}
