use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single message on the bus.
///
/// - `topic` is the routing key subscribers filter on.
/// - `payload` is free-form JSON; receivers must not assume it is complete or
///   current, only that it hints at a change worth re-checking.
/// - `message_id` lets consumers spot redeliveries when they care to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    message_id: Uuid,
    topic: String,
    payload: serde_json::Value,
    published_at: DateTime<Utc>,
}

impl BusMessage {
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            message_id: Uuid::now_v7(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }

    /// Message with an empty (`null`) payload.
    pub fn signal(topic: impl Into<String>) -> Self {
        Self::new(topic, serde_json::Value::Null)
    }

    pub fn message_id(&self) -> Uuid {
        self.message_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn into_payload(self) -> serde_json::Value {
        self.payload
    }
}
