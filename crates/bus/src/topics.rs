//! Topics the job engine publishes on.
//!
//! Join records may also list arbitrary caller-defined topics; those are opaque
//! strings to the bus.

/// A job reached a terminal status. Payload: `{"job_id": .., "status": ..}`.
pub const TOPIC_JOB_STATE: &str = "job.state";

/// `complete_join` satisfied one or more join records. Payload: `{"child_job_id": ..}`.
pub const TOPIC_JOIN_COMPLETED: &str = "job.join.completed";

/// A join record was severed by `disjoin_job`. Payload: `{"parent_job_id": .., "child_job_id": ..}`.
pub const TOPIC_JOIN_DISJOINED: &str = "job.join.disjoined";

/// A sync-queue slot was granted to a waiting job. Payload: `{"job_id": .., "sync_key": ..}`.
pub const TOPIC_SYNC_QUEUE_GRANTED: &str = "job.sync_queue.granted";

/// Per-job topic, published alongside [`TOPIC_JOB_STATE`] so joiners can wake on
/// exactly the child they wait for.
pub fn job_topic(job_id: impl core::fmt::Display) -> String {
    format!("job.{job_id}")
}
