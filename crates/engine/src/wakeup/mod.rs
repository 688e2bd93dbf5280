//! Resumption of parked async joins.
//!
//! Two paths converge on the same "resume parked job" action:
//! - event-driven: a publish on a topic a waiting join listens to
//! - interval-driven: a periodic sweep that re-checks readiness and enforces timeouts
//!
//! Resumption itself goes through a `WakeupDispatcher` resolved by name from the
//! `DispatcherRegistry`. Delivery is at-least-once; dispatchers must tolerate
//! duplicates.

pub mod dispatch;
pub mod scheduler;

pub use dispatch::{DispatcherRegistry, Resumer, Wakeup, WakeupDispatcher, WakeupError, WakeupReason};
pub use scheduler::{SweepReport, WakeupScheduler, WakeupSchedulerHandle};
