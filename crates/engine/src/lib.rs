//! Asynchronous job execution and coordination engine.
//!
//! ## Components
//!
//! - `jobs`: job records, the `JobStore` adapter and the in-process executor
//! - `sync_queue`: per-resource FIFO admission control
//! - `join`: parent/child join records and the `JoinCoordinator`
//! - `wakeup`: dispatcher registry and the `WakeupScheduler` (bus events + periodic sweep)
//! - `pseudo`: execution-context to pseudo-job mapping for legacy call sites
//! - `compat`: the deprecated `wait_and_check` predicate poll
//! - `manager`: `AsyncJobManager`, the public facade composing all of the above
//!
//! Cross-node coordination happens only through the job/join stores and the
//! message bus; nothing relies on in-process memory being shared between nodes.

pub mod compat;
pub mod config;
pub mod error;
pub mod jobs;
pub mod join;
pub mod manager;
pub mod pseudo;
pub mod sync_queue;
pub mod wakeup;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, EngineConfig};
pub use error::{JobError, JobResult};
pub use jobs::{
    EXECUTOR_DISPATCHER, InMemoryJobStore, Job, JobContext, JobExecutor, JobExecutorConfig,
    JobExecutorHandle, JobOutcome, JobStatus, JobStore, JobStoreError, JournalEntry, JournalType,
    NewJournalEntry, StatusUpdate,
};
pub use join::{
    AsyncJoin, InMemoryJoinStore, JoinCoordinator, JoinMode, JoinRecord, JoinResult, JoinState,
    JoinStore, JoinStoreError,
};
pub use manager::{AsyncJobManager, AsyncJobResponse, QueryAsyncJobResult, StartupReport};
pub use pseudo::PseudoJobRegistry;
pub use sync_queue::{
    Admission, InMemorySyncQueueStore, SyncObjectKey, SyncQueue, SyncQueueItem, SyncQueueStore,
};
pub use wakeup::{
    DispatcherRegistry, SweepReport, Wakeup, WakeupDispatcher, WakeupError, WakeupReason,
    WakeupScheduler, WakeupSchedulerHandle,
};
