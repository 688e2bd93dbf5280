//! Job records, their durable store, and the in-process executor.
//!
//! - `Job`: one long-running unit of work and its lifecycle status
//! - `JobStore`: single-record transactional persistence for jobs and journals
//! - `JobExecutor`: worker threads that run job bodies and report back through the facade

pub mod executor;
pub mod store;
pub mod types;

pub use executor::{
    EXECUTOR_DISPATCHER, ExecutorStats, JobContext, JobExecutor, JobExecutorConfig,
    JobExecutorHandle, JobOutcome,
};
pub use store::{InMemoryJobStore, JobStore, JobStoreError, StatusUpdate};
pub use types::{
    Job, JobStatus, JournalEntry, JournalType, NewJournalEntry, PSEUDO_JOB_INSTANCE_TYPE,
    RESULT_CODE_INTERNAL_ERROR, RESULT_CODE_SUCCESS,
};
