//! Facade-level error model.

use thiserror::Error;

use jobweave_bus::BusError;
use jobweave_core::{CoreError, JobId};

use crate::jobs::JobStoreError;
use crate::join::JoinStoreError;
use crate::sync_queue::SyncQueueError;

pub type JobResult<T> = Result<T, JobError>;

/// Errors surfaced to callers of the job engine.
///
/// A sync-queue gate is not an error: a gated job simply waits, and the
/// submit call reports that through `Admission`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Unknown job (or the job a record points at has vanished).
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Mutation rejected by the current state (e.g. the job is already terminal).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// An async join exceeded its timeout.
    #[error("join of job {parent} on job {child} timed out")]
    JoinTimeout { parent: JobId, child: JobId },

    /// The join was severed by `disjoin_job` while waiting.
    #[error("join of job {parent} on job {child} was disjoined")]
    Disjoined { parent: JobId, child: JobId },

    /// Storage adapter failure.
    #[error("storage error: {0}")]
    Storage(String),

    /// Message bus failure.
    #[error("message bus error: {0}")]
    Bus(#[from] BusError),

    /// Malformed value (payload or identifier).
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl JobError {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }
}

impl From<JobStoreError> for JobError {
    fn from(err: JobStoreError) -> Self {
        match err {
            JobStoreError::NotFound(id) => JobError::NotFound(id),
            JobStoreError::InvalidState { job_id, reason } => {
                JobError::InvalidState(format!("job {job_id}: {reason}"))
            }
            other => JobError::Storage(other.to_string()),
        }
    }
}

impl From<JoinStoreError> for JobError {
    fn from(err: JoinStoreError) -> Self {
        JobError::Storage(err.to_string())
    }
}

impl From<SyncQueueError> for JobError {
    fn from(err: SyncQueueError) -> Self {
        JobError::Storage(err.to_string())
    }
}
