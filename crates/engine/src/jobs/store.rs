//! Job storage implementations.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::Utc;

use jobweave_core::{AccountId, JobId, ResultPayload};

use super::types::{Job, JobStatus, JournalEntry, NewJournalEntry};
use crate::sync_queue::SyncObjectKey;

/// Outcome of a status update.
///
/// Re-applying an update the job already reflects is not an error; it comes back
/// as `Unchanged` so retries and duplicate deliveries stay harmless.
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Applied(Job),
    Unchanged(Job),
}

impl StatusUpdate {
    pub fn is_applied(&self) -> bool {
        matches!(self, StatusUpdate::Applied(_))
    }

    pub fn job(&self) -> &Job {
        match self {
            StatusUpdate::Applied(job) | StatusUpdate::Unchanged(job) => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            StatusUpdate::Applied(job) | StatusUpdate::Unchanged(job) => job,
        }
    }
}

/// Job store abstraction.
///
/// Every method is atomic at the single-record level; the store is the single
/// source of truth for job state across all management nodes.
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn create(&self, job: Job) -> Result<JobId, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// Move a job to `status` and record its result.
    ///
    /// Transitions only move forward. Applying the update a job already
    /// reflects returns `Unchanged`; any other change to a terminal job is
    /// rejected with `InvalidState`.
    fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<StatusUpdate, JobStoreError>;

    /// Claim a queued job for execution on `node_id` (`Queued → InProgress`).
    ///
    /// Only one caller ever sees `Applied` for a given job.
    fn mark_in_progress(&self, job_id: JobId, node_id: u64) -> Result<StatusUpdate, JobStoreError>;

    /// Advance the progress marker of a non-terminal job.
    fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<Job, JobStoreError>;

    /// Record the instance a job is working on.
    fn update_attachment(
        &self,
        job_id: JobId,
        instance_type: &str,
        instance_id: &str,
    ) -> Result<Job, JobStoreError>;

    /// Record (or clear) the resource key gating a job and its slot limit.
    fn update_sync_source(
        &self,
        job_id: JobId,
        key: Option<SyncObjectKey>,
        queue_size_limit: i64,
    ) -> Result<Job, JobStoreError>;

    /// Append to a job's journal, assigning the next sequence number.
    fn append_journal(
        &self,
        job_id: JobId,
        entry: NewJournalEntry,
    ) -> Result<JournalEntry, JobStoreError>;

    /// A job's journal in sequence order.
    fn journal(&self, job_id: JobId) -> Result<Vec<JournalEntry>, JobStoreError>;

    /// Non-terminal jobs against an instance type, optionally scoped to an account.
    fn find_pending(
        &self,
        instance_type: &str,
        account_id: Option<AccountId>,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Jobs in `status`, oldest first.
    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Non-terminal jobs claimed by `node_id`.
    fn jobs_executing_on(&self, node_id: u64) -> Result<Vec<Job>, JobStoreError>;

    /// Remove a job and its journal. Returns whether it existed.
    fn expunge(&self, job_id: JobId) -> Result<bool, JobStoreError>;

    /// Remove every job of an instance type. Returns the number removed.
    fn expunge_by_instance_type(&self, instance_type: &str) -> Result<usize, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id}: {reason}")]
    InvalidState { job_id: JobId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    fn invalid(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            job_id,
            reason: reason.into(),
        }
    }

    fn poisoned() -> Self {
        Self::Storage("job store lock poisoned".to_string())
    }
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        (**self).create(job)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).get(job_id)
    }

    fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<StatusUpdate, JobStoreError> {
        (**self).update_status(job_id, status, result_code, result_payload)
    }

    fn mark_in_progress(&self, job_id: JobId, node_id: u64) -> Result<StatusUpdate, JobStoreError> {
        (**self).mark_in_progress(job_id, node_id)
    }

    fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<Job, JobStoreError> {
        (**self).update_progress(job_id, process_status, result_payload)
    }

    fn update_attachment(
        &self,
        job_id: JobId,
        instance_type: &str,
        instance_id: &str,
    ) -> Result<Job, JobStoreError> {
        (**self).update_attachment(job_id, instance_type, instance_id)
    }

    fn update_sync_source(
        &self,
        job_id: JobId,
        key: Option<SyncObjectKey>,
        queue_size_limit: i64,
    ) -> Result<Job, JobStoreError> {
        (**self).update_sync_source(job_id, key, queue_size_limit)
    }

    fn append_journal(
        &self,
        job_id: JobId,
        entry: NewJournalEntry,
    ) -> Result<JournalEntry, JobStoreError> {
        (**self).append_journal(job_id, entry)
    }

    fn journal(&self, job_id: JobId) -> Result<Vec<JournalEntry>, JobStoreError> {
        (**self).journal(job_id)
    }

    fn find_pending(
        &self,
        instance_type: &str,
        account_id: Option<AccountId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_pending(instance_type, account_id)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_status(status, limit)
    }

    fn jobs_executing_on(&self, node_id: u64) -> Result<Vec<Job>, JobStoreError> {
        (**self).jobs_executing_on(node_id)
    }

    fn expunge(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        (**self).expunge(job_id)
    }

    fn expunge_by_instance_type(&self, instance_type: &str) -> Result<usize, JobStoreError> {
        (**self).expunge_by_instance_type(instance_type)
    }
}

/// In-memory job store for tests/dev and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    journals: RwLock<HashMap<JobId, Vec<JournalEntry>>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read_jobs(&self) -> Result<RwLockReadGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.read().map_err(|_| JobStoreError::poisoned())
    }

    fn write_jobs(&self) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Job>>, JobStoreError> {
        self.jobs.write().map_err(|_| JobStoreError::poisoned())
    }

    fn write_journals(
        &self,
    ) -> Result<RwLockWriteGuard<'_, HashMap<JobId, Vec<JournalEntry>>>, JobStoreError> {
        self.journals.write().map_err(|_| JobStoreError::poisoned())
    }

    /// Apply `f` to a job under the write lock.
    fn modify<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut Job) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        f(job)
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, job: Job) -> Result<JobId, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    fn get(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.read_jobs()?
            .get(&job_id)
            .cloned()
            .ok_or(JobStoreError::NotFound(job_id))
    }

    fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<StatusUpdate, JobStoreError> {
        self.modify(job_id, |job| {
            if job.status == status {
                if !status.is_terminal()
                    || (job.result_code == result_code && job.result_payload == result_payload)
                {
                    return Ok(StatusUpdate::Unchanged(job.clone()));
                }
                return Err(JobStoreError::invalid(
                    job_id,
                    format!("already {status} with a different result"),
                ));
            }

            if job.status.is_terminal() {
                return Err(JobStoreError::invalid(
                    job_id,
                    format!("already {}; cannot move to {status}", job.status),
                ));
            }

            if !job.status.can_transition_to(status) {
                return Err(JobStoreError::invalid(
                    job_id,
                    format!("cannot move from {} to {status}", job.status),
                ));
            }

            job.status = status;
            if status.is_terminal() {
                job.result_code = result_code;
                job.result_payload = result_payload;
            }
            job.last_updated_at = Utc::now();
            Ok(StatusUpdate::Applied(job.clone()))
        })
    }

    fn mark_in_progress(&self, job_id: JobId, node_id: u64) -> Result<StatusUpdate, JobStoreError> {
        self.modify(job_id, |job| match job.status {
            JobStatus::Queued => {
                job.status = JobStatus::InProgress;
                job.executing_node = Some(node_id);
                job.last_updated_at = Utc::now();
                Ok(StatusUpdate::Applied(job.clone()))
            }
            _ => Ok(StatusUpdate::Unchanged(job.clone())),
        })
    }

    fn update_progress(
        &self,
        job_id: JobId,
        process_status: i32,
        result_payload: Option<ResultPayload>,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            if job.status.is_terminal() {
                return Err(JobStoreError::invalid(
                    job_id,
                    format!("already {}; progress is frozen", job.status),
                ));
            }
            if process_status < job.process_status {
                return Err(JobStoreError::invalid(
                    job_id,
                    format!(
                        "process status cannot move back from {} to {process_status}",
                        job.process_status
                    ),
                ));
            }

            job.process_status = process_status;
            if result_payload.is_some() {
                job.result_payload = result_payload;
            }
            job.last_updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    fn update_attachment(
        &self,
        job_id: JobId,
        instance_type: &str,
        instance_id: &str,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            job.related_instance_type = Some(instance_type.to_string());
            job.related_instance_id = Some(instance_id.to_string());
            job.last_updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    fn update_sync_source(
        &self,
        job_id: JobId,
        key: Option<SyncObjectKey>,
        queue_size_limit: i64,
    ) -> Result<Job, JobStoreError> {
        self.modify(job_id, |job| {
            job.sync_source_key = key;
            job.sync_queue_limit = queue_size_limit;
            job.last_updated_at = Utc::now();
            Ok(job.clone())
        })
    }

    fn append_journal(
        &self,
        job_id: JobId,
        entry: NewJournalEntry,
    ) -> Result<JournalEntry, JobStoreError> {
        // Jobs lock first, then journals; expunge takes them in the same order.
        let jobs = self.read_jobs()?;
        if !jobs.contains_key(&job_id) {
            return Err(JobStoreError::NotFound(job_id));
        }

        let mut journals = self.write_journals()?;
        let entries = journals.entry(job_id).or_default();
        let record = JournalEntry {
            job_id,
            journal_type: entry.journal_type,
            text: entry.text,
            context_json: entry.context_json,
            sequence_no: entries.len() as u64 + 1,
            timestamp: Utc::now(),
        };
        entries.push(record.clone());
        Ok(record)
    }

    fn journal(&self, job_id: JobId) -> Result<Vec<JournalEntry>, JobStoreError> {
        let journals = self.journals.read().map_err(|_| JobStoreError::poisoned())?;
        Ok(journals.get(&job_id).cloned().unwrap_or_default())
    }

    fn find_pending(
        &self,
        instance_type: &str,
        account_id: Option<AccountId>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read_jobs()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.is_pending_for(instance_type, account_id))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn list_by_status(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read_jobs()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    fn jobs_executing_on(&self, node_id: u64) -> Result<Vec<Job>, JobStoreError> {
        let jobs = self.read_jobs()?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| !j.is_terminal() && j.executing_node == Some(node_id))
            .cloned()
            .collect();

        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    fn expunge(&self, job_id: JobId) -> Result<bool, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        let mut journals = self.write_journals()?;
        journals.remove(&job_id);
        Ok(jobs.remove(&job_id).is_some())
    }

    fn expunge_by_instance_type(&self, instance_type: &str) -> Result<usize, JobStoreError> {
        let mut jobs = self.write_jobs()?;
        let mut journals = self.write_journals()?;

        let doomed: Vec<JobId> = jobs
            .values()
            .filter(|j| j.instance_type.as_deref() == Some(instance_type))
            .map(|j| j.id)
            .collect();

        for id in &doomed {
            jobs.remove(id);
            journals.remove(id);
        }
        Ok(doomed.len())
    }
}
