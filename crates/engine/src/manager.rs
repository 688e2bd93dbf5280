//! `AsyncJobManager`: the public job facade.
//!
//! Composes the job store, sync queue, join coordinator, pseudo-job registry
//! and wakeup scheduler. Terminal status updates cascade in a fixed order:
//! store update, sync-queue release, join completion, bus announcement.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use jobweave_bus::topics::{job_topic, TOPIC_JOB_STATE};
use jobweave_bus::{BusMessage, InMemoryMessageBus, MessageBus};
use jobweave_core::{AccountId, ExecutionContextId, JobId, ResultPayload};

use crate::config::EngineConfig;
use crate::error::{JobError, JobResult};
use crate::jobs::{
    InMemoryJobStore, Job, JobStatus, JobStore, JobStoreError, JournalEntry, NewJournalEntry, StatusUpdate,
    RESULT_CODE_INTERNAL_ERROR,
};
use crate::join::{AsyncJoin, InMemoryJoinStore, JoinCoordinator, JoinRecord, JoinResult, JoinStore};
use crate::pseudo::PseudoJobRegistry;
use crate::sync_queue::{Admission, InMemorySyncQueueStore, SyncObjectKey, SyncQueue, SyncQueueStore};
use crate::wakeup::{DispatcherRegistry, Resumer, WakeupScheduler};

const RESTART_INTERRUPTED: &str = "job interrupted by management server restart";

/// Query command: fetch a job's current or final state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAsyncJobResult {
    pub job_id: JobId,
}

impl QueryAsyncJobResult {
    pub fn new(job_id: JobId) -> Self {
        Self { job_id }
    }
}

/// A job shaped for client consumption.
///
/// Failed jobs are reported here, not raised: `result_code` and `result`
/// carry the error detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncJobResponse {
    pub job_id: JobId,
    pub cmd: String,
    pub account_id: Option<AccountId>,
    pub status: JobStatus,
    pub process_status: i32,
    pub result_code: i32,
    pub result: Option<ResultPayload>,
    pub instance_type: Option<String>,
    pub instance_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl From<Job> for AsyncJobResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            cmd: job.cmd,
            account_id: job.account_id,
            status: job.status,
            process_status: job.process_status,
            result_code: job.result_code,
            result: job.result_payload,
            instance_type: job.related_instance_type,
            instance_id: job.related_instance_id,
            created_at: job.created_at,
            last_updated_at: job.last_updated_at,
        }
    }
}

/// What the node start sweep cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartupReport {
    pub pseudo_jobs_expunged: usize,
    /// Jobs this node left `InProgress`, now failed
    pub jobs_interrupted: usize,
    /// Gated jobs whose missing sync-queue claim was re-enqueued
    pub sync_claims_restored: usize,
}

pub struct AsyncJobManager {
    config: EngineConfig,
    jobs: Arc<dyn JobStore>,
    bus: Arc<dyn MessageBus>,
    sync_queue: Arc<SyncQueue>,
    joins: Arc<JoinCoordinator>,
    pseudo: PseudoJobRegistry,
    dispatchers: Arc<DispatcherRegistry>,
    scheduler: Arc<WakeupScheduler>,
}

impl AsyncJobManager {
    pub fn new(
        config: EngineConfig,
        jobs: Arc<dyn JobStore>,
        joins: Arc<dyn JoinStore>,
        sync: Arc<dyn SyncQueueStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let dispatchers = Arc::new(DispatcherRegistry::new());
        let resumer = Arc::new(Resumer::new(dispatchers.clone(), jobs.clone()));
        let coordinator = Arc::new(JoinCoordinator::new(
            jobs.clone(),
            joins,
            bus.clone(),
            resumer,
            config.sync_join_check_interval,
        ));
        let scheduler = Arc::new(WakeupScheduler::new(
            coordinator.clone(),
            bus.clone(),
            config.sweep_interval,
        ));

        Self {
            sync_queue: Arc::new(
                SyncQueue::new(sync)
                    .with_bus(bus.clone())
                    .with_check_interval(config.sync_join_check_interval),
            ),
            pseudo: PseudoJobRegistry::new(jobs.clone(), config.node_id),
            joins: coordinator,
            config,
            jobs,
            bus,
            dispatchers,
            scheduler,
        }
    }

    /// Manager over fresh in-memory stores and bus.
    pub fn in_memory(config: EngineConfig) -> Self {
        Self::new(
            config,
            InMemoryJobStore::arc(),
            InMemoryJoinStore::arc(),
            InMemorySyncQueueStore::arc(),
            Arc::new(InMemoryMessageBus::new()),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.bus
    }

    pub fn sync_queue(&self) -> &Arc<SyncQueue> {
        &self.sync_queue
    }

    pub fn join_coordinator(&self) -> &Arc<JoinCoordinator> {
        &self.joins
    }

    /// Registry the executor (or any other dispatcher) registers with.
    pub fn dispatchers(&self) -> &Arc<DispatcherRegistry> {
        &self.dispatchers
    }

    pub fn wakeup_scheduler(&self) -> Arc<WakeupScheduler> {
        self.scheduler.clone()
    }

    /// Persist a new job as `Queued`.
    pub fn submit_async_job(&self, job: Job) -> JobResult<JobId> {
        let job = self.prepare(job)?;
        let job_id = self.jobs.create(job)?;
        info!(job_id = %job_id, node_id = self.config.node_id, "job submitted");
        Ok(job_id)
    }

    /// Persist a new job gated by `key`. At most `limit` jobs per key run at
    /// once; a limit of 0 or less leaves the key ungated.
    pub fn submit_async_job_with_sync(
        &self,
        job: Job,
        key: SyncObjectKey,
        limit: i64,
    ) -> JobResult<(JobId, Admission)> {
        let mut job = self.prepare(job)?;
        job.sync_source_key = Some(key.clone());
        job.sync_queue_limit = limit;
        let job_id = self.jobs.create(job)?;
        let admission = self.sync_queue.enqueue(job_id, key.clone(), limit)?;

        info!(job_id = %job_id, sync_key = %key, admission = ?admission, "job submitted");
        Ok((job_id, admission))
    }

    fn prepare(&self, mut job: Job) -> JobResult<Job> {
        if job.status != JobStatus::Queued {
            return Err(JobError::invalid_state(format!(
                "job {} must be submitted as queued, not {}",
                job.id, job.status
            )));
        }
        job.init_node = Some(self.config.node_id);
        Ok(job)
    }

    /// Gate an existing, unfinished job by `key`.
    pub fn sync_async_job_execution(
        &self,
        job_id: JobId,
        key: SyncObjectKey,
        limit: i64,
    ) -> JobResult<Admission> {
        let job = self.jobs.get(job_id)?;
        if job.is_terminal() {
            return Err(JobError::invalid_state(format!(
                "job {job_id} is already {}",
                job.status
            )));
        }
        self.jobs.update_sync_source(job_id, Some(key.clone()), limit)?;
        Ok(self.sync_queue.enqueue(job_id, key, limit)?)
    }

    /// Give up a job's sync-queue claim. Returns the jobs promoted in its place.
    pub fn release_sync_source(&self, job_id: JobId) -> JobResult<Vec<JobId>> {
        let promoted = self.sync_queue.release(job_id)?;

        // An unfinished job without a claim must not stay gated on it.
        match self.jobs.get(job_id) {
            Ok(job) if !job.is_terminal() && job.sync_source_key.is_some() => {
                self.jobs.update_sync_source(job_id, None, 0)?;
            }
            Ok(_) | Err(JobStoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        Ok(promoted)
    }

    /// Finalize a job and cascade: release its sync slot, satisfy its joiners,
    /// announce the new state.
    ///
    /// Repeating the same completion is harmless: the store reports
    /// `Unchanged` and the cascade finds nothing left to do.
    pub fn complete_async_job(
        &self,
        job_id: JobId,
        status: JobStatus,
        result_code: i32,
        result: Option<ResultPayload>,
    ) -> JobResult<StatusUpdate> {
        if !status.is_terminal() {
            return Err(JobError::invalid_state(format!(
                "cannot complete job {job_id} with non-terminal status {status}"
            )));
        }

        let update = self.jobs.update_status(job_id, status, result_code, result.clone())?;

        self.release_sync_source(job_id)?;
        let satisfied = self.joins.complete_join(job_id, status, result)?;
        // A finished parent no longer reads its join records.
        self.joins.drop_parent_joins(job_id)?;

        if update.is_applied() {
            info!(job_id = %job_id, status = %status, result_code, joiners = satisfied, "job completed");
            self.announce(job_id, status);
        } else {
            debug!(job_id = %job_id, status = %status, "duplicate job completion ignored");
        }
        Ok(update)
    }

    /// Advance a running job's progress marker and interim result.
    pub fn update_async_job_status(
        &self,
        job_id: JobId,
        process_status: i32,
        result: Option<ResultPayload>,
    ) -> JobResult<Job> {
        let job = self.jobs.update_progress(job_id, process_status, result)?;
        debug!(job_id = %job_id, process_status, "job progress updated");
        Ok(job)
    }

    /// Record the instance a job is acting on.
    pub fn update_async_job_attachment(
        &self,
        job_id: JobId,
        instance_type: &str,
        instance_id: &str,
    ) -> JobResult<Job> {
        Ok(self.jobs.update_attachment(job_id, instance_type, instance_id)?)
    }

    pub fn log_job_journal(&self, job_id: JobId, entry: NewJournalEntry) -> JobResult<JournalEntry> {
        Ok(self.jobs.append_journal(job_id, entry)?)
    }

    pub fn journal(&self, job_id: JobId) -> JobResult<Vec<JournalEntry>> {
        Ok(self.jobs.journal(job_id)?)
    }

    pub fn get_async_job(&self, job_id: JobId) -> JobResult<Job> {
        Ok(self.jobs.get(job_id)?)
    }

    pub fn query_async_job_result(&self, query: &QueryAsyncJobResult) -> JobResult<AsyncJobResponse> {
        Ok(self.jobs.get(query.job_id)?.into())
    }

    /// Unfinished jobs against an instance type, optionally for one account.
    pub fn find_instance_pending_async_jobs(
        &self,
        instance_type: &str,
        account_id: Option<AccountId>,
    ) -> JobResult<Vec<Job>> {
        Ok(self.jobs.find_pending(instance_type, account_id)?)
    }

    /// Queued jobs allowed to start: ungated, or holding an active sync slot.
    ///
    /// Pseudo jobs stand in for an execution context and are never runnable.
    pub fn runnable_jobs(&self, limit: usize) -> JobResult<Vec<Job>> {
        let queued = self.jobs.list_by_status(JobStatus::Queued, usize::MAX)?;
        let mut runnable = Vec::new();
        for job in queued {
            if runnable.len() >= limit {
                break;
            }
            if job.is_pseudo() {
                continue;
            }
            let admitted = match job.sync_source_key {
                Some(_) => self.sync_queue.is_active(job.id)?,
                None => true,
            };
            if admitted {
                runnable.push(job);
            }
        }
        Ok(runnable)
    }

    /// Claim the oldest runnable job for this node, if any.
    pub fn claim_job(&self) -> JobResult<Option<Job>> {
        for candidate in self.runnable_jobs(16)? {
            let update = self.jobs.mark_in_progress(candidate.id, self.config.node_id)?;
            if update.is_applied() {
                debug!(job_id = %candidate.id, node_id = self.config.node_id, "job claimed");
                return Ok(Some(update.into_job()));
            }
        }
        Ok(None)
    }

    pub fn join_sync(&self, parent: JobId, child: JobId) -> JobResult<JoinResult> {
        self.joins.join_sync(parent, child)
    }

    pub fn join_async(&self, parent: JobId, child: JobId, wakeup: AsyncJoin) -> JobResult<JoinRecord> {
        self.joins.join_async(parent, child, wakeup)
    }

    pub fn disjoin_job(&self, parent: JobId, child: JobId) -> JobResult<()> {
        self.joins.disjoin_job(parent, child)
    }

    pub fn complete_join(
        &self,
        child: JobId,
        join_status: JobStatus,
        join_result: Option<ResultPayload>,
    ) -> JobResult<usize> {
        self.joins.complete_join(child, join_status, join_result)
    }

    /// Block until `predicate` holds, re-checking on `topics` and every `check_interval`.
    #[deprecated(note = "park the job with `join_sync` or `join_async` instead")]
    #[allow(deprecated)]
    pub fn wait_and_check<F>(
        &self,
        topics: &[&str],
        check_interval: Duration,
        timeout: Duration,
        predicate: F,
    ) -> bool
    where
        F: FnMut() -> bool,
    {
        crate::compat::wait_and_check(&*self.bus, topics, check_interval, timeout, predicate)
    }

    pub fn get_pseudo_job(&self, context: &ExecutionContextId) -> JobResult<Job> {
        self.pseudo.get_or_create(context)
    }

    pub fn release_pseudo_job(&self, context: &ExecutionContextId) -> JobResult<bool> {
        self.pseudo.release(context)
    }

    /// Management-node start sweep.
    ///
    /// Expunges every pseudo job and fails the jobs this node left running,
    /// which releases their sync slots and resolves their joiners. Gated jobs
    /// that lost their sync-queue claim are then re-enqueued.
    pub fn on_startup(&self) -> JobResult<StartupReport> {
        let pseudo_jobs_expunged = self.pseudo.expunge_all()?;

        let interrupted = self.jobs.jobs_executing_on(self.config.node_id)?;
        let result = ResultPayload::from_json(&serde_json::json!({ "error": RESTART_INTERRUPTED }))?;
        let mut jobs_interrupted = 0;
        for job in interrupted {
            if job.status != JobStatus::InProgress {
                continue;
            }
            match self.complete_async_job(
                job.id,
                JobStatus::Failed,
                RESULT_CODE_INTERNAL_ERROR,
                Some(result.clone()),
            ) {
                Ok(_) => jobs_interrupted += 1,
                Err(err) => warn!(job_id = %job.id, error = %err, "failed to fail interrupted job"),
            }
        }

        let sync_claims_restored = self.restore_sync_claims()?;

        info!(
            node_id = self.config.node_id,
            pseudo_jobs_expunged,
            jobs_interrupted,
            sync_claims_restored,
            "startup sweep complete"
        );
        Ok(StartupReport {
            pseudo_jobs_expunged,
            jobs_interrupted,
            sync_claims_restored,
        })
    }

    /// Re-enqueue unfinished gated jobs that hold no claim, running jobs first
    /// and then queued jobs oldest first. Jobs that still hold a claim are left alone.
    fn restore_sync_claims(&self) -> JobResult<usize> {
        let mut restored = 0;
        for status in [JobStatus::InProgress, JobStatus::Queued] {
            for job in self.jobs.list_by_status(status, usize::MAX)? {
                let Some(key) = job.sync_source_key.clone() else {
                    continue;
                };
                if self.sync_queue.admission(job.id)?.is_some() {
                    continue;
                }
                let admission = self.sync_queue.enqueue(job.id, key.clone(), job.sync_queue_limit)?;
                debug!(job_id = %job.id, sync_key = %key, admission = ?admission, "sync queue claim restored");
                restored += 1;
            }
        }
        Ok(restored)
    }

    fn announce(&self, job_id: JobId, status: JobStatus) {
        let payload = serde_json::json!({ "job_id": job_id, "status": status });
        for topic in [TOPIC_JOB_STATE.to_string(), job_topic(job_id)] {
            if let Err(err) = self.bus.publish(BusMessage::new(topic, payload.clone())) {
                warn!(job_id = %job_id, error = ?err, "failed to publish job state");
            }
        }
    }
}
