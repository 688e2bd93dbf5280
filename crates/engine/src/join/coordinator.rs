//! Join coordination: sync (parked thread) and async (persisted continuation).
//!
//! The two modes share the `JoinRecord` state machine but resolve differently:
//! - sync waiters block on a local condition variable and re-read the stores on
//!   every notification or liveness tick, so completions on other nodes are
//!   picked up too
//! - async joins never block; resolution hands a `Wakeup` to the `Resumer`

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use jobweave_bus::{BusMessage, MessageBus};
use jobweave_bus::topics::{TOPIC_JOIN_COMPLETED, TOPIC_JOIN_DISJOINED};
use jobweave_core::{JobId, ResultPayload};

use super::store::{JoinInsert, JoinStore};
use super::types::{AsyncJoin, JoinMode, JoinRecord, JoinResult, JoinState};
use crate::error::{JobError, JobResult};
use crate::jobs::{JobStatus, JobStore, JobStoreError, JournalType, NewJournalEntry};
use crate::wakeup::{Resumer, Wakeup, WakeupReason};

/// Result of re-checking one waiting async join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recheck {
    /// The child had finished; the join is now satisfied.
    Satisfied,
    /// The join hit its timeout and was resolved as timed out.
    TimedOut,
    /// Still waiting; the next poll was scheduled.
    Pending,
    /// Someone else resolved or removed the record first.
    Gone,
}

pub struct JoinCoordinator {
    jobs: Arc<dyn JobStore>,
    joins: Arc<dyn JoinStore>,
    bus: Arc<dyn MessageBus>,
    resumer: Arc<Resumer>,
    /// Bumped on every local state change sync waiters may care about
    generation: Mutex<u64>,
    unpark: Condvar,
    check_interval: Duration,
}

impl JoinCoordinator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        joins: Arc<dyn JoinStore>,
        bus: Arc<dyn MessageBus>,
        resumer: Arc<Resumer>,
        check_interval: Duration,
    ) -> Self {
        Self {
            jobs,
            joins,
            bus,
            resumer,
            generation: Mutex::new(0),
            unpark: Condvar::new(),
            check_interval,
        }
    }

    pub fn joins(&self) -> &Arc<dyn JoinStore> {
        &self.joins
    }

    /// Join records where `parent` waits.
    pub fn joins_of(&self, parent: JobId) -> JobResult<Vec<JoinRecord>> {
        Ok(self.joins.by_parent(parent)?)
    }

    /// Join records waiting on `child`.
    pub fn joiners_of(&self, child: JobId) -> JobResult<Vec<JoinRecord>> {
        Ok(self.joins.by_child(child)?)
    }

    /// Block until `child` resolves for `parent`.
    ///
    /// When the parent has several sync joins, the call returns only once all
    /// of them are resolved, then reports this child's outcome.
    pub fn join_sync(&self, parent: JobId, child: JobId) -> JobResult<JoinResult> {
        self.ensure_jobs_exist(parent, child)?;
        self.open(JoinRecord::sync(parent, child))?;
        info!(parent_job_id = %parent, child_job_id = %child, "sync join waiting");

        loop {
            let seen = self.current_generation()?;

            if let Some(result) = self.sync_wait_state(parent, child)? {
                match &result {
                    Ok(joined) => {
                        debug!(parent_job_id = %parent, child_job_id = %child, status = %joined.status, "sync join satisfied")
                    }
                    Err(err) => {
                        info!(parent_job_id = %parent, child_job_id = %child, error = %err, "sync join ended")
                    }
                }
                return result;
            }

            let guard = self.generation.lock().map_err(|_| poisoned())?;
            if *guard == seen {
                let _ = self
                    .unpark
                    .wait_timeout(guard, self.check_interval)
                    .map_err(|_| poisoned())?;
            }
        }
    }

    /// Park `parent` on `child` and return immediately.
    ///
    /// The caller must stop executing the parent's logic; it is re-entered
    /// through the wakeup dispatcher on completion, topic event, or timeout.
    pub fn join_async(&self, parent: JobId, child: JobId, wakeup: AsyncJoin) -> JobResult<JoinRecord> {
        self.ensure_jobs_exist(parent, child)?;
        let record = self.open(JoinRecord::asynchronous(parent, child, &wakeup))?;

        info!(
            parent_job_id = %parent,
            child_job_id = %child,
            dispatcher = %wakeup.wakeup_dispatcher,
            interval_ms = wakeup.wakeup_interval_ms,
            timeout_ms = wakeup.timeout_ms,
            "async join parked"
        );

        // A child that already finished satisfies the join right away.
        self.recheck_child(child)?;
        Ok(self.joins.get(parent, child)?.unwrap_or(record))
    }

    /// Sever a join. Removing a record that does not exist is a no-op.
    pub fn disjoin_job(&self, parent: JobId, child: JobId) -> JobResult<()> {
        let Some(removed) = self.joins.remove(parent, child)? else {
            return Ok(());
        };

        if removed.state.is_active() {
            info!(parent_job_id = %parent, child_job_id = %child, mode = ?removed.mode, "join disjoined while waiting");
            self.notify_local()?;
            self.publish(BusMessage::new(
                TOPIC_JOIN_DISJOINED,
                serde_json::json!({ "parent_job_id": parent, "child_job_id": child }),
            ));
        } else {
            debug!(parent_job_id = %parent, child_job_id = %child, state = ?removed.state, "resolved join removed");
        }
        Ok(())
    }

    /// Remove every join record of a finished parent. Returns the number removed.
    ///
    /// Resolved records are only kept for the parent to read its outcome; once
    /// the parent is terminal they are dropped, and active ones are disjoined.
    pub fn drop_parent_joins(&self, parent: JobId) -> JobResult<usize> {
        let records = self.joins.by_parent(parent)?;
        for record in &records {
            self.disjoin_job(parent, record.child_job_id)?;
        }
        Ok(records.len())
    }

    /// Satisfy every waiting join on `child` and resume the parents.
    ///
    /// Safe to call with no joiners and safe to repeat: records that are
    /// already resolved are left alone. Returns the number of joins satisfied.
    pub fn complete_join(
        &self,
        child: JobId,
        join_status: JobStatus,
        join_result: Option<ResultPayload>,
    ) -> JobResult<usize> {
        if !join_status.is_terminal() {
            return Err(JobError::invalid_state(format!(
                "join of {child} cannot complete with non-terminal status {join_status}"
            )));
        }

        let now = Utc::now();
        let mut satisfied_sync = 0;
        let mut satisfied_async = Vec::new();

        for record in self.joins.by_child(child)? {
            if !record.state.is_active() {
                continue;
            }
            let updated = self.joins.transition(
                record.parent_job_id,
                child,
                record.state,
                &mut |r| {
                    r.state = JoinState::Satisfied;
                    r.join_status = Some(join_status);
                    r.join_result = join_result.clone();
                    r.resolved_at = Some(now);
                },
            )?;

            let Some(updated) = updated else {
                continue;
            };
            info!(
                parent_job_id = %updated.parent_job_id,
                child_job_id = %child,
                status = %join_status,
                mode = ?updated.mode,
                "join satisfied"
            );
            match updated.mode {
                JoinMode::Sync => satisfied_sync += 1,
                JoinMode::Async => satisfied_async.push(updated),
            }
        }

        let total = satisfied_sync + satisfied_async.len();
        if satisfied_sync > 0 {
            self.notify_local()?;
        }
        for record in satisfied_async {
            self.resume(record, WakeupReason::JoinCompleted);
        }
        if total > 0 {
            self.publish(BusMessage::new(
                TOPIC_JOIN_COMPLETED,
                serde_json::json!({ "child_job_id": child, "status": join_status }),
            ));
        }
        Ok(total)
    }

    /// Re-evaluate one waiting async join at `now`.
    ///
    /// A finished child satisfies the join (and wins over an elapsed timeout);
    /// otherwise an elapsed timeout resolves it as timed out, and anything else
    /// just schedules the next poll.
    pub fn recheck_async(&self, record: &JoinRecord, now: DateTime<Utc>) -> JobResult<Recheck> {
        let (parent, child) = record.key();

        match self.jobs.get(child) {
            Ok(job) if job.is_terminal() => {
                let satisfied = self.complete_join(child, job.status, job.result_payload)?;
                return Ok(if satisfied > 0 { Recheck::Satisfied } else { Recheck::Gone });
            }
            Ok(_) => {}
            Err(JobStoreError::NotFound(_)) => {
                warn!(parent_job_id = %parent, child_job_id = %child, "joined child job no longer exists");
            }
            Err(err) => return Err(err.into()),
        }

        if record.is_timed_out(now) {
            return self.expire(parent, child, now);
        }

        let touched = self.joins.transition(parent, child, JoinState::Waiting, &mut |r| {
            r.last_checked_at = Some(now);
            r.next_check_at = r.next_check_after(now);
        })?;
        Ok(if touched.is_some() { Recheck::Pending } else { Recheck::Gone })
    }

    /// Resolve a waiting async join as timed out and resume its parent once.
    fn expire(&self, parent: JobId, child: JobId, now: DateTime<Utc>) -> JobResult<Recheck> {
        let expired = self.joins.transition(parent, child, JoinState::Waiting, &mut |r| {
            r.state = JoinState::TimedOut;
            r.resolved_at = Some(now);
            r.last_checked_at = Some(now);
            r.next_check_at = None;
        })?;

        match expired {
            Some(record) => {
                info!(parent_job_id = %parent, child_job_id = %child, timeout_ms = record.timeout_ms, "async join timed out");
                self.resume(record, WakeupReason::TimedOut);
                Ok(Recheck::TimedOut)
            }
            None => Ok(Recheck::Gone),
        }
    }

    /// Resume the parent of a still-waiting async join because `topic` fired.
    ///
    /// The record stays waiting; the resumed logic re-checks readiness.
    pub fn wake_on_event(&self, record: &JoinRecord, topic: &str) -> JobResult<Recheck> {
        match self.recheck_async(record, Utc::now())? {
            Recheck::Pending => {
                self.resume(
                    record.clone(),
                    WakeupReason::Event {
                        topic: topic.to_string(),
                    },
                );
                Ok(Recheck::Pending)
            }
            other => Ok(other),
        }
    }

    /// Log and journal a join that could not be processed, against its parent.
    pub fn report_failure(&self, record: &JoinRecord, err: &JobError) {
        let (parent, child) = record.key();
        warn!(parent_job_id = %parent, child_job_id = %child, error = %err, "join check failed");

        let entry = NewJournalEntry::new(
            JournalType::Failure,
            format!("join on job {child} could not be checked: {err}"),
        );
        if let Err(journal_err) = self.jobs.append_journal(parent, entry) {
            warn!(parent_job_id = %parent, error = %journal_err, "failed to journal join failure");
        }
    }

    /// Wake local sync waiters so they re-read the stores.
    pub fn notify_local(&self) -> JobResult<()> {
        let mut generation = self.generation.lock().map_err(|_| poisoned())?;
        *generation = generation.wrapping_add(1);
        self.unpark.notify_all();
        Ok(())
    }

    fn current_generation(&self) -> JobResult<u64> {
        Ok(*self.generation.lock().map_err(|_| poisoned())?)
    }

    fn ensure_jobs_exist(&self, parent: JobId, child: JobId) -> JobResult<()> {
        self.jobs.get(parent)?;
        self.jobs.get(child)?;
        Ok(())
    }

    /// Store a record and move it to `Waiting`; an active record for the pair is reused.
    fn open(&self, record: JoinRecord) -> JobResult<JoinRecord> {
        let (parent, child) = record.key();
        let now = Utc::now();

        let created = match self.joins.insert(record)? {
            JoinInsert::Existing(existing) => {
                debug!(parent_job_id = %parent, child_job_id = %child, state = ?existing.state, "reusing active join");
                existing
            }
            JoinInsert::Created(created) => created,
        };

        if created.state == JoinState::Created {
            let waiting = self.joins.transition(parent, child, JoinState::Created, &mut |r| {
                r.state = JoinState::Waiting;
                r.next_check_at = r.next_check_after(now);
            })?;
            return Ok(waiting.unwrap_or(created));
        }
        Ok(created)
    }

    /// Satisfy joins on `child` if it already finished.
    fn recheck_child(&self, child: JobId) -> JobResult<bool> {
        let job = self.jobs.get(child)?;
        if job.is_terminal() {
            self.complete_join(child, job.status, job.result_payload)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Decide whether a sync waiter can return. `None` means keep waiting.
    fn sync_wait_state(&self, parent: JobId, child: JobId) -> JobResult<Option<JobResult<JoinResult>>> {
        let parent_job = self.jobs.get(parent)?;
        if parent_job.is_terminal() {
            // Nobody waits on this record any more; do not leave it active.
            if let Some(removed) = self.joins.remove(parent, child)? {
                debug!(parent_job_id = %parent, child_job_id = %child, state = ?removed.state, "join of finished parent removed");
            }
            return Ok(Some(Err(JobError::invalid_state(format!(
                "parent job {parent} became {} while joined on {child}",
                parent_job.status
            )))));
        }

        let mut records: Vec<JoinRecord> = self
            .joins
            .by_parent(parent)?
            .into_iter()
            .filter(|r| r.mode == JoinMode::Sync)
            .collect();

        // Readiness re-check covers completions whose notification we missed.
        let mut changed = false;
        for record in records.iter().filter(|r| r.state.is_active()) {
            changed |= self.recheck_child(record.child_job_id)?;
        }
        if changed {
            records = self
                .joins
                .by_parent(parent)?
                .into_iter()
                .filter(|r| r.mode == JoinMode::Sync)
                .collect();
        }

        if records.iter().any(|r| r.state.is_active()) {
            return Ok(None);
        }

        let outcome = records
            .iter()
            .find(|r| r.child_job_id == child)
            .and_then(JoinRecord::outcome)
            .unwrap_or(Err(JobError::Disjoined { parent, child }));
        Ok(Some(outcome))
    }

    fn resume(&self, record: JoinRecord, reason: WakeupReason) {
        match Wakeup::for_record(record, reason) {
            Ok(wakeup) => {
                self.resumer.resume(&wakeup);
            }
            Err(err) => warn!(error = %err, "cannot build wakeup for join"),
        }
    }

    fn publish(&self, message: BusMessage) {
        if let Err(err) = self.bus.publish(message) {
            warn!(error = ?err, "failed to publish join notification");
        }
    }
}

fn poisoned() -> JobError {
    JobError::Storage("join coordinator state poisoned".to_string())
}
