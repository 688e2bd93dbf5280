use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{error, info, warn};

use jobweave_core::JobId;

use crate::jobs::{JobStore, JournalType, NewJournalEntry};
use crate::join::JoinRecord;

/// Why a parked job is being resumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WakeupReason {
    /// The child finished and the join is satisfied.
    JoinCompleted,
    /// The join exceeded its timeout.
    TimedOut,
    /// A topic the join listens to was published; readiness must be re-checked.
    Event { topic: String },
}

/// A single resumption request.
///
/// Carries only the record(s) that triggered it; the resumed job logic
/// re-checks overall readiness itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub parent_job_id: JobId,
    pub handler_ref: String,
    pub dispatcher_ref: String,
    pub reason: WakeupReason,
    pub records: Vec<JoinRecord>,
}

impl Wakeup {
    /// Build a wakeup for an async join record.
    pub fn for_record(record: JoinRecord, reason: WakeupReason) -> Result<Self, WakeupError> {
        let (Some(handler_ref), Some(dispatcher_ref)) = (
            record.wakeup_handler_ref.clone(),
            record.wakeup_dispatcher_ref.clone(),
        ) else {
            return Err(WakeupError::MissingRefs {
                parent: record.parent_job_id,
                child: record.child_job_id,
            });
        };

        Ok(Self {
            parent_job_id: record.parent_job_id,
            handler_ref,
            dispatcher_ref,
            reason,
            records: vec![record],
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WakeupError {
    #[error("no wakeup dispatcher registered as {0:?}")]
    UnknownDispatcher(String),
    #[error("join of {parent} on {child} has no wakeup handler/dispatcher")]
    MissingRefs { parent: JobId, child: JobId },
    #[error("wakeup dispatch failed: {0}")]
    Failed(String),
    #[error("dispatcher registry poisoned")]
    Poisoned,
}

/// Re-enters parked job logic.
///
/// Implementations must be idempotent: the same wakeup may arrive twice.
pub trait WakeupDispatcher: Send + Sync {
    fn dispatch(&self, wakeup: &Wakeup) -> Result<(), WakeupError>;
}

impl<F> WakeupDispatcher for F
where
    F: Fn(&Wakeup) -> Result<(), WakeupError> + Send + Sync,
{
    fn dispatch(&self, wakeup: &Wakeup) -> Result<(), WakeupError> {
        self(wakeup)
    }
}

/// Resolves dispatcher refs to dispatchers.
#[derive(Default)]
pub struct DispatcherRegistry {
    dispatchers: RwLock<HashMap<String, Arc<dyn WakeupDispatcher>>>,
}

impl std::fmt::Debug for DispatcherRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .dispatchers
            .read()
            .map(|d| d.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("DispatcherRegistry").field("dispatchers", &names).finish()
    }
}

impl DispatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the dispatcher for `name`.
    pub fn register(
        &self,
        name: impl Into<String>,
        dispatcher: Arc<dyn WakeupDispatcher>,
    ) -> Result<(), WakeupError> {
        let mut dispatchers = self.dispatchers.write().map_err(|_| WakeupError::Poisoned)?;
        dispatchers.insert(name.into(), dispatcher);
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<bool, WakeupError> {
        let mut dispatchers = self.dispatchers.write().map_err(|_| WakeupError::Poisoned)?;
        Ok(dispatchers.remove(name).is_some())
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn WakeupDispatcher>, WakeupError> {
        let dispatchers = self.dispatchers.read().map_err(|_| WakeupError::Poisoned)?;
        dispatchers
            .get(name)
            .cloned()
            .ok_or_else(|| WakeupError::UnknownDispatcher(name.to_string()))
    }
}

/// Runs wakeups through the registry and contains their failures.
///
/// A failing (or panicking) dispatcher is recorded as a journal entry against
/// the parent job; it never propagates to the caller, so one job's failed
/// resumption cannot stall the others.
pub struct Resumer {
    registry: Arc<DispatcherRegistry>,
    jobs: Arc<dyn JobStore>,
}

impl Resumer {
    pub fn new(registry: Arc<DispatcherRegistry>, jobs: Arc<dyn JobStore>) -> Self {
        Self { registry, jobs }
    }

    pub fn registry(&self) -> &Arc<DispatcherRegistry> {
        &self.registry
    }

    /// Dispatch `wakeup`. Returns whether the dispatcher accepted it.
    pub fn resume(&self, wakeup: &Wakeup) -> bool {
        let outcome = self.registry.resolve(&wakeup.dispatcher_ref).and_then(|dispatcher| {
            catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(wakeup)))
                .unwrap_or_else(|_| Err(WakeupError::Failed("dispatcher panicked".to_string())))
        });

        match outcome {
            Ok(()) => {
                info!(
                    job_id = %wakeup.parent_job_id,
                    handler = %wakeup.handler_ref,
                    dispatcher = %wakeup.dispatcher_ref,
                    reason = ?wakeup.reason,
                    "parked job resumed"
                );
                true
            }
            Err(err) => {
                warn!(
                    job_id = %wakeup.parent_job_id,
                    dispatcher = %wakeup.dispatcher_ref,
                    error = %err,
                    "wakeup dispatch failed"
                );
                self.record_failure(wakeup, &err);
                false
            }
        }
    }

    fn record_failure(&self, wakeup: &Wakeup, err: &WakeupError) {
        let children: Vec<JobId> = wakeup.records.iter().map(|r| r.child_job_id).collect();
        let context = serde_json::json!({
            "handler": wakeup.handler_ref,
            "dispatcher": wakeup.dispatcher_ref,
            "reason": format!("{:?}", wakeup.reason),
            "children": children,
        });
        let entry = NewJournalEntry::new(JournalType::Failure, format!("wakeup failed: {err}"))
            .with_context(context.to_string());

        if let Err(journal_err) = self.jobs.append_journal(wakeup.parent_job_id, entry) {
            error!(
                job_id = %wakeup.parent_job_id,
                error = %journal_err,
                "failed to journal wakeup failure"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::jobs::{InMemoryJobStore, Job};
    use crate::join::AsyncJoin;

    fn wakeup_for(parent: JobId, dispatcher: &str) -> Wakeup {
        let record =
            JoinRecord::asynchronous(parent, JobId::new(), &AsyncJoin::new("resume", dispatcher));
        Wakeup::for_record(record, WakeupReason::JoinCompleted).unwrap()
    }

    #[test]
    fn sync_record_cannot_be_woken() {
        let record = JoinRecord::sync(JobId::new(), JobId::new());
        assert!(matches!(
            Wakeup::for_record(record, WakeupReason::TimedOut),
            Err(WakeupError::MissingRefs { .. })
        ));
    }

    #[test]
    fn resume_routes_to_registered_dispatcher() {
        let jobs = InMemoryJobStore::arc();
        let parent = jobs.create(Job::new("Parent")).unwrap();
        let registry = Arc::new(DispatcherRegistry::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        registry
            .register(
                "executor",
                Arc::new(move |w: &Wakeup| -> Result<(), WakeupError> {
                    sink.lock().unwrap().push(w.parent_job_id);
                    Ok(())
                }),
            )
            .unwrap();

        let resumer = Resumer::new(registry, jobs.clone());
        assert!(resumer.resume(&wakeup_for(parent, "executor")));
        assert_eq!(*seen.lock().unwrap(), vec![parent]);
        assert!(jobs.journal(parent).unwrap().is_empty());
    }

    #[test]
    fn failures_are_journaled_against_parent() {
        let jobs = InMemoryJobStore::arc();
        let parent = jobs.create(Job::new("Parent")).unwrap();
        let registry = Arc::new(DispatcherRegistry::new());
        registry
            .register(
                "broken",
                Arc::new(|_: &Wakeup| -> Result<(), WakeupError> {
                    Err(WakeupError::Failed("handler crashed".to_string()))
                }),
            )
            .unwrap();
        registry
            .register("panicky", Arc::new(|_: &Wakeup| -> Result<(), WakeupError> { panic!("boom") }))
            .unwrap();

        let resumer = Resumer::new(registry, jobs.clone());
        assert!(!resumer.resume(&wakeup_for(parent, "broken")));
        assert!(!resumer.resume(&wakeup_for(parent, "panicky")));
        assert!(!resumer.resume(&wakeup_for(parent, "missing")));

        let journal = jobs.journal(parent).unwrap();
        assert_eq!(journal.len(), 3);
        assert!(journal.iter().all(|e| e.journal_type == JournalType::Failure));
        assert!(journal[0].text.contains("handler crashed"));
        assert!(journal[1].text.contains("panicked"));
        assert!(journal[2].text.contains("missing"));
    }
}
