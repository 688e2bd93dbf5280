//! Per-resource admission control.
//!
//! Jobs that touch the same logical resource (one VM, one network) claim a slot
//! on that resource's key before they run. At most `queue_size_limit` claims per
//! key are active at once; the rest wait and are promoted strictly in enqueue
//! order as slots free up. A limit of zero or less means "no gating".
//!
//! Claims are kept in a `SyncQueueStore` shared by every node, so the limit
//! holds cluster-wide.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use jobweave_bus::{BusMessage, MessageBus, topics::TOPIC_SYNC_QUEUE_GRANTED};
use jobweave_core::JobId;

/// Logical resource name used to serialize jobs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SyncObjectKey(String);

impl SyncObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key for an object of a given type, e.g. `("VirtualMachine", 7)` → `"VirtualMachine-7"`.
    pub fn for_object(obj_type: &str, obj_id: impl std::fmt::Display) -> Self {
        Self(format!("{obj_type}-{obj_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SyncObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SyncObjectKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One job's claim on a resource key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub sync_object_key: SyncObjectKey,
    pub job_id: JobId,
    pub queue_size_limit: i64,
    pub enqueued_at: DateTime<Utc>,
    /// Holding one of the key's active slots
    pub active: bool,
    pub granted_at: Option<DateTime<Utc>>,
}

/// Gate outcome for an enqueued job.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The job holds an active slot and may run.
    Granted,
    /// The job waits; `position` is 1 for the next job to be promoted.
    Waiting { position: usize },
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncQueueError {
    #[error("sync queue state poisoned")]
    Poisoned,
    #[error("sync queue storage error: {0}")]
    Storage(String),
}

/// Store outcome of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub admission: Admission,
    /// Older waiters granted by the same call (a raised limit), excluding the newcomer
    pub promoted: Vec<JobId>,
}

/// Store outcome of releasing a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Released {
    pub key: SyncObjectKey,
    pub promoted: Vec<JobId>,
}

/// Sync queue storage, shared by every management node.
///
/// `enqueue` and `release` each apply to a key's whole queue atomically: a
/// shared implementation runs them in one transaction (or as a
/// compare-and-update on the key's queue) so no two nodes can hand out the
/// same slot.
pub trait SyncQueueStore: Send + Sync {
    /// Add a claim for `job_id` and promote waiters into any free slots.
    ///
    /// A job that already holds a claim keeps it; its current admission is returned.
    fn enqueue(
        &self,
        job_id: JobId,
        key: SyncObjectKey,
        queue_size_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, SyncQueueError>;

    /// Drop the job's claim. `None` when it held none.
    fn release(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Released>, SyncQueueError>;

    fn admission(&self, job_id: JobId) -> Result<Option<Admission>, SyncQueueError>;

    /// A key's items in enqueue order.
    fn items(&self, key: &SyncObjectKey) -> Result<Vec<SyncQueueItem>, SyncQueueError>;
}

impl<S> SyncQueueStore for Arc<S>
where
    S: SyncQueueStore + ?Sized,
{
    fn enqueue(
        &self,
        job_id: JobId,
        key: SyncObjectKey,
        queue_size_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, SyncQueueError> {
        (**self).enqueue(job_id, key, queue_size_limit, now)
    }

    fn release(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Released>, SyncQueueError> {
        (**self).release(job_id, now)
    }

    fn admission(&self, job_id: JobId) -> Result<Option<Admission>, SyncQueueError> {
        (**self).admission(job_id)
    }

    fn items(&self, key: &SyncObjectKey) -> Result<Vec<SyncQueueItem>, SyncQueueError> {
        (**self).items(key)
    }
}

#[derive(Debug, Default)]
struct KeyQueue {
    /// Limit from the most recent enqueue; `<= 0` means unbounded
    limit: i64,
    items: VecDeque<SyncQueueItem>,
}

impl KeyQueue {
    fn active_count(&self) -> usize {
        self.items.iter().filter(|i| i.active).count()
    }

    fn has_free_slot(&self) -> bool {
        self.limit <= 0 || self.active_count() < self.limit as usize
    }

    /// Promote the oldest waiters into free slots.
    fn promote(&mut self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut promoted = Vec::new();
        while self.has_free_slot() {
            let Some(next) = self.items.iter_mut().find(|i| !i.active) else {
                break;
            };
            next.active = true;
            next.granted_at = Some(now);
            promoted.push(next.job_id);
        }
        promoted
    }

    fn admission_of(&self, job_id: JobId) -> Option<Admission> {
        let mut waiting = 0;
        for item in &self.items {
            if !item.active {
                waiting += 1;
            }
            if item.job_id == job_id {
                return Some(if item.active {
                    Admission::Granted
                } else {
                    Admission::Waiting { position: waiting }
                });
            }
        }
        None
    }
}

#[derive(Debug, Default)]
struct QueueState {
    queues: HashMap<SyncObjectKey, KeyQueue>,
    /// Which key each enqueued job sits on
    index: HashMap<JobId, SyncObjectKey>,
}

impl QueueState {
    fn admission_of(&self, job_id: JobId) -> Option<Admission> {
        self.index
            .get(&job_id)
            .and_then(|key| self.queues.get(key))
            .and_then(|q| q.admission_of(job_id))
    }
}

/// In-memory sync queue store for tests/dev and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemorySyncQueueStore {
    state: RwLock<QueueState>,
}

impl InMemorySyncQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, QueueState>, SyncQueueError> {
        self.state.read().map_err(|_| SyncQueueError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueState>, SyncQueueError> {
        self.state.write().map_err(|_| SyncQueueError::Poisoned)
    }
}

impl SyncQueueStore for InMemorySyncQueueStore {
    fn enqueue(
        &self,
        job_id: JobId,
        key: SyncObjectKey,
        queue_size_limit: i64,
        now: DateTime<Utc>,
    ) -> Result<Enqueued, SyncQueueError> {
        let mut state = self.write()?;

        if let Some(admission) = state.admission_of(job_id) {
            return Ok(Enqueued {
                admission,
                promoted: Vec::new(),
            });
        }

        let queue = state.queues.entry(key.clone()).or_default();
        queue.limit = queue_size_limit;
        queue.items.push_back(SyncQueueItem {
            sync_object_key: key.clone(),
            job_id,
            queue_size_limit,
            enqueued_at: now,
            active: false,
            granted_at: None,
        });

        // A raised limit frees slots for older waiters before the newcomer.
        let mut promoted = queue.promote(now);
        let admission = queue
            .admission_of(job_id)
            .unwrap_or(Admission::Waiting { position: 1 });
        promoted.retain(|id| *id != job_id);
        state.index.insert(job_id, key);

        Ok(Enqueued { admission, promoted })
    }

    fn release(&self, job_id: JobId, now: DateTime<Utc>) -> Result<Option<Released>, SyncQueueError> {
        let mut state = self.write()?;

        let Some(key) = state.index.remove(&job_id) else {
            return Ok(None);
        };

        let mut promoted = Vec::new();
        let mut now_empty = false;
        if let Some(queue) = state.queues.get_mut(&key) {
            let was_active = match queue.items.iter().position(|i| i.job_id == job_id) {
                Some(pos) => queue.items.remove(pos).is_some_and(|i| i.active),
                None => false,
            };
            if was_active {
                promoted = queue.promote(now);
            }
            now_empty = queue.items.is_empty();
        }
        if now_empty {
            state.queues.remove(&key);
        }
        Ok(Some(Released { key, promoted }))
    }

    fn admission(&self, job_id: JobId) -> Result<Option<Admission>, SyncQueueError> {
        Ok(self.read()?.admission_of(job_id))
    }

    fn items(&self, key: &SyncObjectKey) -> Result<Vec<SyncQueueItem>, SyncQueueError> {
        Ok(self
            .read()?
            .queues
            .get(key)
            .map(|q| q.items.iter().cloned().collect())
            .unwrap_or_default())
    }
}

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// FIFO admission control over resource keys.
///
/// Claims live in the shared `SyncQueueStore`; this type adds local waiting,
/// logging and grant announcements on top.
pub struct SyncQueue {
    store: Arc<dyn SyncQueueStore>,
    /// Bumped on every local grant so waiters re-read the store
    generation: Mutex<u64>,
    granted: Condvar,
    bus: Option<Arc<dyn MessageBus>>,
    /// Re-read cadence for grants made on other nodes
    check_interval: Duration,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("bus", &self.bus.is_some())
            .field("check_interval", &self.check_interval)
            .finish()
    }
}

impl Default for SyncQueue {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl SyncQueue {
    pub fn new(store: Arc<dyn SyncQueueStore>) -> Self {
        Self {
            store,
            generation: Mutex::new(0),
            granted: Condvar::new(),
            bus: None,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }

    /// Queue over a private in-memory store.
    pub fn in_memory() -> Self {
        Self::new(InMemorySyncQueueStore::arc())
    }

    /// Announce promotions on the bus so waiters on other nodes re-check.
    pub fn with_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn SyncQueueStore> {
        &self.store
    }

    /// Claim a slot on `key` for `job_id`.
    ///
    /// Enqueuing a job that already holds a claim returns its current admission
    /// without adding a second item.
    pub fn enqueue(
        &self,
        job_id: JobId,
        key: SyncObjectKey,
        queue_size_limit: i64,
    ) -> Result<Admission, SyncQueueError> {
        let Enqueued { admission, promoted } =
            self.store.enqueue(job_id, key.clone(), queue_size_limit, Utc::now())?;

        if !promoted.is_empty() {
            self.notify_local()?;
        }
        for promoted_id in &promoted {
            info!(job_id = %promoted_id, sync_key = %key, "sync queue slot granted");
            self.announce(*promoted_id, &key);
        }

        match admission {
            Admission::Granted => {
                debug!(job_id = %job_id, sync_key = %key, "sync queue slot granted");
            }
            Admission::Waiting { position } => {
                info!(job_id = %job_id, sync_key = %key, position, "job waiting for sync queue slot");
            }
        }
        Ok(admission)
    }

    /// Drop the job's claim and promote the next waiters.
    ///
    /// Releasing a job with no claim is a no-op. Returns the promoted jobs.
    pub fn release(&self, job_id: JobId) -> Result<Vec<JobId>, SyncQueueError> {
        let Some(Released { key, promoted }) = self.store.release(job_id, Utc::now())? else {
            return Ok(Vec::new());
        };

        debug!(job_id = %job_id, sync_key = %key, promoted = promoted.len(), "sync queue slot released");

        if !promoted.is_empty() {
            self.notify_local()?;
            for promoted_id in &promoted {
                info!(job_id = %promoted_id, sync_key = %key, "sync queue slot granted");
                self.announce(*promoted_id, &key);
            }
        }
        Ok(promoted)
    }

    fn notify_local(&self) -> Result<(), SyncQueueError> {
        let mut generation = self.generation.lock().map_err(|_| SyncQueueError::Poisoned)?;
        *generation = generation.wrapping_add(1);
        self.granted.notify_all();
        Ok(())
    }

    fn announce(&self, job_id: JobId, key: &SyncObjectKey) {
        let Some(bus) = &self.bus else {
            return;
        };
        let message = BusMessage::new(
            TOPIC_SYNC_QUEUE_GRANTED,
            serde_json::json!({ "job_id": job_id, "sync_key": key }),
        );
        if let Err(err) = bus.publish(message) {
            warn!(job_id = %job_id, error = ?err, "failed to announce sync queue grant");
        }
    }

    /// Whether the job holds an active slot.
    pub fn is_active(&self, job_id: JobId) -> Result<bool, SyncQueueError> {
        Ok(matches!(self.admission(job_id)?, Some(Admission::Granted)))
    }

    /// Current admission of a job, or `None` when it holds no claim.
    pub fn admission(&self, job_id: JobId) -> Result<Option<Admission>, SyncQueueError> {
        self.store.admission(job_id)
    }

    pub fn active_count(&self, key: &SyncObjectKey) -> Result<usize, SyncQueueError> {
        Ok(self.store.items(key)?.iter().filter(|i| i.active).count())
    }

    pub fn waiting_count(&self, key: &SyncObjectKey) -> Result<usize, SyncQueueError> {
        Ok(self.store.items(key)?.iter().filter(|i| !i.active).count())
    }

    /// Snapshot of a key's items in enqueue order.
    pub fn items(&self, key: &SyncObjectKey) -> Result<Vec<SyncQueueItem>, SyncQueueError> {
        self.store.items(key)
    }

    /// Block until the job holds an active slot or `timeout` elapses.
    ///
    /// Local grants wake the waiter at once; grants made on other nodes are
    /// seen on the next `check_interval` tick. Returns false on timeout, or
    /// when the job holds no claim at all.
    pub fn wait_until_active(&self, job_id: JobId, timeout: Duration) -> Result<bool, SyncQueueError> {
        let deadline = Instant::now() + timeout;

        loop {
            let seen = *self.generation.lock().map_err(|_| SyncQueueError::Poisoned)?;

            match self.store.admission(job_id)? {
                Some(Admission::Granted) => return Ok(true),
                None => return Ok(false),
                Some(Admission::Waiting { .. }) => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            let wait = (deadline - now).min(self.check_interval);

            let guard = self.generation.lock().map_err(|_| SyncQueueError::Poisoned)?;
            if *guard == seen {
                let _ = self
                    .granted
                    .wait_timeout(guard, wait)
                    .map_err(|_| SyncQueueError::Poisoned)?;
            }
        }
    }
}
