//! Join record storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use jobweave_core::JobId;

use super::types::{JoinMode, JoinRecord, JoinState};

/// Result of inserting a join record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinInsert {
    /// No active record existed for the pair; this one was stored.
    Created(JoinRecord),
    /// An active record for the pair already exists and was left untouched.
    Existing(JoinRecord),
}

impl JoinInsert {
    pub fn record(&self) -> &JoinRecord {
        match self {
            JoinInsert::Created(r) | JoinInsert::Existing(r) => r,
        }
    }
}

/// Join record store.
///
/// Shared by every management node. At most one active record exists per
/// (parent, child) pair. Resolved records stay readable until disjoined or
/// replaced by a new join on the same pair; the facade drops a parent's
/// records once the parent finishes.
pub trait JoinStore: Send + Sync {
    /// Store `record` unless an active record for the same pair exists.
    ///
    /// A resolved record for the pair is replaced.
    fn insert(&self, record: JoinRecord) -> Result<JoinInsert, JoinStoreError>;

    fn get(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError>;

    /// Remove the record for the pair, returning it if it existed.
    fn remove(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError>;

    /// Records where `parent` is the waiting job.
    fn by_parent(&self, parent: JobId) -> Result<Vec<JoinRecord>, JoinStoreError>;

    /// Records waiting on `child`.
    fn by_child(&self, child: JobId) -> Result<Vec<JoinRecord>, JoinStoreError>;

    /// Records in `Waiting` for a mode, oldest first.
    fn waiting(&self, mode: JoinMode) -> Result<Vec<JoinRecord>, JoinStoreError>;

    /// Compare-and-update: apply `update` only if the record is in `expected`.
    ///
    /// Returns the updated record, or `None` when the record is missing or in
    /// another state (someone else already moved it).
    fn transition(
        &self,
        parent: JobId,
        child: JobId,
        expected: JoinState,
        update: &mut dyn FnMut(&mut JoinRecord),
    ) -> Result<Option<JoinRecord>, JoinStoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JoinStoreError {
    #[error("join store lock poisoned")]
    Poisoned,
    #[error("join storage error: {0}")]
    Storage(String),
}

impl<S> JoinStore for Arc<S>
where
    S: JoinStore + ?Sized,
{
    fn insert(&self, record: JoinRecord) -> Result<JoinInsert, JoinStoreError> {
        (**self).insert(record)
    }

    fn get(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError> {
        (**self).get(parent, child)
    }

    fn remove(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError> {
        (**self).remove(parent, child)
    }

    fn by_parent(&self, parent: JobId) -> Result<Vec<JoinRecord>, JoinStoreError> {
        (**self).by_parent(parent)
    }

    fn by_child(&self, child: JobId) -> Result<Vec<JoinRecord>, JoinStoreError> {
        (**self).by_child(child)
    }

    fn waiting(&self, mode: JoinMode) -> Result<Vec<JoinRecord>, JoinStoreError> {
        (**self).waiting(mode)
    }

    fn transition(
        &self,
        parent: JobId,
        child: JobId,
        expected: JoinState,
        update: &mut dyn FnMut(&mut JoinRecord),
    ) -> Result<Option<JoinRecord>, JoinStoreError> {
        (**self).transition(parent, child, expected, update)
    }
}

/// In-memory join store for tests/dev and single-node deployments.
#[derive(Debug, Default)]
pub struct InMemoryJoinStore {
    records: RwLock<HashMap<(JobId, JobId), JoinRecord>>,
}

impl InMemoryJoinStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<(JobId, JobId), JoinRecord>>, JoinStoreError> {
        self.records.read().map_err(|_| JoinStoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<(JobId, JobId), JoinRecord>>, JoinStoreError> {
        self.records.write().map_err(|_| JoinStoreError::Poisoned)
    }

    fn collect(&self, filter: impl Fn(&JoinRecord) -> bool) -> Result<Vec<JoinRecord>, JoinStoreError> {
        let records = self.read()?;
        let mut result: Vec<_> = records.values().filter(|r| filter(r)).cloned().collect();
        result.sort_by_key(|r| (r.joined_at, r.parent_job_id, r.child_job_id));
        Ok(result)
    }
}

impl JoinStore for InMemoryJoinStore {
    fn insert(&self, record: JoinRecord) -> Result<JoinInsert, JoinStoreError> {
        let mut records = self.write()?;
        let key = record.key();

        if let Some(existing) = records.get(&key) {
            if existing.state.is_active() {
                return Ok(JoinInsert::Existing(existing.clone()));
            }
        }

        records.insert(key, record.clone());
        Ok(JoinInsert::Created(record))
    }

    fn get(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError> {
        Ok(self.read()?.get(&(parent, child)).cloned())
    }

    fn remove(&self, parent: JobId, child: JobId) -> Result<Option<JoinRecord>, JoinStoreError> {
        Ok(self.write()?.remove(&(parent, child)))
    }

    fn by_parent(&self, parent: JobId) -> Result<Vec<JoinRecord>, JoinStoreError> {
        self.collect(|r| r.parent_job_id == parent)
    }

    fn by_child(&self, child: JobId) -> Result<Vec<JoinRecord>, JoinStoreError> {
        self.collect(|r| r.child_job_id == child)
    }

    fn waiting(&self, mode: JoinMode) -> Result<Vec<JoinRecord>, JoinStoreError> {
        self.collect(|r| r.mode == mode && r.is_waiting())
    }

    fn transition(
        &self,
        parent: JobId,
        child: JobId,
        expected: JoinState,
        update: &mut dyn FnMut(&mut JoinRecord),
    ) -> Result<Option<JoinRecord>, JoinStoreError> {
        let mut records = self.write()?;
        match records.get_mut(&(parent, child)) {
            Some(record) if record.state == expected => {
                update(record);
                Ok(Some(record.clone()))
            }
            _ => Ok(None),
        }
    }
}
