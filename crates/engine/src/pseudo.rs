//! Pseudo jobs for call sites that run outside a real job.
//!
//! Callers pass an explicit `ExecutionContextId`; there is no ambient
//! thread-local "current job". Mappings live only in this process and the
//! backing job records are expunged at node startup.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use jobweave_core::{ExecutionContextId, JobId};

use crate::error::{JobError, JobResult};
use crate::jobs::{Job, JobStore, JobStoreError, PSEUDO_JOB_INSTANCE_TYPE};

const PSEUDO_JOB_CMD: &str = "PseudoJob";

pub struct PseudoJobRegistry {
    jobs: Arc<dyn JobStore>,
    node_id: u64,
    contexts: Mutex<HashMap<ExecutionContextId, JobId>>,
}

impl PseudoJobRegistry {
    pub fn new(jobs: Arc<dyn JobStore>, node_id: u64) -> Self {
        Self {
            jobs,
            node_id,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    fn contexts(&self) -> JobResult<MutexGuard<'_, HashMap<ExecutionContextId, JobId>>> {
        self.contexts
            .lock()
            .map_err(|_| JobError::Storage("pseudo job registry poisoned".to_string()))
    }

    /// The job mapped to `context`, created on first access.
    pub fn get_or_create(&self, context: &ExecutionContextId) -> JobResult<Job> {
        let mut contexts = self.contexts()?;

        if let Some(job_id) = contexts.get(context).copied() {
            match self.jobs.get(job_id) {
                Ok(job) => return Ok(job),
                // Expunged underneath us; map the context to a fresh job.
                Err(JobStoreError::NotFound(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let mut job = Job::new(PSEUDO_JOB_CMD).with_instance_type(PSEUDO_JOB_INSTANCE_TYPE);
        job.init_node = Some(self.node_id);
        let job_id = self.jobs.create(job.clone())?;
        contexts.insert(context.clone(), job_id);

        debug!(job_id = %job_id, context = %context, "pseudo job created");
        Ok(job)
    }

    /// Drop the mapping for a terminated context and remove its job.
    pub fn release(&self, context: &ExecutionContextId) -> JobResult<bool> {
        let Some(job_id) = self.contexts()?.remove(context) else {
            return Ok(false);
        };
        self.jobs.expunge(job_id)?;
        debug!(job_id = %job_id, context = %context, "pseudo job released");
        Ok(true)
    }

    /// Startup sweep: forget every mapping and expunge all pseudo jobs in the store,
    /// including those left behind by a previous process.
    pub fn expunge_all(&self) -> JobResult<usize> {
        self.contexts()?.clear();
        let removed = self.jobs.expunge_by_instance_type(PSEUDO_JOB_INSTANCE_TYPE)?;
        info!(removed, "pseudo jobs expunged");
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.contexts.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
