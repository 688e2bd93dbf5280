use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use jobweave_core::{JobId, ResultPayload};

use crate::error::JobError;
use crate::jobs::JobStatus;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinMode {
    /// The parent's calling thread blocks until the join resolves.
    Sync,
    /// The parent detaches and is resumed later through a wakeup dispatcher.
    Async,
}

/// Join record state machine: `Created → Waiting → {Satisfied, TimedOut, Disjoined}`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinState {
    Created,
    Waiting,
    Satisfied,
    TimedOut,
    Disjoined,
}

impl JoinState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JoinState::Satisfied | JoinState::TimedOut | JoinState::Disjoined
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

/// Wakeup parameters of an async join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsyncJoin {
    /// Job logic to re-enter on resumption (opaque to the engine)
    pub wakeup_handler: String,
    /// Dispatcher that performs the re-entry (opaque to the engine)
    pub wakeup_dispatcher: String,
    /// Bus topics whose publications trigger an immediate wakeup
    pub wakeup_topics: Vec<String>,
    /// Poll re-check period; 0 disables polling
    pub wakeup_interval_ms: u64,
    /// Total wait budget; 0 waits forever
    pub timeout_ms: u64,
}

impl AsyncJoin {
    pub fn new(wakeup_handler: impl Into<String>, wakeup_dispatcher: impl Into<String>) -> Self {
        Self {
            wakeup_handler: wakeup_handler.into(),
            wakeup_dispatcher: wakeup_dispatcher.into(),
            wakeup_topics: Vec::new(),
            wakeup_interval_ms: 0,
            timeout_ms: 0,
        }
    }

    pub fn with_topics<I, T>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        self.wakeup_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.wakeup_interval_ms = interval_ms;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// What a satisfied join hands back to the parent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinResult {
    /// Terminal status of the child
    pub status: JobStatus,
    pub result: Option<ResultPayload>,
}

/// A parent's dependency on a child job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinRecord {
    pub parent_job_id: JobId,
    pub child_job_id: JobId,
    pub mode: JoinMode,
    pub wakeup_handler_ref: Option<String>,
    pub wakeup_dispatcher_ref: Option<String>,
    pub wakeup_topics: Vec<String>,
    pub wakeup_interval_ms: u64,
    pub timeout_ms: u64,
    pub joined_at: DateTime<Utc>,
    pub state: JoinState,
    /// Child's terminal status; set once, when the join is satisfied
    pub join_status: Option<JobStatus>,
    pub join_result: Option<ResultPayload>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub next_check_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl JoinRecord {
    pub fn sync(parent: JobId, child: JobId) -> Self {
        Self {
            parent_job_id: parent,
            child_job_id: child,
            mode: JoinMode::Sync,
            wakeup_handler_ref: None,
            wakeup_dispatcher_ref: None,
            wakeup_topics: Vec::new(),
            wakeup_interval_ms: 0,
            timeout_ms: 0,
            joined_at: Utc::now(),
            state: JoinState::Created,
            join_status: None,
            join_result: None,
            last_checked_at: None,
            next_check_at: None,
            resolved_at: None,
        }
    }

    pub fn asynchronous(parent: JobId, child: JobId, wakeup: &AsyncJoin) -> Self {
        Self {
            mode: JoinMode::Async,
            wakeup_handler_ref: Some(wakeup.wakeup_handler.clone()),
            wakeup_dispatcher_ref: Some(wakeup.wakeup_dispatcher.clone()),
            wakeup_topics: wakeup.wakeup_topics.clone(),
            wakeup_interval_ms: wakeup.wakeup_interval_ms,
            timeout_ms: wakeup.timeout_ms,
            ..Self::sync(parent, child)
        }
    }

    pub fn key(&self) -> (JobId, JobId) {
        (self.parent_job_id, self.child_job_id)
    }

    pub fn is_waiting(&self) -> bool {
        self.state == JoinState::Waiting
    }

    /// Instant after which the join times out, if it has a timeout.
    pub fn timeout_at(&self) -> Option<DateTime<Utc>> {
        (self.timeout_ms > 0).then(|| self.joined_at + millis(self.timeout_ms))
    }

    pub fn is_timed_out(&self, now: DateTime<Utc>) -> bool {
        self.timeout_at().is_some_and(|at| now >= at)
    }

    /// Whether the poll interval has elapsed since the last check.
    pub fn is_check_due(&self, now: DateTime<Utc>) -> bool {
        self.next_check_at.is_some_and(|at| now >= at)
    }

    /// Next poll instant counted from `now`, if polling is enabled.
    pub fn next_check_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (self.wakeup_interval_ms > 0).then(|| now + millis(self.wakeup_interval_ms))
    }

    pub fn listens_to(&self, topic: &str) -> bool {
        self.wakeup_topics.iter().any(|t| t == topic)
    }

    /// Resolved outcome, or `None` while the join is still pending.
    pub fn outcome(&self) -> Option<Result<JoinResult, JobError>> {
        match self.state {
            JoinState::Created | JoinState::Waiting => None,
            JoinState::Satisfied => Some(
                self.join_status
                    .map(|status| JoinResult {
                        status,
                        result: self.join_result.clone(),
                    })
                    .ok_or_else(|| JobError::invalid_state("satisfied join without a status")),
            ),
            JoinState::TimedOut => Some(Err(JobError::JoinTimeout {
                parent: self.parent_job_id,
                child: self.child_job_id,
            })),
            JoinState::Disjoined => Some(Err(JobError::Disjoined {
                parent: self.parent_job_id,
                child: self.child_job_id,
            })),
        }
    }
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX / 1_000_000))
}
