//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobweave_core::{AccountId, JobId, ResultPayload};

use crate::sync_queue::SyncObjectKey;

/// Result code reported by a job that finished without error.
pub const RESULT_CODE_SUCCESS: i32 = 0;

/// Result code used when the engine itself fails a job (no handler, interrupted by restart).
pub const RESULT_CODE_INTERNAL_ERROR: i32 = 530;

/// Instance type carried by pseudo jobs; the startup sweep expunges by it.
pub const PSEUDO_JOB_INSTANCE_TYPE: &str = "Thread";

/// Job lifecycle status.
///
/// Transitions only move forward: `Queued → InProgress → {Completed, Failed, Cancelled}`.
/// A queued job may also go straight to a terminal status (e.g. cancelled before it ran).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// Staying in the same status is not a transition and returns false.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => next != JobStatus::Queued,
            JobStatus::InProgress => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::InProgress => write!(f, "in_progress"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An async job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID (generator-assigned)
    pub id: JobId,
    /// Command name the job was submitted for
    pub cmd: String,
    /// Opaque command arguments
    pub cmd_info: Option<ResultPayload>,
    /// Type of the instance the job targets (e.g. "VirtualMachine")
    pub instance_type: Option<String>,
    /// Owning account
    pub account_id: Option<AccountId>,
    pub status: JobStatus,
    /// Progress marker owned by the executing worker; only moves forward
    pub process_status: i32,
    pub result_code: i32,
    pub result_payload: Option<ResultPayload>,
    /// Instance the job has attached itself to while running
    pub related_instance_type: Option<String>,
    pub related_instance_id: Option<String>,
    /// Executor handler that runs the job body
    pub dispatcher_ref: Option<String>,
    /// Resource key gating execution, if any
    pub sync_source_key: Option<SyncObjectKey>,
    /// Active-slot limit the job was gated with; kept so claims can be rebuilt
    pub sync_queue_limit: i64,
    /// Node that submitted the job
    pub init_node: Option<u64>,
    /// Node currently (or last) executing the job
    pub executing_node: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new queued job for `cmd`.
    pub fn new(cmd: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            cmd: cmd.into(),
            cmd_info: None,
            instance_type: None,
            account_id: None,
            status: JobStatus::Queued,
            process_status: 0,
            result_code: RESULT_CODE_SUCCESS,
            result_payload: None,
            related_instance_type: None,
            related_instance_id: None,
            dispatcher_ref: None,
            sync_source_key: None,
            sync_queue_limit: 0,
            init_node: None,
            executing_node: None,
            created_at: now,
            last_updated_at: now,
        }
    }

    pub fn with_account(mut self, account_id: AccountId) -> Self {
        self.account_id = Some(account_id);
        self
    }

    pub fn with_instance_type(mut self, instance_type: impl Into<String>) -> Self {
        self.instance_type = Some(instance_type.into());
        self
    }

    pub fn with_related_instance(
        mut self,
        instance_type: impl Into<String>,
        instance_id: impl Into<String>,
    ) -> Self {
        self.related_instance_type = Some(instance_type.into());
        self.related_instance_id = Some(instance_id.into());
        self
    }

    pub fn with_dispatcher(mut self, dispatcher_ref: impl Into<String>) -> Self {
        self.dispatcher_ref = Some(dispatcher_ref.into());
        self
    }

    pub fn with_cmd_info(mut self, cmd_info: ResultPayload) -> Self {
        self.cmd_info = Some(cmd_info);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Placeholder job of an execution context; never claimed for execution.
    pub fn is_pseudo(&self) -> bool {
        self.instance_type.as_deref() == Some(PSEUDO_JOB_INSTANCE_TYPE)
    }

    /// Whether the job counts as pending work against `instance_type`.
    pub fn is_pending_for(&self, instance_type: &str, account_id: Option<AccountId>) -> bool {
        let type_matches = self.instance_type.as_deref() == Some(instance_type)
            || self.related_instance_type.as_deref() == Some(instance_type);
        let account_matches = account_id.is_none_or(|a| self.account_id == Some(a));
        !self.is_terminal() && type_matches && account_matches
    }
}

/// Journal entry classification.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalType {
    Success,
    Failure,
    Info,
}

/// Entry about to be appended to a job's journal (not yet sequenced).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJournalEntry {
    pub journal_type: JournalType,
    pub text: String,
    pub context_json: Option<String>,
}

impl NewJournalEntry {
    pub fn new(journal_type: JournalType, text: impl Into<String>) -> Self {
        Self {
            journal_type,
            text: text.into(),
            context_json: None,
        }
    }

    pub fn with_context(mut self, context_json: impl Into<String>) -> Self {
        self.context_json = Some(context_json.into());
        self
    }
}

/// Append-only journal record, ordered by `sequence_no` within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub job_id: JobId,
    pub journal_type: JournalType,
    pub text: String,
    pub context_json: Option<String>,
    /// Starts at 1 for each job
    pub sequence_no: u64,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const ALL: [JobStatus; 5] = [
        JobStatus::Queued,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    fn rank(status: JobStatus) -> u8 {
        match status {
            JobStatus::Queued => 0,
            JobStatus::InProgress => 1,
            _ => 2,
        }
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn terminal_jobs_never_reopen() {
        for from in ALL.iter().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn new_job_is_queued() {
        let job = Job::new("StartVm");
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.process_status, 0);
        assert_eq!(job.result_code, RESULT_CODE_SUCCESS);
        assert!(job.result_payload.is_none());
    }

    #[test]
    fn pending_match_uses_instance_type_and_account() {
        let account = AccountId::new();
        let job = Job::new("StartVm")
            .with_instance_type("VirtualMachine")
            .with_account(account);

        assert!(job.is_pending_for("VirtualMachine", None));
        assert!(job.is_pending_for("VirtualMachine", Some(account)));
        assert!(!job.is_pending_for("VirtualMachine", Some(AccountId::new())));
        assert!(!job.is_pending_for("Network", None));

        let attached = Job::new("AttachVolume").with_related_instance("Volume", "vol-1");
        assert!(attached.is_pending_for("Volume", None));
    }

    proptest! {
        /// Property: any accepted chain of transitions only moves forward.
        #[test]
        fn accepted_transitions_are_forward_only(
            steps in prop::collection::vec(0usize..5, 1..12)
        ) {
            let mut current = JobStatus::Queued;
            for step in steps {
                let next = ALL[step];
                if current.can_transition_to(next) {
                    prop_assert!(rank(next) > rank(current));
                    current = next;
                }
            }
        }
    }
}
