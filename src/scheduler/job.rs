use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::{PlaybookId, ServerId, VarMap};

pub const EXIT_CODE_SUCCESS: i32 = 0;
/// Recorded for user-initiated cancellation. Never produced by a process.
pub const EXIT_CODE_CANCELLED: i32 = -1;
/// Recorded when the tool could not be started at all.
pub const EXIT_CODE_LAUNCH_FAILED: i32 = -2;
/// Recorded when the run exceeded its maximum duration.
pub const EXIT_CODE_TIMED_OUT: i32 = -3;
/// Recorded when the process ended without an exit code (killed by a signal).
pub const EXIT_CODE_CRASHED: i32 = -4;
/// Recorded for a failed run whose process still exited with 0.
pub const EXIT_CODE_GENERIC_FAILURE: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Success,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Edges of the job state machine. Terminal states have none.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(target, JobStatus::Running | JobStatus::Cancelled),
            JobStatus::Running => matches!(
                target,
                JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
            ),
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Success => write!(f, "success"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Why a job ended up `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    /// The tool never started (missing playbook, malformed inventory, spawn error).
    LaunchFailed { message: String },
    /// The run finished but the recap reported failed or unreachable hosts.
    TaskFailures { failed: u32, unreachable: u32 },
    /// The tool or the adapter reported a fatal error.
    Fatal { message: String },
    /// System-initiated abort after the maximum duration.
    TimedOut { after_secs: u64 },
    /// The process died or its output stream broke.
    Crashed { message: String },
    /// The process exited without ever producing a recap.
    Incomplete { exit_code: i32 },
}

impl FailureReason {
    pub fn is_system_initiated(&self) -> bool {
        matches!(self, FailureReason::TimedOut { .. })
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::LaunchFailed { message } => write!(f, "launch failed: {}", message),
            FailureReason::TaskFailures {
                failed,
                unreachable,
            } => write!(
                f,
                "{} failed and {} unreachable host(s) in recap",
                failed, unreachable
            ),
            FailureReason::Fatal { message } => write!(f, "fatal: {}", message),
            FailureReason::TimedOut { after_secs } => {
                write!(f, "timed out after {}s", after_secs)
            }
            FailureReason::Crashed { message } => write!(f, "crashed: {}", message),
            FailureReason::Incomplete { exit_code } => write!(
                f,
                "exited with code {} without reporting a recap",
                exit_code
            ),
        }
    }
}

/// Terminal outcome decided by the controller for a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Succeeded,
    Failed {
        reason: FailureReason,
        exit_code: i32,
    },
}

impl Resolution {
    pub fn failed(reason: FailureReason, exit_code: i32) -> Self {
        Resolution::Failed { reason, exit_code }
    }

    pub fn status(&self) -> JobStatus {
        match self {
            Resolution::Succeeded => JobStatus::Success,
            Resolution::Failed { .. } => JobStatus::Failed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Resolution::Succeeded => EXIT_CODE_SUCCESS,
            Resolution::Failed { exit_code, .. } => *exit_code,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned sequence number
    pub id: u64,
    /// External correlation id
    pub job_id: Uuid,
    pub playbook_id: PlaybookId,
    pub server_id: ServerId,
    pub initiator: String,
    pub status: JobStatus,
    pub extra_vars: VarMap,
    /// Lineage pointer set on jobs created by `retry`
    pub retry_of: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub failure: Option<FailureReason>,
    pub cancelled_by: Option<String>,
    pub artifacts: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        id: u64,
        playbook_id: PlaybookId,
        server_id: ServerId,
        initiator: impl Into<String>,
        extra_vars: VarMap,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            job_id: Uuid::new_v4(),
            playbook_id,
            server_id,
            initiator: initiator.into(),
            status: JobStatus::Pending,
            extra_vars,
            retry_of: None,
            started_at: None,
            completed_at: None,
            exit_code: None,
            failure: None,
            cancelled_by: None,
            artifacts: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock run time, once both timestamps are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(started), Some(completed)) => Some(completed - started),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for from in JobStatus::ALL.iter().filter(|s| s.is_terminal()) {
            for to in JobStatus::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn transition_graph() {
        use JobStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Success));
        assert!(!Pending.can_transition_to(Failed));
        assert!(Running.can_transition_to(Success));
        assert!(Running.can_transition_to(Failed));
        assert!(Running.can_transition_to(Cancelled));
        assert!(!Running.can_transition_to(Pending));
        assert!(!Running.can_transition_to(Running));
    }

    #[test]
    fn sentinel_exit_codes_are_distinct() {
        let codes = [
            EXIT_CODE_SUCCESS,
            EXIT_CODE_CANCELLED,
            EXIT_CODE_LAUNCH_FAILED,
            EXIT_CODE_TIMED_OUT,
            EXIT_CODE_CRASHED,
            EXIT_CODE_GENERIC_FAILURE,
        ];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
        assert!(EXIT_CODE_CANCELLED < 0);
    }

    #[test]
    fn status_round_trips_through_strings() {
        for status in JobStatus::ALL {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn only_timeouts_are_system_initiated() {
        assert!(FailureReason::TimedOut { after_secs: 1 }.is_system_initiated());
        assert!(!FailureReason::Fatal {
            message: "boom".into()
        }
        .is_system_initiated());
    }
}
