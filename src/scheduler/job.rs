use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// `queued -> running -> {completed, failed}`; nothing else.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Running)
                | (JobStatus::Running, JobStatus::Completed)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Completed => write!(f, "completed"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    RuntimeError,
    TimeLimitExceeded,
    InternalError,
}

impl Verdict {
    pub const ALL: [Verdict; 5] = [
        Verdict::Accepted,
        Verdict::WrongAnswer,
        Verdict::RuntimeError,
        Verdict::TimeLimitExceeded,
        Verdict::InternalError,
    ];

    /// Status a job ends in for this verdict. `completed` means the code ran
    /// to a normal exit, whatever it printed.
    pub fn terminal_status(self) -> JobStatus {
        match self {
            Verdict::Accepted | Verdict::WrongAnswer => JobStatus::Completed,
            Verdict::RuntimeError | Verdict::TimeLimitExceeded | Verdict::InternalError => {
                JobStatus::Failed
            }
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Verdict::Accepted => "Accepted",
            Verdict::WrongAnswer => "WrongAnswer",
            Verdict::RuntimeError => "RuntimeError",
            Verdict::TimeLimitExceeded => "TimeLimitExceeded",
            Verdict::InternalError => "InternalError",
        };
        f.write_str(name)
    }
}

/// Everything written when a job reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub verdict: Verdict,
    pub actual_output: String,
    pub exit_code: Option<i32>,
}

impl JobOutcome {
    pub fn internal_error(reason: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::InternalError,
            actual_output: reason.into(),
            exit_code: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub code: String,
    pub expected_output: String,
    pub status: JobStatus,
    pub verdict: Option<Verdict>,
    pub actual_output: Option<String>,
    pub exit_code: Option<i32>,
    pub executed_by: Option<usize>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(code: String, expected_output: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            expected_output,
            status: JobStatus::Queued,
            verdict: None,
            actual_output: None,
            exit_code: None,
            executed_by: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub(crate) fn start(&mut self, worker_id: usize) {
        self.status = JobStatus::Running;
        self.executed_by = Some(worker_id);
        self.started_at = Some(Utc::now());
    }

    /// Status, verdict and output are assigned together; callers hold the
    /// store's write lock so readers never see a partial result.
    pub(crate) fn finish(&mut self, outcome: JobOutcome) {
        self.status = outcome.verdict.terminal_status();
        self.verdict = Some(outcome.verdict);
        self.actual_output = Some(outcome.actual_output);
        self.exit_code = outcome.exit_code;
        self.completed_at = Some(Utc::now());
    }
}
