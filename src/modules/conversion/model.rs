use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

/// Lifecycle of a row in `tasks`. Only the worker moves a row out of `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Available,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Available => "available",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "available" => Ok(JobStatus::Available),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// What the worker reports back to the store for one job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success {
        start: OffsetDateTime,
        end: OffsetDateTime,
    },
    Failure,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } => JobStatus::Available,
            JobOutcome::Failure => JobStatus::Failed,
        }
    }
}

/// Result of a successful record call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The row moved from `pending` to the outcome's status.
    Applied(JobStatus),
    /// The row was already terminal, typically a redelivered message. Left untouched.
    AlreadyTerminal(JobStatus),
}
