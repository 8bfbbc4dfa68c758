use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Job lifecycle states
///
/// `Pending` is written on submission and is claim-eligible exactly like
/// `Queued`; a job that failed with retries left goes back to `Queued`.
/// `Success` and `Dead` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Newly submitted
    Pending,

    /// Eligible for claim after a failed attempt
    Queued,

    /// Leased to a worker
    Running,

    /// Completed successfully
    Success,

    /// Retries exhausted (dead-letter)
    Dead,
}

impl JobState {
    /// All states, in lifecycle order
    pub fn all() -> &'static [JobState] {
        &[
            Self::Pending,
            Self::Queued,
            Self::Running,
            Self::Success,
            Self::Dead,
        ]
    }

    /// Check if the state never transitions further
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Dead)
    }

    /// Check if the state is waiting for a worker (no lease expected)
    pub fn is_waiting(self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }

    /// Persisted name of the state
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Queued => "QUEUED",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Dead => "DEAD",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "QUEUED" => Ok(Self::Queued),
            "RUNNING" => Ok(Self::Running),
            "SUCCESS" => Ok(Self::Success),
            "DEAD" => Ok(Self::Dead),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}
