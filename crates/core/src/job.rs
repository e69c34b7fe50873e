//! Pipeline job lifecycle states.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a pipeline job.
///
/// Transitions: Created -> Submitted -> {Runnable|Starting|Running} ->
/// {Succeeded|Failed|NotEnoughInput} -> ClosedOut. The middle states mirror
/// what the external batch service reports while polling; the terminal
/// outcome is derived from the job's exit code at closeout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Submitted,
    Runnable,
    Starting,
    Running,
    Succeeded,
    Failed,
    NotEnoughInput,
    ClosedOut,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Submitted => "submitted",
            Self::Runnable => "runnable",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::NotEnoughInput => "not_enough_input",
            Self::ClosedOut => "closed_out",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "created" => Self::Created,
            "submitted" => Self::Submitted,
            "runnable" => Self::Runnable,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "not_enough_input" => Self::NotEnoughInput,
            "closed_out" => Self::ClosedOut,
            other => return Err(Error::InvalidJobStatus(other.to_string())),
        })
    }

    /// Whether the job has reached an outcome (no further external polling).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::NotEnoughInput | Self::ClosedOut
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome classification of a finished job, derived from its exit code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Normal completion (any code below 64 other than 33).
    Succeeded,
    /// The job reported too few overlap inputs (exit 33). Not retried, not
    /// counted toward failure alerting.
    NotEnoughInput,
    /// Fatal failure (exit >= 64).
    Failed,
}

impl JobOutcome {
    /// Classify an exit code per the documented convention: codes >= 64
    /// are fatal precondition failures, 33 is the soft not-enough-input
    /// outcome, everything else counts as success.
    pub fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == crate::EXIT_NOT_ENOUGH_INPUT {
            Self::NotEnoughInput
        } else if exit_code >= 64 {
            Self::Failed
        } else {
            Self::Succeeded
        }
    }

    pub fn terminal_status(&self) -> JobStatus {
        match self {
            Self::Succeeded => JobStatus::Succeeded,
            Self::NotEnoughInput => JobStatus::NotEnoughInput,
            Self::Failed => JobStatus::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            JobStatus::Created,
            JobStatus::Submitted,
            JobStatus::Runnable,
            JobStatus::Starting,
            JobStatus::Running,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::NotEnoughInput,
            JobStatus::ClosedOut,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::parse("bogus").is_err());
    }

    #[test]
    fn test_terminal_flags() {
        assert!(!JobStatus::Created.is_terminal());
        assert!(!JobStatus::Submitted.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::NotEnoughInput.is_terminal());
        assert!(JobStatus::ClosedOut.is_terminal());
    }

    #[test]
    fn test_outcome_from_exit_code() {
        assert_eq!(JobOutcome::from_exit_code(0), JobOutcome::Succeeded);
        assert_eq!(JobOutcome::from_exit_code(33), JobOutcome::NotEnoughInput);
        assert_eq!(JobOutcome::from_exit_code(64), JobOutcome::Failed);
        assert_eq!(JobOutcome::from_exit_code(70), JobOutcome::Failed);
        // Codes below 64 other than 33 are not failures.
        assert_eq!(JobOutcome::from_exit_code(1), JobOutcome::Succeeded);
    }
}
