// Batch & Exit Status

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::domain::error::DomainError;

/// Lifecycle status of a job or step execution.
///
/// Variants are declared in severity order, so the derived `Ord` doubles as
/// the "worse than" relation used when aggregating statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Completed,
    Starting,
    Started,
    Stopping,
    Stopped,
    Failed,
    Abandoned,
    Unknown,
}

impl BatchStatus {
    pub const ALL: [BatchStatus; 8] = [
        BatchStatus::Completed,
        BatchStatus::Starting,
        BatchStatus::Started,
        BatchStatus::Stopping,
        BatchStatus::Stopped,
        BatchStatus::Failed,
        BatchStatus::Abandoned,
        BatchStatus::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Completed => "COMPLETED",
            BatchStatus::Starting => "STARTING",
            BatchStatus::Started => "STARTED",
            BatchStatus::Stopping => "STOPPING",
            BatchStatus::Stopped => "STOPPED",
            BatchStatus::Failed => "FAILED",
            BatchStatus::Abandoned => "ABANDONED",
            BatchStatus::Unknown => "UNKNOWN",
        }
    }

    /// STARTING, STARTED and STOPPING all count as an active execution.
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BatchStatus::Starting | BatchStatus::Started | BatchStatus::Stopping
        )
    }

    pub fn is_unsuccessful(&self) -> bool {
        *self >= BatchStatus::Failed
    }

    /// Combine with another status without ever moving backwards.
    ///
    /// Once either side has progressed past STARTED the more severe status
    /// wins. Before that point COMPLETED beats the start-up states, so a
    /// late "starting" notification cannot undo a finished execution.
    pub fn upgrade_to(self, other: BatchStatus) -> BatchStatus {
        if self > BatchStatus::Started || other > BatchStatus::Started {
            return self.max(other);
        }
        if self == BatchStatus::Completed || other == BatchStatus::Completed {
            return BatchStatus::Completed;
        }
        self.max(other)
    }

    /// Map a flow or exit code onto a lifecycle status by prefix.
    pub fn match_prefix(value: &str) -> BatchStatus {
        BatchStatus::ALL
            .into_iter()
            .find(|status| value.starts_with(status.as_str()))
            .unwrap_or(BatchStatus::Unknown)
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BatchStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BatchStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::InvalidStatus(s.to_string()))
    }
}

/// Well-known exit codes.
pub mod exit_codes {
    pub const UNKNOWN: &str = "UNKNOWN";
    pub const EXECUTING: &str = "EXECUTING";
    pub const COMPLETED: &str = "COMPLETED";
    pub const NOOP: &str = "NOOP";
    pub const FAILED: &str = "FAILED";
    pub const STOPPED: &str = "STOPPED";
}

/// Descriptive outcome of an execution, used for flow routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    exit_code: String,
    exit_description: String,
}

impl ExitStatus {
    pub fn new(exit_code: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: String::new(),
        }
    }

    pub fn with_description(exit_code: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            exit_code: exit_code.into(),
            exit_description: description.into(),
        }
    }

    pub fn unknown() -> Self {
        Self::new(exit_codes::UNKNOWN)
    }

    pub fn executing() -> Self {
        Self::new(exit_codes::EXECUTING)
    }

    pub fn completed() -> Self {
        Self::new(exit_codes::COMPLETED)
    }

    pub fn noop() -> Self {
        Self::new(exit_codes::NOOP)
    }

    pub fn failed() -> Self {
        Self::new(exit_codes::FAILED)
    }

    pub fn stopped() -> Self {
        Self::new(exit_codes::STOPPED)
    }

    pub fn exit_code(&self) -> &str {
        &self.exit_code
    }

    pub fn exit_description(&self) -> &str {
        &self.exit_description
    }

    pub fn is_running(&self) -> bool {
        self.exit_code.starts_with(exit_codes::EXECUTING)
            || self.exit_code.starts_with(exit_codes::UNKNOWN)
    }

    fn severity(&self) -> u8 {
        let code = self.exit_code.as_str();
        if code.starts_with(exit_codes::EXECUTING) {
            1
        } else if code.starts_with(exit_codes::COMPLETED) {
            2
        } else if code.starts_with(exit_codes::NOOP) {
            3
        } else if code.starts_with(exit_codes::STOPPED) {
            4
        } else if code.starts_with(exit_codes::FAILED) {
            5
        } else if code.starts_with(exit_codes::UNKNOWN) {
            6
        } else {
            7
        }
    }

    /// Aggregate two statuses: the more severe code wins and the
    /// descriptions of both are kept.
    pub fn and(&self, other: &ExitStatus) -> ExitStatus {
        if self.cmp(other) == Ordering::Less {
            other.add_exit_description(&self.exit_description)
        } else {
            self.add_exit_description(&other.exit_description)
        }
    }

    pub fn replace_exit_code(&self, code: impl Into<String>) -> ExitStatus {
        Self {
            exit_code: code.into(),
            exit_description: self.exit_description.clone(),
        }
    }

    pub fn add_exit_description(&self, description: &str) -> ExitStatus {
        let description = description.trim();
        if description.is_empty() || self.exit_description == description {
            return self.clone();
        }
        let exit_description = if self.exit_description.is_empty() {
            description.to_string()
        } else {
            format!("{}; {}", self.exit_description, description)
        };
        Self {
            exit_code: self.exit_code.clone(),
            exit_description,
        }
    }

    pub fn add_error_description(&self, error: &dyn std::error::Error) -> ExitStatus {
        self.add_exit_description(&error.to_string())
    }
}

impl Default for ExitStatus {
    fn default() -> Self {
        Self::executing()
    }
}

impl Ord for ExitStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.severity()
            .cmp(&other.severity())
            .then_with(|| self.exit_code.cmp(&other.exit_code))
    }
}

impl PartialOrd for ExitStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exit_description.is_empty() {
            write!(f, "{}", self.exit_code)
        } else {
            write!(f, "{} ({})", self.exit_code, self.exit_description)
        }
    }
}
