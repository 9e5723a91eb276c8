// Flow execution status - the routing value produced by every state

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Open-ended status string whose family is decided by prefix.
///
/// Families rank COMPLETED < STOPPED < FAILED < UNKNOWN; anything that
/// starts with none of them ranks as COMPLETED.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowExecutionStatus(String);

const COMPLETED: &str = "COMPLETED";
const STOPPED: &str = "STOPPED";
const FAILED: &str = "FAILED";
const UNKNOWN: &str = "UNKNOWN";

impl FlowExecutionStatus {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn completed() -> Self {
        Self::new(COMPLETED)
    }

    pub fn stopped() -> Self {
        Self::new(STOPPED)
    }

    pub fn failed() -> Self {
        Self::new(FAILED)
    }

    pub fn unknown() -> Self {
        Self::new(UNKNOWN)
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    fn family(&self) -> u8 {
        if self.0.starts_with(UNKNOWN) {
            3
        } else if self.0.starts_with(FAILED) {
            2
        } else if self.0.starts_with(STOPPED) {
            1
        } else {
            0
        }
    }

    pub fn is_stop(&self) -> bool {
        self.0.starts_with(STOPPED)
    }

    pub fn is_fail(&self) -> bool {
        self.0.starts_with(FAILED)
    }

    pub fn is_complete(&self) -> bool {
        self.0.starts_with(COMPLETED)
    }

    pub fn is_end(&self) -> bool {
        self.is_stop() || self.is_fail() || self.is_complete()
    }
}

impl Ord for FlowExecutionStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.family()
            .cmp(&other.family())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for FlowExecutionStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for FlowExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of running a flow: the last state handled and its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowExecution {
    pub name: String,
    pub status: FlowExecutionStatus,
}

impl FlowExecution {
    pub fn new(name: impl Into<String>, status: FlowExecutionStatus) -> Self {
        Self {
            name: name.into(),
            status,
        }
    }
}
