// Item-level fault raised by readers, processors, writers and tasklets

use std::fmt;

/// Failure reported by a user-supplied item component.
///
/// `kind` is a dotted category such as `"io.timeout"`. Retry and skip
/// classifiers match on it by segment prefix, so a rule registered for
/// `"io"` also covers `"io.timeout"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    kind: String,
    message: String,
}

impl ItemError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if this error's kind equals `kind` or is nested beneath it.
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind == kind
            || (self.kind.starts_with(kind) && self.kind[kind.len()..].starts_with('.'))
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ItemError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_hierarchy() {
        let err = ItemError::new("io.timeout", "socket stalled");
        assert!(err.is_kind("io"));
        assert!(err.is_kind("io.timeout"));
        assert!(!err.is_kind("i"));
        assert!(!err.is_kind("io.timeout.read"));
        assert_eq!(err.to_string(), "io.timeout: socket stalled");
    }
}
