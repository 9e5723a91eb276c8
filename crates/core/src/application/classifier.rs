// Error classification by kind

use std::collections::HashMap;

use crate::domain::ItemError;

/// Maps an item error to a yes/no decision (retryable, skippable, ...).
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &ItemError) -> bool;
}

/// Kind-based classifier with a default for unregistered kinds.
///
/// The most specific registered kind wins: with `io => true` and
/// `io.corrupt => false`, an `io.timeout` error is `true` while
/// `io.corrupt.header` is `false`.
#[derive(Debug, Clone, Default)]
pub struct BinaryErrorClassifier {
    rules: HashMap<String, bool>,
    default: bool,
}

impl BinaryErrorClassifier {
    pub fn new(default: bool) -> Self {
        Self {
            rules: HashMap::new(),
            default,
        }
    }

    /// Classifier that answers `true` for exactly the given kinds.
    pub fn only<S: AsRef<str>>(kinds: &[S]) -> Self {
        let mut classifier = Self::new(false);
        for kind in kinds {
            classifier = classifier.with(kind.as_ref(), true);
        }
        classifier
    }

    pub fn with(mut self, kind: impl Into<String>, value: bool) -> Self {
        self.rules.insert(kind.into(), value);
        self
    }
}

impl ErrorClassifier for BinaryErrorClassifier {
    fn classify(&self, error: &ItemError) -> bool {
        self.rules
            .iter()
            .filter(|(kind, _)| error.is_kind(kind))
            .max_by_key(|(kind, _)| kind.len())
            .map(|(_, value)| *value)
            .unwrap_or(self.default)
    }
}
