// Skip policies - decide whether a failed item is dropped or fails the step

use std::sync::Arc;

use crate::application::classifier::{BinaryErrorClassifier, ErrorClassifier};
use crate::domain::ItemError;
use crate::error::{AppError, Result};

pub trait SkipPolicy: Send + Sync {
    /// Is this error of a skippable kind, ignoring any limit?
    fn classifies(&self, error: &ItemError) -> bool;

    /// `Ok(true)` skips the item, `Ok(false)` rethrows the error.
    /// `skip_count` is the number of skips already taken in this phase.
    fn should_skip(&self, error: &ItemError, skip_count: u64) -> Result<bool>;
}

/// Skips classified errors until `limit` skips have been taken.
///
/// A skippable error arriving after the limit is used up fails with
/// `SkipLimitExceeded` rather than the item error itself.
pub struct LimitCheckingSkipPolicy {
    limit: u64,
    classifier: Arc<dyn ErrorClassifier>,
}

impl LimitCheckingSkipPolicy {
    pub fn new(limit: u64, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self { limit, classifier }
    }

    /// Skip only the listed error kinds.
    pub fn for_kinds<S: AsRef<str>>(limit: u64, kinds: &[S]) -> Self {
        Self::new(limit, Arc::new(BinaryErrorClassifier::only(kinds)))
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }
}

impl SkipPolicy for LimitCheckingSkipPolicy {
    fn classifies(&self, error: &ItemError) -> bool {
        self.classifier.classify(error)
    }

    fn should_skip(&self, error: &ItemError, skip_count: u64) -> Result<bool> {
        if !self.classifier.classify(error) {
            return Ok(false);
        }
        if skip_count < self.limit {
            Ok(true)
        } else {
            Err(AppError::SkipLimitExceeded {
                limit: self.limit,
                source: error.clone(),
            })
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlwaysSkipItemSkipPolicy;

impl SkipPolicy for AlwaysSkipItemSkipPolicy {
    fn classifies(&self, _error: &ItemError) -> bool {
        true
    }

    fn should_skip(&self, _error: &ItemError, _skip_count: u64) -> Result<bool> {
        Ok(true)
    }
}

#[derive(Debug, Clone, Default)]
pub struct NeverSkipItemSkipPolicy;

impl SkipPolicy for NeverSkipItemSkipPolicy {
    fn classifies(&self, _error: &ItemError) -> bool {
        false
    }

    fn should_skip(&self, _error: &ItemError, _skip_count: u64) -> Result<bool> {
        Ok(false)
    }
}
