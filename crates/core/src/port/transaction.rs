// Transaction port for chunk boundaries

use crate::error::Result;
use async_trait::async_trait;
use std::any::Any;

/// One unit of work spanning a chunk's business write and its checkpoint.
///
/// Writers and repository backings that share the transaction's storage
/// downcast it through `as_any_mut` and run their statements on it.
#[async_trait]
pub trait Transaction: Send {
    /// Commit the transaction
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> Result<()>;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Opens a transaction per chunk.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Transaction>>;
}

/// No-op manager for sinks that are all-or-nothing on their own.
pub struct ResourcelessTransactionManager;

struct ResourcelessTransaction;

#[async_trait]
impl Transaction for ResourcelessTransaction {
    async fn commit(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[async_trait]
impl TransactionManager for ResourcelessTransactionManager {
    async fn begin(&self) -> Result<Box<dyn Transaction>> {
        Ok(Box::new(ResourcelessTransaction))
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts begin/commit/rollback calls.
    ///
    /// Every begun transaction ends exactly once, so after a step
    /// `begun() == commits() + rollbacks()`.
    #[derive(Default, Clone)]
    pub struct RecordingTransactionManager {
        pub begun: Arc<AtomicUsize>,
        pub committed: Arc<AtomicUsize>,
        pub rolled_back: Arc<AtomicUsize>,
    }

    impl RecordingTransactionManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn begun(&self) -> usize {
            self.begun.load(Ordering::SeqCst)
        }

        pub fn commits(&self) -> usize {
            self.committed.load(Ordering::SeqCst)
        }

        pub fn rollbacks(&self) -> usize {
            self.rolled_back.load(Ordering::SeqCst)
        }
    }

    struct RecordingTransaction {
        committed: Arc<AtomicUsize>,
        rolled_back: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Transaction for RecordingTransaction {
        async fn commit(self: Box<Self>) -> Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    #[async_trait]
    impl TransactionManager for RecordingTransactionManager {
        async fn begin(&self) -> Result<Box<dyn Transaction>> {
            self.begun.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(RecordingTransaction {
                committed: self.committed.clone(),
                rolled_back: self.rolled_back.clone(),
            }))
        }
    }
}
