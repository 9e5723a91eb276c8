// Listener Ports - explicit callbacks at fixed lifecycle points
//
// Listeners are registered as ordered lists. `before_*`/`on_*` callbacks run
// in registration order and `after_*` callbacks in reverse order.

use async_trait::async_trait;

use crate::domain::{ExitStatus, ItemError, JobExecution, StepExecution};

#[async_trait]
pub trait JobExecutionListener: Send + Sync {
    async fn before_job(&self, _execution: &JobExecution) {}

    async fn after_job(&self, _execution: &JobExecution) {}
}

#[async_trait]
pub trait StepExecutionListener: Send + Sync {
    async fn before_step(&self, _execution: &StepExecution) {}

    /// May return an exit status to combine with the step's own.
    async fn after_step(&self, _execution: &StepExecution) -> Option<ExitStatus> {
        None
    }
}

/// Chunk boundary notifications, identified by step name and chunk number.
#[async_trait]
pub trait ChunkListener: Send + Sync {
    async fn before_chunk(&self, _step_name: &str, _chunk: u64) {}

    async fn after_chunk(&self, _step_name: &str, _chunk: u64) {}

    async fn after_chunk_error(&self, _step_name: &str, _chunk: u64, _error: &str) {}
}

#[async_trait]
pub trait ItemReadListener<T: Send + Sync>: Send + Sync {
    async fn before_read(&self) {}

    async fn after_read(&self, _item: &T) {}

    async fn on_read_error(&self, _error: &ItemError) {}
}

#[async_trait]
pub trait ItemProcessListener<I: Send + Sync, O: Send + Sync>: Send + Sync {
    async fn before_process(&self, _item: &I) {}

    async fn after_process(&self, _item: &I, _result: Option<&O>) {}

    async fn on_process_error(&self, _item: &I, _error: &ItemError) {}
}

#[async_trait]
pub trait ItemWriteListener<T: Send + Sync>: Send + Sync {
    async fn before_write(&self, _items: &[T]) {}

    async fn after_write(&self, _items: &[T]) {}

    async fn on_write_error(&self, _error: &ItemError, _items: &[T]) {}
}

#[async_trait]
pub trait SkipListener<I: Send + Sync, O: Send + Sync>: Send + Sync {
    async fn on_skip_in_read(&self, _error: &ItemError) {}

    async fn on_skip_in_process(&self, _item: &I, _error: &ItemError) {}

    async fn on_skip_in_write(&self, _item: &O, _error: &ItemError) {}
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Appends one line per callback to a shared journal.
    #[derive(Default)]
    pub struct JournalListener {
        name: String,
        journal: std::sync::Arc<Mutex<Vec<String>>>,
    }

    impl JournalListener {
        pub fn new(name: impl Into<String>, journal: std::sync::Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.into(),
                journal,
            }
        }

        fn record(&self, event: &str) {
            self.journal
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, event));
        }
    }

    #[async_trait]
    impl JobExecutionListener for JournalListener {
        async fn before_job(&self, _execution: &JobExecution) {
            self.record("before_job");
        }

        async fn after_job(&self, execution: &JobExecution) {
            self.record(&format!("after_job={}", execution.status));
        }
    }

    #[async_trait]
    impl StepExecutionListener for JournalListener {
        async fn before_step(&self, execution: &StepExecution) {
            self.record(&format!("before_step={}", execution.step_name));
        }

        async fn after_step(&self, execution: &StepExecution) -> Option<ExitStatus> {
            self.record(&format!("after_step={}", execution.step_name));
            None
        }
    }

    #[async_trait]
    impl ChunkListener for JournalListener {
        async fn after_chunk(&self, _step_name: &str, chunk: u64) {
            self.record(&format!("after_chunk={}", chunk));
        }
    }

    #[async_trait]
    impl<I: Send + Sync + std::fmt::Debug, O: Send + Sync + std::fmt::Debug> SkipListener<I, O>
        for JournalListener
    {
        async fn on_skip_in_read(&self, error: &ItemError) {
            self.record(&format!("skip_read={}", error.kind()));
        }

        async fn on_skip_in_process(&self, item: &I, _error: &ItemError) {
            self.record(&format!("skip_process={:?}", item));
        }

        async fn on_skip_in_write(&self, item: &O, _error: &ItemError) {
            self.record(&format!("skip_write={:?}", item));
        }
    }
}
