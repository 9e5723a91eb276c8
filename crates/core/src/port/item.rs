// Item Ports - sources, transforms and sinks consumed by the chunk engine

use crate::domain::{ExecutionContext, ItemError};
use crate::port::transaction::Transaction;
use async_trait::async_trait;

/// Optional checkpoint hooks of a source or sink.
///
/// `update` is called at every chunk commit with the step's context; a
/// restartable component stores its position there and restores it in
/// `open`.
#[async_trait]
pub trait ItemStream: Send + Sync {
    async fn open(&self, _context: &ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    async fn update(&self, _context: &mut ExecutionContext) -> Result<(), ItemError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ItemError> {
        Ok(())
    }
}

/// Item source. `Ok(None)` signals end of stream.
#[async_trait]
pub trait ItemReader<T: Send>: ItemStream {
    async fn read(&self) -> Result<Option<T>, ItemError>;
}

/// Item transform. `Ok(None)` filters the item out of the chunk.
#[async_trait]
pub trait ItemProcessor<I: Send + Sync, O: Send>: Send + Sync {
    async fn process(&self, item: &I) -> Result<Option<O>, ItemError>;
}

/// Item sink, all-or-nothing per call.
#[async_trait]
pub trait ItemWriter<T: Send + Sync>: ItemStream {
    async fn write(&self, items: &[T]) -> Result<(), ItemError>;

    /// Write inside the chunk's transaction.
    ///
    /// A sink that shares storage with the transaction overrides this and
    /// enlists its statements, so a rolled back attempt leaves nothing
    /// behind. The default ignores the transaction.
    async fn write_in(
        &self,
        items: &[T],
        _transaction: &mut dyn Transaction,
    ) -> Result<(), ItemError> {
        self.write(items).await
    }

    /// `true` when `write` only accepts a batch and confirms it later
    /// through `settle`.
    fn defers_writes(&self) -> bool {
        false
    }

    /// Confirm deferred writes and return how many items landed since the
    /// last call. With `wait` every outstanding batch is awaited; otherwise
    /// only finished ones are collected. A failed batch is returned as the
    /// error.
    async fn settle(&self, _wait: bool) -> Result<u64, ItemError> {
        Ok(0)
    }
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashMap;
    use std::hash::Hash;
    use std::sync::Mutex;

    /// Writer that rejects any batch containing a poisoned item.
    ///
    /// Each poisoned item fails `failures` times before it is accepted
    /// (`None` = always fails), so the same double covers both transient
    /// (retryable) and permanent (skippable) write faults.
    pub struct FlakyItemWriter<T> {
        kind: String,
        poison: Mutex<HashMap<T, Option<u32>>>,
        written: Mutex<Vec<T>>,
        calls: Mutex<usize>,
    }

    impl<T: Clone + Eq + Hash + Send + Sync> FlakyItemWriter<T> {
        pub fn new(kind: impl Into<String>) -> Self {
            Self {
                kind: kind.into(),
                poison: Mutex::new(HashMap::new()),
                written: Mutex::new(Vec::new()),
                calls: Mutex::new(0),
            }
        }

        pub fn always_fail_on(self, item: T) -> Self {
            self.poison.lock().unwrap().insert(item, None);
            self
        }

        pub fn fail_on(self, item: T, failures: u32) -> Self {
            self.poison.lock().unwrap().insert(item, Some(failures));
            self
        }

        pub fn written(&self) -> Vec<T> {
            self.written.lock().unwrap().clone()
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl<T: Clone + Eq + Hash + Send + Sync> ItemStream for FlakyItemWriter<T> {}

    #[async_trait]
    impl<T: Clone + Eq + Hash + Send + Sync> ItemWriter<T> for FlakyItemWriter<T> {
        async fn write(&self, items: &[T]) -> Result<(), ItemError> {
            *self.calls.lock().unwrap() += 1;
            let mut poison = self.poison.lock().unwrap();
            for item in items {
                if let Some(remaining) = poison.get_mut(item) {
                    match remaining {
                        None => return Err(ItemError::new(self.kind.clone(), "poisoned item")),
                        Some(0) => {}
                        Some(n) => {
                            *n -= 1;
                            return Err(ItemError::new(self.kind.clone(), "transient failure"));
                        }
                    }
                }
            }
            self.written.lock().unwrap().extend(items.iter().cloned());
            Ok(())
        }
    }

    /// Processor that fails on chosen inputs and filters others.
    pub struct ScriptedItemProcessor<T> {
        failing: Mutex<HashMap<T, (String, Option<u32>)>>,
        filtered: Vec<T>,
        calls: Mutex<usize>,
    }

    impl<T: Clone + Eq + Hash + Send + Sync> ScriptedItemProcessor<T> {
        pub fn new() -> Self {
            Self {
                failing: Mutex::new(HashMap::new()),
                filtered: Vec::new(),
                calls: Mutex::new(0),
            }
        }

        pub fn always_fail_on(self, item: T, kind: impl Into<String>) -> Self {
            self.failing
                .lock()
                .unwrap()
                .insert(item, (kind.into(), None));
            self
        }

        pub fn fail_on(self, item: T, kind: impl Into<String>, failures: u32) -> Self {
            self.failing
                .lock()
                .unwrap()
                .insert(item, (kind.into(), Some(failures)));
            self
        }

        pub fn filter(mut self, item: T) -> Self {
            self.filtered.push(item);
            self
        }

        pub fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl<T: Clone + Eq + Hash + Send + Sync> Default for ScriptedItemProcessor<T> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl<T: Clone + Eq + Hash + Send + Sync> ItemProcessor<T, T> for ScriptedItemProcessor<T> {
        async fn process(&self, item: &T) -> Result<Option<T>, ItemError> {
            *self.calls.lock().unwrap() += 1;
            if let Some((kind, remaining)) = self.failing.lock().unwrap().get_mut(item) {
                match remaining {
                    None => return Err(ItemError::new(kind.clone(), "cannot process")),
                    Some(0) => {}
                    Some(n) => {
                        *n -= 1;
                        return Err(ItemError::new(kind.clone(), "transient failure"));
                    }
                }
            }
            if self.filtered.contains(item) {
                return Ok(None);
            }
            Ok(Some(item.clone()))
        }
    }

    /// Reader over a script of results; an `Err` entry is returned once.
    pub struct ScriptedItemReader<T> {
        script: Mutex<std::collections::VecDeque<Result<T, ItemError>>>,
    }

    impl<T: Send> ScriptedItemReader<T> {
        pub fn new(script: Vec<Result<T, ItemError>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl<T: Send> ItemStream for ScriptedItemReader<T> {}

    #[async_trait]
    impl<T: Send> ItemReader<T> for ScriptedItemReader<T> {
        async fn read(&self) -> Result<Option<T>, ItemError> {
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(item)) => Ok(Some(item)),
                Some(Err(e)) => Err(e),
                None => Ok(None),
            }
        }
    }
}
