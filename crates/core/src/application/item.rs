// Supplied item components and closure adapters

use async_trait::async_trait;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::domain::{ExecutionContext, ItemError};
use crate::port::{ItemProcessor, ItemReader, ItemStream, ItemWriter};

/// In-memory source. Restartable: the position is checkpointed under
/// `<name>.read.count`.
pub struct ListItemReader<T> {
    name: String,
    items: Vec<T>,
    position: AtomicUsize,
}

impl<T: Clone + Send + Sync> ListItemReader<T> {
    pub fn new(name: impl Into<String>, items: Vec<T>) -> Self {
        Self {
            name: name.into(),
            items,
            position: AtomicUsize::new(0),
        }
    }

    fn position_key(&self) -> String {
        format!("{}.read.count", self.name)
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemStream for ListItemReader<T> {
    async fn open(&self, context: &ExecutionContext) -> Result<(), ItemError> {
        let position = context.get_long_or(&self.position_key(), 0);
        let position = usize::try_from(position)
            .map_err(|_| ItemError::new("stream.open", format!("bad position {}", position)))?;
        self.position.store(position.min(self.items.len()), Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, context: &mut ExecutionContext) -> Result<(), ItemError> {
        context.put_long(self.position_key(), self.position() as i64);
        Ok(())
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemReader<T> for ListItemReader<T> {
    async fn read(&self) -> Result<Option<T>, ItemError> {
        let position = self.position.fetch_add(1, Ordering::SeqCst);
        match self.items.get(position) {
            Some(item) => Ok(Some(item.clone())),
            None => {
                self.position.store(self.items.len(), Ordering::SeqCst);
                Ok(None)
            }
        }
    }
}

/// Sink that keeps everything written to it.
pub struct ListItemWriter<T> {
    written: Mutex<Vec<T>>,
}

impl<T: Clone + Send + Sync> ListItemWriter<T> {
    pub fn new() -> Self {
        Self {
            written: Mutex::new(Vec::new()),
        }
    }

    pub async fn written(&self) -> Vec<T> {
        self.written.lock().await.clone()
    }
}

impl<T: Clone + Send + Sync> Default for ListItemWriter<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemStream for ListItemWriter<T> {}

#[async_trait]
impl<T: Clone + Send + Sync> ItemWriter<T> for ListItemWriter<T> {
    async fn write(&self, items: &[T]) -> Result<(), ItemError> {
        self.written.lock().await.extend_from_slice(items);
        Ok(())
    }
}

/// Sink backed by a closure over each batch.
pub struct FnItemWriter<T, F> {
    f: F,
    _items: PhantomData<fn(&T)>,
}

impl<T, F> FnItemWriter<T, F>
where
    F: Fn(&[T]) -> Result<(), ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _items: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> ItemStream for FnItemWriter<T, F>
where
    T: Send + Sync,
    F: Fn(&[T]) -> Result<(), ItemError> + Send + Sync,
{
}

#[async_trait]
impl<T, F> ItemWriter<T> for FnItemWriter<T, F>
where
    T: Send + Sync,
    F: Fn(&[T]) -> Result<(), ItemError> + Send + Sync,
{
    async fn write(&self, items: &[T]) -> Result<(), ItemError> {
        (self.f)(items)
    }
}

/// Hands every item through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughItemProcessor;

#[async_trait]
impl<T: Clone + Send + Sync> ItemProcessor<T, T> for PassThroughItemProcessor {
    async fn process(&self, item: &T) -> Result<Option<T>, ItemError> {
        Ok(Some(item.clone()))
    }
}

/// Transform backed by a closure. Returning `Ok(None)` filters the item.
pub struct FnItemProcessor<I, O, F> {
    f: F,
    _types: PhantomData<fn(&I) -> O>,
}

impl<I, O, F> FnItemProcessor<I, O, F>
where
    F: Fn(&I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _types: PhantomData,
        }
    }
}

#[async_trait]
impl<I, O, F> ItemProcessor<I, O> for FnItemProcessor<I, O, F>
where
    I: Send + Sync,
    O: Send,
    F: Fn(&I) -> Result<Option<O>, ItemError> + Send + Sync,
{
    async fn process(&self, item: &I) -> Result<Option<O>, ItemError> {
        (self.f)(item)
    }
}

/// Runs processors in order; the first filter ends the chain.
pub struct CompositeItemProcessor<T> {
    delegates: Vec<Arc<dyn ItemProcessor<T, T>>>,
}

impl<T: Send + Sync> CompositeItemProcessor<T> {
    pub fn new(delegates: Vec<Arc<dyn ItemProcessor<T, T>>>) -> Self {
        Self { delegates }
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ItemProcessor<T, T> for CompositeItemProcessor<T> {
    async fn process(&self, item: &T) -> Result<Option<T>, ItemError> {
        let mut current = item.clone();
        for delegate in &self.delegates {
            match delegate.process(&current).await? {
                Some(next) => current = next,
                None => return Ok(None),
            }
        }
        Ok(Some(current))
    }
}
