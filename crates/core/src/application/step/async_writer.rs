// Asynchronous chunk writes with a bounded, ordered result queue

use async_trait::async_trait;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::application::constants::DEFAULT_THROTTLE_LIMIT;
use crate::domain::{ExecutionContext, ItemError};
use crate::error::{AppError, Result};
use crate::port::{ItemStream, ItemWriter};

/// Bounded queue of in-flight tasks whose results are taken in submission
/// order.
///
/// A slot is reserved before a task is spawned and released only when its
/// result is taken, so the producer can never run further ahead of its own
/// collection than the throttle limit.
pub struct ResultQueue<T> {
    slots: Arc<Semaphore>,
    pending: Mutex<VecDeque<(JoinHandle<T>, OwnedSemaphorePermit)>>,
}

impl<T: Send + 'static> ResultQueue<T> {
    pub fn new(throttle_limit: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(throttle_limit.max(1))),
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// No free slot: the next `submit` would wait for a `take`.
    pub fn is_full(&self) -> bool {
        self.slots.available_permits() == 0
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    /// Reserve a slot (waiting for one if needed) and spawn the task.
    pub async fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| AppError::Internal(format!("result queue closed: {}", e)))?;
        let handle = tokio::spawn(task);
        self.pending.lock().await.push_back((handle, permit));
        Ok(())
    }

    /// Wait for the oldest task. `None` when nothing is in flight.
    pub async fn take(&self) -> Option<Result<T>> {
        let (handle, _permit) = self.pending.lock().await.pop_front()?;
        Some(
            handle
                .await
                .map_err(|e| AppError::Internal(format!("queued task failed: {}", e))),
        )
    }

    /// Collect the leading run of already finished tasks without waiting.
    pub async fn take_finished(&self) -> Vec<Result<T>> {
        let mut ready = Vec::new();
        loop {
            let next = {
                let mut pending = self.pending.lock().await;
                match pending.front() {
                    Some((handle, _)) if handle.is_finished() => pending.pop_front(),
                    _ => None,
                }
            };
            let Some((handle, _permit)) = next else {
                return ready;
            };
            ready.push(
                handle
                    .await
                    .map_err(|e| AppError::Internal(format!("queued task failed: {}", e))),
            );
        }
    }
}

type WriteOutcome = std::result::Result<usize, ItemError>;

/// Confirmed items and the first failure not yet reported to the caller.
#[derive(Default)]
struct Settled {
    items: u64,
    failure: Option<ItemError>,
}

/// Writer that hands each batch to a background task.
///
/// `write` returns once the batch is queued and never reports an earlier
/// batch's failure. Outcomes are collected as tasks finish and handed out
/// by `settle`: the number of items confirmed since the last call, or the
/// first failure. `update` records how many batches were queued and how
/// many are confirmed so a checkpoint shows whether it covers unconfirmed
/// writes. `close` waits for all of them and reports a failure nobody has
/// settled.
pub struct AsyncItemWriter<T> {
    name: String,
    delegate: Arc<dyn ItemWriter<T>>,
    queue: ResultQueue<WriteOutcome>,
    expected: AtomicU64,
    actual: AtomicU64,
    settled: Mutex<Settled>,
}

impl<T> AsyncItemWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, delegate: Arc<dyn ItemWriter<T>>) -> Self {
        Self::with_throttle_limit(name, delegate, DEFAULT_THROTTLE_LIMIT)
    }

    pub fn with_throttle_limit(
        name: impl Into<String>,
        delegate: Arc<dyn ItemWriter<T>>,
        throttle_limit: usize,
    ) -> Self {
        Self {
            name: name.into(),
            delegate,
            queue: ResultQueue::new(throttle_limit),
            expected: AtomicU64::new(0),
            actual: AtomicU64::new(0),
            settled: Mutex::new(Settled::default()),
        }
    }

    fn expected_key(&self) -> String {
        format!("{}.async.expected", self.name)
    }

    fn actual_key(&self) -> String {
        format!("{}.async.actual", self.name)
    }

    /// Batches queued so far
    pub fn expected(&self) -> u64 {
        self.expected.load(Ordering::SeqCst)
    }

    /// Batches confirmed written
    pub fn actual(&self) -> u64 {
        self.actual.load(Ordering::SeqCst)
    }

    async fn record(&self, outcome: Result<WriteOutcome>) {
        let mut settled = self.settled.lock().await;
        match outcome {
            Ok(Ok(written)) => {
                self.actual.fetch_add(1, Ordering::SeqCst);
                settled.items += written as u64;
                debug!(writer = %self.name, items = written, "Asynchronous write confirmed");
            }
            Ok(Err(e)) => {
                warn!(writer = %self.name, error = %e, "Asynchronous write failed");
                settled.failure.get_or_insert(e);
            }
            Err(e) => {
                settled
                    .failure
                    .get_or_insert(ItemError::new("write.async", e.to_string()));
            }
        }
    }

    async fn collect_finished(&self) {
        for outcome in self.queue.take_finished().await {
            self.record(outcome).await;
        }
    }

    async fn drain(&self) {
        while let Some(outcome) = self.queue.take().await {
            self.record(outcome).await;
        }
    }

    async fn take_settled(&self) -> std::result::Result<u64, ItemError> {
        let mut settled = self.settled.lock().await;
        let items = std::mem::take(&mut settled.items);
        match settled.failure.take() {
            Some(e) => Err(e),
            None => Ok(items),
        }
    }
}

#[async_trait]
impl<T> ItemStream for AsyncItemWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn open(&self, context: &ExecutionContext) -> std::result::Result<(), ItemError> {
        let expected = context.get_long_or(&self.expected_key(), 0);
        let actual = context.get_long_or(&self.actual_key(), 0);
        if expected > actual {
            warn!(
                writer = %self.name,
                expected,
                actual,
                "Previous run checkpointed unconfirmed asynchronous writes"
            );
        }
        self.delegate.open(context).await
    }

    async fn update(&self, context: &mut ExecutionContext) -> std::result::Result<(), ItemError> {
        self.collect_finished().await;
        context.put_long(self.expected_key(), self.expected() as i64);
        context.put_long(self.actual_key(), self.actual() as i64);
        self.delegate.update(context).await
    }

    async fn close(&self) -> std::result::Result<(), ItemError> {
        self.drain().await;
        self.delegate.close().await?;
        match self.settled.lock().await.failure.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl<T> ItemWriter<T> for AsyncItemWriter<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn write(&self, items: &[T]) -> std::result::Result<(), ItemError> {
        self.collect_finished().await;
        while self.queue.is_full() {
            match self.queue.take().await {
                Some(outcome) => self.record(outcome).await,
                None => break,
            }
        }

        let batch = items.to_vec();
        let delegate = self.delegate.clone();
        self.queue
            .submit(async move { delegate.write(&batch).await.map(|()| batch.len()) })
            .await
            .map_err(|e| ItemError::new("write.async", e.to_string()))?;
        self.expected.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn defers_writes(&self) -> bool {
        true
    }

    async fn settle(&self, wait: bool) -> std::result::Result<u64, ItemError> {
        if wait {
            self.drain().await;
        } else {
            self.collect_finished().await;
        }
        self.take_settled().await
    }
}
