// Chunk-oriented processing: read a chunk, process it, write it as one batch
//
// Fault handling per phase:
// - read: errors are skipped or fail the chunk (no retry, the source owns
//   its position)
// - process: each item is retried under the retry template; once retry is
//   exhausted a skippable error drops the item
// - write: the whole batch is retried, each attempt in a fresh transaction;
//   once retry is exhausted a skippable error switches to scan mode, which
//   writes items one by one, each in its own transaction, to isolate and
//   skip the faulty ones

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::SkipCounts;
use super::{ChunkContext, Tasklet, TaskletStep, TaskletStepBuilder};
use crate::application::constants::DEFAULT_CHUNK_SIZE;
use crate::application::item::PassThroughItemProcessor;
use crate::application::repeat::{CompletionPolicy, RepeatStatus, SimpleCompletionPolicy};
use crate::application::retry::{RetryDecision, RetryTemplate};
use crate::application::skip::{LimitCheckingSkipPolicy, NeverSkipItemSkipPolicy, SkipPolicy};
use crate::domain::{ItemError, StepContribution};
use crate::error::{AppError, Result};
use crate::port::{
    ChunkListener, ItemProcessListener, ItemProcessor, ItemReadListener, ItemReader,
    ItemStream, ItemWriteListener, ItemWriter, SkipListener, StepExecutionListener,
    TransactionManager,
};

/// Retry and skip configuration of a chunk step.
#[derive(Clone)]
pub struct FaultTolerance {
    pub retry: RetryTemplate,
    pub read_skip: Arc<dyn SkipPolicy>,
    pub process_skip: Arc<dyn SkipPolicy>,
    pub write_skip: Arc<dyn SkipPolicy>,
}

impl FaultTolerance {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            retry: RetryTemplate::never(),
            read_skip: Arc::new(NeverSkipItemSkipPolicy),
            process_skip: Arc::new(NeverSkipItemSkipPolicy),
            write_skip: Arc::new(NeverSkipItemSkipPolicy),
        }
    }
}

impl Default for FaultTolerance {
    fn default() -> Self {
        Self::none()
    }
}

struct ChunkListeners<I: Send + Sync, O: Send + Sync> {
    read: Vec<Arc<dyn ItemReadListener<I>>>,
    process: Vec<Arc<dyn ItemProcessListener<I, O>>>,
    write: Vec<Arc<dyn ItemWriteListener<O>>>,
    skip: Vec<Arc<dyn SkipListener<I, O>>>,
}

impl<I: Send + Sync, O: Send + Sync> Default for ChunkListeners<I, O> {
    fn default() -> Self {
        Self {
            read: Vec::new(),
            process: Vec::new(),
            write: Vec::new(),
            skip: Vec::new(),
        }
    }
}

/// The chunk engine as a [`Tasklet`]: one call reads, processes and writes
/// one chunk, and reports `Finished` once the source is exhausted.
pub struct ChunkOrientedTasklet<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    reader: Arc<dyn ItemReader<I>>,
    processor: Arc<dyn ItemProcessor<I, O>>,
    writer: Arc<dyn ItemWriter<O>>,
    completion: Arc<dyn CompletionPolicy>,
    fault: FaultTolerance,
    listeners: ChunkListeners<I, O>,
}

impl<I, O> ChunkOrientedTasklet<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Pull items until the completion policy is satisfied or the source
    /// ends. Returns the buffered inputs and whether the end was reached.
    async fn provide(
        &self,
        contribution: &mut StepContribution,
        committed: SkipCounts,
    ) -> Result<(Vec<I>, bool)> {
        let mut repeat = self.completion.start();
        let mut inputs = Vec::new();

        while !self.completion.is_complete(&repeat) {
            for listener in &self.listeners.read {
                listener.before_read().await;
            }
            match self.reader.read().await {
                Ok(Some(item)) => {
                    for listener in self.listeners.read.iter().rev() {
                        listener.after_read(&item).await;
                    }
                    contribution.increment_read_count();
                    inputs.push(item);
                    self.completion.update(&mut repeat);
                }
                Ok(None) => return Ok((inputs, true)),
                Err(error) => {
                    for listener in &self.listeners.read {
                        listener.on_read_error(&error).await;
                    }
                    let skips = committed.read + contribution.read_skip_count;
                    if !self.fault.read_skip.should_skip(&error, skips)? {
                        return Err(AppError::Item(error));
                    }
                    warn!(kind = error.kind(), "Skipping unreadable item: {}", error);
                    contribution.increment_read_skip_count();
                    for listener in &self.listeners.skip {
                        listener.on_skip_in_read(&error).await;
                    }
                }
            }
        }
        Ok((inputs, false))
    }

    async fn process(
        &self,
        inputs: &[I],
        contribution: &mut StepContribution,
        committed: SkipCounts,
    ) -> Result<Vec<O>> {
        let mut outputs = Vec::with_capacity(inputs.len());

        for item in inputs {
            let mut retry = self.fault.retry.start();
            loop {
                for listener in &self.listeners.process {
                    listener.before_process(item).await;
                }
                let error = match self.processor.process(item).await {
                    Ok(output) => {
                        for listener in self.listeners.process.iter().rev() {
                            listener.after_process(item, output.as_ref()).await;
                        }
                        match output {
                            Some(output) => outputs.push(output),
                            None => contribution.increment_filter_count(1),
                        }
                        break;
                    }
                    Err(error) => error,
                };

                for listener in &self.listeners.process {
                    listener.on_process_error(item, &error).await;
                }
                if let RetryDecision::Retry(_) = retry.on_error(&error).await {
                    continue;
                }

                let skips = committed.process + contribution.process_skip_count;
                if !self.fault.process_skip.should_skip(&error, skips)? {
                    return Err(AppError::Item(error));
                }
                warn!(kind = error.kind(), "Skipping item that failed processing: {}", error);
                contribution.increment_process_skip_count();
                for listener in &self.listeners.skip {
                    listener.on_skip_in_process(item, &error).await;
                }
                break;
            }
        }
        Ok(outputs)
    }

    async fn write(
        &self,
        outputs: &[O],
        contribution: &mut StepContribution,
        chunk: &mut ChunkContext<'_>,
        committed: SkipCounts,
    ) -> Result<()> {
        if outputs.is_empty() {
            return Ok(());
        }

        let mut retry = self.fault.retry.start();
        loop {
            let error = match self.write_batch(outputs, chunk).await? {
                Ok(()) => {
                    self.count_written(contribution, outputs.len());
                    return Ok(());
                }
                Err(error) => error,
            };
            // Whatever the failed attempt wrote goes with its transaction.
            chunk.transaction().rollback().await?;

            if let RetryDecision::Retry(_) = retry.on_error(&error).await {
                continue;
            }
            if !self.fault.write_skip.classifies(&error) {
                return Err(AppError::Item(error));
            }
            warn!(
                kind = error.kind(),
                items = outputs.len(),
                "Write failed, scanning chunk item by item"
            );
            return self.scan(outputs, contribution, chunk, committed).await;
        }
    }

    /// Hand `items` to the writer inside the chunk's active transaction.
    /// The outer `Result` carries transaction failures, the inner one the
    /// writer's.
    async fn write_batch(
        &self,
        items: &[O],
        chunk: &mut ChunkContext<'_>,
    ) -> Result<std::result::Result<(), ItemError>> {
        for listener in &self.listeners.write {
            listener.before_write(items).await;
        }
        let tx = chunk.transaction().active().await?;
        match self.writer.write_in(items, tx).await {
            Ok(()) => {
                for listener in self.listeners.write.iter().rev() {
                    listener.after_write(items).await;
                }
                Ok(Ok(()))
            }
            Err(error) => {
                for listener in &self.listeners.write {
                    listener.on_write_error(&error, items).await;
                }
                Ok(Err(error))
            }
        }
    }

    /// Write one item per transaction, skipping the ones that still fail.
    async fn scan(
        &self,
        outputs: &[O],
        contribution: &mut StepContribution,
        chunk: &mut ChunkContext<'_>,
        committed: SkipCounts,
    ) -> Result<()> {
        for item in outputs {
            match self.write_batch(std::slice::from_ref(item), chunk).await? {
                Ok(()) => {
                    chunk.transaction().commit().await?;
                    self.count_written(contribution, 1);
                }
                Err(error) => {
                    chunk.transaction().rollback().await?;
                    let skips = committed.write + contribution.write_skip_count;
                    if !self.fault.write_skip.should_skip(&error, skips)? {
                        return Err(AppError::Item(error));
                    }
                    warn!(kind = error.kind(), "Skipping item that failed writing: {}", error);
                    contribution.increment_write_skip_count();
                    for listener in &self.listeners.skip {
                        listener.on_skip_in_write(item, &error).await;
                    }
                }
            }
        }
        Ok(())
    }

    /// Deferred writers are counted when `settle` confirms them.
    fn count_written(&self, contribution: &mut StepContribution, items: usize) {
        if !self.writer.defers_writes() {
            contribution.increment_write_count(items as u64);
        }
    }

    /// Collect confirmed deferred writes. A failed earlier batch fails this
    /// chunk: it is not a fault of the items being written now.
    async fn settle(&self, contribution: &mut StepContribution, wait: bool) -> Result<()> {
        if !self.writer.defers_writes() {
            return Ok(());
        }
        let landed = self.writer.settle(wait).await.map_err(AppError::Item)?;
        contribution.increment_write_count(landed);
        Ok(())
    }
}

#[async_trait]
impl<I, O> Tasklet for ChunkOrientedTasklet<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    async fn execute(
        &self,
        contribution: &mut StepContribution,
        chunk: &mut ChunkContext<'_>,
    ) -> Result<RepeatStatus> {
        let committed = chunk.committed_skips();
        let (inputs, exhausted) = self.provide(contribution, committed).await?;
        let outputs = self.process(&inputs, contribution, committed).await?;
        self.settle(contribution, false).await?;
        self.write(&outputs, contribution, chunk, committed).await?;
        if exhausted {
            // The last commit must not cover writes that may still fail.
            self.settle(contribution, true).await?;
        }

        debug!(
            step = chunk.step_name(),
            chunk = chunk.chunk(),
            read = inputs.len(),
            written = contribution.write_count,
            exhausted,
            "Chunk processed"
        );
        Ok(RepeatStatus::continue_if(!exhausted))
    }
}

/// Builds a [`TaskletStep`] around a [`ChunkOrientedTasklet`].
pub struct ChunkStepBuilder<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    step: TaskletStepBuilder,
    completion: Arc<dyn CompletionPolicy>,
    reader: Option<Arc<dyn ItemReader<I>>>,
    processor: Option<Arc<dyn ItemProcessor<I, O>>>,
    writer: Option<Arc<dyn ItemWriter<O>>>,
    fault: FaultTolerance,
    listeners: ChunkListeners<I, O>,
}

impl<I, O> ChunkStepBuilder<I, O>
where
    I: Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            step: TaskletStepBuilder::new(name),
            completion: Arc::new(SimpleCompletionPolicy::new(DEFAULT_CHUNK_SIZE)),
            reader: None,
            processor: None,
            writer: None,
            fault: FaultTolerance::none(),
            listeners: ChunkListeners::default(),
        }
    }

    /// Commit interval
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.completion = Arc::new(SimpleCompletionPolicy::new(size));
        self
    }

    pub fn completion_policy(mut self, policy: Arc<dyn CompletionPolicy>) -> Self {
        self.completion = policy;
        self
    }

    /// The reader is also registered as a stream of the step.
    pub fn reader<R: ItemReader<I> + 'static>(mut self, reader: Arc<R>) -> Self {
        let stream: Arc<dyn ItemStream> = reader.clone();
        self.step = self.step.stream(stream);
        self.reader = Some(reader);
        self
    }

    pub fn processor<P: ItemProcessor<I, O> + 'static>(mut self, processor: Arc<P>) -> Self {
        self.processor = Some(processor);
        self
    }

    /// The writer is also registered as a stream of the step.
    pub fn writer<W: ItemWriter<O> + 'static>(mut self, writer: Arc<W>) -> Self {
        let stream: Arc<dyn ItemStream> = writer.clone();
        self.step = self.step.stream(stream);
        self.writer = Some(writer);
        self
    }

    pub fn fault_tolerance(mut self, fault: FaultTolerance) -> Self {
        self.fault = fault;
        self
    }

    pub fn retry(mut self, retry: RetryTemplate) -> Self {
        self.fault.retry = retry;
        self
    }

    /// Same skip rule for every phase, each phase counting its own skips.
    pub fn skip_limit<S: AsRef<str>>(mut self, limit: u64, kinds: &[S]) -> Self {
        let policy: Arc<dyn SkipPolicy> = Arc::new(LimitCheckingSkipPolicy::for_kinds(limit, kinds));
        self.fault.read_skip = policy.clone();
        self.fault.process_skip = policy.clone();
        self.fault.write_skip = policy;
        self
    }

    pub fn read_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.fault.read_skip = policy;
        self
    }

    pub fn process_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.fault.process_skip = policy;
        self
    }

    pub fn write_skip_policy(mut self, policy: Arc<dyn SkipPolicy>) -> Self {
        self.fault.write_skip = policy;
        self
    }

    pub fn read_listener(mut self, listener: Arc<dyn ItemReadListener<I>>) -> Self {
        self.listeners.read.push(listener);
        self
    }

    pub fn process_listener(mut self, listener: Arc<dyn ItemProcessListener<I, O>>) -> Self {
        self.listeners.process.push(listener);
        self
    }

    pub fn write_listener(mut self, listener: Arc<dyn ItemWriteListener<O>>) -> Self {
        self.listeners.write.push(listener);
        self
    }

    pub fn skip_listener(mut self, listener: Arc<dyn SkipListener<I, O>>) -> Self {
        self.listeners.skip.push(listener);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.step = self.step.listener(listener);
        self
    }

    pub fn chunk_listener(mut self, listener: Arc<dyn ChunkListener>) -> Self {
        self.step = self.step.chunk_listener(listener);
        self
    }

    pub fn stream(mut self, stream: Arc<dyn ItemStream>) -> Self {
        self.step = self.step.stream(stream);
        self
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.step = self.step.start_limit(start_limit);
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.step = self.step.allow_start_if_complete(allow);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.step = self.step.transaction_manager(manager);
        self
    }

    pub fn build(self) -> Result<TaskletStep> {
        let name = self.step.name().to_string();
        let missing = |what: &str| AppError::Config(format!("chunk step '{}' has no {}", name, what));

        let tasklet = ChunkOrientedTasklet {
            reader: self.reader.ok_or_else(|| missing("reader"))?,
            processor: self.processor.ok_or_else(|| missing("processor"))?,
            writer: self.writer.ok_or_else(|| missing("writer"))?,
            completion: self.completion,
            fault: self.fault,
            listeners: self.listeners,
        };
        self.step.tasklet(Arc::new(tasklet)).build()
    }
}

impl<T> ChunkStepBuilder<T, T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Write items exactly as read.
    pub fn pass_through(self) -> Self {
        self.processor(Arc::new(PassThroughItemProcessor))
    }
}
