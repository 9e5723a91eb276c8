// Step and chunk contexts, passed explicitly through every call

use std::sync::Arc;

use crate::application::stop::StopSignal;
use crate::domain::{
    ExecutionContext, JobExecution, JobExecutionId, JobInstance, JobParameters, StepExecution,
    StepExecutionId,
};
use crate::error::Result;
use crate::port::{JobRepository, TimeProvider, Transaction, TransactionManager};

/// Everything a step needs to know about the job running it.
///
/// Created per step execution by the flow (or a partition handler) and
/// dropped when the step finishes.
#[derive(Clone)]
pub struct StepContext {
    job_execution_id: JobExecutionId,
    job_instance: JobInstance,
    job_parameters: JobParameters,
    job_context: ExecutionContext,
    stop_signal: StopSignal,
    repository: Arc<dyn JobRepository>,
    time_provider: Arc<dyn TimeProvider>,
}

impl StepContext {
    pub fn new(
        job_execution: &JobExecution,
        repository: Arc<dyn JobRepository>,
        time_provider: Arc<dyn TimeProvider>,
        stop_signal: StopSignal,
    ) -> Self {
        Self {
            job_execution_id: job_execution.id,
            job_instance: job_execution.instance.clone(),
            job_parameters: job_execution.parameters.clone(),
            job_context: job_execution.execution_context.clone(),
            stop_signal,
            repository,
            time_provider,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_instance.job_name
    }

    pub fn job_execution_id(&self) -> JobExecutionId {
        self.job_execution_id
    }

    pub fn job_instance(&self) -> &JobInstance {
        &self.job_instance
    }

    pub fn job_parameters(&self) -> &JobParameters {
        &self.job_parameters
    }

    /// Snapshot of the job execution context taken when the step started.
    pub fn job_context(&self) -> &ExecutionContext {
        &self.job_context
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop_signal
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn time_provider(&self) -> &Arc<dyn TimeProvider> {
        &self.time_provider
    }

    pub fn now(&self) -> i64 {
        self.time_provider.now_millis()
    }
}

/// Skips already committed by the step execution, per phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SkipCounts {
    pub read: u64,
    pub process: u64,
    pub write: u64,
}

impl SkipCounts {
    pub fn of(step_execution: &StepExecution) -> Self {
        Self {
            read: step_execution.read_skip_count,
            process: step_execution.process_skip_count,
            write: step_execution.write_skip_count,
        }
    }
}

/// The transaction of one chunk.
///
/// A rolled back attempt leaves no transaction behind; the next `active`
/// call begins a fresh one. Retried and scanned writes therefore each run
/// in their own unit of work, and the checkpoint commits with whatever
/// transaction is active when the chunk ends.
pub struct ChunkTransaction {
    manager: Arc<dyn TransactionManager>,
    current: Option<Box<dyn Transaction>>,
    rollbacks: u64,
}

impl ChunkTransaction {
    pub fn new(manager: Arc<dyn TransactionManager>) -> Self {
        Self {
            manager,
            current: None,
            rollbacks: 0,
        }
    }

    /// The open transaction, begun on first use.
    pub async fn active(&mut self) -> Result<&mut dyn Transaction> {
        let tx = match self.current.take() {
            Some(tx) => tx,
            None => self.manager.begin().await?,
        };
        Ok(&mut **self.current.insert(tx))
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub async fn commit(&mut self) -> Result<()> {
        match self.current.take() {
            Some(tx) => tx.commit().await,
            None => Ok(()),
        }
    }

    /// Roll back the open transaction, if any.
    pub async fn rollback(&mut self) -> Result<()> {
        match self.current.take() {
            Some(tx) => {
                self.rollbacks += 1;
                tx.rollback().await
            }
            None => Ok(()),
        }
    }

    /// Transactions rolled back so far in this chunk
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks
    }
}

/// View of one chunk (tasklet iteration) handed to a [`super::Tasklet`].
pub struct ChunkContext<'a> {
    step: &'a StepContext,
    step_name: &'a str,
    step_execution_id: StepExecutionId,
    chunk: u64,
    committed_skips: SkipCounts,
    transaction: &'a mut ChunkTransaction,
    /// Checkpoint state of the step execution, persisted at commit
    pub execution_context: &'a mut ExecutionContext,
}

impl<'a> ChunkContext<'a> {
    pub fn new(
        step: &'a StepContext,
        step_name: &'a str,
        step_execution_id: StepExecutionId,
        chunk: u64,
        committed_skips: SkipCounts,
        transaction: &'a mut ChunkTransaction,
        execution_context: &'a mut ExecutionContext,
    ) -> Self {
        Self {
            step,
            step_name,
            step_execution_id,
            chunk,
            committed_skips,
            transaction,
            execution_context,
        }
    }

    /// Transaction the chunk's writes and checkpoint run in
    pub fn transaction(&mut self) -> &mut ChunkTransaction {
        &mut *self.transaction
    }

    pub fn step(&self) -> &StepContext {
        self.step
    }

    pub fn step_name(&self) -> &str {
        self.step_name
    }

    pub fn step_execution_id(&self) -> StepExecutionId {
        self.step_execution_id
    }

    /// One-based number of this chunk within the step execution.
    pub fn chunk(&self) -> u64 {
        self.chunk
    }

    pub fn committed_skips(&self) -> SkipCounts {
        self.committed_skips
    }
}
