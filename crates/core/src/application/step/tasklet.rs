// Tasklet step - repeat a tasklet, one transaction per iteration

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::context::{ChunkTransaction, SkipCounts};
use super::{run_lifecycle, ChunkContext, Step, StepContext, StepSettings, StepWork};
use crate::application::repeat::RepeatStatus;
use crate::domain::{BatchStatus, StepContribution, StepExecution};
use crate::error::{AppError, Result};
use crate::port::{
    ChunkListener, ItemStream, ResourcelessTransactionManager, StepExecutionListener,
    TransactionManager,
};

/// Single-call unit of step work, invoked until it reports `Finished`.
#[async_trait]
pub trait Tasklet: Send + Sync {
    async fn execute(
        &self,
        contribution: &mut StepContribution,
        chunk: &mut ChunkContext<'_>,
    ) -> Result<RepeatStatus>;
}

type TaskletFn =
    dyn Fn(&mut StepContribution, &mut ChunkContext<'_>) -> Result<RepeatStatus> + Send + Sync;

/// Tasklet backed by a plain closure.
pub struct FnTasklet {
    f: Box<TaskletFn>,
}

impl FnTasklet {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&mut StepContribution, &mut ChunkContext<'_>) -> Result<RepeatStatus>
            + Send
            + Sync
            + 'static,
    {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Tasklet for FnTasklet {
    async fn execute(
        &self,
        contribution: &mut StepContribution,
        chunk: &mut ChunkContext<'_>,
    ) -> Result<RepeatStatus> {
        (self.f)(contribution, chunk)
    }
}

/// Step that drives a [`Tasklet`] until it is finished.
///
/// Each iteration runs inside its own transaction: the tasklet's work, the
/// stream checkpoints and the step execution update commit together, or the
/// whole iteration rolls back and the step fails. A tasklet may roll back
/// and restart the transaction through its [`ChunkContext`]; those
/// rollbacks are counted as well.
pub struct TaskletStep {
    settings: StepSettings,
    tasklet: Arc<dyn Tasklet>,
    transaction_manager: Arc<dyn TransactionManager>,
    chunk_listeners: Vec<Arc<dyn ChunkListener>>,
}

impl TaskletStep {
    pub fn builder(name: impl Into<String>) -> TaskletStepBuilder {
        TaskletStepBuilder::new(name)
    }

    pub fn settings(&self) -> &StepSettings {
        &self.settings
    }

    /// Observe stop requests at the chunk boundary.
    async fn check_interrupted(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<()> {
        let status = context
            .repository()
            .get_job_execution_status(context.job_execution_id())
            .await?;
        if status == Some(BatchStatus::Stopping) {
            step_execution.terminate_only = true;
        }

        let signal = context.stop_signal();
        if step_execution.terminate_only || signal.is_stop_requested() {
            signal.observe();
            return Err(AppError::JobInterrupted(format!(
                "step '{}' stopped after {} commits",
                self.settings.name, step_execution.commit_count
            )));
        }
        Ok(())
    }

    async fn rollback(
        &self,
        transaction: &mut ChunkTransaction,
        step_execution: &mut StepExecution,
        chunk: u64,
        cause: &AppError,
    ) {
        if let Err(e) = transaction.rollback().await {
            error!(step = %self.settings.name, error = %e, "Rollback failed");
        }
        step_execution.rollback_count += transaction.rollbacks();
        warn!(
            step = %self.settings.name,
            chunk,
            error = %cause,
            "Chunk rolled back"
        );
        let rendered = cause.to_string();
        for listener in self.chunk_listeners.iter().rev() {
            listener
                .after_chunk_error(&self.settings.name, chunk, &rendered)
                .await;
        }
    }

    async fn update_streams(&self, step_execution: &mut StepExecution) -> Result<()> {
        for stream in &self.settings.streams {
            stream
                .update(&mut step_execution.execution_context)
                .await
                .map_err(AppError::Item)?;
        }
        Ok(())
    }
}

#[async_trait]
impl StepWork for TaskletStep {
    async fn do_execute(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<()> {
        let name = self.settings.name.as_str();
        let mut chunk = 0u64;

        loop {
            self.check_interrupted(step_execution, context).await?;
            chunk += 1;

            for listener in &self.chunk_listeners {
                listener.before_chunk(name, chunk).await;
            }

            let mut transaction = ChunkTransaction::new(self.transaction_manager.clone());
            transaction.active().await?;
            let mut contribution = StepContribution::new();
            let step_execution_id = step_execution.id;
            let committed_skips = SkipCounts::of(step_execution);
            let outcome = {
                let mut chunk_context = ChunkContext::new(
                    context,
                    name,
                    step_execution_id,
                    chunk,
                    committed_skips,
                    &mut transaction,
                    &mut step_execution.execution_context,
                );
                self.tasklet
                    .execute(&mut contribution, &mut chunk_context)
                    .await
            };

            let status = match outcome {
                Ok(status) => status,
                Err(e) => {
                    self.rollback(&mut transaction, step_execution, chunk, &e)
                        .await;
                    return Err(e);
                }
            };

            if let Err(e) = self.update_streams(step_execution).await {
                self.rollback(&mut transaction, step_execution, chunk, &e)
                    .await;
                return Err(e);
            }

            step_execution.apply(&contribution);
            step_execution.commit_count += 1;
            step_execution.rollback_count += transaction.rollbacks();

            // Checkpoint and business write succeed or fail together.
            let checkpoint = match transaction.active().await {
                Ok(tx) => {
                    context
                        .repository()
                        .update_step_execution_in(step_execution, tx)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = checkpoint {
                if let Err(rollback_error) = transaction.rollback().await {
                    error!(step = name, error = %rollback_error, "Rollback failed");
                }
                step_execution.status = BatchStatus::Unknown;
                error!(
                    step = name,
                    chunk,
                    error = %e,
                    "Checkpoint update failed, step state is unknown"
                );
                return Err(e);
            }
            if let Err(e) = transaction.commit().await {
                step_execution.status = BatchStatus::Unknown;
                error!(step = name, chunk, error = %e, "Commit failed after checkpoint");
                return Err(e);
            }

            debug!(
                step = name,
                chunk,
                read = contribution.read_count,
                written = contribution.write_count,
                "Chunk committed"
            );
            for listener in self.chunk_listeners.iter().rev() {
                listener.after_chunk(name, chunk).await;
            }

            if !status.is_continuable() {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Step for TaskletStep {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn start_limit(&self) -> u32 {
        self.settings.start_limit
    }

    fn allow_start_if_complete(&self) -> bool {
        self.settings.allow_start_if_complete
    }

    async fn execute(
        &self,
        step_execution: &mut StepExecution,
        context: &StepContext,
    ) -> Result<()> {
        run_lifecycle(self, &self.settings, step_execution, context).await
    }
}

pub struct TaskletStepBuilder {
    settings: StepSettings,
    tasklet: Option<Arc<dyn Tasklet>>,
    transaction_manager: Arc<dyn TransactionManager>,
    chunk_listeners: Vec<Arc<dyn ChunkListener>>,
}

impl TaskletStepBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            settings: StepSettings::new(name),
            tasklet: None,
            transaction_manager: Arc::new(ResourcelessTransactionManager),
            chunk_listeners: Vec::new(),
        }
    }

    pub fn tasklet(mut self, tasklet: Arc<dyn Tasklet>) -> Self {
        self.tasklet = Some(tasklet);
        self
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.settings.start_limit = start_limit;
        self
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.settings.allow_start_if_complete = allow;
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.settings.listeners.push(listener);
        self
    }

    pub fn chunk_listener(mut self, listener: Arc<dyn ChunkListener>) -> Self {
        self.chunk_listeners.push(listener);
        self
    }

    pub fn stream(mut self, stream: Arc<dyn ItemStream>) -> Self {
        self.settings.streams.push(stream);
        self
    }

    pub fn transaction_manager(mut self, manager: Arc<dyn TransactionManager>) -> Self {
        self.transaction_manager = manager;
        self
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn build(self) -> Result<TaskletStep> {
        let tasklet = self.tasklet.ok_or_else(|| {
            AppError::Config(format!("step '{}' has no tasklet", self.settings.name))
        })?;
        Ok(TaskletStep {
            settings: self.settings,
            tasklet,
            transaction_manager: self.transaction_manager,
            chunk_listeners: self.chunk_listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fixtures::Fixture;
    use crate::domain::ExitStatus;
    use crate::port::listener::mocks::JournalListener;
    use crate::port::transaction::mocks::RecordingTransactionManager;
    use crate::port::JobRepository;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn counting_tasklet(iterations: u32) -> Arc<dyn Tasklet> {
        let calls = AtomicU32::new(0);
        Arc::new(FnTasklet::new(move |contribution, chunk| {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            contribution.increment_write_count(1);
            chunk.execution_context.put_long("iterations", n as i64);
            Ok(RepeatStatus::continue_if(n < iterations))
        }))
    }

    #[tokio::test]
    async fn test_repeats_until_finished() {
        let fixture = Fixture::new("job").await;
        let tx = RecordingTransactionManager::new();
        let journal = Arc::new(Mutex::new(Vec::new()));
        let step = TaskletStep::builder("count")
            .tasklet(counting_tasklet(3))
            .transaction_manager(Arc::new(tx.clone()))
            .listener(Arc::new(JournalListener::new("l", journal.clone())))
            .chunk_listener(Arc::new(JournalListener::new("c", journal.clone())))
            .build()
            .unwrap();

        let mut execution = fixture.step_execution("count").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.exit_code(), "COMPLETED");
        assert_eq!(execution.commit_count, 3);
        assert_eq!(execution.write_count, 3);
        assert_eq!(execution.execution_context.get_long("iterations"), Some(3));
        assert_eq!(tx.commits(), 3);
        assert!(execution.end_time.is_some());

        let stored = fixture
            .repository
            .get_step_execution(fixture.job_execution.id, execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.commit_count, 3);

        let journal = journal.lock().unwrap();
        assert_eq!(journal.first().map(String::as_str), Some("l:before_step=count"));
        assert_eq!(journal.last().map(String::as_str), Some("l:after_step=count"));
        assert_eq!(
            journal.iter().filter(|e| e.starts_with("c:after_chunk")).count(),
            3
        );
    }

    #[tokio::test]
    async fn test_tasklet_error_fails_step_and_rolls_back() {
        let fixture = Fixture::new("job").await;
        let tx = RecordingTransactionManager::new();
        let step = TaskletStep::builder("boom")
            .tasklet(Arc::new(FnTasklet::new(|_, _| {
                Err(AppError::Execution("boom".into()))
            })))
            .transaction_manager(Arc::new(tx.clone()))
            .build()
            .unwrap();

        let mut execution = fixture.step_execution("boom").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.exit_code(), "FAILED");
        assert!(execution.exit_status.exit_description().contains("boom"));
        assert_eq!(execution.rollback_count, 1);
        assert_eq!(execution.commit_count, 0);
        assert_eq!(tx.rollbacks(), 1);
        assert_eq!(execution.failure_exceptions.len(), 1);
    }

    /// Abandons its first attempt and redoes the work in a new transaction.
    struct SecondAttemptTasklet;

    #[async_trait]
    impl Tasklet for SecondAttemptTasklet {
        async fn execute(
            &self,
            contribution: &mut StepContribution,
            chunk: &mut ChunkContext<'_>,
        ) -> Result<RepeatStatus> {
            chunk.transaction().active().await?;
            chunk.transaction().rollback().await?;
            assert!(!chunk.transaction().is_active());
            chunk.transaction().active().await?;
            contribution.increment_write_count(1);
            Ok(RepeatStatus::Finished)
        }
    }

    #[tokio::test]
    async fn test_rollbacks_inside_chunk_are_counted() {
        let fixture = Fixture::new("job").await;
        let tx = RecordingTransactionManager::new();
        let step = TaskletStep::builder("redo")
            .tasklet(Arc::new(SecondAttemptTasklet))
            .transaction_manager(Arc::new(tx.clone()))
            .build()
            .unwrap();

        let mut execution = fixture.step_execution("redo").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.commit_count, 1);
        assert_eq!(execution.write_count, 1);
        assert_eq!(execution.rollback_count, 1);
        assert_eq!((tx.begun(), tx.commits(), tx.rollbacks()), (2, 1, 1));
    }

    #[tokio::test]
    async fn test_stop_signal_stops_at_chunk_boundary() {
        let fixture = Fixture::new("job").await;
        let signal = fixture.stop_signal.clone();
        let step = TaskletStep::builder("endless")
            .tasklet(Arc::new(FnTasklet::new(move |_, chunk| {
                if chunk.chunk() == 2 {
                    signal.request();
                }
                Ok(RepeatStatus::Continuable)
            })))
            .build()
            .unwrap();

        let mut execution = fixture.step_execution("endless").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.exit_code(), "STOPPED");
        assert_eq!(execution.commit_count, 2);
        assert!(fixture.stop_signal.is_observed());
    }

    #[tokio::test]
    async fn test_stopping_job_sets_terminate_only() {
        let fixture = Fixture::new("job").await;
        let mut job = fixture.job_execution.clone();
        job.status = BatchStatus::Stopping;
        fixture.repository.update_job_execution(&mut job).await.unwrap();

        let step = TaskletStep::builder("count")
            .tasklet(counting_tasklet(5))
            .build()
            .unwrap();
        let mut execution = fixture.step_execution("count").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert!(execution.terminate_only);
        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.commit_count, 0);
    }

    #[tokio::test]
    async fn test_after_step_listener_replaces_exit_status() {
        struct Relabel;

        #[async_trait]
        impl StepExecutionListener for Relabel {
            async fn after_step(&self, _execution: &StepExecution) -> Option<ExitStatus> {
                Some(ExitStatus::new("COMPLETED WITH NOTES"))
            }
        }

        let fixture = Fixture::new("job").await;
        let step = TaskletStep::builder("count")
            .tasklet(counting_tasklet(1))
            .listener(Arc::new(Relabel))
            .build()
            .unwrap();
        let mut execution = fixture.step_execution("count").await;
        step.execute(&mut execution, &fixture.context()).await.unwrap();

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.exit_code(), "COMPLETED WITH NOTES");
    }

    #[test]
    fn test_build_requires_tasklet() {
        assert!(matches!(
            TaskletStep::builder("empty").build(),
            Err(AppError::Config(_))
        ));
    }
}
