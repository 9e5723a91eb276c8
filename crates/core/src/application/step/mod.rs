// Steps - one capability (`Step`), several variants composed by configuration

pub mod async_writer;
pub mod chunk;
pub mod context;
pub mod handler;
pub mod partition;
pub mod tasklet;

pub use async_writer::{AsyncItemWriter, ResultQueue};
pub use chunk::{ChunkOrientedTasklet, ChunkStepBuilder, FaultTolerance};
pub use context::{ChunkContext, ChunkTransaction, SkipCounts, StepContext};
pub use handler::StepHandler;
pub use partition::{
    Partitioner, PartitionHandler, PartitionStep, RemotePartitionHandler, SimplePartitioner,
    StepExecutionRequestHandler, StepExecutionSplitter, TaskExecutorPartitionHandler,
};
pub use tasklet::{FnTasklet, Tasklet, TaskletStep, TaskletStepBuilder};

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::application::constants::DEFAULT_START_LIMIT;
use crate::domain::{BatchStatus, ExitStatus, StepExecution};
use crate::error::{AppError, Result};
use crate::port::{ItemStream, StepExecutionListener};

/// A unit of job work that can be attempted, restarted and routed on.
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    /// Maximum number of attempts per job instance
    fn start_limit(&self) -> u32 {
        DEFAULT_START_LIMIT
    }

    /// Run again on restart even when a previous attempt completed
    fn allow_start_if_complete(&self) -> bool {
        false
    }

    /// Run one attempt.
    ///
    /// Business failures end up in `step_execution` (status, exit status,
    /// failure list). `Err` is reserved for infrastructure failures that
    /// prevented the attempt from starting.
    async fn execute(&self, step_execution: &mut StepExecution, context: &StepContext)
        -> Result<()>;
}

/// Configuration shared by every step variant.
#[derive(Clone)]
pub struct StepSettings {
    pub name: String,
    pub start_limit: u32,
    pub allow_start_if_complete: bool,
    pub listeners: Vec<Arc<dyn StepExecutionListener>>,
    pub streams: Vec<Arc<dyn ItemStream>>,
}

impl StepSettings {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start_limit: DEFAULT_START_LIMIT,
            allow_start_if_complete: false,
            listeners: Vec::new(),
            streams: Vec::new(),
        }
    }
}

/// The variant-specific part of a step, run between open and close.
#[async_trait]
pub(crate) trait StepWork: Send + Sync {
    async fn do_execute(&self, step_execution: &mut StepExecution, context: &StepContext)
        -> Result<()>;
}

/// Shared step lifecycle: start, listeners, open, work, status mapping and
/// the guaranteed close-and-persist.
pub(crate) async fn run_lifecycle<W>(
    work: &W,
    settings: &StepSettings,
    step_execution: &mut StepExecution,
    context: &StepContext,
) -> Result<()>
where
    W: StepWork + ?Sized,
{
    let repository = context.repository();
    info!(
        step = %settings.name,
        step_execution_id = step_execution.id,
        job_execution_id = step_execution.job_execution_id,
        "Executing step"
    );

    step_execution.start_time = Some(context.now());
    step_execution.status = BatchStatus::Started;
    repository.update_step_execution(step_execution).await?;

    let mut exit_status = match open_and_execute(work, settings, step_execution, context).await {
        Ok(()) => {
            let mut exit_status = ExitStatus::completed().and(&step_execution.exit_status);
            if step_execution.terminate_only {
                step_execution.upgrade_status(BatchStatus::Stopped);
                exit_status = exit_status.and(&ExitStatus::stopped());
            } else {
                step_execution.upgrade_status(BatchStatus::Completed);
            }
            exit_status
        }
        Err(e) if e.is_interruption() => {
            warn!(step = %settings.name, "Step interrupted: {}", e);
            step_execution.upgrade_status(BatchStatus::Stopped);
            step_execution.add_failure(e.to_string());
            ExitStatus::stopped()
                .add_error_description(&e)
                .and(&step_execution.exit_status)
        }
        Err(e) => {
            error!(step = %settings.name, error = %e, "Step failed");
            // The checkpoint path may already have marked the step UNKNOWN.
            step_execution.upgrade_status(BatchStatus::Failed);
            step_execution.add_failure(e.to_string());
            ExitStatus::failed()
                .add_error_description(&e)
                .and(&step_execution.exit_status)
        }
    };
    step_execution.exit_status = exit_status.clone();

    for listener in settings.listeners.iter().rev() {
        if let Some(replacement) = listener.after_step(step_execution).await {
            exit_status = replacement;
        }
    }
    step_execution.exit_status = exit_status;

    // Guaranteed cleanup. A stream that fails to close may hold writes
    // that never landed, so a completed step is failed and runs again on
    // restart.
    for stream in &settings.streams {
        if let Err(e) = stream.close().await {
            error!(step = %settings.name, error = %e, "Failed to close step stream");
            let cause = AppError::Item(e);
            if step_execution.status == BatchStatus::Completed {
                step_execution.status = BatchStatus::Failed;
                step_execution.exit_status = step_execution
                    .exit_status
                    .and(&ExitStatus::failed())
                    .add_error_description(&cause);
            }
            step_execution.add_failure(cause.to_string());
        }
    }
    step_execution.end_time = Some(context.now());

    if let Err(e) = repository.update_step_execution(step_execution).await {
        error!(
            step = %settings.name,
            step_execution_id = step_execution.id,
            error = %e,
            "Failed to persist final step state"
        );
        step_execution.status = BatchStatus::Unknown;
        step_execution.exit_status = step_execution
            .exit_status
            .and(&ExitStatus::unknown())
            .add_error_description(&e);
        step_execution.add_failure(e.to_string());
    }

    info!(
        step = %settings.name,
        status = %step_execution.status,
        exit_code = step_execution.exit_status.exit_code(),
        "Step finished: {}",
        step_execution.summary()
    );
    Ok(())
}

async fn open_and_execute<W>(
    work: &W,
    settings: &StepSettings,
    step_execution: &mut StepExecution,
    context: &StepContext,
) -> Result<()>
where
    W: StepWork + ?Sized,
{
    for listener in &settings.listeners {
        listener.before_step(step_execution).await;
    }
    for stream in &settings.streams {
        stream
            .open(&step_execution.execution_context)
            .await
            .map_err(AppError::Item)?;
    }
    work.do_execute(step_execution, context).await
}
