// Step handler - restart rules applied before a step state runs its step

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use super::{Step, StepContext};
use crate::application::stop::StopSignal;
use crate::domain::{BatchStatus, ExecutionContext, JobExecution, JobInstance, StepExecution};
use crate::error::{AppError, Result};
use crate::port::{JobRepository, TimeProvider};

/// Decides whether a step runs in the current job execution and runs it.
#[derive(Clone)]
pub struct StepHandler {
    repository: Arc<dyn JobRepository>,
    time_provider: Arc<dyn TimeProvider>,
}

impl StepHandler {
    pub fn new(repository: Arc<dyn JobRepository>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            repository,
            time_provider,
        }
    }

    /// Run `step` for the job, or return the earlier attempt that makes a
    /// rerun unnecessary.
    ///
    /// - the job is stopping: `JobInterrupted`
    /// - last attempt UNKNOWN: `JobRestart`
    /// - last attempt COMPLETED (and reruns not allowed) or ABANDONED: skipped,
    ///   the last attempt is returned for routing
    /// - start limit used up: `StartLimitExceeded`
    ///
    /// A restart of an unfinished attempt resumes from its context. A step
    /// that ends STOPPED moves the job to STOPPING and raises
    /// `JobInterrupted`.
    pub async fn handle_step(
        &self,
        step: &dyn Step,
        job: &Mutex<JobExecution>,
        stop_signal: &StopSignal,
    ) -> Result<StepExecution> {
        let snapshot = {
            let mut job = job.lock().await;
            // Pick up a STOPPING written by the operator since the last update.
            self.repository.synchronize_status(&mut job).await?;
            job.clone()
        };
        if snapshot.is_stopping() {
            return Err(AppError::JobInterrupted(
                "job execution is stopping".to_string(),
            ));
        }

        let mut last = self
            .repository
            .get_last_step_execution(&snapshot.instance, step.name())
            .await?;
        // An earlier attempt within this same job execution is a deliberate
        // loop back, not a restart.
        if last
            .as_ref()
            .is_some_and(|l| l.job_execution_id == snapshot.id)
        {
            last = None;
        }

        if let Some(previous) = &last {
            if !self
                .should_start(step, &snapshot.instance, previous.status)
                .await?
            {
                info!(
                    step = step.name(),
                    status = %previous.status,
                    "Step already complete or not restartable, skipping"
                );
                return Ok(previous.clone());
            }
        } else {
            self.should_start(step, &snapshot.instance, BatchStatus::Starting)
                .await?;
        }

        let context = match &last {
            Some(previous) if previous.status != BatchStatus::Completed => {
                previous.execution_context.clone()
            }
            _ => ExecutionContext::new(),
        };
        let mut step_execution = self
            .repository
            .create_step_execution(snapshot.id, step.name(), context)
            .await?;

        let step_context = StepContext::new(
            &snapshot,
            self.repository.clone(),
            self.time_provider.clone(),
            stop_signal.clone(),
        );
        step.execute(&mut step_execution, &step_context).await?;

        let mut job = job.lock().await;
        job.add_step_execution(step_execution.clone());
        if matches!(
            step_execution.status,
            BatchStatus::Stopping | BatchStatus::Stopped
        ) {
            job.status = BatchStatus::Stopping;
            return Err(AppError::JobInterrupted(format!(
                "job interrupted by step '{}'",
                step.name()
            )));
        }
        Ok(step_execution)
    }

    async fn should_start(
        &self,
        step: &dyn Step,
        instance: &JobInstance,
        last_status: BatchStatus,
    ) -> Result<bool> {
        match last_status {
            BatchStatus::Unknown => {
                return Err(AppError::JobRestart(format!(
                    "step '{}' ended in an unknown state; inspect it before restarting",
                    step.name()
                )))
            }
            BatchStatus::Completed if !step.allow_start_if_complete() => return Ok(false),
            BatchStatus::Abandoned => return Ok(false),
            _ => {}
        }

        let count = self
            .repository
            .get_step_execution_count(instance, step.name())
            .await?;
        if count < step.start_limit() {
            Ok(true)
        } else {
            Err(AppError::StartLimitExceeded {
                step: step.name().to_string(),
                limit: step.start_limit(),
            })
        }
    }
}
