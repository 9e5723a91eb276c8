// Flow executor - job-side services shared by the states of one flow run

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use super::status::FlowExecutionStatus;
use crate::application::constants::STOPPED_STATE_KEY;
use crate::application::step::{Step, StepHandler};
use crate::application::stop::StopSignal;
use crate::domain::{BatchStatus, ExitStatus, JobExecution, StepExecution};
use crate::error::Result;
use crate::port::{JobRepository, TimeProvider};

/// Runs steps on behalf of flow states and tracks the job's outcome.
///
/// The job execution and the exit status are shared by every branch of a
/// split; the last step execution is tracked per branch.
pub struct FlowExecutor {
    job: Arc<Mutex<JobExecution>>,
    exit_status: Arc<Mutex<ExitStatus>>,
    handler: StepHandler,
    repository: Arc<dyn JobRepository>,
    stop_signal: StopSignal,
    last_step: Mutex<Option<StepExecution>>,
}

impl FlowExecutor {
    pub fn new(
        job: JobExecution,
        repository: Arc<dyn JobRepository>,
        time_provider: Arc<dyn TimeProvider>,
        stop_signal: StopSignal,
    ) -> Self {
        Self {
            job: Arc::new(Mutex::new(job)),
            exit_status: Arc::new(Mutex::new(ExitStatus::executing())),
            handler: StepHandler::new(repository.clone(), time_provider),
            repository,
            stop_signal,
            last_step: Mutex::new(None),
        }
    }

    /// Executor for a split branch: same job, own last step.
    pub fn branch(&self) -> FlowExecutor {
        Self {
            job: self.job.clone(),
            exit_status: self.exit_status.clone(),
            handler: self.handler.clone(),
            repository: self.repository.clone(),
            stop_signal: self.stop_signal.clone(),
            last_step: Mutex::new(None),
        }
    }

    /// Run a step through the handler and return its exit code.
    pub async fn execute_step(&self, step: &dyn Step) -> Result<String> {
        let step_execution = self
            .handler
            .handle_step(step, &self.job, &self.stop_signal)
            .await?;
        let exit_code = step_execution.exit_status.exit_code().to_string();
        *self.last_step.lock().await = Some(step_execution);
        Ok(exit_code)
    }

    pub async fn last_step_execution(&self) -> Option<StepExecution> {
        self.last_step.lock().await.clone()
    }

    #[cfg(test)]
    pub(crate) async fn set_last_step_execution(&self, step_execution: StepExecution) {
        *self.last_step.lock().await = Some(step_execution);
    }

    /// Mark the branch's last step ABANDONED if it ended unsuccessfully.
    pub async fn abandon_step_execution(&self) -> Result<()> {
        let mut last = self.last_step.lock().await;
        let Some(step_execution) = last.as_mut() else {
            return Ok(());
        };
        if step_execution.status <= BatchStatus::Stopping
            || step_execution.status == BatchStatus::Abandoned
        {
            return Ok(());
        }

        debug!(
            step = %step_execution.step_name,
            status = %step_execution.status,
            "Abandoning step execution"
        );
        step_execution.upgrade_status(BatchStatus::Abandoned);
        self.repository.update_step_execution(step_execution).await?;
        self.job
            .lock()
            .await
            .add_step_execution(step_execution.clone());
        Ok(())
    }

    pub async fn job_execution(&self) -> JobExecution {
        self.job.lock().await.clone()
    }

    /// Fold a flow's final status into the job execution.
    pub async fn update_job_execution_status(&self, status: &FlowExecutionStatus) {
        let exit_status = {
            let mut exit = self.exit_status.lock().await;
            *exit = exit.and(&ExitStatus::new(status.name()));
            exit.clone()
        };
        let mut job = self.job.lock().await;
        job.status = BatchStatus::match_prefix(status.name());
        job.exit_status = exit_status;
    }

    pub async fn add_exit_status(&self, exit_code: &str) {
        let exit_status = {
            let mut exit = self.exit_status.lock().await;
            *exit = exit.and(&ExitStatus::new(exit_code));
            exit.clone()
        };
        self.job.lock().await.exit_status = exit_status;
    }

    /// Remember the END state a flow stopped at, for the next restart.
    pub async fn record_stopped_state(&self, state_name: &str) {
        self.job
            .lock()
            .await
            .execution_context
            .put_string(STOPPED_STATE_KEY, state_name);
    }

    /// Consume the END state recorded by an earlier stopped execution.
    pub async fn take_stopped_state(&self) -> Option<String> {
        let mut job = self.job.lock().await;
        let name = job
            .execution_context
            .get_string(STOPPED_STATE_KEY)
            .map(str::to_string);
        if name.is_some() {
            job.execution_context.remove(STOPPED_STATE_KEY);
        }
        name
    }
}
