// Job operator - start, restart, stop and abandon by name or execution id

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::launcher::{JobHandle, JobLauncher};
use super::registry::JobRegistry;
use crate::domain::{BatchStatus, JobExecution, JobExecutionId, JobParameters, StepExecutionId};
use crate::error::{AppError, Result};

pub struct JobOperator {
    registry: Arc<JobRegistry>,
    launcher: Arc<JobLauncher>,
}

impl JobOperator {
    pub fn new(registry: Arc<JobRegistry>, launcher: Arc<JobLauncher>) -> Self {
        Self { registry, launcher }
    }

    pub fn launcher(&self) -> &Arc<JobLauncher> {
        &self.launcher
    }

    pub async fn job_names(&self) -> Vec<String> {
        self.registry.job_names().await
    }

    pub async fn start(&self, job_name: &str, parameters: &JobParameters) -> Result<JobHandle> {
        let job = self.registry.get(job_name).await?;
        self.launcher.start(job, parameters).await
    }

    /// Relaunch a FAILED or STOPPED execution with its own parameters.
    pub async fn restart(&self, execution_id: JobExecutionId) -> Result<JobHandle> {
        let execution = self.execution(execution_id).await?;
        if !matches!(execution.status, BatchStatus::Failed | BatchStatus::Stopped) {
            return Err(AppError::JobRestart(format!(
                "execution {execution_id} is {}; only FAILED or STOPPED executions can be restarted",
                execution.status
            )));
        }
        info!(
            job = execution.job_name(),
            execution_id,
            "Restarting job execution"
        );
        let job = self.registry.get(execution.job_name()).await?;
        self.launcher.start(job, &execution.parameters).await
    }

    /// Ask a running execution to stop.
    ///
    /// STOPPING is written to the repository first; the running job picks
    /// it up at its next chunk or step boundary. Returns whether the
    /// execution runs in this process and was signalled directly.
    pub async fn stop(&self, execution_id: JobExecutionId) -> Result<bool> {
        {
            let _guard = self.launcher.synchronizer().lock(execution_id).await;
            let mut execution = self.execution(execution_id).await?;
            if !execution.is_running() {
                return Err(AppError::InvalidState(format!(
                    "execution {execution_id} is not running ({})",
                    execution.status
                )));
            }
            execution.status = BatchStatus::Stopping;
            self.launcher
                .repository()
                .update_job_execution(&mut execution)
                .await?;
        }
        warn!(execution_id, "Stop requested");

        match self.launcher.stop_registry().get(execution_id).await {
            Some(signal) => Ok(signal.request()),
            None => Ok(false),
        }
    }

    /// Mark an execution that is no longer running as ABANDONED.
    pub async fn abandon(&self, execution_id: JobExecutionId) -> Result<JobExecution> {
        let _guard = self.launcher.synchronizer().lock(execution_id).await;
        let mut execution = self.execution(execution_id).await?;
        if execution.is_running() {
            return Err(AppError::JobExecutionAlreadyRunning(format!(
                "execution {execution_id} is {} and cannot be abandoned",
                execution.status
            )));
        }
        execution.upgrade_status(BatchStatus::Abandoned);
        self.launcher
            .repository()
            .update_job_execution(&mut execution)
            .await?;
        warn!(execution_id, status = %execution.status, "Job execution abandoned");
        Ok(execution)
    }

    pub async fn get_running_executions(&self, job_name: &str) -> Result<Vec<JobExecutionId>> {
        let mut ids: Vec<JobExecutionId> = self
            .launcher
            .repository()
            .find_running_job_executions(job_name)
            .await?
            .iter()
            .map(|e| e.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub async fn get_summary(&self, execution_id: JobExecutionId) -> Result<String> {
        let execution = self.execution(execution_id).await?;
        Ok(format!(
            "JobExecution: id={}, job={}, version={}, status={}, exitStatus={}, \
             startTime={}, endTime={}, parameters=[{}]",
            execution.id,
            execution.job_name(),
            execution.version,
            execution.status,
            execution.exit_status.exit_code(),
            format_time(execution.start_time),
            format_time(execution.end_time),
            execution.parameters
        ))
    }

    pub async fn get_step_summaries(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<BTreeMap<StepExecutionId, String>> {
        let execution = self.execution(execution_id).await?;
        Ok(execution
            .step_executions
            .iter()
            .map(|s| (s.id, s.summary()))
            .collect())
    }

    async fn execution(&self, execution_id: JobExecutionId) -> Result<JobExecution> {
        self.launcher
            .repository()
            .get_job_execution(execution_id)
            .await?
            .ok_or(AppError::NoSuchJobExecution(execution_id))
    }
}

fn format_time(epoch_ms: Option<i64>) -> String {
    epoch_ms
        .and_then(chrono::DateTime::<chrono::Utc>::from_timestamp_millis)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| "-".to_string())
}
