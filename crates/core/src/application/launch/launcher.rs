// Job launcher - checks a launch request and runs the execution

use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::application::constants::DEFAULT_WORKER_POOL_SIZE;
use crate::application::job::{Job, JobRuntime};
use crate::application::stop::{ExecutionSynchronizer, StopRegistry};
use crate::domain::{BatchStatus, JobExecution, JobExecutionId, JobParameters};
use crate::error::{AppError, Result};
use crate::port::{JobRepository, TimeProvider};

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Upper bound of job executions running at the same time
    pub max_concurrent_jobs: usize,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: DEFAULT_WORKER_POOL_SIZE,
        }
    }
}

/// A job execution running in the background.
pub struct JobHandle {
    execution_id: JobExecutionId,
    join: JoinHandle<JobExecution>,
}

impl JobHandle {
    pub fn execution_id(&self) -> JobExecutionId {
        self.execution_id
    }

    /// Wait for the execution to reach its final status.
    pub async fn wait(self) -> Result<JobExecution> {
        self.join
            .await
            .map_err(|e| AppError::Internal(format!("job execution task failed: {e}")))
    }
}

pub struct JobLauncher {
    repository: Arc<dyn JobRepository>,
    time_provider: Arc<dyn TimeProvider>,
    stops: Arc<StopRegistry>,
    synchronizer: Arc<ExecutionSynchronizer>,
    permits: Arc<Semaphore>,
}

impl JobLauncher {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        time_provider: Arc<dyn TimeProvider>,
        config: LauncherConfig,
    ) -> Self {
        Self {
            repository,
            time_provider,
            stops: Arc::new(StopRegistry::new()),
            synchronizer: Arc::new(ExecutionSynchronizer::new()),
            permits: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
        }
    }

    pub fn repository(&self) -> &Arc<dyn JobRepository> {
        &self.repository
    }

    pub fn stop_registry(&self) -> &Arc<StopRegistry> {
        &self.stops
    }

    pub fn synchronizer(&self) -> &Arc<ExecutionSynchronizer> {
        &self.synchronizer
    }

    /// Launch and wait for the final status.
    pub async fn run(&self, job: Arc<dyn Job>, parameters: &JobParameters) -> Result<JobExecution> {
        self.start(job, parameters).await?.wait().await
    }

    /// Launch in the background.
    ///
    /// Fails before anything runs when the parameters are invalid, the
    /// instance already completed, its last execution is still running,
    /// was abandoned or ended UNKNOWN, or the job is not restartable.
    pub async fn start(&self, job: Arc<dyn Job>, parameters: &JobParameters) -> Result<JobHandle> {
        let execution = self.create_execution(job.as_ref(), parameters).await?;
        let execution_id = execution.id;
        info!(
            job = job.name(),
            execution_id,
            parameters = %parameters,
            "Job execution created"
        );

        let stop_signal = self.stops.register(execution_id).await;
        let runtime = JobRuntime::new(
            self.repository.clone(),
            self.time_provider.clone(),
            stop_signal,
        )
        .with_synchronizer(self.synchronizer.clone());
        let permits = self.permits.clone();
        let stops = self.stops.clone();

        let join = tokio::spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            let mut execution = execution;
            job.execute(&mut execution, &runtime).await;
            stops.remove(execution.id).await;
            execution
        });
        Ok(JobHandle { execution_id, join })
    }

    async fn create_execution(
        &self,
        job: &dyn Job,
        parameters: &JobParameters,
    ) -> Result<JobExecution> {
        if let Some(validator) = job.validator() {
            validator.validate(parameters)?;
        }

        let last = self
            .repository
            .get_last_job_execution(job.name(), parameters)
            .await?;
        if let Some(last) = last {
            if !job.is_restartable() {
                return Err(AppError::JobRestart(format!(
                    "job '{}' already has an instance for these parameters and is not restartable",
                    job.name()
                )));
            }
            match last.status {
                BatchStatus::Completed => {
                    return Err(AppError::JobInstanceAlreadyComplete(format!(
                        "job '{}' already completed for parameters [{}]",
                        job.name(),
                        parameters
                    )))
                }
                BatchStatus::Abandoned => {
                    return Err(AppError::JobRestart(format!(
                        "execution {} of job '{}' was abandoned and cannot be restarted",
                        last.id,
                        job.name()
                    )))
                }
                BatchStatus::Unknown => {
                    return Err(AppError::JobRestart(format!(
                        "execution {} of job '{}' ended UNKNOWN; inspect it before restarting",
                        last.id,
                        job.name()
                    )))
                }
                status if status.is_running() => {
                    return Err(AppError::JobExecutionAlreadyRunning(format!(
                        "execution {} of job '{}' is {}",
                        last.id,
                        job.name(),
                        status
                    )))
                }
                _ => {}
            }
            if let Some(step) = last
                .step_executions
                .iter()
                .find(|s| s.status == BatchStatus::Unknown)
            {
                return Err(AppError::JobRestart(format!(
                    "step '{}' of execution {} ended UNKNOWN",
                    step.step_name, last.id
                )));
            }
            warn!(
                job = job.name(),
                previous_execution_id = last.id,
                previous_status = %last.status,
                "Restarting job instance"
            );
        }

        let instance = self
            .repository
            .find_or_create_instance(job.name(), parameters)
            .await?;
        self.repository.create_execution(&instance, parameters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::flow::simple::tests::{failing_step, ok_step};
    use crate::application::job::{DefaultJobParametersValidator, JobBuilder};
    use crate::domain::JobParametersBuilder;
    use crate::port::time_provider::mocks::SteppingTimeProvider;
    use crate::memory::InMemoryJobRepository;

    fn launcher() -> JobLauncher {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SteppingTimeProvider::new(1_000, 1));
        let repository = Arc::new(InMemoryJobRepository::new(time_provider.clone()));
        JobLauncher::new(repository, time_provider, LauncherConfig::default())
    }

    fn params(run: i64) -> JobParameters {
        JobParametersBuilder::new().add_long("run", run).build()
    }

    #[tokio::test]
    async fn test_run_completes_and_rejects_rerun() {
        let launcher = launcher();
        let job: Arc<dyn Job> = Arc::new(JobBuilder::new("job").start(ok_step("a")).build().unwrap());

        let execution = launcher.run(job.clone(), &params(1)).await.unwrap();
        assert_eq!(execution.status, BatchStatus::Completed);

        let again = launcher.run(job.clone(), &params(1)).await;
        assert!(matches!(again, Err(AppError::JobInstanceAlreadyComplete(_))));

        let other = launcher.run(job, &params(2)).await.unwrap();
        assert_eq!(other.status, BatchStatus::Completed);
        assert_ne!(other.instance.id, execution.instance.id);
    }

    #[tokio::test]
    async fn test_failed_execution_can_be_restarted() {
        let launcher = launcher();
        let job: Arc<dyn Job> =
            Arc::new(JobBuilder::new("job").start(failing_step("a")).build().unwrap());

        let first = launcher.run(job.clone(), &params(1)).await.unwrap();
        assert_eq!(first.status, BatchStatus::Failed);

        let second = launcher.run(job, &params(1)).await.unwrap();
        assert_eq!(second.instance.id, first.instance.id);
        assert_ne!(second.id, first.id);
    }

    #[tokio::test]
    async fn test_non_restartable_job_is_rejected() {
        let launcher = launcher();
        let job: Arc<dyn Job> = Arc::new(
            JobBuilder::new("job")
                .start(failing_step("a"))
                .restartable(false)
                .build()
                .unwrap(),
        );
        launcher.run(job.clone(), &params(1)).await.unwrap();
        assert!(matches!(
            launcher.run(job, &params(1)).await,
            Err(AppError::JobRestart(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_parameters_create_nothing() {
        let launcher = launcher();
        let job: Arc<dyn Job> = Arc::new(
            JobBuilder::new("job")
                .start(ok_step("a"))
                .validator(Arc::new(
                    DefaultJobParametersValidator::new(&["input"], &[]).unwrap(),
                ))
                .build()
                .unwrap(),
        );
        let result = launcher.start(job, &params(1)).await;
        assert!(matches!(result, Err(AppError::InvalidParameters(_))));
        assert!(launcher
            .repository()
            .find_instance("job", &params(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_abandoned_execution_is_not_rerun() {
        let launcher = launcher();
        let job: Arc<dyn Job> =
            Arc::new(JobBuilder::new("job").start(failing_step("a")).build().unwrap());
        let mut failed = launcher.run(job.clone(), &params(1)).await.unwrap();
        failed.status = BatchStatus::Abandoned;
        launcher
            .repository()
            .update_job_execution(&mut failed)
            .await
            .unwrap();

        assert!(matches!(
            launcher.run(job, &params(1)).await,
            Err(AppError::JobRestart(msg)) if msg.contains("abandoned")
        ));
    }
}
