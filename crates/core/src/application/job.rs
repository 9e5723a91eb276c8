// Jobs - a named flow run under the job lifecycle

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info};

use crate::application::flow::{Flow, FlowBuilder, FlowExecutor};
use crate::application::step::Step;
use crate::application::stop::{ExecutionSynchronizer, StopSignal};
use crate::domain::{BatchStatus, ExitStatus, JobExecution, JobParameters};
use crate::error::{AppError, Result};
use crate::port::{JobExecutionListener, JobRepository, TimeProvider};

/// Services a job needs while it runs one execution.
#[derive(Clone)]
pub struct JobRuntime {
    pub repository: Arc<dyn JobRepository>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub stop_signal: StopSignal,
    pub synchronizer: Arc<ExecutionSynchronizer>,
}

impl JobRuntime {
    pub fn new(
        repository: Arc<dyn JobRepository>,
        time_provider: Arc<dyn TimeProvider>,
        stop_signal: StopSignal,
    ) -> Self {
        Self {
            repository,
            time_provider,
            stop_signal,
            synchronizer: Arc::new(ExecutionSynchronizer::new()),
        }
    }

    pub fn with_synchronizer(mut self, synchronizer: Arc<ExecutionSynchronizer>) -> Self {
        self.synchronizer = synchronizer;
        self
    }

    /// Persist the job under the per-execution lock, folding in a status
    /// written concurrently by the operator.
    pub async fn persist(&self, execution: &mut JobExecution) -> Result<()> {
        let _guard = self.synchronizer.lock(execution.id).await;
        self.repository.synchronize_status(execution).await?;
        if execution.is_stopping() && execution.end_time.is_some() {
            execution.upgrade_status(BatchStatus::Stopped);
        }
        self.repository.update_job_execution(execution).await
    }
}

#[async_trait]
pub trait Job: Send + Sync {
    fn name(&self) -> &str;

    fn is_restartable(&self) -> bool {
        true
    }

    fn validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        None
    }

    /// Run one execution to a terminal status.
    ///
    /// Failures never escape: they are recorded in `execution` and the
    /// final state is persisted before returning.
    async fn execute(&self, execution: &mut JobExecution, runtime: &JobRuntime);
}

pub trait JobParametersValidator: Send + Sync {
    fn validate(&self, parameters: &JobParameters) -> Result<()>;
}

/// Checks required keys and, when optional keys are declared, rejects any
/// key that is neither required nor optional.
#[derive(Debug, Clone, Default)]
pub struct DefaultJobParametersValidator {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl DefaultJobParametersValidator {
    pub fn new(required: &[&str], optional: &[&str]) -> Result<Self> {
        let required: BTreeSet<String> = required.iter().map(|k| k.to_string()).collect();
        let optional: BTreeSet<String> = optional.iter().map(|k| k.to_string()).collect();
        if let Some(key) = required.intersection(&optional).next() {
            return Err(AppError::Config(format!(
                "parameter '{key}' cannot be both required and optional"
            )));
        }
        Ok(Self { required, optional })
    }
}

impl JobParametersValidator for DefaultJobParametersValidator {
    fn validate(&self, parameters: &JobParameters) -> Result<()> {
        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|key| !parameters.contains(key))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(AppError::InvalidParameters(format!(
                "missing required keys: {}",
                missing.join(", ")
            )));
        }

        if !self.optional.is_empty() {
            let unexpected: Vec<&str> = parameters
                .iter()
                .map(|(key, _)| key.as_str())
                .filter(|key| !self.required.contains(*key) && !self.optional.contains(*key))
                .collect();
            if !unexpected.is_empty() {
                return Err(AppError::InvalidParameters(format!(
                    "keys neither required nor optional: {}",
                    unexpected.join(", ")
                )));
            }
        }
        Ok(())
    }
}

/// A job whose work is a flow.
pub struct FlowJob {
    name: String,
    flow: Arc<dyn Flow>,
    restartable: bool,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: Vec<Arc<dyn JobExecutionListener>>,
}

impl FlowJob {
    pub fn builder(name: impl Into<String>) -> JobBuilder {
        JobBuilder::new(name)
    }

    pub fn flow(&self) -> &Arc<dyn Flow> {
        &self.flow
    }

    async fn run(&self, execution: &mut JobExecution, runtime: &JobRuntime) -> Result<()> {
        execution.start_time = Some(runtime.time_provider.now_millis());
        execution.status = BatchStatus::Started;
        runtime.persist(execution).await?;

        if execution.is_stopping() {
            // Stopped before any work began.
            execution.status = BatchStatus::Stopped;
            execution.exit_status = ExitStatus::completed();
            return Ok(());
        }

        for listener in &self.listeners {
            listener.before_job(execution).await;
        }

        let executor = FlowExecutor::new(
            execution.clone(),
            runtime.repository.clone(),
            runtime.time_provider.clone(),
            runtime.stop_signal.clone(),
        );
        let result = self.run_flow(&executor).await;
        *execution = executor.job_execution().await;
        result
    }

    async fn run_flow(&self, executor: &FlowExecutor) -> Result<()> {
        let restart_state = executor
            .take_stopped_state()
            .await
            .and_then(|stopped| self.flow.state(&stopped))
            .and_then(|state| state.restart_target().map(str::to_string));

        let flow_execution = match restart_state {
            Some(state) => {
                info!(job = %self.name, state = %state, "Resuming flow at restart state");
                self.flow.resume(&state, executor).await?
            }
            None => self.flow.start(executor).await?,
        };
        executor
            .update_job_execution_status(&flow_execution.status)
            .await;
        Ok(())
    }
}

#[async_trait]
impl Job for FlowJob {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_restartable(&self) -> bool {
        self.restartable
    }

    fn validator(&self) -> Option<Arc<dyn JobParametersValidator>> {
        self.validator.clone()
    }

    async fn execute(&self, execution: &mut JobExecution, runtime: &JobRuntime) {
        info!(
            job = %self.name,
            execution_id = execution.id,
            parameters = %execution.parameters,
            "Job launched"
        );

        match self.run(execution, runtime).await {
            Ok(()) => {}
            Err(e) if e.is_interruption() => {
                info!(job = %self.name, execution_id = execution.id, "Job interrupted: {}", e);
                execution.exit_status = ExitStatus::stopped().add_error_description(&e);
                execution.status = BatchStatus::Stopped;
                execution.add_failure(e.to_string());
            }
            Err(e) => {
                error!(job = %self.name, execution_id = execution.id, error = %e, "Job failed");
                execution.exit_status = ExitStatus::failed().add_error_description(&e);
                execution.status = BatchStatus::Failed;
                execution.add_failure(e.to_string());
            }
        }

        if execution.is_stopping() {
            execution.status = BatchStatus::Stopped;
        }
        if execution.status <= BatchStatus::Stopped && execution.step_executions.is_empty() {
            execution.exit_status = execution.exit_status.and(
                &ExitStatus::noop().add_exit_description(
                    "All steps already completed or no steps configured for this job.",
                ),
            );
        }
        execution.end_time = Some(runtime.time_provider.now_millis());

        for listener in self.listeners.iter().rev() {
            listener.after_job(execution).await;
        }

        if let Err(e) = runtime.persist(execution).await {
            error!(
                job = %self.name,
                execution_id = execution.id,
                error = %e,
                "Failed to persist final job status"
            );
            execution.upgrade_status(BatchStatus::Unknown);
        }
        runtime.synchronizer.release(execution.id).await;

        info!(
            job = %self.name,
            execution_id = execution.id,
            status = %execution.status,
            exit_code = execution.exit_status.exit_code(),
            "Job finished"
        );
    }
}

/// Builds a [`FlowJob`] from a flow or a sequence of steps.
pub struct JobBuilder {
    name: String,
    restartable: bool,
    validator: Option<Arc<dyn JobParametersValidator>>,
    listeners: Vec<Arc<dyn JobExecutionListener>>,
    steps: Vec<Arc<dyn Step>>,
    flow: Option<Arc<dyn Flow>>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            restartable: true,
            validator: None,
            listeners: Vec::new(),
            steps: Vec::new(),
            flow: None,
        }
    }

    pub fn start(mut self, step: Arc<dyn Step>) -> Self {
        self.steps = vec![step];
        self
    }

    pub fn next(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn flow(mut self, flow: Arc<dyn Flow>) -> Self {
        self.flow = Some(flow);
        self
    }

    pub fn restartable(mut self, restartable: bool) -> Self {
        self.restartable = restartable;
        self
    }

    pub fn validator(mut self, validator: Arc<dyn JobParametersValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn JobExecutionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> Result<FlowJob> {
        let flow: Arc<dyn Flow> = match (self.flow, self.steps.is_empty()) {
            (Some(_), false) => {
                return Err(AppError::Config(format!(
                    "job '{}' has both a flow and steps",
                    self.name
                )))
            }
            (Some(flow), true) => flow,
            (None, true) => {
                return Err(AppError::Config(format!("job '{}' has no steps", self.name)))
            }
            (None, false) => {
                let mut steps = self.steps.into_iter();
                let mut builder = FlowBuilder::new(self.name.clone());
                if let Some(first) = steps.next() {
                    builder = builder.start_step(first);
                }
                for step in steps {
                    builder = builder.next_step(step);
                }
                Arc::new(builder.build()?)
            }
        };
        Ok(FlowJob {
            name: self.name,
            flow,
            restartable: self.restartable,
            validator: self.validator,
            listeners: self.listeners,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fixtures::Fixture;
    use crate::application::flow::simple::tests::{failing_step, ok_step};
    use crate::application::flow::{EndState, FlowExecutionStatus};
    use crate::domain::JobParametersBuilder;
    use crate::port::listener::mocks::JournalListener;
    use crate::application::constants::STOPPED_STATE_KEY;
    use std::sync::Mutex;

    fn runtime(fixture: &Fixture) -> JobRuntime {
        JobRuntime::new(
            fixture.repository.clone(),
            fixture.time_provider.clone(),
            fixture.stop_signal.clone(),
        )
    }

    async fn next_execution(fixture: &Fixture) -> JobExecution {
        fixture
            .repository
            .create_execution(
                &fixture.job_execution.instance,
                &fixture.job_execution.parameters,
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sequential_job_completes() {
        let fixture = Fixture::new("job").await;
        let journal = Arc::new(Mutex::new(Vec::new()));
        let job = JobBuilder::new("job")
            .start(ok_step("a"))
            .next(ok_step("b"))
            .listener(Arc::new(JournalListener::new("j", journal.clone())))
            .build()
            .unwrap();

        let mut execution = fixture.job_execution.clone();
        job.execute(&mut execution, &runtime(&fixture)).await;

        assert_eq!(execution.status, BatchStatus::Completed);
        assert_eq!(execution.exit_status.exit_code(), "COMPLETED");
        assert_eq!(execution.step_executions.len(), 2);
        assert!(execution.start_time.is_some() && execution.end_time.is_some());

        let stored = fixture
            .repository
            .get_job_execution(execution.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.version, execution.version);

        let journal = journal.lock().unwrap();
        assert_eq!(
            *journal,
            vec!["j:before_job".to_string(), "j:after_job=COMPLETED".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failing_step_fails_job() {
        let fixture = Fixture::new("job").await;
        let job = JobBuilder::new("job")
            .start(failing_step("a"))
            .next(ok_step("b"))
            .build()
            .unwrap();

        let mut execution = fixture.job_execution.clone();
        job.execute(&mut execution, &runtime(&fixture)).await;

        assert_eq!(execution.status, BatchStatus::Failed);
        assert_eq!(execution.exit_status.exit_code(), "FAILED");
        assert!(execution.all_failures().iter().any(|f| f.contains("boom")));
    }

    #[tokio::test]
    async fn test_stop_requested_ends_stopped() {
        let fixture = Fixture::new("job").await;
        fixture.stop_signal.request();
        let job = JobBuilder::new("job").start(ok_step("a")).build().unwrap();

        let mut execution = fixture.job_execution.clone();
        job.execute(&mut execution, &runtime(&fixture)).await;

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.exit_code(), "STOPPED");
        assert_eq!(execution.step_execution("a").unwrap().status, BatchStatus::Stopped);
    }

    #[tokio::test]
    async fn test_stopping_before_start_runs_nothing() {
        let fixture = Fixture::new("job").await;
        let mut stored = fixture.job_execution.clone();
        stored.status = BatchStatus::Stopping;
        fixture.repository.update_job_execution(&mut stored).await.unwrap();

        let job = JobBuilder::new("job").start(ok_step("a")).build().unwrap();
        let mut execution = fixture.job_execution.clone();
        job.execute(&mut execution, &runtime(&fixture)).await;

        assert_eq!(execution.status, BatchStatus::Stopped);
        assert_eq!(execution.exit_status.exit_code(), "NOOP");
        assert!(execution.step_executions.is_empty());
    }

    #[tokio::test]
    async fn test_stop_and_restart_resumes_at_target() {
        let fixture = Fixture::new("job").await;
        let flow = FlowBuilder::new("main")
            .start_step(ok_step("a"))
            .on("COMPLETED")
            .stop_and_restart_step(ok_step("b"))
            .build()
            .unwrap();
        let job = JobBuilder::new("job").flow(Arc::new(flow)).build().unwrap();
        let runtime = runtime(&fixture);

        let mut first = fixture.job_execution.clone();
        job.execute(&mut first, &runtime).await;
        assert_eq!(first.status, BatchStatus::Stopped);
        assert!(first.execution_context.contains_key(STOPPED_STATE_KEY));
        assert!(first.step_execution("b").is_none());

        let mut second = next_execution(&fixture).await;
        job.execute(&mut second, &runtime).await;
        assert_eq!(second.status, BatchStatus::Completed);
        let names: Vec<_> = second.step_executions.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["b"]);
        assert!(!second.execution_context.contains_key(STOPPED_STATE_KEY));
    }

    #[tokio::test]
    async fn test_abandoned_step_is_skipped_on_restart() {
        let fixture = Fixture::new("job").await;
        let flow = FlowBuilder::new("main")
            .start_step(failing_step("a"))
            .on("FAILED")
            .to_end(
                EndState::new("giveup", FlowExecutionStatus::stopped(), "STOPPED").abandon(),
            )
            .build()
            .unwrap();
        let job = JobBuilder::new("job").flow(Arc::new(flow)).build().unwrap();
        let runtime = runtime(&fixture);

        let mut first = fixture.job_execution.clone();
        job.execute(&mut first, &runtime).await;
        assert_eq!(first.status, BatchStatus::Stopped);
        assert_eq!(first.step_execution("a").unwrap().status, BatchStatus::Abandoned);

        let mut second = next_execution(&fixture).await;
        job.execute(&mut second, &runtime).await;
        assert!(second.step_executions.is_empty());
        let attempts = fixture
            .repository
            .get_step_execution_count(&second.instance, "a")
            .await
            .unwrap();
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_default_validator() {
        let validator = DefaultJobParametersValidator::new(&["input"], &["limit"]).unwrap();
        let ok = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_long("limit", 5)
            .build();
        assert!(validator.validate(&ok).is_ok());

        let missing = JobParametersBuilder::new().add_long("limit", 5).build();
        assert!(matches!(
            validator.validate(&missing),
            Err(AppError::InvalidParameters(msg)) if msg.contains("input")
        ));

        let extra = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_string("other", "x")
            .build();
        assert!(validator.validate(&extra).is_err());

        assert!(DefaultJobParametersValidator::new(&["a"], &["a"]).is_err());
        let open = DefaultJobParametersValidator::new(&["input"], &[]).unwrap();
        assert!(open.validate(&extra).is_ok());
    }

    #[test]
    fn test_builder_requires_work() {
        assert!(matches!(JobBuilder::new("job").build(), Err(AppError::Config(_))));
    }
}
