// Partitioning - split a step into worker executions, run them locally or
// remotely, and fold their results back into the manager execution

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{run_lifecycle, Step, StepContext, StepSettings, StepWork};
use crate::application::constants::{
    DEFAULT_POLL_INTERVAL, DEFAULT_WORKER_POOL_SIZE, GRID_SIZE_KEY, PARTITION_SEPARATOR,
};
use crate::application::stop::StopSignal;
use crate::domain::{BatchStatus, ExecutionContext, ExitStatus, StepExecution};
use crate::error::{AppError, Result};
use crate::port::{
    JobRepository, StepExecutionListener, StepExecutionRequest, StepRequestDispatcher,
    TimeProvider,
};

/// Produces one named input context per partition.
pub trait Partitioner: Send + Sync {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext>;
}

/// `partition0..partitionN-1`, each with empty context.
#[derive(Debug, Clone, Default)]
pub struct SimplePartitioner;

impl Partitioner for SimplePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        (0..grid_size)
            .map(|i| (format!("partition{}", i), ExecutionContext::new()))
            .collect()
    }
}

/// Creates the worker step executions of a manager step.
pub struct StepExecutionSplitter {
    step_name: String,
    partitioner: Arc<dyn Partitioner>,
    allow_start_if_complete: bool,
}

impl StepExecutionSplitter {
    pub fn new(step_name: impl Into<String>, partitioner: Arc<dyn Partitioner>) -> Self {
        Self {
            step_name: step_name.into(),
            partitioner,
            allow_start_if_complete: false,
        }
    }

    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.allow_start_if_complete = allow;
        self
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    /// Create the worker executions that need to run.
    ///
    /// The grid size is pinned in the manager context on the first run so a
    /// restart partitions identically. A partition whose last attempt did
    /// not complete resumes from that attempt's context; a completed one is
    /// left out unless restarting completed work is allowed.
    pub async fn split(
        &self,
        manager: &mut StepExecution,
        grid_size: usize,
        context: &StepContext,
    ) -> Result<Vec<StepExecution>> {
        let repository = context.repository();
        let grid_size = match manager.execution_context.get_long(GRID_SIZE_KEY) {
            Some(stored) => usize::try_from(stored).map_err(|_| {
                AppError::InvalidState(format!("invalid stored grid size {}", stored))
            })?,
            None => {
                manager
                    .execution_context
                    .put_long(GRID_SIZE_KEY, grid_size as i64);
                repository.update_step_execution(manager).await?;
                grid_size
            }
        };

        let mut workers = Vec::new();
        for (partition, input) in self.partitioner.partition(grid_size) {
            let worker_name = format!("{}{}{}", self.step_name, PARTITION_SEPARATOR, partition);
            let last = repository
                .get_last_step_execution(context.job_instance(), &worker_name)
                .await?;

            let start_context = match last {
                None => input,
                Some(last) if last.status == BatchStatus::Unknown => {
                    return Err(AppError::JobRestart(format!(
                        "partition '{}' ended in an unknown state",
                        worker_name
                    )));
                }
                Some(last) if last.status == BatchStatus::Completed => {
                    if !self.allow_start_if_complete {
                        debug!(partition = %worker_name, "Partition already complete");
                        continue;
                    }
                    input
                }
                Some(last) => last.execution_context,
            };

            workers.push(
                repository
                    .create_step_execution(context.job_execution_id(), &worker_name, start_context)
                    .await?,
            );
        }
        Ok(workers)
    }
}

/// Runs the worker executions produced by a splitter and returns them in
/// their final state.
#[async_trait]
pub trait PartitionHandler: Send + Sync {
    async fn handle(
        &self,
        splitter: &StepExecutionSplitter,
        manager: &mut StepExecution,
        context: &StepContext,
    ) -> Result<Vec<StepExecution>>;
}

/// Runs every partition in-process on tokio tasks.
pub struct TaskExecutorPartitionHandler {
    step: Arc<dyn Step>,
    grid_size: usize,
    concurrency: usize,
}

impl TaskExecutorPartitionHandler {
    pub fn new(step: Arc<dyn Step>, grid_size: usize) -> Self {
        Self {
            step,
            grid_size,
            concurrency: DEFAULT_WORKER_POOL_SIZE,
        }
    }

    /// Upper bound of partitions running at once
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[async_trait]
impl PartitionHandler for TaskExecutorPartitionHandler {
    async fn handle(
        &self,
        splitter: &StepExecutionSplitter,
        manager: &mut StepExecution,
        context: &StepContext,
    ) -> Result<Vec<StepExecution>> {
        let workers = splitter.split(manager, self.grid_size, context).await?;
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for mut worker in workers {
            let step = self.step.clone();
            let context = context.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| AppError::Internal(format!("partition pool closed: {}", e)))?;
                step.execute(&mut worker, &context).await?;
                Ok::<_, AppError>(worker)
            });
        }

        let mut finished = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(worker)) => finished.push(worker),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(AppError::Internal(format!(
                        "partition task failed: {}",
                        e
                    )));
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        finished.sort_by(|a, b| a.step_name.cmp(&b.step_name));
        Ok(finished)
    }
}

/// Hands partitions to remote workers and polls the repository until they
/// have all finished.
pub struct RemotePartitionHandler {
    step_name: String,
    dispatcher: Arc<dyn StepRequestDispatcher>,
    grid_size: usize,
    poll_interval: Duration,
    timeout: Option<Duration>,
}

impl RemotePartitionHandler {
    /// `step_name` is the worker step remote workers look up.
    pub fn new(
        step_name: impl Into<String>,
        dispatcher: Arc<dyn StepRequestDispatcher>,
        grid_size: usize,
    ) -> Self {
        Self {
            step_name: step_name.into(),
            dispatcher,
            grid_size,
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: None,
        }
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl PartitionHandler for RemotePartitionHandler {
    async fn handle(
        &self,
        splitter: &StepExecutionSplitter,
        manager: &mut StepExecution,
        context: &StepContext,
    ) -> Result<Vec<StepExecution>> {
        let workers = splitter.split(manager, self.grid_size, context).await?;
        for worker in &workers {
            self.dispatcher
                .dispatch(StepExecutionRequest {
                    step_name: self.step_name.clone(),
                    job_execution_id: worker.job_execution_id,
                    step_execution_id: worker.id,
                })
                .await?;
        }
        info!(
            step = %splitter.step_name(),
            partitions = workers.len(),
            "Dispatched partitions to remote workers"
        );

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let mut pending: Vec<StepExecution> = workers;
        let mut finished = Vec::new();
        loop {
            let mut still_running = Vec::new();
            for worker in pending {
                let current = context
                    .repository()
                    .get_step_execution(worker.job_execution_id, worker.id)
                    .await?
                    .ok_or_else(|| {
                        AppError::InvalidState(format!(
                            "worker step execution {} disappeared",
                            worker.id
                        ))
                    })?;
                if current.status.is_running() {
                    still_running.push(current);
                } else {
                    finished.push(current);
                }
            }
            if still_running.is_empty() {
                finished.sort_by(|a, b| a.step_name.cmp(&b.step_name));
                return Ok(finished);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                warn!(
                    step = %splitter.step_name(),
                    running = still_running.len(),
                    "Timed out waiting for remote partitions"
                );
                return Err(AppError::Timeout(format!(
                    "{} partition(s) of '{}' still running",
                    still_running.len(),
                    splitter.step_name()
                )));
            }
            pending = still_running;
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

/// Worker side of remote partitioning: runs the step execution a request
/// names.
pub struct StepExecutionRequestHandler {
    repository: Arc<dyn JobRepository>,
    time_provider: Arc<dyn TimeProvider>,
    steps: HashMap<String, Arc<dyn Step>>,
}

impl StepExecutionRequestHandler {
    pub fn new(repository: Arc<dyn JobRepository>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            repository,
            time_provider,
            steps: HashMap::new(),
        }
    }

    pub fn step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.insert(step.name().to_string(), step);
        self
    }

    pub async fn handle(&self, request: &StepExecutionRequest) -> Result<StepExecution> {
        let job_execution = self
            .repository
            .get_job_execution(request.job_execution_id)
            .await?
            .ok_or(AppError::NoSuchJobExecution(request.job_execution_id))?;
        let mut step_execution = self
            .repository
            .get_step_execution(request.job_execution_id, request.step_execution_id)
            .await?
            .ok_or_else(|| {
                AppError::InvalidState(format!(
                    "no step execution {} in job execution {}",
                    request.step_execution_id, request.job_execution_id
                ))
            })?;
        let step = self.steps.get(&request.step_name).ok_or_else(|| {
            AppError::Config(format!("no worker step named '{}'", request.step_name))
        })?;

        let context = StepContext::new(
            &job_execution,
            self.repository.clone(),
            self.time_provider.clone(),
            StopSignal::new(),
        );
        step.execute(&mut step_execution, &context).await?;
        Ok(step_execution)
    }
}

/// Manager step: splits, delegates to a handler and aggregates the workers.
pub struct PartitionStep {
    settings: StepSettings,
    splitter: StepExecutionSplitter,
    handler: Arc<dyn PartitionHandler>,
}

impl PartitionStep {
    pub fn new(
        name: impl Into<String>,
        partitioner: Arc<dyn Partitioner>,
        handler: Arc<dyn PartitionHandler>,
    ) -> Self {
        let settings = StepSettings::new(name);
        let splitter = StepExecutionSplitter::new(settings.name.clone(), partitioner);
        Self {
            settings,
            splitter,
            handler,
        }
    }

    pub fn start_limit(mut self, start_limit: u32) -> Self {
        self.settings.start_limit = start_limit;
        self
    }

    /// Also reruns completed partitions on restart.
    pub fn allow_start_if_complete(mut self, allow: bool) -> Self {
        self.settings.allow_start_if_complete = allow;
        self.splitter = self.splitter.allow_start_if_complete(allow);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn StepExecutionListener>) -> Self {
        self.settings.listeners.push(listener);
        self
    }
}

#[async_trait]
impl StepWork for PartitionStep {
    async fn do_execute(&self, manager: &mut StepExecution, context: &StepContext) -> Result<()> {
        let workers = self.handler.handle(&self.splitter, manager, context).await?;

        let mut status = BatchStatus::Completed;
        let mut exit_status = ExitStatus::executing();
        for worker in &workers {
            manager.accumulate(worker);
            status = status.max(worker.status);
            exit_status = exit_status.and(&worker.exit_status);
        }
        manager.exit_status = manager.exit_status.and(&exit_status);

        if status == BatchStatus::Stopped {
            return Err(AppError::JobInterrupted(format!(
                "partitions of '{}' were stopped",
                self.settings.name
            )));
        }
        if status.is_unsuccessful() {
            return Err(AppError::Execution(format!(
                "{} of {} partitions of '{}' did not complete",
                workers.iter().filter(|w| w.status != BatchStatus::Completed).count(),
                workers.len(),
                self.settings.name
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Step for PartitionStep {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn start_limit(&self) -> u32 {
        self.settings.start_limit
    }

    fn allow_start_if_complete(&self) -> bool {
        self.settings.allow_start_if_complete
    }

    async fn execute(&self, step_execution: &mut StepExecution, context: &StepContext) -> Result<()> {
        run_lifecycle(self, &self.settings, step_execution, context).await
    }
}
