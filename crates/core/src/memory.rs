// In-memory JobRepository backing (tests, demos, single-process runs)

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    BatchStatus, ExecutionContext, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters,
    StepExecution, StepExecutionId,
};
use crate::error::{AppError, Result};
use crate::port::{JobRepository, TimeProvider};

/// All repository state. Guarded by a single lock so every operation is
/// atomic, including find-or-create and the running-execution check.
#[derive(Default)]
struct MemoryState {
    next_id: i64,
    instances: BTreeMap<JobInstanceId, JobInstance>,
    /// (job name, job key) -> instance id
    instance_keys: HashMap<(String, String), JobInstanceId>,
    /// Executions are stored without their step executions.
    executions: BTreeMap<JobExecutionId, JobExecution>,
    steps: BTreeMap<StepExecutionId, StepExecution>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn find_instance(&self, job_name: &str, key: &str) -> Option<&JobInstance> {
        self.instance_keys
            .get(&(job_name.to_string(), key.to_string()))
            .and_then(|id| self.instances.get(id))
    }

    fn executions_of(&self, instance_id: JobInstanceId) -> impl Iterator<Item = &JobExecution> {
        self.executions
            .values()
            .filter(move |e| e.instance.id == instance_id)
    }

    fn last_execution_of(&self, instance_id: JobInstanceId) -> Option<&JobExecution> {
        self.executions_of(instance_id)
            .max_by_key(|e| (e.create_time, e.id))
    }

    fn assemble(&self, execution: &JobExecution) -> JobExecution {
        let mut assembled = execution.clone();
        assembled.step_executions = self
            .steps
            .values()
            .filter(|s| s.job_execution_id == execution.id)
            .cloned()
            .collect();
        assembled
    }

    fn steps_of_instance<'a>(
        &'a self,
        instance_id: JobInstanceId,
        step_name: &'a str,
    ) -> impl Iterator<Item = &'a StepExecution> + 'a {
        self.steps.values().filter(move |s| {
            s.step_name == step_name
                && self
                    .executions
                    .get(&s.job_execution_id)
                    .map(|e| e.instance.id == instance_id)
                    .unwrap_or(false)
        })
    }
}

/// [`JobRepository`] backed by process memory.
pub struct InMemoryJobRepository {
    state: Mutex<MemoryState>,
    time_provider: Arc<dyn TimeProvider>,
}

impl InMemoryJobRepository {
    pub fn new(time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            time_provider,
        }
    }
}

#[async_trait]
impl JobRepository for InMemoryJobRepository {
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>> {
        let state = self.state.lock().await;
        Ok(state
            .find_instance(job_name, &parameters.identity_key())
            .cloned())
    }

    async fn find_or_create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance> {
        let key = parameters.identity_key();
        let mut state = self.state.lock().await;
        if let Some(instance) = state.find_instance(job_name, &key) {
            return Ok(instance.clone());
        }

        let id = state.next_id();
        let instance = JobInstance::new(id, job_name, key.clone());
        state.instances.insert(id, instance.clone());
        state.instance_keys.insert((job_name.to_string(), key), id);
        debug!(job_name = %job_name, instance_id = id, "Created job instance");
        Ok(instance)
    }

    async fn get_job_instance(&self, instance_id: JobInstanceId) -> Result<Option<JobInstance>> {
        Ok(self.state.lock().await.instances.get(&instance_id).cloned())
    }

    async fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution> {
        let mut state = self.state.lock().await;
        if !state.instances.contains_key(&instance.id) {
            return Err(AppError::InvalidState(format!(
                "job instance {} does not exist",
                instance.id
            )));
        }
        if let Some(running) = state.executions_of(instance.id).find(|e| e.is_running()) {
            return Err(AppError::JobExecutionAlreadyRunning(format!(
                "execution {} of job '{}' is {}",
                running.id, instance.job_name, running.status
            )));
        }

        let previous_context = state
            .last_execution_of(instance.id)
            .map(|e| e.execution_context.clone())
            .unwrap_or_default();

        let id = state.next_id();
        let mut execution = JobExecution::new(
            id,
            instance.clone(),
            parameters.clone(),
            self.time_provider.now_millis(),
        );
        execution.execution_context = previous_context;
        execution.execution_context.clear_dirty();
        execution.last_updated = Some(execution.create_time);
        state.executions.insert(id, execution.clone());
        Ok(execution)
    }

    async fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
        context: ExecutionContext,
    ) -> Result<StepExecution> {
        let mut state = self.state.lock().await;
        if !state.executions.contains_key(&job_execution_id) {
            return Err(AppError::NoSuchJobExecution(job_execution_id));
        }
        let id = state.next_id();
        let mut step = StepExecution::new(id, job_execution_id, step_name);
        step.execution_context = context;
        step.execution_context.clear_dirty();
        step.last_updated = Some(self.time_provider.now_millis());
        state.steps.insert(id, step.clone());
        Ok(step)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .executions
            .get_mut(&execution.id)
            .ok_or(AppError::NoSuchJobExecution(execution.id))?;
        if stored.version != execution.version {
            return Err(AppError::OptimisticLocking(format!(
                "job execution {} has version {} but update carries {}",
                execution.id, stored.version, execution.version
            )));
        }

        execution.version += 1;
        execution.last_updated = Some(self.time_provider.now_millis());
        execution.execution_context.clear_dirty();
        let mut copy = execution.clone();
        copy.step_executions.clear();
        *stored = copy;
        Ok(())
    }

    async fn update_step_execution(&self, execution: &mut StepExecution) -> Result<()> {
        let mut state = self.state.lock().await;
        let stored = state.steps.get_mut(&execution.id).ok_or_else(|| {
            AppError::InvalidState(format!("step execution {} does not exist", execution.id))
        })?;
        if stored.version != execution.version {
            return Err(AppError::OptimisticLocking(format!(
                "step execution {} has version {} but update carries {}",
                execution.id, stored.version, execution.version
            )));
        }

        execution.version += 1;
        execution.last_updated = Some(self.time_provider.now_millis());
        execution.execution_context.clear_dirty();
        *stored = execution.clone();
        Ok(())
    }

    async fn synchronize_status(&self, execution: &mut JobExecution) -> Result<()> {
        let state = self.state.lock().await;
        let stored = state
            .executions
            .get(&execution.id)
            .ok_or(AppError::NoSuchJobExecution(execution.id))?;
        if stored.version != execution.version {
            execution.upgrade_status(stored.status);
            execution.version = stored.version;
        }
        Ok(())
    }

    async fn get_last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .steps_of_instance(instance.id, step_name)
            .max_by_key(|s| (s.start_time.unwrap_or(i64::MIN), s.id))
            .cloned())
    }

    async fn get_step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<u32> {
        let state = self.state.lock().await;
        Ok(state.steps_of_instance(instance.id, step_name).count() as u32)
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>> {
        let state = self.state.lock().await;
        let Some(instance) = state.find_instance(job_name, &parameters.identity_key()) else {
            return Ok(None);
        };
        Ok(state
            .last_execution_of(instance.id)
            .map(|e| state.assemble(e)))
    }

    async fn get_job_execution(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<Option<JobExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .get(&execution_id)
            .map(|e| state.assemble(e)))
    }

    async fn get_job_execution_status(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<Option<BatchStatus>> {
        let state = self.state.lock().await;
        Ok(state.executions.get(&execution_id).map(|e| e.status))
    }

    async fn find_job_executions(&self, instance: &JobInstance) -> Result<Vec<JobExecution>> {
        let state = self.state.lock().await;
        let mut executions: Vec<JobExecution> = state
            .executions_of(instance.id)
            .map(|e| state.assemble(e))
            .collect();
        executions.sort_by_key(|e| std::cmp::Reverse(e.id));
        Ok(executions)
    }

    async fn find_running_job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .executions
            .values()
            .filter(|e| e.job_name() == job_name && e.is_running())
            .map(|e| state.assemble(e))
            .collect())
    }

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> Result<Option<StepExecution>> {
        let state = self.state.lock().await;
        Ok(state
            .steps
            .get(&step_execution_id)
            .filter(|s| s.job_execution_id == job_execution_id)
            .cloned())
    }
}
