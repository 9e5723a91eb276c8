// Flow states

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::executor::FlowExecutor;
use super::status::FlowExecutionStatus;
use super::Flow;
use crate::application::constants::DEFAULT_WORKER_POOL_SIZE;
use crate::application::step::Step;
use crate::domain::{BatchStatus, JobExecution, StepExecution};
use crate::error::{AppError, Result};

/// Node of a flow graph.
#[async_trait]
pub trait State: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus>;

    fn is_end_state(&self) -> bool {
        false
    }

    /// State a restart continues from after this state stopped the flow.
    fn restart_target(&self) -> Option<&str> {
        None
    }
}

/// Runs one step; routes on the step's exit code.
pub struct StepState {
    name: String,
    step: Arc<dyn Step>,
}

impl StepState {
    pub fn new(step: Arc<dyn Step>) -> Self {
        Self {
            name: step.name().to_string(),
            step,
        }
    }

    pub fn named(name: impl Into<String>, step: Arc<dyn Step>) -> Self {
        Self {
            name: name.into(),
            step,
        }
    }
}

#[async_trait]
impl State for StepState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus> {
        // A failed step we are routing away from must not block a restart.
        executor.abandon_step_execution().await?;
        let exit_code = executor.execute_step(self.step.as_ref()).await?;
        Ok(FlowExecutionStatus::new(exit_code))
    }
}

/// Chooses the next status from the job and the last step, running nothing.
#[async_trait]
pub trait JobExecutionDecider: Send + Sync {
    async fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> FlowExecutionStatus;
}

/// Decider built from a closure.
pub struct FnDecider<F> {
    f: F,
}

impl<F> FnDecider<F>
where
    F: Fn(&JobExecution, Option<&StepExecution>) -> FlowExecutionStatus + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> JobExecutionDecider for FnDecider<F>
where
    F: Fn(&JobExecution, Option<&StepExecution>) -> FlowExecutionStatus + Send + Sync,
{
    async fn decide(
        &self,
        job_execution: &JobExecution,
        step_execution: Option<&StepExecution>,
    ) -> FlowExecutionStatus {
        (self.f)(job_execution, step_execution)
    }
}

pub struct DecisionState {
    name: String,
    decider: Arc<dyn JobExecutionDecider>,
}

impl DecisionState {
    pub fn new(name: impl Into<String>, decider: Arc<dyn JobExecutionDecider>) -> Self {
        Self {
            name: name.into(),
            decider,
        }
    }
}

#[async_trait]
impl State for DecisionState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus> {
        let job = executor.job_execution().await;
        let last = executor.last_step_execution().await;
        let status = self.decider.decide(&job, last.as_ref()).await;
        debug!(decision = %self.name, status = %status, "Decision made");
        Ok(status)
    }
}

/// Runs sub-flows concurrently and joins them; the worst status wins.
pub struct SplitState {
    name: String,
    flows: Vec<Arc<dyn Flow>>,
    concurrency: usize,
}

impl SplitState {
    pub fn new(name: impl Into<String>, flows: Vec<Arc<dyn Flow>>) -> Self {
        Self {
            name: name.into(),
            flows,
            concurrency: DEFAULT_WORKER_POOL_SIZE,
        }
    }

    /// Bound on branches running at once.
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }
}

#[async_trait]
impl State for SplitState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus> {
        info!(
            split = %self.name,
            branches = self.flows.len(),
            concurrency = self.concurrency,
            "Starting split"
        );
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();
        for flow in &self.flows {
            let flow = flow.clone();
            let branch = executor.branch();
            let permits = permits.clone();
            set.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| AppError::Internal(format!("split pool closed: {e}")))?;
                flow.start(&branch).await
            });
        }

        let mut status: Option<FlowExecutionStatus> = None;
        let mut first_error: Option<AppError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Ok(execution)) => {
                    debug!(
                        split = %self.name,
                        flow = %execution.name,
                        status = %execution.status,
                        "Split branch finished"
                    );
                    status = Some(match status {
                        Some(current) => current.max(execution.status),
                        None => execution.status,
                    });
                }
                Ok(Err(e)) => {
                    warn!(split = %self.name, error = %e, "Split branch failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(AppError::Internal(format!(
                        "split branch panicked: {e}"
                    )));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        Ok(status.unwrap_or_else(FlowExecutionStatus::completed))
    }
}

/// Embeds another flow as a single state.
pub struct FlowState {
    name: String,
    flow: Arc<dyn Flow>,
}

impl FlowState {
    pub fn new(flow: Arc<dyn Flow>) -> Self {
        Self {
            name: flow.name().to_string(),
            flow,
        }
    }
}

#[async_trait]
impl State for FlowState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus> {
        Ok(self.flow.start(executor).await?.status)
    }
}

/// Terminal state with a fixed outcome.
pub struct EndState {
    name: String,
    status: FlowExecutionStatus,
    exit_code: String,
    abandon: bool,
    restart: Option<String>,
}

impl EndState {
    pub fn new(
        name: impl Into<String>,
        status: FlowExecutionStatus,
        exit_code: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            status,
            exit_code: exit_code.into(),
            abandon: false,
            restart: None,
        }
    }

    /// Also mark the last step ABANDONED so a restart skips it.
    pub fn abandon(mut self) -> Self {
        self.abandon = true;
        self
    }

    /// State a restart resumes at after this state stopped the flow.
    pub fn restart_at(mut self, state_name: impl Into<String>) -> Self {
        self.restart = Some(state_name.into());
        self
    }

    pub fn status(&self) -> &FlowExecutionStatus {
        &self.status
    }
}

#[async_trait]
impl State for EndState {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, executor: &FlowExecutor) -> Result<FlowExecutionStatus> {
        // A step whose final status could not be saved leaves the job unknown.
        if executor
            .last_step_execution()
            .await
            .is_some_and(|s| s.status == BatchStatus::Unknown)
        {
            return Ok(FlowExecutionStatus::unknown());
        }

        if self.abandon {
            executor.abandon_step_execution().await?;
        }
        if self.status.is_stop() && self.restart.is_some() {
            executor.record_stopped_state(&self.name).await;
        }
        executor.add_exit_status(&self.exit_code).await;
        Ok(self.status.clone())
    }

    fn is_end_state(&self) -> bool {
        true
    }

    fn restart_target(&self) -> Option<&str> {
        self.restart.as_deref()
    }
}
