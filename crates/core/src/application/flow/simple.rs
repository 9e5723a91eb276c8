// Simple flow - validated state graph walked one transition at a time

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use super::executor::FlowExecutor;
use super::state::State;
use super::status::{FlowExecution, FlowExecutionStatus};
use super::transition::StateTransition;
use super::{Flow, STATE_SEPARATOR};
use crate::domain::StepExecution;
use crate::error::{AppError, Result};

const PENDING: &str = "PENDING";
const STOPPED: &str = "STOPPED";

pub struct SimpleFlow {
    name: String,
    start: String,
    states: HashMap<String, Arc<dyn State>>,
    order: Vec<String>,
    transitions: HashMap<String, Vec<StateTransition>>,
}

impl std::fmt::Debug for SimpleFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleFlow")
            .field("name", &self.name)
            .field("start", &self.start)
            .field("states", &self.order)
            .finish()
    }
}

impl SimpleFlow {
    /// Validate and assemble a flow.
    ///
    /// The start state defaults to the first state. Every transition must
    /// leave a known state and name a known next state, and at least one
    /// transition must end the flow. End states without transitions get a
    /// catch-all end transition.
    pub fn new(
        name: impl Into<String>,
        start: Option<&str>,
        states: Vec<Arc<dyn State>>,
        transitions: Vec<StateTransition>,
    ) -> Result<Self> {
        let name = name.into();
        let mut by_name: HashMap<String, Arc<dyn State>> = HashMap::new();
        let mut order = Vec::with_capacity(states.len());
        for state in states {
            let state_name = state.name().to_string();
            if by_name.insert(state_name.clone(), state).is_some() {
                return Err(AppError::FlowExecution(format!(
                    "duplicate state '{state_name}' in flow '{name}'"
                )));
            }
            order.push(state_name);
        }

        let start = match start {
            Some(start) if by_name.contains_key(start) => start.to_string(),
            Some(start) => {
                return Err(AppError::FlowExecution(format!(
                    "start state '{start}' not found in flow '{name}'"
                )))
            }
            None => order.first().cloned().ok_or_else(|| {
                AppError::FlowExecution(format!("flow '{name}' has no states"))
            })?,
        };

        let mut grouped: HashMap<String, Vec<StateTransition>> = HashMap::new();
        for transition in transitions {
            if !by_name.contains_key(transition.state_name()) {
                return Err(AppError::FlowExecution(format!(
                    "transition from unknown state '{}' in flow '{name}'",
                    transition.state_name()
                )));
            }
            if let Some(next) = transition.next() {
                if !by_name.contains_key(next) {
                    return Err(AppError::FlowExecution(format!(
                        "next state '{next}' not found in flow '{name}'"
                    )));
                }
            }
            grouped
                .entry(transition.state_name().to_string())
                .or_default()
                .push(transition);
        }

        for state_name in &order {
            let state = &by_name[state_name];
            if let Some(target) = state.restart_target() {
                if !by_name.contains_key(target) {
                    return Err(AppError::FlowExecution(format!(
                        "restart state '{target}' not found in flow '{name}'"
                    )));
                }
            }
            if state.is_end_state() && !grouped.contains_key(state_name) {
                grouped.insert(
                    state_name.clone(),
                    vec![StateTransition::end(state_name.clone(), "*")],
                );
            }
        }

        if !grouped.values().flatten().any(StateTransition::is_end) {
            return Err(AppError::FlowExecution(format!(
                "no end state found in flow '{name}'"
            )));
        }
        for transitions in grouped.values_mut() {
            transitions.sort_by(|a, b| a.specificity_cmp(b));
        }

        Ok(Self {
            name,
            start,
            states: by_name,
            order,
            transitions: grouped,
        })
    }

    pub fn start_state(&self) -> &str {
        &self.start
    }

    pub fn transitions(&self, state_name: &str) -> &[StateTransition] {
        self.transitions
            .get(state_name)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    fn find_state(&self, state_name: &str) -> Option<Arc<dyn State>> {
        if let Some(state) = self.states.get(state_name) {
            return Some(state.clone());
        }
        let short = state_name
            .rsplit(STATE_SEPARATOR)
            .next()
            .unwrap_or(state_name);
        let suffix = format!("{STATE_SEPARATOR}{short}");
        self.order
            .iter()
            .find(|candidate| *candidate == short || candidate.ends_with(&suffix))
            .and_then(|candidate| self.states.get(candidate).cloned())
    }

    /// Resolve the state that follows `state_name` given its outcome.
    ///
    /// The exit code is tried first (`PENDING` also matches a `STOPPED`
    /// pattern), then the raw status of the last step. `None` ends the flow.
    fn next_state(
        &self,
        state_name: &str,
        status: &FlowExecutionStatus,
        last_step: Option<&StepExecution>,
    ) -> Result<Option<Arc<dyn State>>> {
        let transitions = self.transitions.get(state_name).ok_or_else(|| {
            AppError::FlowExecution(format!(
                "no transitions found in flow '{}' for state '{state_name}'",
                self.name
            ))
        })?;

        let exit_code = status.name();
        let matched = transitions
            .iter()
            .find(|t| t.matches(exit_code) || (exit_code == PENDING && t.matches(STOPPED)))
            .or_else(|| {
                let raw = last_step?.status.as_str();
                transitions.iter().find(|t| t.matches(raw))
            })
            .ok_or_else(|| {
                AppError::FlowExecution(format!(
                    "no transition found in flow '{}' for state '{state_name}' with status '{exit_code}'",
                    self.name
                ))
            })?;

        match matched.next() {
            None => Ok(None),
            Some(next) => self.states.get(next).cloned().map(Some).ok_or_else(|| {
                AppError::FlowExecution(format!(
                    "next state '{next}' not found in flow '{}'",
                    self.name
                ))
            }),
        }
    }
}

#[async_trait]
impl Flow for SimpleFlow {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self, executor: &FlowExecutor) -> Result<FlowExecution> {
        self.resume(&self.start, executor).await
    }

    async fn resume(&self, state_name: &str, executor: &FlowExecutor) -> Result<FlowExecution> {
        let mut state = self.find_state(state_name).ok_or_else(|| {
            AppError::FlowExecution(format!(
                "state '{state_name}' not found in flow '{}'",
                self.name
            ))
        })?;
        info!(flow = %self.name, state = state.name(), "Flow running");

        loop {
            let current = state.name().to_string();
            debug!(flow = %self.name, state = %current, "Handling state");
            let status = state.handle(executor).await?;
            let last_step = executor.last_step_execution().await;

            match self.next_state(&current, &status, last_step.as_ref())? {
                Some(next) if status.name() != STOPPED => state = next,
                _ => {
                    debug!(flow = %self.name, state = %current, status = %status, "Flow ended");
                    return Ok(FlowExecution::new(current, status));
                }
            }
        }
    }

    fn state(&self, state_name: &str) -> Option<Arc<dyn State>> {
        self.find_state(state_name)
    }

    fn state_names(&self) -> Vec<String> {
        self.order.clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::application::fixtures::Fixture;
    use crate::application::flow::state::{
        DecisionState, EndState, FnDecider, SplitState, StepState,
    };
    use crate::application::repeat::RepeatStatus;
    use crate::application::step::{FnTasklet, Step, TaskletStep};
    use crate::domain::{BatchStatus, ExitStatus};

    pub(crate) fn ok_step(name: &str) -> Arc<dyn Step> {
        Arc::new(
            TaskletStep::builder(name)
                .tasklet(Arc::new(FnTasklet::new(|_, _| Ok(RepeatStatus::Finished))))
                .build()
                .unwrap(),
        )
    }

    pub(crate) fn failing_step(name: &str) -> Arc<dyn Step> {
        Arc::new(
            TaskletStep::builder(name)
                .tasklet(Arc::new(FnTasklet::new(|_, _| {
                    Err(AppError::Execution("boom".to_string()))
                })))
                .build()
                .unwrap(),
        )
    }

    pub(crate) fn exit_step(name: &str, code: &'static str) -> Arc<dyn Step> {
        Arc::new(
            TaskletStep::builder(name)
                .tasklet(Arc::new(FnTasklet::new(move |contribution, _| {
                    contribution.exit_status = ExitStatus::new(code);
                    Ok(RepeatStatus::Finished)
                })))
                .build()
                .unwrap(),
        )
    }

    fn executor(fixture: &Fixture) -> FlowExecutor {
        FlowExecutor::new(
            fixture.job_execution.clone(),
            fixture.repository.clone(),
            fixture.time_provider.clone(),
            fixture.stop_signal.clone(),
        )
    }

    fn step_state(step: Arc<dyn Step>) -> Arc<dyn State> {
        Arc::new(StepState::new(step))
    }

    #[tokio::test]
    async fn test_completed_exit_code_ends_flow() {
        let fixture = Fixture::new("job").await;
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![step_state(ok_step("load")), step_state(ok_step("retry"))],
            vec![
                StateTransition::end("load", "COMPLETED"),
                StateTransition::new("load", "FAILED", "retry"),
                StateTransition::end("retry", "*"),
            ],
        )
        .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.name, "load");
        assert_eq!(result.status, FlowExecutionStatus::completed());
        let job = executor.job_execution().await;
        assert_eq!(job.step_executions.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_exit_code_routes_to_next_state() {
        let fixture = Fixture::new("job").await;
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![step_state(failing_step("load")), step_state(ok_step("retry"))],
            vec![
                StateTransition::end("load", "COMPLETED"),
                StateTransition::new("load", "FAILED", "retry"),
                StateTransition::end("retry", "*"),
            ],
        )
        .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.name, "retry");
        assert_eq!(result.status, FlowExecutionStatus::completed());
        // Routing away from the failure abandons it.
        let job = executor.job_execution().await;
        assert_eq!(job.step_execution("load").unwrap().status, BatchStatus::Abandoned);
    }

    #[tokio::test]
    async fn test_unmapped_exit_code_falls_back_to_step_status() {
        let fixture = Fixture::new("job").await;
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![step_state(exit_step("load", "CUSTOM")), step_state(ok_step("retry"))],
            vec![
                StateTransition::end("load", "COMPLETED"),
                StateTransition::new("load", "FAILED", "retry"),
                StateTransition::end("retry", "*"),
            ],
        )
        .unwrap();

        let result = flow.start(&executor(&fixture)).await.unwrap();
        assert_eq!(result.name, "load");
        assert_eq!(result.status.name(), "CUSTOM");
    }

    #[tokio::test]
    async fn test_no_matching_transition_is_flow_error() {
        let fixture = Fixture::new("job").await;
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![step_state(ok_step("load")), step_state(ok_step("retry"))],
            vec![
                StateTransition::new("load", "FAILED", "retry"),
                StateTransition::end("retry", "*"),
            ],
        )
        .unwrap();

        let err = flow.start(&executor(&fixture)).await.unwrap_err();
        assert!(matches!(err, AppError::FlowExecution(msg) if msg.contains("no transition found")));
    }

    #[tokio::test]
    async fn test_pending_matches_stopped_pattern() {
        let fixture = Fixture::new("job").await;
        let decider = Arc::new(FnDecider::new(|_, _| FlowExecutionStatus::new("PENDING")));
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![
                Arc::new(DecisionState::new("decide", decider)),
                Arc::new(EndState::new(
                    "wait",
                    FlowExecutionStatus::completed(),
                    "WAITING",
                )),
            ],
            vec![StateTransition::new("decide", "STOPPED", "wait")],
        )
        .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();
        assert_eq!(result.name, "wait");
        assert_eq!(executor.job_execution().await.exit_status.exit_code(), "WAITING");
    }

    #[test]
    fn test_invalid_flows_are_rejected() {
        let missing_next = SimpleFlow::new(
            "main",
            None,
            vec![step_state(ok_step("load"))],
            vec![
                StateTransition::new("load", "COMPLETED", "nowhere"),
                StateTransition::end("load", "*"),
            ],
        )
        .unwrap_err();
        assert!(matches!(missing_next, AppError::FlowExecution(msg) if msg.contains("next state 'nowhere' not found")));

        let no_end = SimpleFlow::new(
            "main",
            None,
            vec![step_state(ok_step("a")), step_state(ok_step("b"))],
            vec![
                StateTransition::new("a", "*", "b"),
                StateTransition::new("b", "*", "a"),
            ],
        )
        .unwrap_err();
        assert!(matches!(no_end, AppError::FlowExecution(msg) if msg.contains("no end state")));

        let bad_start = SimpleFlow::new(
            "main",
            Some("other"),
            vec![step_state(ok_step("a"))],
            vec![StateTransition::end("a", "*")],
        )
        .unwrap_err();
        assert!(matches!(bad_start, AppError::FlowExecution(_)));
    }

    #[test]
    fn test_suffix_lookup() {
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![
                step_state(ok_step("load")),
                Arc::new(EndState::new(
                    "main.stop0",
                    FlowExecutionStatus::stopped(),
                    "STOPPED",
                )),
            ],
            vec![StateTransition::new("load", "*", "main.stop0")],
        )
        .unwrap();

        assert_eq!(flow.state("outer.load").unwrap().name(), "load");
        assert_eq!(flow.state("stop0").unwrap().name(), "main.stop0");
        assert!(flow.state("missing").is_none());
        assert_eq!(flow.transitions("main.stop0").len(), 1);
    }

    #[tokio::test]
    async fn test_split_aggregates_worst_status() {
        let fixture = Fixture::new("job").await;
        let completed: Arc<dyn Flow> = Arc::new(
            SimpleFlow::new(
                "left",
                None,
                vec![step_state(ok_step("left.step"))],
                vec![StateTransition::end("left.step", "*")],
            )
            .unwrap(),
        );
        let failed: Arc<dyn Flow> = Arc::new(
            SimpleFlow::new(
                "right",
                None,
                vec![step_state(failing_step("right.step"))],
                vec![StateTransition::end("right.step", "*")],
            )
            .unwrap(),
        );
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![Arc::new(SplitState::new("split", vec![completed, failed]).concurrency(2))],
            vec![StateTransition::end("split", "*")],
        )
        .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.status, FlowExecutionStatus::failed());
        let job = executor.job_execution().await;
        assert_eq!(job.step_executions.len(), 2);
    }

    #[tokio::test]
    async fn test_end_state_with_unknown_step_reports_unknown() {
        let fixture = Fixture::new("job").await;
        let flow = SimpleFlow::new(
            "main",
            None,
            vec![
                step_state(ok_step("load")),
                Arc::new(EndState::new(
                    "done",
                    FlowExecutionStatus::completed(),
                    "COMPLETED",
                )),
            ],
            vec![StateTransition::new("load", "*", "done")],
        )
        .unwrap();
        let executor = executor(&fixture);
        flow.start(&executor).await.unwrap();

        // Simulate a lost final update of the step.
        let mut last = executor.last_step_execution().await.unwrap();
        last.status = BatchStatus::Unknown;
        let resumed = FlowExecutor::new(
            executor.job_execution().await,
            fixture.repository.clone(),
            fixture.time_provider.clone(),
            fixture.stop_signal.clone(),
        );
        resumed.set_last_step_execution(last).await;
        let status = flow
            .state("done")
            .unwrap()
            .handle(&resumed)
            .await
            .unwrap();
        assert_eq!(status, FlowExecutionStatus::unknown());
    }
}
