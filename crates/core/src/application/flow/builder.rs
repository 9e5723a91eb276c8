// Flow builder - fluent construction of a SimpleFlow

use std::sync::Arc;

use super::simple::SimpleFlow;
use super::state::{EndState, State, StepState};
use super::status::FlowExecutionStatus;
use super::transition::StateTransition;
use crate::application::step::Step;
use crate::domain::exit_codes;
use crate::error::{AppError, Result};

/// Fluent builder over a "current state" cursor.
///
/// ```ignore
/// let flow = FlowBuilder::new("main")
///     .start_step(load)
///     .on("FAILED").to_step(cleanup)
///     .from("load").on("*").to_step(report)
///     .build()?;
/// ```
///
/// On build, a state left without transitions ends the flow COMPLETED on
/// `COMPLETED` and FAILED on anything else. A state with transitions but no
/// `*` pattern ends the flow with its own status when nothing matches.
pub struct FlowBuilder {
    name: String,
    start: Option<String>,
    states: Vec<Arc<dyn State>>,
    transitions: Vec<StateTransition>,
    current: Option<String>,
    end_counter: usize,
    error: Option<AppError>,
}

impl FlowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: None,
            states: Vec::new(),
            transitions: Vec::new(),
            current: None,
            end_counter: 0,
            error: None,
        }
    }

    pub fn start(mut self, state: Arc<dyn State>) -> Self {
        let name = self.add_state(state);
        self.start = Some(name.clone());
        self.current = Some(name);
        self
    }

    pub fn start_step(self, step: Arc<dyn Step>) -> Self {
        self.start(Arc::new(StepState::new(step)))
    }

    /// Continue with `state` when the current state COMPLETED.
    pub fn next(mut self, state: Arc<dyn State>) -> Self {
        let Some(current) = self.current.clone() else {
            return self.start(state);
        };
        let name = self.add_state(state);
        self.transitions
            .push(StateTransition::new(current, exit_codes::COMPLETED, name.clone()));
        self.current = Some(name);
        self
    }

    pub fn next_step(self, step: Arc<dyn Step>) -> Self {
        self.next(Arc::new(StepState::new(step)))
    }

    /// Move the cursor back to an already declared state.
    pub fn from(mut self, state_name: &str) -> Self {
        if self.states.iter().any(|s| s.name() == state_name) {
            self.current = Some(state_name.to_string());
        } else {
            self.error.get_or_insert(AppError::FlowExecution(format!(
                "state '{state_name}' not declared in flow '{}'",
                self.name
            )));
        }
        self
    }

    pub fn on(self, pattern: impl Into<String>) -> TransitionBuilder {
        TransitionBuilder {
            builder: self,
            pattern: pattern.into(),
        }
    }

    pub fn build(mut self) -> Result<SimpleFlow> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        self.add_dangling_ends();
        SimpleFlow::new(
            self.name,
            self.start.as_deref(),
            self.states,
            self.transitions,
        )
    }

    fn add_state(&mut self, state: Arc<dyn State>) -> String {
        let name = state.name().to_string();
        if !self.states.iter().any(|s| s.name() == name) {
            self.states.push(state);
        }
        name
    }

    fn end_name(&mut self, kind: &str) -> String {
        let name = format!("{}.{kind}{}", self.name, self.end_counter);
        self.end_counter += 1;
        name
    }

    fn transition_from_current(&mut self, pattern: String, next: String) {
        match self.current.clone() {
            Some(current) => self
                .transitions
                .push(StateTransition::new(current, pattern, next)),
            None => {
                self.error.get_or_insert(AppError::FlowExecution(format!(
                    "transition '{pattern}' declared before a start state in flow '{}'",
                    self.name
                )));
            }
        }
    }

    fn add_dangling_ends(&mut self) {
        let pending: Vec<(String, bool)> = self
            .states
            .iter()
            .filter(|s| !s.is_end_state())
            .map(|s| {
                let name = s.name().to_string();
                let has_any = self.transitions.iter().any(|t| t.state_name() == name);
                (name, has_any)
            })
            .collect();

        for (name, has_transitions) in pending {
            if !has_transitions {
                let completed = self.end_name("end");
                let failed = self.end_name("fail");
                self.states.push(Arc::new(EndState::new(
                    completed.clone(),
                    FlowExecutionStatus::completed(),
                    exit_codes::COMPLETED,
                )));
                self.states.push(Arc::new(EndState::new(
                    failed.clone(),
                    FlowExecutionStatus::failed(),
                    exit_codes::FAILED,
                )));
                self.transitions
                    .push(StateTransition::new(name.clone(), exit_codes::COMPLETED, completed));
                self.transitions
                    .push(StateTransition::new(name, "*", failed));
            } else if !self
                .transitions
                .iter()
                .any(|t| t.state_name() == name && t.pattern() == "*")
            {
                self.transitions.push(StateTransition::end(name, "*"));
            }
        }
    }
}

/// Second half of `on(pattern)`: where the matching status leads.
pub struct TransitionBuilder {
    builder: FlowBuilder,
    pattern: String,
}

impl TransitionBuilder {
    /// Go to `state` and make it the current state.
    pub fn to(mut self, state: Arc<dyn State>) -> FlowBuilder {
        let name = self.builder.add_state(state);
        self.builder.transition_from_current(self.pattern, name.clone());
        self.builder.current = Some(name);
        self.builder
    }

    pub fn to_step(self, step: Arc<dyn Step>) -> FlowBuilder {
        self.to(Arc::new(StepState::new(step)))
    }

    /// Go to a state declared elsewhere in the flow; the cursor stays.
    pub fn to_name(mut self, state_name: &str) -> FlowBuilder {
        self.builder
            .transition_from_current(self.pattern, state_name.to_string());
        self.builder
    }

    /// End the flow COMPLETED.
    pub fn end(self) -> FlowBuilder {
        self.end_with(exit_codes::COMPLETED)
    }

    /// End the flow COMPLETED with a custom exit code.
    pub fn end_with(mut self, exit_code: &str) -> FlowBuilder {
        let name = self.builder.end_name("end");
        self.to_end(EndState::new(name, FlowExecutionStatus::completed(), exit_code))
    }

    pub fn fail(mut self) -> FlowBuilder {
        let name = self.builder.end_name("fail");
        self.to_end(EndState::new(
            name,
            FlowExecutionStatus::failed(),
            exit_codes::FAILED,
        ))
    }

    /// End the flow STOPPED; a restart starts the flow over.
    pub fn stop(mut self) -> FlowBuilder {
        let name = self.builder.end_name("stop");
        self.to_end(EndState::new(
            name,
            FlowExecutionStatus::stopped(),
            exit_codes::STOPPED,
        ))
    }

    /// End the flow STOPPED; a restart continues at `state`.
    pub fn stop_and_restart(mut self, state: Arc<dyn State>) -> FlowBuilder {
        let target = self.builder.add_state(state);
        let name = self.builder.end_name("stop");
        self.to_end(
            EndState::new(name, FlowExecutionStatus::stopped(), exit_codes::STOPPED)
                .restart_at(target),
        )
    }

    pub fn stop_and_restart_step(self, step: Arc<dyn Step>) -> FlowBuilder {
        self.stop_and_restart(Arc::new(StepState::new(step)))
    }

    /// Go to a custom end state; the cursor stays.
    pub fn to_end(mut self, end: EndState) -> FlowBuilder {
        let name = self.builder.add_state(Arc::new(end));
        self.builder.transition_from_current(self.pattern, name);
        self.builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::fixtures::Fixture;
    use crate::application::flow::simple::tests::{exit_step, failing_step, ok_step};
    use crate::application::flow::state::{DecisionState, FnDecider};
    use crate::application::flow::{Flow, FlowExecutor};
    use crate::domain::BatchStatus;

    fn executor(fixture: &Fixture) -> FlowExecutor {
        FlowExecutor::new(
            fixture.job_execution.clone(),
            fixture.repository.clone(),
            fixture.time_provider.clone(),
            fixture.stop_signal.clone(),
        )
    }

    #[tokio::test]
    async fn test_sequential_flow_runs_every_step() {
        let fixture = Fixture::new("job").await;
        let flow = FlowBuilder::new("main")
            .start_step(ok_step("a"))
            .next_step(ok_step("b"))
            .next_step(ok_step("c"))
            .build()
            .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.status, FlowExecutionStatus::completed());
        let job = executor.job_execution().await;
        let names: Vec<_> = job.step_executions.iter().map(|s| s.step_name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(job.exit_status.exit_code(), "COMPLETED");
    }

    #[tokio::test]
    async fn test_sequential_flow_stops_at_failure() {
        let fixture = Fixture::new("job").await;
        let flow = FlowBuilder::new("main")
            .start_step(ok_step("a"))
            .next_step(failing_step("b"))
            .next_step(ok_step("c"))
            .build()
            .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.status, FlowExecutionStatus::failed());
        let job = executor.job_execution().await;
        assert_eq!(job.step_executions.len(), 2);
        assert!(job.step_execution("c").is_none());
    }

    #[tokio::test]
    async fn test_decision_routes_on_custom_status() {
        let fixture = Fixture::new("job").await;
        let decider = Arc::new(FnDecider::new(|_, step| {
            match step.map(|s| s.exit_status.exit_code()) {
                Some("LARGE") => FlowExecutionStatus::new("SPLIT"),
                _ => FlowExecutionStatus::new("DIRECT"),
            }
        }));
        let flow = FlowBuilder::new("main")
            .start_step(exit_step("measure", "LARGE"))
            .on("*")
            .to(Arc::new(DecisionState::new("size", decider)))
            .on("SPLIT")
            .to_step(ok_step("split"))
            .from("size")
            .on("DIRECT")
            .end_with("SMALL")
            .build()
            .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();

        assert_eq!(result.status, FlowExecutionStatus::completed());
        let job = executor.job_execution().await;
        assert!(job.step_execution("split").is_some());
    }

    #[tokio::test]
    async fn test_fail_and_stop_end_states() {
        let fixture = Fixture::new("job").await;
        let flow = FlowBuilder::new("main")
            .start_step(failing_step("a"))
            .on("FAILED")
            .stop()
            .on("*")
            .end()
            .build()
            .unwrap();

        let executor = executor(&fixture);
        let result = flow.start(&executor).await.unwrap();
        assert!(result.status.is_stop());
        assert_eq!(result.name, "main.stop0");
        let job = executor.job_execution().await;
        assert_eq!(job.exit_status.exit_code(), "STOPPED");
        assert_eq!(job.step_execution("a").unwrap().status, BatchStatus::Failed);
    }

    #[test]
    fn test_unknown_from_state_is_rejected() {
        let result = FlowBuilder::new("main")
            .start_step(ok_step("a"))
            .from("b")
            .on("*")
            .end()
            .build();
        assert!(matches!(result, Err(AppError::FlowExecution(_))));

        let missing = FlowBuilder::new("main")
            .start_step(ok_step("a"))
            .on("*")
            .to_name("ghost")
            .build();
        assert!(matches!(missing, Err(AppError::FlowExecution(msg)) if msg.contains("ghost")));
    }
}
