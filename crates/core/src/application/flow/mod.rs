// Flow engine - state machine sequencing a job's steps

pub mod builder;
pub mod executor;
pub mod simple;
pub mod state;
pub mod status;
pub mod transition;

pub use builder::{FlowBuilder, TransitionBuilder};
pub use executor::FlowExecutor;
pub use simple::SimpleFlow;
pub use state::{
    DecisionState, EndState, FlowState, FnDecider, JobExecutionDecider, SplitState, State,
    StepState,
};
pub use status::{FlowExecution, FlowExecutionStatus};
pub use transition::StateTransition;

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;

/// Separator of qualified state names (`flow.state`)
pub const STATE_SEPARATOR: char = '.';

#[async_trait]
pub trait Flow: Send + Sync {
    fn name(&self) -> &str;

    /// Run from the start state until a transition ends the flow.
    async fn start(&self, executor: &FlowExecutor) -> Result<FlowExecution>;

    /// Run from the named state instead of the start state.
    async fn resume(&self, state_name: &str, executor: &FlowExecutor) -> Result<FlowExecution>;

    /// Look a state up by name, falling back to a suffix match.
    fn state(&self, state_name: &str) -> Option<Arc<dyn State>>;

    fn state_names(&self) -> Vec<String>;
}
