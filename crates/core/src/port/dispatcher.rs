// Step Request Dispatcher Port - hand-off of partition work to remote workers
//
// No wire format is prescribed; adapters decide how a request travels.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{JobExecutionId, StepExecutionId};
use crate::error::Result;

/// Identifies one worker step execution that a remote worker should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionRequest {
    pub step_name: String,
    pub job_execution_id: JobExecutionId,
    pub step_execution_id: StepExecutionId,
}

#[async_trait]
pub trait StepRequestDispatcher: Send + Sync {
    async fn dispatch(&self, request: StepExecutionRequest) -> Result<()>;
}
