// Domain Layer - Execution model shared by every engine component

pub mod context;
pub mod error;
pub mod execution;
pub mod item_error;
pub mod parameters;
pub mod status;

// Re-exports
pub use context::ExecutionContext;
pub use error::DomainError;
pub use execution::{
    JobExecution, JobExecutionId, JobInstance, JobInstanceId, StepContribution, StepExecution,
    StepExecutionId,
};
pub use item_error::ItemError;
pub use parameters::{JobParameter, JobParameters, JobParametersBuilder, ParameterValue};
pub use status::{exit_codes, BatchStatus, ExitStatus};
