// Job Repository Port (Interface)

use crate::domain::{
    BatchStatus, ExecutionContext, JobExecution, JobExecutionId, JobInstance, JobInstanceId, JobParameters,
    StepExecution, StepExecutionId,
};
use crate::error::Result;
use crate::port::transaction::Transaction;
use async_trait::async_trait;

/// Persistence and identity/locking contract over the execution model.
///
/// Backings must make every mutation atomic with respect to the
/// status+context pair it touches, and must guard updates with the
/// entity's `version` (optimistic locking).
#[async_trait]
pub trait JobRepository: Send + Sync {
    /// Look up an instance by identity without creating it
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>>;

    /// Atomic find-or-create by (job name, identifying parameters)
    async fn find_or_create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance>;

    async fn get_job_instance(&self, instance_id: JobInstanceId) -> Result<Option<JobInstance>>;

    /// Create a new execution of `instance` in STARTING status.
    ///
    /// Fails with `JobExecutionAlreadyRunning` while another execution of the
    /// same instance is active. The context of the previous execution is
    /// carried over.
    async fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution>;

    /// Create and persist a step execution with its initial context
    async fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
        context: ExecutionContext,
    ) -> Result<StepExecution>;

    /// Version-checked update of status, timestamps and context.
    /// Bumps `version` on success; fails with `OptimisticLocking` when stale.
    async fn update_job_execution(&self, execution: &mut JobExecution) -> Result<()>;

    /// Version-checked update of status, counters and context in one write
    async fn update_step_execution(&self, execution: &mut StepExecution) -> Result<()>;

    /// Same as `update_step_execution`, run inside the chunk's transaction
    /// when the backing shares its storage. Other backings write on their
    /// own.
    async fn update_step_execution_in(
        &self,
        execution: &mut StepExecution,
        _transaction: &mut dyn Transaction,
    ) -> Result<()> {
        self.update_step_execution(execution).await
    }

    /// Pull in a status change made by another writer (e.g. a stop request)
    /// and adopt the stored version.
    async fn synchronize_status(&self, execution: &mut JobExecution) -> Result<()>;

    /// Most recent attempt of `step_name` across all executions of `instance`
    async fn get_last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>>;

    /// Number of attempts of `step_name` for start-limit checks
    async fn get_step_execution_count(&self, instance: &JobInstance, step_name: &str)
        -> Result<u32>;

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>>;

    /// Load an execution together with its step executions
    async fn get_job_execution(&self, execution_id: JobExecutionId)
        -> Result<Option<JobExecution>>;

    /// Stored status of an execution, without loading its steps
    async fn get_job_execution_status(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<Option<BatchStatus>>;

    async fn find_job_executions(&self, instance: &JobInstance) -> Result<Vec<JobExecution>>;

    async fn find_running_job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>>;

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> Result<Option<StepExecution>>;
}
