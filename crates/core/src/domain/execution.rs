// Job & Step Execution Model

use serde::{Deserialize, Serialize};

use crate::domain::context::ExecutionContext;
use crate::domain::parameters::JobParameters;
use crate::domain::status::{BatchStatus, ExitStatus};

pub type JobInstanceId = i64;
pub type JobExecutionId = i64;
pub type StepExecutionId = i64;

/// Logical run identity: job name plus identifying parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: JobInstanceId,
    pub job_name: String,
    pub job_key: String,
    pub version: i32,
}

impl JobInstance {
    pub fn new(id: JobInstanceId, job_name: impl Into<String>, job_key: impl Into<String>) -> Self {
        Self {
            id,
            job_name: job_name.into(),
            job_key: job_key.into(),
            version: 0,
        }
    }
}

/// One attempt to run a [`JobInstance`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub id: JobExecutionId,
    pub instance: JobInstance,
    pub parameters: JobParameters,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub create_time: i64, // epoch ms
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub last_updated: Option<i64>,
    pub execution_context: ExecutionContext,
    pub step_executions: Vec<StepExecution>,
    pub failure_exceptions: Vec<String>,
    pub version: i32,
}

impl JobExecution {
    pub fn new(
        id: JobExecutionId,
        instance: JobInstance,
        parameters: JobParameters,
        create_time: i64,
    ) -> Self {
        Self {
            id,
            instance,
            parameters,
            status: BatchStatus::Starting,
            exit_status: ExitStatus::unknown(),
            create_time,
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            step_executions: Vec::new(),
            failure_exceptions: Vec::new(),
            version: 0,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.instance.job_name
    }

    pub fn is_running(&self) -> bool {
        self.status.is_running()
    }

    pub fn is_stopping(&self) -> bool {
        self.status == BatchStatus::Stopping
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failure_exceptions.push(failure.into());
    }

    /// Failures of the job itself plus those of every step.
    pub fn all_failures(&self) -> Vec<String> {
        let mut all = self.failure_exceptions.clone();
        for step in &self.step_executions {
            all.extend(step.failure_exceptions.iter().cloned());
        }
        all
    }

    pub fn step_execution(&self, step_name: &str) -> Option<&StepExecution> {
        self.step_executions
            .iter()
            .rev()
            .find(|s| s.step_name == step_name)
    }

    /// Record a step execution, replacing an earlier copy with the same id.
    pub fn add_step_execution(&mut self, step_execution: StepExecution) {
        match self
            .step_executions
            .iter_mut()
            .find(|s| s.id == step_execution.id)
        {
            Some(existing) => *existing = step_execution,
            None => self.step_executions.push(step_execution),
        }
    }
}

/// One attempt to run a named step within a [`JobExecution`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: StepExecutionId,
    pub job_execution_id: JobExecutionId,
    pub step_name: String,
    pub status: BatchStatus,
    pub exit_status: ExitStatus,
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub last_updated: Option<i64>,
    pub execution_context: ExecutionContext,
    pub failure_exceptions: Vec<String>,
    pub terminate_only: bool,
    pub version: i32,
}

impl StepExecution {
    pub fn new(id: StepExecutionId, job_execution_id: JobExecutionId, step_name: impl Into<String>) -> Self {
        Self {
            id,
            job_execution_id,
            step_name: step_name.into(),
            status: BatchStatus::Starting,
            exit_status: ExitStatus::executing(),
            read_count: 0,
            write_count: 0,
            filter_count: 0,
            read_skip_count: 0,
            process_skip_count: 0,
            write_skip_count: 0,
            commit_count: 0,
            rollback_count: 0,
            start_time: None,
            end_time: None,
            last_updated: None,
            execution_context: ExecutionContext::new(),
            failure_exceptions: Vec::new(),
            terminate_only: false,
            version: 0,
        }
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }

    pub fn upgrade_status(&mut self, status: BatchStatus) {
        self.status = self.status.upgrade_to(status);
    }

    pub fn add_failure(&mut self, failure: impl Into<String>) {
        self.failure_exceptions.push(failure.into());
    }

    /// Fold the counts of one committed chunk into the running totals.
    pub fn apply(&mut self, contribution: &StepContribution) {
        self.read_count += contribution.read_count;
        self.write_count += contribution.write_count;
        self.filter_count += contribution.filter_count;
        self.read_skip_count += contribution.read_skip_count;
        self.process_skip_count += contribution.process_skip_count;
        self.write_skip_count += contribution.write_skip_count;
        self.exit_status = self.exit_status.and(&contribution.exit_status);
    }

    /// Add the counters of a finished worker execution (partitioning).
    pub fn accumulate(&mut self, other: &StepExecution) {
        self.read_count += other.read_count;
        self.write_count += other.write_count;
        self.filter_count += other.filter_count;
        self.read_skip_count += other.read_skip_count;
        self.process_skip_count += other.process_skip_count;
        self.write_skip_count += other.write_skip_count;
        self.commit_count += other.commit_count;
        self.rollback_count += other.rollback_count;
    }

    pub fn summary(&self) -> String {
        format!(
            "StepExecution: id={}, name={}, status={}, exitStatus={}, readCount={}, filterCount={}, \
             writeCount={}, readSkipCount={}, writeSkipCount={}, processSkipCount={}, \
             commitCount={}, rollbackCount={}",
            self.id,
            self.step_name,
            self.status,
            self.exit_status.exit_code(),
            self.read_count,
            self.filter_count,
            self.write_count,
            self.read_skip_count,
            self.write_skip_count,
            self.process_skip_count,
            self.commit_count,
            self.rollback_count
        )
    }
}

/// Counts buffered for a single chunk; applied to the step only on commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepContribution {
    pub read_count: u64,
    pub write_count: u64,
    pub filter_count: u64,
    pub read_skip_count: u64,
    pub process_skip_count: u64,
    pub write_skip_count: u64,
    pub exit_status: ExitStatus,
}

impl StepContribution {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_read_count(&mut self) {
        self.read_count += 1;
    }

    pub fn increment_write_count(&mut self, count: u64) {
        self.write_count += count;
    }

    pub fn increment_filter_count(&mut self, count: u64) {
        self.filter_count += count;
    }

    pub fn increment_read_skip_count(&mut self) {
        self.read_skip_count += 1;
    }

    pub fn increment_process_skip_count(&mut self) {
        self.process_skip_count += 1;
    }

    pub fn increment_write_skip_count(&mut self) {
        self.write_skip_count += 1;
    }

    pub fn skip_count(&self) -> u64 {
        self.read_skip_count + self.process_skip_count + self.write_skip_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_contribution() {
        let mut step = StepExecution::new(1, 1, "load");
        let mut contribution = StepContribution::new();
        contribution.increment_read_count();
        contribution.increment_read_count();
        contribution.increment_filter_count(1);
        contribution.increment_write_count(1);
        contribution.increment_write_skip_count();

        step.apply(&contribution);
        step.apply(&contribution);

        assert_eq!(step.read_count, 4);
        assert_eq!(step.write_count, 2);
        assert_eq!(step.filter_count, 2);
        assert_eq!(step.skip_count(), 2);
        assert_eq!(step.exit_status.exit_code(), "EXECUTING");
    }

    #[test]
    fn test_add_step_execution_replaces_by_id() {
        let instance = JobInstance::new(1, "job", "");
        let mut job = JobExecution::new(1, instance, JobParameters::new(), 0);

        let mut step = StepExecution::new(10, 1, "load");
        job.add_step_execution(step.clone());
        step.status = BatchStatus::Completed;
        job.add_step_execution(step);

        assert_eq!(job.step_executions.len(), 1);
        assert_eq!(
            job.step_execution("load").map(|s| s.status),
            Some(BatchStatus::Completed)
        );
    }
}
