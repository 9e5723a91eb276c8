// Row structs for the batch_* tables

use sqlx::FromRow;
use std::str::FromStr;

use stepline_core::domain::{
    BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobInstance, JobParameters,
    StepExecution,
};
use stepline_core::error::Result;

pub(crate) const JOB_EXECUTION_COLUMNS: &str = r#"
    e.job_execution_id, e.version, e.job_instance_id,
    i.job_name, i.job_key, i.version AS instance_version,
    e.create_time, e.start_time, e.end_time, e.status,
    e.exit_code, e.exit_message, e.failure_exceptions, e.last_updated,
    c.serialized_context
"#;

pub(crate) const JOB_EXECUTION_FROM: &str = r#"
    FROM batch_job_execution e
    JOIN batch_job_instance i ON i.job_instance_id = e.job_instance_id
    LEFT JOIN batch_job_execution_context c ON c.job_execution_id = e.job_execution_id
"#;

pub(crate) const STEP_EXECUTION_COLUMNS: &str = r#"
    s.step_execution_id, s.version, s.step_name, s.job_execution_id,
    s.start_time, s.end_time, s.status,
    s.commit_count, s.read_count, s.filter_count, s.write_count,
    s.read_skip_count, s.write_skip_count, s.process_skip_count, s.rollback_count,
    s.exit_code, s.exit_message, s.failure_exceptions, s.terminate_only, s.last_updated,
    c.serialized_context
"#;

pub(crate) const STEP_EXECUTION_FROM: &str = r#"
    FROM batch_step_execution s
    LEFT JOIN batch_step_execution_context c ON c.step_execution_id = s.step_execution_id
"#;

#[derive(Debug, FromRow)]
pub(crate) struct JobInstanceRow {
    pub job_instance_id: i64,
    pub job_name: String,
    pub job_key: String,
    pub version: i64,
}

impl JobInstanceRow {
    pub fn into_instance(self) -> JobInstance {
        JobInstance {
            id: self.job_instance_id,
            job_name: self.job_name,
            job_key: self.job_key,
            version: self.version as i32,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobExecutionRow {
    pub job_execution_id: i64,
    pub version: i64,
    pub job_instance_id: i64,
    pub job_name: String,
    pub job_key: String,
    pub instance_version: i64,
    pub create_time: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub status: String,
    pub exit_code: String,
    pub exit_message: String,
    pub failure_exceptions: String,
    pub last_updated: Option<i64>,
    pub serialized_context: Option<String>,
}

impl JobExecutionRow {
    /// Step executions are attached by the caller.
    pub fn into_execution(self, parameters: JobParameters) -> Result<JobExecution> {
        let instance = JobInstance {
            id: self.job_instance_id,
            job_name: self.job_name,
            job_key: self.job_key,
            version: self.instance_version as i32,
        };
        let mut execution =
            JobExecution::new(self.job_execution_id, instance, parameters, self.create_time);
        execution.version = self.version as i32;
        execution.status = BatchStatus::from_str(&self.status)?;
        execution.exit_status = ExitStatus::with_description(self.exit_code, self.exit_message);
        execution.start_time = self.start_time;
        execution.end_time = self.end_time;
        execution.last_updated = self.last_updated;
        execution.failure_exceptions = serde_json::from_str(&self.failure_exceptions)?;
        execution.execution_context = decode_context(self.serialized_context.as_deref())?;
        Ok(execution)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct StepExecutionRow {
    pub step_execution_id: i64,
    pub version: i64,
    pub step_name: String,
    pub job_execution_id: i64,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub status: String,
    pub commit_count: i64,
    pub read_count: i64,
    pub filter_count: i64,
    pub write_count: i64,
    pub read_skip_count: i64,
    pub write_skip_count: i64,
    pub process_skip_count: i64,
    pub rollback_count: i64,
    pub exit_code: String,
    pub exit_message: String,
    pub failure_exceptions: String,
    pub terminate_only: i64,
    pub last_updated: Option<i64>,
    pub serialized_context: Option<String>,
}

impl StepExecutionRow {
    pub fn into_step_execution(self) -> Result<StepExecution> {
        let mut step =
            StepExecution::new(self.step_execution_id, self.job_execution_id, self.step_name);
        step.version = self.version as i32;
        step.status = BatchStatus::from_str(&self.status)?;
        step.exit_status = ExitStatus::with_description(self.exit_code, self.exit_message);
        step.start_time = self.start_time;
        step.end_time = self.end_time;
        step.last_updated = self.last_updated;
        step.commit_count = self.commit_count as u64;
        step.read_count = self.read_count as u64;
        step.filter_count = self.filter_count as u64;
        step.write_count = self.write_count as u64;
        step.read_skip_count = self.read_skip_count as u64;
        step.write_skip_count = self.write_skip_count as u64;
        step.process_skip_count = self.process_skip_count as u64;
        step.rollback_count = self.rollback_count as u64;
        step.terminate_only = self.terminate_only != 0;
        step.failure_exceptions = serde_json::from_str(&self.failure_exceptions)?;
        step.execution_context = decode_context(self.serialized_context.as_deref())?;
        Ok(step)
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobParameterRow {
    pub parameter_name: String,
    pub parameter_value: String,
    pub identifying: i64,
}

fn decode_context(serialized: Option<&str>) -> Result<ExecutionContext> {
    let mut context: ExecutionContext = match serialized {
        Some(json) => serde_json::from_str(json)?,
        None => ExecutionContext::new(),
    };
    context.clear_dirty();
    Ok(context)
}
