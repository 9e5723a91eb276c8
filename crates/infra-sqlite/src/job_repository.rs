// SQLite JobRepository Implementation

use async_trait::async_trait;
use sqlx::{SqliteConnection, SqlitePool};
use std::sync::Arc;
use tracing::debug;

use stepline_core::domain::{
    BatchStatus, ExecutionContext, ExitStatus, JobExecution, JobExecutionId, JobInstance,
    JobInstanceId, JobParameter, JobParameters, JobParametersBuilder, StepExecution,
    StepExecutionId,
};
use stepline_core::error::{AppError, Result};
use stepline_core::port::{JobRepository, TimeProvider, Transaction};

use crate::rows::{
    JobExecutionRow, JobInstanceRow, JobParameterRow, StepExecutionRow, JOB_EXECUTION_COLUMNS,
    JOB_EXECUTION_FROM, STEP_EXECUTION_COLUMNS, STEP_EXECUTION_FROM,
};
use crate::transaction::{SqliteTransaction, SqliteTransactionManager};

// Helper to convert sqlx::Error to AppError with structured information
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> AppError {
    match &err {
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                let code_str = code.as_ref();

                // SQLite error codes: https://www.sqlite.org/rescode.html
                match code_str {
                    "2067" | "1555" => AppError::Database(format!(
                        "Unique constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "787" | "3850" => AppError::Database(format!(
                        "Foreign key constraint violation: {} ({})",
                        db_err.message(),
                        code_str
                    )),
                    "5" => AppError::Database(format!(
                        "Database locked (SQLITE_BUSY): {}",
                        db_err.message()
                    )),
                    "13" => AppError::Database(format!("Database full: {}", db_err.message())),
                    _ => AppError::Database(format!(
                        "Database error [{}]: {}",
                        code_str,
                        db_err.message()
                    )),
                }
            } else {
                AppError::Database(format!("Database error: {}", db_err.message()))
            }
        }
        sqlx::Error::RowNotFound => AppError::Database("Row not found".to_string()),
        sqlx::Error::ColumnNotFound(col) => {
            AppError::Database(format!("Column not found: {}", col))
        }
        _ => AppError::Database(err.to_string()),
    }
}

const RUNNING: [BatchStatus; 3] = [
    BatchStatus::Starting,
    BatchStatus::Started,
    BatchStatus::Stopping,
];

/// [`JobRepository`] persisted in the batch_* tables.
///
/// Every update runs in one SQL transaction guarded by `WHERE version = ?`,
/// so status, counters and context land together or not at all. Chunk
/// checkpoints join the chunk's [`SqliteTransaction`] when the step runs
/// under this repository's [`SqliteTransactionManager`].
pub struct SqliteJobRepository {
    pool: SqlitePool,
    time_provider: Arc<dyn TimeProvider>,
}

impl SqliteJobRepository {
    pub fn new(pool: SqlitePool, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            pool,
            time_provider,
        }
    }

    /// Transaction manager over this repository's database
    pub fn transaction_manager(&self) -> SqliteTransactionManager {
        SqliteTransactionManager::new(self.pool.clone())
    }

    async fn load_parameters(&self, execution_id: JobExecutionId) -> Result<JobParameters> {
        let rows: Vec<JobParameterRow> = sqlx::query_as(
            r#"
            SELECT parameter_name, parameter_value, identifying
            FROM batch_job_execution_params
            WHERE job_execution_id = ?
            ORDER BY parameter_name
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let mut builder = JobParametersBuilder::new();
        for row in rows {
            let parameter = JobParameter {
                value: serde_json::from_str(&row.parameter_value)?,
                identifying: row.identifying != 0,
            };
            builder = builder.add_parameter(row.parameter_name, parameter);
        }
        Ok(builder.build())
    }

    async fn load_step_executions(
        &self,
        job_execution_id: JobExecutionId,
    ) -> Result<Vec<StepExecution>> {
        let rows: Vec<StepExecutionRow> = sqlx::query_as(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} {STEP_EXECUTION_FROM}
             WHERE s.job_execution_id = ?
             ORDER BY s.step_execution_id"
        ))
        .bind(job_execution_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(StepExecutionRow::into_step_execution)
            .collect()
    }

    /// Attach parameters and step executions to a loaded row
    async fn assemble(&self, row: JobExecutionRow) -> Result<JobExecution> {
        let parameters = self.load_parameters(row.job_execution_id).await?;
        let mut execution = row.into_execution(parameters)?;
        execution.step_executions = self.load_step_executions(execution.id).await?;
        Ok(execution)
    }

    async fn assemble_all(&self, rows: Vec<JobExecutionRow>) -> Result<Vec<JobExecution>> {
        let mut executions = Vec::with_capacity(rows.len());
        for row in rows {
            executions.push(self.assemble(row).await?);
        }
        Ok(executions)
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    async fn find_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobInstance>> {
        let row: Option<JobInstanceRow> = sqlx::query_as(
            r#"
            SELECT job_instance_id, job_name, job_key, version
            FROM batch_job_instance
            WHERE job_name = ? AND job_key = ?
            "#,
        )
        .bind(job_name)
        .bind(parameters.identity_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(JobInstanceRow::into_instance))
    }

    async fn find_or_create_instance(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<JobInstance> {
        let key = parameters.identity_key();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_job_instance (version, job_name, job_key)
            VALUES (0, ?, ?)
            ON CONFLICT (job_name, job_key) DO NOTHING
            "#,
        )
        .bind(job_name)
        .bind(&key)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let row: JobInstanceRow = sqlx::query_as(
            r#"
            SELECT job_instance_id, job_name, job_key, version
            FROM batch_job_instance
            WHERE job_name = ? AND job_key = ?
            "#,
        )
        .bind(job_name)
        .bind(&key)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        if inserted.rows_affected() > 0 {
            debug!(job_name = %job_name, instance_id = row.job_instance_id, "Created job instance");
        }
        Ok(row.into_instance())
    }

    async fn get_job_instance(&self, instance_id: JobInstanceId) -> Result<Option<JobInstance>> {
        let row: Option<JobInstanceRow> = sqlx::query_as(
            "SELECT job_instance_id, job_name, job_key, version FROM batch_job_instance WHERE job_instance_id = ?",
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(JobInstanceRow::into_instance))
    }

    async fn create_execution(
        &self,
        instance: &JobInstance,
        parameters: &JobParameters,
    ) -> Result<JobExecution> {
        let create_time = self.time_provider.now_millis();
        let exit_status = ExitStatus::unknown();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT job_instance_id FROM batch_job_instance WHERE job_instance_id = ?",
        )
        .bind(instance.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(AppError::InvalidState(format!(
                "job instance {} does not exist",
                instance.id
            )));
        }

        let previous_context: Option<String> = sqlx::query_scalar::<_, Option<String>>(
            r#"
            SELECT c.serialized_context
            FROM batch_job_execution e
            LEFT JOIN batch_job_execution_context c ON c.job_execution_id = e.job_execution_id
            WHERE e.job_instance_id = ?
            ORDER BY e.create_time DESC, e.job_execution_id DESC
            LIMIT 1
            "#,
        )
        .bind(instance.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?
        .flatten();

        // Running check and insert are one statement so two launchers cannot both pass
        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_job_execution (
                version, job_instance_id, create_time, status,
                exit_code, exit_message, failure_exceptions, last_updated
            )
            SELECT 0, ?, ?, ?, ?, ?, '[]', ?
            WHERE NOT EXISTS (
                SELECT 1 FROM batch_job_execution
                WHERE job_instance_id = ? AND status IN (?, ?, ?)
            )
            "#,
        )
        .bind(instance.id)
        .bind(create_time)
        .bind(BatchStatus::Starting.as_str())
        .bind(exit_status.exit_code())
        .bind(exit_status.exit_description())
        .bind(create_time)
        .bind(instance.id)
        .bind(RUNNING[0].as_str())
        .bind(RUNNING[1].as_str())
        .bind(RUNNING[2].as_str())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if inserted.rows_affected() == 0 {
            let running: Option<(i64, String)> = sqlx::query_as(
                r#"
                SELECT job_execution_id, status FROM batch_job_execution
                WHERE job_instance_id = ? AND status IN (?, ?, ?)
                ORDER BY job_execution_id DESC LIMIT 1
                "#,
            )
            .bind(instance.id)
            .bind(RUNNING[0].as_str())
            .bind(RUNNING[1].as_str())
            .bind(RUNNING[2].as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            let (running_id, status) = running.unwrap_or((0, "UNKNOWN".to_string()));
            return Err(AppError::JobExecutionAlreadyRunning(format!(
                "execution {} of job '{}' is {}",
                running_id, instance.job_name, status
            )));
        }
        let id = inserted.last_insert_rowid();

        for (name, parameter) in parameters.iter() {
            sqlx::query(
                r#"
                INSERT INTO batch_job_execution_params (
                    job_execution_id, parameter_name, parameter_type, parameter_value, identifying
                ) VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(name)
            .bind(parameter.value.type_name())
            .bind(serde_json::to_string(&parameter.value)?)
            .bind(parameter.identifying as i64)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        let serialized_context = previous_context.unwrap_or_else(|| "{}".to_string());
        sqlx::query(
            "INSERT INTO batch_job_execution_context (job_execution_id, serialized_context) VALUES (?, ?)",
        )
        .bind(id)
        .bind(&serialized_context)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        let mut execution = JobExecution::new(id, instance.clone(), parameters.clone(), create_time);
        execution.execution_context = serde_json::from_str(&serialized_context)?;
        execution.execution_context.clear_dirty();
        execution.last_updated = Some(create_time);
        debug!(job_name = %instance.job_name, execution_id = id, "Created job execution");
        Ok(execution)
    }

    async fn create_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_name: &str,
        context: ExecutionContext,
    ) -> Result<StepExecution> {
        let now = self.time_provider.now_millis();
        let serialized_context = serde_json::to_string(&context)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let exists: Option<i64> = sqlx::query_scalar(
            "SELECT job_execution_id FROM batch_job_execution WHERE job_execution_id = ?",
        )
        .bind(job_execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        if exists.is_none() {
            return Err(AppError::NoSuchJobExecution(job_execution_id));
        }

        let mut step = StepExecution::new(0, job_execution_id, step_name);
        let inserted = sqlx::query(
            r#"
            INSERT INTO batch_step_execution (
                version, step_name, job_execution_id, status, exit_code, exit_message, last_updated
            ) VALUES (0, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(step_name)
        .bind(job_execution_id)
        .bind(step.status.as_str())
        .bind(step.exit_status.exit_code())
        .bind(step.exit_status.exit_description())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        step.id = inserted.last_insert_rowid();

        sqlx::query(
            "INSERT INTO batch_step_execution_context (step_execution_id, serialized_context) VALUES (?, ?)",
        )
        .bind(step.id)
        .bind(&serialized_context)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        step.execution_context = context;
        step.execution_context.clear_dirty();
        step.last_updated = Some(now);
        Ok(step)
    }

    async fn update_job_execution(&self, execution: &mut JobExecution) -> Result<()> {
        let now = self.time_provider.now_millis();
        let failures = serde_json::to_string(&execution.failure_exceptions)?;
        let context = serde_json::to_string(&execution.execution_context)?;
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let updated = sqlx::query(
            r#"
            UPDATE batch_job_execution
            SET version = version + 1,
                start_time = ?, end_time = ?, status = ?,
                exit_code = ?, exit_message = ?, failure_exceptions = ?, last_updated = ?
            WHERE job_execution_id = ? AND version = ?
            "#,
        )
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.status.as_str())
        .bind(execution.exit_status.exit_code())
        .bind(execution.exit_status.exit_description())
        .bind(&failures)
        .bind(now)
        .bind(execution.id)
        .bind(execution.version)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        if updated.rows_affected() == 0 {
            let stored: Option<i64> = sqlx::query_scalar(
                "SELECT version FROM batch_job_execution WHERE job_execution_id = ?",
            )
            .bind(execution.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            return Err(match stored {
                Some(version) => AppError::OptimisticLocking(format!(
                    "job execution {} has version {} but update carries {}",
                    execution.id, version, execution.version
                )),
                None => AppError::NoSuchJobExecution(execution.id),
            });
        }

        sqlx::query(
            r#"
            INSERT INTO batch_job_execution_context (job_execution_id, serialized_context)
            VALUES (?, ?)
            ON CONFLICT (job_execution_id) DO UPDATE SET serialized_context = excluded.serialized_context
            "#,
        )
        .bind(execution.id)
        .bind(&context)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        tx.commit().await.map_err(map_sqlx_error)?;

        execution.version += 1;
        execution.last_updated = Some(now);
        execution.execution_context.clear_dirty();
        Ok(())
    }

    async fn update_step_execution(&self, execution: &mut StepExecution) -> Result<()> {
        let now = self.time_provider.now_millis();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        write_step_execution(&mut tx, execution, now).await?;
        tx.commit().await.map_err(map_sqlx_error)?;
        mark_stored(execution, now);
        Ok(())
    }

    async fn update_step_execution_in(
        &self,
        execution: &mut StepExecution,
        transaction: &mut dyn Transaction,
    ) -> Result<()> {
        let Some(sqlite) = SqliteTransaction::downcast(transaction) else {
            return self.update_step_execution(execution).await;
        };
        let now = self.time_provider.now_millis();
        write_step_execution(sqlite.connection(), execution, now).await?;
        mark_stored(execution, now);
        Ok(())
    }

    async fn synchronize_status(&self, execution: &mut JobExecution) -> Result<()> {
        let stored: Option<(i64, String)> = sqlx::query_as(
            "SELECT version, status FROM batch_job_execution WHERE job_execution_id = ?",
        )
        .bind(execution.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        let (version, status) = stored.ok_or(AppError::NoSuchJobExecution(execution.id))?;
        if version as i32 != execution.version {
            execution.upgrade_status(status.parse::<BatchStatus>()?);
            execution.version = version as i32;
        }
        Ok(())
    }

    async fn get_last_step_execution(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<Option<StepExecution>> {
        // NULL start times sort last under DESC
        let row: Option<StepExecutionRow> = sqlx::query_as(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} {STEP_EXECUTION_FROM}
             JOIN batch_job_execution e ON e.job_execution_id = s.job_execution_id
             WHERE e.job_instance_id = ? AND s.step_name = ?
             ORDER BY s.start_time DESC, s.step_execution_id DESC
             LIMIT 1"
        ))
        .bind(instance.id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(StepExecutionRow::into_step_execution).transpose()
    }

    async fn get_step_execution_count(
        &self,
        instance: &JobInstance,
        step_name: &str,
    ) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM batch_step_execution s
            JOIN batch_job_execution e ON e.job_execution_id = s.job_execution_id
            WHERE e.job_instance_id = ? AND s.step_name = ?
            "#,
        )
        .bind(instance.id)
        .bind(step_name)
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(count as u32)
    }

    async fn get_last_job_execution(
        &self,
        job_name: &str,
        parameters: &JobParameters,
    ) -> Result<Option<JobExecution>> {
        let Some(instance) = self.find_instance(job_name, parameters).await? else {
            return Ok(None);
        };

        let row: Option<JobExecutionRow> = sqlx::query_as(&format!(
            "SELECT {JOB_EXECUTION_COLUMNS} {JOB_EXECUTION_FROM}
             WHERE e.job_instance_id = ?
             ORDER BY e.create_time DESC, e.job_execution_id DESC
             LIMIT 1"
        ))
        .bind(instance.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_job_execution(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<Option<JobExecution>> {
        let row: Option<JobExecutionRow> = sqlx::query_as(&format!(
            "SELECT {JOB_EXECUTION_COLUMNS} {JOB_EXECUTION_FROM} WHERE e.job_execution_id = ?"
        ))
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        match row {
            Some(row) => Ok(Some(self.assemble(row).await?)),
            None => Ok(None),
        }
    }

    async fn get_job_execution_status(
        &self,
        execution_id: JobExecutionId,
    ) -> Result<Option<BatchStatus>> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM batch_job_execution WHERE job_execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx_error)?;
        match status {
            Some(status) => Ok(Some(status.parse::<BatchStatus>()?)),
            None => Ok(None),
        }
    }

    async fn find_job_executions(&self, instance: &JobInstance) -> Result<Vec<JobExecution>> {
        let rows: Vec<JobExecutionRow> = sqlx::query_as(&format!(
            "SELECT {JOB_EXECUTION_COLUMNS} {JOB_EXECUTION_FROM}
             WHERE e.job_instance_id = ?
             ORDER BY e.job_execution_id DESC"
        ))
        .bind(instance.id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.assemble_all(rows).await
    }

    async fn find_running_job_executions(&self, job_name: &str) -> Result<Vec<JobExecution>> {
        let rows: Vec<JobExecutionRow> = sqlx::query_as(&format!(
            "SELECT {JOB_EXECUTION_COLUMNS} {JOB_EXECUTION_FROM}
             WHERE i.job_name = ? AND e.status IN (?, ?, ?)
             ORDER BY e.job_execution_id"
        ))
        .bind(job_name)
        .bind(RUNNING[0].as_str())
        .bind(RUNNING[1].as_str())
        .bind(RUNNING[2].as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        self.assemble_all(rows).await
    }

    async fn get_step_execution(
        &self,
        job_execution_id: JobExecutionId,
        step_execution_id: StepExecutionId,
    ) -> Result<Option<StepExecution>> {
        let row: Option<StepExecutionRow> = sqlx::query_as(&format!(
            "SELECT {STEP_EXECUTION_COLUMNS} {STEP_EXECUTION_FROM}
             WHERE s.step_execution_id = ? AND s.job_execution_id = ?"
        ))
        .bind(step_execution_id)
        .bind(job_execution_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(StepExecutionRow::into_step_execution).transpose()
    }
}

/// Version-checked step update plus context upsert on `conn`. The caller
/// owns the transaction.
async fn write_step_execution(
    conn: &mut SqliteConnection,
    execution: &StepExecution,
    now: i64,
) -> Result<()> {
    let failures = serde_json::to_string(&execution.failure_exceptions)?;
    let context = serde_json::to_string(&execution.execution_context)?;

    let updated = sqlx::query(
        r#"
        UPDATE batch_step_execution
        SET version = version + 1,
            start_time = ?, end_time = ?, status = ?,
            commit_count = ?, read_count = ?, filter_count = ?, write_count = ?,
            read_skip_count = ?, write_skip_count = ?, process_skip_count = ?,
            rollback_count = ?, exit_code = ?, exit_message = ?,
            failure_exceptions = ?, terminate_only = ?, last_updated = ?
        WHERE step_execution_id = ? AND version = ?
        "#,
    )
    .bind(execution.start_time)
    .bind(execution.end_time)
    .bind(execution.status.as_str())
    .bind(execution.commit_count as i64)
    .bind(execution.read_count as i64)
    .bind(execution.filter_count as i64)
    .bind(execution.write_count as i64)
    .bind(execution.read_skip_count as i64)
    .bind(execution.write_skip_count as i64)
    .bind(execution.process_skip_count as i64)
    .bind(execution.rollback_count as i64)
    .bind(execution.exit_status.exit_code())
    .bind(execution.exit_status.exit_description())
    .bind(&failures)
    .bind(execution.terminate_only as i64)
    .bind(now)
    .bind(execution.id)
    .bind(execution.version)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    if updated.rows_affected() == 0 {
        let stored: Option<i64> = sqlx::query_scalar(
            "SELECT version FROM batch_step_execution WHERE step_execution_id = ?",
        )
        .bind(execution.id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;
        return Err(match stored {
            Some(version) => AppError::OptimisticLocking(format!(
                "step execution {} has version {} but update carries {}",
                execution.id, version, execution.version
            )),
            None => AppError::InvalidState(format!(
                "step execution {} does not exist",
                execution.id
            )),
        });
    }

    sqlx::query(
        r#"
        INSERT INTO batch_step_execution_context (step_execution_id, serialized_context)
        VALUES (?, ?)
        ON CONFLICT (step_execution_id) DO UPDATE SET serialized_context = excluded.serialized_context
        "#,
    )
    .bind(execution.id)
    .bind(&context)
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    Ok(())
}

fn mark_stored(execution: &mut StepExecution, now: i64) {
    execution.version += 1;
    execution.last_updated = Some(now);
    execution.execution_context.clear_dirty();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use chrono::{TimeZone, Utc};
    use stepline_core::domain::ParameterValue;
    use stepline_core::port::time_provider::mocks::SteppingTimeProvider;
    use tokio_test::assert_ok;

    async fn repository() -> SqliteJobRepository {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobRepository::new(pool, Arc::new(SteppingTimeProvider::new(1_000, 10)))
    }

    fn params() -> JobParameters {
        JobParametersBuilder::new().add_string("input", "a.csv").build()
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent() {
        let repo = repository().await;
        assert!(repo.find_instance("import", &params()).await.unwrap().is_none());

        let first = repo.find_or_create_instance("import", &params()).await.unwrap();
        let second = repo.find_or_create_instance("import", &params()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(
            repo.get_job_instance(first.id).await.unwrap(),
            Some(first.clone())
        );

        let other = repo
            .find_or_create_instance("import", &JobParameters::new())
            .await
            .unwrap();
        assert_ne!(first.id, other.id);
    }

    #[tokio::test]
    async fn test_parameters_survive_storage() {
        let repo = repository().await;
        let date = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let parameters = JobParametersBuilder::new()
            .add_string("input", "a.csv")
            .add_long("count", 7)
            .add_double("ratio", 0.5)
            .add_date("run.date", date)
            .add_non_identifying("attempt", ParameterValue::Long(2))
            .build();

        let instance = repo.find_or_create_instance("import", &parameters).await.unwrap();
        let execution = repo.create_execution(&instance, &parameters).await.unwrap();
        let loaded = repo.get_job_execution(execution.id).await.unwrap().unwrap();

        assert_eq!(loaded.parameters, parameters);
        assert_eq!(loaded.parameters.get_date("run.date"), Some(date));
        assert!(!loaded.parameters.get("attempt").unwrap().identifying);
        assert_eq!(loaded.status, BatchStatus::Starting);
        assert_eq!(loaded.instance, instance);
    }

    #[tokio::test]
    async fn test_duplicate_run_rejected_until_terminal() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let mut running = repo.create_execution(&instance, &params()).await.unwrap();

        let err = repo.create_execution(&instance, &params()).await.unwrap_err();
        assert!(matches!(err, AppError::JobExecutionAlreadyRunning(_)));
        assert_eq!(repo.find_running_job_executions("import").await.unwrap().len(), 1);

        running.status = BatchStatus::Failed;
        repo.update_job_execution(&mut running).await.unwrap();
        assert!(repo.find_running_job_executions("import").await.unwrap().is_empty());
        assert_ok!(repo.create_execution(&instance, &params()).await);
        assert_eq!(repo.find_job_executions(&instance).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_create_execution_for_unknown_instance() {
        let repo = repository().await;
        let ghost = JobInstance::new(99, "import", "k");
        assert!(matches!(
            repo.create_execution(&ghost, &params()).await,
            Err(AppError::InvalidState(_))
        ));
        assert!(matches!(
            repo.create_step_execution(99, "load", ExecutionContext::new()).await,
            Err(AppError::NoSuchJobExecution(99))
        ));
    }

    #[tokio::test]
    async fn test_stale_version_rejected() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let execution = repo.create_execution(&instance, &params()).await.unwrap();
        let mut step = repo
            .create_step_execution(execution.id, "load", ExecutionContext::new())
            .await
            .unwrap();
        let mut stale = step.clone();

        step.read_count = 3;
        repo.update_step_execution(&mut step).await.unwrap();
        assert_eq!(step.version, 1);

        let err = repo.update_step_execution(&mut stale).await.unwrap_err();
        assert!(matches!(err, AppError::OptimisticLocking(_)));

        let stored = repo.get_step_execution(execution.id, step.id).await.unwrap().unwrap();
        assert_eq!(stored.read_count, 3);
        assert_eq!(stored.version, 1);
    }

    #[tokio::test]
    async fn test_step_counters_and_context_written_together() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let execution = repo.create_execution(&instance, &params()).await.unwrap();
        let mut step = repo
            .create_step_execution(execution.id, "load", ExecutionContext::new())
            .await
            .unwrap();

        step.status = BatchStatus::Completed;
        step.exit_status = ExitStatus::with_description("COMPLETED", "done");
        step.read_count = 10;
        step.write_count = 9;
        step.filter_count = 1;
        step.commit_count = 2;
        step.write_skip_count = 1;
        step.add_failure("bad row");
        step.execution_context.put_long("reader.read.count", 10);
        repo.update_step_execution(&mut step).await.unwrap();
        assert!(!step.execution_context.is_dirty());

        let loaded = repo.get_job_execution(execution.id).await.unwrap().unwrap();
        let stored = loaded.step_execution("load").unwrap();
        assert_eq!(stored.status, BatchStatus::Completed);
        assert_eq!(stored.exit_status.exit_description(), "done");
        assert_eq!(
            (stored.read_count, stored.write_count, stored.filter_count),
            (10, 9, 1)
        );
        assert_eq!(stored.write_skip_count, 1);
        assert_eq!(stored.failure_exceptions, vec!["bad row".to_string()]);
        assert_eq!(stored.execution_context.get_long("reader.read.count"), Some(10));

        assert!(repo.get_step_execution(execution.id + 100, step.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_last_step_execution_and_count() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();

        let mut first = repo.create_execution(&instance, &params()).await.unwrap();
        let mut step = repo
            .create_step_execution(first.id, "load", ExecutionContext::new())
            .await
            .unwrap();
        step.start_time = Some(100);
        step.status = BatchStatus::Failed;
        repo.update_step_execution(&mut step).await.unwrap();
        first.status = BatchStatus::Failed;
        repo.update_job_execution(&mut first).await.unwrap();

        let second = repo.create_execution(&instance, &params()).await.unwrap();
        let mut retry = repo
            .create_step_execution(second.id, "load", ExecutionContext::new())
            .await
            .unwrap();
        retry.start_time = Some(200);
        repo.update_step_execution(&mut retry).await.unwrap();

        let last = repo.get_last_step_execution(&instance, "load").await.unwrap().unwrap();
        assert_eq!(last.id, retry.id);
        assert_eq!(repo.get_step_execution_count(&instance, "load").await.unwrap(), 2);
        assert_eq!(repo.get_step_execution_count(&instance, "other").await.unwrap(), 0);

        let latest = repo.get_last_job_execution("import", &params()).await.unwrap().unwrap();
        assert_eq!(latest.id, second.id);
        assert_eq!(latest.step_executions.len(), 1);
    }

    #[tokio::test]
    async fn test_synchronize_status_picks_up_stop() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let mut mine = repo.create_execution(&instance, &params()).await.unwrap();
        mine.status = BatchStatus::Started;
        repo.update_job_execution(&mut mine).await.unwrap();

        let mut operator_copy = repo.get_job_execution(mine.id).await.unwrap().unwrap();
        operator_copy.status = BatchStatus::Stopping;
        repo.update_job_execution(&mut operator_copy).await.unwrap();

        repo.synchronize_status(&mut mine).await.unwrap();
        assert_eq!(mine.status, BatchStatus::Stopping);
        assert_eq!(mine.version, operator_copy.version);
        repo.update_job_execution(&mut mine).await.unwrap();
    }

    #[tokio::test]
    async fn test_context_carried_to_next_execution() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let mut first = repo.create_execution(&instance, &params()).await.unwrap();
        first.execution_context.put_long("cursor", 42);
        first.status = BatchStatus::Stopped;
        repo.update_job_execution(&mut first).await.unwrap();

        let second = repo.create_execution(&instance, &params()).await.unwrap();
        assert_eq!(second.execution_context.get_long("cursor"), Some(42));
        assert!(!second.execution_context.is_dirty());
    }

    #[tokio::test]
    async fn test_execution_status_lookup() {
        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let mut execution = repo.create_execution(&instance, &params()).await.unwrap();
        execution.status = BatchStatus::Stopping;
        repo.update_job_execution(&mut execution).await.unwrap();

        assert_eq!(
            repo.get_job_execution_status(execution.id).await.unwrap(),
            Some(BatchStatus::Stopping)
        );
        assert_eq!(repo.get_job_execution_status(404).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_checkpoint_in_rolled_back_transaction_is_discarded() {
        use stepline_core::port::TransactionManager;

        let repo = repository().await;
        let instance = repo.find_or_create_instance("import", &params()).await.unwrap();
        let execution = repo.create_execution(&instance, &params()).await.unwrap();
        let mut step = repo
            .create_step_execution(execution.id, "load", ExecutionContext::new())
            .await
            .unwrap();
        let manager = repo.transaction_manager();

        step.commit_count = 1;
        step.execution_context.put_long("reader.read.count", 3);
        let mut tx = manager.begin().await.unwrap();
        repo.update_step_execution_in(&mut step, tx.as_mut()).await.unwrap();
        tx.commit().await.unwrap();

        let mut lost = step.clone();
        lost.commit_count = 2;
        lost.execution_context.put_long("reader.read.count", 6);
        let mut tx = manager.begin().await.unwrap();
        repo.update_step_execution_in(&mut lost, tx.as_mut()).await.unwrap();
        tx.rollback().await.unwrap();

        let stored = repo
            .get_step_execution(execution.id, step.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.commit_count, 1);
        assert_eq!(stored.version, step.version);
        assert_eq!(stored.execution_context.get_long("reader.read.count"), Some(3));
    }
}
