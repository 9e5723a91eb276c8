//! Stepline CLI - launch and operate batch jobs against the SQLite job repository

mod jobs;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tabled::{Table, Tabled};
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use stepline_core::application::constants::DEFAULT_WORKER_POOL_SIZE;
use stepline_core::application::launch::exit_code::{
    EXIT_CODE_COMPLETED, JOB_NOT_PROVIDED, NO_SUCH_JOB,
};
use stepline_core::application::{
    ExitCodeMapper, JobHandle, JobLauncher, JobOperator, JobRegistry, LauncherConfig,
    SimpleExitCodeMapper,
};
use stepline_core::domain::{BatchStatus, JobExecution, JobExecutionId, JobParameters};
use stepline_core::error::AppError;
use stepline_core::port::{JobRepository, SystemTimeProvider, TimeProvider};
use stepline_infra_sqlite::{create_pool, run_migrations, SqliteJobRepository};

const DEFAULT_DB_PATH: &str = "~/.stepline/batch.db";
const DEFAULT_LOG_FILTER: &str = "stepline=info";

#[derive(Parser)]
#[command(name = "stepline")]
#[command(about = "Stepline batch job runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Job repository database path
    #[arg(long, env = "STEPLINE_DB_PATH", global = true)]
    db: Option<String>,

    /// Maximum number of job executions running at once
    #[arg(long, env = "STEPLINE_WORKERS", default_value_t = DEFAULT_WORKER_POOL_SIZE, global = true)]
    workers: usize,
}

#[derive(Subcommand)]
enum Commands {
    /// List the registered jobs
    Jobs,

    /// Launch a job and wait for it to finish
    Launch {
        /// Job name
        job: Option<String>,

        /// Parameters: name=value, name(long)=5, name(double)=1.5,
        /// name(date)=2024-01-01T00:00:00Z; a leading '-' marks non-identifying
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        params: Vec<String>,
    },

    /// Restart a FAILED or STOPPED execution with its original parameters
    Restart { execution_id: JobExecutionId },

    /// Ask a running execution to stop at the next chunk boundary
    Stop { execution_id: JobExecutionId },

    /// Mark a finished execution ABANDONED so it is never restarted
    Abandon { execution_id: JobExecutionId },

    /// Show an execution and its step executions
    Status {
        execution_id: JobExecutionId,

        /// Print the execution as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct JobRow {
    name: String,
    description: String,
}

#[derive(Tabled)]
struct StepRow {
    id: i64,
    step: String,
    status: String,
    exit_code: String,
    read: u64,
    write: u64,
    filter: u64,
    skip: u64,
    commit: u64,
    rollback: u64,
}

fn init_tracing() -> Result<()> {
    let log_format = std::env::var("STEPLINE_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_LOG_FILTER))
        .context("Failed to create env filter")?;

    // Logs go to stderr, tables to stdout
    match log_format.as_str() {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

/// Open the job repository and build the launcher around it
async fn connect(cli: &Cli) -> Result<(Arc<dyn JobRepository>, Arc<JobLauncher>)> {
    let raw_path = cli.db.as_deref().unwrap_or(DEFAULT_DB_PATH);
    let db_path = shellexpand::tilde(raw_path).into_owned();

    if let Some(parent) = Path::new(&db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }

    info!(db_path = %db_path, "Opening job repository");
    let pool = create_pool(&db_path)
        .await
        .with_context(|| format!("DB pool creation failed for {db_path}"))?;
    run_migrations(&pool).await.context("Migration failed")?;

    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let repository: Arc<dyn JobRepository> =
        Arc::new(SqliteJobRepository::new(pool, time_provider.clone()));
    let launcher = Arc::new(JobLauncher::new(
        repository.clone(),
        time_provider,
        LauncherConfig {
            max_concurrent_jobs: cli.workers.max(1),
        },
    ));
    Ok((repository, launcher))
}

/// Wait for the execution; Ctrl-C turns into a stop request
async fn wait_or_stop(operator: &JobOperator, handle: JobHandle) -> Result<JobExecution> {
    let execution_id = handle.execution_id();
    let mut wait = Box::pin(handle.wait());

    tokio::select! {
        result = &mut wait => return Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            warn!(execution_id, "Interrupt received, stopping job");
            operator
                .stop(execution_id)
                .await
                .context("Failed to stop job")?;
        }
    }

    Ok(wait.await?)
}

fn colored_status(status: BatchStatus) -> colored::ColoredString {
    match status {
        BatchStatus::Completed => status.as_str().green().bold(),
        BatchStatus::Starting | BatchStatus::Started => status.as_str().cyan().bold(),
        BatchStatus::Stopping | BatchStatus::Stopped => status.as_str().yellow().bold(),
        _ => status.as_str().red().bold(),
    }
}

fn print_execution(execution: &JobExecution) {
    println!(
        "{} {} (execution {}) {}",
        "Job".bold(),
        execution.job_name(),
        execution.id,
        colored_status(execution.status)
    );
    println!("  {} {}", "Exit:".bold(), execution.exit_status);
    if !execution.parameters.is_empty() {
        println!("  {} {}", "Parameters:".bold(), execution.parameters);
    }
    for failure in execution.all_failures() {
        println!("  {} {}", "✗".red(), failure);
    }

    if !execution.step_executions.is_empty() {
        let rows: Vec<StepRow> = execution
            .step_executions
            .iter()
            .map(|step| StepRow {
                id: step.id,
                step: step.step_name.clone(),
                status: step.status.to_string(),
                exit_code: step.exit_status.exit_code().to_string(),
                read: step.read_count,
                write: step.write_count,
                filter: step.filter_count,
                skip: step.skip_count(),
                commit: step.commit_count,
                rollback: step.rollback_count,
            })
            .collect();
        println!();
        println!("{}", Table::new(rows));
    }
}

async fn launch(
    launcher: Arc<JobLauncher>,
    job_name: Option<String>,
    args: Vec<String>,
    mapper: &SimpleExitCodeMapper,
) -> Result<i32> {
    let Some(job_name) = job_name else {
        eprintln!("{}", "✗ No job name given".red().bold());
        return Ok(mapper.int_value(JOB_NOT_PROVIDED));
    };

    let parameters = JobParameters::parse(&args).context("Invalid job parameters")?;
    let registry = jobs::registry(&parameters)
        .await
        .context("Failed to register jobs")?;
    let operator = JobOperator::new(Arc::new(registry), launcher);

    let handle = match operator.start(&job_name, &parameters).await {
        Ok(handle) => handle,
        Err(AppError::NoSuchJob(name)) => {
            eprintln!("{}", format!("✗ No such job: {name}").red().bold());
            return Ok(mapper.int_value(NO_SUCH_JOB));
        }
        Err(e) => return Err(e).with_context(|| format!("Failed to launch job '{job_name}'")),
    };
    println!(
        "{}",
        format!("▶ Job {} launched (execution {})", job_name, handle.execution_id()).cyan()
    );

    let execution = wait_or_stop(&operator, handle).await?;
    println!();
    print_execution(&execution);
    Ok(mapper.int_value(execution.exit_status.exit_code()))
}

async fn restart(
    repository: Arc<dyn JobRepository>,
    launcher: Arc<JobLauncher>,
    execution_id: JobExecutionId,
    mapper: &SimpleExitCodeMapper,
) -> Result<i32> {
    let previous = repository
        .get_job_execution(execution_id)
        .await?
        .ok_or_else(|| anyhow!("No job execution {execution_id}"))?;

    let registry = jobs::registry(&previous.parameters)
        .await
        .context("Failed to register jobs")?;
    let operator = JobOperator::new(Arc::new(registry), launcher);

    let handle = operator
        .restart(execution_id)
        .await
        .with_context(|| format!("Failed to restart execution {execution_id}"))?;
    println!(
        "{}",
        format!(
            "▶ Job {} restarted (execution {})",
            previous.job_name(),
            handle.execution_id()
        )
        .cyan()
    );

    let execution = wait_or_stop(&operator, handle).await?;
    println!();
    print_execution(&execution);
    Ok(mapper.int_value(execution.exit_status.exit_code()))
}

async fn run(cli: Cli) -> Result<i32> {
    let mapper = SimpleExitCodeMapper::new();

    if let Commands::Jobs = cli.command {
        let registry = jobs::registry(&JobParameters::new()).await?;
        let rows: Vec<JobRow> = registry
            .job_names()
            .await
            .into_iter()
            .map(|name| JobRow {
                description: jobs::describe(&name).to_string(),
                name,
            })
            .collect();
        println!("{}", Table::new(rows));
        return Ok(EXIT_CODE_COMPLETED);
    }

    let (repository, launcher) = connect(&cli).await?;

    match cli.command {
        Commands::Jobs => Ok(EXIT_CODE_COMPLETED),

        Commands::Launch { job, params } => launch(launcher, job, params, &mapper).await,

        Commands::Restart { execution_id } => {
            restart(repository, launcher, execution_id, &mapper).await
        }

        Commands::Stop { execution_id } => {
            let operator = JobOperator::new(Arc::new(JobRegistry::new()), launcher);
            let signalled = operator
                .stop(execution_id)
                .await
                .with_context(|| format!("Failed to stop execution {execution_id}"))?;
            println!(
                "{}",
                format!("✓ Stop requested for execution {execution_id}")
                    .green()
                    .bold()
            );
            if !signalled {
                println!("  The owning process stops at its next chunk boundary");
            }
            Ok(EXIT_CODE_COMPLETED)
        }

        Commands::Abandon { execution_id } => {
            let operator = JobOperator::new(Arc::new(JobRegistry::new()), launcher);
            let execution = operator
                .abandon(execution_id)
                .await
                .with_context(|| format!("Failed to abandon execution {execution_id}"))?;
            print_execution(&execution);
            Ok(EXIT_CODE_COMPLETED)
        }

        Commands::Status { execution_id, json } => {
            let execution = repository
                .get_job_execution(execution_id)
                .await?
                .ok_or_else(|| anyhow!("No job execution {execution_id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&execution)?);
            } else {
                print_execution(&execution);
            }
            Ok(EXIT_CODE_COMPLETED)
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing()?;

    let code = run(cli).await?;
    Ok(ExitCode::from(u8::try_from(code).unwrap_or(1)))
}
