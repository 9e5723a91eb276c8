// Demo jobs registered by the command-line entry point
//
// - numbers: chunk-sum over 1..=count
// - flaky:   a writer that fails once per chunk and rejects one item for good,
//            exercising write retry and scan-mode skipping
// - fan-out: two parallel branches, then a decision on whether to report

use async_trait::async_trait;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use stepline_core::application::flow::{
    DecisionState, Flow, FlowBuilder, FlowExecutionStatus, FnDecider, SplitState,
};
use stepline_core::application::step::{ChunkContext, FnTasklet};
use stepline_core::application::{
    ChunkStepBuilder, DefaultJobParametersValidator, FixedBackOffPolicy, FnItemWriter, Job,
    JobBuilder, JobRegistry, ListItemReader, RepeatStatus, RetryTemplate, SimpleRetryPolicy,
    TaskletStep,
};
use stepline_core::domain::{
    BatchStatus, ItemError, JobExecution, JobParameters, StepContribution, StepExecution,
};
use stepline_core::error::Result;
use stepline_core::port::JobExecutionListener;

pub const NUMBERS: &str = "numbers";
pub const FLAKY: &str = "flaky";
pub const FAN_OUT: &str = "fan-out";

/// (name, description) of every demo job
pub const DEMO_JOBS: [(&str, &str); 3] = [
    (NUMBERS, "Sum 1..=count in chunks (count(long)=N)"),
    (FLAKY, "Writer fails once per chunk and rejects fail.on(long)=N"),
    (FAN_OUT, "Two parallel branches, then a decision (report=off skips the report)"),
];

const DEFAULT_COUNT: i64 = 100;
const DEFAULT_FAIL_ON: i64 = 13;
const DEMO_CHUNK_SIZE: usize = 10;
const WRITE_ATTEMPTS: u32 = 3;
const WRITE_SKIP_LIMIT: u64 = 5;
const RETRY_PAUSE: Duration = Duration::from_millis(20);

const TRANSIENT_ERROR: &str = "io.transient";
const INVALID_ITEM_ERROR: &str = "data.invalid";

/// Registry holding every demo job, sized by the launch parameters.
pub async fn registry(parameters: &JobParameters) -> Result<JobRegistry> {
    let registry = JobRegistry::new();
    registry.register(numbers_job(parameters)?).await?;
    registry.register(flaky_job(parameters)?).await?;
    registry.register(fan_out_job()?).await?;
    Ok(registry)
}

pub fn describe(job_name: &str) -> &'static str {
    DEMO_JOBS
        .iter()
        .find(|(name, _)| *name == job_name)
        .map(|(_, description)| *description)
        .unwrap_or("")
}

fn count(parameters: &JobParameters) -> i64 {
    parameters.get_long("count").unwrap_or(DEFAULT_COUNT).max(0)
}

/// Logs the running total once the job is over.
struct TotalReporter {
    total: Arc<AtomicI64>,
}

#[async_trait]
impl JobExecutionListener for TotalReporter {
    async fn after_job(&self, execution: &JobExecution) {
        let total = self.total.load(Ordering::SeqCst);
        if execution.status == BatchStatus::Completed {
            info!(job_name = %execution.job_name(), total, "Total written");
        } else {
            warn!(job_name = %execution.job_name(), total, status = %execution.status, "Partial total");
        }
    }
}

fn numbers_job(parameters: &JobParameters) -> Result<Arc<dyn Job>> {
    let items: Vec<i64> = (1..=count(parameters)).collect();
    let total = Arc::new(AtomicI64::new(0));
    let sink = total.clone();

    let step = ChunkStepBuilder::<i64, i64>::new("numbers.sum")
        .chunk_size(DEMO_CHUNK_SIZE)
        .reader(Arc::new(ListItemReader::new("numbers.reader", items)))
        .pass_through()
        .writer(Arc::new(FnItemWriter::new(move |chunk: &[i64]| {
            sink.fetch_add(chunk.iter().sum::<i64>(), Ordering::SeqCst);
            Ok(())
        })))
        .build()?;

    let job = JobBuilder::new(NUMBERS)
        .start(Arc::new(step))
        .validator(Arc::new(DefaultJobParametersValidator::new(
            &[],
            &["count", "run.id"],
        )?))
        .listener(Arc::new(TotalReporter { total }))
        .build()?;
    Ok(Arc::new(job))
}

fn flaky_job(parameters: &JobParameters) -> Result<Arc<dyn Job>> {
    let items: Vec<i64> = (1..=count(parameters)).collect();
    let rejected = parameters.get_long("fail.on").unwrap_or(DEFAULT_FAIL_ON);
    let total = Arc::new(AtomicI64::new(0));
    let sink = total.clone();
    // First item of the last chunk that already failed once
    let failed_chunk = AtomicI64::new(i64::MIN);

    let writer = FnItemWriter::new(move |chunk: &[i64]| {
        if chunk.contains(&rejected) {
            return Err(ItemError::new(
                INVALID_ITEM_ERROR,
                format!("item {rejected} rejected by sink"),
            ));
        }
        if chunk.len() > 1 && failed_chunk.swap(chunk[0], Ordering::SeqCst) != chunk[0] {
            return Err(ItemError::new(
                TRANSIENT_ERROR,
                format!("sink busy at chunk starting with {}", chunk[0]),
            ));
        }
        sink.fetch_add(chunk.iter().sum::<i64>(), Ordering::SeqCst);
        Ok(())
    });

    let retry = RetryTemplate::new(
        Arc::new(SimpleRetryPolicy::for_kinds(WRITE_ATTEMPTS, &[TRANSIENT_ERROR])),
        Arc::new(FixedBackOffPolicy::new(RETRY_PAUSE)),
    );

    let step = ChunkStepBuilder::<i64, i64>::new("flaky.write")
        .chunk_size(DEMO_CHUNK_SIZE)
        .reader(Arc::new(ListItemReader::new("flaky.reader", items)))
        .pass_through()
        .writer(Arc::new(writer))
        .retry(retry)
        .skip_limit(WRITE_SKIP_LIMIT, &[INVALID_ITEM_ERROR])
        .build()?;

    let job = JobBuilder::new(FLAKY)
        .start(Arc::new(step))
        .listener(Arc::new(TotalReporter { total }))
        .build()?;
    Ok(Arc::new(job))
}

fn branch(name: &str, remainder: i64) -> Result<Arc<dyn Flow>> {
    let step_name = format!("{FAN_OUT}.{name}");
    let tasklet = FnTasklet::new(
        move |contribution: &mut StepContribution, chunk: &mut ChunkContext<'_>| {
            let values: Vec<i64> = (1..=count(chunk.step().job_parameters()))
                .filter(|n| n % 2 == remainder)
                .collect();
            contribution.increment_write_count(values.len() as u64);
            info!(step_name = %chunk.step_name(), sum = values.iter().sum::<i64>(), "Branch summed");
            Ok(RepeatStatus::Finished)
        },
    );
    let step = TaskletStep::builder(step_name.clone())
        .tasklet(Arc::new(tasklet))
        .build()?;
    let flow = FlowBuilder::new(step_name).start_step(Arc::new(step)).build()?;
    Ok(Arc::new(flow))
}

fn fan_out_job() -> Result<Arc<dyn Job>> {
    let split = SplitState::new(
        format!("{FAN_OUT}.split"),
        vec![branch("even", 0)?, branch("odd", 1)?],
    );

    let decider = FnDecider::new(|execution: &JobExecution, _last: Option<&StepExecution>| {
        match execution.parameters.get_string("report") {
            Some("off") => FlowExecutionStatus::new("SKIPPED"),
            _ => FlowExecutionStatus::new("REPORT"),
        }
    });
    let decision_name = format!("{FAN_OUT}.decide");

    let report = TaskletStep::builder(format!("{FAN_OUT}.report"))
        .tasklet(Arc::new(FnTasklet::new(
            |_: &mut StepContribution, chunk: &mut ChunkContext<'_>| {
                info!(job_name = %chunk.step().job_name(), "Report written");
                Ok(RepeatStatus::Finished)
            },
        )))
        .build()?;

    let flow = FlowBuilder::new(FAN_OUT)
        .start(Arc::new(split))
        .next(Arc::new(DecisionState::new(
            decision_name.clone(),
            Arc::new(decider),
        )))
        .on("REPORT")
        .to_step(Arc::new(report))
        .from(&decision_name)
        .on("SKIPPED")
        .end()
        .build()?;

    let job = JobBuilder::new(FAN_OUT).flow(Arc::new(flow)).build()?;
    Ok(Arc::new(job))
}
