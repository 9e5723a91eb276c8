//! Chunk processing through a launched job
//!
//! Every test builds a job with `JobBuilder`, launches it on an in-memory
//! repository and checks the committed counts of its steps:
//! - retry, filter and skip in one step
//! - skip limit failing the job
//! - local partitioning aggregated into the manager step
//! - asynchronous writer checkpoints, and restart after a failed final batch

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use stepline_core::application::step::{
    AsyncItemWriter, ChunkContext, FnTasklet, PartitionStep, Partitioner,
    TaskExecutorPartitionHandler,
};
use stepline_core::application::{
    ChunkStepBuilder, ExitCodeMapper, FixedBackOffPolicy, Job, JobBuilder, JobLauncher,
    LauncherConfig, ListItemReader, ListItemWriter, RepeatStatus, RetryTemplate,
    SimpleExitCodeMapper, SimpleRetryPolicy, TaskletStep,
};
use stepline_core::domain::{
    BatchStatus, ExecutionContext, JobParameters, JobParametersBuilder, StepContribution,
};
use stepline_core::port::item::mocks::{FlakyItemWriter, ScriptedItemProcessor};
use stepline_core::port::listener::mocks::JournalListener;
use stepline_core::port::sleeper::mocks::RecordingSleeper;
use stepline_core::port::time_provider::mocks::SteppingTimeProvider;
use stepline_core::memory::InMemoryJobRepository;
use stepline_core::port::TimeProvider;
use tokio_test::assert_ok;

fn launcher() -> JobLauncher {
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SteppingTimeProvider::new(1_000, 5));
    JobLauncher::new(
        Arc::new(InMemoryJobRepository::new(time_provider.clone())),
        time_provider,
        LauncherConfig::default(),
    )
}

fn params(run: i64) -> JobParameters {
    JobParametersBuilder::new().add_long("run", run).build()
}

fn numbers(name: &str, n: i64) -> Arc<ListItemReader<i64>> {
    Arc::new(ListItemReader::new(name, (1..=n).collect()))
}

/// Retry on `io` errors without really sleeping between attempts.
fn io_retry(max_attempts: u32) -> (RetryTemplate, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let template = RetryTemplate::new(
        Arc::new(SimpleRetryPolicy::for_kinds(max_attempts, &["io"])),
        Arc::new(FixedBackOffPolicy::new(Duration::from_millis(100))),
    )
    .with_sleeper(sleeper.clone());
    (template, sleeper)
}

#[tokio::test]
async fn test_retry_filter_and_skip_in_one_step() {
    let processor = Arc::new(
        ScriptedItemProcessor::new()
            .filter(5)
            .fail_on(3, "io.reset", 1)
            .always_fail_on(8, "validation.range"),
    );
    let writer = Arc::new(FlakyItemWriter::new("write.rejected").always_fail_on(9));
    let skips = Arc::new(Mutex::new(Vec::new()));
    let journal = Arc::new(Mutex::new(Vec::new()));
    let (retry, sleeper) = io_retry(3);

    let step = ChunkStepBuilder::<i64, i64>::new("import")
        .chunk_size(4)
        .reader(numbers("source", 10))
        .processor(processor)
        .writer(writer.clone())
        .retry(retry)
        .skip_limit(3, &["validation", "write"])
        .skip_listener(Arc::new(JournalListener::new("skip", skips.clone())))
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(
        JobBuilder::new("import")
            .start(Arc::new(step))
            .listener(Arc::new(JournalListener::new("job", journal.clone())))
            .build()
            .unwrap(),
    );

    let launcher = launcher();
    let execution = assert_ok!(launcher.run(job, &params(1)).await);

    assert_eq!(execution.status, BatchStatus::Completed);
    assert_eq!(execution.exit_status.exit_code(), "COMPLETED");

    let step = execution.step_execution("import").unwrap();
    assert_eq!(step.read_count, 10);
    assert_eq!(step.filter_count, 1);
    assert_eq!(step.process_skip_count, 1);
    assert_eq!(step.write_skip_count, 1);
    assert_eq!(step.write_count, 7);
    assert_eq!(step.commit_count, 3);
    assert_eq!(writer.written(), vec![1, 2, 3, 4, 6, 7, 10]);
    assert_eq!(sleeper.pauses().len(), 1);

    assert_eq!(
        *skips.lock().unwrap(),
        vec!["skip:skip_process=8".to_string(), "skip:skip_write=9".to_string()]
    );
    assert_eq!(
        *journal.lock().unwrap(),
        vec!["job:before_job".to_string(), "job:after_job=COMPLETED".to_string()]
    );

    let stored = launcher
        .repository()
        .get_job_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, BatchStatus::Completed);
    assert_eq!(stored.step_executions[0].write_count, 7);
    assert_eq!(
        stored.step_executions[0]
            .execution_context
            .get_long("source.read.count"),
        Some(10)
    );
}

#[tokio::test]
async fn test_skip_limit_exceeded_fails_job() {
    let writer = Arc::new(
        FlakyItemWriter::new("write.rejected")
            .always_fail_on(2)
            .always_fail_on(3),
    );
    let step = ChunkStepBuilder::<i64, i64>::new("copy")
        .chunk_size(5)
        .reader(numbers("source", 5))
        .pass_through()
        .writer(writer.clone())
        .skip_limit(1, &["write"])
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(JobBuilder::new("copy").start(Arc::new(step)).build().unwrap());

    let execution = launcher().run(job, &params(1)).await.unwrap();

    assert_eq!(execution.status, BatchStatus::Failed);
    assert_eq!(execution.exit_status.exit_code(), "FAILED");
    assert_eq!(SimpleExitCodeMapper::new().int_value(execution.exit_status.exit_code()), 1);

    let step = execution.step_execution("copy").unwrap();
    assert_eq!(step.status, BatchStatus::Failed);
    assert_eq!(step.write_count, 0);
    assert_eq!(step.commit_count, 0);
    assert!(execution
        .all_failures()
        .iter()
        .any(|f| f.contains("Skip limit 1")));
    assert!(!writer.written().contains(&2));
}

#[tokio::test]
async fn test_unclassified_processor_error_is_not_skipped() {
    let processor = Arc::new(ScriptedItemProcessor::new().always_fail_on(4, "db.constraint"));
    let sink = Arc::new(ListItemWriter::new());
    let step = ChunkStepBuilder::<i64, i64>::new("copy")
        .chunk_size(3)
        .reader(numbers("source", 6))
        .processor(processor)
        .writer(sink.clone())
        .skip_limit(10, &["validation"])
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(JobBuilder::new("copy").start(Arc::new(step)).build().unwrap());

    let execution = launcher().run(job, &params(1)).await.unwrap();

    assert_eq!(execution.status, BatchStatus::Failed);
    let step = execution.step_execution("copy").unwrap();
    assert_eq!(step.commit_count, 1);
    assert_eq!(step.write_count, 3);
    assert!(step.rollback_count >= 1);
    assert_eq!(sink.written().await, vec![1, 2, 3]);
}

/// Splits `1..=total` into contiguous ranges, one per partition.
struct RangePartitioner {
    total: i64,
}

impl Partitioner for RangePartitioner {
    fn partition(&self, grid_size: usize) -> BTreeMap<String, ExecutionContext> {
        let grid = grid_size.max(1) as i64;
        let width = (self.total + grid - 1) / grid;
        (0..grid)
            .map(|i| {
                let mut context = ExecutionContext::new();
                context.put_long("min", i * width + 1);
                context.put_long("max", ((i + 1) * width).min(self.total));
                (format!("p{}", i), context)
            })
            .collect()
    }
}

#[tokio::test]
async fn test_partitioned_step_aggregates_workers() {
    let sum = Arc::new(AtomicI64::new(0));
    let sink = sum.clone();
    let worker = TaskletStep::builder("range")
        .tasklet(Arc::new(FnTasklet::new(
            move |contribution: &mut StepContribution, chunk: &mut ChunkContext<'_>| {
                let min = chunk.execution_context.get_long_or("min", 1);
                let max = chunk.execution_context.get_long_or("max", 0);
                let values: Vec<i64> = (min..=max).collect();
                contribution.increment_write_count(values.len() as u64);
                sink.fetch_add(values.iter().sum::<i64>(), Ordering::SeqCst);
                Ok(RepeatStatus::Finished)
            },
        )))
        .build()
        .unwrap();

    let handler = TaskExecutorPartitionHandler::new(Arc::new(worker), 4).concurrency(2);
    let manager = PartitionStep::new(
        "manager",
        Arc::new(RangePartitioner { total: 100 }),
        Arc::new(handler),
    );
    let job: Arc<dyn Job> = Arc::new(
        JobBuilder::new("partitioned")
            .start(Arc::new(manager))
            .build()
            .unwrap(),
    );

    let launcher = launcher();
    let execution = launcher.run(job, &params(1)).await.unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    let manager = execution.step_execution("manager").unwrap();
    assert_eq!(manager.write_count, 100);
    assert_eq!(sum.load(Ordering::SeqCst), 5050);

    let stored = launcher
        .repository()
        .get_job_execution(execution.id)
        .await
        .unwrap()
        .unwrap();
    let mut names: Vec<_> = stored
        .step_executions
        .iter()
        .map(|s| s.step_name.clone())
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec!["manager", "manager:p0", "manager:p1", "manager:p2", "manager:p3"]
    );
    assert!(stored
        .step_executions
        .iter()
        .all(|s| s.status == BatchStatus::Completed));
}

#[tokio::test]
async fn test_async_writer_checkpoints_queued_batches() {
    let sink = Arc::new(ListItemWriter::new());
    let writer = Arc::new(AsyncItemWriter::<i64>::with_throttle_limit("sink", sink.clone(), 2));
    let step = ChunkStepBuilder::<i64, i64>::new("export")
        .chunk_size(2)
        .reader(numbers("source", 9))
        .pass_through()
        .writer(writer.clone())
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(JobBuilder::new("export").start(Arc::new(step)).build().unwrap());

    let execution = launcher().run(job, &params(1)).await.unwrap();

    assert_eq!(execution.status, BatchStatus::Completed);
    let mut written = sink.written().await;
    written.sort();
    assert_eq!(written, (1..=9).collect::<Vec<i64>>());
    assert_eq!(writer.expected(), 5);
    assert_eq!(writer.actual(), 5);

    let step = execution.step_execution("export").unwrap();
    assert_eq!(step.write_count, 9);
    assert_eq!(step.execution_context.get_long("sink.async.expected"), Some(5));
}

#[tokio::test]
async fn test_async_writer_failure_fails_step() {
    // A single slot: the second chunk waits for the first batch, and the next
    // settle reports its failure
    let sink = Arc::new(FlakyItemWriter::new("io.closed").always_fail_on(1));
    let writer = Arc::new(AsyncItemWriter::<i64>::with_throttle_limit("sink", sink, 1));
    let step = ChunkStepBuilder::<i64, i64>::new("export")
        .chunk_size(2)
        .reader(numbers("source", 4))
        .pass_through()
        .writer(writer)
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(JobBuilder::new("export").start(Arc::new(step)).build().unwrap());

    let execution = launcher().run(job, &params(1)).await.unwrap();

    assert_eq!(execution.status, BatchStatus::Failed);
    assert!(execution.all_failures().iter().any(|f| f.contains("poisoned")));
}

#[tokio::test]
async fn test_failed_final_async_batch_is_written_on_restart() {
    let sink = Arc::new(FlakyItemWriter::new("io.closed").fail_on(5, 1));
    let writer = Arc::new(AsyncItemWriter::<i64>::new("sink", sink.clone()));
    let step = ChunkStepBuilder::<i64, i64>::new("export")
        .chunk_size(2)
        .reader(numbers("source", 5))
        .pass_through()
        .writer(writer)
        .build()
        .unwrap();
    let job: Arc<dyn Job> = Arc::new(JobBuilder::new("export").start(Arc::new(step)).build().unwrap());
    let launcher = launcher();

    let failed = launcher.run(job.clone(), &params(1)).await.unwrap();
    assert_eq!(failed.status, BatchStatus::Failed);
    let first = failed.step_execution("export").unwrap();
    assert_eq!(first.status, BatchStatus::Failed);
    assert!(first.write_count <= 4);
    assert_eq!(first.execution_context.get_long("source.read.count"), Some(4));
    assert!(failed.all_failures().iter().any(|f| f.contains("transient failure")));
    assert_eq!(sink.written(), vec![1, 2, 3, 4]);

    let restarted = launcher.run(job, &params(1)).await.unwrap();
    assert_eq!(restarted.status, BatchStatus::Completed);
    let second = restarted.step_execution("export").unwrap();
    assert_eq!(second.read_count, 1);
    assert_eq!(second.write_count, 1);
    assert_eq!(sink.written(), (1..=5).collect::<Vec<i64>>());
}
