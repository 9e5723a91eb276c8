// Application Layer - Fault-tolerance kit, step and flow engines, launching

pub mod backoff;
pub mod classifier;
pub mod constants;
pub mod flow;
pub mod item;
pub mod job;
pub mod launch;
pub mod repeat;
pub mod retry;
pub mod skip;
pub mod step;
pub mod stop;

#[cfg(test)]
pub(crate) mod fixtures;

// Re-exports
pub use backoff::{
    BackOffPolicy, ExponentialBackOffPolicy, ExponentialRandomBackOffPolicy, FixedBackOffPolicy,
    NoBackOffPolicy,
};
pub use classifier::{BinaryErrorClassifier, ErrorClassifier};
pub use flow::{Flow, FlowBuilder, FlowExecutionStatus, JobExecutionDecider, SimpleFlow};
pub use item::{
    CompositeItemProcessor, FnItemProcessor, FnItemWriter, ListItemReader, ListItemWriter,
    PassThroughItemProcessor,
};
pub use job::{DefaultJobParametersValidator, FlowJob, Job, JobBuilder, JobParametersValidator, JobRuntime};
pub use launch::{
    ExitCodeMapper, JobHandle, JobLauncher, JobOperator, JobRegistry, LauncherConfig,
    SimpleExitCodeMapper,
};
pub use repeat::{CompletionPolicy, RepeatStatus, SimpleCompletionPolicy};
pub use retry::{RetryPolicy, RetryTemplate, SimpleRetryPolicy};
pub use skip::{LimitCheckingSkipPolicy, SkipPolicy};
pub use step::{ChunkStepBuilder, Step, StepHandler, TaskletStep};
pub use stop::{ExecutionSynchronizer, StopRegistry, StopSignal};
