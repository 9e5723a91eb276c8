// Engine constants (No magic values)
use std::time::Duration;

/// Default commit interval of chunk-oriented steps
pub const DEFAULT_CHUNK_SIZE: usize = 10;

/// Default number of times a step may be started per job instance
pub const DEFAULT_START_LIMIT: u32 = u32::MAX;

/// Default upper bound of concurrently running split branches / partitions
pub const DEFAULT_WORKER_POOL_SIZE: usize = 4;

/// Default number of in-flight asynchronous chunk writes
pub const DEFAULT_THROTTLE_LIMIT: usize = 4;

/// Default interval between repository polls for remote workers (10s)
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default first pause of exponential back-off (100ms)
pub const DEFAULT_BACKOFF_INITIAL_INTERVAL: Duration = Duration::from_millis(100);

/// Default growth factor of exponential back-off
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default cap of exponential back-off (30s)
pub const DEFAULT_BACKOFF_MAX_INTERVAL: Duration = Duration::from_secs(30);

/// Default attempts (first try included) of `SimpleRetryPolicy`
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Separator between a partitioned step's name and the partition name
pub const PARTITION_SEPARATOR: &str = ":";

/// Job context key holding the END state a flow last stopped at
pub const STOPPED_STATE_KEY: &str = "batch.flow.stopped_state";

/// Manager step context key holding the partition grid size
pub const GRID_SIZE_KEY: &str = "StepExecutionSplitter.GRID_SIZE";
