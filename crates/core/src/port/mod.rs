// Port Layer - Interfaces for external collaborators

pub mod dispatcher;
pub mod item;
pub mod job_repository;
pub mod listener;
pub mod sleeper;
pub mod time_provider;
pub mod transaction;

// Re-exports
pub use dispatcher::{StepExecutionRequest, StepRequestDispatcher};
pub use item::{ItemProcessor, ItemReader, ItemStream, ItemWriter};
pub use job_repository::JobRepository;
pub use listener::{
    ChunkListener, ItemProcessListener, ItemReadListener, ItemWriteListener, JobExecutionListener,
    SkipListener, StepExecutionListener,
};
pub use sleeper::{Sleeper, TokioSleeper};
pub use time_provider::{SystemTimeProvider, TimeProvider};
pub use transaction::{ResourcelessTransactionManager, Transaction, TransactionManager};
