// Shared test fixtures for engine unit tests

use std::sync::Arc;

use crate::application::step::StepContext;
use crate::application::stop::StopSignal;
use crate::domain::{JobExecution, JobParametersBuilder, StepExecution};
use crate::port::time_provider::mocks::SteppingTimeProvider;
use crate::memory::InMemoryJobRepository;
use crate::port::{JobRepository, TimeProvider};

pub(crate) struct Fixture {
    pub repository: Arc<InMemoryJobRepository>,
    pub time_provider: Arc<dyn TimeProvider>,
    pub job_execution: JobExecution,
    pub stop_signal: StopSignal,
}

impl Fixture {
    pub async fn new(job_name: &str) -> Self {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SteppingTimeProvider::new(1_000, 1));
        let repository = Arc::new(InMemoryJobRepository::new(time_provider.clone()));
        let params = JobParametersBuilder::new().add_long("run", 1).build();
        let instance = repository
            .find_or_create_instance(job_name, &params)
            .await
            .unwrap();
        let job_execution = repository.create_execution(&instance, &params).await.unwrap();
        Self {
            repository,
            time_provider,
            job_execution,
            stop_signal: StopSignal::new(),
        }
    }

    pub fn context(&self) -> StepContext {
        StepContext::new(
            &self.job_execution,
            self.repository.clone(),
            self.time_provider.clone(),
            self.stop_signal.clone(),
        )
    }

    pub async fn step_execution(&self, step_name: &str) -> StepExecution {
        self.repository
            .create_step_execution(self.job_execution.id, step_name, Default::default())
            .await
            .unwrap()
    }
}
