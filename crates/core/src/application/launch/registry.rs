// Job registry - names to runnable jobs

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::application::job::Job;
use crate::error::{AppError, Result};

#[derive(Default)]
pub struct JobRegistry {
    jobs: RwLock<BTreeMap<String, Arc<dyn Job>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job under its own name. Names are unique.
    pub async fn register(&self, job: Arc<dyn Job>) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        let name = job.name().to_string();
        if jobs.contains_key(&name) {
            return Err(AppError::Config(format!(
                "a job named '{name}' is already registered"
            )));
        }
        debug!(job = %name, "Job registered");
        jobs.insert(name, job);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) -> bool {
        self.jobs.write().await.remove(name).is_some()
    }

    pub async fn get(&self, name: &str) -> Result<Arc<dyn Job>> {
        self.jobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::NoSuchJob(name.to_string()))
    }

    /// Registered names, sorted.
    pub async fn job_names(&self) -> Vec<String> {
        self.jobs.read().await.keys().cloned().collect()
    }
}
