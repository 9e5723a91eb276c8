// Stop signalling between operators and running executions

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::domain::JobExecutionId;

const RUNNING: u8 = 0;
const STOP_REQUESTED: u8 = 1;
const OBSERVED: u8 = 2;

/// Stop request for one execution.
///
/// Moves `Running -> StopRequested -> Observed`. Each transition succeeds
/// exactly once, so a stop is requested once and acted on once no matter how
/// many threads race on it.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    state: AtomicU8,
    tx: watch::Sender<bool>,
}

impl StopSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(StopInner {
                state: AtomicU8::new(RUNNING),
                tx,
            }),
        }
    }

    /// Request a stop. Returns false if one was already requested.
    pub fn request(&self) -> bool {
        let requested = self
            .inner
            .state
            .compare_exchange(RUNNING, STOP_REQUESTED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if requested {
            self.inner.tx.send_replace(true);
        }
        requested
    }

    /// Claim a pending request. Only the first caller after `request` wins.
    pub fn observe(&self) -> bool {
        self.inner
            .state
            .compare_exchange(STOP_REQUESTED, OBSERVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Has a stop been requested (observed or not)?
    pub fn is_stop_requested(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != RUNNING
    }

    pub fn is_observed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == OBSERVED
    }

    /// Resolve once a stop has been requested.
    pub async fn wait(&self) {
        let mut rx = self.inner.tx.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop signals of executions running in this process.
#[derive(Default)]
pub struct StopRegistry {
    signals: Mutex<HashMap<JobExecutionId, StopSignal>>,
}

impl StopRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, execution_id: JobExecutionId) -> StopSignal {
        self.signals
            .lock()
            .await
            .entry(execution_id)
            .or_default()
            .clone()
    }

    pub async fn get(&self, execution_id: JobExecutionId) -> Option<StopSignal> {
        self.signals.lock().await.get(&execution_id).cloned()
    }

    pub async fn remove(&self, execution_id: JobExecutionId) {
        self.signals.lock().await.remove(&execution_id);
    }
}

/// Per-execution async lock around status read-modify-write.
///
/// The execution thread holds it while persisting progress and the operator
/// while requesting a stop, so neither overwrites the other's status.
#[derive(Default)]
pub struct ExecutionSynchronizer {
    locks: Mutex<HashMap<JobExecutionId, Arc<Mutex<()>>>>,
}

impl ExecutionSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, execution_id: JobExecutionId) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .lock()
            .await
            .entry(execution_id)
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    /// Forget the lock of a finished execution.
    pub async fn release(&self, execution_id: JobExecutionId) {
        self.locks.lock().await.remove(&execution_id);
    }
}
