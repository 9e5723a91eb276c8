// Retry policies and the retry template

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::application::backoff::{BackOffContext, BackOffPolicy, NoBackOffPolicy};
use crate::application::classifier::{BinaryErrorClassifier, ErrorClassifier};
use crate::application::constants::DEFAULT_MAX_ATTEMPTS;
use crate::domain::ItemError;
use crate::port::{Sleeper, TokioSleeper};

/// Snapshot of the parent context, refreshed each time the parent records
/// an error. Lets a nested policy see the overall attempt count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentLink {
    pub retry_count: u32,
    pub last_error: Option<ItemError>,
}

/// State of one retry run.
///
/// Composite policies give every child its own nested context; nesting may
/// go to any depth and each level links to its direct parent.
#[derive(Debug, Clone)]
pub struct RetryContext {
    retry_count: u32,
    last_error: Option<ItemError>,
    exhausted: bool,
    started_at: Instant,
    parent: Option<ParentLink>,
    children: Vec<RetryContext>,
}

impl RetryContext {
    pub fn new() -> Self {
        Self {
            retry_count: 0,
            last_error: None,
            exhausted: false,
            started_at: Instant::now(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn last_error(&self) -> Option<&ItemError> {
        self.last_error.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn parent(&self) -> Option<&ParentLink> {
        self.parent.as_ref()
    }

    pub fn children(&self) -> &[RetryContext] {
        &self.children
    }

    pub fn register(&mut self, error: &ItemError) {
        self.retry_count += 1;
        self.last_error = Some(error.clone());
    }

    fn link(&self) -> ParentLink {
        ParentLink {
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
        }
    }
}

impl Default for RetryContext {
    fn default() -> Self {
        Self::new()
    }
}

pub trait RetryPolicy: Send + Sync {
    fn open(&self) -> RetryContext {
        RetryContext::new()
    }

    /// May the operation be attempted (again)?
    fn can_retry(&self, context: &RetryContext) -> bool;

    fn register_error(&self, context: &mut RetryContext, error: &ItemError) {
        context.register(error);
    }
}

/// Allows the first attempt only.
#[derive(Debug, Clone, Default)]
pub struct NeverRetryPolicy;

impl RetryPolicy for NeverRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.last_error().is_none()
    }
}

#[derive(Debug, Clone, Default)]
pub struct AlwaysRetryPolicy;

impl RetryPolicy for AlwaysRetryPolicy {
    fn can_retry(&self, _context: &RetryContext) -> bool {
        true
    }
}

/// Bounded attempts (first try included) for classified errors.
pub struct SimpleRetryPolicy {
    max_attempts: u32,
    classifier: Arc<dyn ErrorClassifier>,
}

impl SimpleRetryPolicy {
    pub fn new(max_attempts: u32, classifier: Arc<dyn ErrorClassifier>) -> Self {
        Self {
            max_attempts,
            classifier,
        }
    }

    /// Retry every error kind up to `max_attempts`.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self::new(max_attempts, Arc::new(BinaryErrorClassifier::new(true)))
    }

    /// Retry only the listed error kinds.
    pub fn for_kinds<S: AsRef<str>>(max_attempts: u32, kinds: &[S]) -> Self {
        Self::new(max_attempts, Arc::new(BinaryErrorClassifier::only(kinds)))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        Self::with_max_attempts(DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        let retryable = context
            .last_error()
            .map_or(true, |error| self.classifier.classify(error));
        retryable && context.retry_count() < self.max_attempts
    }
}

/// Keeps retrying until a wall-clock budget is spent.
#[derive(Debug, Clone)]
pub struct TimeoutRetryPolicy {
    timeout: Duration,
}

impl TimeoutRetryPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl RetryPolicy for TimeoutRetryPolicy {
    fn can_retry(&self, context: &RetryContext) -> bool {
        context.elapsed() < self.timeout
    }
}

/// Combines child policies.
///
/// Pessimistic (default): retry only if every child allows it, so a single
/// veto stops the run. Optimistic: retry if any child allows it.
pub struct CompositeRetryPolicy {
    policies: Vec<Arc<dyn RetryPolicy>>,
    optimistic: bool,
}

impl CompositeRetryPolicy {
    pub fn new(policies: Vec<Arc<dyn RetryPolicy>>) -> Self {
        Self {
            policies,
            optimistic: false,
        }
    }

    pub fn optimistic(mut self, optimistic: bool) -> Self {
        self.optimistic = optimistic;
        self
    }
}

impl RetryPolicy for CompositeRetryPolicy {
    fn open(&self) -> RetryContext {
        let mut context = RetryContext::new();
        let link = context.link();
        context.children = self
            .policies
            .iter()
            .map(|policy| {
                let mut child = policy.open();
                child.parent = Some(link.clone());
                child
            })
            .collect();
        context
    }

    fn can_retry(&self, context: &RetryContext) -> bool {
        let mut verdicts = self
            .policies
            .iter()
            .zip(context.children.iter())
            .map(|(policy, child)| policy.can_retry(child));
        if self.optimistic {
            verdicts.any(|allowed| allowed)
        } else {
            verdicts.all(|allowed| allowed)
        }
    }

    fn register_error(&self, context: &mut RetryContext, error: &ItemError) {
        context.register(error);
        let link = context.link();
        for (policy, child) in self.policies.iter().zip(context.children.iter_mut()) {
            child.parent = Some(link.clone());
            policy.register_error(child, error);
        }
    }
}

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Attempt again; the back-off pause has already elapsed
    Retry(Duration),
    /// Policy refuses further attempts
    Exhausted,
}

/// Runs operations under a retry policy with back-off between attempts.
#[derive(Clone)]
pub struct RetryTemplate {
    policy: Arc<dyn RetryPolicy>,
    backoff: Arc<dyn BackOffPolicy>,
    sleeper: Arc<dyn Sleeper>,
}

impl RetryTemplate {
    pub fn new(policy: Arc<dyn RetryPolicy>, backoff: Arc<dyn BackOffPolicy>) -> Self {
        Self {
            policy,
            backoff,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Template that never retries.
    pub fn never() -> Self {
        Self::new(Arc::new(NeverRetryPolicy), Arc::new(NoBackOffPolicy))
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Begin a retry run with fresh policy and back-off state.
    pub fn start(&self) -> RetryState<'_> {
        RetryState {
            template: self,
            context: self.policy.open(),
            backoff: self.backoff.start(),
        }
    }

    /// Call `operation` until it succeeds or the policy is exhausted, in
    /// which case the last error is returned. The closure receives the
    /// zero-based attempt number.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, ItemError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ItemError>>,
    {
        let mut state = self.start();
        loop {
            match operation(state.context().retry_count()).await {
                Ok(value) => return Ok(value),
                Err(error) => match state.on_error(&error).await {
                    RetryDecision::Retry(_) => continue,
                    RetryDecision::Exhausted => return Err(error),
                },
            }
        }
    }
}

/// One in-progress retry run.
pub struct RetryState<'a> {
    template: &'a RetryTemplate,
    context: RetryContext,
    backoff: BackOffContext,
}

impl RetryState<'_> {
    pub fn context(&self) -> &RetryContext {
        &self.context
    }

    /// Record a failure and decide; sleeps for the back-off pause before
    /// returning `Retry`.
    pub async fn on_error(&mut self, error: &ItemError) -> RetryDecision {
        let policy = &self.template.policy;
        policy.register_error(&mut self.context, error);

        if !policy.can_retry(&self.context) {
            self.context.exhausted = true;
            if self.context.retry_count() > 1 {
                warn!(
                    attempts = self.context.retry_count(),
                    error = %error,
                    "Retry exhausted"
                );
            } else {
                debug!(error = %error, "Error not retried");
            }
            return RetryDecision::Exhausted;
        }

        let pause = self.template.backoff.next_pause(&mut self.backoff);
        info!(
            attempt = self.context.retry_count(),
            delay_ms = pause.as_millis() as u64,
            error = %error,
            "Scheduling retry"
        );
        if !pause.is_zero() {
            self.template.sleeper.sleep(pause).await;
        }
        RetryDecision::Retry(pause)
    }
}
