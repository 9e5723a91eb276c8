// Back-off policies - pauses between retry attempts

use rand::Rng;
use std::time::Duration;

use crate::application::constants::{
    DEFAULT_BACKOFF_INITIAL_INTERVAL, DEFAULT_BACKOFF_MAX_INTERVAL, DEFAULT_BACKOFF_MULTIPLIER,
};

/// Per-retry-run back-off state. Each run owns one, so a policy can be
/// shared between threads without locking.
#[derive(Debug, Clone, Default)]
pub struct BackOffContext {
    interval: Duration,
    pauses: u32,
}

impl BackOffContext {
    pub fn pauses(&self) -> u32 {
        self.pauses
    }
}

pub trait BackOffPolicy: Send + Sync {
    fn start(&self) -> BackOffContext {
        BackOffContext::default()
    }

    /// Length of the next pause; advances the context.
    fn next_pause(&self, context: &mut BackOffContext) -> Duration;
}

/// Multiply a duration, rounding to the nearest nanosecond.
fn scale(duration: Duration, factor: f64) -> Duration {
    Duration::from_nanos((duration.as_nanos() as f64 * factor).round() as u64)
}

/// Retry immediately.
#[derive(Debug, Clone, Default)]
pub struct NoBackOffPolicy;

impl BackOffPolicy for NoBackOffPolicy {
    fn next_pause(&self, context: &mut BackOffContext) -> Duration {
        context.pauses += 1;
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct FixedBackOffPolicy {
    period: Duration,
}

impl FixedBackOffPolicy {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl BackOffPolicy for FixedBackOffPolicy {
    fn next_pause(&self, context: &mut BackOffContext) -> Duration {
        context.pauses += 1;
        self.period
    }
}

/// pause(n) = min(max_interval, initial_interval * multiplier^(n-1))
#[derive(Debug, Clone)]
pub struct ExponentialBackOffPolicy {
    initial_interval: Duration,
    multiplier: f64,
    max_interval: Duration,
}

impl ExponentialBackOffPolicy {
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            multiplier: multiplier.max(1.0),
            max_interval: max_interval.max(initial_interval),
        }
    }

    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }
}

impl Default for ExponentialBackOffPolicy {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKOFF_INITIAL_INTERVAL,
            DEFAULT_BACKOFF_MULTIPLIER,
            DEFAULT_BACKOFF_MAX_INTERVAL,
        )
    }
}

impl BackOffPolicy for ExponentialBackOffPolicy {
    fn start(&self) -> BackOffContext {
        BackOffContext {
            interval: self.initial_interval,
            pauses: 0,
        }
    }

    fn next_pause(&self, context: &mut BackOffContext) -> Duration {
        context.pauses += 1;
        let pause = context.interval;
        if pause >= self.max_interval {
            return self.max_interval;
        }
        context.interval = scale(pause, self.multiplier).min(self.max_interval);
        pause
    }
}

/// Exponential back-off with jitter: each pause is drawn uniformly from
/// `[p, p * multiplier)` where `p` is the exponential pause, then capped.
#[derive(Debug, Clone, Default)]
pub struct ExponentialRandomBackOffPolicy {
    inner: ExponentialBackOffPolicy,
}

impl ExponentialRandomBackOffPolicy {
    pub fn new(initial_interval: Duration, multiplier: f64, max_interval: Duration) -> Self {
        Self {
            inner: ExponentialBackOffPolicy::new(initial_interval, multiplier, max_interval),
        }
    }
}

impl BackOffPolicy for ExponentialRandomBackOffPolicy {
    fn start(&self) -> BackOffContext {
        self.inner.start()
    }

    fn next_pause(&self, context: &mut BackOffContext) -> Duration {
        let base = self.inner.next_pause(context);
        let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
        scale(base, 1.0 + jitter * (self.inner.multiplier() - 1.0)).min(self.inner.max_interval())
    }
}
