// Completion policies - when is a chunk (or any bounded iteration) done

use std::time::{Duration, Instant};

/// Outcome of one tasklet invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepeatStatus {
    Continuable,
    Finished,
}

impl RepeatStatus {
    pub fn continue_if(continuable: bool) -> Self {
        if continuable {
            RepeatStatus::Continuable
        } else {
            RepeatStatus::Finished
        }
    }

    pub fn is_continuable(&self) -> bool {
        *self == RepeatStatus::Continuable
    }
}

/// Mutable state of one iteration run, created by [`CompletionPolicy::start`].
#[derive(Debug, Clone)]
pub struct RepeatContext {
    count: usize,
    started_at: Instant,
    children: Vec<RepeatContext>,
}

impl RepeatContext {
    pub fn new() -> Self {
        Self {
            count: 0,
            started_at: Instant::now(),
            children: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn increment(&mut self) {
        self.count += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn children(&self) -> &[RepeatContext] {
        &self.children
    }
}

impl Default for RepeatContext {
    fn default() -> Self {
        Self::new()
    }
}

pub trait CompletionPolicy: Send + Sync {
    fn start(&self) -> RepeatContext {
        RepeatContext::new()
    }

    fn is_complete(&self, context: &RepeatContext) -> bool;

    /// Record one finished iteration.
    fn update(&self, context: &mut RepeatContext) {
        context.increment();
    }
}

/// Complete after a fixed number of iterations (the chunk size).
#[derive(Debug, Clone)]
pub struct SimpleCompletionPolicy {
    chunk_size: usize,
}

impl SimpleCompletionPolicy {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl CompletionPolicy for SimpleCompletionPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.count() >= self.chunk_size
    }
}

/// Complete once a wall-clock budget has been used.
#[derive(Debug, Clone)]
pub struct TimeoutTerminationPolicy {
    timeout: Duration,
}

impl TimeoutTerminationPolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CompletionPolicy for TimeoutTerminationPolicy {
    fn is_complete(&self, context: &RepeatContext) -> bool {
        context.elapsed() >= self.timeout
    }
}

/// Complete as soon as any child policy is complete.
pub struct CompositeCompletionPolicy {
    policies: Vec<Box<dyn CompletionPolicy>>,
}

impl CompositeCompletionPolicy {
    pub fn new(policies: Vec<Box<dyn CompletionPolicy>>) -> Self {
        Self { policies }
    }
}

impl CompletionPolicy for CompositeCompletionPolicy {
    fn start(&self) -> RepeatContext {
        let mut context = RepeatContext::new();
        context.children = self.policies.iter().map(|p| p.start()).collect();
        context
    }

    fn is_complete(&self, context: &RepeatContext) -> bool {
        self.policies
            .iter()
            .zip(context.children.iter())
            .any(|(policy, child)| policy.is_complete(child))
    }

    fn update(&self, context: &mut RepeatContext) {
        context.increment();
        for (policy, child) in self.policies.iter().zip(context.children.iter_mut()) {
            policy.update(child);
        }
    }
}
