/*
 * Bounded task execution.
 *
 * `WorkerPool` is a fixed-size pool of permits shared by every traversal
 * submitted to it. `BoundedTasks` maps an operation over a set of items
 * with bounded parallelism, optional per-item retry, and one of two
 * failure policies:
 * - StopOnFailure: no new item starts after the first failure, in-flight
 *   items drain, then the first error is returned.
 * - SuppressFailures: every item runs, failures are logged and collected.
 *
 * Nothing is spawned detached: every item has finished (or was skipped)
 * when `run` returns, on every exit path.
 */

use crate::{CommitError, Result, RetryBuilder, RetryConfig};
use futures::stream::{self, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

/// A fixed-size pool of concurrent workers.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: Arc<str>,
    size: usize,
    permits: Arc<Semaphore>,
}

impl WorkerPool {
    /// Creates a pool with `size` workers (at least one).
    pub fn new(name: impl Into<String>, size: usize) -> Self {
        let size = size.max(1);
        let name: String = name.into();
        debug!("Created worker pool {} with {} workers", name, size);
        Self {
            name: Arc::from(name),
            size,
            permits: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| CommitError::Unexpected(format!("pool {} closed: {}", self.name, e)))
    }
}

/// What a traversal does when an item fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    StopOnFailure,
    SuppressFailures,
}

/// A failed item of a suppressed traversal.
#[derive(Debug)]
pub struct TaskFailure {
    pub item: String,
    pub error: CommitError,
}

/// Results of a traversal. Order is unspecified.
#[derive(Debug)]
pub struct TaskOutcome<R> {
    pub results: Vec<R>,
    pub failures: Vec<TaskFailure>,
    /// Items never started because an earlier item failed
    pub skipped: usize,
}

impl<R> Default for TaskOutcome<R> {
    fn default() -> Self {
        Self {
            results: Vec::new(),
            failures: Vec::new(),
            skipped: 0,
        }
    }
}

impl<R> TaskOutcome<R> {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.skipped == 0
    }
}

/// Bounded-parallel map with a failure policy.
#[derive(Debug, Clone)]
pub struct BoundedTasks {
    name: String,
    pool: Option<WorkerPool>,
    policy: FailurePolicy,
    retry: RetryConfig,
}

impl BoundedTasks {
    /// Starts a traversal named `name` (used in logs). Defaults to
    /// sequential execution, stop-on-failure and no retries.
    pub fn foreach(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pool: None,
            policy: FailurePolicy::StopOnFailure,
            retry: RetryConfig::no_retry(),
        }
    }

    /// Runs items on the given pool.
    pub fn execute_with(mut self, pool: &WorkerPool) -> Self {
        self.pool = Some(pool.clone());
        self
    }

    pub fn policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn stop_on_failure(self) -> Self {
        self.policy(FailurePolicy::StopOnFailure)
    }

    pub fn suppress_failures(self) -> Self {
        self.policy(FailurePolicy::SuppressFailures)
    }

    /// Retries each item on retryable errors.
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn parallelism(&self) -> usize {
        self.pool.as_ref().map(WorkerPool::size).unwrap_or(1)
    }

    /// Runs `operation` over every item.
    pub async fn run<I, F, Fut, R>(&self, items: I, operation: F) -> Result<TaskOutcome<R>>
    where
        I: IntoIterator,
        I::Item: Clone + fmt::Display,
        F: Fn(I::Item) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let stopped = AtomicBool::new(false);
        let stopped = &stopped;
        let operation = &operation;
        let this = self;

        let mut completions = stream::iter(items)
            .map(move |item| async move {
                if stopped.load(Ordering::SeqCst) {
                    return None;
                }
                let label = item.to_string();
                let _permit = match &this.pool {
                    Some(pool) => match pool.acquire().await {
                        Ok(permit) => Some(permit),
                        Err(e) => return Some((label, Err(e))),
                    },
                    None => None,
                };
                if stopped.load(Ordering::SeqCst) {
                    return None;
                }

                let result = RetryBuilder::new(&this.retry)
                    .operation(format!("{} [{}]", this.name, label))
                    .run(|| operation(item.clone()))
                    .await;

                if result.is_err() && this.policy == FailurePolicy::StopOnFailure {
                    stopped.store(true, Ordering::SeqCst);
                }
                Some((label, result))
            })
            .buffer_unordered(self.parallelism());

        let mut outcome = TaskOutcome::default();
        let mut first_error = None;

        while let Some(completion) = completions.next().await {
            match completion {
                None => outcome.skipped += 1,
                Some((_, Ok(value))) => outcome.results.push(value),
                Some((label, Err(e))) => match self.policy {
                    FailurePolicy::StopOnFailure => {
                        warn!("{}: failed for {}, stopping: {}", self.name, label, e);
                        if first_error.is_none() {
                            first_error = Some(e);
                        }
                    }
                    FailurePolicy::SuppressFailures => {
                        warn!("{}: failed for {}: {}", self.name, label, e);
                        outcome.failures.push(TaskFailure { item: label, error: e });
                    }
                },
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }
}
