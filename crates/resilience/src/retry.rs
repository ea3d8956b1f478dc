//! Deadline-bounded retry engine.
//!
//! Runs an action until it succeeds, until the backoff policy's retry ceiling
//! is reached, or until the next wait would push the shared run clock past
//! its budget. The deadline check happens before every sleep, so the engine
//! never sleeps past the deadline; it is a cooperative cancellation point,
//! not a hard timeout on the action itself.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::budget::RunBudget;
use crate::error::Retryable;

#[derive(Debug, Clone)]
pub struct DeadlineBoundedRetry {
    correlation_id: String,
    policy: Arc<dyn BackoffPolicy>,
    budget: RunBudget,
}

impl DeadlineBoundedRetry {
    pub fn new(
        correlation_id: impl Into<String>,
        policy: Arc<dyn BackoffPolicy>,
        budget: RunBudget,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            policy,
            budget,
        }
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn budget(&self) -> &RunBudget {
        &self.budget
    }

    /// Same policy and clock, different correlation id.
    pub fn for_correlation(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            policy: self.policy.clone(),
            budget: self.budget,
        }
    }

    /// Execute `action` with retries. The closure receives the number of
    /// failures seen so far (0 on the first attempt).
    ///
    /// Whatever error ends the loop is returned unchanged.
    pub async fn run<T, E, F, Fut>(&self, action: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        self.run_detailed(action).await.map_err(|stop| stop.error)
    }

    /// Like [`run`](Self::run) but also reports why the loop gave up.
    pub async fn run_detailed<T, E, F, Fut>(&self, mut action: F) -> Result<T, RetryStop<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut failures: u32 = 0;

        loop {
            let err = match action(failures).await {
                Ok(value) => {
                    if failures > 0 {
                        debug!(
                            correlation_id = %self.correlation_id,
                            retries = failures,
                            "action succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(
                    correlation_id = %self.correlation_id,
                    error = %err,
                    "non-retryable failure"
                );
                return Err(RetryStop::new(err, StopReason::Fatal, failures + 1));
            }

            failures += 1;
            if failures > self.policy.max_retry() {
                warn!(
                    correlation_id = %self.correlation_id,
                    attempts = failures,
                    max_retry = self.policy.max_retry(),
                    error = %err,
                    "retries exhausted"
                );
                return Err(RetryStop::new(err, StopReason::Exhausted, failures));
            }

            let delay = self.policy.delay(failures);
            if self.budget.would_exceed(delay) {
                warn!(
                    correlation_id = %self.correlation_id,
                    elapsed_ms = self.budget.elapsed().as_millis() as u64,
                    delay_ms = delay.as_millis() as u64,
                    max_runtime_secs = self.budget.max_runtime().as_secs(),
                    error = %err,
                    "run deadline reached, not retrying"
                );
                return Err(RetryStop::new(err, StopReason::Deadline, failures));
            }

            debug!(
                correlation_id = %self.correlation_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

/// Why a retry loop stopped without a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error was classified non-retryable.
    Fatal,
    /// The policy's retry ceiling was reached.
    Exhausted,
    /// The next backoff would have crossed the run deadline.
    Deadline,
}

/// The original error together with the reason the loop gave up.
#[derive(Debug)]
pub struct RetryStop<E> {
    pub error: E,
    pub reason: StopReason,
    /// Number of times the action was invoked.
    pub attempts: u32,
}

impl<E> RetryStop<E> {
    fn new(error: E, reason: StopReason, attempts: u32) -> Self {
        Self { error, reason, attempts }
    }
}
