//! Per-execution state passed between driver stages.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use uuid::Uuid;

use adflow_resilience::{
    CallError, CallRateGovernor, CallTicket, DeadlineBoundedRetry, RateWaitExceedsDeadline,
    Retryable, RunBudget, StatusCodePolicy, StopReason,
};
use adflow_storage::{ArtifactWriter, ResumableReportStore};

use crate::definition::JobDefinition;
use crate::error::RunnerError;

/// Everything one execution of a job shares: its clock, its call budget,
/// its retry policy and where it keeps snapshots and artifacts.
pub struct RunContext {
    pub execution_id: Uuid,
    pub definition: Arc<JobDefinition>,
    pub budget: RunBudget,
    pub governor: Arc<CallRateGovernor>,
    pub retry: DeadlineBoundedRetry,
    /// Snapshot store scoped to the job's source.
    pub snapshots: ResumableReportStore,
    pub artifacts: ArtifactWriter,
    exceptions: AtomicU32,
}

impl fmt::Debug for RunContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("execution_id", &self.execution_id)
            .field("job", &self.definition.name)
            .field("elapsed", &self.budget.elapsed())
            .field("exceptions", &self.exceptions())
            .finish()
    }
}

impl RunContext {
    /// Start the run clock for `definition`.
    pub fn start(
        definition: Arc<JobDefinition>,
        snapshots: &ResumableReportStore,
        artifacts: ArtifactWriter,
    ) -> Result<Self, RunnerError> {
        let execution_id = Uuid::new_v4();
        let budget = RunBudget::start(definition.max_runtime());
        let governor = Arc::new(CallRateGovernor::new(definition.rate.clone())?);
        let retry = DeadlineBoundedRetry::new(
            format!("{}/{}", definition.name, execution_id),
            definition.backoff.build(),
            budget,
        );
        Ok(Self {
            execution_id,
            snapshots: snapshots.scoped(&definition.source_id),
            definition,
            budget,
            governor,
            retry,
            artifacts,
            exceptions: AtomicU32::new(0),
        })
    }

    pub fn status_codes(&self) -> &StatusCodePolicy {
        &self.definition.status_codes
    }

    /// Count one item that ended in `Error`; returns the new total.
    pub fn record_exception(&self) -> u32 {
        self.exceptions.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn exceptions(&self) -> u32 {
        self.exceptions.load(Ordering::SeqCst)
    }

    /// Whether `max_exceptions` has been reached.
    pub fn too_many_exceptions(&self) -> bool {
        self.definition
            .max_exceptions
            .is_some_and(|max| self.exceptions() >= max)
    }

    /// One outbound call, throttled by the run's governor and retried under
    /// the run's backoff and deadline. Every attempt passes the governor.
    ///
    /// Running out of time, either while backing off or while waiting for
    /// rate budget, comes back as [`RunnerError::DeadlineReached`].
    pub async fn call<T, F, Fut>(
        &self,
        correlation_id: &str,
        size: Option<u64>,
        mut action: F,
    ) -> Result<(T, CallTicket), RunnerError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CallError>>,
    {
        let retry = self.retry.for_correlation(correlation_id);
        let governor = &self.governor;
        let budget = &self.budget;

        let result = retry
            .run_detailed(|attempt| {
                let call = action(attempt);
                async move {
                    let ticket = governor
                        .admit_within(size, budget)
                        .await
                        .map_err(StepError::RateWait)?;
                    call.await.map(|value| (value, ticket)).map_err(StepError::Call)
                }
            })
            .await;

        match result {
            Ok(done) => Ok(done),
            Err(stop) => match stop.error {
                StepError::RateWait(_) => Err(RunnerError::DeadlineReached {
                    stage: format!("{correlation_id} (rate limit wait)"),
                }),
                StepError::Call(_) if stop.reason == StopReason::Deadline => {
                    Err(RunnerError::DeadlineReached {
                        stage: correlation_id.to_string(),
                    })
                }
                StepError::Call(e) => Err(RunnerError::Call(e)),
            },
        }
    }
}

/// Failure of one governed attempt.
#[derive(Debug)]
enum StepError {
    RateWait(RateWaitExceedsDeadline),
    Call(CallError),
}

impl Retryable for StepError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::RateWait(_) => false,
            Self::Call(e) => e.is_retryable(),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateWait(e) => e.fmt(f),
            Self::Call(e) => e.fmt(f),
        }
    }
}
