//! Bounded-concurrency driver for remote batch jobs.
//!
//! Each job holds one semaphore permit from submission until it reaches a
//! terminal state. Submission and status checks are retried by two separate
//! [`DeadlineBoundedRetry`] engines sharing the caller's [`RunBudget`]; the
//! poll sleep between status checks is never taken past that budget.
//!
//! A run abandoned at the deadline keeps going remotely. The next attempt
//! for the same correlation id adopts it and only polls. The run id comes
//! from the caller, from this orchestrator's memory, or from the job log.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use adflow_resilience::{DeadlineBoundedRetry, FixedBackoff, RunBudget, StopReason};

use crate::config::BatchConfig;
use crate::error::BatchError;
use crate::job_log::{JobLog, JobLogEntry, JobLogStatus};
use crate::service::{BatchComputeService, BatchRunState, BatchRunStatus};

/// A job that reached `Succeeded`.
#[derive(Debug, Clone)]
pub struct BatchJobOutcome {
    pub job_id: String,
    pub run_id: String,
    pub correlation_id: String,
    pub state: BatchRunState,
    /// Status checks performed, including the terminal one.
    pub polls: u32,
    pub elapsed: Duration,
}

/// A remote run holding one job slot. Dropping it frees the slot and leaves
/// the remote job alone.
pub struct StartedRun<'a> {
    pub run_id: String,
    /// Adopted from an earlier submission rather than submitted now.
    pub resumed: bool,
    correlation_id: String,
    params: Value,
    _slot: SemaphorePermit<'a>,
}

pub struct RemoteBatchJobOrchestrator {
    config: BatchConfig,
    service: Arc<dyn BatchComputeService>,
    log: Arc<dyn JobLog>,
    slots: Semaphore,
    /// Runs left going at a deadline, by correlation id.
    abandoned: Mutex<HashMap<String, String>>,
}

impl RemoteBatchJobOrchestrator {
    pub fn new(
        config: BatchConfig,
        service: Arc<dyn BatchComputeService>,
        log: Arc<dyn JobLog>,
    ) -> Result<Self, BatchError> {
        config.validate()?;
        info!(
            job_id = %config.job_id,
            max_concurrent_jobs = config.max_concurrent_jobs,
            "batch orchestrator ready"
        );
        let slots = Semaphore::new(config.max_concurrent_jobs as usize);
        Ok(Self {
            config,
            service,
            log,
            slots,
            abandoned: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Free job slots right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    fn submit_retry(&self, correlation_id: &str, budget: RunBudget) -> DeadlineBoundedRetry {
        let policy = FixedBackoff::new(
            Duration::from_secs(self.config.job_request_retry_delay_seconds),
            self.config.job_request_retry_max_attempts.saturating_sub(1),
        );
        DeadlineBoundedRetry::new(correlation_id, Arc::new(policy), budget)
    }

    fn status_retry(&self, correlation_id: &str, budget: RunBudget) -> DeadlineBoundedRetry {
        let policy = FixedBackoff::new(
            Duration::from_secs(self.config.job_status_check_retry_delay_seconds),
            self.config.job_status_check_retry_max_attempts.saturating_sub(1),
        );
        DeadlineBoundedRetry::new(correlation_id, Arc::new(policy), budget)
    }

    fn entry(&self, correlation_id: &str, status: JobLogStatus, params: &Value) -> JobLogEntry {
        JobLogEntry::new(&self.config.job_id, correlation_id, status, params.clone())
    }

    fn deadline(
        &self,
        correlation_id: &str,
        params: &Value,
        run_id: Option<&str>,
        budget: &RunBudget,
    ) -> BatchError {
        let mut entry = self
            .entry(correlation_id, JobLogStatus::DeadlineExceeded, params)
            .with_error("run deadline reached");
        if let Some(run_id) = run_id {
            entry = entry.with_run_id(run_id);
        }
        self.log.record(&entry);
        if let Some(run_id) = run_id {
            self.abandoned
                .lock()
                .unwrap()
                .insert(correlation_id.to_string(), run_id.to_string());
        }
        warn!(
            correlation_id,
            run_id = ?run_id,
            elapsed_secs = budget.elapsed().as_secs(),
            "batch job abandoned at run deadline"
        );
        BatchError::DeadlineExceeded {
            run_id: run_id.map(str::to_string),
            elapsed: budget.elapsed(),
        }
    }

    /// Submit the configured job with `params` and wait for a terminal state.
    ///
    /// A live run already logged for `correlation_id` is polled instead of
    /// submitting a second one.
    pub async fn run(
        &self,
        correlation_id: &str,
        params: Value,
        budget: &RunBudget,
    ) -> Result<BatchJobOutcome, BatchError> {
        let started = self.start(correlation_id, params, budget, None).await?;
        self.wait(started, budget).await
    }

    /// Wait for `run_id`, submitted by an earlier execution, to finish.
    /// Never submits.
    pub async fn resume(
        &self,
        correlation_id: &str,
        run_id: &str,
        params: Value,
        budget: &RunBudget,
    ) -> Result<BatchJobOutcome, BatchError> {
        let started = self
            .start(correlation_id, params, budget, Some(run_id.to_string()))
            .await?;
        self.wait(started, budget).await
    }

    /// Take a job slot and obtain a remote run for `correlation_id`.
    ///
    /// A run is adopted without calling the service when one is known: the
    /// caller's `known_run_id`, else a run this orchestrator left going at a
    /// deadline, else the job log's live run for the correlation id.
    /// Otherwise the job is submitted and the submission logged.
    pub async fn start(
        &self,
        correlation_id: &str,
        params: Value,
        budget: &RunBudget,
        known_run_id: Option<String>,
    ) -> Result<StartedRun<'_>, BatchError> {
        let permit = match tokio::time::timeout(budget.remaining(), self.slots.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(BatchError::InvalidConfig("job slots are closed".into()));
            }
            Err(_elapsed) => return Err(self.deadline(correlation_id, &params, None, budget)),
        };

        let remembered = self.abandoned.lock().unwrap().remove(correlation_id);
        let adopted = known_run_id
            .or(remembered)
            .or_else(|| self.log.live_run(correlation_id));
        if let Some(run_id) = adopted {
            info!(correlation_id, run_id = %run_id, "resuming batch run instead of submitting");
            return Ok(StartedRun {
                run_id,
                resumed: true,
                correlation_id: correlation_id.to_string(),
                params,
                _slot: permit,
            });
        }

        let job_id = self.config.job_id.as_str();
        let submitted = self
            .submit_retry(correlation_id, *budget)
            .run_detailed(|_| self.service.submit(job_id, &params))
            .await;
        let run_id = match submitted {
            Ok(run_id) => run_id,
            Err(stop) if stop.reason == StopReason::Deadline => {
                return Err(self.deadline(correlation_id, &params, None, budget));
            }
            Err(stop) => {
                self.log.record(
                    &self
                        .entry(correlation_id, JobLogStatus::SubmitFailed, &params)
                        .with_error(stop.error.to_string()),
                );
                return Err(BatchError::Call(stop.error));
            }
        };
        self.log.record(
            &self
                .entry(correlation_id, JobLogStatus::Submitted, &params)
                .with_run_id(&run_id),
        );
        info!(correlation_id, job_id, run_id = %run_id, "batch job submitted");

        Ok(StartedRun {
            run_id,
            resumed: false,
            correlation_id: correlation_id.to_string(),
            params,
            _slot: permit,
        })
    }

    /// Poll a started run until it reaches a terminal state or the budget
    /// runs out. The job slot is released when this returns.
    pub async fn wait(
        &self,
        started: StartedRun<'_>,
        budget: &RunBudget,
    ) -> Result<BatchJobOutcome, BatchError> {
        let StartedRun {
            run_id,
            correlation_id,
            params,
            _slot,
            ..
        } = started;
        let correlation_id = correlation_id.as_str();

        let status_retry = self.status_retry(correlation_id, *budget);
        let mut polls: u32 = 0;
        loop {
            let checked = status_retry
                .run_detailed(|_| self.service.get_status(&run_id))
                .await;
            polls += 1;
            let status = match checked {
                Ok(status) => status,
                Err(stop) if stop.reason == StopReason::Deadline => {
                    return Err(self.deadline(correlation_id, &params, Some(&run_id), budget));
                }
                Err(stop) => {
                    self.log.record(
                        &self
                            .entry(correlation_id, JobLogStatus::Failed, &params)
                            .with_run_id(&run_id)
                            .with_error(format!("status check failed: {}", stop.error)),
                    );
                    return Err(BatchError::Call(stop.error));
                }
            };

            debug!(
                correlation_id,
                run_id = %run_id,
                state = %status.state,
                polls,
                "batch job status"
            );

            match status.state {
                BatchRunState::Succeeded => {
                    self.log.record(
                        &self
                            .entry(correlation_id, JobLogStatus::Succeeded, &params)
                            .with_run_id(&run_id),
                    );
                    info!(correlation_id, run_id = %run_id, polls, "batch job succeeded");
                    return Ok(BatchJobOutcome {
                        job_id: self.config.job_id.clone(),
                        run_id,
                        correlation_id: correlation_id.to_string(),
                        state: status.state,
                        polls,
                        elapsed: budget.elapsed(),
                    });
                }
                BatchRunState::Failed => {
                    let message = self.collect_task_errors(&status_retry, &run_id, &status).await;
                    self.log.record(
                        &self
                            .entry(correlation_id, JobLogStatus::Failed, &params)
                            .with_run_id(&run_id)
                            .with_error(&message),
                    );
                    warn!(correlation_id, run_id = %run_id, "batch job failed");
                    return Err(BatchError::JobFailed {
                        job_id: self.config.job_id.clone(),
                        run_id,
                        message,
                    });
                }
                BatchRunState::Cancelled => {
                    self.log.record(
                        &self
                            .entry(correlation_id, JobLogStatus::Cancelled, &params)
                            .with_run_id(&run_id),
                    );
                    return Err(BatchError::Cancelled { run_id });
                }
                BatchRunState::Queued | BatchRunState::Running => {}
            }

            let interval = self.config.poll_interval();
            if budget.would_exceed(interval) {
                return Err(self.deadline(correlation_id, &params, Some(&run_id), budget));
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// One line per failed sub-task, `"<task>: <error>"`.
    async fn collect_task_errors(
        &self,
        retry: &DeadlineBoundedRetry,
        run_id: &str,
        status: &BatchRunStatus,
    ) -> String {
        let mut lines = Vec::new();
        for task in status.failed_tasks() {
            let text = match retry
                .run(|_| self.service.get_task_error(run_id, task))
                .await
            {
                Ok(text) => text,
                Err(e) => format!("error output unavailable ({e})"),
            };
            lines.push(format!("{}: {}", task.task_key, text.trim()));
        }
        if lines.is_empty() {
            lines.push(
                status
                    .message
                    .clone()
                    .unwrap_or_else(|| "job failed without task details".to_string()),
            );
        }
        lines.join("\n")
    }

    /// Run one job per parameter set, all sharing this orchestrator's slots.
    /// Results keep the order of `param_sets`.
    pub async fn run_many(
        &self,
        correlation_prefix: &str,
        param_sets: Vec<Value>,
        budget: &RunBudget,
    ) -> Vec<Result<BatchJobOutcome, BatchError>> {
        let runs = param_sets.into_iter().enumerate().map(|(i, params)| {
            let correlation_id = format!("{correlation_prefix}-{i}");
            async move { self.run(&correlation_id, params, budget).await }
        });
        join_all(runs).await
    }

    /// Ask the service to stop a run.
    pub async fn cancel(&self, correlation_id: &str, run_id: &str) -> Result<(), BatchError> {
        self.service.cancel(run_id).await?;
        self.log.record(
            &self
                .entry(correlation_id, JobLogStatus::Cancelled, &Value::Null)
                .with_run_id(run_id),
        );
        info!(correlation_id, run_id, "batch run cancelled");
        Ok(())
    }
}
