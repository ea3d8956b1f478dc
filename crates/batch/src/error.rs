use std::time::Duration;

use thiserror::Error;

use adflow_resilience::CallError;

/// Errors from batch-job orchestration.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("invalid batch configuration: {0}")]
    InvalidConfig(String),

    /// A call to the compute service failed after retries.
    #[error(transparent)]
    Call(#[from] CallError),

    /// The remote job reached a failed terminal state. `message` holds one
    /// line per failed sub-task.
    #[error("batch job {job_id} run {run_id} failed:\n{message}")]
    JobFailed {
        job_id: String,
        run_id: String,
        message: String,
    },

    #[error("batch run {run_id} was cancelled")]
    Cancelled { run_id: String },

    /// The run deadline passed before the job finished. The remote job is
    /// left running.
    #[error("run deadline reached after {elapsed:?} waiting for batch run {run_id:?}")]
    DeadlineExceeded {
        run_id: Option<String>,
        elapsed: Duration,
    },

    #[error("job log error: {0}")]
    JobLog(String),
}
