use thiserror::Error;

use adflow_batch::BatchError;
use adflow_core::CoreError;
use adflow_queue::QueueError;
use adflow_resilience::CallError;
use adflow_storage::StorageError;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("invalid job definition: {0}")]
    InvalidDefinition(String),

    #[error("no executor registered for job kind '{0}'")]
    UnknownKind(String),

    #[error("failed to read jobs file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse jobs file: {0}")]
    Toml(#[from] toml::de::Error),

    /// The run clock ran out before this piece of work finished. The work
    /// item is released, not failed.
    #[error("run deadline reached during {stage}")]
    DeadlineReached { stage: String },

    /// The remote system reported a report as failed.
    #[error("report {report} failed remotely")]
    ReportFailed { report: String },

    #[error("{failure_count} report(s) failed; first: {first}")]
    Parallel {
        #[source]
        first: Box<RunnerError>,
        failure_count: usize,
    },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error("{0}")]
    Other(String),
}

impl RunnerError {
    /// True when the failure only means "out of time": the item should be
    /// left for the next run instead of being marked `Error`.
    pub fn is_deadline(&self) -> bool {
        match self {
            Self::DeadlineReached { .. } => true,
            Self::Batch(BatchError::DeadlineExceeded { .. }) => true,
            Self::Parallel { first, .. } => first.is_deadline(),
            _ => false,
        }
    }
}
