//! The remote batch-compute collaborator.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use adflow_resilience::CallError;

/// Lifecycle state of a run (or of one of its sub-tasks).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchRunState {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl BatchRunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for BatchRunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchTask {
    /// Name of the task inside the job definition.
    pub task_key: String,
    /// Identifier used to fetch this task's output.
    pub task_run_id: String,
    pub state: BatchRunState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRunStatus {
    pub state: BatchRunState,
    #[serde(default)]
    pub tasks: Vec<BatchTask>,
    /// Service-provided explanation, if any.
    pub message: Option<String>,
}

impl BatchRunStatus {
    pub fn failed_tasks(&self) -> impl Iterator<Item = &BatchTask> {
        self.tasks.iter().filter(|t| t.state == BatchRunState::Failed)
    }
}

/// Submit, observe and cancel jobs on an external compute service.
///
/// Every method is a single outbound call; retries, deadlines and concurrency
/// limits are applied by the orchestrator.
#[async_trait]
pub trait BatchComputeService: Send + Sync {
    /// Start `job_id` with `params`; returns the remote run id.
    async fn submit(&self, job_id: &str, params: &serde_json::Value) -> Result<String, CallError>;

    async fn get_status(&self, run_id: &str) -> Result<BatchRunStatus, CallError>;

    /// Error text of one failed sub-task of `run_id`.
    async fn get_task_error(&self, run_id: &str, task: &BatchTask) -> Result<String, CallError>;

    async fn cancel(&self, run_id: &str) -> Result<(), CallError>;
}
