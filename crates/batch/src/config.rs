use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use adflow_core::config::{
    active_profile, profiled_env_bool, profiled_env_opt, profiled_env_or, profiled_env_u32,
    profiled_env_u64,
};

use crate::error::BatchError;

// ── BatchConfig ──────────────────────────────────────────────────

/// Configuration for the remote batch-compute integration.
///
/// Reads from environment variables with optional profile prefix.
/// When `ADFLOW_PROFILE=PROD`, checks `PROD_BATCH_JOB_ID` before `BATCH_JOB_ID`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    pub enabled: bool,
    /// Workspace URL of the compute service, e.g. `https://dbc-123.cloud.example.com`.
    pub base_url: String,
    /// Bearer token. Token acquisition is handled outside this crate.
    #[serde(skip_serializing)]
    pub token: Option<String>,
    /// Identifier of the job definition to run.
    pub job_id: String,
    /// Jobs allowed between submission and terminal status at once.
    pub max_concurrent_jobs: u32,
    /// Total submission attempts, including the first.
    pub job_request_retry_max_attempts: u32,
    pub job_request_retry_delay_seconds: u64,
    /// Total attempts per status check, including the first.
    pub job_status_check_retry_max_attempts: u32,
    pub job_status_check_retry_delay_seconds: u64,
    /// Sleep between status checks.
    pub poll_interval_seconds: u64,
    /// JSONL file receiving one line per submission and terminal status.
    pub job_log_path: PathBuf,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: String::new(),
            token: None,
            job_id: String::new(),
            max_concurrent_jobs: 4,
            job_request_retry_max_attempts: 3,
            job_request_retry_delay_seconds: 10,
            job_status_check_retry_max_attempts: 5,
            job_status_check_retry_delay_seconds: 5,
            poll_interval_seconds: 30,
            job_log_path: PathBuf::from("data/batch/jobs.jsonl"),
        }
    }
}

impl BatchConfig {
    pub fn from_env() -> Self {
        Self::from_env_profiled(&active_profile())
    }

    pub fn from_env_profiled(profile: &str) -> Self {
        let d = Self::default();
        Self {
            enabled: profiled_env_bool(profile, "BATCH_ENABLED", d.enabled),
            base_url: profiled_env_or(profile, "BATCH_BASE_URL", ""),
            token: profiled_env_opt(profile, "BATCH_TOKEN"),
            job_id: profiled_env_or(profile, "BATCH_JOB_ID", ""),
            max_concurrent_jobs: profiled_env_u32(
                profile,
                "BATCH_MAX_CONCURRENT_JOBS",
                d.max_concurrent_jobs,
            ),
            job_request_retry_max_attempts: profiled_env_u32(
                profile,
                "BATCH_JOB_REQUEST_RETRY_MAX_ATTEMPTS",
                d.job_request_retry_max_attempts,
            ),
            job_request_retry_delay_seconds: profiled_env_u64(
                profile,
                "BATCH_JOB_REQUEST_RETRY_DELAY_SECONDS",
                d.job_request_retry_delay_seconds,
            ),
            job_status_check_retry_max_attempts: profiled_env_u32(
                profile,
                "BATCH_JOB_STATUS_CHECK_RETRY_MAX_ATTEMPTS",
                d.job_status_check_retry_max_attempts,
            ),
            job_status_check_retry_delay_seconds: profiled_env_u64(
                profile,
                "BATCH_JOB_STATUS_CHECK_RETRY_DELAY_SECONDS",
                d.job_status_check_retry_delay_seconds,
            ),
            poll_interval_seconds: profiled_env_u64(
                profile,
                "BATCH_POLL_INTERVAL_SECONDS",
                d.poll_interval_seconds,
            ),
            job_log_path: PathBuf::from(profiled_env_or(
                profile,
                "BATCH_JOB_LOG_PATH",
                "data/batch/jobs.jsonl",
            )),
        }
    }

    /// Reject settings the orchestrator cannot run with.
    pub fn validate(&self) -> Result<(), BatchError> {
        if self.job_id.trim().is_empty() {
            return Err(BatchError::InvalidConfig("job_id must not be blank".into()));
        }
        let positive = [
            ("max_concurrent_jobs", self.max_concurrent_jobs as u64),
            ("job_request_retry_max_attempts", self.job_request_retry_max_attempts as u64),
            ("job_request_retry_delay_seconds", self.job_request_retry_delay_seconds),
            (
                "job_status_check_retry_max_attempts",
                self.job_status_check_retry_max_attempts as u64,
            ),
            ("job_status_check_retry_delay_seconds", self.job_status_check_retry_delay_seconds),
            ("poll_interval_seconds", self.poll_interval_seconds),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BatchError::InvalidConfig(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    /// Enabled and pointing at a real service.
    pub fn is_configured(&self) -> bool {
        self.enabled && !self.base_url.is_empty() && !self.job_id.is_empty()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn with_job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = job_id.into();
        self
    }
}

// ── Tests ────────────────────────────────────────────────────────
