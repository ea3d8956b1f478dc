//! Job definitions loaded from TOML.
//!
//! ```toml
//! [[jobs]]
//! name = "meta-ads-daily"
//! kind = "batch"
//! source_id = "meta-ads"
//! cron = "0 3 * * *"
//! max_runtime_secs = 3600
//!
//! [jobs.backoff]
//! kind = "exponential"
//! seed_ms = 1000
//! max_retry = 3
//!
//! [jobs.rate]
//! max_calls_per_window = 100
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use adflow_core::ClaimScope;
use adflow_resilience::{BackoffSettings, RateBudget, StatusCodePolicy};

use crate::error::RunnerError;
use crate::scheduler::parse_cron;

/// One scheduled ingestion job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDefinition {
    /// Unique name, also used as correlation prefix in logs.
    pub name: String,
    /// Registry key selecting the executor.
    pub kind: String,
    pub source_id: String,
    #[serde(default)]
    pub credential_id: Option<String>,
    #[serde(default)]
    pub parent_integration_id: Option<String>,
    /// 5- or 6-field cron expression. Jobs without one only run on demand.
    #[serde(default)]
    pub cron: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Work items claimed per run.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Work items processed at once.
    #[serde(default = "default_one")]
    pub max_parallel_items: usize,
    /// Sub-reports of one work item processed at once.
    #[serde(default = "default_one")]
    pub max_degree_of_parallelism: usize,
    pub max_runtime_secs: u64,
    #[serde(default = "default_report_poll_secs")]
    pub report_poll_interval_secs: u64,

    /// Re-runs of a failed execution, separate from in-call retries.
    #[serde(default)]
    pub auto_retry_count: u32,
    #[serde(default = "default_defer_secs")]
    pub defer_interval_secs: u64,
    /// Stop claiming new work once this many items failed in one run.
    #[serde(default)]
    pub max_exceptions: Option<u32>,

    #[serde(default)]
    pub backoff: BackoffSettings,
    #[serde(default)]
    pub rate: RateBudget,
    #[serde(default)]
    pub status_codes: StatusCodePolicy,

    /// Free-form settings handed to the executor.
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_one() -> usize {
    1
}

fn default_report_poll_secs() -> u64 {
    30
}

fn default_defer_secs() -> u64 {
    300
}

impl JobDefinition {
    /// Minimal definition with defaults for everything optional.
    pub fn new(
        name: impl Into<String>,
        kind: impl Into<String>,
        source_id: impl Into<String>,
        max_runtime: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            source_id: source_id.into(),
            credential_id: None,
            parent_integration_id: None,
            cron: None,
            enabled: true,
            batch_size: default_batch_size(),
            max_parallel_items: default_one(),
            max_degree_of_parallelism: default_one(),
            max_runtime_secs: max_runtime.as_secs(),
            report_poll_interval_secs: default_report_poll_secs(),
            auto_retry_count: 0,
            defer_interval_secs: default_defer_secs(),
            max_exceptions: None,
            backoff: BackoffSettings::default(),
            rate: RateBudget::default(),
            status_codes: StatusCodePolicy::default(),
            params: serde_json::Value::Null,
        }
    }

    pub fn scope(&self) -> ClaimScope {
        let mut scope = ClaimScope::source(&self.source_id);
        if let Some(cred) = &self.credential_id {
            scope = scope.with_credential(cred);
        }
        if let Some(parent) = &self.parent_integration_id {
            scope = scope.with_parent_integration(parent);
        }
        scope
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    pub fn report_poll_interval(&self) -> Duration {
        Duration::from_secs(self.report_poll_interval_secs)
    }

    pub fn defer_interval(&self) -> Duration {
        Duration::from_secs(self.defer_interval_secs)
    }

    pub fn validate(&self) -> Result<(), RunnerError> {
        let invalid =
            |msg: String| Err(RunnerError::InvalidDefinition(format!("{}: {msg}", self.name)));

        if self.name.trim().is_empty() {
            return Err(RunnerError::InvalidDefinition("job name must not be blank".into()));
        }
        if self.kind.trim().is_empty() {
            return invalid("kind must not be blank".into());
        }
        if self.source_id.trim().is_empty() {
            return invalid("source_id must not be blank".into());
        }
        for (field, value) in [
            ("batch_size", self.batch_size as u64),
            ("max_parallel_items", self.max_parallel_items as u64),
            ("max_degree_of_parallelism", self.max_degree_of_parallelism as u64),
            ("max_runtime_secs", self.max_runtime_secs),
            ("report_poll_interval_secs", self.report_poll_interval_secs),
        ] {
            if value == 0 {
                return invalid(format!("{field} must be positive"));
            }
        }
        if self.max_exceptions == Some(0) {
            return invalid("max_exceptions must be positive when set".into());
        }
        if let Err(e) = self.rate.validate() {
            return invalid(e.to_string());
        }
        if let Some(expr) = &self.cron {
            if let Err(e) = parse_cron(expr) {
                return invalid(format!("invalid cron '{expr}': {e}"));
            }
        }
        Ok(())
    }
}

/// Contents of the jobs file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobsFile {
    #[serde(default)]
    pub jobs: Vec<JobDefinition>,
}

impl JobsFile {
    pub fn load(path: &Path) -> Result<Self, RunnerError> {
        let text = std::fs::read_to_string(path)?;
        let file = Self::parse(&text)?;
        info!(path = %path.display(), jobs = file.jobs.len(), "job definitions loaded");
        Ok(file)
    }

    /// Parse and validate every definition; names must be unique.
    pub fn parse(text: &str) -> Result<Self, RunnerError> {
        let file: JobsFile = toml::from_str(text)?;
        let mut names = HashSet::new();
        for job in &file.jobs {
            job.validate()?;
            if !names.insert(job.name.as_str()) {
                return Err(RunnerError::InvalidDefinition(format!(
                    "duplicate job name '{}'",
                    job.name
                )));
            }
        }
        Ok(file)
    }

    pub fn get(&self, name: &str) -> Option<&JobDefinition> {
        self.jobs.iter().find(|j| j.name == name)
    }
}
