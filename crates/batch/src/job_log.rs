//! Append-only record of batch submissions and outcomes.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::BatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobLogStatus {
    Submitted,
    SubmitFailed,
    Succeeded,
    Failed,
    Cancelled,
    DeadlineExceeded,
}

/// One line of the job log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobLogEntry {
    pub job_id: String,
    pub run_id: Option<String>,
    pub correlation_id: String,
    pub status: JobLogStatus,
    pub parameters: serde_json::Value,
    pub error: Option<String>,
    pub logged_at: DateTime<Utc>,
}

impl JobLogEntry {
    pub fn new(
        job_id: impl Into<String>,
        correlation_id: impl Into<String>,
        status: JobLogStatus,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            run_id: None,
            correlation_id: correlation_id.into(),
            status,
            parameters,
            error: None,
            logged_at: Utc::now(),
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Sink for job log entries. Recording is best-effort and never fails the
/// job being recorded.
pub trait JobLog: Send + Sync {
    fn record(&self, entry: &JobLogEntry);

    /// Run id of the live remote run for `correlation_id`, if the log can
    /// tell. Sinks that cannot read back return `None`.
    fn live_run(&self, _correlation_id: &str) -> Option<String> {
        None
    }
}

/// The run id of the latest submission for `correlation_id`, unless a later
/// entry says that run failed or was cancelled.
///
/// Runs that hit a deadline are still live remotely. Succeeded runs also
/// count: polling them again finishes at once without a new submission.
pub fn live_run_id(entries: &[JobLogEntry], correlation_id: &str) -> Option<String> {
    let mut live: Option<String> = None;
    for entry in entries.iter().filter(|e| e.correlation_id == correlation_id) {
        match entry.status {
            JobLogStatus::Submitted => live = entry.run_id.clone().or(live),
            JobLogStatus::Failed | JobLogStatus::Cancelled => {
                if entry.run_id.is_none() || entry.run_id == live {
                    live = None;
                }
            }
            JobLogStatus::SubmitFailed
            | JobLogStatus::Succeeded
            | JobLogStatus::DeadlineExceeded => {}
        }
    }
    live
}

/// Writes one JSON object per line to a file.
pub struct JsonlJobLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlJobLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl JobLog for JsonlJobLog {
    fn record(&self, entry: &JobLogEntry) {
        if let Some(dir) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!(error = %e, "failed to create batch job log directory");
                return;
            }
        }

        let json_line = match serde_json::to_string(entry) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize batch job log entry");
                return;
            }
        };

        let _guard = self.write_lock.lock().unwrap();
        let mut file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) => {
                warn!(error = %e, path = %self.path.display(), "failed to open batch job log");
                return;
            }
        };

        if let Err(e) = writeln!(file, "{}", json_line) {
            warn!(error = %e, "failed to write batch job log entry");
        }
    }

    fn live_run(&self, correlation_id: &str) -> Option<String> {
        let _guard = self.write_lock.lock().unwrap();
        match read_entries(&self.path) {
            Ok(entries) => live_run_id(&entries, correlation_id),
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.path.display(),
                    "unreadable batch job log, submitting anew"
                );
                None
            }
        }
    }
}

/// Read every entry of a JSONL job log. A missing file reads as empty;
/// blank lines are skipped.
pub fn read_entries(path: &Path) -> Result<Vec<JobLogEntry>, BatchError> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(BatchError::JobLog(e.to_string())),
    };

    let mut entries = Vec::new();
    for (n, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| BatchError::JobLog(e.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        let entry = serde_json::from_str(&line)
            .map_err(|e| BatchError::JobLog(format!("line {}: {e}", n + 1)))?;
        entries.push(entry);
    }
    Ok(entries)
}
