//! Per-sub-report progress inside one work item.
//!
//! A work item usually fans out into several remote reports, each going
//! through submit → poll → download. The collection of [`ReportProgressItem`]s
//! for a run is what gets snapshotted so a restarted process resumes from the
//! last persisted step.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Status of one remote report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    /// Planned locally, not yet submitted.
    Created,
    /// Submitted; the remote system is still producing it.
    Pending,
    /// Remote system reports it ready.
    ReadyForDownload,
    /// Body written to the blob store.
    Downloaded,
    /// Remote system gave up on it.
    Failed,
}

impl ReportStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Created => 0,
            Self::Pending => 1,
            Self::ReadyForDownload => 2,
            Self::Downloaded | Self::Failed => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Downloaded | Self::Failed)
    }

    /// Forward-only: a status may advance or stay put, never go back.
    pub fn can_transition_to(self, next: ReportStatus) -> bool {
        if self.is_terminal() {
            return self == next;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::ReadyForDownload => "ready_for_download",
            Self::Downloaded => "downloaded",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Progress of one sub-report, generic over a small source-specific payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportProgressItem<P> {
    /// Local name, unique within the work item (e.g. "campaign_daily").
    pub name: String,
    /// Identifier handed back by the remote system on submit.
    pub remote_id: Option<String>,
    pub status: ReportStatus,
    /// Where the downloaded body was written.
    pub artifact_path: Option<String>,
    pub payload: P,
}

impl<P> ReportProgressItem<P> {
    pub fn new(name: impl Into<String>, payload: P) -> Self {
        Self {
            name: name.into(),
            remote_id: None,
            status: ReportStatus::Created,
            artifact_path: None,
            payload,
        }
    }

    pub fn advance(&mut self, next: ReportStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: format!("report {}", self.name),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_submitted(&mut self, remote_id: impl Into<String>) -> Result<(), CoreError> {
        self.advance(ReportStatus::Pending)?;
        self.remote_id = Some(remote_id.into());
        Ok(())
    }

    pub fn mark_downloaded(&mut self, artifact_path: impl Into<String>) -> Result<(), CoreError> {
        self.advance(ReportStatus::Downloaded)?;
        self.artifact_path = Some(artifact_path.into());
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.status == ReportStatus::Downloaded
    }
}
