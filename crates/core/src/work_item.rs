//! The persisted unit of ingestion work.
//!
//! A [`WorkItem`] is one source × entity × time partition. It is created
//! `Pending` by an upstream discovery step, claimed by exactly one execution,
//! marked `Running`, and finally `Complete` (artifacts recorded) or `Error`.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::CoreError;

// ── Status ───────────────────────────────────────────────────────────

/// Lifecycle status of a [`WorkItem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl WorkItemStatus {
    /// `Complete` never moves again; everything else may still be worked on.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    ///
    /// `Error` items are left for a later run, so `Error -> Running` is allowed.
    /// `Running -> Running` covers re-claiming an item whose lease expired.
    pub fn can_transition_to(self, next: WorkItemStatus) -> bool {
        use WorkItemStatus::*;
        match (self, next) {
            (Complete, _) => false,
            (Pending, Running) | (Pending, Error) => true,
            (Running, Running) | (Running, Complete) | (Running, Error) => true,
            (Error, Running) | (Error, Error) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "complete" => Some(Self::Complete),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Scope ────────────────────────────────────────────────────────────

/// The slice of the queue a claim operates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClaimScope {
    pub source_id: String,
    pub credential_id: Option<String>,
    pub parent_integration_id: Option<String>,
}

impl ClaimScope {
    pub fn source(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            credential_id: None,
            parent_integration_id: None,
        }
    }

    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    pub fn with_parent_integration(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_integration_id = Some(parent_id.into());
        self
    }

    /// Stable key used to pick the named lock guarding this scope.
    pub fn lock_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.source_id,
            self.credential_id.as_deref().unwrap_or("*"),
            self.parent_integration_id.as_deref().unwrap_or("*")
        )
    }

    /// Whether `item` falls inside this scope. Unset optional fields match anything.
    pub fn matches(&self, item: &WorkItem) -> bool {
        item.source_id == self.source_id
            && self
                .credential_id
                .as_ref()
                .map_or(true, |c| item.credential_id.as_ref() == Some(c))
            && self
                .parent_integration_id
                .as_ref()
                .map_or(true, |p| item.parent_integration_id.as_ref() == Some(p))
    }
}

impl fmt::Display for ClaimScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lock_key())
    }
}

// ── Artifacts ────────────────────────────────────────────────────────

/// A file produced while processing a work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub size_bytes: u64,
    pub written_at: DateTime<Utc>,
}

/// Inclusive date range a work item covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimePartition {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimePartition {
    pub fn day(date: NaiveDate) -> Self {
        Self { start: date, end: date }
    }
}

impl fmt::Display for TimePartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..{}", self.start, self.end)
        }
    }
}

// ── Claim lease ──────────────────────────────────────────────────────

/// Ownership marker written when an execution claims an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimLease {
    pub execution_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

impl ClaimLease {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

// ── WorkItem ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: Uuid,
    /// Correlates every step and persisted snapshot of one processing attempt.
    pub run_id: String,
    pub source_id: String,
    pub credential_id: Option<String>,
    pub parent_integration_id: Option<String>,
    pub partition: TimePartition,
    /// Lower values are claimed first.
    pub priority: i64,
    pub backfill: bool,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub claim: Option<ClaimLease>,
    /// Message of the failure that moved the item to `Error`.
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    /// New `Pending` item with a fresh UUID run id.
    pub fn new(source_id: impl Into<String>, partition: TimePartition, priority: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4().to_string(),
            source_id: source_id.into(),
            credential_id: None,
            parent_integration_id: None,
            partition,
            priority,
            backfill: false,
            status: WorkItemStatus::Pending,
            artifacts: Vec::new(),
            claim: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_credential(mut self, credential_id: impl Into<String>) -> Self {
        self.credential_id = Some(credential_id.into());
        self
    }

    pub fn with_parent_integration(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_integration_id = Some(parent_id.into());
        self
    }

    pub fn as_backfill(mut self) -> Self {
        self.backfill = true;
        self
    }

    /// Latest write time among produced artifacts.
    pub fn delivery_date(&self) -> Option<DateTime<Utc>> {
        self.artifacts.iter().map(|a| a.written_at).max()
    }

    pub fn total_artifact_bytes(&self) -> u64 {
        self.artifacts.iter().map(|a| a.size_bytes).sum()
    }

    /// Whether a claim taken at `now` may pick this item up.
    ///
    /// Anything not `Complete` is claimable once no live lease holds it.
    /// Running items only end up here when a previous execution ran out of
    /// time; Error items are retried by the next run.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status != WorkItemStatus::Complete
            && self.claim.as_ref().map_or(true, |c| !c.is_live(now))
    }

    /// Apply a status change, rejecting backward transitions.
    pub fn transition(&mut self, next: WorkItemStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                entity: format!("work item {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}
