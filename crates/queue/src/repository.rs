//! Work-item persistence.
//!
//! [`WorkItemRepository`] is the storage seam; the claim protocol itself lives
//! in [`WorkQueue`](crate::WorkQueue), which serializes `claim_top` per scope.
//! Implementations must still select and stamp each claim atomically, since
//! two different scopes can match the same item.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use adflow_core::{Artifact, ClaimLease, ClaimScope, WorkItem, WorkItemStatus};

use crate::error::QueueError;

#[async_trait]
pub trait WorkItemRepository: Send + Sync {
    async fn insert(&self, item: &WorkItem) -> Result<(), QueueError>;

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, QueueError>;

    /// Stamp `lease` on up to `n` claimable items in `scope`, lowest priority
    /// value first, and return them in that order.
    async fn claim_top(
        &self,
        scope: &ClaimScope,
        n: usize,
        lease: &ClaimLease,
    ) -> Result<Vec<WorkItem>, QueueError>;

    /// Move an item owned by `execution_id` to `status`.
    async fn update_status(
        &self,
        id: Uuid,
        execution_id: Uuid,
        status: WorkItemStatus,
        error: Option<&str>,
    ) -> Result<WorkItem, QueueError>;

    /// Mark an owned item `Complete`, recording its artifacts.
    async fn complete(
        &self,
        id: Uuid,
        execution_id: Uuid,
        artifacts: &[Artifact],
    ) -> Result<WorkItem, QueueError>;

    /// Drop the claim without changing status.
    async fn release(&self, id: Uuid, execution_id: Uuid) -> Result<(), QueueError>;

    async fn delete(&self, id: Uuid) -> Result<bool, QueueError>;

    /// Run ids of every item of `source_id` that is not yet `Complete`.
    async fn active_run_ids(&self, source_id: &str) -> Result<HashSet<String>, QueueError>;
}

// ── Shared mutations ─────────────────────────────────────────────────

pub(crate) fn ensure_owner(item: &WorkItem, execution_id: Uuid) -> Result<(), QueueError> {
    match &item.claim {
        Some(lease) if lease.execution_id == execution_id => Ok(()),
        _ => Err(QueueError::NotOwner { id: item.id, execution_id }),
    }
}

pub(crate) fn apply_status(
    item: &mut WorkItem,
    execution_id: Uuid,
    status: WorkItemStatus,
    error: Option<&str>,
) -> Result<(), QueueError> {
    ensure_owner(item, execution_id)?;
    item.transition(status)?;
    if status == WorkItemStatus::Error {
        item.last_error = error.map(str::to_string);
        item.claim = None;
    }
    Ok(())
}

pub(crate) fn apply_complete(
    item: &mut WorkItem,
    execution_id: Uuid,
    artifacts: &[Artifact],
) -> Result<(), QueueError> {
    ensure_owner(item, execution_id)?;
    item.transition(WorkItemStatus::Complete)?;
    item.artifacts.extend_from_slice(artifacts);
    item.last_error = None;
    item.claim = None;
    Ok(())
}

// ── In-memory ────────────────────────────────────────────────────────

/// Process-local repository. `claim_top` is atomic over the whole map, so
/// claims whose scopes overlap never share an item.
#[derive(Debug, Default)]
pub struct InMemoryWorkItemRepository {
    items: Mutex<HashMap<Uuid, WorkItem>>,
}

impl InMemoryWorkItemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every stored item.
    pub fn all(&self) -> Vec<WorkItem> {
        let mut items: Vec<WorkItem> = self.items.lock().unwrap().values().cloned().collect();
        items.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        items
    }

    fn modify<F>(&self, id: Uuid, f: F) -> Result<WorkItem, QueueError>
    where
        F: FnOnce(&mut WorkItem) -> Result<(), QueueError>,
    {
        let mut items = self.items.lock().unwrap();
        let item = items.get_mut(&id).ok_or(QueueError::NotFound(id))?;
        let mut next = item.clone();
        f(&mut next)?;
        next.updated_at = Utc::now();
        *item = next.clone();
        Ok(next)
    }
}

#[async_trait]
impl WorkItemRepository for InMemoryWorkItemRepository {
    async fn insert(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.items.lock().unwrap().insert(item.id, item.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, QueueError> {
        Ok(self.items.lock().unwrap().get(&id).cloned())
    }

    async fn claim_top(
        &self,
        scope: &ClaimScope,
        n: usize,
        lease: &ClaimLease,
    ) -> Result<Vec<WorkItem>, QueueError> {
        let now = Utc::now();
        // Select and stamp under one hold of the map lock, so claims with
        // overlapping scopes never take the same item.
        let mut items = self.items.lock().unwrap();
        let mut matching: Vec<&WorkItem> = items
            .values()
            .filter(|item| scope.matches(item) && item.is_claimable(now))
            .collect();
        matching.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        let candidates: Vec<Uuid> = matching.into_iter().take(n).map(|item| item.id).collect();

        let mut claimed = Vec::with_capacity(candidates.len());
        for id in candidates {
            if let Some(item) = items.get_mut(&id) {
                item.claim = Some(lease.clone());
                item.updated_at = now;
                claimed.push(item.clone());
            }
        }
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: Uuid,
        execution_id: Uuid,
        status: WorkItemStatus,
        error: Option<&str>,
    ) -> Result<WorkItem, QueueError> {
        self.modify(id, |item| apply_status(item, execution_id, status, error))
    }

    async fn complete(
        &self,
        id: Uuid,
        execution_id: Uuid,
        artifacts: &[Artifact],
    ) -> Result<WorkItem, QueueError> {
        self.modify(id, |item| apply_complete(item, execution_id, artifacts))
    }

    async fn release(&self, id: Uuid, execution_id: Uuid) -> Result<(), QueueError> {
        self.modify(id, |item| {
            ensure_owner(item, execution_id)?;
            item.claim = None;
            Ok(())
        })?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, QueueError> {
        Ok(self.items.lock().unwrap().remove(&id).is_some())
    }

    async fn active_run_ids(&self, source_id: &str) -> Result<HashSet<String>, QueueError> {
        Ok(self
            .items
            .lock()
            .unwrap()
            .values()
            .filter(|item| item.source_id == source_id && item.status != WorkItemStatus::Complete)
            .map(|item| item.run_id.clone())
            .collect())
    }
}
