//! The claim protocol.
//!
//! `claim` is the only critical section in the system: the read-and-mark of
//! `claim_top` runs under the scope's named lock, so two executions working
//! the same scope never receive the same item. Scopes that overlap without
//! being equal take different locks; there the repository's own atomic
//! `claim_top` keeps claims disjoint. After claiming, the owning
//! execution moves each item to `Running` and then `Complete` or `Error`.
//! Items are never timed out to `Error`; an expired lease simply makes them
//! claimable again.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use adflow_core::{Artifact, ClaimLease, ClaimScope, WorkItem, WorkItemStatus};

use crate::error::QueueError;
use crate::lock::ScopeLock;
use crate::repository::WorkItemRepository;

#[derive(Clone)]
pub struct WorkQueue {
    repo: Arc<dyn WorkItemRepository>,
    locks: Arc<dyn ScopeLock>,
    lease: chrono::Duration,
}

impl WorkQueue {
    pub fn new(
        repo: Arc<dyn WorkItemRepository>,
        locks: Arc<dyn ScopeLock>,
        lease: chrono::Duration,
    ) -> Self {
        Self { repo, locks, lease }
    }

    pub fn repository(&self) -> &Arc<dyn WorkItemRepository> {
        &self.repo
    }

    pub async fn enqueue(&self, item: &WorkItem) -> Result<(), QueueError> {
        self.repo.insert(item).await?;
        debug!(
            id = %item.id,
            source = %item.source_id,
            partition = %item.partition,
            "work item enqueued"
        );
        Ok(())
    }

    /// Claim up to `n` items of `scope` for `execution_id`, lowest priority first.
    pub async fn claim(
        &self,
        scope: &ClaimScope,
        n: usize,
        execution_id: Uuid,
    ) -> Result<Vec<WorkItem>, QueueError> {
        self.claim_for(scope, n, execution_id, self.lease).await
    }

    /// [`claim`](Self::claim) with a lease of at least `hold`. Executions
    /// that may outlive the configured lease pass their runtime here, so
    /// their items are not handed to anyone else mid-run.
    pub async fn claim_for(
        &self,
        scope: &ClaimScope,
        n: usize,
        execution_id: Uuid,
        hold: chrono::Duration,
    ) -> Result<Vec<WorkItem>, QueueError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let lease = ClaimLease {
            execution_id,
            expires_at: Utc::now() + self.lease.max(hold),
        };

        let guard = self.locks.acquire(&scope.lock_key()).await?;
        let claimed = self.repo.claim_top(scope, n, &lease).await;
        drop(guard);

        let claimed = claimed?;
        info!(
            scope = %scope,
            execution_id = %execution_id,
            requested = n,
            claimed = claimed.len(),
            "work items claimed"
        );
        Ok(claimed)
    }

    pub async fn mark_running(&self, id: Uuid, execution_id: Uuid) -> Result<WorkItem, QueueError> {
        self.repo
            .update_status(id, execution_id, WorkItemStatus::Running, None)
            .await
    }

    pub async fn mark_complete(
        &self,
        id: Uuid,
        execution_id: Uuid,
        artifacts: &[Artifact],
    ) -> Result<WorkItem, QueueError> {
        let item = self.repo.complete(id, execution_id, artifacts).await?;
        info!(
            id = %id,
            run_id = %item.run_id,
            artifacts = item.artifacts.len(),
            bytes = item.total_artifact_bytes(),
            "work item complete"
        );
        Ok(item)
    }

    pub async fn mark_error(
        &self,
        id: Uuid,
        execution_id: Uuid,
        error: &str,
    ) -> Result<WorkItem, QueueError> {
        let item = self
            .repo
            .update_status(id, execution_id, WorkItemStatus::Error, Some(error))
            .await?;
        warn!(id = %id, run_id = %item.run_id, error, "work item failed");
        Ok(item)
    }

    /// Give an unfinished item back to the queue, keeping its status.
    pub async fn release(&self, id: Uuid, execution_id: Uuid) -> Result<(), QueueError> {
        self.repo.release(id, execution_id).await
    }

    pub async fn active_run_ids(&self, source_id: &str) -> Result<HashSet<String>, QueueError> {
        self.repo.active_run_ids(source_id).await
    }
}
