//! PostgreSQL-backed work-item repository.
//!
//! Claims run in one transaction that first takes
//! `pg_advisory_xact_lock(hashtext(scope_key))`, then selects candidates with
//! `FOR UPDATE SKIP LOCKED` and stamps the lease. The advisory lock is
//! released automatically at commit or rollback.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, info};
use uuid::Uuid;

use adflow_core::config::PostgresConfig;
use adflow_core::{Artifact, ClaimLease, ClaimScope, TimePartition, WorkItem, WorkItemStatus};

use crate::error::QueueError;
use crate::repository::{apply_complete, apply_status, ensure_owner, WorkItemRepository};

const COLUMNS: &str = "id, run_id, source_id, credential_id, parent_integration_id,
    partition_start, partition_end, priority, backfill, status, artifacts,
    claimed_by, claim_expires_at, last_error, created_at, updated_at";

#[derive(Debug, sqlx::FromRow)]
struct WorkItemRow {
    id: Uuid,
    run_id: String,
    source_id: String,
    credential_id: Option<String>,
    parent_integration_id: Option<String>,
    partition_start: NaiveDate,
    partition_end: NaiveDate,
    priority: i64,
    backfill: bool,
    status: String,
    artifacts: Json<Vec<Artifact>>,
    claimed_by: Option<Uuid>,
    claim_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<WorkItemRow> for WorkItem {
    type Error = QueueError;

    fn try_from(row: WorkItemRow) -> Result<Self, Self::Error> {
        let status = WorkItemStatus::parse(&row.status).ok_or_else(|| QueueError::CorruptRow {
            id: row.id,
            reason: format!("unknown status '{}'", row.status),
        })?;
        let claim = match (row.claimed_by, row.claim_expires_at) {
            (Some(execution_id), Some(expires_at)) => Some(ClaimLease { execution_id, expires_at }),
            _ => None,
        };
        Ok(WorkItem {
            id: row.id,
            run_id: row.run_id,
            source_id: row.source_id,
            credential_id: row.credential_id,
            parent_integration_id: row.parent_integration_id,
            partition: TimePartition {
                start: row.partition_start,
                end: row.partition_end,
            },
            priority: row.priority,
            backfill: row.backfill,
            status,
            artifacts: row.artifacts.0,
            claim,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_items(rows: Vec<WorkItemRow>) -> Result<Vec<WorkItem>, QueueError> {
    rows.into_iter().map(WorkItem::try_from).collect()
}

#[derive(Debug, Clone)]
pub struct PgWorkItemRepository {
    pool: PgPool,
}

impl PgWorkItemRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect using the profiled Postgres config and apply migrations.
    pub async fn connect(config: &PostgresConfig) -> Result<Self, QueueError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.connection_string())
            .await?;
        info!("PostgreSQL connected: {}", config.host);
        let repo = Self::new(pool);
        repo.migrate().await?;
        Ok(repo)
    }

    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Database migrations applied successfully");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock one row, apply `f`, write the mutable columns back.
    async fn modify<F>(&self, id: Uuid, f: F) -> Result<WorkItem, QueueError>
    where
        F: FnOnce(&mut WorkItem) -> Result<(), QueueError> + Send,
    {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {COLUMNS} FROM work_items WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(QueueError::NotFound(id))?;

        let mut item = WorkItem::try_from(row)?;
        f(&mut item)?;
        item.updated_at = Utc::now();

        sqlx::query(
            "UPDATE work_items
             SET status = $2, artifacts = $3, claimed_by = $4, claim_expires_at = $5,
                 last_error = $6, updated_at = $7
             WHERE id = $1",
        )
        .bind(item.id)
        .bind(item.status.as_str())
        .bind(Json(&item.artifacts))
        .bind(item.claim.as_ref().map(|c| c.execution_id))
        .bind(item.claim.as_ref().map(|c| c.expires_at))
        .bind(&item.last_error)
        .bind(item.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(item)
    }
}

#[async_trait]
impl WorkItemRepository for PgWorkItemRepository {
    async fn insert(&self, item: &WorkItem) -> Result<(), QueueError> {
        sqlx::query(
            "INSERT INTO work_items (id, run_id, source_id, credential_id, parent_integration_id,
                                     partition_start, partition_end, priority, backfill, status,
                                     artifacts, claimed_by, claim_expires_at, last_error,
                                     created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)",
        )
        .bind(item.id)
        .bind(&item.run_id)
        .bind(&item.source_id)
        .bind(&item.credential_id)
        .bind(&item.parent_integration_id)
        .bind(item.partition.start)
        .bind(item.partition.end)
        .bind(item.priority)
        .bind(item.backfill)
        .bind(item.status.as_str())
        .bind(Json(&item.artifacts))
        .bind(item.claim.as_ref().map(|c| c.execution_id))
        .bind(item.claim.as_ref().map(|c| c.expires_at))
        .bind(&item.last_error)
        .bind(item.created_at)
        .bind(item.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<WorkItem>, QueueError> {
        let row = sqlx::query_as::<_, WorkItemRow>(&format!(
            "SELECT {COLUMNS} FROM work_items WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WorkItem::try_from).transpose()
    }

    async fn claim_top(
        &self,
        scope: &ClaimScope,
        n: usize,
        lease: &ClaimLease,
    ) -> Result<Vec<WorkItem>, QueueError> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(scope.lock_key())
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query_as::<_, WorkItemRow>(&format!(
            "UPDATE work_items
             SET claimed_by = $1, claim_expires_at = $2, updated_at = NOW()
             WHERE id IN (
                 SELECT id FROM work_items
                 WHERE source_id = $3
                   AND ($4::text IS NULL OR credential_id = $4)
                   AND ($5::text IS NULL OR parent_integration_id = $5)
                   AND status <> 'complete'
                   AND (claim_expires_at IS NULL OR claim_expires_at <= NOW())
                 ORDER BY priority ASC, created_at ASC
                 LIMIT $6
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {COLUMNS}"
        ))
        .bind(lease.execution_id)
        .bind(lease.expires_at)
        .bind(&scope.source_id)
        .bind(&scope.credential_id)
        .bind(&scope.parent_integration_id)
        .bind(n as i64)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let mut items = into_items(rows)?;
        items.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
        debug!(scope = %scope, claimed = items.len(), "claimed work items");
        Ok(items)
    }

    async fn update_status(
        &self,
        id: Uuid,
        execution_id: Uuid,
        status: WorkItemStatus,
        error: Option<&str>,
    ) -> Result<WorkItem, QueueError> {
        let error = error.map(str::to_string);
        self.modify(id, move |item| {
            apply_status(item, execution_id, status, error.as_deref())
        })
        .await
    }

    async fn complete(
        &self,
        id: Uuid,
        execution_id: Uuid,
        artifacts: &[Artifact],
    ) -> Result<WorkItem, QueueError> {
        let artifacts = artifacts.to_vec();
        self.modify(id, move |item| apply_complete(item, execution_id, &artifacts))
            .await
    }

    async fn release(&self, id: Uuid, execution_id: Uuid) -> Result<(), QueueError> {
        self.modify(id, move |item| {
            ensure_owner(item, execution_id)?;
            item.claim = None;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, QueueError> {
        let result = sqlx::query("DELETE FROM work_items WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_run_ids(&self, source_id: &str) -> Result<HashSet<String>, QueueError> {
        let ids = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT run_id FROM work_items WHERE source_id = $1 AND status <> 'complete'",
        )
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().collect())
    }
}
