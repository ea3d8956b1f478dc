use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::{info, warn};

use adflow_batch::{BatchError, RemoteBatchJobOrchestrator};
use adflow_core::{Artifact, ReportProgressItem, ReportStatus, WorkItem};
use adflow_storage::StorageError;

use crate::context::RunContext;
use crate::error::RunnerError;

/// Does the work of one claimed item.
///
/// Returning `Ok` completes the item with the returned artifacts. An error
/// for which [`RunnerError::is_deadline`] holds leaves the item for the next
/// run; any other error marks it `Error`.
#[async_trait]
pub trait ItemExecutor: Send + Sync {
    async fn execute(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
    ) -> Result<Vec<Artifact>, RunnerError>;
}

// ── Batch compute ────────────────────────────────────────────────────

/// Snapshot step holding the remote run id of a work item's batch job.
const BATCH_STEP: &str = "batch_run";

/// Runs the remote batch job once per work item and records a small
/// manifest of the run as the item's artifact.
///
/// The remote run id is snapshotted right after submission. A later
/// execution of the same item polls that run instead of submitting again.
pub struct BatchComputeExecutor {
    orchestrator: Arc<RemoteBatchJobOrchestrator>,
}

impl BatchComputeExecutor {
    pub fn new(orchestrator: Arc<RemoteBatchJobOrchestrator>) -> Self {
        Self { orchestrator }
    }

    /// Job parameters: the definition's `params` table plus the item's
    /// partition. Item fields win on conflict.
    pub fn parameters(definition_params: &Value, item: &WorkItem) -> Value {
        let mut params = match definition_params {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        params.insert("source_id".into(), json!(item.source_id));
        params.insert("run_id".into(), json!(item.run_id));
        params.insert("partition_start".into(), json!(item.partition.start.to_string()));
        params.insert("partition_end".into(), json!(item.partition.end.to_string()));
        params.insert("backfill".into(), json!(item.backfill));
        Value::Object(params)
    }

    /// Remote run still pending for `item`, from its snapshot.
    async fn pending_run(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
    ) -> Result<Option<String>, RunnerError> {
        let saved: Vec<ReportProgressItem<Value>> =
            match ctx.snapshots.get_reports(&item.run_id).await {
                Ok(saved) => saved,
                Err(StorageError::CorruptSnapshot { run_id, reason }) => {
                    warn!(run_id = %run_id, reason = %reason, "ignoring unreadable batch snapshot");
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
        Ok(saved
            .into_iter()
            .find(|s| s.name == BATCH_STEP && s.status == ReportStatus::Pending)
            .and_then(|s| s.remote_id))
    }

    async fn save_step(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        remote_run_id: &str,
        status: ReportStatus,
    ) -> Result<(), RunnerError> {
        let mut step = ReportProgressItem::new(
            BATCH_STEP,
            json!({ "job_id": self.orchestrator.config().job_id }),
        );
        step.mark_submitted(remote_run_id)?;
        step.advance(status)?;
        ctx.snapshots.save_report(&item.run_id, &[step]).await?;
        Ok(())
    }
}

#[async_trait]
impl ItemExecutor for BatchComputeExecutor {
    async fn execute(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
    ) -> Result<Vec<Artifact>, RunnerError> {
        let params = Self::parameters(&ctx.definition.params, item);
        let known = self.pending_run(ctx, item).await?;
        let started = self
            .orchestrator
            .start(&item.run_id, params, &ctx.budget, known)
            .await?;
        if !started.resumed {
            // The job log still knows the run if this write is lost.
            if let Err(e) = self
                .save_step(ctx, item, &started.run_id, ReportStatus::Pending)
                .await
            {
                warn!(run_id = %item.run_id, error = %e, "could not snapshot batch run id");
            }
        }

        let outcome = match self.orchestrator.wait(started, &ctx.budget).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // A dead remote run must not be adopted by the next attempt.
                if let BatchError::JobFailed { run_id, .. } | BatchError::Cancelled { run_id } =
                    &e
                {
                    if let Err(se) = self.save_step(ctx, item, run_id, ReportStatus::Failed).await {
                        warn!(
                            run_id = %item.run_id,
                            error = %se,
                            "could not record failed batch run"
                        );
                    }
                }
                return Err(e.into());
            }
        };

        let manifest = json!({
            "job_id": outcome.job_id,
            "batch_run_id": outcome.run_id,
            "state": outcome.state,
            "polls": outcome.polls,
            "elapsed_secs": outcome.elapsed.as_secs(),
        });
        let body = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| RunnerError::Other(format!("batch manifest: {e}")))?;
        let artifact = ctx
            .artifacts
            .write_for(item, "batch_run.json", Bytes::from(body))
            .await?;

        info!(
            run_id = %item.run_id,
            batch_run_id = %outcome.run_id,
            polls = outcome.polls,
            "batch compute finished for work item"
        );
        Ok(vec![artifact])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adflow_core::TimePartition;
    use chrono::NaiveDate;

    #[test]
    fn parameters_merge_definition_and_item() {
        let day = NaiveDate::from_ymd_opt(2025, 4, 9).unwrap();
        let item = WorkItem::new("tiktok-ads", TimePartition::day(day), 0).as_backfill();
        let params = BatchComputeExecutor::parameters(
            &json!({"warehouse": "ads", "source_id": "ignored"}),
            &item,
        );

        assert_eq!(params["warehouse"], "ads");
        assert_eq!(params["source_id"], "tiktok-ads");
        assert_eq!(params["partition_start"], "2025-04-09");
        assert_eq!(params["backfill"], true);
        assert_eq!(params["run_id"], item.run_id.as_str());
    }

    #[test]
    fn non_table_params_are_ignored() {
        let day = NaiveDate::from_ymd_opt(2025, 4, 9).unwrap();
        let item = WorkItem::new("x", TimePartition::day(day), 0);
        let params = BatchComputeExecutor::parameters(&Value::Null, &item);
        assert_eq!(params.as_object().unwrap().len(), 5);
    }
}
