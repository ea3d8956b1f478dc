//! One execution of a job definition.
//!
//! The driver claims up to `batch_size` items for the definition's scope,
//! runs them through the executor `max_parallel_items` at a time, moves each
//! to `Complete` or `Error`, and finally garbage-collects snapshots whose
//! work item is no longer active. Items that run out of time are released
//! untouched so the next run picks them up.
//!
//! Claims are leased for at least the job's runtime plus [`LEASE_SLACK_SECS`],
//! so a long job never loses its items to another execution while working.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use adflow_core::WorkItem;
use adflow_queue::WorkQueue;
use adflow_storage::{ArtifactWriter, ResumableReportStore};

use crate::context::RunContext;
use crate::definition::JobDefinition;
use crate::error::RunnerError;
use crate::executor::ItemExecutor;

/// Added to a job's runtime when leasing its items; covers the release and
/// completion writes that follow the deadline.
pub const LEASE_SLACK_SECS: u64 = 300;

fn claim_hold(definition: &JobDefinition) -> chrono::Duration {
    let secs = definition.max_runtime_secs.saturating_add(LEASE_SLACK_SECS);
    chrono::Duration::seconds(secs.min(i32::MAX as u64) as i64)
}

/// What happened in one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub job: String,
    pub execution_id: Uuid,
    pub claimed: usize,
    pub completed: usize,
    pub failed: usize,
    /// Released for a later run (deadline or exception ceiling).
    pub deferred: usize,
    pub exceptions: u32,
    pub deadline_reached: bool,
    /// Run ids whose stale snapshots were removed.
    pub snapshots_removed: Vec<String>,
    pub elapsed: Duration,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Completed,
    Failed,
    Deferred { deadline: bool },
}

pub struct JobDriver {
    queue: WorkQueue,
    snapshots: ResumableReportStore,
    artifacts: ArtifactWriter,
}

impl JobDriver {
    pub fn new(
        queue: WorkQueue,
        snapshots: ResumableReportStore,
        artifacts: ArtifactWriter,
    ) -> Self {
        Self {
            queue,
            snapshots,
            artifacts,
        }
    }

    pub fn queue(&self) -> &WorkQueue {
        &self.queue
    }

    /// Snapshot store as seen by runs of `definition`.
    pub fn snapshots_for(&self, definition: &JobDefinition) -> ResumableReportStore {
        self.snapshots.scoped(&definition.source_id)
    }

    pub async fn run(
        &self,
        definition: Arc<JobDefinition>,
        executor: &dyn ItemExecutor,
    ) -> Result<RunSummary, RunnerError> {
        let ctx = RunContext::start(definition.clone(), &self.snapshots, self.artifacts.clone())?;
        info!(
            job = %definition.name,
            execution_id = %ctx.execution_id,
            max_runtime_secs = definition.max_runtime_secs,
            "job run started"
        );

        let items = self
            .queue
            .claim_for(
                &definition.scope(),
                definition.batch_size,
                ctx.execution_id,
                claim_hold(&definition),
            )
            .await?;

        let mut pending = Vec::with_capacity(items.len());
        for item in items.iter() {
            pending.push(self.process(&ctx, executor, item));
        }
        let outcomes: Vec<ItemOutcome> = stream::iter(pending)
            .buffer_unordered(definition.max_parallel_items)
            .collect()
            .await;

        let mut summary = RunSummary {
            job: definition.name.clone(),
            execution_id: ctx.execution_id,
            claimed: items.len(),
            completed: 0,
            failed: 0,
            deferred: 0,
            exceptions: ctx.exceptions(),
            deadline_reached: ctx.budget.is_exhausted(),
            snapshots_removed: Vec::new(),
            elapsed: Duration::ZERO,
        };
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Completed => summary.completed += 1,
                ItemOutcome::Failed => summary.failed += 1,
                ItemOutcome::Deferred { deadline } => {
                    summary.deferred += 1;
                    summary.deadline_reached |= deadline;
                }
            }
        }

        summary.snapshots_removed = self.collect_garbage(&ctx).await;
        summary.elapsed = ctx.budget.elapsed();

        info!(
            job = %summary.job,
            execution_id = %summary.execution_id,
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            deferred = summary.deferred,
            deadline_reached = summary.deadline_reached,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "job run finished"
        );
        Ok(summary)
    }

    async fn process(
        &self,
        ctx: &RunContext,
        executor: &dyn ItemExecutor,
        item: &WorkItem,
    ) -> ItemOutcome {
        let exec = ctx.execution_id;

        if ctx.budget.is_exhausted() || ctx.too_many_exceptions() {
            self.release(ctx, item).await;
            return ItemOutcome::Deferred {
                deadline: ctx.budget.is_exhausted(),
            };
        }

        if let Err(e) = self.queue.mark_running(item.id, exec).await {
            warn!(id = %item.id, error = %e, "could not mark work item running, skipping");
            return ItemOutcome::Deferred { deadline: false };
        }

        match executor.execute(ctx, item).await {
            Ok(artifacts) => {
                if let Err(e) = self.queue.mark_complete(item.id, exec, &artifacts).await {
                    // Snapshot stays; the next run resumes to the same artifacts.
                    warn!(id = %item.id, error = %e, "could not mark work item complete");
                    return ItemOutcome::Deferred { deadline: false };
                }
                if let Err(e) = ctx.snapshots.delete_report(&item.run_id).await {
                    warn!(
                        run_id = %item.run_id,
                        error = %e,
                        "snapshot delete failed, left for cleanup"
                    );
                }
                ItemOutcome::Completed
            }
            Err(e) if e.is_deadline() => {
                info!(
                    id = %item.id,
                    run_id = %item.run_id,
                    reason = %e,
                    "out of time, leaving work item for next run"
                );
                self.release(ctx, item).await;
                ItemOutcome::Deferred { deadline: true }
            }
            Err(e) => {
                let total = ctx.record_exception();
                error!(
                    id = %item.id,
                    run_id = %item.run_id,
                    exceptions = total,
                    error = %e,
                    "work item failed"
                );
                if let Err(qe) = self.queue.mark_error(item.id, exec, &e.to_string()).await {
                    warn!(id = %item.id, error = %qe, "could not mark work item failed");
                }
                ItemOutcome::Failed
            }
        }
    }

    async fn release(&self, ctx: &RunContext, item: &WorkItem) {
        if let Err(e) = self.queue.release(item.id, ctx.execution_id).await {
            warn!(id = %item.id, error = %e, "could not release work item");
        }
    }

    /// Remove snapshots of this source whose work item is complete or gone.
    async fn collect_garbage(&self, ctx: &RunContext) -> Vec<String> {
        let active = match self.queue.active_run_ids(&ctx.definition.source_id).await {
            Ok(active) => active,
            Err(e) => {
                warn!(error = %e, "could not list active runs, skipping snapshot cleanup");
                return Vec::new();
            }
        };
        match ctx.snapshots.cleanup(&active).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "snapshot cleanup failed");
                Vec::new()
            }
        }
    }
}
