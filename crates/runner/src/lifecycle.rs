//! Multi-step report lifecycle: submit → poll → download.
//!
//! Every step is one governed, retried call. The full list of sub-reports is
//! saved to the snapshot store after each step, so an execution that dies
//! (or runs out of time) resumes from the last persisted step instead of
//! re-issuing work the remote system already did.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use adflow_core::{Artifact, ReportProgressItem, ReportStatus, WorkItem};
use adflow_resilience::{run_bounded, CallError};
use adflow_storage::StorageError;

use crate::context::RunContext;
use crate::error::RunnerError;
use crate::executor::ItemExecutor;

/// Progress of one sub-report, with a source-defined JSON payload.
pub type ReportItem = ReportProgressItem<Value>;

/// Source-specific glue for one kind of asynchronous report.
///
/// Implementations issue exactly one outbound request per method call;
/// throttling, retries and persistence are handled by [`ReportLifecycle`].
#[async_trait]
pub trait ReportJob: Send + Sync {
    /// Sub-reports needed for `item`. Names must be unique within the item.
    fn plan(&self, ctx: &RunContext, item: &WorkItem) -> Vec<ReportItem>;

    /// Request the report; returns the remote report id.
    async fn submit(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        report: &ReportItem,
    ) -> Result<String, CallError>;

    /// Current remote status: `Pending`, `ReadyForDownload` or `Failed`.
    async fn poll(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        report: &ReportItem,
    ) -> Result<ReportStatus, CallError>;

    async fn download(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        report: &ReportItem,
    ) -> Result<Bytes, CallError>;

    /// Declared size of the download, charged against the byte budget
    /// before the call starts.
    fn expected_size(&self, _report: &ReportItem) -> Option<u64> {
        None
    }

    fn file_name(&self, report: &ReportItem) -> String {
        format!("{}.json", report.name)
    }
}

/// Runs a [`ReportJob`] for each claimed work item.
pub struct ReportLifecycle {
    job: Arc<dyn ReportJob>,
}

impl ReportLifecycle {
    pub fn new(job: Arc<dyn ReportJob>) -> Self {
        Self { job }
    }

    /// The plan for `item`, with steps already taken restored from the last
    /// snapshot. Reports that failed remotely start over.
    pub async fn resume(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
    ) -> Result<Vec<ReportItem>, RunnerError> {
        let planned = self.job.plan(ctx, item);

        let saved: Vec<ReportItem> = match ctx.snapshots.get_reports(&item.run_id).await {
            Ok(saved) => saved,
            Err(StorageError::CorruptSnapshot { run_id, reason }) => {
                warn!(
                    run_id = %run_id,
                    reason = %reason,
                    "ignoring unreadable snapshot, starting over"
                );
                Vec::new()
            }
            Err(e) => return Err(e.into()),
        };
        if saved.is_empty() {
            return Ok(planned);
        }

        let mut resumed = 0usize;
        let merged: Vec<ReportItem> = planned
            .into_iter()
            .map(|fresh| {
                match saved
                    .iter()
                    .find(|s| s.name == fresh.name && s.status != ReportStatus::Failed)
                {
                    Some(prior) => {
                        resumed += 1;
                        prior.clone()
                    }
                    None => fresh,
                }
            })
            .collect();

        info!(
            run_id = %item.run_id,
            reports = merged.len(),
            resumed,
            "resuming work item from snapshot"
        );
        Ok(merged)
    }

    async fn persist(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        state: &Mutex<Vec<ReportItem>>,
        idx: usize,
        report: &ReportItem,
    ) -> Result<(), RunnerError> {
        let mut all = state.lock().await;
        all[idx] = report.clone();
        ctx.snapshots.save_report(&item.run_id, &all[..]).await?;
        Ok(())
    }

    /// Drive one sub-report to `Downloaded`.
    async fn drive(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
        state: &Mutex<Vec<ReportItem>>,
        idx: usize,
    ) -> Result<Artifact, RunnerError> {
        let mut report = state.lock().await[idx].clone();
        let step_id = format!("{}/{}", item.run_id, report.name);

        loop {
            match report.status {
                ReportStatus::Created => {
                    let (remote_id, _) = ctx
                        .call(&format!("{step_id}/submit"), None, |_| {
                            self.job.submit(ctx, item, &report)
                        })
                        .await?;
                    report.mark_submitted(remote_id)?;
                    self.persist(ctx, item, state, idx, &report).await?;
                    debug!(run_id = %item.run_id, report = %report.name, "report submitted");
                }
                ReportStatus::Pending => {
                    let (remote, _) = ctx
                        .call(&format!("{step_id}/poll"), None, |_| {
                            self.job.poll(ctx, item, &report)
                        })
                        .await?;
                    match remote {
                        ReportStatus::Pending => {
                            let interval = ctx.definition.report_poll_interval();
                            if ctx.budget.would_exceed(interval) {
                                return Err(RunnerError::DeadlineReached {
                                    stage: format!("{step_id}/poll"),
                                });
                            }
                            tokio::time::sleep(interval).await;
                        }
                        ReportStatus::ReadyForDownload => {
                            report.advance(ReportStatus::ReadyForDownload)?;
                            self.persist(ctx, item, state, idx, &report).await?;
                        }
                        ReportStatus::Failed => {
                            report.advance(ReportStatus::Failed)?;
                            self.persist(ctx, item, state, idx, &report).await?;
                            return Err(RunnerError::ReportFailed {
                                report: report.name.clone(),
                            });
                        }
                        other => {
                            return Err(CallError::Fatal(format!(
                                "poll of report {} returned unexpected status {other}",
                                report.name
                            ))
                            .into());
                        }
                    }
                }
                ReportStatus::ReadyForDownload => {
                    let (body, ticket) = ctx
                        .call(
                            &format!("{step_id}/download"),
                            self.job.expected_size(&report),
                            |_| self.job.download(ctx, item, &report),
                        )
                        .await?;
                    ctx.governor.record_size(ticket, body.len() as u64);
                    let artifact = ctx
                        .artifacts
                        .write_for(item, &self.job.file_name(&report), body)
                        .await?;
                    report.mark_downloaded(&artifact.path)?;
                    self.persist(ctx, item, state, idx, &report).await?;
                    return Ok(artifact);
                }
                ReportStatus::Downloaded => {
                    // Written by an earlier execution of this run.
                    let path = report.artifact_path.clone().unwrap_or_default();
                    return match ctx.artifacts.describe(&path).await? {
                        Some(artifact) => Ok(artifact),
                        None => Err(RunnerError::Other(format!(
                            "report {} marked downloaded but {path} is missing",
                            report.name
                        ))),
                    };
                }
                ReportStatus::Failed => {
                    return Err(RunnerError::ReportFailed {
                        report: report.name.clone(),
                    });
                }
            }
        }
    }
}

#[async_trait]
impl ItemExecutor for ReportLifecycle {
    async fn execute(
        &self,
        ctx: &RunContext,
        item: &WorkItem,
    ) -> Result<Vec<Artifact>, RunnerError> {
        let reports = self.resume(ctx, item).await?;
        if reports.is_empty() {
            return Ok(Vec::new());
        }

        let count = reports.len();
        let state = Mutex::new(reports);
        let result = run_bounded(
            (0..count).collect::<Vec<usize>>(),
            ctx.definition.max_degree_of_parallelism,
            |idx| self.drive(ctx, item, &state, idx),
        )
        .await;

        match result {
            Ok(artifacts) => Ok(artifacts),
            Err(failure) if failure.failure_count == 1 => Err(failure.first),
            Err(failure) => Err(RunnerError::Parallel {
                first: Box::new(failure.first),
                failure_count: failure.failure_count,
            }),
        }
    }
}
