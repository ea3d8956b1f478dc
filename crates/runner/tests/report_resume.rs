//! End-to-end runs of the report lifecycle against in-memory storage and
//! queue: retries inside a step, resume after a crash, and release on
//! deadline.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use serde_json::json;

use adflow_core::{ReportProgressItem, ReportStatus, TimePartition, WorkItem, WorkItemStatus};
use adflow_queue::{InMemoryWorkItemRepository, LocalScopeLocks, WorkItemRepository, WorkQueue};
use adflow_resilience::{BackoffSettings, CallError};
use adflow_runner::{
    JobDefinition, JobDriver, ReportItem, ReportJob, ReportLifecycle, RunContext,
};
use adflow_storage::{ArtifactWriter, ResumableReportStore, StorageBackend};

/// One campaign report per item. Polls fail `poll_failures` times with a
/// transient error, then answer `Pending` until `ready` is set.
struct ScriptedReports {
    poll_failures: u32,
    ready: AtomicBool,
    submits: AtomicU32,
    polls: AtomicU32,
    downloads: AtomicU32,
}

impl ScriptedReports {
    fn new(poll_failures: u32, ready: bool) -> Self {
        Self {
            poll_failures,
            ready: AtomicBool::new(ready),
            submits: AtomicU32::new(0),
            polls: AtomicU32::new(0),
            downloads: AtomicU32::new(0),
        }
    }

    fn counts(&self) -> (u32, u32, u32) {
        (
            self.submits.load(Ordering::SeqCst),
            self.polls.load(Ordering::SeqCst),
            self.downloads.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl ReportJob for ScriptedReports {
    fn plan(&self, _ctx: &RunContext, _item: &WorkItem) -> Vec<ReportItem> {
        vec![ReportProgressItem::new("campaigns", json!({"level": "campaign"}))]
    }

    async fn submit(
        &self,
        _ctx: &RunContext,
        _item: &WorkItem,
        report: &ReportItem,
    ) -> Result<String, CallError> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        Ok(format!("remote-{}", report.name))
    }

    async fn poll(
        &self,
        _ctx: &RunContext,
        _item: &WorkItem,
        report: &ReportItem,
    ) -> Result<ReportStatus, CallError> {
        assert_eq!(report.remote_id.as_deref(), Some("remote-campaigns"));
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if n < self.poll_failures {
            return Err(CallError::Transient("HTTP 503: service unavailable".into()));
        }
        if self.ready.load(Ordering::SeqCst) {
            Ok(ReportStatus::ReadyForDownload)
        } else {
            Ok(ReportStatus::Pending)
        }
    }

    async fn download(
        &self,
        _ctx: &RunContext,
        _item: &WorkItem,
        _report: &ReportItem,
    ) -> Result<Bytes, CallError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(b"{\"rows\":[{\"spend\":12.5}]}"))
    }
}

struct Fixture {
    repo: Arc<InMemoryWorkItemRepository>,
    backend: Arc<StorageBackend>,
    driver: JobDriver,
    item: WorkItem,
}

async fn fixture() -> Fixture {
    let repo = Arc::new(InMemoryWorkItemRepository::new());
    let backend = Arc::new(StorageBackend::memory());
    let queue = WorkQueue::new(
        repo.clone(),
        Arc::new(LocalScopeLocks::new()),
        chrono::Duration::hours(2),
    );
    let driver = JobDriver::new(
        queue,
        ResumableReportStore::new(backend.clone(), "working"),
        ArtifactWriter::new(backend.clone(), "raw"),
    );

    let day = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
    let item = WorkItem::new("search-ads", TimePartition::day(day), 1);
    repo.insert(&item).await.unwrap();

    Fixture {
        repo,
        backend,
        driver,
        item,
    }
}

fn definition(max_runtime: Duration) -> Arc<JobDefinition> {
    let mut def = JobDefinition::new("search-ads-daily", "report", "search-ads", max_runtime);
    def.backoff = BackoffSettings::Fixed {
        delay_ms: 1_000,
        max_retry: 3,
    };
    def.report_poll_interval_secs = 30;
    Arc::new(def)
}

#[tokio::test(start_paused = true)]
async fn transient_poll_failures_are_retried_and_item_completes() {
    let f = fixture().await;
    let def = definition(Duration::from_secs(600));
    let job = Arc::new(ScriptedReports::new(2, true));
    let lifecycle = ReportLifecycle::new(job.clone());

    let summary = f.driver.run(def.clone(), &lifecycle).await.unwrap();

    assert!(summary.is_success());
    assert_eq!(summary.completed, 1);
    assert_eq!(job.counts(), (1, 3, 1));

    let stored = f.repo.get(f.item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkItemStatus::Complete);
    assert_eq!(stored.artifacts.len(), 1);
    assert!(stored.artifacts[0].path.ends_with("/campaigns.json"));
    assert!(f.backend.get(&stored.artifacts[0].path).await.unwrap().is_some());

    let snapshots = f.driver.snapshots_for(&def);
    let left: Vec<ReportItem> = snapshots.get_reports(&f.item.run_id).await.unwrap();
    assert!(left.is_empty(), "snapshot should be deleted after completion");
}

#[tokio::test(start_paused = true)]
async fn restart_reissues_only_the_remaining_step() {
    let f = fixture().await;
    let def = definition(Duration::from_secs(600));

    // A previous execution submitted and saw the report ready, then died.
    let mut saved = ReportProgressItem::new("campaigns", json!({"level": "campaign"}));
    saved.mark_submitted("remote-campaigns").unwrap();
    saved.advance(ReportStatus::ReadyForDownload).unwrap();
    f.driver
        .snapshots_for(&def)
        .save_report(&f.item.run_id, &[saved])
        .await
        .unwrap();

    let job = Arc::new(ScriptedReports::new(0, true));
    let summary = f.driver.run(def, &ReportLifecycle::new(job.clone())).await.unwrap();

    assert_eq!(summary.completed, 1);
    assert_eq!(job.counts(), (0, 0, 1));
}

#[tokio::test(start_paused = true)]
async fn deadline_leaves_item_for_next_run_which_resumes_polling() {
    let f = fixture().await;
    let def = definition(Duration::from_secs(100));
    let job = Arc::new(ScriptedReports::new(0, false));
    let lifecycle = ReportLifecycle::new(job.clone());

    let first = f.driver.run(def.clone(), &lifecycle).await.unwrap();
    assert_eq!(first.deferred, 1);
    assert!(first.deadline_reached);
    assert_eq!(first.failed, 0);

    let stored = f.repo.get(f.item.id).await.unwrap().unwrap();
    assert_ne!(stored.status, WorkItemStatus::Error);
    assert!(stored.claim.is_none());

    let saved: Vec<ReportItem> = f
        .driver
        .snapshots_for(&def)
        .get_reports(&f.item.run_id)
        .await
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(saved[0].status, ReportStatus::Pending);

    let (submits, polls_before, _) = job.counts();
    assert_eq!(submits, 1);

    job.ready.store(true, Ordering::SeqCst);
    let second = f.driver.run(def, &lifecycle).await.unwrap();
    assert_eq!(second.completed, 1);

    let (submits, polls_after, downloads) = job.counts();
    assert_eq!(submits, 1, "report must not be submitted again");
    assert_eq!(polls_after, polls_before + 1);
    assert_eq!(downloads, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_fail_the_item_and_keep_the_snapshot() {
    let f = fixture().await;
    let def = definition(Duration::from_secs(600));
    let job = Arc::new(ScriptedReports::new(10, true));

    let summary = f.driver.run(def.clone(), &ReportLifecycle::new(job.clone())).await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.exceptions, 1);
    // First attempt plus three retries.
    assert_eq!(job.counts(), (1, 4, 0));

    let stored = f.repo.get(f.item.id).await.unwrap().unwrap();
    assert_eq!(stored.status, WorkItemStatus::Error);
    assert!(stored.last_error.unwrap().contains("503"));

    let saved: Vec<ReportItem> = f
        .driver
        .snapshots_for(&def)
        .get_reports(&f.item.run_id)
        .await
        .unwrap();
    assert_eq!(saved[0].status, ReportStatus::Pending);
}
