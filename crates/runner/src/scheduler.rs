//! Cron-driven scheduler for job definitions.
//!
//! Every poll tick, definitions whose next fire time has passed are started
//! in the background and their fire time advanced. A job that is still
//! running when it fires again is skipped for that tick. Failed executions
//! are re-run after `defer_interval_secs`, up to `auto_retry_count` times.

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::driver::{JobDriver, RunSummary};
use crate::error::RunnerError;
use crate::registry::ResolvedJob;

/// Default poll interval for the scheduler loop.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Parse a cron expression, auto-prepending "0 " for 5-field expressions.
///
/// The `cron` crate requires 6 fields (sec min hr dom mon dow); job files
/// usually carry the 5-field form.
pub fn parse_cron(expr: &str) -> Result<Schedule, cron::error::Error> {
    let parts: Vec<&str> = expr.split_whitespace().collect();
    if parts.len() == 5 {
        Schedule::from_str(&format!("0 {expr}"))
    } else {
        Schedule::from_str(expr)
    }
}

/// Run `job` once, re-running failed executions after the job's defer
/// interval until one succeeds or `auto_retry_count` re-runs are used up.
///
/// Returns the last execution's result.
pub async fn run_with_retry(
    driver: &JobDriver,
    job: &ResolvedJob,
) -> Result<RunSummary, RunnerError> {
    let definition = &job.definition;
    let mut retries = 0u32;
    loop {
        let result = driver.run(definition.clone(), job.executor.as_ref()).await;
        let failed = match &result {
            Ok(summary) => !summary.is_success(),
            Err(e) => {
                error!(job = %definition.name, error = %e, "job run aborted");
                true
            }
        };
        if !failed || retries >= definition.auto_retry_count {
            return result;
        }

        retries += 1;
        warn!(
            job = %definition.name,
            retry = retries,
            of = definition.auto_retry_count,
            defer_secs = definition.defer_interval_secs,
            "job run failed, deferring re-run"
        );
        tokio::time::sleep(definition.defer_interval()).await;
    }
}

struct ScheduledJob {
    job: ResolvedJob,
    schedule: Schedule,
    next_run: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    driver: Arc<JobDriver>,
    jobs: Vec<ScheduledJob>,
    running: HashMap<String, JoinHandle<()>>,
    poll_interval: Duration,
}

impl Scheduler {
    /// Schedule every enabled job that has a cron expression.
    pub fn new(driver: Arc<JobDriver>, jobs: Vec<ResolvedJob>) -> Result<Self, RunnerError> {
        let now = Utc::now();
        let mut scheduled = Vec::new();
        for job in jobs {
            let Some(expr) = job.definition.cron.clone() else {
                continue;
            };
            if !job.definition.enabled {
                continue;
            }
            let schedule = parse_cron(&expr).map_err(|e| {
                RunnerError::InvalidDefinition(format!(
                    "{}: invalid cron '{expr}': {e}",
                    job.definition.name
                ))
            })?;
            let next_run = schedule.after(&now).next();
            info!(job = %job.definition.name, cron = %expr, next_run = ?next_run, "job scheduled");
            scheduled.push(ScheduledJob { job, schedule, next_run });
        }
        Ok(Self {
            driver,
            jobs: scheduled,
            running: HashMap::new(),
            poll_interval: POLL_INTERVAL,
        })
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs due at `now`. Advances each returned job's next fire time.
    fn take_due(&mut self, now: DateTime<Utc>) -> Vec<ResolvedJob> {
        let mut due = Vec::new();
        for entry in &mut self.jobs {
            match entry.next_run {
                Some(at) if at <= now => {
                    due.push(entry.job.clone());
                    entry.next_run = entry.schedule.after(&now).next();
                }
                _ => {}
            }
        }
        due
    }

    fn start(&mut self, job: ResolvedJob) {
        let name = job.definition.name.clone();
        if let Some(handle) = self.running.get(&name) {
            if !handle.is_finished() {
                warn!(job = %name, "previous run still in progress, skipping this fire");
                return;
            }
        }

        info!(job = %name, trigger = "scheduled", "scheduler: triggering job");
        let driver = self.driver.clone();
        let handle = tokio::spawn(async move {
            match run_with_retry(&driver, &job).await {
                Ok(summary) if summary.is_success() => {}
                Ok(summary) => warn!(
                    job = %summary.job,
                    failed = summary.failed,
                    "scheduled run finished with failures"
                ),
                Err(e) => error!(job = %job.definition.name, error = %e, "scheduled run failed"),
            }
        });
        self.running.insert(name, handle);
    }

    /// Poll until `shutdown` resolves. In-flight runs are left to finish on
    /// their own; their claims expire if the process exits first.
    pub async fn run_until<S>(mut self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        info!(
            jobs = self.jobs.len(),
            "job scheduler started (poll interval: {}s)",
            self.poll_interval.as_secs()
        );
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("job scheduler stopping");
                    break;
                }
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            for job in self.take_due(Utc::now()) {
                self.start(job);
            }
            self.running.retain(|_, handle| !handle.is_finished());
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone};

    use adflow_core::{Artifact, TimePartition, WorkItem, WorkItemStatus};
    use adflow_queue::{InMemoryWorkItemRepository, LocalScopeLocks, WorkItemRepository, WorkQueue};
    use adflow_resilience::CallError;
    use adflow_storage::{ArtifactWriter, ResumableReportStore, StorageBackend};

    use crate::context::RunContext;
    use crate::definition::JobDefinition;
    use crate::executor::ItemExecutor;

    #[test]
    fn test_parse_cron_six_field() {
        let schedule = parse_cron("0 */5 * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[test]
    fn test_parse_cron_five_field_auto_prefix() {
        let schedule = parse_cron("0 * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[test]
    fn test_parse_cron_invalid() {
        assert!(parse_cron("not a cron").is_err());
    }

    #[test]
    fn test_parse_cron_daily_at_three() {
        let schedule = parse_cron("0 3 * * *").unwrap();
        let next = schedule.upcoming(Utc).next().unwrap();
        assert_eq!(next.format("%H:%M:%S").to_string(), "03:00:00");
    }

    /// Fails every call until `fail_first` calls have been made.
    struct FlakyExecutor {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl ItemExecutor for FlakyExecutor {
        async fn execute(
            &self,
            _ctx: &RunContext,
            _item: &WorkItem,
        ) -> Result<Vec<Artifact>, RunnerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(CallError::Fatal("HTTP 500 from report API".into()).into())
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn driver(repo: Arc<InMemoryWorkItemRepository>) -> JobDriver {
        let queue = WorkQueue::new(
            repo,
            Arc::new(LocalScopeLocks::new()),
            chrono::Duration::hours(1),
        );
        let backend = Arc::new(StorageBackend::memory());
        JobDriver::new(
            queue,
            ResumableReportStore::new(backend.clone(), "working"),
            ArtifactWriter::new(backend, "raw"),
        )
    }

    fn resolved(def: JobDefinition, executor: Arc<dyn ItemExecutor>) -> ResolvedJob {
        ResolvedJob {
            definition: Arc::new(def),
            executor,
        }
    }

    async fn seeded_repo() -> (Arc<InMemoryWorkItemRepository>, WorkItem) {
        let repo = Arc::new(InMemoryWorkItemRepository::new());
        let day = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        let item = WorkItem::new("linkedin", TimePartition::day(day), 0);
        repo.insert(&item).await.unwrap();
        (repo, item)
    }

    #[tokio::test(start_paused = true)]
    async fn failed_run_is_rerun_after_defer_interval() {
        let (repo, item) = seeded_repo().await;
        let driver = driver(repo.clone());

        let mut def = JobDefinition::new("linkedin", "flaky", "linkedin", Duration::from_secs(60));
        def.auto_retry_count = 2;
        def.defer_interval_secs = 120;
        let exec = Arc::new(FlakyExecutor { calls: AtomicU32::new(0), fail_first: 1 });
        let job = resolved(def, exec.clone());

        let started = tokio::time::Instant::now();
        let summary = run_with_retry(&driver, &job).await.unwrap();

        assert!(summary.is_success());
        assert_eq!(summary.completed, 1);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(120));
        let stored = repo.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Complete);
    }

    #[tokio::test(start_paused = true)]
    async fn reruns_stop_at_auto_retry_count() {
        let (repo, item) = seeded_repo().await;
        let driver = driver(repo.clone());

        let mut def = JobDefinition::new("linkedin", "flaky", "linkedin", Duration::from_secs(60));
        def.auto_retry_count = 1;
        def.defer_interval_secs = 10;
        let exec = Arc::new(FlakyExecutor { calls: AtomicU32::new(0), fail_first: 10 });

        let summary = run_with_retry(&driver, &resolved(def, exec.clone())).await.unwrap();
        assert!(!summary.is_success());
        assert_eq!(exec.calls.load(Ordering::SeqCst), 2);
        let stored = repo.get(item.id).await.unwrap().unwrap();
        assert_eq!(stored.status, WorkItemStatus::Error);
        assert_eq!(stored.last_error.as_deref(), Some("HTTP 500 from report API"));
    }

    #[test]
    fn take_due_advances_fire_times_and_skips_unscheduled() {
        let driver = Arc::new(driver(Arc::new(InMemoryWorkItemRepository::new())));
        let exec: Arc<dyn ItemExecutor> = Arc::new(FlakyExecutor {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });

        let mut hourly = JobDefinition::new("hourly", "flaky", "s", Duration::from_secs(60));
        hourly.cron = Some("0 * * * *".into());
        let on_demand = JobDefinition::new("manual", "flaky", "s", Duration::from_secs(60));
        let mut disabled = JobDefinition::new("off", "flaky", "s", Duration::from_secs(60));
        disabled.cron = Some("0 * * * *".into());
        disabled.enabled = false;

        let mut scheduler = Scheduler::new(
            driver,
            vec![
                resolved(hourly, exec.clone()),
                resolved(on_demand, exec.clone()),
                resolved(disabled, exec),
            ],
        )
        .unwrap();
        assert_eq!(scheduler.len(), 1);

        let t0 = Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap();
        scheduler.jobs[0].next_run = Some(t0);

        assert!(scheduler.take_due(t0 - chrono::Duration::minutes(1)).is_empty());
        let due = scheduler.take_due(t0 + chrono::Duration::seconds(5));
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].definition.name, "hourly");
        assert_eq!(
            scheduler.jobs[0].next_run,
            Some(Utc.with_ymd_and_hms(2025, 6, 1, 11, 0, 0).unwrap())
        );
        assert!(scheduler.take_due(t0 + chrono::Duration::seconds(30)).is_empty());
    }
}
