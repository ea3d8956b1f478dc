//! adflow-worker: runs ad-data ingestion jobs.
//!
//! Subcommands:
//! - `schedule`: run every cron-scheduled job until Ctrl-C
//! - `run <job>`: one execution of a job (with its auto-retries)
//! - `enqueue <job> --from --to`: create one work item per day
//! - `validate`: parse the jobs file and resolve every executor

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use adflow_batch::{BatchConfig, HttpBatchService, JsonlJobLog, RemoteBatchJobOrchestrator};
use adflow_core::config::load_dotenv;
use adflow_core::{Config, TimePartition, WorkItem};
use adflow_queue::{
    InMemoryWorkItemRepository, LocalScopeLocks, PgWorkItemRepository, WorkItemRepository,
    WorkQueue,
};
use adflow_runner::{run_with_retry, JobDriver, JobRegistry, JobsFile, Scheduler};
use adflow_storage::{ArtifactWriter, ResumableReportStore, StorageBackend};

// ── CLI ─────────────────────────────────────────────────────────────

/// Ad-data ingestion worker.
#[derive(Parser, Debug)]
#[command(name = "adflow-worker", version, about)]
struct Cli {
    /// Jobs file; defaults to the configured `ADFLOW_JOBS_FILE`.
    #[arg(long)]
    jobs: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run scheduled jobs until interrupted.
    Schedule,
    /// Run one job now.
    Run {
        job: String,
    },
    /// Enqueue one work item per day in `[from, to]` for a job's source.
    Enqueue {
        job: String,
        #[arg(long)]
        from: NaiveDate,
        #[arg(long)]
        to: NaiveDate,
        #[arg(long, default_value_t = 100)]
        priority: i64,
        #[arg(long)]
        backfill: bool,
    },
    /// Check the jobs file and exit.
    Validate,
}

// ── Wiring ──────────────────────────────────────────────────────────

/// Postgres when configured (`connect` applies migrations), else in memory.
async fn repository(config: &Config) -> anyhow::Result<Arc<dyn WorkItemRepository>> {
    if config.postgres.is_configured() {
        let repo = PgWorkItemRepository::connect(&config.postgres)
            .await
            .context("connecting to PostgreSQL and applying migrations")?;
        Ok(Arc::new(repo))
    } else {
        warn!("PostgreSQL not configured, work items are kept in memory for this process only");
        Ok(Arc::new(InMemoryWorkItemRepository::new()))
    }
}

fn registry(config: &Config) -> anyhow::Result<JobRegistry> {
    let mut registry = JobRegistry::new();

    let batch = BatchConfig::from_env_profiled(&config.profile);
    if batch.is_configured() {
        let service = HttpBatchService::new(&batch)?;
        let log = JsonlJobLog::new(batch.job_log_path.clone());
        let orchestrator =
            RemoteBatchJobOrchestrator::new(batch, Arc::new(service), Arc::new(log))?;
        registry.register_batch(Arc::new(orchestrator))?;
    } else {
        info!("batch compute not configured, 'batch' jobs unavailable");
    }

    Ok(registry)
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let jobs_path = cli.jobs.clone().unwrap_or_else(|| config.runner.jobs_file.clone());
    let jobs = JobsFile::load(&jobs_path)
        .with_context(|| format!("loading jobs from {}", jobs_path.display()))?;
    let registry = registry(&config)?;

    if let Command::Validate = cli.command {
        let resolved = registry.resolve_all(&jobs.jobs)?;
        info!(
            jobs = jobs.jobs.len(),
            enabled = resolved.len(),
            kinds = ?registry.kinds(),
            "jobs file is valid"
        );
        return Ok(());
    }

    let backend = Arc::new(StorageBackend::from_config(&config)?);
    let snapshots =
        ResumableReportStore::new(backend.clone(), config.storage.working_prefix.clone());
    let artifacts = ArtifactWriter::new(backend, config.storage.artifact_prefix.clone());
    let queue = WorkQueue::new(
        repository(&config).await?,
        Arc::new(LocalScopeLocks::new()),
        chrono::Duration::seconds(config.runner.claim_lease_secs as i64),
    );
    let driver = Arc::new(JobDriver::new(queue.clone(), snapshots, artifacts));

    match cli.command {
        Command::Schedule => {
            let resolved = registry.resolve_all(&jobs.jobs)?;
            let scheduler = Scheduler::new(driver, resolved)?
                .with_poll_interval(Duration::from_secs(config.runner.scheduler_poll_secs));
            if scheduler.is_empty() {
                warn!("no enabled job has a cron expression, nothing to schedule");
            }
            scheduler
                .run_until(async {
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        warn!(error = %e, "failed to listen for Ctrl-C");
                    }
                })
                .await;
        }
        Command::Run { job } => {
            let definition = jobs
                .get(&job)
                .with_context(|| format!("no job named '{job}' in {}", jobs_path.display()))?;
            let resolved = registry.resolve(definition)?;
            let summary = run_with_retry(&driver, &resolved).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.is_success() {
                anyhow::bail!("{} work item(s) failed", summary.failed);
            }
        }
        Command::Enqueue {
            job,
            from,
            to,
            priority,
            backfill,
        } => {
            let definition = jobs
                .get(&job)
                .with_context(|| format!("no job named '{job}' in {}", jobs_path.display()))?;
            anyhow::ensure!(from <= to, "--from must not be after --to");

            let mut count = 0usize;
            for day in from.iter_days().take_while(|d| *d <= to) {
                let mut item =
                    WorkItem::new(&definition.source_id, TimePartition::day(day), priority);
                if let Some(cred) = &definition.credential_id {
                    item = item.with_credential(cred);
                }
                if let Some(parent) = &definition.parent_integration_id {
                    item = item.with_parent_integration(parent);
                }
                if backfill {
                    item = item.as_backfill();
                }
                queue.enqueue(&item).await?;
                count += 1;
            }
            info!(job = %job, source = %definition.source_id, items = count, "work items enqueued");
        }
        Command::Validate => {}
    }

    Ok(())
}
