//! Remote batch-compute jobs: the service seam, an HTTP client for it, a
//! durable job log and the bounded-concurrency orchestrator.

pub mod config;
pub mod error;
pub mod http;
pub mod job_log;
pub mod orchestrator;
pub mod service;

pub use config::BatchConfig;
pub use error::BatchError;
pub use http::HttpBatchService;
pub use job_log::{live_run_id, read_entries, JobLog, JobLogEntry, JobLogStatus, JsonlJobLog};
pub use orchestrator::{BatchJobOutcome, RemoteBatchJobOrchestrator, StartedRun};
pub use service::{BatchComputeService, BatchRunState, BatchRunStatus, BatchTask};
