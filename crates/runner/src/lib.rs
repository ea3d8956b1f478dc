//! Job execution for ad-data ingestion: definitions, the per-run context,
//! the claim-execute-complete driver, executors and the cron scheduler.

pub mod context;
pub mod definition;
pub mod driver;
pub mod error;
pub mod executor;
pub mod lifecycle;
pub mod registry;
pub mod scheduler;

pub use context::RunContext;
pub use definition::{JobDefinition, JobsFile};
pub use driver::{JobDriver, RunSummary};
pub use error::RunnerError;
pub use executor::{BatchComputeExecutor, ItemExecutor};
pub use lifecycle::{ReportItem, ReportJob, ReportLifecycle};
pub use registry::{JobRegistry, ResolvedJob};
pub use scheduler::{parse_cron, run_with_retry, Scheduler};
