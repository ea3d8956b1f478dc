//! Blob-store access for ingestion runs: backend selection, resumable report
//! snapshots and artifact writes.

pub mod artifact;
pub mod backend;
pub mod error;
pub mod report_store;

pub use artifact::ArtifactWriter;
pub use backend::{LocalBackend, S3Backend, StorageBackend};
pub use error::StorageError;
pub use report_store::ResumableReportStore;
