use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A snapshot exists but cannot be decoded.
    #[error("corrupt snapshot for run {run_id}: {reason}")]
    CorruptSnapshot { run_id: String, reason: String },

    /// Run ids name one object directly under the store root.
    #[error("invalid run id {0:?}: must be non-empty and contain no '/'")]
    InvalidRunId(String),

    #[error("not configured: {0}")]
    NotConfigured(String),

    #[error("{0}")]
    Other(String),
}
