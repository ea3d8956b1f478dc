//! Queue error types.

use thiserror::Error;
use uuid::Uuid;

use adflow_core::CoreError;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("work item not found: {0}")]
    NotFound(Uuid),

    /// The item is claimed by another execution.
    #[error("work item {id} is not owned by execution {execution_id}")]
    NotOwner { id: Uuid, execution_id: Uuid },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("corrupt row for work item {id}: {reason}")]
    CorruptRow { id: Uuid, reason: String },
}
