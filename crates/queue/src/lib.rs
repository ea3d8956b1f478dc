//! Persisted work items and the concurrency-safe claim protocol.

pub mod error;
pub mod lock;
pub mod postgres;
pub mod repository;
pub mod work_queue;

pub use error::QueueError;
pub use lock::{LocalScopeLocks, ScopeLock, ScopeLockGuard};
pub use postgres::PgWorkItemRepository;
pub use repository::{InMemoryWorkItemRepository, WorkItemRepository};
pub use work_queue::WorkQueue;
