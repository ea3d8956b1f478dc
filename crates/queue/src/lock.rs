//! Scope-keyed named locks guarding the claim critical section.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::trace;

use crate::error::QueueError;

/// Held for the duration of one claim. Dropping it releases the lock.
pub struct ScopeLockGuard {
    key: String,
    _held: Box<dyn Send + Sync>,
}

impl ScopeLockGuard {
    pub fn new(key: impl Into<String>, held: Box<dyn Send + Sync>) -> Self {
        Self { key: key.into(), _held: held }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl std::fmt::Debug for ScopeLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScopeLockGuard").field("key", &self.key).finish()
    }
}

/// A named mutual-exclusion primitive keyed by claim scope.
///
/// Claims on different scopes never contend; claims on the same scope are
/// serialized.
#[async_trait]
pub trait ScopeLock: Send + Sync {
    async fn acquire(&self, scope_key: &str) -> Result<ScopeLockGuard, QueueError>;
}

/// In-process registry holding one async mutex per scope key.
#[derive(Debug, Default)]
pub struct LocalScopeLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, scope_key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(scope_key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Number of distinct scope keys seen so far.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ScopeLock for LocalScopeLocks {
    async fn acquire(&self, scope_key: &str) -> Result<ScopeLockGuard, QueueError> {
        let mutex = self.entry(scope_key);
        let guard = mutex.lock_owned().await;
        trace!(scope = scope_key, "scope lock acquired");
        Ok(ScopeLockGuard::new(scope_key, Box::new(guard)))
    }
}
