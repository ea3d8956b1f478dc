//! Durable, run-keyed snapshots of in-flight report progress.
//!
//! Each run id owns one object, `{root}/{run_id}_unfinished.json`, rewritten
//! in full after every lifecycle step. A snapshot exists exactly while its
//! work item is unfinished; [`ResumableReportStore::cleanup_reports`] removes
//! those left behind by crashed or abandoned runs.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use adflow_core::ReportProgressItem;

use crate::backend::StorageBackend;
use crate::error::StorageError;

const SNAPSHOT_SUFFIX: &str = "_unfinished.json";

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot<P> {
    run_id: String,
    saved_at: DateTime<Utc>,
    items: Vec<ReportProgressItem<P>>,
}

/// Borrowing twin of [`Snapshot`] for writes.
#[derive(Serialize)]
struct SnapshotRef<'a, P> {
    run_id: &'a str,
    saved_at: DateTime<Utc>,
    items: &'a [ReportProgressItem<P>],
}

#[derive(Clone)]
pub struct ResumableReportStore {
    backend: Arc<StorageBackend>,
    root: String,
}

impl ResumableReportStore {
    pub fn new(backend: Arc<StorageBackend>, root: impl Into<String>) -> Self {
        Self {
            backend,
            root: root.into().trim_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Store scoped to `{root}/{child}`.
    pub fn scoped(&self, child: &str) -> Self {
        Self {
            backend: self.backend.clone(),
            root: join(&self.root, child),
        }
    }

    /// Object key of the snapshot for `run_id`.
    pub fn snapshot_key(&self, run_id: &str) -> Result<String, StorageError> {
        if run_id.is_empty() || run_id.contains('/') {
            return Err(StorageError::InvalidRunId(run_id.to_string()));
        }
        Ok(join(&self.root, &format!("{run_id}{SNAPSHOT_SUFFIX}")))
    }

    /// Overwrite the snapshot for `run_id`.
    pub async fn save_report<P: Serialize>(
        &self,
        run_id: &str,
        items: &[ReportProgressItem<P>],
    ) -> Result<(), StorageError> {
        let snapshot = SnapshotRef {
            run_id,
            saved_at: Utc::now(),
            items,
        };
        let key = self.snapshot_key(run_id)?;
        let body = serde_json::to_vec_pretty(&snapshot)?;
        self.backend.put(&key, Bytes::from(body)).await?;
        debug!(run_id, items = items.len(), "report snapshot saved");
        Ok(())
    }

    /// Last saved snapshot, or an empty list when none exists.
    pub async fn get_reports<P: DeserializeOwned>(
        &self,
        run_id: &str,
    ) -> Result<Vec<ReportProgressItem<P>>, StorageError> {
        let Some(body) = self.backend.get(&self.snapshot_key(run_id)?).await? else {
            return Ok(Vec::new());
        };
        let snapshot: Snapshot<P> =
            serde_json::from_slice(&body).map_err(|e| StorageError::CorruptSnapshot {
                run_id: run_id.to_string(),
                reason: e.to_string(),
            })?;
        debug!(
            run_id,
            items = snapshot.items.len(),
            saved_at = %snapshot.saved_at,
            "report snapshot loaded"
        );
        Ok(snapshot.items)
    }

    pub async fn delete_report(&self, run_id: &str) -> Result<(), StorageError> {
        self.backend.delete(&self.snapshot_key(run_id)?).await?;
        debug!(run_id, "report snapshot deleted");
        Ok(())
    }

    /// Delete every snapshot under `root_scope` whose run id is not in
    /// `active_run_ids`. Returns the removed run ids, sorted.
    pub async fn cleanup_reports(
        &self,
        root_scope: &str,
        active_run_ids: &HashSet<String>,
    ) -> Result<Vec<String>, StorageError> {
        let mut removed = Vec::new();

        for key in self.backend.list(root_scope).await? {
            let Some(run_id) = run_id_of(&key) else {
                continue;
            };
            if active_run_ids.contains(run_id) {
                continue;
            }
            match self.backend.delete(&key).await {
                Ok(()) => removed.push(run_id.to_string()),
                Err(e) => warn!(key = %key, error = %e, "failed to delete stale snapshot"),
            }
        }

        removed.sort();
        if !removed.is_empty() {
            info!(root_scope, removed = removed.len(), "stale report snapshots removed");
        }
        Ok(removed)
    }

    /// [`cleanup_reports`](Self::cleanup_reports) over this store's own root.
    pub async fn cleanup(
        &self,
        active_run_ids: &HashSet<String>,
    ) -> Result<Vec<String>, StorageError> {
        let root = self.root.clone();
        self.cleanup_reports(&root, active_run_ids).await
    }
}

fn join(root: &str, child: &str) -> String {
    let child = child.trim_matches('/');
    if root.is_empty() {
        child.to_string()
    } else {
        format!("{root}/{child}")
    }
}

fn run_id_of(key: &str) -> Option<&str> {
    let file = key.rsplit('/').next()?;
    file.strip_suffix(SNAPSHOT_SUFFIX).filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use adflow_core::ReportStatus;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Params {
        granularity: String,
    }

    fn store() -> ResumableReportStore {
        ResumableReportStore::new(Arc::new(StorageBackend::memory()), "raw/working/search-ads")
    }

    fn items() -> Vec<ReportProgressItem<Params>> {
        let mut first =
            ReportProgressItem::new("campaigns", Params { granularity: "daily".into() });
        first.mark_submitted("r-1").unwrap();
        let second = ReportProgressItem::new("keywords", Params { granularity: "hourly".into() });
        vec![first, second]
    }

    #[test]
    fn snapshot_paths() {
        let store = store();
        assert_eq!(
            store.snapshot_key("abc").unwrap(),
            "raw/working/search-ads/abc_unfinished.json"
        );
        assert_eq!(run_id_of("x/y/abc_unfinished.json"), Some("abc"));
        assert_eq!(run_id_of("x/y/abc.json"), None);
        assert_eq!(run_id_of("x/_unfinished.json"), None);
    }

    #[tokio::test]
    async fn run_ids_with_a_slash_are_rejected() {
        let store = store();
        for bad in ["a/b", "", "/lead"] {
            let err = store.save_report(bad, &items()).await.unwrap_err();
            assert!(matches!(err, StorageError::InvalidRunId(ref id) if id == bad));
            assert!(store.get_reports::<Params>(bad).await.is_err());
            assert!(store.delete_report(bad).await.is_err());
        }

        // Nothing reached the backend, so cleanup has no orphans to find.
        let removed = store.cleanup(&HashSet::new()).await.unwrap();
        assert!(removed.is_empty());
    }

    #[tokio::test]
    async fn save_then_get_returns_last_snapshot() {
        let store = store();
        let mut saved = items();
        store.save_report("run-1", &saved).await.unwrap();

        saved[0].advance(ReportStatus::ReadyForDownload).unwrap();
        store.save_report("run-1", &saved).await.unwrap();

        let loaded: Vec<ReportProgressItem<Params>> = store.get_reports("run-1").await.unwrap();
        assert_eq!(loaded, saved);
    }

    #[tokio::test]
    async fn missing_snapshot_is_empty_and_delete_clears() {
        let store = store();
        let none: Vec<ReportProgressItem<Params>> = store.get_reports("nope").await.unwrap();
        assert!(none.is_empty());

        store.save_report("run-2", &items()).await.unwrap();
        store.delete_report("run-2").await.unwrap();
        let gone: Vec<ReportProgressItem<Params>> = store.get_reports("run-2").await.unwrap();
        assert!(gone.is_empty());
    }

    #[tokio::test]
    async fn unreadable_snapshot_is_corrupt() {
        let backend = Arc::new(StorageBackend::memory());
        let store = ResumableReportStore::new(backend.clone(), "w");
        backend
            .put("w/bad_unfinished.json", Bytes::from_static(b"{not json"))
            .await
            .unwrap();

        let err = store.get_reports::<Params>("bad").await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptSnapshot { ref run_id, .. } if run_id == "bad"));
    }

    #[tokio::test]
    async fn cleanup_removes_exactly_inactive_snapshots() {
        let backend = Arc::new(StorageBackend::memory());
        let root = ResumableReportStore::new(backend.clone(), "raw/working");
        let a = root.scoped("job-a");
        let b = root.scoped("job-b");

        a.save_report("keep", &items()).await.unwrap();
        a.save_report("stale-1", &items()).await.unwrap();
        b.save_report("stale-2", &items()).await.unwrap();
        backend.put("raw/working/job-a/notes.txt", Bytes::from_static(b"x")).await.unwrap();

        let active: HashSet<String> = ["keep".to_string()].into_iter().collect();
        let removed = root.cleanup(&active).await.unwrap();
        assert_eq!(removed, vec!["stale-1", "stale-2"]);

        assert_eq!(
            backend.list("raw/working").await.unwrap(),
            vec!["raw/working/job-a/keep_unfinished.json", "raw/working/job-a/notes.txt"]
        );
    }

    #[tokio::test]
    async fn cleanup_honours_root_scope() {
        let backend = Arc::new(StorageBackend::memory());
        let root = ResumableReportStore::new(backend.clone(), "raw/working");
        root.scoped("job-a").save_report("old-a", &items()).await.unwrap();
        root.scoped("job-b").save_report("old-b", &items()).await.unwrap();

        let removed = root
            .cleanup_reports("raw/working/job-a", &HashSet::new())
            .await
            .unwrap();
        assert_eq!(removed, vec!["old-a"]);
        let left: Vec<ReportProgressItem<Params>> =
            root.scoped("job-b").get_reports("old-b").await.unwrap();
        assert_eq!(left.len(), 2);
    }
}
