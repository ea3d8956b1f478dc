use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use tracing::info;

use adflow_core::{Artifact, WorkItem};

use crate::backend::StorageBackend;
use crate::error::StorageError;

/// Writes downloaded report bodies to the blob store.
#[derive(Clone)]
pub struct ArtifactWriter {
    backend: Arc<StorageBackend>,
    root: String,
}

impl ArtifactWriter {
    pub fn new(backend: Arc<StorageBackend>, root: impl Into<String>) -> Self {
        Self {
            backend,
            root: root.into().trim_matches('/').to_string(),
        }
    }

    /// `{root}/{source}/{partition_start}/{run_id}/{file_name}`
    pub fn key_for(&self, item: &WorkItem, file_name: &str) -> String {
        let rel = format!(
            "{}/{}/{}/{}",
            item.source_id,
            item.partition.start.format("%Y-%m-%d"),
            item.run_id,
            file_name.trim_matches('/')
        );
        if self.root.is_empty() {
            rel
        } else {
            format!("{}/{}", self.root, rel)
        }
    }

    pub async fn write(&self, key: &str, body: Bytes) -> Result<Artifact, StorageError> {
        let size_bytes = body.len() as u64;
        self.backend.put(key, body).await?;
        info!(path = key, size_bytes, "artifact written");
        Ok(Artifact {
            path: key.to_string(),
            size_bytes,
            written_at: Utc::now(),
        })
    }

    /// Artifact record for an object written earlier, e.g. by a previous
    /// execution of the same run.
    pub async fn describe(&self, key: &str) -> Result<Option<Artifact>, StorageError> {
        Ok(self.backend.head(key).await?.map(|meta| Artifact {
            path: key.to_string(),
            size_bytes: meta.size as u64,
            written_at: meta.last_modified,
        }))
    }

    /// Write a report body for `item` and return the artifact record.
    pub async fn write_for(
        &self,
        item: &WorkItem,
        file_name: &str,
        body: Bytes,
    ) -> Result<Artifact, StorageError> {
        let key = self.key_for(item, file_name);
        self.write(&key, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use adflow_core::TimePartition;
    use chrono::NaiveDate;

    #[tokio::test]
    async fn writes_under_item_path() {
        let backend = Arc::new(StorageBackend::memory());
        let writer = ArtifactWriter::new(backend.clone(), "raw/artifacts/");
        let partition = TimePartition::day(NaiveDate::from_ymd_opt(2025, 6, 2).unwrap());
        let mut item = WorkItem::new("bing-ads", partition, 0);
        item.run_id = "run-9".into();

        let artifact = writer
            .write_for(&item, "campaigns.json", Bytes::from_static(b"[1,2,3]"))
            .await
            .unwrap();

        assert_eq!(artifact.path, "raw/artifacts/bing-ads/2025-06-02/run-9/campaigns.json");
        assert_eq!(artifact.size_bytes, 7);
        assert_eq!(
            backend.get(&artifact.path).await.unwrap().unwrap(),
            Bytes::from_static(b"[1,2,3]")
        );

        let described = writer.describe(&artifact.path).await.unwrap().unwrap();
        assert_eq!(described.size_bytes, 7);
        assert!(writer.describe("raw/artifacts/missing.json").await.unwrap().is_none());
    }
}
