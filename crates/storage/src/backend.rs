use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use tracing::{debug, info};

use adflow_core::config::{AwsConfig, Config};

use crate::error::StorageError;

/// Unified blob store wrapping object_store.
///
/// All keys passed in are relative; the S3 prefix (if any) is applied here
/// and stripped again from listing results.
pub enum StorageBackend {
    Local(LocalBackend),
    S3(S3Backend),
    Memory(Arc<dyn ObjectStore>),
}

impl StorageBackend {
    /// S3 when AWS credentials and a bucket are configured, local filesystem otherwise.
    pub fn from_config(config: &Config) -> Result<Self, StorageError> {
        if config.aws.is_configured() {
            Ok(StorageBackend::S3(S3Backend::new(&config.aws)?))
        } else {
            std::fs::create_dir_all(&config.storage.data_dir)?;
            Ok(StorageBackend::Local(LocalBackend::new(&config.storage.data_dir)?))
        }
    }

    /// Process-local store, used by tests and dry runs.
    pub fn memory() -> Self {
        StorageBackend::Memory(Arc::new(InMemory::new()))
    }

    /// Get the underlying ObjectStore.
    pub fn store(&self) -> &dyn ObjectStore {
        match self {
            StorageBackend::Local(b) => b.store.as_ref(),
            StorageBackend::S3(b) => b.store.as_ref(),
            StorageBackend::Memory(store) => store.as_ref(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, StorageBackend::S3(_))
    }

    /// Key prefix applied to every object (e.g. "production").
    pub fn prefix(&self) -> &str {
        match self {
            StorageBackend::S3(b) => &b.prefix,
            _ => "",
        }
    }

    fn location(&self, key: &str) -> ObjectPath {
        let key = key.trim_matches('/');
        let prefix = self.prefix();
        if prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{prefix}/{key}"))
        }
    }

    fn relative(&self, location: &ObjectPath) -> String {
        let full = location.to_string();
        let prefix = self.prefix();
        if prefix.is_empty() {
            return full;
        }
        full.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/').to_string())
            .unwrap_or(full)
    }

    /// Write `body` at `key`, replacing any existing object in one put.
    pub async fn put(&self, key: &str, body: Bytes) -> Result<(), StorageError> {
        let location = self.location(key);
        debug!(key = %location, bytes = body.len(), "put object");
        self.store().put(&location, PutPayload::from(body)).await?;
        Ok(())
    }

    /// Read `key`, or `None` if it does not exist.
    pub async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let location = self.location(key);
        match self.store().get(&location).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Metadata of `key`, or `None` if it does not exist.
    pub async fn head(&self, key: &str) -> Result<Option<ObjectMeta>, StorageError> {
        match self.store().head(&self.location(key)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List relative keys under `prefix`.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let location = self.location(prefix);
        let metas: Vec<ObjectMeta> = self.store().list(Some(&location)).try_collect().await?;
        let mut keys: Vec<String> = metas.iter().map(|m| self.relative(&m.location)).collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete `key`. Deleting a missing object is not an error.
    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let location = self.location(key);
        match self.store().delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Local filesystem backend.
pub struct LocalBackend {
    pub store: Arc<dyn ObjectStore>,
    pub data_dir: PathBuf,
}

impl LocalBackend {
    pub fn new(data_dir: &std::path::Path) -> Result<Self, StorageError> {
        let canonical = std::fs::canonicalize(data_dir).unwrap_or_else(|_| data_dir.to_path_buf());
        let store = LocalFileSystem::new_with_prefix(&canonical)
            .map_err(|e| StorageError::Other(format!("local filesystem error: {e}")))?;
        info!("Storage: local backend at {}", canonical.display());
        Ok(Self {
            store: Arc::new(store),
            data_dir: canonical,
        })
    }
}

/// S3 backend.
pub struct S3Backend {
    pub store: Arc<dyn ObjectStore>,
    pub bucket: String,
    pub prefix: String,
}

impl S3Backend {
    pub fn new(aws: &AwsConfig) -> Result<Self, StorageError> {
        let bucket = aws
            .s3_bucket
            .as_deref()
            .ok_or_else(|| StorageError::NotConfigured("S3_BUCKET not set".into()))?;

        let mut builder = AmazonS3Builder::new().with_region(&aws.region);

        if let Some(ref key) = aws.access_key_id {
            builder = builder.with_access_key_id(key);
        }
        if let Some(ref secret) = aws.secret_access_key {
            builder = builder.with_secret_access_key(secret);
        }
        if let Some(ref token) = aws.session_token {
            builder = builder.with_token(token);
        }

        match aws.endpoint_url.as_deref().filter(|e| !e.is_empty()) {
            Some(endpoint) => {
                // object_store requires absolute URLs
                let endpoint_url =
                    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
                        endpoint.to_string()
                    } else {
                        format!("https://{endpoint}")
                    };
                builder = builder
                    .with_bucket_name(bucket)
                    .with_endpoint(&endpoint_url)
                    .with_allow_http(endpoint_url.starts_with("http://"));
            }
            None => {
                builder = builder.with_url(format!("s3://{bucket}"));
            }
        }

        let store = builder.build()?;

        let prefix = aws
            .s3_prefix
            .as_deref()
            .unwrap_or("")
            .trim_matches('/')
            .to_string();

        info!(
            "Storage: S3 backend s3://{}/{} (region: {})",
            bucket, prefix, aws.region
        );

        Ok(Self {
            store: Arc::new(store),
            bucket: bucket.to_string(),
            prefix,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_backend_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(tmp.path()).unwrap();
        assert!(!StorageBackend::Local(backend).is_remote());
    }

    #[tokio::test]
    async fn memory_round_trip_and_missing_keys() {
        let backend = StorageBackend::memory();
        backend.put("a/b/one.json", Bytes::from_static(b"{}")).await.unwrap();
        backend.put("a/c/two.json", Bytes::from_static(b"[]")).await.unwrap();

        assert_eq!(backend.get("a/b/one.json").await.unwrap().unwrap(), Bytes::from_static(b"{}"));
        assert!(backend.get("a/b/missing.json").await.unwrap().is_none());
        assert_eq!(backend.list("a").await.unwrap(), vec!["a/b/one.json", "a/c/two.json"]);

        backend.delete("a/b/one.json").await.unwrap();
        backend.delete("a/b/one.json").await.unwrap();
        assert_eq!(backend.list("a").await.unwrap(), vec!["a/c/two.json"]);
    }

    #[tokio::test]
    async fn local_backend_missing_objects() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = StorageBackend::Local(LocalBackend::new(tmp.path()).unwrap());

        assert!(backend.get("nothing/here.json").await.unwrap().is_none());
        backend.delete("nothing/here.json").await.unwrap();

        backend.put("runs/x.json", Bytes::from_static(b"1")).await.unwrap();
        assert_eq!(backend.list("runs").await.unwrap(), vec!["runs/x.json"]);
    }
}
