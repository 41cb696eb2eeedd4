//! File-backed Environment store.
//!
//! Wraps `MemoryStore` and rewrites a JSON snapshot of the whole store after
//! every successful mutation. The snapshot is written to a sibling temp file
//! and renamed into place so a crash never leaves a torn file behind.
//!
//! A mutation is applied in memory, and its watch event published, before
//! the snapshot is written. When the write fails the mutation returns
//! `StoreError::Backend` but stays applied: readers see it, and it is lost
//! only if the process stops before a later mutation persists successfully.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::memory::{MemoryStore, StoreSnapshot};
use super::{EnvironmentStore, StoreError, StoreResult, WatchEvent};
use crate::model::{Environment, ObjectKey};

pub struct FileStore {
    inner: MemoryStore,
    path: PathBuf,
    /// Serialises snapshot writes so they land in revision order.
    persist_lock: Mutex<()>,
}

impl FileStore {
    /// Opens the store at `path`, loading the existing snapshot if any.
    pub async fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<StoreSnapshot>(&bytes).map_err(|e| {
                StoreError::Backend(format!("Failed to parse {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreSnapshot::default(),
            Err(e) => {
                return Err(StoreError::Backend(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        info!(
            path = %path.display(),
            environments = snapshot.items.len(),
            revision = snapshot.revision,
            "opened file store"
        );

        Ok(Self {
            inner: MemoryStore::from_snapshot(snapshot),
            path,
            persist_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> StoreResult<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.inner.snapshot()?;
        let bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| StoreError::Backend(format!("Failed to encode snapshot: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    StoreError::Backend(format!("Failed to create {}: {}", parent.display(), e))
                })?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "snapshot rename failed");
            StoreError::Backend(format!("Failed to replace {}: {}", self.path.display(), e))
        })
    }
}

#[async_trait]
impl EnvironmentStore for FileStore {
    async fn get(&self, key: &ObjectKey) -> StoreResult<Environment> {
        self.inner.get(key).await
    }

    async fn list(&self, namespace: Option<&str>) -> StoreResult<Vec<Environment>> {
        self.inner.list(namespace).await
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.inner.watch()
    }

    /// A `Backend` error here means the record was created in memory but
    /// not persisted.
    async fn create(&self, env: Environment) -> StoreResult<Environment> {
        let created = self.inner.create(env).await?;
        self.persist().await?;
        Ok(created)
    }

    async fn update(&self, env: &Environment) -> StoreResult<Environment> {
        let updated = self.inner.update(env).await?;
        self.persist().await?;
        Ok(updated)
    }

    async fn update_status(&self, env: &Environment) -> StoreResult<Environment> {
        let updated = self.inner.update_status(env).await?;
        self.persist().await?;
        Ok(updated)
    }

    async fn delete(&self, key: &ObjectKey) -> StoreResult<()> {
        self.inner.delete(key).await?;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finalizer::FINALIZER;
    use crate::model::{EnvironmentSpec, Phase};
    use std::time::Duration;
    use tempfile::tempdir;

    fn env(name: &str) -> Environment {
        Environment::new(
            "default",
            name,
            EnvironmentSpec {
                repo_url: "https://example/repo.git".to_string(),
                branch: name.to_string(),
                ttl: Duration::from_secs(3600),
            },
        )
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state").join("environments.json");

        {
            let store = FileStore::open(&path).await.unwrap();
            let mut created = store.create(env("alpha")).await.unwrap();
            created.metadata.finalizers.push(FINALIZER.to_string());
            let updated = store.update(&created).await.unwrap();
            let mut ready = updated.clone();
            ready.status.phase = Phase::Ready;
            store.update_status(&ready).await.unwrap();
            store.create(env("beta")).await.unwrap();
            store.delete(&ObjectKey::new("default", "beta")).await.unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let items = reopened.list(None).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].status.phase, Phase::Ready);
        assert_eq!(items[0].metadata.finalizers, vec![FINALIZER.to_string()]);

        // Revision counter continues where it left off.
        let created = reopened.create(env("gamma")).await.unwrap();
        assert_eq!(created.metadata.resource_version, "6");
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("environments.json");
        std::fs::write(&path, b"not json").unwrap();

        let err = FileStore::open(&path).await.err().unwrap();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn test_failed_persist_leaves_mutation_applied() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sub").join("environments.json");
        let store = FileStore::open(&path).await.unwrap();
        // A plain file where the snapshot directory should go.
        std::fs::write(dir.path().join("sub"), b"").unwrap();

        let err = store.create(env("alpha")).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)), "{:?}", err);

        let key = ObjectKey::new("default", "alpha");
        let applied = store.get(&key).await.unwrap();
        assert_eq!(applied.metadata.resource_version, "1");
        assert!(!path.exists());

        // Once the path is usable again the next write persists both.
        std::fs::remove_file(dir.path().join("sub")).unwrap();
        store.create(env("beta")).await.unwrap();
        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(None).await.unwrap().len(), 2);
    }
}
