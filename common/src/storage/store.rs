use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::{
    local::LocalFileSystem, memory::InMemory, path::Path as ObjPath, ObjectStore, PutPayload,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::utils::config::{AppConfig, StorageKind};

/// Blob storage for payloads too large for the queue, exported reports and
/// files uploaded for knowledge items.
#[derive(Clone)]
pub struct StorageManager {
    store: Arc<dyn ObjectStore>,
    /// Root directory when backed by the local filesystem.
    local_root: Option<PathBuf>,
}

impl StorageManager {
    pub async fn new(cfg: &AppConfig) -> object_store::Result<Self> {
        match cfg.storage {
            StorageKind::Local => {
                let root = data_root(&cfg.data_dir);
                tokio::fs::create_dir_all(&root)
                    .await
                    .map_err(|err| object_store::Error::Generic {
                        store: "LocalFileSystem",
                        source: err.into(),
                    })?;
                let store = LocalFileSystem::new_with_prefix(&root)?;
                Ok(Self {
                    store: Arc::new(store),
                    local_root: Some(root),
                })
            }
            StorageKind::Memory => Ok(Self::in_memory()),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemory::new()),
            local_root: None,
        }
    }

    pub fn local_root(&self) -> Option<&Path> {
        self.local_root.as_deref()
    }

    pub async fn put(&self, location: &str, data: Bytes) -> object_store::Result<()> {
        self.store
            .put(&ObjPath::from(location), PutPayload::from_bytes(data))
            .await?;
        Ok(())
    }

    pub async fn get(&self, location: &str) -> object_store::Result<Bytes> {
        self.store.get(&ObjPath::from(location)).await?.bytes().await
    }

    pub async fn put_json<T: Serialize + Sync>(
        &self,
        location: &str,
        value: &T,
    ) -> Result<(), AppError> {
        let body = serde_json::to_vec(value)?;
        self.put(location, Bytes::from(body)).await?;
        Ok(())
    }

    /// Load and decode a JSON document. A missing object maps to `NotFound`.
    pub async fn get_json<T: DeserializeOwned>(&self, location: &str) -> Result<T, AppError> {
        let bytes = self.get(location).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => AppError::NotFound(format!("object {location}")),
            other => AppError::ObjectStore(other),
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn exists(&self, location: &str) -> object_store::Result<bool> {
        match self.store.head(&ObjPath::from(location)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Delete every object below `prefix`. Returns how many were removed.
    pub async fn delete_prefix(&self, prefix: &str) -> object_store::Result<usize> {
        let prefix_path = ObjPath::from(prefix);
        let locations = self
            .store
            .list(Some(&prefix_path))
            .map_ok(|meta| meta.location)
            .boxed();
        let removed = self
            .store
            .delete_stream(locations)
            .try_collect::<Vec<_>>()
            .await?
            .len();
        debug!(prefix, removed, "objects deleted");

        if let Some(root) = &self.local_root {
            prune_empty_dirs(root, prefix).await;
        }
        Ok(removed)
    }
}

/// `data_dir` as an absolute path; relative values resolve against the
/// working directory.
fn data_root(data_dir: &str) -> PathBuf {
    let dir = PathBuf::from(data_dir);
    if dir.is_absolute() {
        return dir;
    }
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(dir)
}

/// Walk from `root/prefix` upward, removing directories left empty.
async fn prune_empty_dirs(root: &Path, prefix: &str) {
    let relative = Path::new(prefix);
    if relative.is_absolute()
        || relative
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        warn!(prefix, "refusing to prune directories outside the data root");
        return;
    }

    let mut current = root.join(relative);
    while current.starts_with(root) && current != root {
        match tokio::fs::remove_dir(&current).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => return,
            Err(err) => {
                debug!(error = %err, path = %current.display(), "directory not pruned");
                return;
            }
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => return,
        }
    }
}
