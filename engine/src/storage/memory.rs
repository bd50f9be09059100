//! In-memory storage adapter with optional JSON persistence.

use super::adapter::StorageAdapter;
use super::snapshot::StoreSnapshot;
use crate::{error::Result, Error};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Keeps every record in memory. With a persistence path, the whole store
/// is written as a [`StoreSnapshot`] after each write.
#[derive(Debug, Default)]
pub struct InMemoryAdapter {
    state: RwLock<StoreSnapshot>,
    path: Option<PathBuf>,
    write_lock: tokio::sync::Mutex<()>,
}

impl InMemoryAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist to `path`, loading its contents on `init` if it exists.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            ..Self::default()
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.read().clone()
    }

    /// Apply `f` to the store. With persistence, `f` runs on a copy that
    /// only becomes visible once it has been written.
    async fn write<T>(&self, f: impl FnOnce(&mut StoreSnapshot) -> T) -> Result<T> {
        let _guard = self.write_lock.lock().await;
        let Some(path) = &self.path else {
            return Ok(f(&mut self.state.write()));
        };

        let mut next = self.state.read().clone();
        let out = f(&mut next);
        let json = next.to_json()?;

        tokio::fs::write(path, json)
            .await
            .map_err(|e| Error::Storage(format!("{}: {}", path.display(), e)))?;

        *self.state.write() = next;
        Ok(out)
    }
}

#[async_trait]
impl StorageAdapter for InMemoryAdapter {
    async fn init(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match tokio::fs::read_to_string(path).await {
            Ok(json) => {
                let loaded = StoreSnapshot::from_json(&json)?;
                tracing::debug!(
                    path = %path.display(),
                    records = loaded.record_count(),
                    "loaded store snapshot"
                );
                *self.state.write() = loaded;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!("{}: {}", path.display(), e))),
        }
    }

    async fn get(&self, model: &str, id: &str) -> Result<Option<Value>> {
        Ok(self.state.read().get(model, id).cloned())
    }

    async fn get_all(&self, model: &str) -> Result<Vec<Value>> {
        Ok(self
            .state
            .read()
            .ordered(model)
            .into_iter()
            .cloned()
            .collect())
    }

    async fn get_page(&self, model: &str, page: usize, limit: usize) -> Result<Vec<Value>> {
        Ok(self
            .state
            .read()
            .ordered(model)
            .into_iter()
            .skip(page.saturating_mul(limit))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn put(&self, model: &str, id: &str, record: Value) -> Result<()> {
        self.write(|state| state.put(model, id, record)).await
    }

    async fn remove(&self, model: &str, id: &str) -> Result<bool> {
        self.write(|state| state.remove(model, id)).await
    }

    async fn clear(&self) -> Result<()> {
        self.write(StoreSnapshot::clear).await
    }
}
