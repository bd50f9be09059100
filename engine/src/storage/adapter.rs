//! Capability contract for a storage backend.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Raw record storage keyed by model name and id.
///
/// Records are JSON objects carrying an `id`. Backends only need point
/// lookups, full scans in insertion order and offset pagination; filtering
/// and multi-field sort happen in memory above this layer.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Prepare the backend. Must be idempotent.
    async fn init(&self) -> Result<()>;

    async fn get(&self, model: &str, id: &str) -> Result<Option<Value>>;

    /// Every record of a model, in insertion order.
    async fn get_all(&self, model: &str) -> Result<Vec<Value>>;

    /// One page of records in insertion order.
    async fn get_page(&self, model: &str, page: usize, limit: usize) -> Result<Vec<Value>>;

    /// Insert or replace a record.
    async fn put(&self, model: &str, id: &str, record: Value) -> Result<()>;

    /// Remove a record. Returns whether it existed.
    async fn remove(&self, model: &str, id: &str) -> Result<bool>;

    /// Remove every record of every model.
    async fn clear(&self) -> Result<()>;
}
