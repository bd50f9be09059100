//! Persisted form of the in-memory adapter.
//!
//! Uses BTreeMap so the same contents always serialize to the same bytes.

use crate::{error::Result, Error, ModelId, ModelName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Version of the snapshot format for future compatibility.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// One stored record with its insertion sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRow {
    pub seq: u64,
    pub record: Value,
}

/// A point-in-time copy of every stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub format_version: u32,
    /// Next insertion sequence number
    pub next_seq: u64,
    /// Records by model, then by id
    pub tables: BTreeMap<ModelName, BTreeMap<ModelId, SnapshotRow>>,
}

impl Default for StoreSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreSnapshot {
    pub fn new() -> Self {
        Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            next_seq: 0,
            tables: BTreeMap::new(),
        }
    }

    /// Insert or replace a record, keeping its original sequence on replace.
    pub fn put(&mut self, model: &str, id: &str, record: Value) {
        let table = self.tables.entry(model.to_string()).or_default();
        match table.get_mut(id) {
            Some(row) => row.record = record,
            None => {
                table.insert(
                    id.to_string(),
                    SnapshotRow {
                        seq: self.next_seq,
                        record,
                    },
                );
                self.next_seq += 1;
            }
        }
    }

    pub fn get(&self, model: &str, id: &str) -> Option<&Value> {
        self.tables.get(model)?.get(id).map(|row| &row.record)
    }

    pub fn remove(&mut self, model: &str, id: &str) -> bool {
        self.tables
            .get_mut(model)
            .is_some_and(|table| table.remove(id).is_some())
    }

    /// Records of one model in insertion order.
    pub fn ordered(&self, model: &str) -> Vec<&Value> {
        let Some(table) = self.tables.get(model) else {
            return Vec::new();
        };
        let mut rows: Vec<_> = table.values().collect();
        rows.sort_by_key(|row| row.seq);
        rows.into_iter().map(|row| &row.record).collect()
    }

    pub fn record_count(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn clear(&mut self) {
        self.tables.clear();
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let snapshot: Self =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;

        if snapshot.format_version > SNAPSHOT_FORMAT_VERSION {
            return Err(Error::InvalidSnapshot(format!(
                "unsupported snapshot format version: {} (max supported: {})",
                snapshot.format_version, SNAPSHOT_FORMAT_VERSION
            )));
        }

        Ok(snapshot)
    }
}
