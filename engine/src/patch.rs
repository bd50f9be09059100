//! Field-level patches between two model revisions.
//!
//! Diffs compare field maps value-by-value (deep equality). Arrays and nested
//! objects are replaced as a whole field, so every patch path has exactly one
//! segment.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Patch operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOp {
    Replace,
    Add,
    Remove,
}

/// One field-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    pub op: PatchOp,
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl Patch {
    pub fn replace(field: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path: vec![field.into()],
            value: Some(value),
        }
    }

    pub fn add(field: impl Into<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path: vec![field.into()],
            value: Some(value),
        }
    }

    pub fn remove(field: impl Into<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path: vec![field.into()],
            value: None,
        }
    }

    /// Top-level field this patch touches.
    pub fn field(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }
}

/// Compute the patches turning `old` into `new`.
///
/// Changed and added fields come first in `new`'s key order, followed by
/// removals in `old`'s key order.
pub fn diff(old: &Map<String, Value>, new: &Map<String, Value>) -> Vec<Patch> {
    let mut patches = Vec::new();

    for (field, value) in new {
        match old.get(field) {
            Some(previous) if previous == value => {}
            Some(Value::Null) | None if value.is_null() => {}
            Some(_) => patches.push(Patch::replace(field.clone(), value.clone())),
            None => patches.push(Patch::add(field.clone(), value.clone())),
        }
    }

    for (field, value) in old {
        if !new.contains_key(field) && !value.is_null() {
            patches.push(Patch::remove(field.clone()));
        }
    }

    patches
}

/// Fold `next` into `previous`.
///
/// Each touched path appears once, at the position it was first touched,
/// carrying the most recent change.
pub fn merge(previous: &[Patch], next: &[Patch]) -> Vec<Patch> {
    let mut merged = previous.to_vec();
    for patch in next {
        match merged.iter_mut().find(|p| p.path == patch.path) {
            Some(existing) => *existing = patch.clone(),
            None => merged.push(patch.clone()),
        }
    }
    merged
}

/// Apply patches to a field map.
pub fn apply(fields: &mut Map<String, Value>, patches: &[Patch]) {
    for patch in patches {
        let Some(field) = patch.field() else {
            continue;
        };
        match (&patch.op, &patch.value) {
            (PatchOp::Remove, _) => {
                fields.remove(field);
            }
            (_, Some(value)) => {
                fields.insert(field.to_string(), value.clone());
            }
            (_, None) => {
                fields.insert(field.to_string(), Value::Null);
            }
        }
    }
}
