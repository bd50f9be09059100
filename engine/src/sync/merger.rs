//! Merging server records into local storage.
//!
//! Records arrive either from sync query pages or as the server's answer to
//! an outbox mutation. A record is applied unless:
//! - a local mutation for it is still queued (local work wins until sent)
//! - the stored copy already carries a higher `_version`
//!
//! Tombstones (`_deleted: true`) delete the local record.

use super::outbox::Outbox;
use crate::mutation::Origin;
use crate::storage::ExclusiveStorage;
use crate::{error::Result, Model, ModelId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What happened to each record of a merged batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    /// Saved records
    pub applied: Vec<ModelId>,
    /// Deleted tombstones
    pub deleted: Vec<ModelId>,
    /// Skipped because a local mutation is pending
    pub pending: Vec<ModelId>,
    /// Skipped because the stored copy is newer
    pub stale: Vec<ModelId>,
}

impl MergeResult {
    pub fn merged_count(&self) -> usize {
        self.applied.len() + self.deleted.len()
    }
}

/// Applies remote records atomically with respect to local mutations.
#[derive(Debug, Clone)]
pub struct ModelMerger {
    outbox: Arc<Outbox>,
}

impl ModelMerger {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self { outbox }
    }

    /// Merge a batch inside one exclusive storage block.
    pub async fn merge(&self, storage: &ExclusiveStorage, records: Vec<Model>) -> Result<MergeResult> {
        let outbox = self.outbox.clone();

        storage
            .run_exclusive(|s| async move {
                let mut result = MergeResult::default();

                for remote in records {
                    let id = remote.id().to_string();

                    if outbox.has_pending(remote.model_name(), &id) {
                        result.pending.push(id);
                        continue;
                    }

                    let ctor = s.registry().model(remote.model_name());
                    let local = match &ctor {
                        Some(ctor) => s.query_by_id(ctor, &id).await?,
                        None => None,
                    };
                    if is_stale(local.as_ref(), &remote) {
                        result.stale.push(id);
                        continue;
                    }

                    if remote.is_deleted() {
                        if let Some(local) = local {
                            s.delete(&local, None, Origin::Remote).await?;
                        }
                        result.deleted.push(id);
                    } else {
                        s.save(&remote, None, Origin::Remote).await?;
                        result.applied.push(id);
                    }
                }

                Ok(result)
            })
            .await
    }
}

fn is_stale(local: Option<&Model>, remote: &Model) -> bool {
    match (local.and_then(Model::version), remote.version()) {
        (Some(local), Some(remote)) => local > remote,
        _ => false,
    }
}
