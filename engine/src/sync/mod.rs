//! Synchronization with the remote service.
//!
//! Once started, the [`SyncEngine`] installs a hook on the mutation feed
//! that queues local mutations of syncable models in the [`Outbox`]. The
//! hook runs inside the storage operation, so a mutation is pending before
//! any merge can see the record. A worker task then:
//! - pulls every syncable model (`sync{Plural}` pages, merged through
//!   [`ModelMerger`], then marked synced)
//! - drains the outbox whenever woken
//! - pulls models whose first pull failed again, with backoff, until they
//!   succeed
//!
//! A failed mutation is reported and dropped; it never stops the queue.

pub mod errors;
pub mod merger;
pub mod outbox;
pub mod processor;
pub mod retry;
pub mod transport;

pub use errors::{log_errors, ErrorHandler, ErrorType, SyncErrorContext, SyncProcess};
pub use merger::{MergeResult, ModelMerger};
pub use outbox::{Outbox, OutboxMutation};
pub use processor::{AuthModeStrategy, SyncOperation, SyncPage, SyncProcessor};
pub use retry::{jittered_retry, RetryConfig};
pub use transport::{AuthMode, GraphQLError, GraphQLRequest, Transport, TransportError};

use crate::mutation::{MutationEvent, Origin};
use crate::observe::SyncStatus;
use crate::storage::ExclusiveStorage;
use crate::{Model, ModelConstructor};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Floor of the wait before pulling a failed model again.
const MIN_PULL_DELAY: Duration = Duration::from_millis(250);

/// Events published on the [`Hub`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum HubEvent {
    /// A sync response was partially usable
    #[serde(rename_all = "camelCase")]
    SyncQueriesPartialSyncError {
        errors: Vec<GraphQLError>,
        model_name: String,
    },
    /// One model finished its pull
    #[serde(rename_all = "camelCase")]
    ModelSynced {
        model: String,
        is_full_sync: bool,
        new: usize,
        deleted: usize,
    },
    /// Every model finished its pull
    SyncQueriesReady,
    OutboxMutationProcessed {
        model: String,
        element: Value,
    },
    #[serde(rename_all = "camelCase")]
    OutboxMutationFailed {
        model: String,
        element: Value,
        error: String,
        error_type: ErrorType,
    },
    /// Initial sync done, outbox processing has begun
    Ready,
}

/// Broadcast channel of [`HubEvent`]s.
#[derive(Debug, Clone)]
pub struct Hub {
    sender: broadcast::Sender<HubEvent>,
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Hub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Events with no listener are dropped.
    pub fn dispatch(&self, event: HubEvent) {
        tracing::trace!(?event, "hub dispatch");
        let _ = self.sender.send(event);
    }

    pub fn listen(&self) -> broadcast::Receiver<HubEvent> {
        self.sender.subscribe()
    }
}

/// Tasks of a running [`SyncEngine`].
#[derive(Debug)]
pub struct SyncHandle {
    tasks: Vec<JoinHandle<()>>,
}

impl SyncHandle {
    /// Stop every task. In-flight requests are abandoned.
    pub fn abort(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.tasks.iter().all(JoinHandle::is_finished)
    }
}

/// Settings of a [`SyncEngine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncLimits {
    pub page_size: usize,
    pub max_records: usize,
}

/// Pull and push loop for syncable models.
pub struct SyncEngine {
    storage: Arc<ExclusiveStorage>,
    processor: Arc<SyncProcessor>,
    outbox: Arc<Outbox>,
    merger: ModelMerger,
    hub: Hub,
    status: Arc<SyncStatus>,
    error_handler: ErrorHandler,
    limits: SyncLimits,
    /// Backoff between pulls of models whose pull failed
    pull_retry: RetryConfig,
}

impl SyncEngine {
    pub fn new(
        storage: Arc<ExclusiveStorage>,
        processor: Arc<SyncProcessor>,
        hub: Hub,
        status: Arc<SyncStatus>,
        error_handler: ErrorHandler,
        limits: SyncLimits,
    ) -> Self {
        let outbox = Arc::new(Outbox::new());
        Self {
            storage,
            processor,
            merger: ModelMerger::new(outbox.clone()),
            outbox,
            hub,
            status,
            error_handler,
            limits,
            pull_retry: RetryConfig::default(),
        }
    }

    pub fn with_pull_retry(mut self, retry: RetryConfig) -> Self {
        self.pull_retry = retry;
        self
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    fn syncable(&self, model: &str) -> Option<ModelConstructor> {
        self.storage
            .storage()
            .registry()
            .model(model)
            .filter(ModelConstructor::is_syncable)
    }

    /// Install the outbox hook and spawn the worker.
    ///
    /// Every local mutation of a syncable model made after this returns is
    /// queued before the storage operation that made it completes.
    pub fn start(self: Arc<Self>) -> SyncHandle {
        let wake = Arc::new(Notify::new());

        let syncable: HashSet<String> = self
            .storage
            .storage()
            .registry()
            .models()
            .filter(|c| c.is_syncable())
            .map(|c| c.name().to_string())
            .collect();
        let outbox = self.outbox.clone();
        let hook_wake = wake.clone();
        self.storage
            .storage()
            .feed()
            .set_hook(Arc::new(move |event: &MutationEvent| {
                if event.origin == Origin::Local && syncable.contains(&event.model) {
                    outbox.enqueue(event);
                    hook_wake.notify_one();
                }
            }));

        let worker = tokio::spawn(async move {
            let mut failed = self.pull_all().await;
            self.hub.dispatch(HubEvent::Ready);

            let mut attempt = 1;
            let mut next_pull = self.schedule_pull(&failed, attempt);
            loop {
                self.drain().await;

                let Some(at) = next_pull else {
                    wake.notified().await;
                    continue;
                };
                tokio::select! {
                    _ = wake.notified() => {}
                    _ = tokio::time::sleep_until(at) => {
                        failed = self.pull_models(failed).await;
                        attempt += 1;
                        next_pull = self.schedule_pull(&failed, attempt);
                    }
                }
            }
        });

        tracing::info!("sync engine started");
        SyncHandle {
            tasks: vec![worker],
        }
    }

    fn schedule_pull(&self, failed: &[ModelConstructor], attempt: u32) -> Option<Instant> {
        if failed.is_empty() {
            return None;
        }
        let delay = self.pull_retry.delay_for_attempt(attempt).max(MIN_PULL_DELAY);
        tracing::debug!(models = failed.len(), ?delay, "rescheduling failed pulls");
        Some(Instant::now() + delay)
    }

    /// Pull every syncable model, marking each synced once merged.
    ///
    /// Returns the models whose pull failed.
    pub async fn pull_all(&self) -> Vec<ModelConstructor> {
        let models: Vec<_> = self
            .storage
            .storage()
            .registry()
            .models()
            .filter(|c| c.is_syncable())
            .cloned()
            .collect();

        let failed = self.pull_models(models).await;
        self.hub.dispatch(HubEvent::SyncQueriesReady);
        failed
    }

    async fn pull_models(&self, models: Vec<ModelConstructor>) -> Vec<ModelConstructor> {
        let mut failed = Vec::new();

        for ctor in models {
            match self.pull(&ctor).await {
                Ok(result) => {
                    self.status.mark_synced(ctor.name());
                    self.hub.dispatch(HubEvent::ModelSynced {
                        model: ctor.name().to_string(),
                        is_full_sync: true,
                        new: result.applied.len(),
                        deleted: result.deleted.len(),
                    });
                }
                Err(err) => {
                    tracing::error!(model = %ctor.name(), error = %err, "model sync failed");
                    failed.push(ctor);
                }
            }
        }
        failed
    }

    async fn pull(&self, ctor: &ModelConstructor) -> crate::Result<MergeResult> {
        let page = self
            .processor
            .sync_model(ctor, self.limits.page_size, self.limits.max_records, None)
            .await?;

        let mut models = Vec::with_capacity(page.items.len());
        for item in &page.items {
            match ctor.from_remote(item) {
                Ok(model) => models.push(model),
                Err(err) => self.report_bad_record(ctor, item, &err),
            }
        }

        let result = self.merger.merge(&self.storage, models).await?;
        tracing::debug!(
            model = %ctor.name(),
            applied = result.applied.len(),
            deleted = result.deleted.len(),
            skipped = result.pending.len() + result.stale.len(),
            "merged sync page"
        );
        Ok(result)
    }

    fn report_bad_record(&self, ctor: &ModelConstructor, item: &Value, err: &crate::Error) {
        tracing::warn!(model = %ctor.name(), error = %err, "skipping invalid remote record");
        (self.error_handler)(&SyncErrorContext {
            operation: format!("sync{}", ctor.definition().plural()),
            process: SyncProcess::Sync,
            error_type: ErrorType::BadRecord,
            message: err.to_string(),
            model: ctor.name().to_string(),
            record: Some(item.clone()),
        });
    }

    /// Send every queued mutation, merging the server's copies back.
    pub async fn drain(&self) {
        while let Some(mutation) = self.outbox.peek() {
            let Some(ctor) = self.syncable(&mutation.model) else {
                self.outbox.dequeue();
                continue;
            };

            let result = self.processor.mutate(&mutation, ctor.definition()).await;
            self.outbox.dequeue();

            match result {
                Ok(record) => {
                    self.hub.dispatch(HubEvent::OutboxMutationProcessed {
                        model: mutation.model.clone(),
                        element: record.clone(),
                    });
                    if let Err(err) = self.merge_confirmed(&ctor, &record).await {
                        tracing::warn!(model = %mutation.model, error = %err, "failed to merge confirmed record");
                    }
                }
                Err(err) => {
                    tracing::error!(
                        model = %mutation.model,
                        id = %mutation.model_id(),
                        error = %err,
                        "outbox mutation failed"
                    );
                    self.hub.dispatch(HubEvent::OutboxMutationFailed {
                        model: mutation.model.clone(),
                        element: mutation.element.to_json(),
                        error: err.to_string(),
                        error_type: processor::error_type_of(&err),
                    });
                }
            }
        }
    }

    async fn merge_confirmed(&self, ctor: &ModelConstructor, record: &Value) -> crate::Result<()> {
        if !record.is_object() {
            return Ok(());
        }
        let model: Model = ctor.from_remote(record)?;
        self.merger.merge(&self.storage, vec![model]).await?;
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("processor", &self.processor)
            .field("pending", &self.outbox.len())
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}
