//! Live observation of storage.
//!
//! [`observe`] forwards raw mutation events. [`observe_query`] keeps a
//! cumulative, filtered and sorted result set per subscription and emits a
//! [`Snapshot`] whenever it changes.
//!
//! A query subscription registers on the mutation feed before it reads its
//! baseline, so events racing the baseline read are replayed on top of it.
//! Replaying is idempotent: inserts and updates replace by id, deletes of
//! missing records are ignored.

use crate::mutation::{MutationEvent, MutationFeed, MutationFilter, OpType, Subscription};
use crate::storage::{Pagination, Storage};
use crate::{Model, ModelConstructor, ModelName, Predicate, Sort};
use dashmap::DashMap;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Per-model flag set once the initial remote sync of that model is merged.
#[derive(Debug, Default)]
pub struct SyncStatus {
    models: DashMap<ModelName, watch::Sender<bool>>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_synced(&self, model: &str) {
        self.set(model, true);
    }

    pub fn mark_unsynced(&self, model: &str) {
        self.set(model, false);
    }

    fn set(&self, model: &str, synced: bool) {
        self.models
            .entry(model.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .send_replace(synced);
    }

    /// Unknown models are unsynced.
    pub fn is_synced(&self, model: &str) -> bool {
        self.models
            .get(model)
            .is_some_and(|sender| *sender.borrow())
    }

    pub fn watch(&self, model: &str) -> watch::Receiver<bool> {
        self.models
            .entry(model.to_string())
            .or_insert_with(|| watch::channel(false).0)
            .subscribe()
    }
}

/// Subscribe to raw mutation events.
pub fn observe(feed: &Arc<MutationFeed>, filter: MutationFilter) -> Subscription {
    feed.subscribe(filter)
}

/// Options of [`observe_query`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObserveQueryOptions {
    pub sort: Option<Sort>,
    /// While unsynced, emit after this many applied changes
    pub sync_page_size: usize,
    /// While unsynced, emit pending changes at least this often
    pub throttle: Duration,
}

impl Default for ObserveQueryOptions {
    fn default() -> Self {
        Self {
            sort: None,
            sync_page_size: 1000,
            throttle: Duration::from_secs(2),
        }
    }
}

impl ObserveQueryOptions {
    pub fn with_sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    pub fn with_sync_page_size(mut self, size: usize) -> Self {
        self.sync_page_size = size;
        self
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }
}

/// Cumulative result of a query subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub items: Vec<Model>,
    pub is_synced: bool,
}

/// Stream of [`Snapshot`]s. Dropping it stops the subscription.
pub struct QuerySubscription {
    receiver: mpsc::UnboundedReceiver<Snapshot>,
    task: JoinHandle<()>,
}

impl QuerySubscription {
    /// Next snapshot, or `None` once the subscription ended.
    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) {
        self.task.abort();
        self.receiver.close();
    }
}

impl Stream for QuerySubscription {
    type Item = Snapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for QuerySubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySubscription")
            .field("finished", &self.task.is_finished())
            .finish()
    }
}

/// Start a query subscription.
///
/// When the model is not yet synced the first snapshot is empty, followed by
/// the local baseline. A synced model starts with the baseline.
pub fn observe_query(
    storage: Arc<Storage>,
    status: &SyncStatus,
    ctor: ModelConstructor,
    predicate: Option<Predicate>,
    options: ObserveQueryOptions,
) -> QuerySubscription {
    let events = storage.feed().subscribe(MutationFilter::model(ctor.name()));
    let synced = status.watch(ctor.name());
    let (sender, receiver) = mpsc::unbounded_channel();

    let query = ObservedQuery {
        storage,
        ctor,
        predicate: predicate.filter(|p| !p.is_all()),
        options,
        items: Vec::new(),
        sender,
    };
    let task = tokio::spawn(query.run(events, synced));

    QuerySubscription { receiver, task }
}

struct ObservedQuery {
    storage: Arc<Storage>,
    ctor: ModelConstructor,
    predicate: Option<Predicate>,
    options: ObserveQueryOptions,
    items: Vec<Model>,
    sender: mpsc::UnboundedSender<Snapshot>,
}

impl ObservedQuery {
    async fn run(mut self, mut events: Subscription, mut synced: watch::Receiver<bool>) {
        let mut is_synced = *synced.borrow_and_update();
        let mut status_open = true;

        if !is_synced && !self.emit(false) {
            return;
        }

        match self
            .storage
            .query(&self.ctor, self.predicate.as_ref(), &Pagination::new())
            .await
        {
            Ok(baseline) => self.items = baseline,
            Err(err) => {
                tracing::warn!(model = %self.ctor.name(), error = %err, "observe_query baseline read failed");
                return;
            }
        }
        self.sort();
        if !self.emit(is_synced) {
            return;
        }

        let throttle = self.options.throttle.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(Instant::now() + throttle, throttle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pending = 0usize;

        loop {
            tokio::select! {
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !self.apply(event).await {
                        continue;
                    }
                    if is_synced {
                        if !self.emit(true) {
                            break;
                        }
                    } else {
                        pending += 1;
                        if pending >= self.options.sync_page_size.max(1) {
                            pending = 0;
                            if !self.emit(false) {
                                break;
                            }
                        }
                    }
                }
                changed = synced.changed(), if status_open && !is_synced => {
                    if changed.is_err() {
                        status_open = false;
                        continue;
                    }
                    is_synced = *synced.borrow_and_update();
                    if is_synced {
                        pending = 0;
                        if !self.emit(true) {
                            break;
                        }
                    }
                }
                _ = ticker.tick(), if !is_synced && pending > 0 => {
                    pending = 0;
                    if !self.emit(false) {
                        break;
                    }
                }
                _ = self.sender.closed() => break,
            }
        }

        tracing::trace!(model = %self.ctor.name(), "observe_query finished");
    }

    /// Apply one event. Returns whether the result set changed.
    async fn apply(&mut self, event: MutationEvent) -> bool {
        let id = event.element.id().to_string();
        let position = self.items.iter().position(|m| m.id() == id);

        let matches = event.op_type != OpType::Delete
            && self
                .predicate
                .as_ref()
                .map_or(true, |p| p.matches(&event.element));

        if !matches {
            return match position {
                Some(index) => {
                    self.items.remove(index);
                    true
                }
                None => false,
            };
        }

        let element = match self.storage.hydrate(event.element.clone()).await {
            Ok(model) => model,
            Err(err) => {
                tracing::debug!(model = %event.model, error = %err, "hydration failed, using raw element");
                event.element
            }
        };

        match position {
            Some(index) => self.items[index] = element,
            None => self.items.push(element),
        }
        self.sort();
        true
    }

    fn sort(&mut self) {
        if let Some(sort) = &self.options.sort {
            sort.apply(&mut self.items);
        }
    }

    /// Returns false once the receiver is gone.
    fn emit(&self, is_synced: bool) -> bool {
        self.sender
            .send(Snapshot {
                items: self.items.clone(),
                is_synced,
            })
            .is_ok()
    }
}
