//! Mutation events and the feed that fans them out to subscribers.
//!
//! Every successful save or delete publishes one [`MutationEvent`]. Each
//! subscriber owns an unbounded channel, so a slow consumer only delays its
//! own delivery. A single [`MutationHook`] may also be installed; it runs
//! synchronously inside `publish`, before any subscriber is sent the event.

use crate::patch::Patch;
use crate::{Model, ModelName, Predicate};
use dashmap::DashMap;
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Kind of storage mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Made by the application
    Local,
    /// Applied from the remote service
    Remote,
}

/// One INSERT/UPDATE/DELETE applied to storage.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationEvent {
    pub op_type: OpType,
    pub model: ModelName,
    /// Full record after the mutation (before it, for deletes)
    pub element: Model,
    /// Field patches, for updates
    pub patches: Vec<Patch>,
    pub condition: Option<Predicate>,
    pub origin: Origin,
}

impl MutationEvent {
    pub fn new(op_type: OpType, element: Model, origin: Origin) -> Self {
        Self {
            op_type,
            model: element.model_name().to_string(),
            element,
            patches: Vec::new(),
            condition: None,
            origin,
        }
    }

    pub fn with_patches(mut self, patches: Vec<Patch>) -> Self {
        self.patches = patches;
        self
    }

    pub fn with_condition(mut self, condition: Option<Predicate>) -> Self {
        self.condition = condition;
        self
    }
}

/// Which events a subscriber wants.
#[derive(Debug, Clone, Default)]
pub struct MutationFilter {
    pub model: Option<ModelName>,
    pub id: Option<String>,
    pub predicate: Option<Predicate>,
}

impl MutationFilter {
    /// Every event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Every event for one model type.
    pub fn model(model: impl Into<ModelName>) -> Self {
        Self {
            model: Some(model.into()),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn accepts(&self, event: &MutationEvent) -> bool {
        self.model.as_ref().map_or(true, |m| *m == event.model)
            && self.id.as_ref().map_or(true, |id| id == event.element.id())
            && self
                .predicate
                .as_ref()
                .map_or(true, |p| p.matches(&event.element))
    }
}

struct Listener {
    filter: MutationFilter,
    sender: mpsc::UnboundedSender<MutationEvent>,
}

/// Callback run inline for every published event.
pub type MutationHook = Arc<dyn Fn(&MutationEvent) + Send + Sync>;

/// Multi-subscriber mutation broadcaster.
#[derive(Default)]
pub struct MutationFeed {
    listeners: DashMap<u64, Listener>,
    next_id: AtomicU64,
    hook: RwLock<Option<MutationHook>>,
}

impl MutationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a listener.
    pub fn subscribe(self: &Arc<Self>, filter: MutationFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners.insert(id, Listener { filter, sender });

        tracing::trace!(listener = id, "mutation listener registered");

        Subscription {
            id,
            feed: Arc::downgrade(self),
            receiver,
        }
    }

    /// Install the hook, replacing any previous one.
    pub fn set_hook(&self, hook: MutationHook) {
        *self.hook.write() = Some(hook);
    }

    pub fn clear_hook(&self) {
        self.hook.write().take();
    }

    /// Run the hook, then deliver an event to every interested listener.
    ///
    /// Returns the number of listeners that received it.
    pub fn publish(&self, event: &MutationEvent) -> usize {
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook(event);
        }

        let mut delivered = 0;
        let mut closed = Vec::new();

        for entry in self.listeners.iter() {
            let listener = entry.value();
            if !listener.filter.accepts(event) {
                continue;
            }
            if listener.sender.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        for id in closed {
            self.listeners.remove(&id);
        }

        tracing::trace!(
            model = %event.model,
            op = ?event.op_type,
            recipients = delivered,
            "published mutation"
        );

        delivered
    }

    fn remove(&self, id: u64) {
        if self.listeners.remove(&id).is_some() {
            tracing::trace!(listener = id, "mutation listener removed");
        }
    }

    /// Drop every listener and the hook; listener streams end.
    pub fn close(&self) {
        self.clear_hook();
        self.listeners.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl std::fmt::Debug for MutationFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationFeed")
            .field("listeners", &self.listeners.len())
            .field("hooked", &self.hook.read().is_some())
            .finish()
    }
}

/// A live listener on the feed. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    feed: Weak<MutationFeed>,
    receiver: mpsc::UnboundedReceiver<MutationEvent>,
}

impl Subscription {
    /// Next event, or `None` once unsubscribed or the feed closed.
    pub async fn recv(&mut self) -> Option<MutationEvent> {
        self.receiver.recv().await
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<MutationEvent> {
        self.receiver.try_recv().ok()
    }

    /// Stop delivery immediately.
    pub fn unsubscribe(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(self.id);
        }
        self.receiver.close();
    }
}

impl Stream for Subscription {
    type Item = MutationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.remove(self.id);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType, ModelDefinition, Registry, Schema};
    use futures::StreamExt;
    use serde_json::json;

    fn registry() -> Registry {
        let schema = Schema::new("1")
            .with_model(ModelDefinition::new(
                "Post",
                vec![FieldDef::required("title", FieldType::String)],
            ))
            .with_model(ModelDefinition::new(
                "Comment",
                vec![FieldDef::required("content", FieldType::String)],
            ));
        Registry::from_schema(schema).unwrap()
    }

    fn post(title: &str) -> Model {
        registry()
            .model("Post")
            .unwrap()
            .create(json!({"title": title}))
            .unwrap()
    }

    #[tokio::test]
    async fn fan_out_in_publish_order() {
        let feed = MutationFeed::new_shared();
        let mut a = feed.subscribe(MutationFilter::all());
        let mut b = feed.subscribe(MutationFilter::model("Post"));

        for title in ["one", "two"] {
            feed.publish(&MutationEvent::new(OpType::Insert, post(title), Origin::Local));
        }

        for sub in [&mut a, &mut b] {
            let first = sub.recv().await.unwrap();
            let second = sub.recv().await.unwrap();
            assert_eq!(first.element.get_str("title"), Some("one"));
            assert_eq!(second.element.get_str("title"), Some("two"));
        }
    }

    #[tokio::test]
    async fn filters_by_model_id_and_predicate() {
        let feed = MutationFeed::new_shared();
        let target = post("match me");

        let mut by_model = feed.subscribe(MutationFilter::model("Comment"));
        let mut by_id = feed.subscribe(MutationFilter::model("Post").with_id(target.id()));
        let mut by_predicate = feed.subscribe(
            MutationFilter::model("Post").with_predicate(Predicate::field("title").contains("match")),
        );

        feed.publish(&MutationEvent::new(OpType::Insert, post("other"), Origin::Local));
        feed.publish(&MutationEvent::new(OpType::Insert, target.clone(), Origin::Local));

        assert!(by_model.try_recv().is_none());
        assert_eq!(by_id.recv().await.unwrap().element.id(), target.id());
        assert_eq!(by_predicate.recv().await.unwrap().element.id(), target.id());
        assert!(by_predicate.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_and_unsubscribe_remove_listeners() {
        let feed = MutationFeed::new_shared();
        let sub = feed.subscribe(MutationFilter::all());
        let mut other = feed.subscribe(MutationFilter::all());
        assert_eq!(feed.listener_count(), 2);

        drop(sub);
        assert_eq!(feed.listener_count(), 1);

        other.unsubscribe();
        assert_eq!(feed.listener_count(), 0);
        assert_eq!(
            feed.publish(&MutationEvent::new(OpType::Insert, post("x"), Origin::Local)),
            0
        );
        assert!(other.recv().await.is_none());
    }

    #[test]
    fn hook_runs_before_listeners_until_cleared() {
        let feed = MutationFeed::new_shared();
        let mut sub = feed.subscribe(MutationFilter::all());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let log = seen.clone();
        feed.set_hook(Arc::new(move |event: &MutationEvent| {
            log.lock().push(event.element.get_str("title").map(str::to_string));
        }));

        feed.publish(&MutationEvent::new(OpType::Insert, post("hooked"), Origin::Local));
        assert_eq!(*seen.lock(), vec![Some("hooked".to_string())]);
        assert!(sub.try_recv().is_some());

        feed.close();
        feed.publish(&MutationEvent::new(OpType::Insert, post("after"), Origin::Local));
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn close_ends_streams() {
        let feed = MutationFeed::new_shared();
        let mut sub = feed.subscribe(MutationFilter::all());

        feed.publish(&MutationEvent::new(OpType::Delete, post("x"), Origin::Remote));
        feed.close();

        let events: Vec<_> = (&mut sub).collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].origin, Origin::Remote);
    }
}
