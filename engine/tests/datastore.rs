//! DataStore facade tests: lifecycle, usage errors, saves, deletes and queries.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use stash_engine::storage::{InMemoryAdapter, Pagination, StorageAdapter};
use stash_engine::{
    Association, Criteria, DataStore, DeleteTarget, Error, FieldDef, FieldType, ModelDefinition,
    MutationFilter, OpType, Patch, Predicate, Registry, Schema, Sort,
};
use std::sync::Arc;

fn create_test_schema() -> Schema {
    Schema::new("1")
        .with_model(ModelDefinition::new(
            "Post",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("rating", FieldType::Int),
            ],
        ))
        .with_model(ModelDefinition::new(
            "Model",
            vec![
                FieldDef::required("field1", FieldType::String),
                FieldDef::optional("field2", FieldType::String),
            ],
        ))
        .with_model(ModelDefinition::new(
            "Profile",
            vec![FieldDef::required("firstName", FieldType::String)],
        ))
        .with_model(ModelDefinition::new(
            "User",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("profileID", FieldType::ID),
                FieldDef::optional("profile", FieldType::Model("Profile".into())).with_association(
                    Association::HasOne {
                        associated_with: "id".into(),
                        target_name: Some("profileID".into()),
                    },
                ),
            ],
        ))
}

async fn started_store() -> (DataStore, Registry) {
    let store = DataStore::new(Arc::new(InMemoryAdapter::new()));
    let registry = store.init_schema(create_test_schema()).unwrap();
    store.start().await.unwrap();
    (store, registry)
}

async fn save_posts(store: &DataStore, registry: &Registry, titles: &[&str]) {
    let posts = registry.model("Post").unwrap();
    for (i, title) in titles.iter().enumerate() {
        let post = posts
            .create(json!({"title": title, "rating": i as i64}))
            .unwrap();
        store.save(&post).await.unwrap();
    }
}

fn titles(models: &[stash_engine::Model]) -> Vec<&str> {
    models.iter().filter_map(|m| m.get_str("title")).collect()
}

// ============================================================================
// Usage Errors
// ============================================================================

#[tokio::test]
async fn delete_usage_errors_are_verbatim() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();

    let err = store.delete(None, None).await.unwrap_err();
    assert_eq!(err.to_string(), "Model or Model Constructor required");

    let err = store
        .delete(Some(posts.clone().into()), None)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Id to delete or criteria required. Do you want to delete all? Pass Predicates.ALL"
    );

    let err = store
        .delete(
            Some(posts.clone().into()),
            Some(Predicate::and(Vec::<Predicate>::new()).into()),
        )
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Criteria required. Do you want to delete all? Pass Predicates.ALL"
    );

    let post = posts.create(json!({"title": "t"})).unwrap();
    let err = store
        .delete(Some(post.clone().into()), Some(Criteria::Id("x".into())))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid criteria");

    let err = store
        .delete(
            Some(posts.into()),
            Some(Predicate::field("nope").eq("x").into()),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Invalid criteria");
}

#[tokio::test]
async fn foreign_models_and_constructors_are_rejected() {
    let (store, _registry) = started_store().await;

    let foreign = Registry::from_schema(Schema::new("9").with_model(ModelDefinition::new(
        "Ghost",
        vec![FieldDef::required("name", FieldType::String)],
    )))
    .unwrap();
    let ghost = foreign
        .model("Ghost")
        .unwrap()
        .create(json!({"name": "boo"}))
        .unwrap();

    let err = store
        .delete(Some(DeleteTarget::Instance(ghost.clone())), None)
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Object is not an instance of a valid model");

    let err = store.save(&ghost).await.unwrap_err();
    assert_eq!(err, Error::NotAModel);

    // same name, different registry
    let other = Registry::from_schema(create_test_schema()).unwrap();
    let err = store
        .query(&other.model("Post").unwrap(), None, Pagination::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Constructor is not for a valid model");
}

#[tokio::test]
async fn pagination_errors_are_verbatim() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();

    let err = store
        .query(&posts, None, Pagination::new().page(0))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Limit is required when requesting a page");

    let err = store
        .query(&posts, None, Pagination::new().page(-1).limit(10))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Page can't be negative");

    let err = store
        .query(&posts, None, Pagination::new().limit(-1))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Limit can't be negative");
}

#[tokio::test]
async fn observe_criteria_requires_model() {
    let (store, _registry) = started_store().await;
    let err = store
        .observe(None, Some(Criteria::Id("abc".into())))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Cannot provide criteria without a modelConstructor"
    );
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn stop_rejects_operations_until_restart() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    save_posts(&store, &registry, &["kept"]).await;

    let mut events = store.observe(None, None).unwrap();
    store.stop().await;

    assert!(events.recv().await.is_none());
    let err = store
        .query(&posts, None, Pagination::new())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Schema is not initialized");

    store.start().await.unwrap();
    let found = store.query(&posts, None, Pagination::new()).await.unwrap();
    assert_eq!(titles(&found), vec!["kept"]);
}

#[tokio::test]
async fn clear_wipes_data_and_stops() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    save_posts(&store, &registry, &["a", "b"]).await;

    store.clear().await.unwrap();
    assert!(!store.is_running());

    store.start().await.unwrap();
    assert!(store
        .query(&posts, None, Pagination::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn schema_version_change_wipes_local_data() {
    let adapter = Arc::new(InMemoryAdapter::new());

    let store = DataStore::new(adapter.clone());
    let registry = store.init_schema(create_test_schema()).unwrap();
    store.start().await.unwrap();
    save_posts(&store, &registry, &["old"]).await;
    store.stop().await;

    let mut schema = create_test_schema();
    schema.version = "2".into();
    let store = DataStore::new(adapter);
    let registry = store.init_schema(schema).unwrap();
    store.start().await.unwrap();

    let found = store
        .query(&registry.model("Post").unwrap(), None, Pagination::new())
        .await
        .unwrap();
    assert!(found.is_empty());
}

#[tokio::test]
async fn persisted_store_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    {
        let store = DataStore::new(Arc::new(InMemoryAdapter::with_persistence(&path)));
        let registry = store.init_schema(create_test_schema()).unwrap();
        store.start().await.unwrap();
        save_posts(&store, &registry, &["one", "two"]).await;
        store.stop().await;
    }

    let store = DataStore::new(Arc::new(InMemoryAdapter::with_persistence(&path)));
    let registry = store.init_schema(create_test_schema()).unwrap();
    store.start().await.unwrap();
    let found = store
        .query(&registry.model("Post").unwrap(), None, Pagination::new())
        .await
        .unwrap();
    assert_eq!(titles(&found), vec!["one", "two"]);
}

// ============================================================================
// Saves and Patches
// ============================================================================

#[tokio::test]
async fn patches_accumulate_across_copies() {
    let (store, registry) = started_store().await;
    let ctor = registry.model("Model").unwrap();
    let mut events = store.observe(Some(&ctor), None).unwrap();

    let m1 = ctor
        .create(json!({"field1": "a", "field2": "b"}))
        .unwrap();
    store.save(&m1).await.unwrap();

    let (m2, _) = ctor
        .copy_of(&m1, |d| {
            d.set("field1", "x");
        })
        .unwrap();
    store.save(&m2).await.unwrap();

    let (m3, own) = ctor
        .copy_of(&m2, |d| {
            d.set("field2", "y");
        })
        .unwrap();
    assert_eq!(own, vec![Patch::replace("field2", json!("y"))]);
    store.save(&m3).await.unwrap();

    assert_eq!(events.recv().await.unwrap().op_type, OpType::Insert);
    assert_eq!(events.recv().await.unwrap().op_type, OpType::Update);
    let last = events.recv().await.unwrap();
    assert_eq!(last.op_type, OpType::Update);
    assert_eq!(
        last.patches,
        vec![
            Patch::replace("field1", json!("x")),
            Patch::replace("field2", json!("y")),
        ]
    );
}

#[tokio::test]
async fn conditional_save() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    let post = posts.create(json!({"title": "draft", "rating": 1})).unwrap();
    store.save(&post).await.unwrap();

    let (edited, _) = posts
        .copy_of(&post, |d| {
            d.set("rating", 2);
        })
        .unwrap();

    let err = store
        .save_with_condition(&edited, Some(&Predicate::field("title").eq("published")))
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "Conditional update failed");

    store
        .save_with_condition(&edited, Some(&Predicate::field("title").eq("draft")))
        .await
        .unwrap();
    let stored = store.query_by_id(&posts, post.id()).await.unwrap().unwrap();
    assert_eq!(stored.get("rating"), Some(&json!(2)));
}

// ============================================================================
// Relations
// ============================================================================

#[tokio::test]
async fn deleting_owner_cascades_to_has_one() {
    let (store, registry) = started_store().await;
    let users = registry.model("User").unwrap();
    let profiles = registry.model("Profile").unwrap();

    let profile = profiles.create(json!({"firstName": "Rick"})).unwrap();
    let user = users
        .build(|d| {
            d.set("name", "Rick Sanchez");
            d.set_related("profile", &profile);
        })
        .unwrap();

    // the profile is a dependent save
    store.save(&user).await.unwrap();
    let stored = store.query_by_id(&users, user.id()).await.unwrap().unwrap();
    assert_eq!(stored.get_str("profileID"), Some(profile.id()));
    assert_eq!(
        stored.related("profile").and_then(|p| p.get_str("firstName")),
        Some("Rick")
    );

    let deleted = store
        .delete(Some(user.clone().into()), None)
        .await
        .unwrap();
    assert_eq!(deleted.len(), 2);
    assert_eq!(deleted[0].id(), user.id());
    assert_eq!(deleted[1].id(), profile.id());

    assert!(store.query_by_id(&profiles, profile.id()).await.unwrap().is_none());
    assert!(store
        .query(&profiles, None, Pagination::new())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn delete_by_type_and_predicate() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    save_posts(&store, &registry, &["keep", "drop a", "drop b"]).await;

    let deleted = store
        .delete(
            Some(posts.clone().into()),
            Some(Predicate::field("title").begins_with("drop").into()),
        )
        .await
        .unwrap();
    assert_eq!(deleted.len(), 2);

    let left = store.query(&posts, None, Pagination::new()).await.unwrap();
    assert_eq!(titles(&left), vec!["keep"]);

    let deleted = store
        .delete(Some(posts.clone().into()), Some(Predicate::All.into()))
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
}

#[tokio::test]
async fn observe_by_id_only_sees_that_record() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    let watched = posts.create(json!({"title": "watched"})).unwrap();
    let other = posts.create(json!({"title": "other"})).unwrap();

    let mut events = store
        .observe(Some(&posts), Some(watched.id().into()))
        .unwrap();
    store.save(&other).await.unwrap();
    store.save(&watched).await.unwrap();

    let event = events.recv().await.unwrap();
    assert_eq!(event.element.id(), watched.id());
    assert!(events.try_recv().is_none());
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn pages_follow_insertion_order() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    save_posts(&store, &registry, &["p0", "p1", "p2", "p3", "p4"]).await;

    let page = store
        .query(&posts, None, Pagination::new().page(1).limit(2))
        .await
        .unwrap();
    assert_eq!(titles(&page), vec!["p2", "p3"]);

    let sorted = store
        .query(
            &posts,
            Some(Predicate::field("rating").ge(2)),
            Pagination::new().sort(Sort::new().desc("rating")),
        )
        .await
        .unwrap();
    assert_eq!(titles(&sorted), vec!["p4", "p3", "p2"]);
}

/// Adapter that records which read paths a query takes.
struct RecordingAdapter {
    inner: InMemoryAdapter,
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingAdapter {
    fn new() -> Self {
        Self {
            inner: InMemoryAdapter::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<&'static str> {
        std::mem::take(&mut *self.calls.lock())
    }
}

#[async_trait]
impl StorageAdapter for RecordingAdapter {
    async fn init(&self) -> stash_engine::Result<()> {
        self.inner.init().await
    }

    async fn get(&self, model: &str, id: &str) -> stash_engine::Result<Option<Value>> {
        self.calls.lock().push("get");
        self.inner.get(model, id).await
    }

    async fn get_all(&self, model: &str) -> stash_engine::Result<Vec<Value>> {
        self.calls.lock().push("get_all");
        self.inner.get_all(model).await
    }

    async fn get_page(&self, model: &str, page: usize, limit: usize) -> stash_engine::Result<Vec<Value>> {
        self.calls.lock().push("get_page");
        self.inner.get_page(model, page, limit).await
    }

    async fn put(&self, model: &str, id: &str, record: Value) -> stash_engine::Result<()> {
        self.inner.put(model, id, record).await
    }

    async fn remove(&self, model: &str, id: &str) -> stash_engine::Result<bool> {
        self.inner.remove(model, id).await
    }

    async fn clear(&self) -> stash_engine::Result<()> {
        self.inner.clear().await
    }
}

#[tokio::test]
async fn query_strategy_selection() {
    let adapter = Arc::new(RecordingAdapter::new());
    let store = DataStore::new(adapter.clone());
    let registry = store.init_schema(create_test_schema()).unwrap();
    store.start().await.unwrap();
    let posts = registry.model("Post").unwrap();

    let post = posts.create(json!({"title": "only"})).unwrap();
    store.save(&post).await.unwrap();
    adapter.take();

    store
        .query(&posts, Some(Predicate::field("id").eq(post.id())), Pagination::new())
        .await
        .unwrap();
    assert_eq!(adapter.take(), vec!["get"]);

    store
        .query(&posts, None, Pagination::new().limit(10))
        .await
        .unwrap();
    assert_eq!(adapter.take(), vec!["get_page"]);

    store
        .query(&posts, Some(Predicate::field("title").eq("only")), Pagination::new())
        .await
        .unwrap();
    assert_eq!(adapter.take(), vec!["get_all"]);

    store.query(&posts, None, Pagination::new()).await.unwrap();
    assert_eq!(adapter.take(), vec!["get_all"]);
}

#[tokio::test]
async fn feed_filter_by_model() {
    let (store, registry) = started_store().await;
    let posts = registry.model("Post").unwrap();
    let users = registry.model("User").unwrap();

    let mut post_events = store.observe(Some(&posts), None).unwrap();
    store
        .save(&users.create(json!({"name": "n"})).unwrap())
        .await
        .unwrap();
    store
        .save(&posts.create(json!({"title": "t"})).unwrap())
        .await
        .unwrap();

    let event = post_events.recv().await.unwrap();
    assert_eq!(event.model, "Post");
    assert!(MutationFilter::model("Post").accepts(&event));
}
