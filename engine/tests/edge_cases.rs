//! Edge case tests for stash-engine
//!
//! These tests cover boundary conditions and unusual inputs.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use stash_engine::patch;
use stash_engine::storage::{InMemoryAdapter, Pagination};
use stash_engine::{
    DataStore, FieldDef, FieldType, ModelConstructor, ModelDefinition, NonModelDefinition, Patch,
    Predicate, Registry, Schema,
};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn create_test_schema() -> Schema {
    Schema::new("1")
        .with_non_model(NonModelDefinition::new(
            "Settings",
            vec![
                FieldDef::required("theme", FieldType::String),
                FieldDef::optional("raw", FieldType::AWSJSON),
            ],
        ))
        .with_model(ModelDefinition::new(
            "Item",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("count", FieldType::Int),
                FieldDef::optional("ratio", FieldType::Float),
                FieldDef::optional("data", FieldType::AWSJSON),
                FieldDef::optional("settings", FieldType::NonModel("Settings".into())),
                FieldDef::optional("tags", FieldType::String).array(true),
            ],
        ))
}

fn items() -> ModelConstructor {
    Registry::from_schema(create_test_schema())
        .unwrap()
        .model("Item")
        .unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[test]
fn empty_string_fields() {
    let item = items().create(json!({"name": ""})).unwrap();
    assert_eq!(item.get_str("name"), Some(""));
}

#[test]
fn unicode_strings() {
    let ctor = items();
    let names = [
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Ω≈ç√∫",
        "Hello\nWorld\tTab",
        "Null\0Test",
    ];

    for name in names {
        let item = ctor.create(json!({"name": name})).unwrap();
        assert_eq!(item.get_str("name"), Some(name), "Failed for: {}", name);
    }
}

#[test]
fn very_long_strings() {
    let long = "x".repeat(1_000_000);
    let item = items().create(json!({"name": long})).unwrap();
    assert_eq!(item.get_str("name").map(str::len), Some(1_000_000));
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[test]
fn integer_boundaries() {
    let ctor = items();
    for count in [json!(i64::MIN), json!(i64::MAX), json!(u64::MAX), json!(0)] {
        assert!(ctor.create(json!({"name": "n", "count": count})).is_ok());
    }
}

#[test]
fn fractional_int_is_a_format_error() {
    let err = items()
        .create(json!({"name": "n", "count": 1.5}))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Field count should be of type Int, validation failed. 1.5"
    );

    // any number satisfies Float
    assert!(items().create(json!({"name": "n", "ratio": 3})).is_ok());
}

#[test]
fn string_for_number_is_a_type_error() {
    let err = items()
        .create(json!({"name": "n", "count": "3"}))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Field count should be of type number, string received. 3"
    );
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[test]
fn deeply_nested_aws_json() {
    let mut nested = json!("leaf");
    for _ in 0..50 {
        nested = json!({ "inner": nested });
    }
    let data = serde_json::to_string(&nested).unwrap();

    let item = items().create(json!({"name": "deep", "data": data})).unwrap();
    assert_eq!(item.get_str("data"), Some(data.as_str()));
}

#[test]
fn malformed_aws_json() {
    let err = items()
        .create(json!({"name": "n", "data": "{not json"}))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "Field data should be of type AWSJSON, validation failed. {not json"
    );
}

#[test]
fn nested_non_model_is_validated() {
    let ctor = items();
    assert!(ctor
        .create(json!({"name": "n", "settings": {"theme": "dark", "raw": "[1, 2]"}}))
        .is_ok());

    let err = ctor
        .create(json!({"name": "n", "settings": {"raw": "null"}}))
        .unwrap_err();
    assert_eq!(err.to_string(), "Field theme is required");
}

#[test]
fn arrays_with_nulls() {
    let ctor = items();
    assert!(ctor
        .create(json!({"name": "n", "tags": ["a", null, "b"]}))
        .is_ok());
    assert!(ctor.create(json!({"name": "n", "tags": []})).is_ok());

    let err = ctor
        .create(json!({"name": "n", "tags": ["a", 1]}))
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "All elements in the tags array should be of type string | null | undefined, [string,number] received. a,1"
    );
}

// ============================================================================
// Copy Edge Cases
// ============================================================================

#[test]
fn copy_without_changes_has_no_patches() {
    let ctor = items();
    let item = ctor.create(json!({"name": "same"})).unwrap();
    let (copy, patches) = ctor.copy_of(&item, |_| {}).unwrap();

    assert!(patches.is_empty());
    assert!(copy.patches().is_empty());
    assert_eq!(copy, item);
}

#[test]
fn setting_null_on_missing_field_is_not_a_change() {
    let ctor = items();
    let item = ctor.create(json!({"name": "n"})).unwrap();
    let (_, patches) = ctor
        .copy_of(&item, |d| {
            d.set("count", Value::Null);
        })
        .unwrap();
    assert!(patches.is_empty());
}

#[test]
fn unsetting_a_field_removes_it() {
    let ctor = items();
    let item = ctor.create(json!({"name": "n", "count": 2})).unwrap();
    let (copy, patches) = ctor
        .copy_of(&item, |d| {
            d.unset("count");
        })
        .unwrap();

    assert_eq!(patches, vec![Patch::remove("count")]);
    assert!(copy.get("count").is_none());
}

#[test]
fn invalid_edit_fails_the_copy() {
    let ctor = items();
    let item = ctor.create(json!({"name": "n"})).unwrap();
    let err = ctor
        .copy_of(&item, |d| {
            d.set("name", Value::Null);
        })
        .unwrap_err();
    assert_eq!(err.to_string(), "Field name is required");
}

// ============================================================================
// Storage Edge Cases
// ============================================================================

async fn started_store() -> (DataStore, ModelConstructor) {
    init_tracing();
    let store = DataStore::new(Arc::new(InMemoryAdapter::new()));
    let registry = store.init_schema(create_test_schema()).unwrap();
    store.start().await.unwrap();
    (store, registry.model("Item").unwrap())
}

#[tokio::test]
async fn query_on_empty_store() {
    let (store, ctor) = started_store().await;

    assert!(store.query(&ctor, None, Pagination::new()).await.unwrap().is_empty());
    assert!(store.query_by_id(&ctor, "missing").await.unwrap().is_none());
    assert!(store
        .delete(Some(ctor.clone().into()), Some(Predicate::All.into()))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn page_past_the_end_is_empty() {
    let (store, ctor) = started_store().await;
    for i in 0..3 {
        store
            .save(&ctor.create(json!({"name": format!("n{i}")})).unwrap())
            .await
            .unwrap();
    }

    let page = Pagination::new().page(5).limit(2);
    assert!(store.query(&ctor, None, page).await.unwrap().is_empty());

    let last = Pagination::new().page(1).limit(2);
    assert_eq!(store.query(&ctor, None, last).await.unwrap().len(), 1);
}

#[tokio::test]
async fn rapid_updates_same_record() {
    let (store, ctor) = started_store().await;
    let mut item = ctor.create(json!({"name": "v0", "count": 0})).unwrap();
    store.save(&item).await.unwrap();

    for i in 1..=100 {
        let (next, _) = ctor
            .copy_of(&item, |d| {
                d.set("count", i);
            })
            .unwrap();
        store.save(&next).await.unwrap();
        item = next;
    }

    let stored = store.query_by_id(&ctor, item.id()).await.unwrap().unwrap();
    assert_eq!(stored.get("count"), Some(&json!(100)));
    assert_eq!(item.patches(), &[Patch::replace("count", json!(100))]);
}

#[tokio::test]
async fn predicate_on_missing_field_matches_nothing() {
    let (store, ctor) = started_store().await;
    store
        .save(&ctor.create(json!({"name": "no count"})).unwrap())
        .await
        .unwrap();

    let found = store
        .query(&ctor, Some(Predicate::field("count").gt(0)), Pagination::new())
        .await
        .unwrap();
    assert!(found.is_empty());
}

// ============================================================================
// Properties
// ============================================================================

fn int_map() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-e]", any::<i64>(), 0..5)
        .prop_map(|m| m.into_iter().map(|(k, v)| (k, json!(v))).collect())
}

proptest! {
    #[test]
    fn prop_copies_keep_identity(names in prop::collection::vec("\\PC*", 1..10)) {
        let ctor = items();
        let original = ctor.create(json!({"name": "start"})).unwrap();
        let mut current = original.clone();

        for name in &names {
            let (next, _) = ctor.copy_of(&current, |d| { d.set("name", name.as_str()); }).unwrap();
            prop_assert_eq!(next.id(), original.id());
            current = next;
        }

        let last = names.last().unwrap();
        if names.iter().all(|n| n == "start") {
            prop_assert!(current.patches().is_empty());
        } else {
            prop_assert_eq!(current.patches(), &[Patch::replace("name", json!(last))]);
        }
    }

    #[test]
    fn prop_diff_applies_cleanly(old in int_map(), new in int_map()) {
        let mut fields = old.clone();
        patch::apply(&mut fields, &patch::diff(&old, &new));
        prop_assert_eq!(fields, new);
    }

    #[test]
    fn prop_not_inverts_match(count in any::<i64>(), bound in any::<i64>()) {
        let item = items().create(json!({"name": "n", "count": count})).unwrap();
        let lt = Predicate::field("count").lt(bound);
        prop_assert_eq!(Predicate::not(lt.clone()).matches(&item), !lt.matches(&item));
        prop_assert_eq!(lt.matches(&item), count < bound);
    }
}
