//! Edge case tests for trove-engine
//!
//! These tests cover boundary conditions, unusual inputs and the store-level
//! guarantees every mutation must honor.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use trove_engine::{
    AuditOperation, CollectionSchema, Error, FieldDef, FieldType, Filter, GpsLocation,
    LocalStore, MemoryStorage, MutationContext, QueueOperation, Schema, StoreOptions, SyncStatus,
};

fn create_test_schema() -> Schema {
    Schema::new(1).with_collection(
        CollectionSchema::new(
            "items",
            vec![
                FieldDef::required("name", FieldType::String),
                FieldDef::optional("count", FieldType::Int),
                FieldDef::optional("data", FieldType::Json),
                FieldDef::optional("group", FieldType::String),
            ],
        )
        .with_index("group"),
    )
}

async fn open_store() -> LocalStore {
    LocalStore::open(
        Arc::new(MemoryStorage::new()),
        create_test_schema(),
        StoreOptions::default(),
    )
    .await
    .unwrap()
}

// ============================================================================
// String Edge Cases
// ============================================================================

#[tokio::test]
async fn empty_string_fields() {
    let store = open_store().await;

    let record = store.create("items", json!({"name": ""})).await.unwrap();

    let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
    assert_eq!(stored.field("name"), Some(&json!("")));
}

#[tokio::test]
async fn unicode_strings() {
    let store = open_store().await;

    let unicode_names = vec![
        "日本語テスト",
        "Привет мир",
        "مرحبا بالعالم",
        "🎉🚀💯",
        "Ω≈ç√∫",
        "Hello\nWorld\tTab",
    ];

    for name in unicode_names {
        let record = store.create("items", json!({"name": name})).await.unwrap();
        let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
        assert_eq!(stored.field("name"), Some(&json!(name)));
        assert!(stored.integrity_mismatch().is_none());
    }
}

#[tokio::test]
async fn very_long_strings() {
    let store = open_store().await;
    let long = "x".repeat(1024 * 1024);

    let record = store.create("items", json!({"name": long})).await.unwrap();

    let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
    assert_eq!(stored.field("name").unwrap().as_str().unwrap().len(), 1024 * 1024);
}

// ============================================================================
// Numeric Edge Cases
// ============================================================================

#[tokio::test]
async fn integer_boundaries() {
    let store = open_store().await;

    for value in [i64::MIN, i64::MAX, 0, -1, 1] {
        let record = store
            .create("items", json!({"name": "test", "count": value}))
            .await
            .unwrap();
        let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
        assert_eq!(stored.field("count"), Some(&json!(value)));
    }
}

#[tokio::test]
async fn float_for_int_field_is_rejected() {
    let store = open_store().await;

    let result = store
        .create("items", json!({"name": "test", "count": 1.5}))
        .await;
    assert!(matches!(result, Err(Error::TypeMismatch { field, .. }) if field == "count"));
    assert_eq!(store.queue().stats().await.unwrap().total(), 0);
}

// ============================================================================
// JSON Edge Cases
// ============================================================================

#[tokio::test]
async fn deeply_nested_json() {
    let store = open_store().await;

    let mut nested = json!({"value": "leaf"});
    for _ in 0..50 {
        nested = json!({"nested": nested});
    }

    let record = store
        .create("items", json!({"name": "test", "data": nested.clone()}))
        .await
        .unwrap();
    let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
    assert_eq!(stored.field("data"), Some(&nested));
}

#[tokio::test]
async fn json_with_all_types() {
    let store = open_store().await;

    let complex_json = json!({
        "string": "hello",
        "number": 42,
        "float": 3.14159,
        "bool_true": true,
        "bool_false": false,
        "null": null,
        "array": [1, 2, 3, "mixed", true, null],
        "object": {"a": 1, "b": "two"},
        "empty_array": [],
        "empty_object": {},
    });

    let record = store
        .create("items", json!({"name": "test", "data": complex_json.clone()}))
        .await
        .unwrap();

    let stored = store.get_by_id("items", &record.id).await.unwrap().unwrap();
    assert_eq!(stored.field("data"), Some(&complex_json));
}

#[tokio::test]
async fn non_object_payloads_are_rejected() {
    let store = open_store().await;

    for payload in [json!(null), json!("text"), json!([1, 2]), json!(42)] {
        let result = store.create("items", payload).await;
        assert!(matches!(result, Err(Error::InvalidPayload(_))));
    }
}

#[tokio::test]
async fn base_fields_in_payload_are_ignored() {
    let store = open_store().await;

    let record = store
        .create(
            "items",
            json!({"name": "test", "id": "mine", "version": 99, "syncStatus": "synced"}),
        )
        .await
        .unwrap();

    assert_ne!(record.id, "mine");
    assert_eq!(record.version, 1);
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert!(record.field("id").is_none());
}

// ============================================================================
// Store Guarantees
// ============================================================================

#[tokio::test]
async fn every_mutation_has_one_queue_and_one_audit_entry() {
    let store = open_store().await;

    let record = store.create("items", json!({"name": "a"})).await.unwrap();
    store
        .update("items", &record.id, json!({"name": "b"}))
        .await
        .unwrap();
    store.delete("items", &record.id).await.unwrap();

    let queue: Vec<_> = store
        .queue()
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .map(|item| (item.operation, item.record_id))
        .collect();
    assert_eq!(
        queue,
        vec![
            (QueueOperation::Create, record.id.clone()),
            (QueueOperation::Update, record.id.clone()),
            (QueueOperation::Delete, record.id.clone()),
        ]
    );

    let audit: Vec<_> = store
        .audit()
        .entries_for("items", &record.id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.operation)
        .collect();
    assert_eq!(
        audit,
        vec![
            AuditOperation::Create,
            AuditOperation::Update,
            AuditOperation::Delete
        ]
    );
}

#[tokio::test]
async fn delete_twice_produces_one_queue_entry() {
    let store = open_store().await;
    let record = store.create("items", json!({"name": "a"})).await.unwrap();

    assert!(store.delete("items", &record.id).await.unwrap().is_some());
    assert!(store.delete("items", &record.id).await.unwrap().is_none());

    let deletes = store
        .queue()
        .list_all()
        .await
        .unwrap()
        .into_iter()
        .filter(|item| item.operation == QueueOperation::Delete)
        .count();
    assert_eq!(deletes, 1);
}

#[tokio::test]
async fn audit_carries_mutation_context() {
    let store = open_store().await;
    let ctx = MutationContext::new()
        .with_user("enumerator-7")
        .with_reason("typo in name")
        .with_gps(GpsLocation::new(-12.97, 28.63).with_accuracy(4.5));

    let record = store
        .create_with("items", json!({"name": "a"}), &ctx)
        .await
        .unwrap();

    let entries = store.audit().entries_for("items", &record.id).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].user_id.as_deref(), Some("enumerator-7"));
    assert_eq!(entries[0].reason.as_deref(), Some("typo in name"));
    assert!(entries[0].gps_location.is_some());
    assert!(entries[0].old_value.is_none());
    assert!(entries[0].new_value.is_some());
    assert!(entries[0].is_intact());
}

#[tokio::test]
async fn filter_by_indexed_field() {
    let store = open_store().await;
    for (name, group) in [("a", "north"), ("b", "south"), ("c", "north")] {
        store
            .create("items", json!({"name": name, "group": group}))
            .await
            .unwrap();
    }

    let north = store
        .get_all("items", Some(&Filter::eq("group", "north")))
        .await
        .unwrap();
    let mut names: Vec<_> = north
        .iter()
        .map(|r| r.field("name").unwrap().as_str().unwrap())
        .collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "c"]);

    let result = store
        .get_all("items", Some(&Filter::eq("name", "a")))
        .await;
    assert!(matches!(result, Err(Error::IndexNotFound { .. })));
}

#[tokio::test]
async fn schema_with_many_collections() {
    let mut schema = Schema::new(1);
    for i in 0..100 {
        schema.add_collection(CollectionSchema::new(
            format!("collection_{i}"),
            vec![FieldDef::required("label", FieldType::String)],
        ));
    }
    let store = LocalStore::open(Arc::new(MemoryStorage::new()), schema, StoreOptions::default())
        .await
        .unwrap();

    for i in 0..100 {
        store
            .create(&format!("collection_{i}"), json!({"label": format!("l{i}")}))
            .await
            .unwrap();
    }
    for i in 0..100 {
        let records = store.get_all(&format!("collection_{i}"), None).await.unwrap();
        assert_eq!(records.len(), 1);
    }
    assert_eq!(store.queue().pending_count().await.unwrap(), 100);
}

#[tokio::test]
async fn many_pending_entries_drain_in_creation_order() {
    let store = open_store().await;
    for i in 0..200 {
        store
            .create("items", json!({"name": format!("item_{i}")}))
            .await
            .unwrap();
    }

    let pending = store.queue().list_pending().await.unwrap();
    assert_eq!(pending.len(), 200);
    assert!(pending.windows(2).all(|w| w[0].sequence < w[1].sequence));

    for item in pending.iter().take(100) {
        store.queue().mark_synced(&item.id).await.unwrap();
    }
    assert_eq!(store.queue().pending_count().await.unwrap(), 100);
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn version_grows_by_one_per_update(names in prop::collection::vec("[a-z]{1,12}", 0..20)) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(async {
            let store = open_store().await;
            let record = store.create("items", json!({"name": "start"})).await.unwrap();

            let mut version = record.version;
            for name in &names {
                version = store
                    .update("items", &record.id, json!({"name": name}))
                    .await
                    .unwrap()
                    .version;
            }

            assert_eq!(version, 1 + names.len() as u64);
            assert_eq!(
                store.queue().list_all().await.unwrap().len(),
                1 + names.len()
            );
        });
    }
}
