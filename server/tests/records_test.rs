//! Integration tests for the record API.
//!
//! Requests go through the full router with an in-memory record store.
//! The last section runs a real `SyncEngine` against a listening server.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use serde_json::{json, Map, Value};
use tower::ServiceExt;
use trove_engine::{Record, FORCE_OVERRIDE_HEADER};
use trove_server::config::Config;
use trove_server::db::{MemoryRecords, RecordStore};
use trove_server::{router, AppState};

fn app_with(config: Config) -> (Router, Arc<MemoryRecords>) {
    let records = Arc::new(MemoryRecords::new());
    let app = router(AppState::new(records.clone(), config));
    (app, records)
}

fn app() -> (Router, Arc<MemoryRecords>) {
    app_with(Config::default())
}

fn household(id: &str, version: u64, code: &str) -> Value {
    let mut fields = Map::new();
    fields.insert("householdCode".into(), json!(code));
    let mut record = Record::new(id, fields, "device-1", "session-1", Utc::now());
    record.version = version;
    record.to_value().unwrap()
}

fn request(method: Method, uri: &str, body: Option<&Value>) -> Request<Body> {
    let builder = Request::builder().method(method).uri(uri);
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

// ============================================================================
// Health
// ============================================================================

#[tokio::test]
async fn health_reports_ok() {
    let (app, _) = app();
    let (status, body) = send(&app, request(Method::GET, "/health", None)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test]
async fn create_returns_201_and_synced_copy() {
    let (app, records) = app();
    let (status, body) = send(
        &app,
        request(Method::POST, "/api/households", Some(&household("h1", 1, "HH-001"))),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["syncStatus"], json!("synced"));
    assert_eq!(body["householdCode"], json!("HH-001"));
    assert_eq!(records.get("households", "h1").await.unwrap().unwrap().version, 1);

    let (status, listed) = send(&app, request(Method::GET, "/api/households", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, fetched) = send(&app, request(Method::GET, "/api/households/h1", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["id"], json!("h1"));
}

#[tokio::test]
async fn replayed_create_is_accepted() {
    let (app, _) = app();
    let body = household("h1", 1, "HH-001");

    let (first, _) = send(&app, request(Method::POST, "/api/households", Some(&body))).await;
    let (second, replay) = send(&app, request(Method::POST, "/api/households", Some(&body))).await;

    assert_eq!(first, StatusCode::CREATED);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(replay["id"], json!("h1"));
}

#[tokio::test]
async fn stale_update_conflicts_with_stored_copy() {
    let (app, _) = app();
    send(
        &app,
        request(Method::POST, "/api/households", Some(&household("h1", 3, "SERVER"))),
    )
    .await;

    let (status, body) = send(
        &app,
        request(Method::PUT, "/api/households/h1", Some(&household("h1", 2, "LOCAL"))),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["version"], json!(3));
    assert_eq!(body["householdCode"], json!("SERVER"));
}

#[tokio::test]
async fn forced_update_overrides_conflict() {
    let (app, _) = app();
    send(
        &app,
        request(Method::POST, "/api/households", Some(&household("h1", 3, "SERVER"))),
    )
    .await;

    let mut forced = request(Method::PUT, "/api/households/h1", Some(&household("h1", 2, "LOCAL")));
    forced
        .headers_mut()
        .insert(FORCE_OVERRIDE_HEADER, "true".parse().unwrap());
    let (status, body) = send(&app, forced).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["version"], json!(4));
    assert_eq!(body["householdCode"], json!("LOCAL"));
}

#[tokio::test]
async fn update_with_mismatched_id_is_rejected() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        request(Method::PUT, "/api/households/other", Some(&household("h1", 1, "HH"))),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("does not match"));
}

#[tokio::test]
async fn delete_then_missing() {
    let (app, _) = app();
    send(
        &app,
        request(Method::POST, "/api/households", Some(&household("h1", 1, "HH"))),
    )
    .await;

    let (status, _) = send(&app, request(Method::DELETE, "/api/households/h1", None)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, request(Method::DELETE, "/api/households/h1", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, request(Method::GET, "/api/households/h1", None)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn secret_is_enforced_when_configured() {
    let (app, _) = app_with(Config {
        auth_secret: Some("s3cret".into()),
        ..Config::default()
    });

    let (status, _) = send(&app, request(Method::GET, "/api/forms", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut wrong = request(Method::GET, "/api/forms", None);
    wrong
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer nope".parse().unwrap());
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut right = request(Method::GET, "/api/forms", None);
    right
        .headers_mut()
        .insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
    let (status, body) = send(&app, right).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));
}

// ============================================================================
// Engine Round Trip
// ============================================================================

mod round_trip {
    use super::*;
    use trove_engine::domain::{survey_schema, FORMS, HOUSEHOLDS};
    use trove_engine::{
        HttpRemote, LocalStore, ManualNetwork, MemoryStorage, StoreOptions, SyncConfig,
        SyncEngine, SyncOutcome, SyncStatus,
    };
    use trove_server::db::StoredRecord;

    struct Running {
        base_url: String,
        records: Arc<MemoryRecords>,
        engine: SyncEngine,
    }

    async fn start() -> Running {
        let (app, records) = app_with(Config {
            auth_secret: Some("field-token".into()),
            ..Config::default()
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let base_url = format!("http://{addr}");
        let config = SyncConfig::new(base_url.clone()).with_auth_token("field-token");
        let store = Arc::new(
            LocalStore::open(
                Arc::new(MemoryStorage::new()),
                survey_schema(),
                StoreOptions::default(),
            )
            .await
            .unwrap(),
        );
        let engine = SyncEngine::new(
            store,
            Arc::new(HttpRemote::new(&config).unwrap()),
            Arc::new(ManualNetwork::online()),
            config,
        );

        Running {
            base_url,
            records,
            engine,
        }
    }

    #[tokio::test]
    async fn health_is_reachable_over_the_wire() {
        let running = start().await;
        let response = reqwest::get(format!("{}/health", running.base_url))
            .await
            .unwrap();

        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["status"], json!("ok"));
    }

    #[tokio::test]
    async fn created_record_reaches_the_authority() {
        let running = start().await;
        let store = running.engine.store();
        let household = store
            .create(HOUSEHOLDS, json!({"householdCode": "HH-001"}))
            .await
            .unwrap();

        let result = running.engine.sync_now().await;

        assert_eq!(result.outcome, SyncOutcome::Completed);
        assert_eq!(result.items_synced, 1);
        let stored = running
            .records
            .get(HOUSEHOLDS, &household.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.body["householdCode"], json!("HH-001"));

        let local = store.get_by_id(HOUSEHOLDS, &household.id).await.unwrap().unwrap();
        assert_eq!(local.sync_status, SyncStatus::Synced);
        assert_eq!(store.queue().pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn newer_local_edit_overrides_authority() {
        let running = start().await;
        let store = running.engine.store();
        let household = store
            .create(HOUSEHOLDS, json!({"householdCode": "HH-001"}))
            .await
            .unwrap();
        running.engine.sync_now().await;

        // Another device moved the authority to version 3, an hour ago.
        let mut fields = Map::new();
        fields.insert("householdCode".into(), json!("HH-REMOTE"));
        let mut other = Record::new(
            household.id.clone(),
            fields,
            "device-2",
            "session-2",
            Utc::now() - Duration::hours(1),
        );
        other.version = 3;
        other.sync_status = SyncStatus::Synced;
        running
            .records
            .put(&StoredRecord {
                collection: HOUSEHOLDS.into(),
                record_id: household.id.clone(),
                version: 3,
                body: other.to_value().unwrap(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        store
            .update(HOUSEHOLDS, &household.id, json!({"householdCode": "HH-LOCAL"}))
            .await
            .unwrap();
        let result = running.engine.sync_now().await;

        assert_eq!(result.outcome, SyncOutcome::Completed);
        assert_eq!(result.conflicts.len(), 1);

        let stored = running
            .records
            .get(HOUSEHOLDS, &household.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.version, 4);
        assert_eq!(stored.body["householdCode"], json!("HH-LOCAL"));

        let local = store.get_by_id(HOUSEHOLDS, &household.id).await.unwrap().unwrap();
        assert_eq!(local.version, 4);
        assert_eq!(local.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn reference_data_is_pulled() {
        let running = start().await;
        let mut fields = Map::new();
        fields.insert("title".into(), json!("Baseline survey"));
        let mut form = Record::new("form-1", fields, "authority", "authority", Utc::now());
        form.sync_status = SyncStatus::Synced;
        running
            .records
            .put(&StoredRecord {
                collection: FORMS.into(),
                record_id: "form-1".into(),
                version: 1,
                body: form.to_value().unwrap(),
                updated_at: Utc::now(),
            })
            .await
            .unwrap();

        let result = running.engine.sync_now().await;

        assert_eq!(result.outcome, SyncOutcome::Completed);
        assert_eq!(result.reference_items_pulled, 1);
        let local = running
            .engine
            .store()
            .get_by_id(FORMS, "form-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(local.field("title"), Some(&json!("Baseline survey")));
    }
}
