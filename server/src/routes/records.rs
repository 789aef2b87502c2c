//! Per-collection record routes.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde_json::Value;
use trove_engine::FORCE_OVERRIDE_HEADER;

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{delete_record, get_record, list_records, write_record, WriteOutcome};
use crate::AppState;

/// Create record routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/{collection}", get(list_handler).post(create_handler))
        .route(
            "/api/{collection}/{id}",
            get(get_handler).put(update_handler).delete(delete_handler),
        )
}

/// GET /api/{collection} - Every record of a collection.
async fn list_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
) -> Result<Json<Vec<Value>>> {
    let records = list_records(state.records.as_ref(), &collection).await?;
    Ok(Json(records))
}

/// GET /api/{collection}/{id} - One record.
async fn get_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let record = get_record(state.records.as_ref(), &collection, &id).await?;
    Ok(Json(record))
}

/// POST /api/{collection} - Create a record.
async fn create_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(collection): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let _write = state.write_lock.lock().await;
    let outcome = write_record(
        state.records.as_ref(),
        &collection,
        None,
        body,
        is_forced(&headers),
    )
    .await?;
    Ok(respond(outcome))
}

/// PUT /api/{collection}/{id} - Update a record.
async fn update_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>)> {
    let _write = state.write_lock.lock().await;
    let outcome = write_record(
        state.records.as_ref(),
        &collection,
        Some(&id),
        body,
        is_forced(&headers),
    )
    .await?;
    Ok(respond(outcome))
}

/// DELETE /api/{collection}/{id} - Remove a record.
async fn delete_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((collection, id)): Path<(String, String)>,
) -> Result<StatusCode> {
    let _write = state.write_lock.lock().await;
    delete_record(state.records.as_ref(), &collection, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn is_forced(headers: &HeaderMap) -> bool {
    headers
        .get(FORCE_OVERRIDE_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("true"))
}

fn respond(outcome: WriteOutcome) -> (StatusCode, Json<Value>) {
    match outcome {
        WriteOutcome::Created(body) => (StatusCode::CREATED, Json(body)),
        WriteOutcome::Updated(body) | WriteOutcome::Replayed(body) => (StatusCode::OK, Json(body)),
    }
}
