//! Trove Server - reference remote authority for trove clients.
//!
//! Exposes one REST endpoint per collection. Writes are version-checked:
//! a stale write is answered with `409` and the stored copy, and the
//! `X-Force-Override` header lets a client push through anyway.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod routes;

use crate::config::Config;
use crate::db::RecordStore;
use axum::Router;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub records: Arc<dyn RecordStore>,
    pub config: Arc<Config>,
    /// Serializes the read-check-write of record writes
    pub write_lock: Arc<Mutex<()>>,
}

impl AppState {
    pub fn new(records: Arc<dyn RecordStore>, config: Config) -> Self {
        Self {
            records,
            config: Arc::new(config),
            write_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(routes::create_routes())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
