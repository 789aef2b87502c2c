//! # Trove Engine
//!
//! An offline-first local store and sync engine for field data collection.
//!
//! Field workers capture records with no guaranteed connectivity. Every
//! local write is versioned, checksummed, logged to a durable sync queue and
//! recorded in an append-only audit trail, all in one atomic batch. Once the
//! network comes back, the [`SyncEngine`] replays the queue against a remote
//! authority and settles version conflicts with a per-collection policy.
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] carries the base fields every collection shares (id,
//! version, sync status, timestamps, device and collector ids, integrity
//! hash) plus flat business fields. The store owns the base fields.
//!
//! ### Local Store
//!
//! [`LocalStore`] is the only way to write. `create`, `update` and `delete`
//! each produce exactly one record write, one [`SyncQueueItem`] and one
//! [`AuditEntry`], committed together through a [`StorageBackend`].
//!
//! ### Sync
//!
//! [`SyncEngine::sync_now`] runs one pass: pull reference collections, push
//! the queue in `(priority, sequence)` order, resolve conflicts:
//! - [`ConflictStrategy::ServerWins`] - the authority's copy replaces ours
//! - [`ConflictStrategy::ClientWins`] - the newer `updatedAt` wins, ties go to the server
//! - [`ConflictStrategy::ManualMerge`] - both copies wait in the holding area
//!
//! [`SyncEngine::start`] adds background passes on a timer, on reconnect
//! and on visibility regain.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use trove_engine::{
//!     CollectionSchema, ConflictStrategy, FieldDef, FieldType, LocalStore, MemoryStorage,
//!     Schema, StoreOptions, SyncStatus,
//! };
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> trove_engine::Result<()> {
//! // 1. Define a schema
//! let schema = Schema::new(1).with_collection(
//!     CollectionSchema::new(
//!         "households",
//!         vec![FieldDef::required("householdCode", FieldType::String)],
//!     )
//!     .with_strategy(ConflictStrategy::ClientWins),
//! );
//!
//! // 2. Open a store
//! let store = LocalStore::open(Arc::new(MemoryStorage::new()), schema, StoreOptions::default()).await?;
//!
//! // 3. Write
//! let household = store.create("households", json!({"householdCode": "HH-001"})).await?;
//! assert_eq!(household.version, 1);
//! assert_eq!(household.sync_status, SyncStatus::Pending);
//!
//! // 4. The write is queued for sync and audited
//! assert_eq!(store.queue().pending_count().await?, 1);
//! assert_eq!(store.audit().entries_for("households", &household.id).await?.len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Persistence
//!
//! [`MemoryStorage`] keeps everything in process memory. With the default
//! `sqlite` feature, [`SqliteStorage`] keeps it in an on-device SQLite file.

pub mod audit;
pub mod config;
pub mod domain;
pub mod engine;
pub mod error;
pub mod identity;
pub mod listeners;
pub mod mutation;
pub mod network;
pub mod queue;
pub mod reconcile;
pub mod record;
pub mod remote;
pub mod scheduler;
pub mod schema;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export main types at crate root
pub use audit::{AuditEntry, AuditOperation, AuditTrail, GpsLocation};
pub use config::{StoreOptions, SyncConfig};
pub use engine::{SyncEngine, SyncIssue, SyncIssueKind, SyncOutcome, SyncResult};
pub use error::{Error, Result};
pub use identity::Identity;
pub use listeners::{ListenerRegistry, Subscription};
pub use mutation::MutationContext;
pub use network::{ManualNetwork, NetworkMonitor, NetworkStatus, ProbingNetwork};
pub use queue::{QueueOperation, QueueStats, SyncQueue, SyncQueueItem};
pub use reconcile::{
    ConflictDecision, ConflictNote, ConflictRecord, ConflictResolution, ConflictStatus,
    ConflictStrategy, ConflictSummary, ManualResolution, Winner,
};
pub use record::{Record, SyncStatus};
pub use remote::{HttpRemote, PushOutcome, Remote, RemoteError, FORCE_OVERRIDE_HEADER};
pub use scheduler::SchedulerHandle;
pub use schema::{CollectionKind, CollectionSchema, FieldDef, FieldType, Schema};
pub use storage::{MemoryStorage, StorageBackend, WriteBatch, WriteOp};
#[cfg(feature = "sqlite")]
pub use storage::SqliteStorage;
pub use store::{Filter, IntegrityViolation, LocalStore};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type DeviceId = String;
pub type SessionId = String;
pub type Version = u64;
pub type SchemaVersion = u32;
