//! # Practice Sync Engine
//!
//! Offline-first data layer for multi-tenant clinical practice applications.
//!
//! Every tenant gets its own on-device database. Practices partition a
//! tenant's entity data into practice-namespaced stores; tenant-wide system
//! stores hold the sync queue, id mappings, conflicts and cached sessions
//! and permissions. Local mutations are saved immediately and queued, then
//! pushed to the server whenever it can be reached.
//!
//! ## Core Concepts
//!
//! ### Tenant context
//!
//! Every storage, queue and resolver call takes an explicit
//! [`TenantContext`]. A record that belongs to another tenant is never
//! returned; reading one fails with [`Error::TenantMismatch`].
//!
//! ### Entities
//!
//! [`OfflineEntity`] records carry sync metadata: status, local version,
//! last known server version. Deletes are tombstones (`data._deleted`) until
//! the server confirms them. Records created offline get a temporary id
//! (`temp_<millis>_<random>_<type>`) that is replaced everywhere once the
//! server assigns a real one.
//!
//! ### Sync
//!
//! [`SyncEngine::bidirectional_sync`] pushes ready operations in dependency
//! order (a client before its pets, a pet before its appointments), then
//! pulls server changes. Unreachable servers are normal: the pass ends and
//! the work stays queued. Failed pushes are retried forever with exponential
//! backoff. Divergence from the server becomes a [`Conflict`]; low severity
//! ones can be resolved automatically, the rest wait for a decision.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use practice_sync_engine::{
//!     EngineConfig, EntityType, HttpSyncEndpoint, MemoryBackend, Priority, Schema, SyncEngine,
//!     TenantContext, TenantDatabaseManager,
//! };
//! use serde_json::json;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> practice_sync_engine::Result<()> {
//! let config = EngineConfig::default();
//! let databases = Arc::new(TenantDatabaseManager::new(
//!     Arc::new(MemoryBackend::new()),
//!     config.pool.clone(),
//! ));
//! databases.register_practice("north", "acme").await?;
//!
//! let remote = Arc::new(HttpSyncEndpoint::new("https://sync.example.com", Duration::from_secs(10))?);
//! let engine = SyncEngine::new(databases, Arc::new(Schema::clinical()), remote, config);
//!
//! let ctx = TenantContext::new("acme").with_practice("north").with_user("dr-lee");
//! let client = engine
//!     .create(&ctx, EntityType::Client, json!({"firstName": "Ada", "lastName": "Byrne"}), Priority::Normal)
//!     .await?;
//! engine
//!     .create(
//!         &ctx,
//!         EntityType::Pet,
//!         json!({"name": "Rex", "species": "dog", "clientId": client.id}),
//!         Priority::Normal,
//!     )
//!     .await?;
//!
//! let report = engine.bidirectional_sync(&ctx).await?;
//! println!("pushed {} operations", report.pushed);
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cache;
pub mod config;
pub mod conflict;
pub mod database;
pub mod entity_store;
pub mod entity_type;
pub mod error;
pub mod network;
pub mod obfuscate;
pub mod orderer;
pub mod queue;
pub mod record;
pub mod remote;
pub mod resolver;
pub mod schema;
pub mod storage;
pub mod sync;
pub mod temp_id;

// Re-export main types at crate root
pub use backoff::BackoffPolicy;
pub use cache::{PermissionCache, PermissionEvaluator, Session, SessionCache};
pub use config::{ConfigError, EngineConfig, PoolConfig, SyncConfig};
pub use conflict::{
    Conflict, ConflictDetector, ConflictStore, ConflictType, FieldChoice, ResolutionStrategy, Severity,
};
pub use database::{TenantContext, TenantDatabaseManager};
pub use entity_store::{EntityQuery, EntityStore};
pub use entity_type::EntityType;
pub use error::{Error, Result};
pub use network::{NetworkMonitor, NetworkStatus, SyncHooks};
pub use orderer::{order_operations, OrderedBatch};
pub use queue::{OperationKind, OperationStatus, Priority, SyncOperation, SyncQueue};
pub use record::{EntityMetadata, OfflineEntity, SyncStatus};
pub use remote::{ChangesPage, HttpSyncEndpoint, PushRequest, PushResult, RemoteSyncEndpoint, ServerSnapshot};
pub use resolver::{IdMapping, TempIdResolver};
pub use schema::{EntitySchema, FieldDef, FieldType, Schema};
pub use storage::{LocalStore, MemoryBackend, SqliteBackend, StorageBackend};
pub use sync::{SyncEngine, SyncReport};

/// Type aliases for clarity
pub type TenantId = String;
pub type PracticeId = String;
pub type UserId = String;
pub type EntityId = String;
pub type OperationId = String;
pub type Version = u64;
pub type Timestamp = u64;
pub type SchemaVersion = u32;

/// Current wall-clock time in milliseconds since the epoch.
pub(crate) fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
