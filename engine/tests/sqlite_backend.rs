//! SQLite backend tests
//!
//! Each test works in its own temporary directory.

use practice_sync_engine::storage::{StoreDef, WriteOp};
use practice_sync_engine::{
    EngineConfig, EntityType, Error, Priority, SqliteBackend, StorageBackend, SyncStatus,
    TenantContext, TenantDatabaseManager,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn stores() -> Vec<StoreDef> {
    vec![StoreDef::new("operations").with_index("status", "status")]
}

// ============================================================================
// Open and upgrade
// ============================================================================

#[tokio::test]
async fn new_database_opens_at_version_one() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());

    let db = backend.open("acme", None, &stores()).await.unwrap();
    assert_eq!(db.version().await.unwrap(), 1);
    assert!(db.has_store("operations").await.unwrap());
    assert!(backend.database_path("acme").exists());
}

#[tokio::test]
async fn upgrade_adds_stores_and_keeps_data() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());

    let db = backend.open("acme", None, &stores()).await.unwrap();
    db.put("operations", "op-1", &json!({"id": "op-1", "status": "pending"}))
        .await
        .unwrap();
    db.close().await;

    let mut upgraded = stores();
    upgraded.push(StoreDef::new("sessions"));
    let db = backend.open("acme", Some(2), &upgraded).await.unwrap();
    assert_eq!(db.version().await.unwrap(), 2);
    assert!(db.has_store("sessions").await.unwrap());
    assert_eq!(
        db.get("operations", "op-1").await.unwrap(),
        Some(json!({"id": "op-1", "status": "pending"}))
    );
    db.close().await;

    let err = backend.open("acme", Some(1), &stores()).await.err().unwrap();
    assert!(matches!(err, Error::Database(_)));
}

#[tokio::test]
async fn garbage_file_is_reported_as_corrupted() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());
    std::fs::write(backend.database_path("broken"), vec![b'x'; 4096]).unwrap();

    let err = backend.open("broken", None, &stores()).await.err().unwrap();
    assert!(matches!(err, Error::CorruptedStore(name) if name == "broken"));
}

// ============================================================================
// Reads and writes
// ============================================================================

#[tokio::test]
async fn index_query_and_transaction() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());
    let db = backend.open("acme", None, &stores()).await.unwrap();

    db.transaction(vec![
        WriteOp::put("operations", "a", json!({"id": "a", "status": "pending"})),
        WriteOp::put("operations", "b", json!({"id": "b", "status": "failed"})),
        WriteOp::put("operations", "c", json!({"id": "c", "status": "pending"})),
    ])
    .await
    .unwrap();

    let pending = db
        .query_index("operations", "status", &json!("pending"))
        .await
        .unwrap();
    let mut ids: Vec<&str> = pending.iter().filter_map(|v| v["id"].as_str()).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a", "c"]);

    db.transaction(vec![
        WriteOp::delete("operations", "a"),
        WriteOp::put("operations", "b", json!({"id": "b", "status": "pending"})),
    ])
    .await
    .unwrap();
    assert_eq!(db.count("operations").await.unwrap(), 2);
    assert!(!db.delete("operations", "a").await.unwrap());

    db.clear("operations").await.unwrap();
    assert!(db.get_all("operations").await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_store_is_an_error() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());
    let db = backend.open("acme", None, &stores()).await.unwrap();

    assert!(db.get("missing", "k").await.is_err());
}

#[tokio::test]
async fn delete_database_removes_the_file() {
    let dir = TempDir::new().unwrap();
    let backend = SqliteBackend::new(dir.path());
    let db = backend.open("acme", None, &stores()).await.unwrap();
    db.close().await;

    backend.delete_database("acme").await.unwrap();
    assert!(!backend.database_path("acme").exists());
    // Deleting again is not an error.
    backend.delete_database("acme").await.unwrap();
}

// ============================================================================
// Through the tenant manager
// ============================================================================

#[tokio::test]
async fn entities_survive_manager_restart() {
    let dir = TempDir::new().unwrap();
    let ctx = TenantContext::new("acme").with_practice("north").with_user("dr-lee");
    let config = EngineConfig::default();

    let saved = {
        let databases = Arc::new(TenantDatabaseManager::new(
            Arc::new(SqliteBackend::new(dir.path())),
            config.pool.clone(),
        ));
        databases.register_practice("north", "acme").await.unwrap();
        let entities = practice_sync_engine::EntityStore::new(
            Arc::clone(&databases),
            Arc::new(practice_sync_engine::Schema::clinical()),
        );
        let saved = entities
            .save(
                &ctx,
                EntityType::Client,
                json!({"firstName": "Ada", "lastName": "Byrne"}),
                SyncStatus::Pending,
            )
            .await
            .unwrap();
        databases.close_all().await;
        saved
    };

    let databases = Arc::new(TenantDatabaseManager::new(
        Arc::new(SqliteBackend::new(dir.path())),
        config.pool,
    ));
    assert_eq!(
        databases.registered_practices("acme").await.unwrap(),
        vec!["north".to_string()]
    );
    let entities = practice_sync_engine::EntityStore::new(
        Arc::clone(&databases),
        Arc::new(practice_sync_engine::Schema::clinical()),
    );
    let loaded = entities
        .get(&ctx, EntityType::Client, &saved.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded, saved);

    let queue = practice_sync_engine::SyncQueue::new(
        Arc::clone(&databases),
        Arc::new(practice_sync_engine::Schema::clinical()),
        Default::default(),
    );
    queue
        .enqueue(
            &ctx,
            EntityType::Client,
            &saved.id,
            practice_sync_engine::OperationKind::Create,
            saved.data.clone(),
            Priority::High,
        )
        .await
        .unwrap();
    assert_eq!(queue.pending_count(&ctx).await.unwrap(), 1);
}
