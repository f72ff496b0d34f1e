//! Process-resident storage backend.
//!
//! Databases outlive the connections opened on them, so closing and
//! reopening behaves like an on-device database. Used by tests and by hosts
//! without a filesystem.

use super::{value_at_path, IndexDef, LocalStore, StorageBackend, StorageEstimate, StoreDef, WriteOp};
use crate::{config::DEFAULT_STORAGE_QUOTA_BYTES, error::Result, Error, SchemaVersion};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Default)]
struct ObjectStore {
    indexes: Vec<IndexDef>,
    rows: BTreeMap<String, Value>,
}

#[derive(Debug, Default)]
struct DatabaseState {
    /// 0 until the database is first created
    version: SchemaVersion,
    stores: BTreeMap<String, ObjectStore>,
    /// Serialized bytes of every row, kept current on each write
    usage: u64,
}

/// Bytes a row counts against the quota: key plus compact JSON.
fn row_size(key: &str, value: &Value) -> u64 {
    (key.len() + value.to_string().len()) as u64
}

impl DatabaseState {
    fn put_row(&mut self, store: &str, key: String, value: Value) -> Result<()> {
        let object_store = self.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        let added = row_size(&key, &value);
        let key_len = key.len();
        if let Some(old) = object_store.rows.insert(key, value) {
            self.usage = self
                .usage
                .saturating_sub(key_len as u64 + old.to_string().len() as u64);
        }
        self.usage += added;
        Ok(())
    }

    fn delete_row(&mut self, store: &str, key: &str) -> Result<bool> {
        let object_store = self.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        match object_store.rows.remove(key) {
            Some(old) => {
                self.usage = self.usage.saturating_sub(row_size(key, &old));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn clear_store(&mut self, store: &str) -> Result<()> {
        let object_store = self.stores.get_mut(store).ok_or_else(|| missing_store(store))?;
        let freed: u64 = object_store.rows.iter().map(|(k, v)| row_size(k, v)).sum();
        object_store.rows.clear();
        self.usage = self.usage.saturating_sub(freed);
        Ok(())
    }
}

type SharedState = Arc<RwLock<DatabaseState>>;

/// In-memory [`StorageBackend`].
#[derive(Debug)]
pub struct MemoryBackend {
    databases: Mutex<HashMap<String, SharedState>>,
    open_failures: Mutex<HashMap<String, usize>>,
    deletions: Mutex<Vec<String>>,
    quota: u64,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_STORAGE_QUOTA_BYTES)
    }

    /// Backend reporting the given quota in [`StorageBackend::estimate`].
    pub fn with_quota(quota: u64) -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            open_failures: Mutex::new(HashMap::new()),
            deletions: Mutex::new(Vec::new()),
            quota,
        }
    }

    /// Make the next `count` opens of `name` report a corrupted store.
    pub async fn fail_next_opens(&self, name: &str, count: usize) {
        self.open_failures
            .lock()
            .await
            .insert(name.to_string(), count);
    }

    /// Names passed to [`StorageBackend::delete_database`], in call order.
    pub async fn deleted_databases(&self) -> Vec<String> {
        self.deletions.lock().await.clone()
    }

    /// Names of every existing database.
    pub async fn database_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.databases.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn open(
        &self,
        name: &str,
        version: Option<SchemaVersion>,
        upgrade: &[StoreDef],
    ) -> Result<Arc<dyn LocalStore>> {
        {
            let mut failures = self.open_failures.lock().await;
            if let Some(remaining) = failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::CorruptedStore(name.to_string()));
                }
            }
        }

        let state = self
            .databases
            .lock()
            .await
            .entry(name.to_string())
            .or_default()
            .clone();

        {
            let mut db = state.write().await;
            let is_new = db.version == 0;
            let target = version.unwrap_or(if is_new { 1 } else { db.version });

            if target < db.version {
                return Err(Error::Database(format!(
                    "cannot open '{}' at version {}: current version is {}",
                    name, target, db.version
                )));
            }

            if is_new || target > db.version {
                for def in upgrade {
                    db.stores
                        .entry(def.name.clone())
                        .or_insert_with(|| ObjectStore {
                            indexes: def.indexes.clone(),
                            rows: BTreeMap::new(),
                        });
                }
                db.version = target;
            }
        }

        Ok(Arc::new(MemoryConnection {
            name: name.to_string(),
            state,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        self.databases.lock().await.remove(name);
        self.deletions.lock().await.push(name.to_string());
        Ok(())
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        let databases: Vec<SharedState> = self.databases.lock().await.values().cloned().collect();
        let mut usage = 0u64;
        for state in databases {
            usage += state.read().await.usage;
        }
        Ok(StorageEstimate {
            usage,
            quota: self.quota,
        })
    }
}

struct MemoryConnection {
    name: String,
    state: SharedState,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(Error::Database(format!("connection to '{}' is closed", self.name)))
        } else {
            Ok(())
        }
    }
}

fn missing_store(store: &str) -> Error {
    Error::StoreNotFound(store.to_string())
}

#[async_trait]
impl LocalStore for MemoryConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> Result<SchemaVersion> {
        self.ensure_open()?;
        Ok(self.state.read().await.version)
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.state.read().await.stores.keys().cloned().collect())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        self.ensure_open()?;
        let db = self.state.read().await;
        let store = db.stores.get(store).ok_or_else(|| missing_store(store))?;
        Ok(store.rows.get(key).cloned())
    }

    async fn put(&self, store: &str, key: &str, value: &Value) -> Result<()> {
        self.ensure_open()?;
        self.state
            .write()
            .await
            .put_row(store, key.to_string(), value.clone())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        self.ensure_open()?;
        self.state.write().await.delete_row(store, key)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let db = self.state.read().await;
        let store = db.stores.get(store).ok_or_else(|| missing_store(store))?;
        Ok(store.rows.values().cloned().collect())
    }

    async fn query_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        self.ensure_open()?;
        let db = self.state.read().await;
        let object_store = db.stores.get(store).ok_or_else(|| missing_store(store))?;
        let index_def = object_store
            .indexes
            .iter()
            .find(|i| i.name == index)
            .ok_or_else(|| Error::Database(format!("index '{}' not found on '{}'", index, store)))?;

        Ok(object_store
            .rows
            .values()
            .filter(|row| value_at_path(row, &index_def.key_path) == Some(value))
            .cloned()
            .collect())
    }

    async fn count(&self, store: &str) -> Result<usize> {
        self.ensure_open()?;
        let db = self.state.read().await;
        let store = db.stores.get(store).ok_or_else(|| missing_store(store))?;
        Ok(store.rows.len())
    }

    async fn clear(&self, store: &str) -> Result<()> {
        self.ensure_open()?;
        self.state.write().await.clear_store(store)
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        self.ensure_open()?;
        let mut db = self.state.write().await;

        // Validate every target before touching anything.
        for op in &ops {
            let store = match op {
                WriteOp::Put { store, .. } | WriteOp::Delete { store, .. } => store,
            };
            if !db.stores.contains_key(store) {
                return Err(missing_store(store));
            }
        }

        for op in ops {
            match op {
                WriteOp::Put { store, key, value } => db.put_row(&store, key, value)?,
                WriteOp::Delete { store, key } => {
                    db.delete_row(&store, &key)?;
                }
            }
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stores() -> Vec<StoreDef> {
        vec![StoreDef::new("items").with_index("status", "meta.status")]
    }

    #[tokio::test]
    async fn new_database_opens_at_version_one() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();
        assert_eq!(conn.version().await.unwrap(), 1);
        assert!(conn.has_store("items").await.unwrap());
    }

    #[tokio::test]
    async fn data_survives_reopen() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();
        conn.put("items", "a", &json!({"v": 1})).await.unwrap();
        conn.close().await;
        assert!(conn.get("items", "a").await.is_err());

        let reopened = backend.open("db", None, &[]).await.unwrap();
        assert_eq!(reopened.get("items", "a").await.unwrap(), Some(json!({"v": 1})));
    }

    #[tokio::test]
    async fn upgrade_adds_stores_without_touching_existing() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();
        conn.put("items", "a", &json!({"v": 1})).await.unwrap();
        conn.close().await;

        let upgraded = backend
            .open("db", Some(2), &[StoreDef::new("items"), StoreDef::new("extra")])
            .await
            .unwrap();
        assert_eq!(upgraded.version().await.unwrap(), 2);
        assert!(upgraded.has_store("extra").await.unwrap());
        assert_eq!(upgraded.count("items").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stores_are_not_created_without_upgrade() {
        let backend = MemoryBackend::new();
        backend.open("db", None, &stores()).await.unwrap();
        let conn = backend.open("db", None, &[StoreDef::new("late")]).await.unwrap();
        assert!(!conn.has_store("late").await.unwrap());
    }

    #[tokio::test]
    async fn downgrade_is_rejected() {
        let backend = MemoryBackend::new();
        backend.open("db", Some(3), &stores()).await.unwrap();
        assert!(backend.open("db", Some(2), &[]).await.is_err());
    }

    #[tokio::test]
    async fn index_query_matches_nested_path() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();
        conn.put("items", "a", &json!({"meta": {"status": "pending"}})).await.unwrap();
        conn.put("items", "b", &json!({"meta": {"status": "synced"}})).await.unwrap();

        let pending = conn.query_index("items", "status", &json!("pending")).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!(conn.query_index("items", "nope", &json!(1)).await.is_err());
    }

    #[tokio::test]
    async fn transaction_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();

        let result = conn
            .transaction(vec![
                WriteOp::put("items", "a", json!(1)),
                WriteOp::put("missing", "b", json!(2)),
            ])
            .await;
        assert!(matches!(result, Err(Error::StoreNotFound(_))));
        assert_eq!(conn.count("items").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn injected_failures_report_corruption() {
        let backend = MemoryBackend::new();
        backend.fail_next_opens("db", 1).await;
        assert!(matches!(
            backend.open("db", None, &stores()).await,
            Err(Error::CorruptedStore(_))
        ));
        assert!(backend.open("db", None, &stores()).await.is_ok());
    }

    #[tokio::test]
    async fn estimate_counts_stored_bytes() {
        let backend = MemoryBackend::with_quota(1000);
        let conn = backend.open("db", None, &stores()).await.unwrap();
        conn.put("items", "k", &json!("abc")).await.unwrap();

        let estimate = backend.estimate().await.unwrap();
        assert_eq!(estimate.usage, 1 + 5);
        assert_eq!(estimate.quota, 1000);
    }

    #[tokio::test]
    async fn usage_follows_overwrites_and_deletes() {
        let backend = MemoryBackend::new();
        let conn = backend.open("db", None, &stores()).await.unwrap();
        conn.put("items", "k", &json!("abc")).await.unwrap();
        conn.put("items", "k", &json!("abcdef")).await.unwrap();
        assert_eq!(backend.estimate().await.unwrap().usage, 1 + 8);

        conn.transaction(vec![
            WriteOp::put("items", "m", json!({"v": 1})),
            WriteOp::delete("items", "k"),
        ])
        .await
        .unwrap();
        assert_eq!(backend.estimate().await.unwrap().usage, 1 + 7);

        conn.clear("items").await.unwrap();
        assert_eq!(backend.estimate().await.unwrap().usage, 0);

        conn.put("items", "k", &json!("abc")).await.unwrap();
        backend.delete_database("db").await.unwrap();
        assert_eq!(backend.estimate().await.unwrap().usage, 0);
    }
}
