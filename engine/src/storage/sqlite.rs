//! SQLite storage backend.
//!
//! One file per database under a root directory. Every object store is a
//! table of `(key, value)` rows holding JSON text; secondary indexes are
//! `json_extract` expression indexes. The schema version lives in
//! `PRAGMA user_version`, and the store and index catalog in two meta tables.

use super::{LocalStore, StorageBackend, StorageEstimate, StoreDef, WriteOp};
use crate::{config::DEFAULT_STORAGE_QUOTA_BYTES, error::Result, Error, SchemaVersion};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STORES_TABLE: &str = "__stores";
const INDEXES_TABLE: &str = "__indexes";

// Primary result codes, compared after masking off the extended bits.
const SQLITE_CORRUPT: i64 = 11;
const SQLITE_NOTADB: i64 = 26;

/// [`StorageBackend`] writing one SQLite file per database.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    root: PathBuf,
    quota: u64,
}

impl SqliteBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::with_quota(root, DEFAULT_STORAGE_QUOTA_BYTES)
    }

    pub fn with_quota(root: impl Into<PathBuf>, quota: u64) -> Self {
        Self {
            root: root.into(),
            quota,
        }
    }

    /// Path of the file backing `name`.
    pub fn database_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.sqlite", name))
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn index_name(store: &str, index: &str) -> String {
    quote(&format!("idx_{}_{}", store, index))
}

fn json_path(key_path: &str) -> String {
    format!("$.{}", key_path)
}

/// Map a driver error, recognising corruption of the database file.
fn driver_err(name: &str, err: sqlx::Error) -> Error {
    if let sqlx::Error::Database(db_err) = &err {
        let code = db_err.code().and_then(|c| c.parse::<i64>().ok());
        if let Some(code) = code {
            let primary = code % 256;
            if primary == SQLITE_CORRUPT || primary == SQLITE_NOTADB {
                return Error::CorruptedStore(name.to_string());
            }
        }
    }
    Error::from(err)
}

fn io_err(err: std::io::Error) -> Error {
    Error::Database(err.to_string())
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn open(
        &self,
        name: &str,
        version: Option<SchemaVersion>,
        upgrade: &[StoreDef],
    ) -> Result<Arc<dyn LocalStore>> {
        tokio::fs::create_dir_all(&self.root).await.map_err(io_err)?;

        let options = SqliteConnectOptions::new()
            .filename(self.database_path(name))
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| driver_err(name, e))?;

        let current: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&pool)
            .await
            .map_err(|e| driver_err(name, e))?;
        let current = current as SchemaVersion;
        let is_new = current == 0;
        let target = version.unwrap_or(if is_new { 1 } else { current });

        if target < current {
            pool.close().await;
            return Err(Error::Database(format!(
                "cannot open '{}' at version {}: current version is {}",
                name, target, current
            )));
        }

        if is_new || target > current {
            upgrade_schema(&pool, name, target, upgrade).await?;
            tracing::debug!(database = name, from = current, to = target, "upgraded sqlite schema");
        }

        let indexes = load_catalog(&pool, name).await?;

        Ok(Arc::new(SqliteConnection {
            name: name.to_string(),
            pool,
            indexes,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_database(&self, name: &str) -> Result<()> {
        let base = self.database_path(name);
        for suffix in ["", "-wal", "-shm"] {
            let mut path = base.clone().into_os_string();
            path.push(suffix);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(io_err(e)),
            }
        }
        Ok(())
    }

    async fn estimate(&self) -> Result<StorageEstimate> {
        Ok(StorageEstimate {
            usage: directory_size(&self.root).await?,
            quota: self.quota,
        })
    }
}

async fn directory_size(root: &Path) -> Result<u64> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_err(e)),
    };

    let mut total = 0;
    while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
        let meta = entry.metadata().await.map_err(io_err)?;
        if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

async fn upgrade_schema(
    pool: &SqlitePool,
    name: &str,
    target: SchemaVersion,
    upgrade: &[StoreDef],
) -> Result<()> {
    let err = |e| driver_err(name, e);
    let mut tx = pool.begin().await.map_err(err)?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (name TEXT PRIMARY KEY)",
        STORES_TABLE
    ))
    .execute(&mut *tx)
    .await
    .map_err(err)?;
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (store TEXT NOT NULL, name TEXT NOT NULL, key_path TEXT NOT NULL, PRIMARY KEY (store, name))",
        INDEXES_TABLE
    ))
    .execute(&mut *tx)
    .await
    .map_err(err)?;

    for def in upgrade {
        let exists: Option<String> =
            sqlx::query_scalar(&format!("SELECT name FROM {} WHERE name = ?", STORES_TABLE))
                .bind(&def.name)
                .fetch_optional(&mut *tx)
                .await
                .map_err(err)?;
        if exists.is_some() {
            continue;
        }

        sqlx::query(&format!(
            "CREATE TABLE {} (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            quote(&def.name)
        ))
        .execute(&mut *tx)
        .await
        .map_err(err)?;
        sqlx::query(&format!("INSERT INTO {} (name) VALUES (?)", STORES_TABLE))
            .bind(&def.name)
            .execute(&mut *tx)
            .await
            .map_err(err)?;

        for index in &def.indexes {
            sqlx::query(&format!(
                "CREATE INDEX {} ON {} (json_extract(value, '{}'))",
                index_name(&def.name, &index.name),
                quote(&def.name),
                json_path(&index.key_path).replace('\'', "''")
            ))
            .execute(&mut *tx)
            .await
            .map_err(err)?;
            sqlx::query(&format!(
                "INSERT INTO {} (store, name, key_path) VALUES (?, ?, ?)",
                INDEXES_TABLE
            ))
            .bind(&def.name)
            .bind(&index.name)
            .bind(&index.key_path)
            .execute(&mut *tx)
            .await
            .map_err(err)?;
        }
    }

    // PRAGMA does not accept bound parameters.
    sqlx::query(&format!("PRAGMA user_version = {}", target))
        .execute(&mut *tx)
        .await
        .map_err(err)?;

    tx.commit().await.map_err(err)
}

/// Store name -> (index name -> key path).
type Catalog = BTreeMap<String, BTreeMap<String, String>>;

async fn load_catalog(pool: &SqlitePool, name: &str) -> Result<Catalog> {
    let err = |e| driver_err(name, e);

    let stores: Vec<String> = sqlx::query_scalar(&format!("SELECT name FROM {}", STORES_TABLE))
        .fetch_all(pool)
        .await
        .map_err(err)?;
    let indexes: Vec<(String, String, String)> = sqlx::query_as(&format!(
        "SELECT store, name, key_path FROM {}",
        INDEXES_TABLE
    ))
    .fetch_all(pool)
    .await
    .map_err(err)?;

    let mut catalog: Catalog = stores.into_iter().map(|s| (s, BTreeMap::new())).collect();
    for (store, index, key_path) in indexes {
        catalog.entry(store).or_default().insert(index, key_path);
    }
    Ok(catalog)
}

struct SqliteConnection {
    name: String,
    pool: SqlitePool,
    /// Catalog loaded at open; stores only change through a reopen.
    indexes: Catalog,
    closed: AtomicBool,
}

impl SqliteConnection {
    fn check(&self, store: &str) -> Result<String> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Database(format!("connection to '{}' is closed", self.name)));
        }
        if !self.indexes.contains_key(store) {
            return Err(Error::StoreNotFound(store.to_string()));
        }
        Ok(quote(store))
    }

    fn err(&self, err: sqlx::Error) -> Error {
        driver_err(&self.name, err)
    }
}

fn decode(raw: &str) -> Result<Value> {
    Ok(serde_json::from_str(raw)?)
}

#[async_trait]
impl LocalStore for SqliteConnection {
    fn name(&self) -> &str {
        &self.name
    }

    async fn version(&self) -> Result<SchemaVersion> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Database(format!("connection to '{}' is closed", self.name)));
        }
        let version: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(version as SchemaVersion)
    }

    async fn store_names(&self) -> Result<Vec<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Database(format!("connection to '{}' is closed", self.name)));
        }
        Ok(self.indexes.keys().cloned().collect())
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>> {
        let table = self.check(store)?;
        let raw: Option<String> =
            sqlx::query_scalar(&format!("SELECT value FROM {} WHERE key = ?", table))
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| self.err(e))?;
        raw.as_deref().map(decode).transpose()
    }

    async fn put(&self, store: &str, key: &str, value: &Value) -> Result<()> {
        let table = self.check(store)?;
        sqlx::query(&format!(
            "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            table
        ))
        .bind(key)
        .bind(serde_json::to_string(value)?)
        .execute(&self.pool)
        .await
        .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<bool> {
        let table = self.check(store)?;
        let result = sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_all(&self, store: &str) -> Result<Vec<Value>> {
        let table = self.check(store)?;
        let rows: Vec<String> =
            sqlx::query_scalar(&format!("SELECT value FROM {} ORDER BY key", table))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| self.err(e))?;
        rows.iter().map(|raw| decode(raw)).collect()
    }

    async fn query_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<Value>> {
        let table = self.check(store)?;
        let key_path = self
            .indexes
            .get(store)
            .and_then(|indexes| indexes.get(index))
            .ok_or_else(|| Error::Database(format!("index '{}' not found on '{}'", index, store)))?;
        let path = json_path(key_path);

        let rows: Vec<String> = if value.is_null() {
            let sql = format!(
                "SELECT value FROM {} WHERE json_extract(value, ?) IS NULL ORDER BY key",
                table
            );
            sqlx::query_scalar(&sql)
                .bind(path.as_str())
                .fetch_all(&self.pool)
                .await
                .map_err(|e| self.err(e))?
        } else {
            let sql = format!(
                "SELECT value FROM {} WHERE json_extract(value, ?) = ? ORDER BY key",
                table
            );
            let query = sqlx::query_scalar(&sql).bind(path.as_str());
            // json_extract yields SQL scalars, so bind the matching SQL type.
            let query = match value {
                Value::String(s) => query.bind(s.clone()),
                Value::Bool(b) => query.bind(i64::from(*b)),
                Value::Number(n) => match n.as_i64() {
                    Some(i) => query.bind(i),
                    None => query.bind(n.as_f64().unwrap_or_default()),
                },
                other => query.bind(serde_json::to_string(other)?),
            };
            query.fetch_all(&self.pool).await.map_err(|e| self.err(e))?
        };

        rows.iter().map(|raw| decode(raw)).collect()
    }

    async fn count(&self, store: &str) -> Result<usize> {
        let table = self.check(store)?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table))
            .fetch_one(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(count as usize)
    }

    async fn clear(&self, store: &str) -> Result<()> {
        let table = self.check(store)?;
        sqlx::query(&format!("DELETE FROM {}", table))
            .execute(&self.pool)
            .await
            .map_err(|e| self.err(e))?;
        Ok(())
    }

    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()> {
        // Resolve every target up front so a bad store fails before any write.
        let mut prepared = Vec::with_capacity(ops.len());
        for op in ops {
            match op {
                WriteOp::Put { store, key, value } => {
                    let table = self.check(&store)?;
                    prepared.push((table, key, Some(serde_json::to_string(&value)?)));
                }
                WriteOp::Delete { store, key } => {
                    let table = self.check(&store)?;
                    prepared.push((table, key, None));
                }
            }
        }

        let mut tx = self.pool.begin().await.map_err(|e| self.err(e))?;
        for (table, key, value) in prepared {
            match value {
                Some(value) => {
                    sqlx::query(&format!(
                        "INSERT INTO {} (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        table
                    ))
                    .bind(key)
                    .bind(value)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| self.err(e))?;
                }
                None => {
                    sqlx::query(&format!("DELETE FROM {} WHERE key = ?", table))
                        .bind(key)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| self.err(e))?;
                }
            }
        }
        tx.commit().await.map_err(|e| self.err(e))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close().await;
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
