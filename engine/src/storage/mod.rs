//! Local store driver.
//!
//! A uniform async key/value surface over a named, versioned on-device
//! database made of object stores with secondary indexes. The tenant database
//! manager is the only component that opens connections; everything else
//! reaches storage through it.

mod memory;
mod quota;
mod sqlite;

pub use memory::MemoryBackend;
pub use quota::{check_quota, QuotaCheck, StorageEstimate, NEAR_LIMIT_RATIO};
pub use sqlite::SqliteBackend;

use crate::{error::Result, SchemaVersion};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// A secondary index on an object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// Index name used in queries
    pub name: String,
    /// Dotted path into the stored value, e.g. `metadata.syncStatus`
    pub key_path: String,
}

impl IndexDef {
    pub fn new(name: impl Into<String>, key_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_path: key_path.into(),
        }
    }
}

/// Definition of an object store created during an upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreDef {
    pub name: String,
    pub indexes: Vec<IndexDef>,
}

impl StoreDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexes: Vec::new(),
        }
    }

    /// Builder-style method to add an index.
    pub fn with_index(mut self, name: &str, key_path: &str) -> Self {
        self.indexes.push(IndexDef::new(name, key_path));
        self
    }
}

/// A write inside an atomic transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        store: String,
        key: String,
        value: Value,
    },
    Delete {
        store: String,
        key: String,
    },
}

impl WriteOp {
    pub fn put(store: impl Into<String>, key: impl Into<String>, value: Value) -> Self {
        WriteOp::Put {
            store: store.into(),
            key: key.into(),
            value,
        }
    }

    pub fn delete(store: impl Into<String>, key: impl Into<String>) -> Self {
        WriteOp::Delete {
            store: store.into(),
            key: key.into(),
        }
    }
}

/// An open connection to one named database.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Database name.
    fn name(&self) -> &str;

    /// Current schema version.
    async fn version(&self) -> Result<SchemaVersion>;

    /// Names of every object store.
    async fn store_names(&self) -> Result<Vec<String>>;

    /// Whether an object store exists.
    async fn has_store(&self, store: &str) -> Result<bool> {
        Ok(self.store_names().await?.iter().any(|s| s == store))
    }

    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>>;

    async fn put(&self, store: &str, key: &str, value: &Value) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, store: &str, key: &str) -> Result<bool>;

    async fn get_all(&self, store: &str) -> Result<Vec<Value>>;

    /// Values whose indexed path equals `value`.
    async fn query_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<Value>>;

    async fn count(&self, store: &str) -> Result<usize>;

    async fn clear(&self, store: &str) -> Result<()>;

    /// Apply all writes atomically: either every write lands or none does.
    async fn transaction(&self, ops: Vec<WriteOp>) -> Result<()>;

    /// Close the connection. Further calls fail.
    async fn close(&self);

    /// Whether the connection has been closed.
    fn is_closed(&self) -> bool;
}

/// A storage engine able to open named, versioned databases.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Open `name`.
    ///
    /// With `version = None` the database opens at its current version, or at
    /// version 1 if it does not exist yet. A version above the current one
    /// triggers an upgrade. In both creation and upgrade, the stores in
    /// `upgrade` that do not exist yet are created with their indexes inside a
    /// single transaction. Existing stores are never altered. Requesting a
    /// lower version than the current one fails.
    async fn open(
        &self,
        name: &str,
        version: Option<SchemaVersion>,
        upgrade: &[StoreDef],
    ) -> Result<Arc<dyn LocalStore>>;

    /// Remove a database and everything in it.
    async fn delete_database(&self, name: &str) -> Result<()>;

    /// Current usage and quota.
    async fn estimate(&self) -> Result<StorageEstimate>;
}

/// Resolve a dotted key path inside a JSON value.
pub(crate) fn value_at_path<'a>(value: &'a Value, key_path: &str) -> Option<&'a Value> {
    key_path
        .split('.')
        .try_fold(value, |current, segment| current.get(segment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_paths() {
        let value = json!({"metadata": {"syncStatus": "pending"}, "id": "7"});
        assert_eq!(
            value_at_path(&value, "metadata.syncStatus"),
            Some(&json!("pending"))
        );
        assert_eq!(value_at_path(&value, "id"), Some(&json!("7")));
        assert_eq!(value_at_path(&value, "metadata.missing"), None);
    }

    #[test]
    fn store_def_builder() {
        let def = StoreDef::new("sync_queue")
            .with_index("status", "status")
            .with_index("entityType", "entityType");
        assert_eq!(def.indexes.len(), 2);
        assert_eq!(def.indexes[1].key_path, "entityType");
    }
}
