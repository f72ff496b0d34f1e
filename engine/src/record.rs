//! Offline entity records and their sync metadata.

use crate::{temp_id, EntityId, EntityType, PracticeId, TenantId, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload flag marking a soft-deleted record.
pub const DELETED_FIELD: &str = "_deleted";

/// Sync state of a locally stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Matches the last known server state
    Synced,
    /// Has local changes waiting to be pushed
    Pending,
    /// Diverged from the server and awaits resolution
    Conflict,
    /// Last push failed
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Conflict => "conflict",
            SyncStatus::Error => "error",
        }
    }
}

/// Metadata associated with a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    /// Owning tenant
    pub tenant_id: TenantId,
    /// Practice partition within the tenant
    pub practice_id: PracticeId,
    /// Owning user
    pub user_id: UserId,
    /// Type of the entity
    pub entity_type: EntityType,
    /// When the record was first created locally (milliseconds since epoch)
    pub created_at: Timestamp,
    /// When the record was last modified locally (milliseconds since epoch)
    pub last_modified: Timestamp,
    /// Current sync state
    pub sync_status: SyncStatus,
    /// Local version, incremented on every local mutation
    pub version: Version,
    /// Server version this record was last reconciled with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<Version>,
    /// When this record was last confirmed by the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<Timestamp>,
    /// User that created the record
    pub created_by: UserId,
    /// User that last modified the record
    pub modified_by: UserId,
}

/// A record held by the entity store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineEntity {
    /// Server id, or a temporary id until the create is acknowledged
    pub id: EntityId,
    /// The entity payload (JSON object)
    pub data: Value,
    /// Sync metadata
    pub metadata: EntityMetadata,
}

impl OfflineEntity {
    /// Whether the id is still a temporary one.
    pub fn has_temp_id(&self) -> bool {
        temp_id::is_temp_id(&self.id)
    }

    /// Check if the record is tombstoned.
    pub fn is_deleted(&self) -> bool {
        self.data
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Check if the record is active (not deleted).
    pub fn is_active(&self) -> bool {
        !self.is_deleted()
    }

    /// Shallow-merge `patch` into the payload and record a local mutation.
    pub fn apply_patch(&mut self, patch: &Map<String, Value>, user: &str, now: Timestamp) {
        if let Value::Object(data) = &mut self.data {
            for (key, value) in patch {
                data.insert(key.clone(), value.clone());
            }
        }
        self.touch(user, now);
    }

    /// Tombstone the record in place.
    pub fn mark_deleted(&mut self, user: &str, now: Timestamp) {
        if let Value::Object(data) = &mut self.data {
            data.insert(DELETED_FIELD.to_string(), Value::Bool(true));
        }
        self.touch(user, now);
    }

    /// Record that the server has confirmed this record.
    pub fn mark_synced(&mut self, server_version: Option<Version>, now: Timestamp) {
        self.metadata.sync_status = SyncStatus::Synced;
        if server_version.is_some() {
            self.metadata.server_version = server_version;
        }
        self.metadata.last_synced_at = Some(now);
    }

    fn touch(&mut self, user: &str, now: Timestamp) {
        self.metadata.version += 1;
        self.metadata.last_modified = now;
        self.metadata.modified_by = user.to_string();
        self.metadata.sync_status = SyncStatus::Pending;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity() -> OfflineEntity {
        OfflineEntity {
            id: "12".into(),
            data: json!({"name": "Rex", "species": "dog", "clientId": 3}),
            metadata: EntityMetadata {
                tenant_id: "t1".into(),
                practice_id: "p1".into(),
                user_id: "u1".into(),
                entity_type: EntityType::Pet,
                created_at: 1000,
                last_modified: 1000,
                sync_status: SyncStatus::Synced,
                version: 1,
                server_version: Some(4),
                last_synced_at: Some(1000),
                created_by: "u1".into(),
                modified_by: "u1".into(),
            },
        }
    }

    #[test]
    fn patch_bumps_version_and_resets_status() {
        let mut e = entity();
        let patch = json!({"weightKg": 30.5});
        e.apply_patch(patch.as_object().unwrap(), "u2", 2000);

        assert_eq!(e.metadata.version, 2);
        assert_eq!(e.metadata.sync_status, SyncStatus::Pending);
        assert_eq!(e.metadata.modified_by, "u2");
        assert_eq!(e.metadata.last_modified, 2000);
        assert_eq!(e.data["weightKg"], json!(30.5));
        assert_eq!(e.data["name"], json!("Rex"));
    }

    #[test]
    fn delete_tombstones_in_place() {
        let mut e = entity();
        e.mark_deleted("u1", 3000);

        assert!(e.is_deleted());
        assert!(!e.is_active());
        assert_eq!(e.data["name"], json!("Rex"));
        assert_eq!(e.metadata.sync_status, SyncStatus::Pending);
        assert_eq!(e.metadata.version, 2);
    }

    #[test]
    fn mark_synced_keeps_previous_server_version_when_unknown() {
        let mut e = entity();
        e.metadata.sync_status = SyncStatus::Pending;
        e.mark_synced(None, 5000);

        assert_eq!(e.metadata.sync_status, SyncStatus::Synced);
        assert_eq!(e.metadata.server_version, Some(4));
        assert_eq!(e.metadata.last_synced_at, Some(5000));
    }

    #[test]
    fn serialization_uses_camel_case_metadata() {
        let json = serde_json::to_value(entity()).unwrap();
        assert_eq!(json["metadata"]["syncStatus"], json!("synced"));
        assert_eq!(json["metadata"]["tenantId"], json!("t1"));
        assert_eq!(json["metadata"]["entityType"], json!("pet"));
    }
}
