//! Database and store naming, and the stores each database carries.

use crate::storage::StoreDef;
use crate::EntityType;

pub const SYNC_QUEUE_STORE: &str = "sync_queue";
pub const SESSIONS_STORE: &str = "sessions";
pub const PERMISSIONS_STORE: &str = "permissions";
pub const ID_MAPPINGS_STORE: &str = "id_mappings";
pub const CONFLICTS_STORE: &str = "conflicts";
pub const METADATA_STORE: &str = "metadata";
pub const CACHE_STORE: &str = "cache";

const DATABASE_PREFIX: &str = "practice_sync_";

/// Escape everything outside `[a-z0-9]` as `_xx` so that distinct inputs
/// always produce distinct names.
fn encode_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_lowercase() || byte.is_ascii_digit() {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02x}", byte));
        }
    }
    out
}

/// Name of the database holding everything for `tenant_id`.
pub fn database_name(tenant_id: &str) -> String {
    format!("{}{}", DATABASE_PREFIX, encode_segment(tenant_id))
}

/// Practice-namespaced store name.
pub fn store_name(practice_id: &str, base: &str) -> String {
    format!("practice_{}_{}", encode_segment(practice_id), base)
}

/// Store holding `entity_type` records of a practice.
pub fn entity_store_name(practice_id: &str, entity_type: EntityType) -> String {
    store_name(practice_id, entity_type.store_base())
}

/// Tenant-wide stores created when the database is first opened.
pub fn system_stores() -> Vec<StoreDef> {
    vec![
        StoreDef::new(SYNC_QUEUE_STORE)
            .with_index("status", "status")
            .with_index("entityType", "entityType")
            .with_index("priority", "priority")
            .with_index("timestamp", "timestamp")
            .with_index("practiceId", "practiceId"),
        StoreDef::new(SESSIONS_STORE),
        StoreDef::new(PERMISSIONS_STORE),
        StoreDef::new(ID_MAPPINGS_STORE)
            .with_index("realId", "realId")
            .with_index("entityType", "entityType")
            .with_index("operationId", "operationId"),
        StoreDef::new(CONFLICTS_STORE)
            .with_index("resolved", "resolved")
            .with_index("operationId", "operation.id")
            .with_index("severity", "severity"),
        StoreDef::new(METADATA_STORE),
        StoreDef::new(CACHE_STORE),
    ]
}

/// Entity stores a registered practice must have, one per entity type.
pub fn practice_stores(practice_id: &str) -> Vec<StoreDef> {
    EntityType::ALL
        .iter()
        .map(|t| {
            StoreDef::new(entity_store_name(practice_id, *t))
                .with_index("tenantId", "metadata.tenantId")
                .with_index("practiceId", "metadata.practiceId")
                .with_index("syncStatus", "metadata.syncStatus")
                .with_index("lastModified", "metadata.lastModified")
                .with_index("userId", "metadata.userId")
        })
        .collect()
}
