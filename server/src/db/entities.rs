//! Database operations for the entities table.

use practice_sync_engine::{EntityType, ServerSnapshot};
use sqlx::{PgExecutor, PgPool, Row};

/// A stored entity row from the database.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub id: i64,
    #[allow(dead_code)]
    pub tenant_id: String,
    pub practice_id: String,
    pub entity_type: String,
    pub data: serde_json::Value,
    pub version: i64,
    pub deleted: bool,
    pub updated_at: i64,
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for StoredEntity {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        Ok(StoredEntity {
            id: row.try_get("id")?,
            tenant_id: row.try_get("tenant_id")?,
            practice_id: row.try_get("practice_id")?,
            entity_type: row.try_get("entity_type")?,
            data: row.try_get("data")?,
            version: row.try_get("version")?,
            deleted: row.try_get("deleted")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl StoredEntity {
    /// Convert the row to the snapshot clients receive.
    pub fn to_snapshot(&self) -> Result<ServerSnapshot, String> {
        let entity_type: EntityType = self
            .entity_type
            .parse()
            .map_err(|_| format!("Unknown entity type: {}", self.entity_type))?;
        Ok(ServerSnapshot {
            id: self.id.to_string(),
            entity_type,
            practice_id: self.practice_id.clone(),
            data: self.data.clone(),
            version: self.version.max(0) as u64,
            last_modified: self.updated_at.max(0) as u64,
            deleted: self.deleted,
        })
    }
}

/// Fields needed to insert a new entity.
pub struct NewEntity<'a> {
    pub tenant_id: &'a str,
    pub practice_id: &'a str,
    pub entity_type: EntityType,
    pub data: &'a serde_json::Value,
    pub user_id: &'a str,
    pub now: i64,
}

/// Changes cursor: "{updatedAt}_{id}" of the last change returned.
pub fn format_cursor(entity: &StoredEntity) -> String {
    format!("{}_{}", entity.updated_at, entity.id)
}

/// Parse a changes cursor. Malformed cursors read as `None`.
pub fn parse_cursor(token: &str) -> Option<(i64, i64)> {
    let (updated_at, id) = token.split_once('_')?;
    Some((updated_at.parse().ok()?, id.parse().ok()?))
}

const COLUMNS: &str =
    "id, tenant_id, practice_id, entity_type, data, version, deleted, updated_at";

/// Insert an entity, returning the stored row with its assigned id.
pub async fn insert_entity<'e>(
    executor: impl PgExecutor<'e>,
    entity: NewEntity<'_>,
) -> Result<StoredEntity, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        INSERT INTO entities (
            tenant_id, practice_id, entity_type, data, version, deleted,
            created_by, updated_by, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, 1, false, $5, $5, $6, $6)
        RETURNING {}
        "#,
        COLUMNS
    ))
    .bind(entity.tenant_id)
    .bind(entity.practice_id)
    .bind(entity.entity_type.as_str())
    .bind(entity.data)
    .bind(entity.user_id)
    .bind(entity.now)
    .fetch_one(executor)
    .await
}

/// Get an entity of one tenant, locking the row when `for_update` is set.
pub async fn get_entity<'e>(
    executor: impl PgExecutor<'e>,
    tenant_id: &str,
    entity_type: EntityType,
    id: i64,
    for_update: bool,
) -> Result<Option<StoredEntity>, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {}
        FROM entities
        WHERE tenant_id = $1 AND entity_type = $2 AND id = $3
        {}
        "#,
        COLUMNS,
        if for_update { "FOR UPDATE" } else { "" }
    ))
    .bind(tenant_id)
    .bind(entity_type.as_str())
    .bind(id)
    .fetch_optional(executor)
    .await
}

/// Replace an entity's data, or tombstone it, bumping its version.
pub async fn write_entity<'e>(
    executor: impl PgExecutor<'e>,
    id: i64,
    data: &serde_json::Value,
    deleted: bool,
    user_id: &str,
    now: i64,
) -> Result<StoredEntity, sqlx::Error> {
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        UPDATE entities
        SET data = $2, deleted = $3, version = version + 1,
            updated_by = $4, updated_at = GREATEST(updated_at + 1, $5)
        WHERE id = $1
        RETURNING {}
        "#,
        COLUMNS
    ))
    .bind(id)
    .bind(data)
    .bind(deleted)
    .bind(user_id)
    .bind(now)
    .fetch_one(executor)
    .await
}

/// Entities of one practice changed after the cursor, oldest first.
pub async fn get_changes_since(
    pool: &PgPool,
    tenant_id: &str,
    practice_id: &str,
    since: Option<(i64, i64)>,
    limit: i64,
) -> Result<Vec<StoredEntity>, sqlx::Error> {
    let (since_updated_at, since_id) = since.unwrap_or((i64::MIN, i64::MIN));
    sqlx::query_as::<_, StoredEntity>(&format!(
        r#"
        SELECT {}
        FROM entities
        WHERE tenant_id = $1 AND practice_id = $2
          AND (updated_at, id) > ($3, $4)
        ORDER BY updated_at ASC, id ASC
        LIMIT $5
        "#,
        COLUMNS
    ))
    .bind(tenant_id)
    .bind(practice_id)
    .bind(since_updated_at)
    .bind(since_id)
    .bind(limit)
    .fetch_all(pool)
    .await
}
