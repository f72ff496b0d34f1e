//! Fetch handler - serves the current server state of one entity.

use crate::db;
use crate::error::{AppError, Result};
use practice_sync_engine::{EntityType, ServerSnapshot};
use sqlx::PgPool;

/// Look up one entity of a tenant, tombstones included.
pub async fn handle_fetch(
    pool: &PgPool,
    tenant_id: &str,
    entity_type: &str,
    id: &str,
) -> Result<ServerSnapshot> {
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|_| AppError::BadRequest(format!("Unknown entity type: {}", entity_type)))?;
    let not_found = || AppError::NotFound(format!("{} {}", entity_type, id));

    // Ids are numeric; anything else was never stored here.
    let id: i64 = id.parse().map_err(|_| not_found())?;
    let stored = db::get_entity(pool, tenant_id, entity_type, id, false)
        .await?
        .ok_or_else(not_found)?;

    stored.to_snapshot().map_err(AppError::Internal)
}
