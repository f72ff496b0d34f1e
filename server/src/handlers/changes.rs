//! Changes handler - serves entity changes to clients for pull.

use crate::db;
use crate::error::{AppError, Result};
use practice_sync_engine::ChangesPage;
use serde::Deserialize;
use sqlx::PgPool;

/// Query parameters for a changes page.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
    pub tenant_id: String,
    pub practice_id: String,
    /// Cursor from the previous page (absent for the first pull)
    pub since: Option<String>,
    /// Maximum number of changes to return
    pub limit: Option<i64>,
}

/// Default limit for a changes page.
const DEFAULT_LIMIT: i64 = 100;

/// Maximum limit for a changes page.
const MAX_LIMIT: i64 = 1000;

/// Process a changes request from a client.
pub async fn handle_changes(pool: &PgPool, query: ChangesQuery) -> Result<ChangesPage> {
    let limit = query
        .limit
        .map(|l| l.clamp(1, MAX_LIMIT))
        .unwrap_or(DEFAULT_LIMIT);

    let since = match query.since.as_deref() {
        Some(token) if !token.is_empty() => Some(
            db::parse_cursor(token)
                .ok_or_else(|| AppError::BadRequest(format!("Invalid cursor: {}", token)))?,
        ),
        _ => None,
    };

    // Fetch one more than requested to check if there are more
    let stored = db::get_changes_since(
        pool,
        &query.tenant_id,
        &query.practice_id,
        since,
        limit + 1,
    )
    .await?;

    let has_more = stored.len() as i64 > limit;
    let page: Vec<_> = stored.into_iter().take(limit as usize).collect();

    let mut changes = Vec::with_capacity(page.len());
    for entity in &page {
        match entity.to_snapshot() {
            Ok(snapshot) => changes.push(snapshot),
            Err(e) => {
                tracing::warn!("Skipping stored entity {}: {}", entity.id, e);
            }
        }
    }

    let next_cursor = page.last().map(db::format_cursor).or(query.since);

    Ok(ChangesPage {
        changes,
        next_cursor,
        has_more,
    })
}
