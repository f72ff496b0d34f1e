//! Sync endpoint routes.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use practice_sync_engine::{ChangesPage, PushRequest, PushResult, ServerSnapshot};

use crate::auth::AuthUser;
use crate::error::Result;
use crate::handlers::{handle_changes, handle_fetch, handle_push, ChangesQuery};
use crate::AppState;

/// Create sync routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/sync/operations", post(push_handler))
        .route(
            "/sync/entities/{tenant_id}/{entity_type}/{id}",
            get(fetch_handler),
        )
        .route("/sync/changes", get(changes_handler))
}

/// POST /sync/operations - Apply one operation.
async fn push_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Json(request): Json<PushRequest>,
) -> Result<(StatusCode, Json<PushResult>)> {
    let (status, result) = handle_push(&state.pool, &state.schema, request).await?;
    Ok((status, Json(result)))
}

/// GET /sync/entities/{tenant_id}/{entity_type}/{id} - Current entity state.
async fn fetch_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path((tenant_id, entity_type, id)): Path<(String, String, String)>,
) -> Result<Json<ServerSnapshot>> {
    let snapshot = handle_fetch(&state.pool, &tenant_id, &entity_type, &id).await?;
    Ok(Json(snapshot))
}

/// GET /sync/changes - Entity changes after a cursor.
async fn changes_handler(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<ChangesQuery>,
) -> Result<Json<ChangesPage>> {
    let page = handle_changes(&state.pool, query).await?;
    Ok(Json(page))
}
