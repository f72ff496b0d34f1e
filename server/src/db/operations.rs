//! Database operations for the applied_operations table.

use practice_sync_engine::{PushRequest, PushResult};
use sqlx::{PgExecutor, Row};

/// Result recorded for an operation applied earlier, if any.
pub async fn get_applied_result<'e>(
    executor: impl PgExecutor<'e>,
    operation_id: &str,
) -> Result<Option<PushResult>, sqlx::Error> {
    let row = sqlx::query(r#"SELECT result FROM applied_operations WHERE operation_id = $1"#)
        .bind(operation_id)
        .fetch_optional(executor)
        .await?;

    match row {
        Some(row) => {
            let result: serde_json::Value = row.try_get("result")?;
            serde_json::from_value(result)
                .map(Some)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))
        }
        None => Ok(None),
    }
}

/// Record the result of an accepted operation.
pub async fn insert_applied<'e>(
    executor: impl PgExecutor<'e>,
    request: &PushRequest,
    entity_id: &str,
    result: &PushResult,
    now: i64,
) -> Result<(), sqlx::Error> {
    let result = serde_json::to_value(result).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;
    sqlx::query(
        r#"
        INSERT INTO applied_operations (
            operation_id, tenant_id, entity_type, entity_id, operation, result, applied_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(&request.operation_id)
    .bind(&request.tenant_id)
    .bind(request.entity_type.as_str())
    .bind(entity_id)
    .bind(request.operation.action())
    .bind(result)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(())
}

/// Check if a SQL error is a unique constraint violation.
pub fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        // PostgreSQL unique violation code is "23505"
        db_err.code().map(|c| c == "23505").unwrap_or(false)
    } else {
        false
    }
}
