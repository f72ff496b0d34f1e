//! Push handler - applies one client operation.

use crate::db::{self, NewEntity, StoredEntity};
use crate::error::Result;
use axum::http::StatusCode;
use practice_sync_engine::{temp_id, OperationKind, PushRequest, PushResult, Schema};
use sqlx::PgPool;

/// Why an operation was not applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Rejection {
    #[error("entity not found")]
    NotFound,

    #[error("entity has been deleted")]
    Deleted,

    #[error("stale base version: based on {based_on}, server is at {current}")]
    Stale { based_on: u64, current: u64 },

    #[error("{0}")]
    Invalid(String),
}

impl Rejection {
    /// Status the rejection is reported with. Clients read the body of both.
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::Invalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            _ => StatusCode::CONFLICT,
        }
    }

    fn into_response(self) -> (StatusCode, PushResult) {
        (self.status(), PushResult::rejected(self.to_string()))
    }
}

/// Validate the payload of a create or update.
pub fn check_payload(schema: &Schema, request: &PushRequest) -> std::result::Result<(), Rejection> {
    if request.operation == OperationKind::Delete {
        return Ok(());
    }
    schema
        .validate(request.entity_type, &request.data)
        .map_err(|e| Rejection::Invalid(e.to_string()))?;

    if let Some(reference) = schema
        .references(request.entity_type, &request.data)
        .into_iter()
        .find(|r| temp_id::is_temp_id(&r.id))
    {
        return Err(Rejection::Invalid(format!(
            "unresolved temporary reference in {}: {}",
            reference.field, reference.id
        )));
    }
    Ok(())
}

/// Update and delete need a live entity at the version the client built on.
pub fn check_target(
    existing: Option<&StoredEntity>,
    base_version: Option<u64>,
) -> std::result::Result<&StoredEntity, Rejection> {
    let entity = existing.ok_or(Rejection::NotFound)?;
    if entity.deleted {
        return Err(Rejection::Deleted);
    }
    let current = entity.version.max(0) as u64;
    match base_version {
        Some(based_on) if based_on != current => Err(Rejection::Stale { based_on, current }),
        _ => Ok(entity),
    }
}

/// Apply a push request. Replays of an applied operation return the
/// recorded result.
pub async fn handle_push(
    pool: &PgPool,
    schema: &Schema,
    request: PushRequest,
) -> Result<(StatusCode, PushResult)> {
    if let Some(result) = db::get_applied_result(pool, &request.operation_id).await? {
        tracing::debug!("Operation {} already applied", request.operation_id);
        return Ok((StatusCode::OK, result));
    }

    if let Err(rejection) = check_payload(schema, &request) {
        tracing::warn!("Rejected operation {}: {}", request.operation_id, rejection);
        return Ok(rejection.into_response());
    }

    let now = chrono::Utc::now().timestamp_millis();
    let mut tx = pool.begin().await?;

    let (stored, real_id) = match request.operation {
        OperationKind::Create => {
            let stored = db::insert_entity(
                &mut *tx,
                NewEntity {
                    tenant_id: &request.tenant_id,
                    practice_id: &request.practice_id,
                    entity_type: request.entity_type,
                    data: &request.data,
                    user_id: &request.user_id,
                    now,
                },
            )
            .await?;
            let real_id = stored.id.to_string();
            (stored, Some(real_id))
        }
        OperationKind::Update | OperationKind::Delete => {
            // Temporary and other non-numeric ids never exist here.
            let existing = match request.entity_id.parse::<i64>() {
                Ok(id) => {
                    db::get_entity(&mut *tx, &request.tenant_id, request.entity_type, id, true).await?
                }
                Err(_) => None,
            };
            let target_id = match check_target(existing.as_ref(), request.base_version) {
                Ok(entity) => entity.id,
                Err(rejection) => {
                    tx.rollback().await?;
                    tracing::warn!("Rejected operation {}: {}", request.operation_id, rejection);
                    return Ok(rejection.into_response());
                }
            };
            let stored = db::write_entity(
                &mut *tx,
                target_id,
                &request.data,
                request.operation == OperationKind::Delete,
                &request.user_id,
                now,
            )
            .await?;
            (stored, None)
        }
    };

    let result = PushResult::accepted(real_id, stored.version.max(0) as u64);
    if let Err(e) =
        db::insert_applied(&mut *tx, &request, &stored.id.to_string(), &result, now).await
    {
        if db::is_unique_violation(&e) {
            // A concurrent retry of the same operation committed first.
            tx.rollback().await?;
            if let Some(result) = db::get_applied_result(pool, &request.operation_id).await? {
                return Ok((StatusCode::OK, result));
            }
        }
        return Err(e.into());
    }
    tx.commit().await?;

    tracing::info!(
        "Applied {} {} {} -> {} (version {})",
        request.operation,
        request.entity_type,
        request.entity_id,
        stored.id,
        stored.version
    );
    Ok((StatusCode::OK, result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use practice_sync_engine::EntityType;
    use serde_json::json;

    fn stored(version: i64, deleted: bool) -> StoredEntity {
        StoredEntity {
            id: 7,
            tenant_id: "acme".into(),
            practice_id: "north".into(),
            entity_type: "client".into(),
            data: json!({"firstName": "Ada", "lastName": "Byrne"}),
            version,
            deleted,
            updated_at: 1_000,
        }
    }

    fn request(operation: OperationKind, entity_type: EntityType, data: serde_json::Value) -> PushRequest {
        PushRequest {
            operation_id: "op-1".into(),
            tenant_id: "acme".into(),
            practice_id: "north".into(),
            user_id: "dr-lee".into(),
            entity_type,
            entity_id: "temp_1_abc_pet".into(),
            operation,
            data,
            base_version: None,
            timestamp: 1_000,
        }
    }

    #[test]
    fn target_must_exist_and_be_live() {
        assert_eq!(check_target(None, Some(1)).unwrap_err(), Rejection::NotFound);
        assert_eq!(check_target(Some(&stored(2, true)), None).unwrap_err(), Rejection::Deleted);
        assert_eq!(check_target(Some(&stored(2, false)), None).unwrap().id, 7);
    }

    #[test]
    fn stale_base_version_is_rejected() {
        assert!(check_target(Some(&stored(3, false)), Some(3)).is_ok());
        let rejection = check_target(Some(&stored(3, false)), Some(2)).unwrap_err();
        assert_eq!(rejection, Rejection::Stale { based_on: 2, current: 3 });
        assert_eq!(rejection.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn payload_is_validated_against_the_clinical_schema() {
        let schema = Schema::clinical();

        let ok = request(OperationKind::Create, EntityType::Pet, json!({"name": "Rex", "species": "dog", "clientId": 501}));
        assert_eq!(check_payload(&schema, &ok), Ok(()));

        let missing = request(OperationKind::Create, EntityType::Pet, json!({"name": "Rex"}));
        let rejection = check_payload(&schema, &missing).unwrap_err();
        assert_eq!(rejection.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let temp_ref = request(
            OperationKind::Create,
            EntityType::Pet,
            json!({"name": "Rex", "species": "dog", "clientId": "temp_1_abc_client"}),
        );
        assert!(matches!(check_payload(&schema, &temp_ref), Err(Rejection::Invalid(_))));

        let delete = request(OperationKind::Delete, EntityType::Pet, json!({"_deleted": true}));
        assert_eq!(check_payload(&schema, &delete), Ok(()));
    }
}
