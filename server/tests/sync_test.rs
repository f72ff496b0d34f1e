//! Wire protocol tests for the sync endpoints.
//!
//! These check the JSON contract between practice-sync clients and the
//! server without a database.

use practice_sync_engine::{
    ChangesPage, EntityType, OperationKind, Priority, PushRequest, PushResult, ServerSnapshot,
    SyncOperation, TenantContext,
};
use serde_json::json;

/// Test helper to create a snapshot as the server stores it.
fn snapshot(id: &str, version: u64, deleted: bool) -> ServerSnapshot {
    ServerSnapshot {
        id: id.to_string(),
        entity_type: EntityType::Pet,
        practice_id: "north".to_string(),
        data: json!({"name": "Rex", "species": "dog", "clientId": 501}),
        version,
        last_modified: 1_706_745_600_000 + version,
        deleted,
    }
}

#[cfg(test)]
mod protocol_tests {
    use super::*;

    #[test]
    fn test_push_request_deserialization() {
        let json = r#"{
            "operationId": "op-1",
            "tenantId": "acme",
            "practiceId": "north",
            "userId": "dr-lee",
            "entityType": "appointment",
            "entityId": "temp_1706745600000_a1b2c3d4e_appointment",
            "operation": "create",
            "data": {"petId": 502, "scheduledAt": 1706745600000},
            "timestamp": 1706745600000
        }"#;

        let request: PushRequest = serde_json::from_str(json).unwrap();

        assert_eq!(request.entity_type, EntityType::Appointment);
        assert_eq!(request.operation, OperationKind::Create);
        assert_eq!(request.base_version, None);
        assert_eq!(request.data["petId"], json!(502));
    }

    #[test]
    fn test_push_request_from_queued_operation() {
        let ctx = TenantContext::new("acme").with_practice("north").with_user("dr-lee");
        let op = SyncOperation::new(
            &ctx,
            EntityType::Client,
            "41",
            OperationKind::Delete,
            json!({"firstName": "Ada", "_deleted": true}),
            Priority::Normal,
        )
        .unwrap()
        .with_base_version(Some(3));

        let body = serde_json::to_value(PushRequest::from(&op)).unwrap();

        assert_eq!(body["operation"], json!("delete"));
        assert_eq!(body["entityType"], json!("client"));
        assert_eq!(body["baseVersion"], json!(3));
        assert_eq!(body["practiceId"], json!("north"));
    }

    #[test]
    fn test_push_result_serialization() {
        let created = serde_json::to_value(PushResult::accepted(Some("502".into()), 1)).unwrap();
        assert_eq!(created, json!({"success": true, "realId": "502", "serverVersion": 1}));

        let rejected = serde_json::to_value(PushResult::rejected("stale base version")).unwrap();
        assert_eq!(rejected, json!({"success": false, "error": "stale base version"}));
    }

    #[test]
    fn test_changes_page_serialization() {
        let page = ChangesPage {
            changes: vec![snapshot("502", 2, false), snapshot("503", 4, true)],
            next_cursor: Some("1706745600004_503".to_string()),
            has_more: false,
        };

        let json = serde_json::to_value(&page).unwrap();

        assert_eq!(json["nextCursor"], json!("1706745600004_503"));
        assert_eq!(json["hasMore"], json!(false));
        assert_eq!(json["changes"][0]["entityType"], json!("pet"));
        assert_eq!(json["changes"][0]["lastModified"], json!(1_706_745_600_002u64));
        assert_eq!(json["changes"][1]["deleted"], json!(true));
    }

    #[test]
    fn test_snapshot_without_deleted_flag_is_live() {
        let json = r#"{
            "id": "41",
            "entityType": "client",
            "practiceId": "north",
            "data": {"firstName": "Ada", "lastName": "Byrne"},
            "version": 2,
            "lastModified": 1706745600000
        }"#;

        let snapshot: ServerSnapshot = serde_json::from_str(json).unwrap();

        assert!(!snapshot.deleted);
        assert_eq!(snapshot.entity_type, EntityType::Client);
    }

    #[test]
    fn test_entity_type_path_segments() {
        for entity_type in EntityType::ALL {
            let segment = entity_type.to_string();
            assert_eq!(segment.parse::<EntityType>().unwrap(), entity_type);
            assert!(!segment.contains('/'));
        }
    }
}
