//! Property-based tests for ordering and temporary ids

use practice_sync_engine::temp_id;
use practice_sync_engine::{
    order_operations, EntityType, OperationKind, Priority, Schema, SyncOperation, TenantContext,
};
use proptest::prelude::*;
use serde_json::json;

fn create(
    schema: &Schema,
    entity_type: EntityType,
    data: serde_json::Value,
    timestamp: u64,
    priority: Priority,
) -> SyncOperation {
    let ctx = TenantContext::new("acme").with_practice("north").with_user("dr-lee");
    let id = temp_id::generate(entity_type);
    let mut op = SyncOperation::new(&ctx, entity_type, id, OperationKind::Create, data, priority).unwrap();
    op.relationships = schema.references(entity_type, &op.data);
    op.timestamp = timestamp;
    op
}

fn priority() -> impl Strategy<Value = Priority> {
    prop_oneof![
        Just(Priority::Low),
        Just(Priority::Normal),
        Just(Priority::High),
    ]
}

proptest! {
    #[test]
    fn creates_precede_their_dependents(
        timestamps in prop::collection::vec(0u64..1_000_000, 4),
        priorities in prop::collection::vec(priority(), 4),
        order in Just(vec![0usize, 1, 2, 3]).prop_shuffle(),
    ) {
        let schema = Schema::clinical();
        let client = create(&schema, EntityType::Client, json!({"firstName": "Ada", "lastName": "Byrne"}), timestamps[0], priorities[0]);
        let pet = create(&schema, EntityType::Pet, json!({"name": "Rex", "species": "dog", "clientId": client.entity_id}), timestamps[1], priorities[1]);
        let appointment = create(
            &schema,
            EntityType::Appointment,
            json!({"petId": pet.entity_id, "clientId": client.entity_id, "scheduledAt": 1}),
            timestamps[2],
            priorities[2],
        );
        let note = create(&schema, EntityType::ClinicalNote, json!({"petId": pet.entity_id}), timestamps[3], priorities[3]);

        let all = [client, pet, appointment, note];
        let shuffled: Vec<SyncOperation> = order.iter().map(|&i| all[i].clone()).collect();
        let batch = order_operations(shuffled);

        prop_assert!(!batch.has_cycles());
        prop_assert_eq!(batch.operations.len(), 4);
        let position = |entity_type: EntityType| {
            batch.operations.iter().position(|op| op.entity_type == entity_type).unwrap()
        };
        prop_assert!(position(EntityType::Client) < position(EntityType::Pet));
        prop_assert!(position(EntityType::Pet) < position(EntityType::Appointment));
        prop_assert!(position(EntityType::Pet) < position(EntityType::ClinicalNote));
    }

    #[test]
    fn independent_operations_follow_precedence_then_time(
        a in 0u64..1_000, b in 0u64..1_000,
    ) {
        let schema = Schema::clinical();
        let invoice = create(&schema, EntityType::Invoice, json!({"clientId": "41"}), a, Priority::Normal);
        let practitioner = create(&schema, EntityType::Practitioner, json!({"name": "Dr Lee"}), b, Priority::Normal);

        let batch = order_operations(vec![invoice, practitioner]);
        prop_assert_eq!(batch.operations[0].entity_type, EntityType::Practitioner);
        prop_assert_eq!(batch.operations[1].entity_type, EntityType::Invoice);
    }

    #[test]
    fn generated_temp_ids_parse_back(created_at in 0u64..4_102_444_800_000, index in 0usize..8) {
        let entity_type = EntityType::ALL[index];
        let id = temp_id::generate_at(entity_type, created_at);

        prop_assert!(temp_id::is_temp_id(&id));
        let parsed = temp_id::parse(&id).unwrap();
        prop_assert_eq!(parsed.created_at, created_at);
        prop_assert_eq!(parsed.entity_type, entity_type);
    }

    #[test]
    fn numeric_ids_are_never_temporary(id in 0u64..u64::MAX) {
        prop_assert!(!temp_id::is_temp_id(&id.to_string()));
        prop_assert!(temp_id::parse(&id.to_string()).is_none());
    }
}
