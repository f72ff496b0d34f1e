//! Performance benchmarks for practice-sync-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use practice_sync_engine::conflict::diff_fields;
use practice_sync_engine::storage::StoreDef;
use practice_sync_engine::{
    order_operations, temp_id, EntityType, MemoryBackend, OperationKind, Priority, Schema,
    StorageBackend, SyncOperation, TenantContext,
};
use serde_json::json;

fn create_batch(schema: &Schema, clients: usize) -> Vec<SyncOperation> {
    let ctx = TenantContext::new("acme").with_practice("north").with_user("dr-lee");
    let mut ops = Vec::with_capacity(clients * 3);
    for i in 0..clients {
        let client_id = temp_id::generate(EntityType::Client);
        let pet_id = temp_id::generate(EntityType::Pet);
        let payloads = [
            (EntityType::Client, client_id.clone(), json!({"firstName": format!("Client {}", i), "lastName": "Byrne"})),
            (EntityType::Pet, pet_id.clone(), json!({"name": "Rex", "species": "dog", "clientId": client_id})),
            (
                EntityType::Appointment,
                temp_id::generate(EntityType::Appointment),
                json!({"petId": pet_id, "clientId": client_id, "scheduledAt": 1_700_000_000_000u64}),
            ),
        ];
        for (entity_type, id, data) in payloads {
            let mut op = SyncOperation::new(&ctx, entity_type, id, OperationKind::Create, data, Priority::Normal)
                .unwrap();
            op.relationships = schema.references(entity_type, &op.data);
            ops.push(op);
        }
    }
    // Dependents first, the worst case for ordering.
    ops.reverse();
    ops
}

fn bench_ordering(c: &mut Criterion) {
    let mut group = c.benchmark_group("ordering");
    let schema = Schema::clinical();

    for size in [10, 100, 500].iter() {
        let batch = create_batch(&schema, *size);
        group.bench_with_input(BenchmarkId::new("order_operations", size), &batch, |b, batch| {
            b.iter(|| order_operations(black_box(batch.clone())))
        });
    }

    group.finish();
}

fn bench_conflicts(c: &mut Criterion) {
    let mut group = c.benchmark_group("conflicts");

    let local = json!({
        "firstName": "Ada", "lastName": "Byrne", "phone": "555-0101",
        "email": "ada@example.com", "address": {"city": "Cork"}, "color": "red",
        "_localNote": "x", "updatedAt": 1
    });
    let server = json!({
        "firstName": "Ada", "lastName": "Byrne-Walsh", "phone": "555-0199",
        "address": {"city": "Cork"}, "color": "blue", "preferredPractitionerId": 4,
        "updatedAt": 2
    });
    group.bench_function("diff_fields", |b| {
        b.iter(|| diff_fields(black_box(&local), black_box(&server)))
    });

    group.finish();
}

fn bench_temp_ids(c: &mut Criterion) {
    let mut group = c.benchmark_group("temp_ids");

    group.bench_function("generate", |b| b.iter(|| temp_id::generate(black_box(EntityType::ClinicalNote))));

    let id = temp_id::generate(EntityType::ClinicalNote);
    group.bench_function("parse", |b| b.iter(|| temp_id::parse(black_box(&id))));

    group.finish();
}

fn bench_memory_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("memory_store");
    let rt = tokio::runtime::Runtime::new().unwrap();
    let stores = vec![StoreDef::new("clients").with_index("status", "metadata.syncStatus")];
    let db = rt
        .block_on(MemoryBackend::new().open("acme", None, &stores))
        .unwrap();

    let value = json!({"id": "c1", "data": {"firstName": "Ada"}, "metadata": {"syncStatus": "pending"}});
    let mut n = 0u64;
    group.bench_function("put", |b| {
        b.iter(|| {
            n += 1;
            rt.block_on(db.put("clients", &format!("c{}", n % 1000), black_box(&value)))
        })
    });

    group.bench_function("get", |b| b.iter(|| rt.block_on(db.get("clients", black_box("c500")))));

    group.bench_function("query_index", |b| {
        b.iter(|| rt.block_on(db.query_index("clients", "status", black_box(&json!("pending")))))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_ordering,
    bench_conflicts,
    bench_temp_ids,
    bench_memory_store,
);
criterion_main!(benches);
