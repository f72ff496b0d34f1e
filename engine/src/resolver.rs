//! Temporary identifier resolution.
//!
//! When the server acknowledges a create, the temp id it was queued under is
//! mapped to the server's id and every stored reference to it is rewritten:
//! the entity itself, declared reference fields and nested JSON in every
//! practice store of the tenant, and all unfinished queued operations.

use crate::database::{TenantContext, TenantDatabaseManager, ID_MAPPINGS_STORE};
use crate::entity_store::{EntityQuery, EntityStore};
use crate::queue::SyncQueue;
use crate::schema::{identifier_value, EntitySchema, FieldType, Schema};
use crate::{error::Result, temp_id, EntityId, EntityType, Error, OperationId, TenantId, Timestamp};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// A resolved temporary identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdMapping {
    pub temp_id: EntityId,
    pub real_id: EntityId,
    pub entity_type: EntityType,
    pub tenant_id: TenantId,
    pub created_at: Timestamp,
    pub synced_at: Timestamp,
    /// Create operation whose acknowledgement produced the mapping
    pub operation_id: OperationId,
}

/// Replace `from` with `to` wherever a string equals it inside `value`.
fn replace_nested(value: &mut Value, from: &str, to: &Value) -> bool {
    match value {
        Value::String(s) if s == from => {
            *value = to.clone();
            true
        }
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| replace_nested(item, from, to) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| replace_nested(item, from, to) || changed),
        _ => false,
    }
}

/// Rewrite references to the `target` entity `temp` inside a payload shaped
/// by `schema`: the payload's own `id` when it is that entity, declared
/// reference fields pointing at `target`, and nested JSON fields. Returns
/// whether anything changed.
pub(crate) fn rewrite_payload(
    schema: &EntitySchema,
    data: &mut Value,
    target: EntityType,
    temp: &str,
    replacement: &Value,
) -> bool {
    let Some(obj) = data.as_object_mut() else {
        return false;
    };
    let mut changed = false;

    if schema.entity_type == target {
        if let Some(id) = obj.get_mut("id") {
            if id.as_str() == Some(temp) {
                *id = replacement.clone();
                changed = true;
            }
        }
    }

    for field in &schema.fields {
        let Some(value) = obj.get_mut(&field.name) else {
            continue;
        };
        match field.field_type {
            FieldType::Reference(t) if t == target => {
                if value.as_str() == Some(temp) {
                    *value = replacement.clone();
                    changed = true;
                }
            }
            FieldType::ReferenceList(t) if t == target => {
                for item in value.as_array_mut().into_iter().flatten() {
                    if item.as_str() == Some(temp) {
                        *item = replacement.clone();
                        changed = true;
                    }
                }
            }
            FieldType::Json => changed |= replace_nested(value, temp, replacement),
            _ => {}
        }
    }

    changed
}

/// Collect every temp id string inside a JSON value.
fn collect_temp_ids(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(s) if temp_id::is_temp_id(s) => {
            if !out.contains(s) {
                out.push(s.clone());
            }
        }
        Value::Array(items) => items.iter().for_each(|v| collect_temp_ids(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_temp_ids(v, out)),
        _ => {}
    }
}

pub struct TempIdResolver {
    databases: Arc<TenantDatabaseManager>,
    entities: Arc<EntityStore>,
    queue: Arc<SyncQueue>,
    schema: Arc<Schema>,
    /// Mappings by tenant and temp id, tagged with the manager generation
    /// they were read under
    cache: DashMap<(TenantId, EntityId), (u64, IdMapping)>,
}

impl TempIdResolver {
    pub fn new(
        databases: Arc<TenantDatabaseManager>,
        entities: Arc<EntityStore>,
        queue: Arc<SyncQueue>,
        schema: Arc<Schema>,
    ) -> Self {
        Self {
            databases,
            entities,
            queue,
            schema,
            cache: DashMap::new(),
        }
    }

    /// Mint a temp id for a record created offline.
    pub fn generate(&self, entity_type: EntityType) -> EntityId {
        temp_id::generate(entity_type)
    }

    async fn lookup(&self, ctx: &TenantContext, temp: &str) -> Result<Option<IdMapping>> {
        let key = (ctx.tenant_id.clone(), temp.to_string());
        let generation = self.databases.generation();
        if let Some(entry) = self.cache.get(&key) {
            if entry.0 == generation {
                return Ok(Some(entry.1.clone()));
            }
        }
        self.cache.remove_if(&key, |_, (cached, _)| *cached != generation);

        let lease = self.databases.connection(ctx).await?;
        let Some(value) = lease.get(ID_MAPPINGS_STORE, temp).await? else {
            return Ok(None);
        };
        let mapping: IdMapping = serde_json::from_value(value)?;
        ctx.ensure_tenant(&mapping.tenant_id)?;
        self.cache.insert(key, (generation, mapping.clone()));
        Ok(Some(mapping))
    }

    /// Record that `temp` is now `real` and rewrite every stored reference.
    ///
    /// Replaying the same mapping leaves data untouched; mapping a temp id
    /// to a different real id is rejected.
    pub async fn map_temp_to_real(
        &self,
        ctx: &TenantContext,
        temp: &str,
        real: &str,
        entity_type: EntityType,
        operation_id: &str,
    ) -> Result<IdMapping> {
        if !temp_id::is_temp_id(temp) {
            return Err(Error::Validation(format!("'{}' is not a temporary id", temp)));
        }
        if real.is_empty() || temp_id::is_temp_id(real) {
            return Err(Error::Validation(format!("'{}' is not a server id", real)));
        }

        let mapping = match self.lookup(ctx, temp).await? {
            Some(existing) if existing.real_id == real => existing,
            Some(existing) => {
                return Err(Error::Validation(format!(
                    "temp id '{}' is already mapped to '{}', not '{}'",
                    temp, existing.real_id, real
                )))
            }
            None => {
                let now = crate::now_millis();
                let mapping = IdMapping {
                    temp_id: temp.to_string(),
                    real_id: real.to_string(),
                    entity_type,
                    tenant_id: ctx.tenant_id.clone(),
                    created_at: now,
                    synced_at: now,
                    operation_id: operation_id.to_string(),
                };
                let generation = self.databases.generation();
                let lease = self.databases.connection(ctx).await?;
                lease
                    .put(ID_MAPPINGS_STORE, temp, &serde_json::to_value(&mapping)?)
                    .await?;
                self.cache.insert(
                    (ctx.tenant_id.clone(), temp.to_string()),
                    (generation, mapping.clone()),
                );
                mapping
            }
        };

        // Rewriting is idempotent, so a replay also finishes an interrupted one.
        let rewritten = self.rewrite_everywhere(ctx, entity_type, temp, real).await?;
        info!(
            temp_id = temp,
            real_id = real,
            entity_type = %entity_type,
            rewritten,
            "mapped temp id"
        );
        Ok(mapping)
    }

    async fn rewrite_everywhere(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        temp: &str,
        real: &str,
    ) -> Result<usize> {
        let replacement = identifier_value(real);
        let mut rewritten = 0;

        for practice_id in self.databases.registered_practices(&ctx.tenant_id).await? {
            let pctx = TenantContext {
                practice_id: Some(practice_id),
                ..ctx.clone()
            };

            if self.entities.rekey(&pctx, entity_type, temp, real).await?.is_some() {
                rewritten += 1;
            }

            for schema in self.schema.entities.values() {
                let affected = schema.entity_type == entity_type
                    || schema.nested_fields().next().is_some()
                    || schema.relationship_fields().any(|(_, t)| t == entity_type);
                if !affected {
                    continue;
                }

                let records = self
                    .entities
                    .get_all(&pctx, schema.entity_type, &EntityQuery::new().including_deleted())
                    .await?;
                for mut record in records {
                    if rewrite_payload(schema, &mut record.data, entity_type, temp, &replacement) {
                        self.entities.put_raw(&pctx, &record).await?;
                        rewritten += 1;
                    }
                }
            }
        }

        rewritten += self
            .queue
            .rewrite_references(ctx, entity_type, temp, real)
            .await?;
        Ok(rewritten)
    }

    /// Real id for `id`, or `id` itself when it is not a mapped temp id.
    pub async fn resolve(&self, ctx: &TenantContext, id: &str) -> Result<EntityId> {
        if !temp_id::is_temp_id(id) {
            return Ok(id.to_string());
        }
        Ok(self
            .lookup(ctx, id)
            .await?
            .map(|m| m.real_id)
            .unwrap_or_else(|| id.to_string()))
    }

    /// Copy of `value` with every mapped temp id replaced by its real id.
    pub async fn resolve_all(&self, ctx: &TenantContext, value: &Value) -> Result<Value> {
        let mut temp_ids = Vec::new();
        collect_temp_ids(value, &mut temp_ids);

        let mut resolved = value.clone();
        for temp in temp_ids {
            if let Some(mapping) = self.lookup(ctx, &temp).await? {
                replace_nested(&mut resolved, &temp, &identifier_value(&mapping.real_id));
            }
        }
        Ok(resolved)
    }

    /// Whether `id` is a temp id with no mapping yet.
    pub async fn is_unresolved(&self, ctx: &TenantContext, id: &str) -> Result<bool> {
        Ok(temp_id::is_temp_id(id) && self.lookup(ctx, id).await?.is_none())
    }

    /// Every mapping of the context's tenant, oldest first.
    pub async fn mappings(&self, ctx: &TenantContext) -> Result<Vec<IdMapping>> {
        let lease = self.databases.connection(ctx).await?;
        let mut mappings = Vec::new();
        for value in lease.get_all(ID_MAPPINGS_STORE).await? {
            let mapping: IdMapping = serde_json::from_value(value)?;
            ctx.ensure_tenant(&mapping.tenant_id)?;
            mappings.push(mapping);
        }
        mappings.sort_by_key(|m| m.created_at);
        Ok(mappings)
    }

    /// Drop mappings synced more than `max_age` ago.
    pub async fn gc_mappings(&self, ctx: &TenantContext, max_age: Duration) -> Result<usize> {
        let cutoff = crate::now_millis().saturating_sub(max_age.as_millis() as u64);
        let lease = self.databases.connection(ctx).await?;

        let mut removed = 0;
        for mapping in self.mappings(ctx).await? {
            if mapping.synced_at < cutoff {
                lease.delete(ID_MAPPINGS_STORE, &mapping.temp_id).await?;
                self.cache
                    .remove(&(ctx.tenant_id.clone(), mapping.temp_id.clone()));
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "collected old id mappings");
        }
        Ok(removed)
    }

    /// Temp ids referenced by `data` that still have no real id.
    pub(crate) async fn unresolved_references(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        data: &Value,
    ) -> Result<Vec<EntityId>> {
        let mut pending = Vec::new();
        for reference in self.schema.references(entity_type, data) {
            if self.is_unresolved(ctx, &reference.id).await? && !pending.contains(&reference.id) {
                pending.push(reference.id);
            }
        }
        Ok(pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::config::PoolConfig;
    use crate::queue::{OperationKind, Priority};
    use crate::record::SyncStatus;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    struct Fixture {
        resolver: TempIdResolver,
        entities: Arc<EntityStore>,
        queue: Arc<SyncQueue>,
        ctx: TenantContext,
    }

    async fn setup() -> Fixture {
        let databases = Arc::new(TenantDatabaseManager::new(
            Arc::new(MemoryBackend::new()),
            PoolConfig::default(),
        ));
        databases.register_practice("p1", "t1").await.unwrap();
        databases.register_practice("p2", "t1").await.unwrap();
        let schema = Arc::new(Schema::clinical());
        let entities = Arc::new(EntityStore::new(Arc::clone(&databases), Arc::clone(&schema)));
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&databases),
            Arc::clone(&schema),
            BackoffPolicy::default(),
        ));
        let resolver = TempIdResolver::new(databases, Arc::clone(&entities), Arc::clone(&queue), schema);
        Fixture {
            resolver,
            entities,
            queue,
            ctx: TenantContext::new("t1").with_practice("p1").with_user("u1"),
        }
    }

    #[test]
    fn nested_replacement_is_exact() {
        let mut value = json!({"a": ["temp_1_x_pet", "temp_1_x_pet_2"], "b": {"c": "temp_1_x_pet"}});
        assert!(replace_nested(&mut value, "temp_1_x_pet", &json!(5)));
        assert_eq!(value, json!({"a": [5, "temp_1_x_pet_2"], "b": {"c": 5}}));
    }

    #[test]
    fn undeclared_fields_are_not_rewritten() {
        let schema = Schema::clinical();
        let pets = schema.get(EntityType::Pet).unwrap();
        let mut data = json!({"clientId": "temp_1_a_client", "nickname": "temp_1_a_client"});
        assert!(rewrite_payload(pets, &mut data, EntityType::Client, "temp_1_a_client", &json!(9)));
        assert_eq!(data, json!({"clientId": 9, "nickname": "temp_1_a_client"}));
    }

    #[tokio::test]
    async fn mapping_propagates_to_every_reference() {
        let f = setup().await;
        let client = f
            .entities
            .save(&f.ctx, EntityType::Client, json!({"firstName": "A", "lastName": "B"}), SyncStatus::Pending)
            .await
            .unwrap();
        let pet = f
            .entities
            .save(
                &f.ctx,
                EntityType::Pet,
                json!({"name": "Rex", "species": "dog", "clientId": client.id}),
                SyncStatus::Pending,
            )
            .await
            .unwrap();
        let p2 = TenantContext::new("t1").with_practice("p2");
        let invoice = f
            .entities
            .save(
                &p2,
                EntityType::Invoice,
                json!({"clientId": client.id, "lineItems": [{"billTo": client.id}]}),
                SyncStatus::Pending,
            )
            .await
            .unwrap();
        let op = f
            .queue
            .enqueue(
                &f.ctx,
                EntityType::Pet,
                &pet.id,
                OperationKind::Create,
                pet.data.clone(),
                Priority::Normal,
            )
            .await
            .unwrap();

        f.resolver
            .map_temp_to_real(&f.ctx, &client.id, "501", EntityType::Client, "op-1")
            .await
            .unwrap();

        assert!(f.entities.get(&f.ctx, EntityType::Client, "501").await.unwrap().is_some());
        let pet = f.entities.get(&f.ctx, EntityType::Pet, &pet.id).await.unwrap().unwrap();
        assert_eq!(pet.data["clientId"], json!(501));
        let invoice = f.entities.get(&p2, EntityType::Invoice, &invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.data["clientId"], json!(501));
        assert_eq!(invoice.data["lineItems"][0]["billTo"], json!(501));
        let op = f.queue.get(&f.ctx, &op.id).await.unwrap();
        assert_eq!(op.data["clientId"], json!(501));
        assert_eq!(op.relationships[0].id, "501");
    }

    #[tokio::test]
    async fn replaying_a_mapping_is_a_no_op() {
        let f = setup().await;
        let temp = "temp_1_abc_client";
        let first = f
            .resolver
            .map_temp_to_real(&f.ctx, temp, "77", EntityType::Client, "op-1")
            .await
            .unwrap();
        let second = f
            .resolver
            .map_temp_to_real(&f.ctx, temp, "77", EntityType::Client, "op-1")
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(f.resolver.mappings(&f.ctx).await.unwrap().len(), 1);
        assert!(matches!(
            f.resolver
                .map_temp_to_real(&f.ctx, temp, "78", EntityType::Client, "op-2")
                .await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn resolve_passes_through_unknown_ids() {
        let f = setup().await;
        f.resolver
            .map_temp_to_real(&f.ctx, "temp_1_abc_pet", "501", EntityType::Pet, "op-1")
            .await
            .unwrap();

        assert_eq!(f.resolver.resolve(&f.ctx, "temp_1_abc_pet").await.unwrap(), "501");
        assert_eq!(f.resolver.resolve(&f.ctx, "temp_2_def_pet").await.unwrap(), "temp_2_def_pet");
        assert_eq!(f.resolver.resolve(&f.ctx, "42").await.unwrap(), "42");

        let resolved = f
            .resolver
            .resolve_all(&f.ctx, &json!({"petId": "temp_1_abc_pet", "other": ["temp_2_def_pet"]}))
            .await
            .unwrap();
        assert_eq!(resolved, json!({"petId": 501, "other": ["temp_2_def_pet"]}));
    }

    #[tokio::test]
    async fn mappings_are_tenant_scoped() {
        let f = setup().await;
        f.resolver
            .map_temp_to_real(&f.ctx, "temp_1_abc_pet", "501", EntityType::Pet, "op-1")
            .await
            .unwrap();

        let other = TenantContext::new("t2");
        assert_eq!(
            f.resolver.resolve(&other, "temp_1_abc_pet").await.unwrap(),
            "temp_1_abc_pet"
        );
    }

    #[tokio::test]
    async fn deleted_database_takes_cached_mappings_with_it() {
        let f = setup().await;
        f.resolver
            .map_temp_to_real(&f.ctx, "temp_1_abc_pet", "501", EntityType::Pet, "op-1")
            .await
            .unwrap();
        assert_eq!(f.resolver.resolve(&f.ctx, "temp_1_abc_pet").await.unwrap(), "501");

        f.resolver.databases.delete_tenant_database("t1").await.unwrap();

        assert_eq!(
            f.resolver.resolve(&f.ctx, "temp_1_abc_pet").await.unwrap(),
            "temp_1_abc_pet"
        );
        assert!(f.resolver.mappings(&f.ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn gc_removes_old_mappings() {
        let f = setup().await;
        f.resolver
            .map_temp_to_real(&f.ctx, "temp_1_abc_pet", "501", EntityType::Pet, "op-1")
            .await
            .unwrap();

        assert_eq!(f.resolver.gc_mappings(&f.ctx, Duration::from_secs(3600)).await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(f.resolver.gc_mappings(&f.ctx, Duration::ZERO).await.unwrap(), 1);
        assert!(f.resolver.mappings(&f.ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_non_temp_ids() {
        let f = setup().await;
        assert!(f
            .resolver
            .map_temp_to_real(&f.ctx, "12", "13", EntityType::Pet, "op")
            .await
            .is_err());
        assert!(f
            .resolver
            .map_temp_to_real(&f.ctx, "temp_1_a_pet", "temp_2_b_pet", EntityType::Pet, "op")
            .await
            .is_err());
    }
}
