//! Entity store - practice-namespaced records with sync metadata.
//!
//! Every call takes an explicit [`TenantContext`]; the practice selected in
//! the context picks the store, and every record read or written is checked
//! against the context's tenant.

use crate::database::{entity_store_name, ConnectionLease, TenantContext, TenantDatabaseManager};
use crate::record::{EntityMetadata, OfflineEntity, SyncStatus, DELETED_FIELD};
use crate::schema::{identifier_of, identifier_value, Schema};
use crate::storage::WriteOp;
use crate::{error::Result, temp_id, EntityType, Error, Timestamp, UserId, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Field to order query results by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    #[default]
    LastModified,
    CreatedAt,
    Id,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SortDirection {
    Asc,
    #[default]
    Desc,
}

/// Filter, sort and pagination for [`EntityStore::get_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityQuery {
    pub sync_status: Option<SyncStatus>,
    pub user_id: Option<UserId>,
    pub modified_after: Option<Timestamp>,
    pub modified_before: Option<Timestamp>,
    pub include_deleted: bool,
    pub sort_by: SortField,
    pub direction: SortDirection,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl EntityQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: SyncStatus) -> Self {
        self.sync_status = Some(status);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn modified_between(mut self, after: Option<Timestamp>, before: Option<Timestamp>) -> Self {
        self.modified_after = after;
        self.modified_before = before;
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn sorted(mut self, field: SortField, direction: SortDirection) -> Self {
        self.sort_by = field;
        self.direction = direction;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entity: &OfflineEntity) -> bool {
        let meta = &entity.metadata;
        (self.include_deleted || entity.is_active())
            && self.sync_status.map_or(true, |s| meta.sync_status == s)
            && self.user_id.as_ref().map_or(true, |u| &meta.user_id == u)
            && self.modified_after.map_or(true, |t| meta.last_modified > t)
            && self.modified_before.map_or(true, |t| meta.last_modified < t)
    }
}

/// Storage for offline entities.
pub struct EntityStore {
    databases: Arc<TenantDatabaseManager>,
    schema: Arc<Schema>,
}

impl EntityStore {
    pub fn new(databases: Arc<TenantDatabaseManager>, schema: Arc<Schema>) -> Self {
        Self { databases, schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    async fn open(&self, ctx: &TenantContext, entity_type: EntityType) -> Result<(ConnectionLease, String)> {
        let (lease, practice_id) = self.databases.practice_connection(ctx).await?;
        Ok((lease, entity_store_name(&practice_id, entity_type)))
    }

    fn decode(ctx: &TenantContext, value: Value) -> Result<OfflineEntity> {
        let entity: OfflineEntity = serde_json::from_value(value)?;
        ctx.ensure_tenant(&entity.metadata.tenant_id)?;
        Ok(entity)
    }

    async fn write(&self, lease: &ConnectionLease, store: &str, entity: &OfflineEntity) -> Result<()> {
        let value = serde_json::to_value(entity)?;
        self.databases
            .ensure_quota(serde_json::to_vec(&value)?.len() as u64)
            .await?;
        lease.put(store, &entity.id, &value).await
    }

    /// Store a new record. Uses `data.id` when present, otherwise mints a
    /// temporary id.
    pub async fn save(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        data: Value,
        sync_status: SyncStatus,
    ) -> Result<OfflineEntity> {
        self.schema.validate(entity_type, &data)?;
        let (lease, store) = self.open(ctx, entity_type).await?;

        let id = data
            .get("id")
            .and_then(identifier_of)
            .unwrap_or_else(|| temp_id::generate(entity_type));
        let now = crate::now_millis();
        let user = ctx.user().to_string();

        let entity = OfflineEntity {
            id,
            data,
            metadata: EntityMetadata {
                tenant_id: ctx.tenant_id.clone(),
                practice_id: ctx.practice()?.to_string(),
                user_id: user.clone(),
                entity_type,
                created_at: now,
                last_modified: now,
                sync_status,
                version: 1,
                server_version: None,
                last_synced_at: None,
                created_by: user.clone(),
                modified_by: user,
            },
        };

        self.write(&lease, &store, &entity).await?;
        debug!(entity_type = %entity_type, id = %entity.id, "saved entity");
        Ok(entity)
    }

    /// Fetch an active record.
    pub async fn get(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<OfflineEntity>> {
        Ok(self
            .get_including_deleted(ctx, entity_type, id)
            .await?
            .filter(OfflineEntity::is_active))
    }

    /// Fetch a record whether or not it is tombstoned.
    pub async fn get_including_deleted(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<OfflineEntity>> {
        let (lease, store) = self.open(ctx, entity_type).await?;
        lease
            .get(&store, id)
            .await?
            .map(|v| Self::decode(ctx, v))
            .transpose()
    }

    async fn require(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<OfflineEntity> {
        self.get(ctx, entity_type, id)
            .await?
            .ok_or_else(|| Error::EntityNotFound {
                entity_type: entity_type.to_string(),
                id: id.to_string(),
            })
    }

    /// Records of one type in the context's practice.
    pub async fn get_all(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        query: &EntityQuery,
    ) -> Result<Vec<OfflineEntity>> {
        let (lease, store) = self.open(ctx, entity_type).await?;

        let raw = match query.sync_status {
            Some(status) => {
                lease
                    .query_index(&store, "syncStatus", &Value::from(status.as_str()))
                    .await?
            }
            None => lease.get_all(&store).await?,
        };

        let mut entities = Vec::with_capacity(raw.len());
        for value in raw {
            let entity = Self::decode(ctx, value)?;
            if query.matches(&entity) {
                entities.push(entity);
            }
        }

        entities.sort_by(|a, b| {
            let ordering = match query.sort_by {
                SortField::LastModified => a.metadata.last_modified.cmp(&b.metadata.last_modified),
                SortField::CreatedAt => a.metadata.created_at.cmp(&b.metadata.created_at),
                SortField::Id => a.id.cmp(&b.id),
            }
            .then_with(|| a.id.cmp(&b.id));
            match query.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(entities.into_iter().skip(query.offset).take(limit).collect())
    }

    /// Shallow-merge `patch` into an active record.
    pub async fn update(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        patch: Value,
    ) -> Result<OfflineEntity> {
        let patch = patch
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("update patch must be an object".into()))?;
        let mut entity = self.require(ctx, entity_type, id).await?;

        entity.apply_patch(patch, ctx.user(), crate::now_millis());
        self.schema.validate(entity_type, &entity.data)?;

        let (lease, store) = self.open(ctx, entity_type).await?;
        self.write(&lease, &store, &entity).await?;
        debug!(entity_type = %entity_type, id, version = entity.metadata.version, "updated entity");
        Ok(entity)
    }

    /// Tombstone an active record.
    pub async fn delete(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<OfflineEntity> {
        let mut entity = self.require(ctx, entity_type, id).await?;
        entity.mark_deleted(ctx.user(), crate::now_millis());

        let (lease, store) = self.open(ctx, entity_type).await?;
        self.write(&lease, &store, &entity).await?;
        debug!(entity_type = %entity_type, id, "tombstoned entity");
        Ok(entity)
    }

    /// Physically remove a record.
    pub(crate) async fn hard_delete(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<bool> {
        if let Some(existing) = self.get_including_deleted(ctx, entity_type, id).await? {
            ctx.ensure_tenant(&existing.metadata.tenant_id)?;
        }
        let (lease, store) = self.open(ctx, entity_type).await?;
        lease.delete(&store, id).await
    }

    /// Write a record as-is.
    pub(crate) async fn put_raw(&self, ctx: &TenantContext, entity: &OfflineEntity) -> Result<()> {
        ctx.ensure_tenant(&entity.metadata.tenant_id)?;
        let (lease, store) = self.open(ctx, entity.metadata.entity_type).await?;
        self.write(&lease, &store, entity).await
    }

    /// Record that the server confirmed the record.
    pub async fn mark_synced(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        server_version: Option<Version>,
    ) -> Result<Option<OfflineEntity>> {
        let Some(mut entity) = self.get_including_deleted(ctx, entity_type, id).await? else {
            return Ok(None);
        };
        entity.mark_synced(server_version, crate::now_millis());
        self.put_raw(ctx, &entity).await?;
        Ok(Some(entity))
    }

    pub async fn set_sync_status(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        status: SyncStatus,
    ) -> Result<Option<OfflineEntity>> {
        let Some(mut entity) = self.get_including_deleted(ctx, entity_type, id).await? else {
            return Ok(None);
        };
        if entity.metadata.sync_status != status {
            entity.metadata.sync_status = status;
            self.put_raw(ctx, &entity).await?;
        }
        Ok(Some(entity))
    }

    /// Replace the local copy with the server's state, marked synced.
    pub async fn apply_server_snapshot(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        data: Value,
        server_version: Version,
        deleted: bool,
    ) -> Result<OfflineEntity> {
        let now = crate::now_millis();
        let existing = self.get_including_deleted(ctx, entity_type, id).await?;

        let mut data = data;
        if deleted {
            if let Value::Object(map) = &mut data {
                map.insert(DELETED_FIELD.to_string(), Value::Bool(true));
            }
        }

        let metadata = match existing {
            Some(existing) => EntityMetadata {
                last_modified: now,
                sync_status: SyncStatus::Synced,
                server_version: Some(server_version),
                last_synced_at: Some(now),
                ..existing.metadata
            },
            None => EntityMetadata {
                tenant_id: ctx.tenant_id.clone(),
                practice_id: ctx.practice()?.to_string(),
                user_id: ctx.user().to_string(),
                entity_type,
                created_at: now,
                last_modified: now,
                sync_status: SyncStatus::Synced,
                version: 1,
                server_version: Some(server_version),
                last_synced_at: Some(now),
                created_by: ctx.user().to_string(),
                modified_by: ctx.user().to_string(),
            },
        };

        let entity = OfflineEntity {
            id: id.to_string(),
            data,
            metadata,
        };
        self.put_raw(ctx, &entity).await?;
        Ok(entity)
    }

    /// Move a record from `old_id` to `new_id` atomically. The payload's own
    /// `id` field, if present, follows.
    pub async fn rekey(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        old_id: &str,
        new_id: &str,
    ) -> Result<Option<OfflineEntity>> {
        let Some(mut entity) = self.get_including_deleted(ctx, entity_type, old_id).await? else {
            return Ok(None);
        };

        entity.id = new_id.to_string();
        if let Value::Object(map) = &mut entity.data {
            if map.contains_key("id") {
                map.insert("id".to_string(), identifier_value(new_id));
            }
        }

        let (lease, store) = self.open(ctx, entity_type).await?;
        lease
            .transaction(vec![
                WriteOp::delete(store.clone(), old_id),
                WriteOp::put(store, new_id, serde_json::to_value(&entity)?),
            ])
            .await?;
        Ok(Some(entity))
    }

    /// Number of records per sync status, tombstones included.
    pub async fn status_counts(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
    ) -> Result<BTreeMap<SyncStatus, usize>> {
        let all = self
            .get_all(ctx, entity_type, &EntityQuery::new().including_deleted())
            .await?;
        let mut counts = BTreeMap::new();
        for entity in all {
            *counts.entry(entity.metadata.sync_status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    /// Physically remove tombstones the server has already confirmed.
    pub async fn purge_synced_tombstones(&self, ctx: &TenantContext) -> Result<usize> {
        let mut purged = 0;
        for entity_type in EntityType::ALL {
            let query = EntityQuery::new()
                .with_status(SyncStatus::Synced)
                .including_deleted();
            for entity in self.get_all(ctx, entity_type, &query).await? {
                if entity.is_deleted() && self.hard_delete(ctx, entity_type, &entity.id).await? {
                    purged += 1;
                }
            }
        }
        if purged > 0 {
            debug!(purged, "purged synced tombstones");
        }
        Ok(purged)
    }
}
