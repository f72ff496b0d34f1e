//! Persistence of conflicts in the tenant's `conflicts` store.

use super::{Conflict, PartialResolution, Resolution};
use crate::database::{TenantContext, TenantDatabaseManager, CONFLICTS_STORE};
use crate::{error::Result, Error};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

pub struct ConflictStore {
    databases: Arc<TenantDatabaseManager>,
}

impl ConflictStore {
    pub fn new(databases: Arc<TenantDatabaseManager>) -> Self {
        Self { databases }
    }

    fn decode(ctx: &TenantContext, value: Value) -> Result<Conflict> {
        let conflict: Conflict = serde_json::from_value(value)?;
        ctx.ensure_tenant(&conflict.operation.tenant_id)?;
        Ok(conflict)
    }

    async fn save(&self, ctx: &TenantContext, conflict: &Conflict) -> Result<()> {
        ctx.ensure_tenant(&conflict.operation.tenant_id)?;
        let lease = self.databases.connection(ctx).await?;
        lease
            .put(CONFLICTS_STORE, &conflict.id, &serde_json::to_value(conflict)?)
            .await
    }

    pub async fn record(&self, ctx: &TenantContext, conflict: &Conflict) -> Result<()> {
        self.save(ctx, conflict).await?;
        debug!(
            conflict_id = %conflict.id,
            op_id = %conflict.operation.id,
            severity = conflict.severity.as_str(),
            "recorded conflict"
        );
        Ok(())
    }

    pub async fn get(&self, ctx: &TenantContext, id: &str) -> Result<Conflict> {
        let lease = self.databases.connection(ctx).await?;
        let value = lease
            .get(CONFLICTS_STORE, id)
            .await?
            .ok_or_else(|| Error::ConflictNotFound(id.to_string()))?;
        Self::decode(ctx, value)
    }

    async fn by_resolved(&self, ctx: &TenantContext, resolved: bool) -> Result<Vec<Conflict>> {
        let lease = self.databases.connection(ctx).await?;
        let mut conflicts = Vec::new();
        for value in lease
            .query_index(CONFLICTS_STORE, "resolved", &Value::Bool(resolved))
            .await?
        {
            let conflict = Self::decode(ctx, value)?;
            let in_scope = ctx
                .practice_id
                .as_ref()
                .map_or(true, |p| &conflict.operation.practice_id == p);
            if in_scope {
                conflicts.push(conflict);
            }
        }
        conflicts.sort_by_key(|c| c.detected_at);
        Ok(conflicts)
    }

    /// Conflicts awaiting a decision, oldest first.
    pub async fn unresolved(&self, ctx: &TenantContext) -> Result<Vec<Conflict>> {
        self.by_resolved(ctx, false).await
    }

    pub async fn resolved(&self, ctx: &TenantContext) -> Result<Vec<Conflict>> {
        self.by_resolved(ctx, true).await
    }

    pub async fn mark_resolved(
        &self,
        ctx: &TenantContext,
        id: &str,
        resolution: Resolution,
    ) -> Result<Conflict> {
        let mut conflict = self.get(ctx, id).await?;
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        conflict.partial_resolution = None;
        self.save(ctx, &conflict).await?;
        Ok(conflict)
    }

    /// Keep a merge that still needs field choices.
    pub async fn save_partial(
        &self,
        ctx: &TenantContext,
        id: &str,
        partial: PartialResolution,
    ) -> Result<Conflict> {
        let mut conflict = self.get(ctx, id).await?;
        conflict.partial_resolution = Some(partial);
        self.save(ctx, &conflict).await?;
        Ok(conflict)
    }

    /// Delete resolved conflicts. Returns how many were removed.
    pub async fn clear_resolved(&self, ctx: &TenantContext) -> Result<usize> {
        let resolved = self.resolved(ctx).await?;
        let lease = self.databases.connection(ctx).await?;
        for conflict in &resolved {
            lease.delete(CONFLICTS_STORE, &conflict.id).await?;
        }
        Ok(resolved.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::conflict::{ConflictType, ResolutionStrategy, Severity};
    use crate::queue::{OperationKind, Priority, SyncOperation};
    use crate::storage::MemoryBackend;
    use crate::EntityType;
    use serde_json::json;

    fn sample(ctx: &TenantContext, id: &str) -> Conflict {
        let op = SyncOperation::new(ctx, EntityType::Pet, "12", OperationKind::Update, json!({}), Priority::Normal)
            .unwrap();
        Conflict {
            id: id.into(),
            operation: op,
            local_data: json!({"name": "Rex"}),
            server_data: Some(json!({"name": "Max"})),
            server_version: Some(2),
            server_last_modified: Some(10),
            detected_at: 5,
            conflict_type: ConflictType::Version,
            affected_fields: vec!["name".into()],
            field_diffs: vec![],
            severity: Severity::Medium,
            auto_resolvable: false,
            resolved: false,
            resolution: None,
            partial_resolution: None,
        }
    }

    #[tokio::test]
    async fn lifecycle() {
        let databases = Arc::new(TenantDatabaseManager::new(
            Arc::new(MemoryBackend::new()),
            PoolConfig::default(),
        ));
        let store = ConflictStore::new(databases);
        let ctx = TenantContext::new("t1").with_practice("p1");

        store.record(&ctx, &sample(&ctx, "c1")).await.unwrap();
        store.record(&ctx, &sample(&ctx, "c2")).await.unwrap();
        assert_eq!(store.unresolved(&ctx).await.unwrap().len(), 2);

        let partial = PartialResolution {
            merged: json!({"name": "Max"}),
            pending_fields: vec!["name".into()],
        };
        let saved = store.save_partial(&ctx, "c1", partial.clone()).await.unwrap();
        assert_eq!(saved.partial_resolution, Some(partial));

        let resolved = store
            .mark_resolved(
                &ctx,
                "c1",
                Resolution {
                    strategy: ResolutionStrategy::ServerWins,
                    resolved_data: None,
                    resolved_at: 20,
                    automatic: false,
                },
            )
            .await
            .unwrap();
        assert!(resolved.resolved);
        assert!(resolved.partial_resolution.is_none());

        assert_eq!(store.unresolved(&ctx).await.unwrap().len(), 1);
        assert_eq!(store.clear_resolved(&ctx).await.unwrap(), 1);
        assert!(matches!(
            store.get(&ctx, "c1").await,
            Err(Error::ConflictNotFound(_))
        ));
    }
}
