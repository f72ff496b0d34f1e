//! Offline permission and session caches.
//!
//! Both live in tenant system stores with obfuscated payloads, keyed by user.

use crate::database::{TenantContext, TenantDatabaseManager, PERMISSIONS_STORE, SESSIONS_STORE};
use crate::obfuscate::Obfuscator;
use crate::{error::Result, Error, TenantId, Timestamp, UserId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides whether the acting user may perform an action.
#[async_trait]
pub trait PermissionEvaluator: Send + Sync {
    async fn has_permission(&self, ctx: &TenantContext, permission: &str) -> Result<bool>;

    /// The subset of `required` the user lacks.
    async fn missing_permissions(&self, ctx: &TenantContext, required: &[String]) -> Result<Vec<String>> {
        let mut missing = Vec::new();
        for permission in required {
            if !self.has_permission(ctx, permission).await? {
                missing.push(permission.clone());
            }
        }
        Ok(missing)
    }
}

/// Whether `granted` covers `required`. Supports `*` and `resource:*`.
pub fn permission_matches(granted: &str, required: &str) -> bool {
    if granted == "*" || granted == required {
        return true;
    }
    match (granted.strip_suffix(":*"), required.split_once(':')) {
        (Some(resource), Some((required_resource, _))) => resource == required_resource,
        _ => false,
    }
}

/// Stored row. `payload` is the obfuscated value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedEntry {
    tenant_id: TenantId,
    user_id: UserId,
    payload: String,
    cached_at: Timestamp,
    expires_at: Timestamp,
}

impl CachedEntry {
    fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }
}

async fn load_entry(
    databases: &TenantDatabaseManager,
    ctx: &TenantContext,
    store: &str,
    user: &str,
) -> Result<Option<CachedEntry>> {
    let lease = databases.connection(ctx).await?;
    let Some(value) = lease.get(store, user).await? else {
        return Ok(None);
    };
    let entry: CachedEntry = serde_json::from_value(value)?;
    ctx.ensure_tenant(&entry.tenant_id)?;
    if entry.is_expired(crate::now_millis()) {
        lease.delete(store, user).await?;
        return Ok(None);
    }
    Ok(Some(entry))
}

pub struct PermissionCache {
    databases: Arc<TenantDatabaseManager>,
    ttl: Duration,
}

impl PermissionCache {
    pub fn new(databases: Arc<TenantDatabaseManager>, ttl: Duration) -> Self {
        Self { databases, ttl }
    }

    /// Cache the acting user's granted permissions.
    pub async fn store(&self, ctx: &TenantContext, permissions: &[String]) -> Result<()> {
        let now = crate::now_millis();
        let entry = CachedEntry {
            tenant_id: ctx.tenant_id.clone(),
            user_id: ctx.user().to_string(),
            payload: Obfuscator::for_tenant(&ctx.tenant_id).obfuscate(&permissions)?,
            cached_at: now,
            expires_at: now.saturating_add(self.ttl.as_millis() as u64),
        };
        let lease = self.databases.connection(ctx).await?;
        lease
            .put(PERMISSIONS_STORE, ctx.user(), &serde_json::to_value(&entry)?)
            .await?;
        debug!(user_id = ctx.user(), count = permissions.len(), "cached permissions");
        Ok(())
    }

    /// Cached permissions of the acting user, `None` when absent or expired.
    pub async fn permissions(&self, ctx: &TenantContext) -> Result<Option<Vec<String>>> {
        match load_entry(&self.databases, ctx, PERMISSIONS_STORE, ctx.user()).await? {
            Some(entry) => Ok(Some(Obfuscator::for_tenant(&ctx.tenant_id).reveal(&entry.payload)?)),
            None => Ok(None),
        }
    }

    pub async fn invalidate(&self, ctx: &TenantContext) -> Result<bool> {
        let lease = self.databases.connection(ctx).await?;
        lease.delete(PERMISSIONS_STORE, ctx.user()).await
    }
}

#[async_trait]
impl PermissionEvaluator for PermissionCache {
    async fn has_permission(&self, ctx: &TenantContext, permission: &str) -> Result<bool> {
        Ok(self
            .permissions(ctx)
            .await?
            .map_or(false, |granted| granted.iter().any(|g| permission_matches(g, permission))))
    }
}

/// An authenticated session as issued by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub token: String,
    pub expires_at: Timestamp,
}

pub struct SessionCache {
    databases: Arc<TenantDatabaseManager>,
}

impl SessionCache {
    pub fn new(databases: Arc<TenantDatabaseManager>) -> Self {
        Self { databases }
    }

    pub async fn store(&self, ctx: &TenantContext, session: &Session) -> Result<()> {
        ctx.ensure_tenant(&session.tenant_id)?;
        let entry = CachedEntry {
            tenant_id: session.tenant_id.clone(),
            user_id: session.user_id.clone(),
            payload: Obfuscator::for_tenant(&ctx.tenant_id).obfuscate(session)?,
            cached_at: crate::now_millis(),
            expires_at: session.expires_at,
        };
        let lease = self.databases.connection(ctx).await?;
        lease
            .put(SESSIONS_STORE, &session.user_id, &serde_json::to_value(&entry)?)
            .await
    }

    /// Live session of the acting user.
    pub async fn current(&self, ctx: &TenantContext) -> Result<Session> {
        let entry = load_entry(&self.databases, ctx, SESSIONS_STORE, ctx.user())
            .await?
            .ok_or(Error::SessionExpired)?;
        Obfuscator::for_tenant(&ctx.tenant_id).reveal(&entry.payload)
    }

    pub async fn clear(&self, ctx: &TenantContext) -> Result<bool> {
        let lease = self.databases.connection(ctx).await?;
        lease.delete(SESSIONS_STORE, ctx.user()).await
    }
}
