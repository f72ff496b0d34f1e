//! Tenant database management.
//!
//! Each tenant owns one on-device database. Practices partition the tenant's
//! entity data into practice-namespaced stores, while the tenant-wide system
//! stores (queue, mappings, conflicts, caches) live alongside them.

mod layout;
mod manager;
mod pool;

pub use layout::{
    database_name, entity_store_name, practice_stores, store_name, system_stores, CACHE_STORE,
    CONFLICTS_STORE, ID_MAPPINGS_STORE, METADATA_STORE, PERMISSIONS_STORE, SESSIONS_STORE,
    SYNC_QUEUE_STORE,
};
pub use manager::TenantDatabaseManager;
pub use pool::{ConnectionLease, PoolStats};

use crate::{error::Result, Error, PracticeId, TenantId, UserId};
use serde::{Deserialize, Serialize};

/// User recorded on mutations made without an authenticated user.
pub const SYSTEM_USER: &str = "system";

/// Explicit tenant scope passed to every storage, queue and resolver call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TenantContext {
    pub tenant_id: TenantId,
    /// Practice selected within the tenant, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub practice_id: Option<PracticeId>,
    /// Acting user, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
}

impl TenantContext {
    pub fn new(tenant_id: impl Into<TenantId>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            practice_id: None,
            user_id: None,
        }
    }

    pub fn with_practice(mut self, practice_id: impl Into<PracticeId>) -> Self {
        self.practice_id = Some(practice_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// The selected practice, required by every entity operation.
    pub fn practice(&self) -> Result<&str> {
        self.practice_id.as_deref().ok_or(Error::PracticeRequired)
    }

    /// The acting user, or [`SYSTEM_USER`].
    pub fn user(&self) -> &str {
        self.user_id.as_deref().unwrap_or(SYSTEM_USER)
    }

    /// Fail unless `tenant_id` is this context's tenant.
    pub fn ensure_tenant(&self, tenant_id: &str) -> Result<()> {
        if self.tenant_id == tenant_id {
            Ok(())
        } else {
            Err(Error::TenantMismatch {
                expected: self.tenant_id.clone(),
                actual: tenant_id.to_string(),
            })
        }
    }
}
