//! Tenant database manager.
//!
//! Owns every connection to the storage backend. Connections are pooled per
//! tenant, swept when idle and evicted least-recently-used at capacity. The
//! current tenant is never evicted.

use super::layout::{self, METADATA_STORE};
use super::pool::{ConnectionLease, ConnectionPool, PoolStats};
use super::TenantContext;
use crate::config::PoolConfig;
use crate::storage::{check_quota, LocalStore, QuotaCheck, StorageBackend, StoreDef};
use crate::{error::Result, Error, PracticeId, SchemaVersion, TenantId};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PRACTICE_KEY_PREFIX: &str = "practice:";

fn practice_key(practice_id: &str) -> String {
    format!("{}{}", PRACTICE_KEY_PREFIX, practice_id)
}

pub struct TenantDatabaseManager {
    backend: Arc<dyn StorageBackend>,
    config: PoolConfig,
    pool: Mutex<ConnectionPool>,
    current: RwLock<Option<TenantContext>>,
    /// Bumped whenever a database is deleted
    generation: AtomicU64,
}

impl TenantDatabaseManager {
    pub fn new(backend: Arc<dyn StorageBackend>, config: PoolConfig) -> Self {
        Self {
            backend,
            config,
            pool: Mutex::new(ConnectionPool::default()),
            current: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// Changes every time a tenant database is deleted or recreated. Data
    /// cached outside storage is stale once this moves.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// Make `tenant_id` the current tenant, opening its database if needed.
    pub async fn set_current_tenant(
        &self,
        tenant_id: &str,
        practice_id: Option<&str>,
    ) -> Result<TenantContext> {
        let mut ctx = TenantContext::new(tenant_id);
        ctx.practice_id = practice_id.map(str::to_string);

        *self.current.write().await = Some(ctx.clone());
        self.initialize(tenant_id).await?;
        debug!(tenant_id, ?practice_id, "current tenant set");
        Ok(ctx)
    }

    /// Context of the current tenant, if one is set.
    pub async fn current_context(&self) -> Option<TenantContext> {
        self.current.read().await.clone()
    }

    async fn current_tenant(&self) -> Option<TenantId> {
        self.current.read().await.as_ref().map(|c| c.tenant_id.clone())
    }

    /// Open or reuse the tenant's connection, creating the system stores on
    /// first open.
    pub async fn initialize(&self, tenant_id: &str) -> Result<ConnectionLease> {
        let current = self.current_tenant().await;
        let mut pool = self.pool.lock().await;
        self.lease_locked(&mut pool, tenant_id, current.as_deref()).await
    }

    /// Connection for the tenant of `ctx`.
    pub async fn connection(&self, ctx: &TenantContext) -> Result<ConnectionLease> {
        self.initialize(&ctx.tenant_id).await
    }

    async fn lease_locked(
        &self,
        pool: &mut ConnectionPool,
        tenant_id: &str,
        current: Option<&str>,
    ) -> Result<ConnectionLease> {
        for store in pool.reap_retired() {
            store.close().await;
        }
        if let Some(lease) = pool.lease(tenant_id) {
            return Ok(lease);
        }

        if pool.len() >= self.config.max_connections {
            match pool.lru_candidate(current) {
                Some(victim) => {
                    if let Some(store) = pool.remove(&victim) {
                        store.close().await;
                    }
                    debug!(tenant_id = %victim, "evicted least recently used connection");
                }
                None => warn!(
                    max = self.config.max_connections,
                    "connection pool at capacity with every connection in use"
                ),
            }
        }

        let name = layout::database_name(tenant_id);
        let store = self
            .open_with_recovery(&name, None, &layout::system_stores())
            .await?;
        debug!(tenant_id, database = %name, "opened tenant database");
        Ok(pool.insert(tenant_id, store))
    }

    /// Open a database. A corrupted database is deleted and the open retried
    /// exactly once.
    async fn open_with_recovery(
        &self,
        name: &str,
        version: Option<SchemaVersion>,
        upgrade: &[StoreDef],
    ) -> Result<Arc<dyn LocalStore>> {
        match self.backend.open(name, version, upgrade).await {
            Err(Error::CorruptedStore(_)) => {
                warn!(database = name, "database corrupted, deleting and recreating");
                self.backend.delete_database(name).await?;
                self.generation.fetch_add(1, Ordering::SeqCst);
                // The recreated database starts over, so let it pick its version.
                self.backend.open(name, None, upgrade).await
            }
            other => other,
        }
    }

    /// Ensure the practice's entity stores exist in the tenant database.
    ///
    /// Only when stores are missing is the database reopened at the next
    /// schema version to create them. The pooled connection is replaced; the
    /// old one is closed after its last lease is dropped. Calling this again
    /// is a no-op.
    pub async fn register_practice(&self, practice_id: &str, tenant_id: &str) -> Result<()> {
        let current = self.current_tenant().await;
        let mut pool = self.pool.lock().await;
        let mut lease = self
            .lease_locked(&mut pool, tenant_id, current.as_deref())
            .await?;

        let expected = layout::practice_stores(practice_id);
        let existing = lease.store_names().await?;
        let missing: Vec<&StoreDef> = expected
            .iter()
            .filter(|def| !existing.contains(&def.name))
            .collect();

        if !missing.is_empty() {
            let version = lease.version().await?;
            let missing_count = missing.len();
            drop(lease);

            // Leases taken before the upgrade keep the old connection.
            if let Some(store) = pool.retire(tenant_id) {
                store.close().await;
            }

            let mut upgrade = layout::system_stores();
            upgrade.extend(expected);
            let name = layout::database_name(tenant_id);
            let store = self
                .open_with_recovery(&name, Some(version + 1), &upgrade)
                .await?;
            info!(
                tenant_id,
                practice_id,
                version = version + 1,
                created = missing_count,
                "registered practice stores"
            );
            lease = pool.insert(tenant_id, store);
        }

        let key = practice_key(practice_id);
        if lease.get(METADATA_STORE, &key).await?.is_none() {
            let record = json!({
                "kind": "practice",
                "practiceId": practice_id,
                "registeredAt": crate::now_millis(),
            });
            lease.put(METADATA_STORE, &key, &record).await?;
        }
        Ok(())
    }

    /// Practices registered for a tenant.
    pub async fn registered_practices(&self, tenant_id: &str) -> Result<Vec<PracticeId>> {
        let lease = self.initialize(tenant_id).await?;
        let mut practices: Vec<PracticeId> = lease
            .get_all(METADATA_STORE)
            .await?
            .iter()
            .filter(|v| v.get("kind").and_then(Value::as_str) == Some("practice"))
            .filter_map(|v| v.get("practiceId").and_then(Value::as_str).map(str::to_string))
            .collect();
        practices.sort();
        Ok(practices)
    }

    /// Connection plus the practice of `ctx`, failing unless that practice
    /// has been registered.
    pub async fn practice_connection(
        &self,
        ctx: &TenantContext,
    ) -> Result<(ConnectionLease, PracticeId)> {
        let practice_id = ctx.practice()?.to_string();
        let lease = self.connection(ctx).await?;
        if lease.get(METADATA_STORE, &practice_key(&practice_id)).await?.is_none() {
            return Err(Error::PracticeNotRegistered {
                tenant_id: ctx.tenant_id.clone(),
                practice_id,
            });
        }
        Ok((lease, practice_id))
    }

    /// Close idle connections. Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let current = self.current_tenant().await;
        let mut pool = self.pool.lock().await;
        for store in pool.reap_retired() {
            store.close().await;
        }
        let idle = pool.idle(Instant::now(), self.config.idle_timeout, current.as_deref());

        for tenant_id in &idle {
            if let Some(store) = pool.remove(tenant_id) {
                store.close().await;
            }
            debug!(tenant_id = %tenant_id, "closed idle connection");
        }
        idle.len()
    }

    /// Run [`Self::sweep_idle`] every `sweep_interval` until the manager is
    /// dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.sweep_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                manager.sweep_idle().await;
            }
        })
    }

    /// Close a tenant's connection if it is open.
    pub async fn close_tenant(&self, tenant_id: &str) {
        let stores = {
            let mut pool = self.pool.lock().await;
            let mut stores = pool.take_retired(tenant_id);
            stores.extend(pool.remove(tenant_id));
            stores
        };
        for store in stores {
            store.close().await;
        }
    }

    pub async fn close_all(&self) {
        let stores = self.pool.lock().await.drain();
        for store in stores {
            store.close().await;
        }
    }

    /// Close and delete a tenant's database.
    pub async fn delete_tenant_database(&self, tenant_id: &str) -> Result<()> {
        self.close_tenant(tenant_id).await;
        self.backend
            .delete_database(&layout::database_name(tenant_id))
            .await?;
        self.generation.fetch_add(1, Ordering::SeqCst);
        info!(tenant_id, "deleted tenant database");
        Ok(())
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats(self.config.max_connections)
    }

    /// Whether `new_bytes` more fit in the storage quota.
    pub async fn check_quota(&self, new_bytes: u64) -> Result<QuotaCheck> {
        let estimate = self.backend.estimate().await?;
        Ok(check_quota(estimate, new_bytes))
    }

    /// Fail with [`Error::QuotaExceeded`] if `new_bytes` do not fit.
    pub async fn ensure_quota(&self, new_bytes: u64) -> Result<()> {
        let check = self.check_quota(new_bytes).await?;
        if check.would_exceed {
            warn!(usage = check.usage, quota = check.quota, requested = new_bytes, "storage quota exceeded");
            return Err(Error::QuotaExceeded {
                usage: check.usage,
                quota: check.quota,
                requested: new_bytes,
            });
        }
        if check.near_limit {
            warn!(usage = check.usage, quota = check.quota, "storage nearly full");
        }
        Ok(())
    }
}
