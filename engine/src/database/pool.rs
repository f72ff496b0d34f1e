//! Bounded pool of open tenant connections.

use crate::storage::LocalStore;
use crate::TenantId;
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

struct PooledConnection {
    store: Arc<dyn LocalStore>,
    last_access: Instant,
    leases: Arc<AtomicUsize>,
}

/// A borrowed tenant connection. The pool will not evict or sweep a
/// connection while any lease on it is alive.
pub struct ConnectionLease {
    tenant_id: TenantId,
    store: Arc<dyn LocalStore>,
    leases: Arc<AtomicUsize>,
}

impl ConnectionLease {
    fn new(tenant_id: &str, entry: &PooledConnection) -> Self {
        entry.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            tenant_id: tenant_id.to_string(),
            store: Arc::clone(&entry.store),
            leases: Arc::clone(&entry.leases),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }
}

impl Clone for ConnectionLease {
    fn clone(&self) -> Self {
        self.leases.fetch_add(1, Ordering::SeqCst);
        Self {
            tenant_id: self.tenant_id.clone(),
            store: Arc::clone(&self.store),
            leases: Arc::clone(&self.leases),
        }
    }
}

impl Deref for ConnectionLease {
    type Target = dyn LocalStore;

    fn deref(&self) -> &Self::Target {
        &*self.store
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for ConnectionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("tenant_id", &self.tenant_id)
            .field("database", &self.store.name())
            .finish()
    }
}

/// Snapshot of the pool for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub open_connections: usize,
    pub leased_connections: usize,
    pub max_connections: usize,
    pub tenants: Vec<TenantId>,
}

#[derive(Default)]
pub(crate) struct ConnectionPool {
    entries: HashMap<TenantId, PooledConnection>,
    /// Replaced connections still held by leases, closed once released
    retired: Vec<(TenantId, PooledConnection)>,
}

impl ConnectionPool {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Lease an open connection, refreshing its last access time. Closed
    /// connections are dropped from the pool.
    pub fn lease(&mut self, tenant_id: &str) -> Option<ConnectionLease> {
        if self
            .entries
            .get(tenant_id)
            .is_some_and(|entry| entry.store.is_closed())
        {
            self.entries.remove(tenant_id);
            return None;
        }

        let entry = self.entries.get_mut(tenant_id)?;
        entry.last_access = Instant::now();
        Some(ConnectionLease::new(tenant_id, entry))
    }

    pub fn insert(&mut self, tenant_id: &str, store: Arc<dyn LocalStore>) -> ConnectionLease {
        let entry = PooledConnection {
            store,
            last_access: Instant::now(),
            leases: Arc::new(AtomicUsize::new(0)),
        };
        let lease = ConnectionLease::new(tenant_id, &entry);
        self.entries.insert(tenant_id.to_string(), entry);
        lease
    }

    pub fn remove(&mut self, tenant_id: &str) -> Option<Arc<dyn LocalStore>> {
        self.entries.remove(tenant_id).map(|entry| entry.store)
    }

    pub fn drain(&mut self) -> Vec<Arc<dyn LocalStore>> {
        self.entries
            .drain()
            .chain(self.retired.drain(..))
            .map(|(_, entry)| entry.store)
            .collect()
    }

    /// Take the tenant's connection out of the pool so a replacement can be
    /// inserted. Returns the store when nothing leases it and it can be
    /// closed now; otherwise it stays usable until [`Self::reap_retired`].
    pub fn retire(&mut self, tenant_id: &str) -> Option<Arc<dyn LocalStore>> {
        let entry = self.entries.remove(tenant_id)?;
        if entry.leases.load(Ordering::SeqCst) == 0 {
            return Some(entry.store);
        }
        self.retired.push((tenant_id.to_string(), entry));
        None
    }

    /// Retired connections whose last lease has been dropped.
    pub fn reap_retired(&mut self) -> Vec<Arc<dyn LocalStore>> {
        let (released, held): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(_, entry)| entry.leases.load(Ordering::SeqCst) == 0);
        self.retired = held;
        released.into_iter().map(|(_, entry)| entry.store).collect()
    }

    /// Retired connections of one tenant, leased or not.
    pub fn take_retired(&mut self, tenant_id: &str) -> Vec<Arc<dyn LocalStore>> {
        let (taken, kept): (Vec<_>, Vec<_>) = self
            .retired
            .drain(..)
            .partition(|(tenant, _)| tenant == tenant_id);
        self.retired = kept;
        taken.into_iter().map(|(_, entry)| entry.store).collect()
    }

    fn evictable<'a>(
        &'a self,
        current: Option<&'a str>,
    ) -> impl Iterator<Item = (&'a TenantId, &'a PooledConnection)> + 'a {
        self.entries.iter().filter(move |(tenant, entry)| {
            Some(tenant.as_str()) != current && entry.leases.load(Ordering::SeqCst) == 0
        })
    }

    /// Least recently used connection that is neither leased nor current.
    pub fn lru_candidate(&self, current: Option<&str>) -> Option<TenantId> {
        self.evictable(current)
            .min_by_key(|(_, entry)| entry.last_access)
            .map(|(tenant, _)| tenant.clone())
    }

    /// Connections idle for at least `timeout` that are neither leased nor
    /// current.
    pub fn idle(&self, now: Instant, timeout: Duration, current: Option<&str>) -> Vec<TenantId> {
        self.evictable(current)
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) >= timeout)
            .map(|(tenant, _)| tenant.clone())
            .collect()
    }

    pub fn stats(&self, max_connections: usize) -> PoolStats {
        let mut tenants: Vec<_> = self.entries.keys().cloned().collect();
        tenants.sort();
        PoolStats {
            open_connections: self.entries.len(),
            leased_connections: self
                .entries
                .values()
                .filter(|e| e.leases.load(Ordering::SeqCst) > 0)
                .count(),
            max_connections,
            tenants,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};

    async fn open(backend: &MemoryBackend, name: &str) -> Arc<dyn LocalStore> {
        backend.open(name, None, &[]).await.unwrap()
    }

    #[tokio::test]
    async fn leases_are_counted_and_released() {
        let backend = MemoryBackend::new();
        let mut pool = ConnectionPool::default();

        let lease = pool.insert("t1", open(&backend, "a").await);
        assert_eq!(pool.stats(10).leased_connections, 1);
        assert_eq!(pool.lru_candidate(None), None);

        let second = lease.clone();
        drop(lease);
        assert_eq!(pool.stats(10).leased_connections, 1);
        drop(second);
        assert_eq!(pool.stats(10).leased_connections, 0);
        assert_eq!(pool.lru_candidate(None), Some("t1".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn lru_skips_current_tenant() {
        let backend = MemoryBackend::new();
        let mut pool = ConnectionPool::default();

        drop(pool.insert("old", open(&backend, "a").await));
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(pool.insert("new", open(&backend, "b").await));

        assert_eq!(pool.lru_candidate(None), Some("old".to_string()));
        assert_eq!(pool.lru_candidate(Some("old")), Some("new".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_reports_only_expired_connections() {
        let backend = MemoryBackend::new();
        let mut pool = ConnectionPool::default();

        drop(pool.insert("idle", open(&backend, "a").await));
        tokio::time::advance(Duration::from_secs(301)).await;
        drop(pool.insert("fresh", open(&backend, "b").await));

        let idle = pool.idle(Instant::now(), Duration::from_secs(300), None);
        assert_eq!(idle, vec!["idle".to_string()]);
    }

    #[tokio::test]
    async fn retired_connection_waits_for_its_leases() {
        let backend = MemoryBackend::new();
        let mut pool = ConnectionPool::default();

        let held = pool.insert("t1", open(&backend, "a").await);
        assert!(pool.retire("t1").is_none());
        drop(pool.insert("t1", open(&backend, "a").await));
        assert!(pool.reap_retired().is_empty());
        assert!(!held.is_closed());

        drop(held);
        assert_eq!(pool.reap_retired().len(), 1);
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn closed_connections_are_not_leased() {
        let backend = MemoryBackend::new();
        let mut pool = ConnectionPool::default();

        let store = open(&backend, "a").await;
        drop(pool.insert("t1", Arc::clone(&store)));
        store.close().await;

        assert!(pool.lease("t1").is_none());
        assert_eq!(pool.len(), 0);
    }
}
