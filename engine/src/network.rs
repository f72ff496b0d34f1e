//! Connectivity state and sync on reconnect.

use crate::error::Result;
use crate::sync::SyncReport;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Online,
    Offline,
    /// Connected, but on a poor link
    Slow,
}

impl NetworkStatus {
    pub fn is_connected(&self) -> bool {
        !matches!(self, NetworkStatus::Offline)
    }
}

/// What the monitor needs from the sync engine.
#[async_trait]
pub trait SyncHooks: Send + Sync {
    async fn pending_operations_count(&self) -> Result<usize>;
    async fn bidirectional_sync(&self) -> Result<SyncReport>;
}

/// Tracks connectivity and triggers a sync when the device comes back online.
pub struct NetworkMonitor {
    status: watch::Sender<NetworkStatus>,
    hooks: Arc<dyn SyncHooks>,
    reconnect: Mutex<()>,
}

impl NetworkMonitor {
    pub fn new(initial: NetworkStatus, hooks: Arc<dyn SyncHooks>) -> Self {
        let (status, _) = watch::channel(initial);
        Self {
            status,
            hooks,
            reconnect: Mutex::new(()),
        }
    }

    pub fn status(&self) -> NetworkStatus {
        *self.status.borrow()
    }

    /// Receiver notified on every status change.
    pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
        self.status.subscribe()
    }

    /// Record a status event from the platform. An offline to connected
    /// transition runs one sync when operations are pending, and returns its
    /// report.
    pub async fn report(&self, next: NetworkStatus) -> Result<Option<SyncReport>> {
        let previous = self.status.send_replace(next);
        if previous == next {
            return Ok(None);
        }
        info!(from = ?previous, to = ?next, "network status changed");

        if previous.is_connected() || !next.is_connected() {
            return Ok(None);
        }
        self.sync_after_reconnect().await
    }

    async fn sync_after_reconnect(&self) -> Result<Option<SyncReport>> {
        // A reconnect sync already running covers this transition too.
        let Ok(_running) = self.reconnect.try_lock() else {
            return Ok(None);
        };
        let pending = self.hooks.pending_operations_count().await?;
        if pending == 0 {
            debug!("reconnected with nothing pending");
            return Ok(None);
        }
        debug!(pending, "reconnected, syncing");
        Ok(Some(self.hooks.bidirectional_sync().await?))
    }
}
