//! Durable queue of outbound sync operations.
//!
//! Operations live in the tenant's `sync_queue` store. A failed operation is
//! never dropped: it waits out an exponential backoff and is retried.

use crate::backoff::BackoffPolicy;
use crate::database::{TenantContext, TenantDatabaseManager, SYNC_QUEUE_STORE};
use crate::schema::{identifier_value, EntityReference, Schema};
use crate::storage::WriteOp;
use crate::{
    error::Result, EntityId, EntityType, Error, OperationId, PracticeId, Timestamp, UserId, Version,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Kind of mutation an operation carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    /// Action part of the permission string for this mutation.
    pub fn action(&self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Failed,
    Conflicted,
    Completed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Failed => "failed",
            OperationStatus::Conflicted => "conflicted",
            OperationStatus::Completed => "completed",
        }
    }

    /// Whether the queue may move an operation from `self` to `next`.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (Pending, Failed)
                | (Pending, Conflicted)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Conflicted)
                | (InProgress, Pending)
                | (Failed, InProgress)
                | (Failed, Pending)
                | (Conflicted, Pending)
                | (Conflicted, Completed)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued local mutation waiting to be pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOperation {
    pub id: OperationId,
    pub tenant_id: crate::TenantId,
    pub practice_id: PracticeId,
    pub user_id: UserId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: OperationKind,
    /// Full entity payload after the mutation
    pub data: Value,
    /// References to other entities found in `data`
    pub relationships: Vec<EntityReference>,
    pub timestamp: Timestamp,
    /// Insertion order, breaks timestamp ties
    pub sequence: u64,
    pub priority: Priority,
    pub retry_count: u32,
    pub status: OperationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub required_permissions: Vec<String>,
    /// Local entity version the operation carries
    pub version: Version,
    /// Server version the mutation was based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    /// Not retried before this time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
}

impl SyncOperation {
    /// A new pending operation scoped to `ctx`. Relationships and permissions
    /// are filled in when the operation is enqueued.
    pub fn new(
        ctx: &TenantContext,
        entity_type: EntityType,
        entity_id: impl Into<EntityId>,
        operation: OperationKind,
        data: Value,
        priority: Priority,
    ) -> Result<Self> {
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: ctx.tenant_id.clone(),
            practice_id: ctx.practice()?.to_string(),
            user_id: ctx.user().to_string(),
            entity_type,
            entity_id: entity_id.into(),
            operation,
            data,
            relationships: Vec::new(),
            timestamp: crate::now_millis(),
            sequence: 0,
            priority,
            retry_count: 0,
            status: OperationStatus::Pending,
            last_error: None,
            required_permissions: Vec::new(),
            version: 1,
            base_version: None,
            next_attempt_at: None,
            conflict_id: None,
            completed_at: None,
        })
    }

    /// Builder-style method to set the local entity version.
    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    /// Builder-style method to set the server version the mutation is based on.
    pub fn with_base_version(mut self, base_version: Option<Version>) -> Self {
        self.base_version = base_version;
        self
    }

    fn is_due(&self, now: Timestamp) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed => self.next_attempt_at.map_or(true, |t| t <= now),
            _ => false,
        }
    }
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_entity_type: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    /// Timestamp of the oldest operation not yet completed
    pub oldest_pending_timestamp: Option<Timestamp>,
    /// Age in milliseconds of that operation
    pub oldest_pending_age_ms: Option<u64>,
}

pub struct SyncQueue {
    databases: Arc<TenantDatabaseManager>,
    schema: Arc<Schema>,
    backoff: BackoffPolicy,
    sequence: AtomicU64,
}

impl SyncQueue {
    pub fn new(databases: Arc<TenantDatabaseManager>, schema: Arc<Schema>, backoff: BackoffPolicy) -> Self {
        // Seeded from the clock so sequences keep increasing across restarts.
        let seed = crate::now_millis().saturating_mul(1000);
        Self {
            databases,
            schema,
            backoff,
            sequence: AtomicU64::new(seed),
        }
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Validate, tag and persist a new operation.
    pub async fn enqueue(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        entity_id: &str,
        operation: OperationKind,
        data: Value,
        priority: Priority,
    ) -> Result<SyncOperation> {
        let op = SyncOperation::new(ctx, entity_type, entity_id, operation, data, priority)?;
        self.push(ctx, op).await
    }

    /// Persist a prepared operation.
    pub async fn push(&self, ctx: &TenantContext, mut op: SyncOperation) -> Result<SyncOperation> {
        ctx.ensure_tenant(&op.tenant_id)?;
        if op.entity_id.trim().is_empty() {
            return Err(Error::Validation("operation entity id must not be empty".into()));
        }
        if op.operation != OperationKind::Delete && !op.data.is_object() {
            return Err(Error::InvalidPayload(format!(
                "{} payload must be an object",
                op.operation
            )));
        }

        op.relationships = self.schema.references(op.entity_type, &op.data);
        op.required_permissions =
            self.schema
                .required_permissions(op.entity_type, op.operation.action(), &op.data);
        op.sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        op.status = OperationStatus::Pending;

        self.save(ctx, &op).await?;
        debug!(
            op_id = %op.id,
            entity_type = %op.entity_type,
            entity_id = %op.entity_id,
            operation = %op.operation,
            "enqueued operation"
        );
        Ok(op)
    }

    async fn save(&self, ctx: &TenantContext, op: &SyncOperation) -> Result<()> {
        let lease = self.databases.connection(ctx).await?;
        lease
            .put(SYNC_QUEUE_STORE, &op.id, &serde_json::to_value(op)?)
            .await
    }

    fn decode(ctx: &TenantContext, value: Value) -> Result<SyncOperation> {
        let op: SyncOperation = serde_json::from_value(value)?;
        ctx.ensure_tenant(&op.tenant_id)?;
        Ok(op)
    }

    fn in_scope(ctx: &TenantContext, op: &SyncOperation) -> bool {
        ctx.practice_id
            .as_ref()
            .map_or(true, |p| &op.practice_id == p)
    }

    async fn all(&self, ctx: &TenantContext) -> Result<Vec<SyncOperation>> {
        let lease = self.databases.connection(ctx).await?;
        let mut ops = Vec::new();
        for value in lease.get_all(SYNC_QUEUE_STORE).await? {
            let op = Self::decode(ctx, value)?;
            if Self::in_scope(ctx, &op) {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    async fn with_status(&self, ctx: &TenantContext, status: OperationStatus) -> Result<Vec<SyncOperation>> {
        let lease = self.databases.connection(ctx).await?;
        let mut ops = Vec::new();
        for value in lease
            .query_index(SYNC_QUEUE_STORE, "status", &Value::from(status.as_str()))
            .await?
        {
            let op = Self::decode(ctx, value)?;
            if Self::in_scope(ctx, &op) {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    fn sort(ops: &mut [SyncOperation]) {
        ops.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then(a.timestamp.cmp(&b.timestamp))
                .then(a.sequence.cmp(&b.sequence))
        });
    }

    pub async fn get(&self, ctx: &TenantContext, id: &str) -> Result<SyncOperation> {
        let lease = self.databases.connection(ctx).await?;
        let value = lease
            .get(SYNC_QUEUE_STORE, id)
            .await?
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))?;
        Self::decode(ctx, value)
    }

    /// Pending operations in push order: priority, then insertion time.
    pub async fn pending(&self, ctx: &TenantContext, limit: Option<usize>) -> Result<Vec<SyncOperation>> {
        let mut ops = self.with_status(ctx, OperationStatus::Pending).await?;
        Self::sort(&mut ops);
        ops.truncate(limit.unwrap_or(usize::MAX));
        Ok(ops)
    }

    /// Pending operations plus failed ones whose backoff has elapsed.
    pub async fn ready(
        &self,
        ctx: &TenantContext,
        now: Timestamp,
        limit: Option<usize>,
    ) -> Result<Vec<SyncOperation>> {
        let mut ops = self.with_status(ctx, OperationStatus::Pending).await?;
        ops.extend(
            self.with_status(ctx, OperationStatus::Failed)
                .await?
                .into_iter()
                .filter(|op| op.is_due(now)),
        );
        Self::sort(&mut ops);
        ops.truncate(limit.unwrap_or(usize::MAX));
        Ok(ops)
    }

    async fn transition<F>(
        &self,
        ctx: &TenantContext,
        id: &str,
        next: OperationStatus,
        apply: F,
    ) -> Result<SyncOperation>
    where
        F: FnOnce(&mut SyncOperation),
    {
        let mut op = self.get(ctx, id).await?;
        if !op.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                id: id.to_string(),
                from: op.status.to_string(),
                to: next.to_string(),
            });
        }
        op.status = next;
        apply(&mut op);
        self.save(ctx, &op).await?;
        Ok(op)
    }

    pub async fn mark_in_progress(&self, ctx: &TenantContext, id: &str) -> Result<SyncOperation> {
        self.transition(ctx, id, OperationStatus::InProgress, |_| {}).await
    }

    /// Mark an operation completed. Completing it again is a no-op.
    pub async fn mark_completed(&self, ctx: &TenantContext, id: &str) -> Result<SyncOperation> {
        let op = self.get(ctx, id).await?;
        if op.status == OperationStatus::Completed {
            return Ok(op);
        }
        let now = crate::now_millis();
        self.transition(ctx, id, OperationStatus::Completed, |op| {
            op.completed_at = Some(now);
            op.last_error = None;
            op.next_attempt_at = None;
        })
        .await
    }

    /// Record a failed attempt and schedule the next one.
    pub async fn mark_failed(&self, ctx: &TenantContext, id: &str, error: &str) -> Result<SyncOperation> {
        let now = crate::now_millis();
        let backoff = self.backoff;
        let op = self
            .transition(ctx, id, OperationStatus::Failed, |op| {
                op.retry_count = op.retry_count.saturating_add(1);
                op.last_error = Some(error.to_string());
                op.next_attempt_at = Some(backoff.next_attempt_at(now, op.retry_count));
            })
            .await?;
        warn!(
            op_id = %op.id,
            retry_count = op.retry_count,
            error,
            "sync operation failed"
        );
        Ok(op)
    }

    /// Park an operation until its conflict is resolved.
    pub async fn mark_conflicted(
        &self,
        ctx: &TenantContext,
        id: &str,
        conflict_id: &str,
        details: &str,
    ) -> Result<SyncOperation> {
        self.transition(ctx, id, OperationStatus::Conflicted, |op| {
            op.conflict_id = Some(conflict_id.to_string());
            op.last_error = Some(details.to_string());
        })
        .await
    }

    /// Return an in-flight or conflicted operation to pending without
    /// counting a retry.
    pub async fn requeue(&self, ctx: &TenantContext, id: &str) -> Result<SyncOperation> {
        self.transition(ctx, id, OperationStatus::Pending, |op| {
            op.next_attempt_at = None;
        })
        .await
    }

    /// Requeue a conflicted operation with resolved data and the server
    /// version it now builds on.
    pub async fn requeue_with(
        &self,
        ctx: &TenantContext,
        id: &str,
        data: Value,
        base_version: Option<Version>,
    ) -> Result<SyncOperation> {
        let schema = Arc::clone(&self.schema);
        self.transition(ctx, id, OperationStatus::Pending, move |op| {
            op.relationships = schema.references(op.entity_type, &data);
            op.data = data;
            op.base_version = base_version;
            op.conflict_id = None;
            op.last_error = None;
            op.next_attempt_at = None;
        })
        .await
    }

    /// Reset every failed operation to pending. Returns how many were reset.
    pub async fn retry_failed(&self, ctx: &TenantContext) -> Result<usize> {
        let failed = self.with_status(ctx, OperationStatus::Failed).await?;
        let lease = self.databases.connection(ctx).await?;
        let mut writes = Vec::with_capacity(failed.len());
        for mut op in failed {
            op.status = OperationStatus::Pending;
            op.next_attempt_at = None;
            writes.push(WriteOp::put(SYNC_QUEUE_STORE, op.id.clone(), serde_json::to_value(&op)?));
        }
        let count = writes.len();
        lease.transaction(writes).await?;
        Ok(count)
    }

    /// Return operations left in flight by an interrupted pass to pending.
    pub async fn recover_in_progress(&self, ctx: &TenantContext) -> Result<usize> {
        let stuck = self.with_status(ctx, OperationStatus::InProgress).await?;
        let lease = self.databases.connection(ctx).await?;
        let mut writes = Vec::with_capacity(stuck.len());
        for mut op in stuck {
            op.status = OperationStatus::Pending;
            writes.push(WriteOp::put(SYNC_QUEUE_STORE, op.id.clone(), serde_json::to_value(&op)?));
        }
        let count = writes.len();
        if count > 0 {
            lease.transaction(writes).await?;
            warn!(recovered = count, "requeued operations left in progress");
        }
        Ok(count)
    }

    pub async fn clear_completed(&self, ctx: &TenantContext) -> Result<usize> {
        let completed = self.with_status(ctx, OperationStatus::Completed).await?;
        self.remove(ctx, completed).await
    }

    pub async fn clear_all(&self, ctx: &TenantContext) -> Result<usize> {
        let all = self.all(ctx).await?;
        self.remove(ctx, all).await
    }

    async fn remove(&self, ctx: &TenantContext, ops: Vec<SyncOperation>) -> Result<usize> {
        let lease = self.databases.connection(ctx).await?;
        let writes: Vec<_> = ops
            .into_iter()
            .map(|op| WriteOp::delete(SYNC_QUEUE_STORE, op.id))
            .collect();
        let count = writes.len();
        lease.transaction(writes).await?;
        Ok(count)
    }

    pub async fn get_stats(&self, ctx: &TenantContext) -> Result<QueueStats> {
        let ops = self.all(ctx).await?;
        let mut stats = QueueStats {
            total: ops.len(),
            ..QueueStats::default()
        };

        for op in &ops {
            *stats.by_status.entry(op.status.to_string()).or_insert(0) += 1;
            *stats.by_entity_type.entry(op.entity_type.to_string()).or_insert(0) += 1;
            *stats.by_priority.entry(op.priority.as_str().to_string()).or_insert(0) += 1;
        }

        stats.oldest_pending_timestamp = ops
            .iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .map(|op| op.timestamp)
            .min();
        stats.oldest_pending_age_ms = stats
            .oldest_pending_timestamp
            .map(|t| crate::now_millis().saturating_sub(t));
        Ok(stats)
    }

    /// Operations not yet completed.
    pub async fn pending_count(&self, ctx: &TenantContext) -> Result<usize> {
        Ok(self
            .all(ctx)
            .await?
            .iter()
            .filter(|op| op.status != OperationStatus::Completed)
            .count())
    }

    /// Every operation targeting one entity, oldest first.
    pub async fn operations_for_entity(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        entity_id: &str,
    ) -> Result<Vec<SyncOperation>> {
        let lease = self.databases.connection(ctx).await?;
        let mut ops = Vec::new();
        for value in lease
            .query_index(SYNC_QUEUE_STORE, "entityType", &Value::from(entity_type.as_str()))
            .await?
        {
            let op = Self::decode(ctx, value)?;
            if op.entity_id == entity_id && Self::in_scope(ctx, &op) {
                ops.push(op);
            }
        }
        ops.sort_by_key(|op| (op.timestamp, op.sequence));
        Ok(ops)
    }

    /// Rebase unfinished operations on one entity from server version `from`
    /// to `to` once an earlier one of them has been accepted. Operations based
    /// on any other version keep it, so real server edits still conflict.
    pub async fn advance_base_version(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        entity_id: &str,
        from: Version,
        to: Version,
    ) -> Result<usize> {
        if from == to {
            return Ok(0);
        }
        let mut writes = Vec::new();
        for mut op in self.operations_for_entity(ctx, entity_type, entity_id).await? {
            if op.status == OperationStatus::Completed || op.base_version != Some(from) {
                continue;
            }
            op.base_version = Some(to);
            writes.push(WriteOp::put(SYNC_QUEUE_STORE, op.id.clone(), serde_json::to_value(&op)?));
        }

        let count = writes.len();
        if count > 0 {
            let lease = self.databases.connection(ctx).await?;
            lease.transaction(writes).await?;
            debug!(entity_id, from, to, rebased = count, "advanced queued base versions");
        }
        Ok(count)
    }

    /// Replace `temp_id` with `real_id` in every unfinished operation of the
    /// tenant. Returns how many operations changed.
    pub async fn rewrite_references(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        temp_id: &str,
        real_id: &str,
    ) -> Result<usize> {
        let tenant_ctx = TenantContext {
            practice_id: None,
            ..ctx.clone()
        };
        let replacement = identifier_value(real_id);
        let mut writes = Vec::new();

        for mut op in self.all(&tenant_ctx).await? {
            if op.status == OperationStatus::Completed {
                continue;
            }
            let mut changed = false;

            if op.entity_type == entity_type && op.entity_id == temp_id {
                op.entity_id = real_id.to_string();
                changed = true;
            }
            if let Ok(schema) = self.schema.get(op.entity_type) {
                changed |= crate::resolver::rewrite_payload(
                    schema,
                    &mut op.data,
                    entity_type,
                    temp_id,
                    &replacement,
                );
            }
            for reference in &mut op.relationships {
                if reference.entity_type == entity_type && reference.id == temp_id {
                    reference.id = real_id.to_string();
                    changed = true;
                }
            }

            if changed {
                writes.push(WriteOp::put(SYNC_QUEUE_STORE, op.id.clone(), serde_json::to_value(&op)?));
            }
        }

        let count = writes.len();
        if count > 0 {
            let lease = self.databases.connection(ctx).await?;
            lease.transaction(writes).await?;
            debug!(temp_id, real_id, rewritten = count, "rewrote queued references");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::storage::MemoryBackend;
    use serde_json::json;

    async fn setup() -> (SyncQueue, TenantContext) {
        let databases = Arc::new(TenantDatabaseManager::new(
            Arc::new(MemoryBackend::new()),
            PoolConfig::default(),
        ));
        let queue = SyncQueue::new(databases, Arc::new(Schema::clinical()), BackoffPolicy::default());
        (queue, TenantContext::new("t1").with_practice("p1").with_user("u1"))
    }

    fn pet(client_id: &str) -> Value {
        json!({"name": "Rex", "species": "dog", "clientId": client_id})
    }

    #[tokio::test]
    async fn enqueue_tags_relationships_and_permissions() {
        let (queue, ctx) = setup().await;
        let op = queue
            .enqueue(&ctx, EntityType::Pet, "temp_1_aaa_pet", OperationKind::Create, pet("9"), Priority::Normal)
            .await
            .unwrap();

        assert_eq!(op.status, OperationStatus::Pending);
        assert_eq!(op.relationships.len(), 1);
        assert_eq!(op.relationships[0].entity_type, EntityType::Client);
        assert_eq!(op.required_permissions, vec!["pets:create", "clients:read"]);
    }

    #[tokio::test]
    async fn enqueue_rejects_bad_input() {
        let (queue, ctx) = setup().await;
        assert!(queue
            .enqueue(&ctx, EntityType::Pet, " ", OperationKind::Create, pet("9"), Priority::Normal)
            .await
            .is_err());
        assert!(matches!(
            queue
                .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, json!("x"), Priority::Normal)
                .await,
            Err(Error::InvalidPayload(_))
        ));
        assert!(queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Delete, Value::Null, Priority::Normal)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn pending_orders_by_priority_then_insertion() {
        let (queue, ctx) = setup().await;
        let low = queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::Low)
            .await
            .unwrap();
        let first = queue
            .enqueue(&ctx, EntityType::Pet, "2", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();
        let high = queue
            .enqueue(&ctx, EntityType::Pet, "3", OperationKind::Update, pet("9"), Priority::High)
            .await
            .unwrap();
        let second = queue
            .enqueue(&ctx, EntityType::Pet, "4", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();

        let ids: Vec<_> = queue
            .pending(&ctx, None)
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.id)
            .collect();
        assert_eq!(ids, vec![high.id, first.id, second.id, low.id]);
        assert_eq!(queue.pending(&ctx, Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_completed_is_idempotent() {
        let (queue, ctx) = setup().await;
        let op = queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();
        queue.mark_in_progress(&ctx, &op.id).await.unwrap();

        let done = queue.mark_completed(&ctx, &op.id).await.unwrap();
        let again = queue.mark_completed(&ctx, &op.id).await.unwrap();
        assert_eq!(done, again);
        assert_eq!(queue.pending_count(&ctx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn illegal_transitions_are_rejected() {
        let (queue, ctx) = setup().await;
        let op = queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();
        assert!(matches!(
            queue.mark_completed(&ctx, &op.id).await,
            Err(Error::InvalidTransition { .. })
        ));
        assert!(matches!(
            queue.mark_in_progress(&ctx, "missing").await,
            Err(Error::OperationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn failures_back_off_and_retry_forever() {
        let (queue, ctx) = setup().await;
        let op = queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();

        for attempt in 1..=12u32 {
            queue.mark_in_progress(&ctx, &op.id).await.unwrap();
            let failed = queue.mark_failed(&ctx, &op.id, "502").await.unwrap();
            assert_eq!(failed.retry_count, attempt);
            assert_eq!(failed.last_error.as_deref(), Some("502"));
        }

        let failed = queue.get(&ctx, &op.id).await.unwrap();
        let gate = failed.next_attempt_at.unwrap();
        assert!(queue.ready(&ctx, gate - 1, None).await.unwrap().is_empty());
        assert_eq!(queue.ready(&ctx, gate, None).await.unwrap().len(), 1);

        assert_eq!(queue.retry_failed(&ctx).await.unwrap(), 1);
        let retried = queue.get(&ctx, &op.id).await.unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert_eq!(retried.retry_count, 12);
    }

    #[tokio::test]
    async fn stats_and_clearing() {
        let (queue, ctx) = setup().await;
        let a = queue
            .enqueue(&ctx, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::High)
            .await
            .unwrap();
        queue
            .enqueue(&ctx, EntityType::Client, "2", OperationKind::Delete, Value::Null, Priority::Normal)
            .await
            .unwrap();
        queue.mark_in_progress(&ctx, &a.id).await.unwrap();
        queue.mark_completed(&ctx, &a.id).await.unwrap();

        let stats = queue.get_stats(&ctx).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status.get("completed"), Some(&1));
        assert_eq!(stats.by_status.get("pending"), Some(&1));
        assert_eq!(stats.by_entity_type.get("pet"), Some(&1));
        assert_eq!(stats.by_priority.get("high"), Some(&1));
        assert!(stats.oldest_pending_timestamp.is_some());

        assert_eq!(queue.clear_completed(&ctx).await.unwrap(), 1);
        assert_eq!(queue.pending_count(&ctx).await.unwrap(), 1);
        assert_eq!(queue.clear_all(&ctx).await.unwrap(), 1);
        assert_eq!(queue.get_stats(&ctx).await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn rewrite_references_updates_ids_payloads_and_relationships() {
        let (queue, ctx) = setup().await;
        let temp = "temp_1_aaa_client";
        let create = queue
            .enqueue(
                &ctx,
                EntityType::Client,
                temp,
                OperationKind::Create,
                json!({"firstName": "A", "lastName": "B"}),
                Priority::Normal,
            )
            .await
            .unwrap();
        let pet_op = queue
            .enqueue(&ctx, EntityType::Pet, "temp_2_bbb_pet", OperationKind::Create, pet(temp), Priority::Normal)
            .await
            .unwrap();

        let changed = queue
            .rewrite_references(&ctx, EntityType::Client, temp, "501")
            .await
            .unwrap();
        assert_eq!(changed, 2);

        assert_eq!(queue.get(&ctx, &create.id).await.unwrap().entity_id, "501");
        let pet_op = queue.get(&ctx, &pet_op.id).await.unwrap();
        assert_eq!(pet_op.data["clientId"], json!(501));
        assert_eq!(pet_op.relationships[0].id, "501");
    }

    #[tokio::test]
    async fn advance_base_version_only_moves_matching_operations() {
        let (queue, ctx) = setup().await;
        let update = |base: u64| {
            SyncOperation::new(&ctx, EntityType::Client, "41", OperationKind::Update, json!({"firstName": "A"}), Priority::Normal)
                .unwrap()
                .with_base_version(Some(base))
        };
        let stale = queue.push(&ctx, update(1)).await.unwrap();
        let newer = queue.push(&ctx, update(4)).await.unwrap();
        let done = queue.push(&ctx, update(1)).await.unwrap();
        queue.mark_in_progress(&ctx, &done.id).await.unwrap();
        queue.mark_completed(&ctx, &done.id).await.unwrap();

        let moved = queue
            .advance_base_version(&ctx, EntityType::Client, "41", 1, 2)
            .await
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(queue.get(&ctx, &stale.id).await.unwrap().base_version, Some(2));
        assert_eq!(queue.get(&ctx, &newer.id).await.unwrap().base_version, Some(4));
        assert_eq!(queue.get(&ctx, &done.id).await.unwrap().base_version, Some(1));
    }

    #[tokio::test]
    async fn foreign_tenant_operation_is_rejected() {
        let (queue, ctx) = setup().await;
        let other = TenantContext::new("t2").with_practice("p1");
        let op = SyncOperation::new(&other, EntityType::Pet, "1", OperationKind::Update, pet("9"), Priority::Normal)
            .unwrap();
        assert!(matches!(
            queue.push(&ctx, op).await,
            Err(Error::TenantMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn interrupted_operations_are_recovered() {
        let (queue, ctx) = setup().await;
        let op = queue
            .enqueue(&ctx, EntityType::Pet, "4", OperationKind::Update, pet("9"), Priority::Normal)
            .await
            .unwrap();
        queue.mark_in_progress(&ctx, &op.id).await.unwrap();
        assert!(queue.pending(&ctx, None).await.unwrap().is_empty());

        assert_eq!(queue.recover_in_progress(&ctx).await.unwrap(), 1);
        assert_eq!(queue.get(&ctx, &op.id).await.unwrap().status, OperationStatus::Pending);
        assert_eq!(queue.recover_in_progress(&ctx).await.unwrap(), 0);
    }
}
