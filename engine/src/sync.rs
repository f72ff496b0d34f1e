//! The sync engine: local mutations in, bidirectional sync passes out.
//!
//! Mutations write the entity store and enqueue one operation each. A sync
//! pass pushes ready operations in dependency order, then pulls server
//! changes page by page. Only one pass runs at a time; a concurrent request
//! returns a skipped report.

use crate::cache::PermissionEvaluator;
use crate::config::EngineConfig;
use crate::conflict::{
    apply_field_choices, resolve, Conflict, ConflictDetector, ConflictStore, Detection, FieldChoice,
    Resolution, ResolutionAction, ResolutionStrategy,
};
use crate::database::{TenantContext, TenantDatabaseManager, METADATA_STORE};
use crate::entity_store::EntityStore;
use crate::network::SyncHooks;
use crate::orderer::{order_operations, DependencyCycle};
use crate::queue::{OperationKind, OperationStatus, Priority, SyncOperation, SyncQueue};
use crate::record::{OfflineEntity, SyncStatus};
use crate::remote::{PushRequest, RemoteSyncEndpoint, ServerSnapshot};
use crate::resolver::TempIdResolver;
use crate::schema::Schema;
use crate::{error::Result, temp_id, EntityType, Error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one [`SyncEngine::bidirectional_sync`] call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Another pass was already running
    pub skipped: bool,
    /// The remote became unreachable during the pass
    pub offline: bool,
    pub pushed: usize,
    pub failed: usize,
    /// Operations waiting on a dependency that is not synced yet
    pub deferred: usize,
    pub conflicts: usize,
    pub auto_resolved: usize,
    pub pulled: usize,
    pub cycles: Vec<DependencyCycle>,
}

/// Counts from [`SyncEngine::gc`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcReport {
    pub completed_operations: usize,
    pub id_mappings: usize,
    pub tombstones: usize,
    pub resolved_conflicts: usize,
}

enum PushOutcome {
    Pushed,
    Deferred,
    Failed,
    Conflicted,
    AutoResolved,
    Offline,
}

/// Resets the in-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn pull_cursor_key(practice_id: &str) -> String {
    format!("pull_cursor:{}", practice_id)
}

pub struct SyncEngine {
    databases: Arc<TenantDatabaseManager>,
    entities: Arc<EntityStore>,
    queue: Arc<SyncQueue>,
    resolver: Arc<TempIdResolver>,
    conflicts: ConflictStore,
    detector: ConflictDetector,
    remote: Arc<dyn RemoteSyncEndpoint>,
    permissions: Option<Arc<dyn PermissionEvaluator>>,
    config: EngineConfig,
    syncing: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        databases: Arc<TenantDatabaseManager>,
        schema: Arc<Schema>,
        remote: Arc<dyn RemoteSyncEndpoint>,
        config: EngineConfig,
    ) -> Self {
        let entities = Arc::new(EntityStore::new(Arc::clone(&databases), Arc::clone(&schema)));
        let queue = Arc::new(SyncQueue::new(
            Arc::clone(&databases),
            Arc::clone(&schema),
            config.backoff,
        ));
        let resolver = Arc::new(TempIdResolver::new(
            Arc::clone(&databases),
            Arc::clone(&entities),
            Arc::clone(&queue),
            Arc::clone(&schema),
        ));
        Self {
            conflicts: ConflictStore::new(Arc::clone(&databases)),
            detector: ConflictDetector::new(schema),
            databases,
            entities,
            queue,
            resolver,
            remote,
            permissions: None,
            config,
            syncing: AtomicBool::new(false),
        }
    }

    /// Builder-style method to check operation permissions before pushing.
    pub fn with_permissions(mut self, evaluator: Arc<dyn PermissionEvaluator>) -> Self {
        self.permissions = Some(evaluator);
        self
    }

    pub fn databases(&self) -> &Arc<TenantDatabaseManager> {
        &self.databases
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn queue(&self) -> &SyncQueue {
        &self.queue
    }

    pub fn resolver(&self) -> &TempIdResolver {
        &self.resolver
    }

    pub fn conflicts(&self) -> &ConflictStore {
        &self.conflicts
    }

    /// Whether a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    // ---- local mutations ----

    /// Save a new entity locally and queue its create.
    pub async fn create(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        data: Value,
        priority: Priority,
    ) -> Result<OfflineEntity> {
        let entity = self
            .entities
            .save(ctx, entity_type, data, SyncStatus::Pending)
            .await?;
        let enqueued = self
            .queue
            .enqueue(ctx, entity_type, &entity.id, OperationKind::Create, entity.data.clone(), priority)
            .await;
        if let Err(e) = enqueued {
            // Never leave a pending record without an operation to push it.
            self.entities.hard_delete(ctx, entity_type, &entity.id).await?;
            return Err(e);
        }
        Ok(entity)
    }

    /// Patch an entity locally and queue the update.
    pub async fn update(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        patch: Value,
        priority: Priority,
    ) -> Result<OfflineEntity> {
        let entity = self.entities.update(ctx, entity_type, id, patch).await?;
        self.enqueue_for(ctx, &entity, OperationKind::Update, priority).await?;
        Ok(entity)
    }

    /// Tombstone an entity locally and queue the delete.
    pub async fn delete(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        priority: Priority,
    ) -> Result<OfflineEntity> {
        let entity = self.entities.delete(ctx, entity_type, id).await?;
        self.enqueue_for(ctx, &entity, OperationKind::Delete, priority).await?;
        Ok(entity)
    }

    async fn enqueue_for(
        &self,
        ctx: &TenantContext,
        entity: &OfflineEntity,
        kind: OperationKind,
        priority: Priority,
    ) -> Result<SyncOperation> {
        let op = SyncOperation::new(
            ctx,
            entity.metadata.entity_type,
            entity.id.clone(),
            kind,
            entity.data.clone(),
            priority,
        )?
        .with_version(entity.metadata.version)
        .with_base_version(entity.metadata.server_version);
        self.queue.push(ctx, op).await
    }

    /// Operations not yet completed in the context's scope.
    pub async fn pending_operations_count(&self, ctx: &TenantContext) -> Result<usize> {
        self.queue.pending_count(ctx).await
    }

    // ---- sync pass ----

    /// Push queued operations, then pull server changes.
    pub async fn bidirectional_sync(&self, ctx: &TenantContext) -> Result<SyncReport> {
        ctx.practice()?;
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(tenant_id = %ctx.tenant_id, "sync already running, skipping");
            return Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            });
        }
        let _guard = PassGuard(&self.syncing);

        let mut report = SyncReport::default();
        self.push_pass(ctx, &mut report).await?;
        if !report.offline {
            self.pull_pass(ctx, &mut report).await?;
        }

        info!(
            tenant_id = %ctx.tenant_id,
            pushed = report.pushed,
            failed = report.failed,
            deferred = report.deferred,
            conflicts = report.conflicts,
            pulled = report.pulled,
            offline = report.offline,
            "sync pass finished"
        );
        Ok(report)
    }

    async fn push_pass(&self, ctx: &TenantContext, report: &mut SyncReport) -> Result<()> {
        self.queue.recover_in_progress(ctx).await?;
        let ready = self
            .queue
            .ready(ctx, crate::now_millis(), Some(self.config.sync.batch_size))
            .await?;
        if ready.is_empty() {
            return Ok(());
        }

        let batch = order_operations(ready);
        report.cycles = batch.cycles;

        for op in batch.operations {
            match self.push_operation(ctx, &op.id).await? {
                PushOutcome::Pushed => report.pushed += 1,
                PushOutcome::Deferred => report.deferred += 1,
                PushOutcome::Failed => report.failed += 1,
                PushOutcome::Conflicted => report.conflicts += 1,
                PushOutcome::AutoResolved => report.auto_resolved += 1,
                PushOutcome::Offline => {
                    report.offline = true;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Push one operation. Local storage failures propagate; remote
    /// failures are recorded on the operation.
    async fn push_operation(&self, ctx: &TenantContext, op_id: &str) -> Result<PushOutcome> {
        // Earlier pushes in this pass may have rewritten the stored copy.
        let mut op = self.queue.get(ctx, op_id).await?;
        let octx = TenantContext {
            tenant_id: op.tenant_id.clone(),
            practice_id: Some(op.practice_id.clone()),
            user_id: Some(op.user_id.clone()),
        };

        op.entity_id = self.resolver.resolve(ctx, &op.entity_id).await?;
        op.data = self.resolver.resolve_all(ctx, &op.data).await?;

        let waiting_on_self = op.operation != OperationKind::Create && temp_id::is_temp_id(&op.entity_id);
        let unresolved = self
            .resolver
            .unresolved_references(ctx, op.entity_type, &op.data)
            .await?;
        if waiting_on_self || !unresolved.is_empty() {
            debug!(op_id, entity_id = %op.entity_id, ?unresolved, "deferring operation");
            return Ok(PushOutcome::Deferred);
        }

        self.queue.mark_in_progress(ctx, op_id).await?;

        if let Some(evaluator) = &self.permissions {
            let missing = evaluator
                .missing_permissions(&octx, &op.required_permissions)
                .await?;
            if !missing.is_empty() {
                let err = Error::PermissionDenied(missing.join(", "));
                return self.fail(ctx, &octx, &op, &err.to_string()).await;
            }
        }

        if op.operation != OperationKind::Create {
            if op.base_version.is_none() {
                op.base_version = self
                    .entities
                    .get_including_deleted(&octx, op.entity_type, &op.entity_id)
                    .await?
                    .and_then(|e| e.metadata.server_version);
            }

            let snapshot = match self.remote.fetch(&octx, op.entity_type, &op.entity_id).await {
                Ok(snapshot) => snapshot,
                Err(Error::Offline(reason)) => return self.offline(ctx, &op, &reason).await,
                Err(e) => return self.fail(ctx, &octx, &op, &e.to_string()).await,
            };

            match self.detector.detect(&op, snapshot.as_ref()) {
                Detection::Clear => {}
                Detection::AlreadyDeleted => {
                    let server_version = snapshot.map(|s| s.version);
                    self.queue.mark_completed(ctx, op_id).await?;
                    self.rebase_followers(&octx, &op, &op.entity_id, server_version).await?;
                    self.entities
                        .mark_synced(&octx, op.entity_type, &op.entity_id, server_version)
                        .await?;
                    debug!(op_id, "entity already deleted on server");
                    return Ok(PushOutcome::Pushed);
                }
                Detection::Conflict(conflict) => return self.on_conflict(ctx, &octx, *conflict).await,
            }
        }

        let request = PushRequest::from(&op);
        let result = match self.remote.push(&request).await {
            Ok(result) => result,
            Err(Error::Offline(reason)) => return self.offline(ctx, &op, &reason).await,
            Err(e) => return self.fail(ctx, &octx, &op, &e.to_string()).await,
        };
        if !result.success {
            let reason = result.error.unwrap_or_else(|| "rejected by server".to_string());
            return self.fail(ctx, &octx, &op, &reason).await;
        }

        let mut entity_id = op.entity_id.clone();
        if op.operation == OperationKind::Create && temp_id::is_temp_id(&entity_id) {
            let Some(real_id) = result.real_id else {
                return self.fail(ctx, &octx, &op, "server returned no id for create").await;
            };
            self.resolver
                .map_temp_to_real(ctx, &entity_id, &real_id, op.entity_type, op_id)
                .await?;
            entity_id = real_id;
        }

        self.queue.mark_completed(ctx, op_id).await?;
        self.rebase_followers(&octx, &op, &entity_id, result.server_version)
            .await?;
        self.mark_entity_synced(&octx, op.entity_type, &entity_id, result.server_version)
            .await?;
        debug!(op_id, entity_type = %op.entity_type, entity_id = %entity_id, "operation pushed");
        Ok(PushOutcome::Pushed)
    }

    /// Later operations on the entity were built on the same server version
    /// as `op`; move them onto the version the server now holds.
    async fn rebase_followers(
        &self,
        octx: &TenantContext,
        op: &SyncOperation,
        entity_id: &str,
        server_version: Option<u64>,
    ) -> Result<()> {
        if let (Some(from), Some(to)) = (op.base_version, server_version) {
            self.queue
                .advance_base_version(octx, op.entity_type, entity_id, from, to)
                .await?;
        }
        Ok(())
    }

    /// Record the server version; the record keeps a pending or conflict
    /// status while later operations for it are queued.
    async fn mark_entity_synced(
        &self,
        octx: &TenantContext,
        entity_type: EntityType,
        entity_id: &str,
        server_version: Option<u64>,
    ) -> Result<()> {
        self.entities
            .mark_synced(octx, entity_type, entity_id, server_version)
            .await?;
        let ops = self
            .queue
            .operations_for_entity(octx, entity_type, entity_id)
            .await?;
        let status = if ops.iter().any(|op| op.status == OperationStatus::Conflicted) {
            SyncStatus::Conflict
        } else if ops.iter().any(|op| op.status != OperationStatus::Completed) {
            SyncStatus::Pending
        } else {
            return Ok(());
        };
        self.entities
            .set_sync_status(octx, entity_type, entity_id, status)
            .await?;
        Ok(())
    }

    async fn offline(&self, ctx: &TenantContext, op: &SyncOperation, reason: &str) -> Result<PushOutcome> {
        self.queue.requeue(ctx, &op.id).await?;
        info!(op_id = %op.id, reason, "remote unreachable, ending push pass");
        Ok(PushOutcome::Offline)
    }

    async fn fail(
        &self,
        ctx: &TenantContext,
        octx: &TenantContext,
        op: &SyncOperation,
        reason: &str,
    ) -> Result<PushOutcome> {
        self.queue.mark_failed(ctx, &op.id, reason).await?;
        self.entities
            .set_sync_status(octx, op.entity_type, &op.entity_id, SyncStatus::Error)
            .await?;
        Ok(PushOutcome::Failed)
    }

    async fn on_conflict(
        &self,
        ctx: &TenantContext,
        octx: &TenantContext,
        conflict: Conflict,
    ) -> Result<PushOutcome> {
        let op = &conflict.operation;
        warn!(
            op_id = %op.id,
            conflict_id = %conflict.id,
            conflict_type = ?conflict.conflict_type,
            severity = conflict.severity.as_str(),
            "conflict detected"
        );
        self.conflicts.record(ctx, &conflict).await?;
        self.queue
            .mark_conflicted(ctx, &op.id, &conflict.id, &conflict.summary())
            .await?;
        self.entities
            .set_sync_status(octx, op.entity_type, &op.entity_id, SyncStatus::Conflict)
            .await?;

        if !(conflict.auto_resolvable && self.config.sync.auto_resolve_low_severity) {
            return Ok(PushOutcome::Conflicted);
        }
        let strategy = self.config.sync.low_severity_strategy;
        let action = resolve(&conflict, strategy)?;
        let partial = matches!(action, ResolutionAction::Partial(_));
        self.apply_resolution(ctx, conflict, strategy, action, true).await?;
        Ok(if partial {
            PushOutcome::Conflicted
        } else {
            PushOutcome::AutoResolved
        })
    }

    // ---- conflict resolution ----

    /// Resolve a stored conflict with `strategy`. A merge that leaves fields
    /// undecided is saved as a partial resolution and the conflict stays open.
    pub async fn resolve_conflict(
        &self,
        ctx: &TenantContext,
        conflict_id: &str,
        strategy: ResolutionStrategy,
    ) -> Result<Conflict> {
        let conflict = self.conflicts.get(ctx, conflict_id).await?;
        if conflict.resolved {
            return Ok(conflict);
        }
        let action = resolve(&conflict, strategy)?;
        self.apply_resolution(ctx, conflict, strategy, action, false).await
    }

    /// Finish a merge with a choice for each conflicting field.
    pub async fn resolve_conflict_fields(
        &self,
        ctx: &TenantContext,
        conflict_id: &str,
        choices: &HashMap<String, FieldChoice>,
    ) -> Result<Conflict> {
        let conflict = self.conflicts.get(ctx, conflict_id).await?;
        if conflict.resolved {
            return Ok(conflict);
        }
        let partial = match conflict.partial_resolution.clone() {
            Some(partial) => partial,
            None => match resolve(&conflict, ResolutionStrategy::Merge)? {
                ResolutionAction::Partial(partial) => partial,
                action => {
                    return self
                        .apply_resolution(ctx, conflict, ResolutionStrategy::Merge, action, false)
                        .await
                }
            },
        };

        let data = apply_field_choices(&conflict, &partial, choices)?;
        let action = ResolutionAction::Push {
            data,
            base_version: conflict.server_version,
        };
        self.apply_resolution(ctx, conflict, ResolutionStrategy::Merge, action, false)
            .await
    }

    async fn apply_resolution(
        &self,
        ctx: &TenantContext,
        conflict: Conflict,
        strategy: ResolutionStrategy,
        action: ResolutionAction,
        automatic: bool,
    ) -> Result<Conflict> {
        let op = conflict.operation.clone();
        let octx = TenantContext {
            tenant_id: op.tenant_id.clone(),
            practice_id: Some(op.practice_id.clone()),
            user_id: Some(op.user_id.clone()),
        };

        let resolved_data = match action {
            ResolutionAction::Partial(partial) => {
                debug!(conflict_id = %conflict.id, pending = ?partial.pending_fields, "merge needs field choices");
                return self.conflicts.save_partial(ctx, &conflict.id, partial).await;
            }
            ResolutionAction::AcceptServer => {
                self.accept_server(&octx, &conflict).await?;
                self.queue.mark_completed(ctx, &op.id).await?;
                None
            }
            ResolutionAction::Push { data, base_version } => {
                self.queue
                    .requeue_with(ctx, &op.id, data.clone(), base_version)
                    .await?;
                self.replace_local(&octx, op.entity_type, &op.entity_id, data.clone(), base_version)
                    .await?;
                Some(data)
            }
            ResolutionAction::Recreate { data } => {
                self.recreate(ctx, &octx, &op, data.clone()).await?;
                Some(data)
            }
        };

        let resolution = Resolution {
            strategy,
            resolved_data,
            resolved_at: crate::now_millis(),
            automatic,
        };
        info!(conflict_id = %conflict.id, strategy = %strategy, automatic, "conflict resolved");
        self.conflicts.mark_resolved(ctx, &conflict.id, resolution).await
    }

    async fn accept_server(&self, octx: &TenantContext, conflict: &Conflict) -> Result<()> {
        let op = &conflict.operation;
        match (&conflict.server_data, conflict.server_version) {
            (Some(data), Some(version)) => {
                self.entities
                    .apply_server_snapshot(octx, op.entity_type, &op.entity_id, data.clone(), version, false)
                    .await?;
            }
            _ => {
                // The server no longer has the entity.
                self.entities
                    .hard_delete(octx, op.entity_type, &op.entity_id)
                    .await?;
            }
        }
        Ok(())
    }

    async fn replace_local(
        &self,
        octx: &TenantContext,
        entity_type: EntityType,
        id: &str,
        data: Value,
        server_version: Option<u64>,
    ) -> Result<()> {
        let Some(mut entity) = self.entities.get_including_deleted(octx, entity_type, id).await? else {
            return Ok(());
        };
        if entity.data != data {
            entity.data = data;
            entity.metadata.version += 1;
            entity.metadata.last_modified = crate::now_millis();
            entity.metadata.modified_by = octx.user().to_string();
        }
        entity.metadata.sync_status = SyncStatus::Pending;
        entity.metadata.server_version = server_version.or(entity.metadata.server_version);
        self.entities.put_raw(octx, &entity).await
    }

    /// The server lost the entity: move the local record to a fresh temp id
    /// and queue a create for it.
    async fn recreate(
        &self,
        ctx: &TenantContext,
        octx: &TenantContext,
        op: &SyncOperation,
        data: Value,
    ) -> Result<()> {
        let temp = self.resolver.generate(op.entity_type);
        if let Some(mut entity) = self
            .entities
            .rekey(octx, op.entity_type, &op.entity_id, &temp)
            .await?
        {
            entity.data = data.clone();
            entity.metadata.sync_status = SyncStatus::Pending;
            entity.metadata.server_version = None;
            entity.metadata.last_synced_at = None;
            self.entities.put_raw(octx, &entity).await?;
        }

        self.queue.mark_completed(ctx, &op.id).await?;
        let create = SyncOperation::new(octx, op.entity_type, temp.clone(), OperationKind::Create, data, op.priority)?;
        self.queue.push(ctx, create).await?;
        info!(old_id = %op.entity_id, temp_id = %temp, "recreating entity missing on server");
        Ok(())
    }

    // ---- pull ----

    async fn pull_pass(&self, ctx: &TenantContext, report: &mut SyncReport) -> Result<()> {
        let practice_id = ctx.practice()?.to_string();
        let key = pull_cursor_key(&practice_id);
        let lease = self.databases.connection(ctx).await?;
        let mut cursor = lease
            .get(METADATA_STORE, &key)
            .await?
            .and_then(|v| v.get("cursor").and_then(Value::as_str).map(str::to_string));

        loop {
            let page = match self
                .remote
                .changes_since(ctx, cursor.as_deref(), self.config.sync.pull_page_size)
                .await
            {
                Ok(page) => page,
                Err(e) if e.is_retryable() => {
                    report.offline = matches!(e, Error::Offline(_));
                    warn!(error = %e, "pull interrupted");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            for snapshot in &page.changes {
                if snapshot.practice_id == practice_id && self.apply_pulled(ctx, snapshot).await? {
                    report.pulled += 1;
                }
            }

            if let Some(next) = page.next_cursor {
                lease
                    .put(
                        METADATA_STORE,
                        &key,
                        &json!({"kind": "pull_cursor", "practiceId": practice_id, "cursor": next, "updatedAt": crate::now_millis()}),
                    )
                    .await?;
                cursor = Some(next);
            }
            if !page.has_more || page.changes.is_empty() {
                break;
            }
        }
        Ok(())
    }

    /// Store one pulled snapshot unless local work on the entity is pending.
    async fn apply_pulled(&self, ctx: &TenantContext, snapshot: &ServerSnapshot) -> Result<bool> {
        let outstanding = self
            .queue
            .operations_for_entity(ctx, snapshot.entity_type, &snapshot.id)
            .await?
            .iter()
            .any(|op| op.status != OperationStatus::Completed);
        if outstanding {
            debug!(entity_id = %snapshot.id, "skipping pulled change with local work pending");
            return Ok(false);
        }

        let local = self
            .entities
            .get_including_deleted(ctx, snapshot.entity_type, &snapshot.id)
            .await?;
        if let Some(local) = &local {
            if local.metadata.sync_status != SyncStatus::Synced {
                return Ok(false);
            }
            if local.metadata.server_version.map_or(false, |v| v >= snapshot.version) {
                return Ok(false);
            }
        }

        self.entities
            .apply_server_snapshot(
                ctx,
                snapshot.entity_type,
                &snapshot.id,
                snapshot.data.clone(),
                snapshot.version,
                snapshot.deleted,
            )
            .await?;
        Ok(true)
    }

    // ---- maintenance ----

    /// Drop completed operations, old id mappings, confirmed tombstones and
    /// resolved conflicts.
    pub async fn gc(&self, ctx: &TenantContext) -> Result<GcReport> {
        let report = GcReport {
            completed_operations: self.queue.clear_completed(ctx).await?,
            id_mappings: self
                .resolver
                .gc_mappings(ctx, self.config.id_mapping_max_age)
                .await?,
            tombstones: self.entities.purge_synced_tombstones(ctx).await?,
            resolved_conflicts: self.conflicts.clear_resolved(ctx).await?,
        };
        debug!(?report, "garbage collected");
        Ok(report)
    }
}

/// Drives sync for the manager's current tenant, for the network monitor.
#[async_trait]
impl SyncHooks for SyncEngine {
    async fn pending_operations_count(&self) -> Result<usize> {
        match self.databases.current_context().await {
            Some(ctx) => SyncEngine::pending_operations_count(self, &ctx).await,
            None => Ok(0),
        }
    }

    async fn bidirectional_sync(&self) -> Result<SyncReport> {
        match self.databases.current_context().await {
            Some(ctx) => SyncEngine::bidirectional_sync(self, &ctx).await,
            None => Ok(SyncReport {
                skipped: true,
                ..SyncReport::default()
            }),
        }
    }
}
