//! Conflict detection against a server snapshot.

use super::{Conflict, ConflictType, FieldChange, FieldDiff, Severity};
use crate::queue::{OperationKind, SyncOperation};
use crate::record::DELETED_FIELD;
use crate::remote::ServerSnapshot;
use crate::schema::Schema;
use crate::EntityType;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Bookkeeping fields that never count as a divergence.
pub const METADATA_FIELDS: &[&str] = &[
    "version",
    "serverVersion",
    "lastModified",
    "updatedAt",
    "createdAt",
    "lastSyncedAt",
    "syncStatus",
    "createdBy",
    "modifiedBy",
    "metadata",
];

/// Presentation-only fields. Divergence limited to these is low severity.
pub const COSMETIC_FIELDS: &[&str] = &[
    "displayName",
    "displayOrder",
    "sortOrder",
    "color",
    "icon",
    "avatarUrl",
    "tags",
];

const HIGH_SEVERITY_FIELD_COUNT: usize = 5;

fn is_metadata(field: &str) -> bool {
    METADATA_FIELDS.contains(&field)
}

fn is_cosmetic(field: &str) -> bool {
    (field.starts_with('_') && field != DELETED_FIELD) || COSMETIC_FIELDS.contains(&field)
}

/// Outcome of checking one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    /// Safe to push
    Clear,
    /// Local delete of an entity the server has already removed
    AlreadyDeleted,
    Conflict(Box<Conflict>),
}

/// Compare two payloads field by field, skipping metadata fields.
pub fn diff_fields(local: &Value, server: &Value) -> Vec<FieldDiff> {
    let empty = Map::new();
    let local = local.as_object().unwrap_or(&empty);
    let server = server.as_object().unwrap_or(&empty);

    let fields: BTreeSet<&String> = local.keys().chain(server.keys()).collect();
    fields
        .into_iter()
        .filter(|f| !is_metadata(f))
        .map(|field| {
            let l = local.get(field);
            let s = server.get(field);
            let change = match (l, s) {
                (Some(_), None) => FieldChange::Added,
                (None, Some(_)) => FieldChange::Removed,
                (Some(a), Some(b)) if a == b => FieldChange::Unchanged,
                _ => FieldChange::Modified,
            };
            FieldDiff {
                field: field.clone(),
                change,
                local: l.cloned(),
                server: s.cloned(),
            }
        })
        .collect()
}

pub struct ConflictDetector {
    schema: Arc<Schema>,
}

impl ConflictDetector {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self { schema }
    }

    /// Classify the divergence in `affected` fields of `entity_type`.
    pub fn severity(&self, entity_type: EntityType, affected: &[String]) -> Severity {
        let schema = self.schema.get(entity_type).ok();
        let critical = affected.iter().any(|f| {
            f == "id" || schema.map_or(false, |s| s.is_relationship(f))
        });
        if critical {
            return Severity::Critical;
        }
        if !affected.is_empty() && affected.iter().all(|f| is_cosmetic(f)) {
            return Severity::Low;
        }

        let significant = affected.iter().filter(|f| !is_cosmetic(f)).count();
        if significant > HIGH_SEVERITY_FIELD_COUNT {
            Severity::High
        } else {
            Severity::Medium
        }
    }

    /// Check an operation against the server's copy of its entity. `None`
    /// means the server does not have the entity.
    pub fn detect(&self, op: &SyncOperation, snapshot: Option<&ServerSnapshot>) -> Detection {
        let live = snapshot.filter(|s| !s.deleted);

        match op.operation {
            OperationKind::Create => Detection::Clear,
            OperationKind::Update => match live {
                None => Detection::Conflict(Box::new(self.build(
                    op,
                    snapshot,
                    ConflictType::Missing,
                    Vec::new(),
                    Severity::Critical,
                ))),
                Some(server) => self.detect_update(op, server),
            },
            OperationKind::Delete => match live {
                None => Detection::AlreadyDeleted,
                Some(server) if op.base_version.map_or(true, |b| b == server.version) => {
                    Detection::Clear
                }
                Some(server) => {
                    let diffs = diff_fields(&op.data, &server.data);
                    Detection::Conflict(Box::new(self.build(
                        op,
                        Some(server),
                        ConflictType::Deletion,
                        diffs,
                        Severity::High,
                    )))
                }
            },
        }
    }

    fn detect_update(&self, op: &SyncOperation, server: &ServerSnapshot) -> Detection {
        if op.base_version == Some(server.version) {
            return Detection::Clear;
        }

        let diffs = diff_fields(&op.data, &server.data);
        let affected: Vec<String> = diffs
            .iter()
            .filter(|d| d.change != FieldChange::Unchanged)
            .map(|d| d.field.clone())
            .collect();
        if affected.is_empty() {
            return Detection::Clear;
        }

        let conflict_type = if op.base_version.is_some() {
            ConflictType::Version
        } else if server.last_modified > op.timestamp {
            ConflictType::Timestamp
        } else {
            ConflictType::Data
        };
        let severity = self.severity(op.entity_type, &affected);
        Detection::Conflict(Box::new(self.build(op, Some(server), conflict_type, diffs, severity)))
    }

    fn build(
        &self,
        op: &SyncOperation,
        server: Option<&ServerSnapshot>,
        conflict_type: ConflictType,
        field_diffs: Vec<FieldDiff>,
        severity: Severity,
    ) -> Conflict {
        let affected_fields = field_diffs
            .iter()
            .filter(|d| d.change != FieldChange::Unchanged)
            .map(|d| d.field.clone())
            .collect();
        let auto_resolvable = severity == Severity::Low
            && !matches!(conflict_type, ConflictType::Missing | ConflictType::Deletion);

        Conflict {
            id: uuid::Uuid::new_v4().to_string(),
            operation: op.clone(),
            local_data: op.data.clone(),
            server_data: server.filter(|s| !s.deleted).map(|s| s.data.clone()),
            server_version: server.map(|s| s.version),
            server_last_modified: server.map(|s| s.last_modified),
            detected_at: crate::now_millis(),
            conflict_type,
            affected_fields,
            field_diffs,
            severity,
            auto_resolvable,
            resolved: false,
            resolution: None,
            partial_resolution: None,
        }
    }
}
