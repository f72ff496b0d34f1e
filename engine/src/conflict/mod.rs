//! Conflict detection and resolution.
//!
//! Before an update or delete is pushed, the server's current state is
//! compared with the operation. Divergences become [`Conflict`]s classified by
//! type and severity; low severity ones may be resolved automatically, the
//! rest wait in the `conflicts` store for a decision.

mod detector;
mod resolver;
mod store;

pub use detector::{diff_fields, ConflictDetector, Detection, COSMETIC_FIELDS, METADATA_FIELDS};
pub use resolver::{apply_field_choices, resolve, FieldChoice, ResolutionAction};
pub use store::ConflictStore;

use crate::queue::SyncOperation;
use crate::{Error, Timestamp, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictType {
    /// Server version moved past the version the change was based on
    Version,
    /// Server copy is newer than the local change
    Timestamp,
    /// Payloads differ with no version information
    Data,
    /// Local delete of an entity the server changed
    Deletion,
    /// Local update of an entity the server no longer has
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldChange {
    /// Present locally only
    Added,
    /// Present on the server only
    Removed,
    Modified,
    Unchanged,
}

/// Comparison of one field between the local and server payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiff {
    pub field: String,
    pub change: FieldChange,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<Value>,
}

/// How a conflict is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    ServerWins,
    ClientWins,
    Merge,
    LastWriteWins,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::ServerWins => "server-wins",
            ResolutionStrategy::ClientWins => "client-wins",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::LastWriteWins => "last-write-wins",
        }
    }
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResolutionStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server-wins" => Ok(ResolutionStrategy::ServerWins),
            "client-wins" => Ok(ResolutionStrategy::ClientWins),
            "merge" => Ok(ResolutionStrategy::Merge),
            "last-write-wins" => Ok(ResolutionStrategy::LastWriteWins),
            other => Err(Error::Validation(format!("unknown resolution strategy '{}'", other))),
        }
    }
}

/// Outcome recorded on a resolved conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    /// Data pushed after resolution, `None` when the server copy was kept
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_data: Option<Value>,
    pub resolved_at: Timestamp,
    /// Whether the resolution was applied without user input
    pub automatic: bool,
}

/// A merge that still needs a decision on some fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResolution {
    /// Merged payload, holding server values for the pending fields
    pub merged: Value,
    pub pending_fields: Vec<String>,
}

/// A divergence between a queued operation and the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conflict {
    pub id: String,
    pub operation: SyncOperation,
    pub local_data: Value,
    /// Server payload, absent when the server no longer has the entity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_last_modified: Option<Timestamp>,
    pub detected_at: Timestamp,
    pub conflict_type: ConflictType,
    pub affected_fields: Vec<String>,
    pub field_diffs: Vec<FieldDiff>,
    pub severity: Severity,
    pub auto_resolvable: bool,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partial_resolution: Option<PartialResolution>,
}

impl Conflict {
    /// Short description used as the operation's error text.
    pub fn summary(&self) -> String {
        format!(
            "{:?} conflict ({}) on {} {}: {}",
            self.conflict_type,
            self.severity.as_str(),
            self.operation.entity_type,
            self.operation.entity_id,
            if self.affected_fields.is_empty() {
                "entity state".to_string()
            } else {
                self.affected_fields.join(", ")
            }
        )
    }
}
