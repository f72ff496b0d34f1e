//! Resolution strategies.

use super::{Conflict, ConflictType, FieldChange, PartialResolution, ResolutionStrategy};
use crate::record::DELETED_FIELD;
use crate::{error::Result, Error, Version};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// What the engine does once a strategy has been applied.
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionAction {
    /// Keep the server's state and drop the local operation
    AcceptServer,
    /// Push `data` again, now based on the server's version
    Push {
        data: Value,
        base_version: Option<Version>,
    },
    /// The server lost the entity; create it again from local data
    Recreate { data: Value },
    /// Merge needs manual choices for some fields
    Partial(PartialResolution),
}

/// A manual decision for one conflicting field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", content = "value", rename_all = "lowercase")]
pub enum FieldChoice {
    Local,
    Server,
    Custom(Value),
}

fn local_wins(conflict: &Conflict) -> ResolutionAction {
    if conflict.conflict_type == ConflictType::Missing {
        let mut data = conflict.local_data.clone();
        if let Value::Object(map) = &mut data {
            map.remove("id");
            map.remove(DELETED_FIELD);
        }
        ResolutionAction::Recreate { data }
    } else {
        ResolutionAction::Push {
            data: conflict.local_data.clone(),
            base_version: conflict.server_version,
        }
    }
}

/// Apply `strategy` to a conflict.
pub fn resolve(conflict: &Conflict, strategy: ResolutionStrategy) -> Result<ResolutionAction> {
    match strategy {
        ResolutionStrategy::ServerWins => Ok(ResolutionAction::AcceptServer),
        ResolutionStrategy::ClientWins => Ok(local_wins(conflict)),
        ResolutionStrategy::LastWriteWins => {
            // Ties, and servers that gave no time, go to the server.
            let local_newer = conflict
                .server_last_modified
                .map_or(false, |server| conflict.operation.timestamp > server);
            if local_newer {
                Ok(local_wins(conflict))
            } else {
                Ok(ResolutionAction::AcceptServer)
            }
        }
        ResolutionStrategy::Merge => merge(conflict),
    }
}

fn merge(conflict: &Conflict) -> Result<ResolutionAction> {
    if matches!(conflict.conflict_type, ConflictType::Missing | ConflictType::Deletion) {
        return Err(Error::Validation(format!(
            "a {:?} conflict cannot be merged",
            conflict.conflict_type
        )));
    }
    let Some(Value::Object(server)) = &conflict.server_data else {
        return Err(Error::Validation("merge requires a server payload".into()));
    };

    let mut merged = server.clone();
    let mut pending_fields = Vec::new();
    for diff in &conflict.field_diffs {
        match diff.change {
            FieldChange::Added => {
                if let Some(local) = &diff.local {
                    merged.insert(diff.field.clone(), local.clone());
                }
            }
            FieldChange::Modified => pending_fields.push(diff.field.clone()),
            FieldChange::Removed | FieldChange::Unchanged => {}
        }
    }

    let merged = Value::Object(merged);
    if pending_fields.is_empty() {
        Ok(ResolutionAction::Push {
            data: merged,
            base_version: conflict.server_version,
        })
    } else {
        Ok(ResolutionAction::Partial(PartialResolution {
            merged,
            pending_fields,
        }))
    }
}

/// Finish a partial merge with a choice for every pending field.
pub fn apply_field_choices(
    conflict: &Conflict,
    partial: &PartialResolution,
    choices: &HashMap<String, FieldChoice>,
) -> Result<Value> {
    let missing: Vec<&str> = partial
        .pending_fields
        .iter()
        .filter(|f| !choices.contains_key(*f))
        .map(String::as_str)
        .collect();
    if !missing.is_empty() {
        return Err(Error::Validation(format!(
            "no choice given for fields: {}",
            missing.join(", ")
        )));
    }

    let mut merged = partial.merged.clone();
    let Value::Object(map) = &mut merged else {
        return Err(Error::InvalidPayload("merged payload must be an object".into()));
    };
    for field in &partial.pending_fields {
        match choices.get(field) {
            Some(FieldChoice::Local) => match conflict.local_data.get(field) {
                Some(value) => {
                    map.insert(field.clone(), value.clone());
                }
                None => {
                    map.remove(field);
                }
            },
            Some(FieldChoice::Custom(value)) => {
                map.insert(field.clone(), value.clone());
            }
            Some(FieldChoice::Server) | None => {}
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{diff_fields, Severity};
    use crate::database::TenantContext;
    use crate::queue::{OperationKind, Priority, SyncOperation};
    use crate::EntityType;
    use serde_json::json;

    fn conflict(local: Value, server: Option<Value>, server_last_modified: Option<u64>) -> Conflict {
        let ctx = TenantContext::new("t1").with_practice("p1");
        let mut op = SyncOperation::new(&ctx, EntityType::Pet, "12", OperationKind::Update, local.clone(), Priority::Normal)
            .unwrap();
        op.timestamp = 1000;
        let field_diffs = server
            .as_ref()
            .map(|s| diff_fields(&local, s))
            .unwrap_or_default();
        Conflict {
            id: "c1".into(),
            operation: op,
            local_data: local,
            conflict_type: if server.is_some() {
                ConflictType::Version
            } else {
                ConflictType::Missing
            },
            server_data: server,
            server_version: Some(7),
            server_last_modified,
            detected_at: 0,
            affected_fields: vec![],
            field_diffs,
            severity: Severity::Medium,
            auto_resolvable: false,
            resolved: false,
            resolution: None,
            partial_resolution: None,
        }
    }

    #[test]
    fn server_and_client_wins() {
        let c = conflict(json!({"name": "Rex"}), Some(json!({"name": "Max"})), Some(500));
        assert_eq!(resolve(&c, ResolutionStrategy::ServerWins).unwrap(), ResolutionAction::AcceptServer);
        assert_eq!(
            resolve(&c, ResolutionStrategy::ClientWins).unwrap(),
            ResolutionAction::Push {
                data: json!({"name": "Rex"}),
                base_version: Some(7)
            }
        );
    }

    #[test]
    fn last_write_wins_ties_go_to_server() {
        let newer_local = conflict(json!({"name": "Rex"}), Some(json!({"name": "Max"})), Some(999));
        assert!(matches!(
            resolve(&newer_local, ResolutionStrategy::LastWriteWins).unwrap(),
            ResolutionAction::Push { .. }
        ));

        let tie = conflict(json!({"name": "Rex"}), Some(json!({"name": "Max"})), Some(1000));
        assert_eq!(
            resolve(&tie, ResolutionStrategy::LastWriteWins).unwrap(),
            ResolutionAction::AcceptServer
        );
    }

    #[test]
    fn merge_applies_additions_and_leaves_modifications_pending() {
        let c = conflict(
            json!({"name": "Rex", "breed": "collie", "weightKg": 30}),
            Some(json!({"name": "Max", "weightKg": 30, "microchip": "X1"})),
            Some(500),
        );
        let ResolutionAction::Partial(partial) = resolve(&c, ResolutionStrategy::Merge).unwrap() else {
            panic!("expected a partial merge");
        };
        assert_eq!(partial.pending_fields, vec!["name"]);
        assert_eq!(
            partial.merged,
            json!({"name": "Max", "breed": "collie", "weightKg": 30, "microchip": "X1"})
        );

        let mut choices = HashMap::new();
        assert!(apply_field_choices(&c, &partial, &choices).is_err());
        choices.insert("name".to_string(), FieldChoice::Local);
        let final_data = apply_field_choices(&c, &partial, &choices).unwrap();
        assert_eq!(final_data["name"], json!("Rex"));

        choices.insert("name".to_string(), FieldChoice::Custom(json!("Rex II")));
        assert_eq!(apply_field_choices(&c, &partial, &choices).unwrap()["name"], json!("Rex II"));
    }

    #[test]
    fn merge_without_modifications_pushes_directly() {
        let c = conflict(json!({"name": "Rex", "breed": "collie"}), Some(json!({"name": "Rex"})), None);
        assert_eq!(
            resolve(&c, ResolutionStrategy::Merge).unwrap(),
            ResolutionAction::Push {
                data: json!({"name": "Rex", "breed": "collie"}),
                base_version: Some(7)
            }
        );
    }

    #[test]
    fn missing_entity_is_recreated_when_client_wins() {
        let c = conflict(json!({"id": 12, "name": "Rex"}), None, None);
        assert_eq!(
            resolve(&c, ResolutionStrategy::ClientWins).unwrap(),
            ResolutionAction::Recreate {
                data: json!({"name": "Rex"})
            }
        );
        assert!(resolve(&c, ResolutionStrategy::Merge).is_err());
    }

    #[test]
    fn field_choice_wire_format() {
        let choice: FieldChoice = serde_json::from_value(json!({"choice": "custom", "value": 3})).unwrap();
        assert_eq!(choice, FieldChoice::Custom(json!(3)));
        let choice: FieldChoice = serde_json::from_value(json!({"choice": "server"})).unwrap();
        assert_eq!(choice, FieldChoice::Server);
    }
}
