//! Schema definition and validation.
//!
//! Schemas define the structure of each entity type and declare the
//! relationships between them. Relationship extraction, temp id rewriting and
//! conflict severity are all driven by these declarations rather than by
//! field naming conventions.

use crate::{error::Result, EntityId, EntityType, Error, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Field types supported in schemas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    Timestamp,
    /// Arbitrary nested JSON
    Json,
    /// Identifier of another entity (string or integer)
    Reference(EntityType),
    /// Array of identifiers of another entity type
    ReferenceList(EntityType),
}

impl FieldType {
    /// The entity type this field points at, if it is a relationship.
    pub fn referenced_type(&self) -> Option<EntityType> {
        match self {
            FieldType::Reference(t) | FieldType::ReferenceList(t) => Some(*t),
            _ => None,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::String => write!(f, "String"),
            FieldType::Int => write!(f, "Int"),
            FieldType::Float => write!(f, "Float"),
            FieldType::Bool => write!(f, "Bool"),
            FieldType::Timestamp => write!(f, "Timestamp"),
            FieldType::Json => write!(f, "Json"),
            FieldType::Reference(t) => write!(f, "Reference({})", t),
            FieldType::ReferenceList(t) => write!(f, "ReferenceList({})", t),
        }
    }
}

/// Definition of a field in an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Field type
    pub field_type: FieldType,
    /// Whether this field is required
    pub required: bool,
}

impl FieldDef {
    /// Create a new required field definition.
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    /// Create a new optional field definition.
    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Validate a JSON value against this field definition.
    pub fn validate(&self, value: Option<&Value>) -> Result<()> {
        match value {
            None if self.required => Err(Error::MissingRequiredField(self.name.clone())),
            None => Ok(()),
            Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            Some(Value::Null) => Ok(()),
            Some(v) => self.validate_type(v),
        }
    }

    fn validate_type(&self, value: &Value) -> Result<()> {
        let valid = match self.field_type {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_f64() || value.is_i64() || value.is_u64(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64() || value.is_i64(),
            FieldType::Json => true,
            FieldType::Reference(_) => is_identifier(value),
            FieldType::ReferenceList(_) => value
                .as_array()
                .map(|items| items.iter().all(is_identifier))
                .unwrap_or(false),
        };

        if valid {
            Ok(())
        } else {
            Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            })
        }
    }
}

fn is_identifier(value: &Value) -> bool {
    value.is_string() || value.is_i64() || value.is_u64()
}

/// Render an identifier value (string or integer) as an entity id.
pub fn identifier_of(value: &Value) -> Option<EntityId> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
        _ => None,
    }
}

/// JSON representation of an identifier. Integer server ids are stored as
/// numbers, everything else as strings.
pub fn identifier_value(id: &str) -> Value {
    match id.parse::<i64>() {
        Ok(n) if n.to_string() == id => Value::from(n),
        _ => Value::String(id.to_string()),
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A reference from one entity's payload to another entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityReference {
    /// Field holding the reference
    pub field: String,
    /// Type of the referenced entity
    pub entity_type: EntityType,
    /// Referenced identifier (real or temporary)
    pub id: EntityId,
}

/// Schema for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySchema {
    /// Entity type
    pub entity_type: EntityType,
    /// Field definitions
    pub fields: Vec<FieldDef>,
}

impl EntitySchema {
    /// Create a new entity schema.
    pub fn new(entity_type: EntityType, fields: Vec<FieldDef>) -> Self {
        Self {
            entity_type,
            fields,
        }
    }

    /// Validate a payload against this schema.
    pub fn validate_payload(&self, payload: &Value) -> Result<()> {
        let obj = payload
            .as_object()
            .ok_or_else(|| Error::InvalidPayload("payload must be an object".into()))?;

        for field in &self.fields {
            field.validate(obj.get(&field.name))?;
        }

        if let Some(deleted) = obj.get(crate::record::DELETED_FIELD) {
            if !deleted.is_boolean() {
                return Err(Error::TypeMismatch {
                    field: crate::record::DELETED_FIELD.to_string(),
                    expected: FieldType::Bool.to_string(),
                    got: json_type_name(deleted).to_string(),
                });
            }
        }

        Ok(())
    }

    /// Fields declared as relationships, with the type they point at.
    pub fn relationship_fields(&self) -> impl Iterator<Item = (&str, EntityType)> {
        self.fields
            .iter()
            .filter_map(|f| f.field_type.referenced_type().map(|t| (f.name.as_str(), t)))
    }

    /// Fields holding free-form nested JSON.
    pub fn nested_fields(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.field_type == FieldType::Json)
            .map(|f| f.name.as_str())
    }

    /// Whether `name` is a declared relationship field.
    pub fn is_relationship(&self, name: &str) -> bool {
        self.relationship_fields().any(|(field, _)| field == name)
    }

    /// Extract every reference present in a payload.
    pub fn references(&self, payload: &Value) -> Vec<EntityReference> {
        let mut refs = Vec::new();
        let Some(obj) = payload.as_object() else {
            return refs;
        };

        for field in &self.fields {
            let Some(value) = obj.get(&field.name) else {
                continue;
            };
            match field.field_type {
                FieldType::Reference(target) => {
                    if let Some(id) = identifier_of(value) {
                        refs.push(EntityReference {
                            field: field.name.clone(),
                            entity_type: target,
                            id,
                        });
                    }
                }
                FieldType::ReferenceList(target) => {
                    for id in value.as_array().into_iter().flatten().filter_map(identifier_of) {
                        refs.push(EntityReference {
                            field: field.name.clone(),
                            entity_type: target,
                            id,
                        });
                    }
                }
                _ => {}
            }
        }

        refs
    }
}

/// Schema for every entity type the engine knows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Schema version
    pub version: SchemaVersion,
    /// Entity schemas by type
    pub entities: HashMap<EntityType, EntitySchema>,
}

impl Schema {
    /// Create a new, empty schema.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            entities: HashMap::new(),
        }
    }

    /// Add an entity schema.
    pub fn add_entity(&mut self, entity: EntitySchema) -> &mut Self {
        self.entities.insert(entity.entity_type, entity);
        self
    }

    /// Builder-style method to add an entity schema.
    pub fn with_entity(mut self, entity: EntitySchema) -> Self {
        self.add_entity(entity);
        self
    }

    /// Get the schema for an entity type.
    pub fn get(&self, entity_type: EntityType) -> Result<&EntitySchema> {
        self.entities
            .get(&entity_type)
            .ok_or_else(|| Error::Validation(format!("no schema for entity type {}", entity_type)))
    }

    /// Validate a payload for the given entity type.
    pub fn validate(&self, entity_type: EntityType, payload: &Value) -> Result<()> {
        self.get(entity_type)?.validate_payload(payload)
    }

    /// References present in a payload of the given type. Unknown types yield
    /// no references.
    pub fn references(&self, entity_type: EntityType, payload: &Value) -> Vec<EntityReference> {
        self.entities
            .get(&entity_type)
            .map(|s| s.references(payload))
            .unwrap_or_default()
    }

    /// Permission strings (`resource:action`) a mutation requires: the action
    /// on the entity itself plus read access to every referenced type.
    pub fn required_permissions(
        &self,
        entity_type: EntityType,
        action: &str,
        payload: &Value,
    ) -> Vec<String> {
        let mut perms = vec![format!("{}:{}", entity_type.store_base(), action)];
        for reference in self.references(entity_type, payload) {
            let perm = format!("{}:read", reference.entity_type.store_base());
            if !perms.contains(&perm) {
                perms.push(perm);
            }
        }
        perms
    }

    /// The schema of the clinical practice domain.
    pub fn clinical() -> Self {
        use EntityType::*;
        use FieldType::*;

        Schema::new(1)
            .with_entity(EntitySchema::new(
                Practitioner,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::optional("role", String),
                    FieldDef::optional("email", String),
                    FieldDef::optional("licenseNumber", String),
                ],
            ))
            .with_entity(EntitySchema::new(
                Client,
                vec![
                    FieldDef::required("firstName", String),
                    FieldDef::required("lastName", String),
                    FieldDef::optional("email", String),
                    FieldDef::optional("phone", String),
                    FieldDef::optional("address", Json),
                    FieldDef::optional("preferredPractitionerId", Reference(Practitioner)),
                ],
            ))
            .with_entity(EntitySchema::new(
                Pet,
                vec![
                    FieldDef::required("name", String),
                    FieldDef::required("species", String),
                    FieldDef::required("clientId", Reference(Client)),
                    FieldDef::optional("breed", String),
                    FieldDef::optional("dateOfBirth", Timestamp),
                    FieldDef::optional("weightKg", Float),
                    FieldDef::optional("microchip", String),
                ],
            ))
            .with_entity(EntitySchema::new(
                Appointment,
                vec![
                    FieldDef::required("petId", Reference(Pet)),
                    FieldDef::optional("clientId", Reference(Client)),
                    FieldDef::optional("practitionerId", Reference(Practitioner)),
                    FieldDef::required("scheduledAt", Timestamp),
                    FieldDef::optional("durationMinutes", Int),
                    FieldDef::optional("reason", String),
                    FieldDef::optional("status", String),
                ],
            ))
            .with_entity(EntitySchema::new(
                ClinicalNote,
                vec![
                    FieldDef::required("petId", Reference(Pet)),
                    FieldDef::optional("appointmentId", Reference(Appointment)),
                    FieldDef::optional("practitionerId", Reference(Practitioner)),
                    FieldDef::optional("subjective", String),
                    FieldDef::optional("objective", String),
                    FieldDef::optional("assessment", String),
                    FieldDef::optional("plan", String),
                    FieldDef::optional("vitals", Json),
                    FieldDef::optional("completed", Bool),
                ],
            ))
            .with_entity(EntitySchema::new(
                Checklist,
                vec![
                    FieldDef::required("title", String),
                    FieldDef::optional("petId", Reference(Pet)),
                    FieldDef::optional("appointmentId", Reference(Appointment)),
                    FieldDef::optional("items", Json),
                    FieldDef::optional("completed", Bool),
                ],
            ))
            .with_entity(EntitySchema::new(
                Prescription,
                vec![
                    FieldDef::required("petId", Reference(Pet)),
                    FieldDef::optional("appointmentId", Reference(Appointment)),
                    FieldDef::optional("practitionerId", Reference(Practitioner)),
                    FieldDef::required("medication", String),
                    FieldDef::optional("dosage", String),
                    FieldDef::optional("refills", Int),
                ],
            ))
            .with_entity(EntitySchema::new(
                Invoice,
                vec![
                    FieldDef::required("clientId", Reference(Client)),
                    FieldDef::optional("appointmentIds", ReferenceList(Appointment)),
                    FieldDef::optional("lineItems", Json),
                    FieldDef::optional("total", Float),
                    FieldDef::optional("status", String),
                ],
            ))
    }
}

impl Default for Schema {
    fn default() -> Self {
        Schema::clinical()
    }
}
