//! The closed set of entity types the engine stores and syncs.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kinds of records a practice works with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Practitioner,
    Client,
    Pet,
    Appointment,
    ClinicalNote,
    Checklist,
    Prescription,
    Invoice,
}

impl EntityType {
    /// Every entity type, in declaration order.
    pub const ALL: [EntityType; 8] = [
        EntityType::Practitioner,
        EntityType::Client,
        EntityType::Pet,
        EntityType::Appointment,
        EntityType::ClinicalNote,
        EntityType::Checklist,
        EntityType::Prescription,
        EntityType::Invoice,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Practitioner => "practitioner",
            EntityType::Client => "client",
            EntityType::Pet => "pet",
            EntityType::Appointment => "appointment",
            EntityType::ClinicalNote => "clinical_note",
            EntityType::Checklist => "checklist",
            EntityType::Prescription => "prescription",
            EntityType::Invoice => "invoice",
        }
    }

    /// Base name of the per-practice store holding this type. Also used as
    /// the resource part of permission strings.
    pub fn store_base(&self) -> &'static str {
        match self {
            EntityType::Practitioner => "practitioners",
            EntityType::Client => "clients",
            EntityType::Pet => "pets",
            EntityType::Appointment => "appointments",
            EntityType::ClinicalNote => "clinical_notes",
            EntityType::Checklist => "checklists",
            EntityType::Prescription => "prescriptions",
            EntityType::Invoice => "invoices",
        }
    }

    /// Sync precedence. Lower values are pushed first so that referenced
    /// records exist on the server before the records pointing at them.
    pub fn precedence(&self) -> u8 {
        match self {
            EntityType::Practitioner | EntityType::Client => 0,
            EntityType::Pet => 1,
            EntityType::Appointment => 2,
            EntityType::ClinicalNote | EntityType::Checklist | EntityType::Prescription => 3,
            EntityType::Invoice => 4,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown entity type: {}", s)))
    }
}
