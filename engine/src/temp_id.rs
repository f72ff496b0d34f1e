//! Temporary identifiers for records created while offline.
//!
//! Format: `temp_<createdAtMillis>_<random>_<entityType>`. The fixed prefix
//! is what distinguishes a temporary id from a server-assigned one.

use crate::{EntityType, Timestamp};

/// Prefix shared by every temporary identifier.
pub const TEMP_ID_PREFIX: &str = "temp_";

const RANDOM_LEN: usize = 9;

/// A parsed temporary identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempId {
    pub created_at: Timestamp,
    pub random: String,
    pub entity_type: EntityType,
}

/// Mint a new temporary identifier for `entity_type`.
pub fn generate(entity_type: EntityType) -> String {
    generate_at(entity_type, crate::now_millis())
}

/// Mint a temporary identifier with an explicit creation time.
pub fn generate_at(entity_type: EntityType, created_at: Timestamp) -> String {
    let random: String = uuid::Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(RANDOM_LEN)
        .collect();
    format!("{}{}_{}_{}", TEMP_ID_PREFIX, created_at, random, entity_type)
}

/// Whether `id` is a temporary identifier.
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

/// Parse a temporary identifier. Returns `None` for real ids and malformed
/// temporary ones.
pub fn parse(id: &str) -> Option<TempId> {
    let rest = id.strip_prefix(TEMP_ID_PREFIX)?;
    let mut parts = rest.splitn(3, '_');
    let created_at = parts.next()?.parse().ok()?;
    let random = parts.next()?;
    let entity_type = parts.next()?.parse().ok()?;

    if random.is_empty() || !random.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    Some(TempId {
        created_at,
        random: random.to_string(),
        entity_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_parse_back() {
        let id = generate_at(EntityType::ClinicalNote, 1_706_745_600_000);
        assert!(is_temp_id(&id));

        let parsed = parse(&id).unwrap();
        assert_eq!(parsed.created_at, 1_706_745_600_000);
        assert_eq!(parsed.entity_type, EntityType::ClinicalNote);
        assert_eq!(parsed.random.len(), RANDOM_LEN);
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_at(EntityType::Pet, 1);
        let b = generate_at(EntityType::Pet, 1);
        assert_ne!(a, b);
    }

    #[test]
    fn real_ids_are_not_temporary() {
        assert!(!is_temp_id("77"));
        assert!(!is_temp_id("pet_77"));
        assert!(parse("77").is_none());
    }

    #[test]
    fn malformed_temp_ids_do_not_parse() {
        assert!(parse("temp_").is_none());
        assert!(parse("temp_notatime_abc_pet").is_none());
        assert!(parse("temp_100_abc_dragon").is_none());
        assert!(parse("temp_100__pet").is_none());
    }
}
