//! Reversible obfuscation of cached data.
//!
//! XOR with a repeating key, then base64. This keeps cached sessions and
//! permissions from being readable at a glance; it is not encryption.

use crate::{error::Result, Error};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{de::DeserializeOwned, Serialize};

const KEY_SUFFIX: &[u8] = b":practice-sync";

#[derive(Debug, Clone)]
pub struct Obfuscator {
    key: Vec<u8>,
}

impl Obfuscator {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        let mut full = key.as_ref().to_vec();
        full.extend_from_slice(KEY_SUFFIX);
        Self { key: full }
    }

    /// Obfuscator keyed by tenant, so entries do not decode across tenants.
    pub fn for_tenant(tenant_id: &str) -> Self {
        Self::new(tenant_id)
    }

    fn xor(&self, bytes: &mut [u8]) {
        for (i, b) in bytes.iter_mut().enumerate() {
            *b ^= self.key[i % self.key.len()];
        }
    }

    pub fn obfuscate<T: Serialize>(&self, value: &T) -> Result<String> {
        let mut bytes = serde_json::to_vec(value)?;
        self.xor(&mut bytes);
        Ok(STANDARD.encode(bytes))
    }

    pub fn reveal<T: DeserializeOwned>(&self, encoded: &str) -> Result<T> {
        let mut bytes = STANDARD
            .decode(encoded)
            .map_err(|e| Error::Serialization(format!("invalid obfuscated payload: {}", e)))?;
        self.xor(&mut bytes);
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn reveals_what_it_obfuscates() {
        let o = Obfuscator::for_tenant("acme");
        let value = json!({"token": "abc", "permissions": ["pets:read"]});
        let encoded = o.obfuscate(&value).unwrap();
        assert!(!encoded.contains("pets:read"));
        let back: Value = o.reveal(&encoded).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn other_tenant_cannot_read_entry() {
        let encoded = Obfuscator::for_tenant("acme").obfuscate(&json!({"a": 1})).unwrap();
        assert!(Obfuscator::for_tenant("globex").reveal::<Value>(&encoded).is_err());
    }

    #[test]
    fn garbage_is_a_serialization_error() {
        let err = Obfuscator::new("k").reveal::<Value>("%%%").unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));
    }
}
