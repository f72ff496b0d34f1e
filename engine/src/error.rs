//! Error types for the practice-sync engine.

use crate::{EntityId, OperationId, PracticeId, TenantId};
use thiserror::Error;

/// All possible errors from the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // Isolation errors
    #[error("tenant mismatch: context is '{expected}', record belongs to '{actual}'")]
    TenantMismatch { expected: TenantId, actual: TenantId },

    #[error("tenant context has no practice selected")]
    PracticeRequired,

    #[error("practice '{practice_id}' is not registered for tenant '{tenant_id}'")]
    PracticeNotRegistered {
        tenant_id: TenantId,
        practice_id: PracticeId,
    },

    // Lookup errors
    #[error("{entity_type} not found: {id}")]
    EntityNotFound { entity_type: String, id: EntityId },

    #[error("sync operation not found: {0}")]
    OperationNotFound(OperationId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(String),

    #[error("invalid transition for operation {id}: {from} -> {to}")]
    InvalidTransition {
        id: OperationId,
        from: String,
        to: String,
    },

    // Authorization errors
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("session expired or missing")]
    SessionExpired,

    // Storage errors
    #[error("storage quota exceeded: {usage} of {quota} bytes used, {requested} requested")]
    QuotaExceeded {
        usage: u64,
        quota: u64,
        requested: u64,
    },

    #[error("database '{0}' is corrupted")]
    CorruptedStore(String),

    #[error("object store not found: {0}")]
    StoreNotFound(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),

    // Sync errors
    #[error("sync conflict on {entity_type} {entity_id}")]
    SyncConflict {
        entity_type: String,
        entity_id: EntityId,
    },

    #[error("sync endpoint unreachable: {0}")]
    Offline(String),

    #[error("network error: {0}")]
    Network(String),
}

impl Error {
    /// Whether the failure is transient and the operation should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Offline(_) | Error::Network(_) | Error::QuotaExceeded { .. }
        )
    }

    /// Whether the caller must re-authenticate instead of attempting repair.
    pub fn requires_reauthentication(&self) -> bool {
        matches!(self, Error::TenantMismatch { .. } | Error::SessionExpired)
    }

    /// Actionable message for the surrounding UI.
    pub fn user_message(&self) -> String {
        match self {
            Error::Offline(_) => {
                "You are offline. Changes are saved on this device and will sync when the connection returns.".to_string()
            }
            Error::Network(_) => {
                "The server could not be reached. Your changes will be retried automatically.".to_string()
            }
            Error::QuotaExceeded { .. } => {
                "This device is running out of storage. Sync pending changes or free up space.".to_string()
            }
            Error::SyncConflict { .. } => {
                "This record was changed elsewhere. Review the differences to continue syncing it.".to_string()
            }
            Error::PermissionDenied(_) => {
                "You do not have permission to perform this action.".to_string()
            }
            Error::TenantMismatch { .. } | Error::SessionExpired => {
                "Your session is no longer valid. Please sign in again.".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            Error::Offline(err.to_string())
        } else {
            Error::Network(err.to_string())
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::TenantMismatch {
            expected: "t1".into(),
            actual: "t2".into(),
        };
        assert_eq!(
            err.to_string(),
            "tenant mismatch: context is 't1', record belongs to 't2'"
        );

        let err = Error::EntityNotFound {
            entity_type: "pet".into(),
            id: "42".into(),
        };
        assert_eq!(err.to_string(), "pet not found: 42");

        let err = Error::TypeMismatch {
            field: "weightKg".into(),
            expected: "Float".into(),
            got: "String".into(),
        };
        assert_eq!(
            err.to_string(),
            "type mismatch for field 'weightKg': expected Float, got String"
        );
    }

    #[test]
    fn retryable_errors() {
        assert!(Error::Offline("down".into()).is_retryable());
        assert!(Error::Network("502".into()).is_retryable());
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::TenantMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .is_retryable());
    }

    #[test]
    fn reauthentication_errors() {
        assert!(Error::SessionExpired.requires_reauthentication());
        assert!(Error::TenantMismatch {
            expected: "a".into(),
            actual: "b".into()
        }
        .requires_reauthentication());
        assert!(!Error::Offline("x".into()).requires_reauthentication());
    }

    #[test]
    fn user_message_for_unlisted_error_falls_back_to_display() {
        let err = Error::StoreNotFound("practice_a_pets".into());
        assert_eq!(err.user_message(), err.to_string());
    }
}
