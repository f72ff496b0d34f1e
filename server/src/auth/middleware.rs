//! Authentication middleware.
//!
//! Bearer token extraction. When `AUTH_SECRET` is set, the token must match
//! it; otherwise requests without a token are accepted as anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from the request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    /// The bearer token, or "anonymous" without auth configured
    pub token: String,
}

/// Token carried by an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Check a presented token against the configured secret.
pub fn authorize(presented: Option<&str>, secret: Option<&str>) -> Result<AuthUser, AppError> {
    match (presented, secret) {
        (Some(token), Some(secret)) if token == secret => Ok(AuthUser {
            token: token.to_string(),
        }),
        (Some(_), Some(_)) | (None, Some(_)) => Err(AppError::Unauthorized),
        (Some(token), None) => Ok(AuthUser {
            token: token.to_string(),
        }),
        (None, None) => Ok(AuthUser {
            token: "anonymous".to_string(),
        }),
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let presented = match parts.headers.get(AUTHORIZATION) {
            Some(value) => {
                let header = value.to_str().map_err(|_| AppError::Unauthorized)?;
                Some(bearer_token(header).ok_or(AppError::Unauthorized)?)
            }
            None => None,
        };

        authorize(presented, state.config.auth_secret.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bearer_header() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn secret_must_match_when_configured() {
        assert!(authorize(Some("s3cret"), Some("s3cret")).is_ok());
        assert!(matches!(
            authorize(Some("wrong"), Some("s3cret")),
            Err(AppError::Unauthorized)
        ));
        assert!(matches!(authorize(None, Some("s3cret")), Err(AppError::Unauthorized)));
    }

    #[test]
    fn anonymous_without_secret() {
        assert_eq!(authorize(None, None).unwrap().token, "anonymous");
        assert_eq!(authorize(Some("device-1"), None).unwrap().token, "device-1");
    }
}
