//! The remote sync endpoint the engine pushes to and pulls from.

use crate::database::TenantContext;
use crate::queue::{OperationKind, SyncOperation};
use crate::{
    error::Result, EntityId, EntityType, Error, OperationId, PracticeId, TenantId, Timestamp, UserId,
    Version,
};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// The server's current state of one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSnapshot {
    pub id: EntityId,
    pub entity_type: EntityType,
    pub practice_id: PracticeId,
    pub data: Value,
    pub version: Version,
    pub last_modified: Timestamp,
    #[serde(default)]
    pub deleted: bool,
}

/// One operation as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
    pub operation_id: OperationId,
    pub tenant_id: TenantId,
    pub practice_id: PracticeId,
    pub user_id: UserId,
    pub entity_type: EntityType,
    pub entity_id: EntityId,
    pub operation: OperationKind,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<Version>,
    pub timestamp: Timestamp,
}

impl From<&SyncOperation> for PushRequest {
    fn from(op: &SyncOperation) -> Self {
        Self {
            operation_id: op.id.clone(),
            tenant_id: op.tenant_id.clone(),
            practice_id: op.practice_id.clone(),
            user_id: op.user_id.clone(),
            entity_type: op.entity_type,
            entity_id: op.entity_id.clone(),
            operation: op.operation,
            data: op.data.clone(),
            base_version: op.base_version,
            timestamp: op.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResult {
    pub success: bool,
    /// Server-assigned id, set for creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub real_id: Option<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PushResult {
    pub fn accepted(real_id: Option<EntityId>, server_version: Version) -> Self {
        Self {
            success: true,
            real_id,
            server_version: Some(server_version),
            error: None,
        }
    }

    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// A page of server-side changes after a cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesPage {
    pub changes: Vec<ServerSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

/// The server side of synchronization.
///
/// Implementations return [`Error::Offline`] when the server cannot be
/// reached; the engine treats that as normal and retries later.
#[async_trait]
pub trait RemoteSyncEndpoint: Send + Sync {
    async fn push(&self, request: &PushRequest) -> Result<PushResult>;

    /// Current server state of an entity, `None` if the server has never had it.
    async fn fetch(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ServerSnapshot>>;

    async fn changes_since(
        &self,
        ctx: &TenantContext,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ChangesPage>;
}

/// [`RemoteSyncEndpoint`] over HTTP with JSON bodies.
pub struct HttpSyncEndpoint {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpSyncEndpoint {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("practice-sync/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
        })
    }

    /// Builder-style method to send a bearer token with every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

fn status_error(status: StatusCode, body: String) -> Error {
    match status {
        StatusCode::UNAUTHORIZED => Error::SessionExpired,
        StatusCode::FORBIDDEN => Error::PermissionDenied(body),
        s if s.is_server_error() => Error::Network(format!("server returned {}: {}", s, body)),
        s => Error::Validation(format!("server returned {}: {}", s, body)),
    }
}

#[async_trait]
impl RemoteSyncEndpoint for HttpSyncEndpoint {
    async fn push(&self, request: &PushRequest) -> Result<PushResult> {
        let response = self
            .request(reqwest::Method::POST, "/sync/operations")
            .json(request)
            .send()
            .await?;
        let status = response.status();
        debug!(op_id = %request.operation_id, %status, "pushed operation");

        if status.is_success() || status == StatusCode::CONFLICT || status == StatusCode::UNPROCESSABLE_ENTITY {
            let body = response.text().await?;
            return match serde_json::from_str::<PushResult>(&body) {
                Ok(result) => Ok(result),
                Err(_) if !status.is_success() => Ok(PushResult::rejected(body)),
                Err(e) => Err(e.into()),
            };
        }
        Err(status_error(status, response.text().await.unwrap_or_default()))
    }

    async fn fetch(
        &self,
        ctx: &TenantContext,
        entity_type: EntityType,
        id: &str,
    ) -> Result<Option<ServerSnapshot>> {
        let path = format!("/sync/entities/{}/{}/{}", ctx.tenant_id, entity_type, id);
        let response = self.request(reqwest::Method::GET, &path).send().await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => Ok(Some(response.json().await?)),
            s => Err(status_error(s, response.text().await.unwrap_or_default())),
        }
    }

    async fn changes_since(
        &self,
        ctx: &TenantContext,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<ChangesPage> {
        let mut query = vec![
            ("tenantId", ctx.tenant_id.clone()),
            ("practiceId", ctx.practice()?.to_string()),
            ("limit", limit.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("since", cursor.to_string()));
        }

        let response = self
            .request(reqwest::Method::GET, "/sync/changes")
            .query(&query)
            .send()
            .await?;
        match response.status() {
            s if s.is_success() => Ok(response.json().await?),
            s => Err(status_error(s, response.text().await.unwrap_or_default())),
        }
    }
}
