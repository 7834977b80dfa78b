use std::time::Duration;

use axum::http::HeaderMap;
use pmos_contracts::Resource;
use pmos_ledger::EngineIdentity;
use serde::Deserialize;

use crate::identity::ProvisionBackend;
use crate::partition::TagBackend;

/// Credential header the engine authenticates API calls with.
pub const ENGINE_API_KEY_HEADER: &str = "x-engine-api-key";

/// Caller-supplied idempotency key; its presence is what makes a write
/// safe to retry.
pub const IDEMPOTENCY_KEY_HEADER: &str = "x-pmos-idempotency-key";

#[derive(Debug)]
pub enum EngineError {
    Timeout,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse,
    Conflict,
    NotFound,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Timeout => write!(f, "engine request timed out"),
            EngineError::Http(err) => write!(f, "engine HTTP error: {}", err),
            EngineError::BadStatus(status) => write!(f, "engine returned status {}", status),
            EngineError::InvalidResponse => write!(f, "engine returned an invalid JSON response"),
            EngineError::Conflict => write!(f, "engine reported a conflict"),
            EngineError::NotFound => write!(f, "engine resource not found"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<reqwest::Error> for EngineError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            EngineError::Timeout
        } else {
            EngineError::Http(value)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineClientConfig {
    pub base_url: String,
    pub service_api_key: String,
    pub timeout: Duration,
    pub retry_max_attempts: u32,
    pub retry_base_backoff: Duration,
}

/// Per-call auth and forwarding context. `api_key` is the engine
/// credential the call is made as; `forward_headers` must already be
/// sanitized (see `headers::sanitize_forward_headers`).
pub struct CallOptions<'a> {
    pub api_key: &'a str,
    pub forward_headers: &'a HeaderMap,
    pub idempotency_key: Option<&'a str>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineTag {
    pub id: String,
    pub name: String,
}

#[derive(Deserialize)]
struct ListEnvelope<T> {
    data: Vec<T>,
}

#[derive(Deserialize)]
struct InviteResponse {
    #[allow(dead_code)]
    id: String,
    invite_token: String,
}

#[derive(Deserialize)]
struct AcceptInviteResponse {
    id: String,
    api_key: String,
}

/// HTTP client for the workflow engine's API. Resource calls run as the
/// caller's bridged identity; tag and user management run as the
/// service identity.
#[derive(Clone)]
pub struct EngineClient {
    base_url: String,
    http: reqwest::Client,
    service_api_key: String,
    retry_max_attempts: u32,
    retry_base_backoff: Duration,
}

impl EngineClient {
    pub fn new(config: EngineClientConfig) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(EngineError::Http)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            http,
            service_api_key: config.service_api_key,
            retry_max_attempts: config.retry_max_attempts.max(1),
            retry_base_backoff: config.retry_base_backoff,
        })
    }

    pub fn service_api_key(&self) -> &str {
        &self.service_api_key
    }

    pub async fn ping(&self) -> Result<(), EngineError> {
        let resp = self
            .http
            .get(format!("{}/tags", self.base_url))
            .header(ENGINE_API_KEY_HEADER, &self.service_api_key)
            .send()
            .await?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(EngineError::BadStatus(resp.status()))
        }
    }

    pub async fn list_resources(
        &self,
        opts: &CallOptions<'_>,
    ) -> Result<Vec<Resource>, EngineError> {
        let resp = self
            .send_with_retry("resources.list", true, || {
                self.request(reqwest::Method::GET, "/resources", opts)
            })
            .await?;

        let decoded = resp
            .json::<ListEnvelope<Resource>>()
            .await
            .map_err(|_| EngineError::InvalidResponse)?;
        Ok(decoded.data)
    }

    /// Create a resource. The payload must already carry its partition
    /// tag; tag injection is never a second call.
    pub async fn create_resource(
        &self,
        opts: &CallOptions<'_>,
        payload: &serde_json::Value,
    ) -> Result<Resource, EngineError> {
        let resp = self
            .send_with_retry("resources.create", opts.idempotency_key.is_some(), || {
                self.request(reqwest::Method::POST, "/resources", opts)
                    .json(payload)
            })
            .await?;

        resp.json::<Resource>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    pub async fn get_resource(
        &self,
        opts: &CallOptions<'_>,
        id: &str,
    ) -> Result<Option<Resource>, EngineError> {
        let result = self
            .send_with_retry("resources.get", true, || {
                self.request(reqwest::Method::GET, &format!("/resources/{id}"), opts)
            })
            .await;

        match result {
            Ok(resp) => resp
                .json::<Resource>()
                .await
                .map(Some)
                .map_err(|_| EngineError::InvalidResponse),
            Err(EngineError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub async fn update_resource(
        &self,
        opts: &CallOptions<'_>,
        id: &str,
        payload: &serde_json::Value,
    ) -> Result<Resource, EngineError> {
        let resp = self
            .send_with_retry("resources.update", opts.idempotency_key.is_some(), || {
                self.request(reqwest::Method::PATCH, &format!("/resources/{id}"), opts)
                    .json(payload)
            })
            .await?;

        resp.json::<Resource>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    pub async fn delete_resource(
        &self,
        opts: &CallOptions<'_>,
        id: &str,
    ) -> Result<(), EngineError> {
        self.send_with_retry("resources.delete", opts.idempotency_key.is_some(), || {
            self.request(reqwest::Method::DELETE, &format!("/resources/{id}"), opts)
        })
        .await?;
        Ok(())
    }

    pub async fn set_active(
        &self,
        opts: &CallOptions<'_>,
        id: &str,
        active: bool,
    ) -> Result<Resource, EngineError> {
        let verb = if active { "activate" } else { "deactivate" };
        let resp = self
            .send_with_retry("resources.set_active", opts.idempotency_key.is_some(), || {
                self.request(
                    reqwest::Method::POST,
                    &format!("/resources/{id}/{verb}"),
                    opts,
                )
            })
            .await?;

        resp.json::<Resource>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    pub async fn tag_exists(&self, name: &str) -> Result<bool, EngineError> {
        let resp = self
            .send_with_retry("tags.list", true, || {
                self.http
                    .get(format!("{}/tags", self.base_url))
                    .header(ENGINE_API_KEY_HEADER, &self.service_api_key)
            })
            .await?;

        let decoded = resp
            .json::<ListEnvelope<EngineTag>>()
            .await
            .map_err(|_| EngineError::InvalidResponse)?;
        Ok(decoded.data.iter().any(|t| t.name == name))
    }

    pub async fn create_tag(&self, name: &str) -> Result<EngineTag, EngineError> {
        let resp = self
            .send_with_retry("tags.create", false, || {
                self.http
                    .post(format!("{}/tags", self.base_url))
                    .header(ENGINE_API_KEY_HEADER, &self.service_api_key)
                    .json(&serde_json::json!({ "name": name }))
            })
            .await?;

        resp.json::<EngineTag>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    async fn invite_user(&self, email: &str) -> Result<InviteResponse, EngineError> {
        let resp = self
            .send_with_retry("users.invite", false, || {
                self.http
                    .post(format!("{}/users", self.base_url))
                    .header(ENGINE_API_KEY_HEADER, &self.service_api_key)
                    .json(&serde_json::json!({ "email": email }))
            })
            .await?;

        resp.json::<InviteResponse>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    async fn accept_invite(&self, invite_token: &str) -> Result<AcceptInviteResponse, EngineError> {
        let resp = self
            .send_with_retry("users.accept_invite", false, || {
                self.http
                    .post(format!("{}/users/accept", self.base_url))
                    .header(ENGINE_API_KEY_HEADER, &self.service_api_key)
                    .json(&serde_json::json!({ "invite_token": invite_token }))
            })
            .await?;

        resp.json::<AcceptInviteResponse>()
            .await
            .map_err(|_| EngineError::InvalidResponse)
    }

    fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        opts: &CallOptions<'_>,
    ) -> reqwest::RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path))
            .headers(opts.forward_headers.clone())
            .header(ENGINE_API_KEY_HEADER, opts.api_key);

        if let Some(key) = opts.idempotency_key {
            builder = builder.header(IDEMPOTENCY_KEY_HEADER, key);
        }

        builder
    }

    /// `retryable` is true for idempotent calls only: reads always,
    /// writes exactly when the caller supplied an idempotency key.
    async fn send_with_retry<F>(
        &self,
        operation: &'static str,
        retryable: bool,
        build: F,
    ) -> Result<reqwest::Response, EngineError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max_attempts = if retryable { self.retry_max_attempts } else { 1 };
        let mut attempt = 0;

        loop {
            attempt += 1;
            match build().send().await {
                Ok(resp) if resp.status().is_server_error() && attempt < max_attempts => {}
                Ok(resp) => return self.finish(operation, resp),
                Err(err) if attempt < max_attempts => {
                    tracing::debug!(operation, attempt, error = %err, "engine call failed; retrying");
                }
                Err(err) => {
                    crate::metrics::observe_engine_call(operation, "error");
                    return Err(err.into());
                }
            }

            let backoff = self.retry_base_backoff * 2u32.saturating_pow(attempt - 1);
            tokio::time::sleep(backoff).await;
        }
    }

    fn finish(
        &self,
        operation: &'static str,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, EngineError> {
        let status = resp.status();
        if status.is_success() {
            crate::metrics::observe_engine_call(operation, "ok");
            return Ok(resp);
        }

        crate::metrics::observe_engine_call(operation, "error");
        match status {
            reqwest::StatusCode::NOT_FOUND => Err(EngineError::NotFound),
            reqwest::StatusCode::CONFLICT => Err(EngineError::Conflict),
            _ => Err(EngineError::BadStatus(status)),
        }
    }
}

impl TagBackend for EngineClient {
    async fn lookup_tag(&self, name: &str) -> Result<bool, EngineError> {
        self.tag_exists(name).await
    }

    async fn register_tag(&self, name: &str) -> Result<(), EngineError> {
        self.create_tag(name).await.map(|_| ())
    }
}

impl ProvisionBackend for EngineClient {
    async fn provision_workspace_identity(
        &self,
        workspace_id: &str,
    ) -> Result<EngineIdentity, EngineError> {
        let email = format!("{workspace_id}@workspaces.pmos.local");
        let invite = self.invite_user(&email).await?;
        let accepted = self.accept_invite(&invite.invite_token).await?;

        Ok(EngineIdentity {
            workspace_id: workspace_id.to_string(),
            engine_user_id: accepted.id,
            api_key: accepted.api_key,
        })
    }
}
