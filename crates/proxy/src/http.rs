use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use serde::Serialize;
use ulid::Ulid;

use crate::config::{ProxyConfig, StartupError};
use crate::credentials::CredentialResolver;
use crate::engine::{EngineClient, EngineClientConfig, EngineError};
use crate::identity::{IdentityBridge, IdentityBridgeConfig, IdentityError};
use crate::partition::PartitionTags;
use crate::rate_limit::RateLimiter;
use pmos_auth::{SessionContext, SessionVerifier};
use pmos_ledger::{AuditRecord, Store, StoreError};

pub mod credentials;
pub mod resources;

pub const SESSION_COOKIE: &str = "pmos_session";
pub const REQUEST_ID_HEADER: &str = "x-pmos-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ProxyConfig>,
    pub sessions: SessionVerifier,
    pub store: Store,
    pub engine: EngineClient,
    pub partitions: PartitionTags<EngineClient>,
    pub identity: IdentityBridge<EngineClient, Store>,
    pub credentials: CredentialResolver,
    pub rate_limiter: RateLimiter,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub retryable: bool,
}

pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub fn json_error(
    status: StatusCode,
    code: &str,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.to_string(),
            message: message.into(),
            retryable,
        }),
    )
}

/// Read-path denial. Foreign and nonexistent resources produce this
/// same response so callers cannot probe other workspaces' id space.
pub fn not_found() -> ApiError {
    json_error(
        StatusCode::NOT_FOUND,
        "ERR_NOT_FOUND",
        "resource not found",
        false,
    )
}

/// Write-path denial. Identical for foreign and unknown ids, again so
/// the response shape leaks nothing about what exists.
pub fn not_owner() -> ApiError {
    json_error(
        StatusCode::FORBIDDEN,
        "ERR_NOT_OWNER",
        "resource is not owned by this workspace",
        false,
    )
}

pub fn invalid_params(message: impl Into<String>) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_INVALID_PARAMS",
        message,
        false,
    )
}

pub fn engine_error(err: EngineError) -> ApiError {
    match err {
        EngineError::Timeout => json_error(
            StatusCode::GATEWAY_TIMEOUT,
            "ERR_ENGINE_TIMEOUT",
            "engine request timed out",
            true,
        ),
        EngineError::Conflict => json_error(
            StatusCode::CONFLICT,
            "ERR_PARTITION_CONFLICT",
            "engine rejected the request as conflicting",
            false,
        ),
        EngineError::NotFound => not_found(),
        EngineError::Http(_) | EngineError::BadStatus(_) | EngineError::InvalidResponse => {
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "ERR_ENGINE_UNAVAILABLE",
                "engine is unavailable",
                true,
            )
        }
    }
}

pub fn store_error(err: StoreError) -> ApiError {
    tracing::error!(error = %err, "store operation failed");
    json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        "ERR_ENGINE_UNAVAILABLE",
        "persistence is unavailable",
        true,
    )
}

pub fn identity_error(err: IdentityError) -> ApiError {
    match err {
        IdentityError::Upstream(inner) => engine_error(inner),
        IdentityError::Store(inner) => store_error(inner),
    }
}

/// Resolve the caller's workspace context from the session token, taken
/// from the `pmos_session` cookie or an `Authorization: Bearer` header.
pub fn extract_session(state: &AppState, headers: &HeaderMap) -> Result<SessionContext, ApiError> {
    let Some(token) = session_token(headers) else {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_REQUIRED",
            "a session token is required",
            false,
        ));
    };

    state.sessions.verify(&token).map_err(|err| {
        json_error(StatusCode::UNAUTHORIZED, err.code, err.message, false)
    })
}

fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION)
        && let Ok(value) = value.to_str()
        && let Some(token) = value.strip_prefix("Bearer ")
    {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token.to_string());
        }
    }

    for value in headers.get_all(header::COOKIE) {
        let Ok(value) = value.to_str() else {
            continue;
        };
        for pair in value.split(';') {
            if let Some((name, token)) = pair.trim().split_once('=')
                && name == SESSION_COOKIE
                && !token.is_empty()
            {
                return Some(token.to_string());
            }
        }
    }

    None
}

/// Caller-supplied request id when it is well-formed, a fresh ulid
/// otherwise. Recorded on every audit event.
pub fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| {
            !v.is_empty()
                && v.len() <= 64
                && v.chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
        .map(str::to_string)
        .unwrap_or_else(|| Ulid::new().to_string())
}

/// Append one audit event. An audit failure never fails the request it
/// describes; it is logged and counted instead.
pub async fn audit(state: &AppState, record: AuditRecord<'_>) {
    if let Err(err) = state.store.record_mutation(record).await {
        crate::metrics::inc_audit_write_failure();
        tracing::error!(error = %err, "failed to persist audit event");
    }
}

/// Wire up every shared component from the loaded config. Fails fast:
/// an unreachable database or malformed session secret refuses startup
/// instead of failing on the first request.
pub async fn build_state(config: ProxyConfig) -> Result<AppState, StartupError> {
    let sessions = SessionVerifier::new(
        config.session_secret.as_bytes(),
        Duration::from_secs(config.session_clock_skew_secs),
    )
    .map_err(|err| StartupError {
        code: err.code,
        message: err.message,
    })?;

    let store = Store::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.audit_write_timeout_ms),
    )
    .await
    .map_err(|err| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: format!("failed to connect to the proxy database: {err}"),
    })?;

    let engine = EngineClient::new(EngineClientConfig {
        base_url: config.engine_url.clone(),
        service_api_key: config.engine_api_key.clone(),
        timeout: Duration::from_millis(config.engine_timeout_ms),
        retry_max_attempts: config.engine_retry_max_attempts,
        retry_base_backoff: Duration::from_millis(config.engine_retry_base_backoff_ms),
    })
    .map_err(|err| StartupError {
        code: "ERR_ENGINE_CLIENT",
        message: format!("failed to build the engine client: {err}"),
    })?;

    let partitions = PartitionTags::new(engine.clone());
    let identity = IdentityBridge::new(
        engine.clone(),
        store.clone(),
        IdentityBridgeConfig {
            service_api_key: config.engine_api_key.clone(),
            owner_fallback: config.owner_fallback,
            provision_max_attempts: config.engine_retry_max_attempts,
            provision_base_backoff: Duration::from_millis(config.engine_retry_base_backoff_ms),
        },
    );
    let credentials = CredentialResolver::new(store.clone(), config.ai_keys.clone());
    let rate_limiter = RateLimiter::new(
        Duration::from_secs(config.rate_limit_window_secs),
        4096,
    );

    Ok(AppState {
        config: Arc::new(config),
        sessions,
        store,
        engine,
        partitions,
        identity,
        credentials,
        rate_limiter,
    })
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_endpoint))
        .route(
            "/v1/workflows",
            get(resources::list).post(resources::create),
        )
        .route(
            "/v1/workflows/{id}",
            get(resources::get_one)
                .patch(resources::update)
                .delete(resources::remove),
        )
        .route("/v1/workflows/{id}/activate", post(resources::activate))
        .route("/v1/workflows/{id}/deactivate", post(resources::deactivate))
        .route(
            "/v1/credentials/{provider}",
            put(credentials::save).delete(credentials::remove),
        )
        .route(
            "/v1/credentials/{provider}/resolve",
            get(credentials::resolve),
        )
        .layer(axum::middleware::from_fn(track_requests))
        .with_state(state)
}

async fn track_requests(req: Request, next: Next) -> Response {
    use tracing::Instrument;

    let start = Instant::now();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let method = req.method().to_string();
    let request_id = extract_request_id(req.headers());

    let span = tracing::info_span!(
        "request",
        %route,
        %method,
        %request_id,
        status = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let response = next.run(req).instrument(span.clone()).await;

    let status = response.status().as_u16();
    let latency = start.elapsed();
    span.record("status", status);
    span.record("latency_ms", latency.as_millis() as u64);
    crate::metrics::observe_http_request(&route, &method, status, latency);
    tracing::debug!(parent: &span, "request completed");
    response
}

async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn readyz(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.ping().await.map_err(store_error)?;
    state.engine.ping().await.map_err(engine_error)?;
    Ok(Json(serde_json::json!({ "status": "ready" })))
}

async fn metrics_endpoint() -> Response {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            ([(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
