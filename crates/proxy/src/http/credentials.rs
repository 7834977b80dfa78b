use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use super::{
    ApiError, AppState, audit, extract_request_id, extract_session, invalid_params, json_error,
    not_found, store_error,
};
use crate::credentials::valid_provider;
use pmos_auth::SessionContext;
use pmos_contracts::CredentialScope;
use pmos_ledger::AuditRecord;

#[derive(Debug, Deserialize)]
pub struct SaveCredential {
    pub secret: String,
    pub scope: CredentialScope,
    #[serde(default)]
    pub validated: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    pub scope: CredentialScope,
}

/// Resolution hands the winning secret to the agent runtime along with
/// its provenance. The secret goes into the response body only; it is
/// never logged or audited.
#[derive(Debug, Serialize)]
pub struct ResolveResponse {
    pub provider: String,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

fn checked_provider(provider: &str) -> Result<(), ApiError> {
    if valid_provider(provider) {
        Ok(())
    } else {
        Err(invalid_params(
            "provider must be a lowercase slug of at most 64 characters",
        ))
    }
}

fn scope_owner(session: &SessionContext, scope: CredentialScope) -> &str {
    match scope {
        CredentialScope::User => &session.user_id,
        CredentialScope::Workspace => &session.workspace_id,
    }
}

fn check_rate(state: &AppState, session: &SessionContext) -> Result<(), ApiError> {
    let key = format!("mut:{}", session.workspace_id);
    if state
        .rate_limiter
        .allow(&key, state.config.rate_limit_mutations_per_window)
    {
        Ok(())
    } else {
        crate::metrics::inc_rate_limited();
        Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "workspace mutation rate limit exceeded",
            true,
        ))
    }
}

pub async fn resolve(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ResolveResponse>, ApiError> {
    let session = extract_session(&state, &headers)?;
    checked_provider(&provider)?;

    let resolved = state
        .credentials
        .resolve(&provider, &session.user_id, &session.workspace_id)
        .await
        .map_err(store_error)?;

    Ok(Json(ResolveResponse {
        provider,
        configured: resolved.is_some(),
        source: resolved.as_ref().map(|r| r.source.as_str()),
        secret: resolved.map(|r| r.secret),
    }))
}

pub async fn save(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SaveCredential>,
) -> Result<StatusCode, ApiError> {
    let session = extract_session(&state, &headers)?;
    let request_id = extract_request_id(&headers);
    checked_provider(&provider)?;
    if body.secret.trim().is_empty() {
        return Err(invalid_params("secret must not be empty"));
    }
    check_rate(&state, &session)?;

    state
        .store
        .upsert_credential(
            &provider,
            body.scope,
            scope_owner(&session, body.scope),
            &body.secret,
            body.validated,
        )
        .await
        .map_err(store_error)?;

    audit(
        &state,
        AuditRecord {
            request_id: &request_id,
            user_id: &session.user_id,
            workspace_id: &session.workspace_id,
            action: "credential.save",
            resource_id: Some(&provider),
            outcome: "allowed",
            // The secret itself is never audited.
            detail: serde_json::json!({ "scope": body.scope.as_str() }),
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn remove(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    axum::extract::Query(params): axum::extract::Query<DeleteParams>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let session = extract_session(&state, &headers)?;
    let request_id = extract_request_id(&headers);
    checked_provider(&provider)?;
    check_rate(&state, &session)?;

    let removed = state
        .store
        .delete_credential(&provider, params.scope, scope_owner(&session, params.scope))
        .await
        .map_err(store_error)?;

    if !removed {
        return Err(not_found());
    }

    audit(
        &state,
        AuditRecord {
            request_id: &request_id,
            user_id: &session.user_id,
            workspace_id: &session.workspace_id,
            action: "credential.delete",
            resource_id: Some(&provider),
            outcome: "allowed",
            detail: serde_json::json!({ "scope": params.scope.as_str() }),
        },
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pmos_contracts::Role;

    fn session() -> SessionContext {
        SessionContext {
            user_id: "u1".to_string(),
            workspace_id: "A1".to_string(),
            role: Role::WorkspaceAdmin,
        }
    }

    #[test]
    fn scope_selects_the_owner_id() {
        let session = session();
        assert_eq!(scope_owner(&session, CredentialScope::User), "u1");
        assert_eq!(scope_owner(&session, CredentialScope::Workspace), "A1");
    }

    #[test]
    fn provider_validation_guards_the_surface() {
        assert!(checked_provider("openai").is_ok());
        let (status, response) = checked_provider("Not A Provider").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response.code, "ERR_INVALID_PARAMS");
    }

    #[test]
    fn resolve_response_carries_the_secret_and_its_source() {
        let body = serde_json::to_value(ResolveResponse {
            provider: "openai".to_string(),
            configured: true,
            source: Some("env"),
            secret: Some("sk-live".to_string()),
        })
        .unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "provider": "openai",
                "configured": true,
                "source": "env",
                "secret": "sk-live",
            })
        );
    }

    #[test]
    fn resolve_response_omits_source_and_secret_when_unconfigured() {
        let body = serde_json::to_value(ResolveResponse {
            provider: "openai".to_string(),
            configured: false,
            source: None,
            secret: None,
        })
        .unwrap();
        assert_eq!(body, serde_json::json!({ "provider": "openai", "configured": false }));
    }
}
