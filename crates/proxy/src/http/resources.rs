use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use serde::Deserialize;

use super::{
    ApiError, AppState, audit, engine_error, extract_request_id, extract_session, identity_error,
    invalid_params, json_error, not_found, not_owner,
};
use crate::engine::{CallOptions, IDEMPOTENCY_KEY_HEADER};
use crate::headers::sanitize_forward_headers;
use pmos_auth::SessionContext;
use pmos_contracts::Resource;
use pmos_contracts::partition::is_partition_tag;
use pmos_ledger::AuditRecord;
use pmos_policy::{filter_list, mutation_policy_for, policy_for};

#[derive(Debug, Deserialize)]
pub struct ListParams {
    #[serde(default)]
    pub admin_view: bool,
}

/// Everything a mutating handler needs before touching the engine:
/// the resolved caller, its engine credential, the sanitized forward
/// headers, and the rate-limit verdict already applied.
struct MutationContext {
    session: SessionContext,
    request_id: String,
    api_key: String,
    forward: HeaderMap,
    idempotency_key: Option<String>,
}

impl MutationContext {
    fn call_options(&self) -> CallOptions<'_> {
        CallOptions {
            api_key: &self.api_key,
            forward_headers: &self.forward,
            idempotency_key: self.idempotency_key.as_deref(),
        }
    }
}

async fn begin_mutation(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<MutationContext, ApiError> {
    let session = extract_session(state, headers)?;
    let request_id = extract_request_id(headers);

    let key = format!("mut:{}", session.workspace_id);
    if !state
        .rate_limiter
        .allow(&key, state.config.rate_limit_mutations_per_window)
    {
        crate::metrics::inc_rate_limited();
        return Err(json_error(
            StatusCode::TOO_MANY_REQUESTS,
            "ERR_RATE_LIMITED",
            "workspace mutation rate limit exceeded",
            true,
        ));
    }

    let identity = state
        .identity
        .resolve(&session.workspace_id)
        .await
        .map_err(identity_error)?;

    let idempotency_key = headers
        .get(IDEMPOTENCY_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    Ok(MutationContext {
        session,
        request_id,
        api_key: identity.api_key,
        forward: sanitize_forward_headers(headers),
        idempotency_key,
    })
}

async fn record(
    state: &AppState,
    ctx: &MutationContext,
    action: &str,
    resource_id: Option<&str>,
    outcome: &str,
    detail: serde_json::Value,
) {
    audit(
        state,
        AuditRecord {
            request_id: &ctx.request_id,
            user_id: &ctx.session.user_id,
            workspace_id: &ctx.session.workspace_id,
            action,
            resource_id,
            outcome,
            detail,
        },
    )
    .await;
}

/// Caller-supplied tags, validated. Partition tags are proxy-owned:
/// the ones in `tolerated` are accepted and dropped (reads echo them
/// back, so a fetch-modify-write PATCH would otherwise always fail),
/// while any other partition tag is rejected.
fn caller_tags(body: &serde_json::Value, tolerated: &[&str]) -> Result<Vec<String>, ApiError> {
    let Some(raw) = body.get("tags") else {
        return Ok(Vec::new());
    };
    let Some(raw) = raw.as_array() else {
        return Err(invalid_params("tags must be an array of strings"));
    };

    let mut tags = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(tag) = entry.as_str() else {
            return Err(invalid_params("tags must be an array of strings"));
        };
        if tolerated.contains(&tag) {
            continue;
        }
        if is_partition_tag(tag) {
            return Err(invalid_params(
                "foreign partition tags cannot be set by callers",
            ));
        }
        tags.push(tag.to_string());
    }
    Ok(tags)
}

/// The outgoing create payload: caller tags plus the workspace's
/// partition tag, `active` forced off regardless of what was sent.
fn create_payload(
    body: &serde_json::Map<String, serde_json::Value>,
    mut tags: Vec<String>,
    tag: &str,
) -> serde_json::Value {
    tags.push(tag.to_string());

    let mut payload = body.clone();
    payload.insert("tags".to_string(), serde_json::json!(tags));
    // New resources always start inactive; activation is its own call.
    payload.insert("active".to_string(), serde_json::json!(false));
    serde_json::Value::Object(payload)
}

/// Fetch the target and decide whether this caller may mutate it. A
/// missing resource and a foreign resource produce the same denial.
async fn assert_ownership(
    state: &AppState,
    ctx: &MutationContext,
    action: &str,
    id: &str,
) -> Result<Resource, ApiError> {
    let policy = mutation_policy_for(ctx.session.role, &ctx.session.workspace_id);

    let found = state
        .engine
        .get_resource(&ctx.call_options(), id)
        .await
        .map_err(engine_error)?;

    match found {
        Some(resource) if policy.may_mutate(&resource) => Ok(resource),
        _ => {
            crate::metrics::inc_ownership_denial(action);
            record(
                state,
                ctx,
                action,
                Some(id),
                "denied",
                serde_json::json!({ "reason": "not_owner" }),
            )
            .await;
            Err(not_owner())
        }
    }
}

pub async fn list(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = extract_session(&state, &headers)?;
    let policy = policy_for(session.role, params.admin_view, &session.workspace_id);

    let identity = state
        .identity
        .resolve(&session.workspace_id)
        .await
        .map_err(identity_error)?;
    let forward = sanitize_forward_headers(&headers);

    let resources = state
        .engine
        .list_resources(&CallOptions {
            api_key: &identity.api_key,
            forward_headers: &forward,
            idempotency_key: None,
        })
        .await
        .map_err(engine_error)?;

    let visible = filter_list(resources, policy.as_ref());
    Ok(Json(serde_json::json!({ "data": visible })))
}

pub async fn get_one(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ListParams>,
    headers: HeaderMap,
) -> Result<Json<Resource>, ApiError> {
    let session = extract_session(&state, &headers)?;
    let policy = policy_for(session.role, params.admin_view, &session.workspace_id);

    let identity = state
        .identity
        .resolve(&session.workspace_id)
        .await
        .map_err(identity_error)?;
    let forward = sanitize_forward_headers(&headers);

    let found = state
        .engine
        .get_resource(
            &CallOptions {
                api_key: &identity.api_key,
                forward_headers: &forward,
                idempotency_key: None,
            },
            &id,
        )
        .await
        .map_err(engine_error)?;

    match found {
        Some(resource) if policy.can_see(&resource) => Ok(Json(resource)),
        _ => Err(not_found()),
    }
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<(StatusCode, Json<Resource>), ApiError> {
    let ctx = begin_mutation(&state, &headers).await?;

    let Some(object) = body.as_object() else {
        return Err(invalid_params("request body must be a JSON object"));
    };

    let tag = state
        .partitions
        .ensure_tag(&ctx.session.workspace_id)
        .await
        .map_err(engine_error)?;
    let tags = caller_tags(&body, &[tag.as_str()])?;
    let payload = create_payload(object, tags, &tag);

    let created = match state
        .engine
        .create_resource(&ctx.call_options(), &payload)
        .await
    {
        Ok(created) => created,
        Err(err) => {
            record(
                &state,
                &ctx,
                "workflow.create",
                None,
                "error",
                serde_json::json!({ "error": err.to_string() }),
            )
            .await;
            return Err(engine_error(err));
        }
    };

    // The engine must echo the tag back; a create that came back
    // untagged would be invisible to its own workspace.
    if !created.carries_tag(&tag) {
        record(
            &state,
            &ctx,
            "workflow.create",
            Some(&created.id),
            "error",
            serde_json::json!({ "reason": "partition_tag_missing" }),
        )
        .await;
        return Err(json_error(
            StatusCode::CONFLICT,
            "ERR_PARTITION_CONFLICT",
            "created resource did not receive its partition tag",
            false,
        ));
    }

    record(
        &state,
        &ctx,
        "workflow.create",
        Some(&created.id),
        "allowed",
        serde_json::json!({ "name": created.name }),
    )
    .await;

    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> Result<Json<Resource>, ApiError> {
    let ctx = begin_mutation(&state, &headers).await?;

    let Some(object) = body.as_object() else {
        return Err(invalid_params("request body must be a JSON object"));
    };

    let existing = assert_ownership(&state, &ctx, "workflow.update", &id).await?;

    let mut payload = object.clone();
    if payload.contains_key("tags") {
        // Caller tag edits never touch partition tags: the resource
        // keeps exactly the partition tags it already carries.
        let existing_tags: Vec<&str> = existing.partition_tags().collect();
        let mut tags = caller_tags(&body, &existing_tags)?;
        tags.extend(existing.partition_tags().map(str::to_string));
        payload.insert("tags".to_string(), serde_json::json!(tags));
    }
    let payload = serde_json::Value::Object(payload);

    let updated = match state
        .engine
        .update_resource(&ctx.call_options(), &id, &payload)
        .await
    {
        Ok(updated) => updated,
        Err(err) => {
            record(
                &state,
                &ctx,
                "workflow.update",
                Some(&id),
                "error",
                serde_json::json!({ "error": err.to_string() }),
            )
            .await;
            return Err(engine_error(err));
        }
    };

    record(
        &state,
        &ctx,
        "workflow.update",
        Some(&id),
        "allowed",
        serde_json::Value::Null,
    )
    .await;

    Ok(Json(updated))
}

pub async fn remove(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ctx = begin_mutation(&state, &headers).await?;
    assert_ownership(&state, &ctx, "workflow.delete", &id).await?;

    if let Err(err) = state.engine.delete_resource(&ctx.call_options(), &id).await {
        record(
            &state,
            &ctx,
            "workflow.delete",
            Some(&id),
            "error",
            serde_json::json!({ "error": err.to_string() }),
        )
        .await;
        return Err(engine_error(err));
    }

    record(
        &state,
        &ctx,
        "workflow.delete",
        Some(&id),
        "allowed",
        serde_json::Value::Null,
    )
    .await;

    Ok(StatusCode::NO_CONTENT)
}

pub async fn activate(
    state: State<AppState>,
    id: Path<String>,
    headers: HeaderMap,
) -> Result<Json<Resource>, ApiError> {
    set_active(state, id, headers, true).await
}

pub async fn deactivate(
    state: State<AppState>,
    id: Path<String>,
    headers: HeaderMap,
) -> Result<Json<Resource>, ApiError> {
    set_active(state, id, headers, false).await
}

async fn set_active(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    active: bool,
) -> Result<Json<Resource>, ApiError> {
    let action = if active {
        "workflow.activate"
    } else {
        "workflow.deactivate"
    };

    let ctx = begin_mutation(&state, &headers).await?;
    assert_ownership(&state, &ctx, action, &id).await?;

    let updated = match state
        .engine
        .set_active(&ctx.call_options(), &id, active)
        .await
    {
        Ok(updated) => updated,
        Err(err) => {
            record(
                &state,
                &ctx,
                action,
                Some(&id),
                "error",
                serde_json::json!({ "error": err.to_string() }),
            )
            .await;
            return Err(engine_error(err));
        }
    };

    record(
        &state,
        &ctx,
        action,
        Some(&id),
        "allowed",
        serde_json::Value::Null,
    )
    .await;

    Ok(Json(updated))
}
