//! REST API handlers.
//!
//! Every rejected request carries the underlying error message so the
//! caller can see why it failed.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::{info, warn};

use fleetgrid_lifecycle::LifecycleError;
use fleetgrid_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> axum::response::Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn registry_error(e: &RegistryError) -> axum::response::Response {
    let status = match e {
        RegistryError::GroupNotFound(_) | RegistryError::InstanceNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        RegistryError::GroupExists(_)
        | RegistryError::GroupNotEmpty(..)
        | RegistryError::InvalidTransition { .. } => StatusCode::CONFLICT,
        RegistryError::InvalidPolicy { .. } => StatusCode::BAD_REQUEST,
        RegistryError::PortExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
    };
    error_response(&e.to_string(), status)
}

fn lifecycle_error(e: &LifecycleError) -> axum::response::Response {
    match e {
        LifecycleError::Registry(e) => registry_error(e),
        LifecycleError::NotTerminable { .. } => error_response(&e.to_string(), StatusCode::CONFLICT),
        _ => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// Write the registry's current spec of `name` to the store.
fn persist(state: &ApiState, name: &str) -> Result<(), axum::response::Response> {
    let Some(group) = state.registry.group(name) else {
        return Ok(());
    };
    state.store.put_group(&group.spec).map_err(|e| {
        warn!(group = %name, error = %e, "failed to persist group");
        error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    })
}

// ── Groups ─────────────────────────────────────────────────────

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.registry.groups())
}

/// GET /api/v1/groups/{name}
pub async fn get_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    match state.registry.group(&name) {
        Some(group) => ApiResponse::ok(group).into_response(),
        None => registry_error(&RegistryError::GroupNotFound(name)),
    }
}

/// POST /api/v1/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Json(spec): Json<GroupSpec>,
) -> impl IntoResponse {
    let name = match state.registry.create_group(spec) {
        Ok(name) => name,
        Err(e) => return registry_error(&e),
    };
    if let Err(resp) = persist(&state, &name) {
        // Keep registry and store in agreement.
        let _ = state.registry.delete_group(&name);
        return resp;
    }
    info!(group = %name, "group created via API");
    match state.registry.group(&name) {
        Some(group) => (StatusCode::CREATED, ApiResponse::ok(group)).into_response(),
        None => registry_error(&RegistryError::GroupNotFound(name)),
    }
}

/// DELETE /api/v1/groups/{name}
pub async fn delete_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if let Err(e) = state.registry.delete_group(&name) {
        return registry_error(&e);
    }
    match state.store.delete_group(&name) {
        Ok(_) => ApiResponse::ok("deleted").into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR),
    }
}

/// PUT /api/v1/groups/{name}/policy
pub async fn update_policy(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(policy): Json<GroupPolicy>,
) -> impl IntoResponse {
    if let Err(e) = state.registry.update_policy(&name, policy) {
        return registry_error(&e);
    }
    if let Err(resp) = persist(&state, &name) {
        return resp;
    }
    match state.registry.group(&name) {
        Some(group) => ApiResponse::ok(group.spec.policy).into_response(),
        None => registry_error(&RegistryError::GroupNotFound(name)),
    }
}

// ── Scaling ────────────────────────────────────────────────────

/// Scale request body.
#[derive(serde::Deserialize)]
pub struct ScaleRequest {
    pub target: u32,
}

/// POST /api/v1/groups/{name}/scale
pub async fn scale_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Json(req): Json<ScaleRequest>,
) -> impl IntoResponse {
    match state.autoscaler.scale_to(&name, req.target).await {
        Ok(decision) => {
            let desired = state.registry.group(&name).map(|g| g.desired_count);
            ApiResponse::ok(serde_json::json!({
                "group": name,
                "requested": req.target,
                "desired": desired,
                "delta": decision.as_ref().map(|d| d.delta).unwrap_or(0),
                "reason": decision.map(|d| d.reason.to_string()),
            }))
            .into_response()
        }
        Err(e) => lifecycle_error(&e),
    }
}

/// POST /api/v1/groups/{name}/pause
pub async fn pause_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    set_paused(&state, &name, true)
}

/// POST /api/v1/groups/{name}/resume
pub async fn resume_group(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    set_paused(&state, &name, false)
}

fn set_paused(state: &ApiState, name: &str, paused: bool) -> axum::response::Response {
    match state.registry.set_paused(name, paused) {
        Ok(()) => ApiResponse::ok(serde_json::json!({ "group": name, "paused": paused }))
            .into_response(),
        Err(e) => registry_error(&e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// GET /api/v1/instances/{id}
pub async fn get_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.registry.instance(&id) {
        Some(instance) => ApiResponse::ok(instance).into_response(),
        None if state.registry.is_tombstoned(&id) => {
            error_response("instance terminated", StatusCode::NOT_FOUND)
        }
        None => registry_error(&RegistryError::InstanceNotFound(id)),
    }
}

/// POST /api/v1/instances/{id}/terminate
///
/// Validates the request and starts the drain; the removal itself
/// completes in the background.
pub async fn terminate_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let Some(instance) = state.registry.instance(&id) else {
        return registry_error(&RegistryError::InstanceNotFound(id));
    };
    if matches!(
        instance.state,
        InstanceState::Provisioning | InstanceState::Starting
    ) {
        return lifecycle_error(&LifecycleError::NotTerminable {
            instance: id,
            state: instance.state,
        });
    }

    let lifecycle = state.lifecycle.clone();
    let target = id.clone();
    tokio::spawn(async move {
        if let Err(e) = lifecycle.terminate(&target, TerminationReason::Manual).await {
            warn!(instance = %target, error = %e, "manual termination failed");
        }
    });
    info!(instance = %id, "termination requested via API");
    (
        StatusCode::ACCEPTED,
        ApiResponse::ok(serde_json::json!({ "instance": id, "status": "terminating" })),
    )
        .into_response()
}
