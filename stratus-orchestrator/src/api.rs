use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use stratus_common::{EnvMap, Instance, MountSpec};

use crate::error::ProvisionError;
use crate::provisioner::Provisioner;

pub struct AppState {
    pub provisioner: Provisioner,
}

// --- DTOs ---

#[derive(Deserialize, Debug)]
pub struct ProvisionRequest {
    pub name: String,
    pub image_id: String,
    #[serde(default)]
    pub mounts: MountSpec,
    #[serde(default)]
    pub env: EnvMap,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/instances", get(list_instances).post(provision_instance))
        .route("/instances/{id}", get(get_instance))
        .with_state(state)
}

// --- Handlers ---

async fn health() -> &'static str {
    "OK"
}

async fn provision_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    match state
        .provisioner
        .provision(&req.name, &req.image_id, &req.mounts, &req.env)
        .await
    {
        Ok(instance) => (StatusCode::CREATED, Json(instance)).into_response(),
        Err(err) => provision_error_response(&err),
    }
}

async fn list_instances(State(state): State<Arc<AppState>>) -> Json<Vec<Instance>> {
    Json(state.provisioner.store().list())
}

async fn get_instance(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.provisioner.store().get(&id) {
        Some(instance) => Json(instance).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": format!("instance {} not found", id) })),
        )
            .into_response(),
    }
}

fn provision_error_response(err: &ProvisionError) -> Response {
    let status = match err {
        ProvisionError::Validation { .. } => StatusCode::BAD_REQUEST,
        ProvisionError::ResourceLookup { error, .. } if error.is_not_found() => {
            StatusCode::NOT_FOUND
        }
        ProvisionError::Encoding(_) => StatusCode::INTERNAL_SERVER_ERROR,
        ProvisionError::DeadlineExceeded { .. } => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "step": err.step().as_str(),
            "control_plane_touched": err.touched_control_plane(),
        })),
    )
        .into_response()
}
