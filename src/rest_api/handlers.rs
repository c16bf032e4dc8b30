//! HTTP handlers for the REST API

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use tracing::{error, instrument};

use crate::controller::ControllerHandle;
use crate::crd::{ModuleKey, TemplateRef};
use crate::error::Error;

use super::dto::{
    CacheStatsResponse, ErrorResponse, HealthResponse, HistoryResponse, InvalidateResponse,
    ManifestResponse, PhaseResponse, RollbackResponse, TriggerResponse,
};

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Map a controller error onto an HTTP status
pub fn error_response(err: &Error) -> ApiError {
    let status = match err {
        Error::ValidationError(msg) if msg.contains("not found") => StatusCode::NOT_FOUND,
        Error::KubeError(kube::Error::Api(resp)) if resp.code == 404 => StatusCode::NOT_FOUND,
        Error::ValidationError(_) | Error::SchemaValidationError(_) => StatusCode::BAD_REQUEST,
        Error::ApplyConflict { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Request failed: {}", err);
    }
    (status, Json(ErrorResponse::new(err.reason(), &err.to_string())))
}

fn not_found(key: &ModuleKey, what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse::new(
            "not_found",
            &format!("No {what} recorded for Module {key}"),
        )),
    )
}

/// Health check endpoint
#[instrument(skip(handle))]
pub async fn health(State(handle): State<ControllerHandle>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        queue_depth: handle.queue_depth(),
    })
}

#[instrument(skip(handle), fields(namespace = %namespace, name = %name))]
pub async fn get_manifest(
    State(handle): State<ControllerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<ManifestResponse>, ApiError> {
    let key = ModuleKey::new(namespace, name);
    let manifest = handle
        .rendered_manifest(&key)
        .await
        .map_err(|e| error_response(&e))?
        .ok_or_else(|| not_found(&key, "rendered manifest"))?;
    let yaml = manifest.to_yaml().map_err(|e| error_response(&e))?;
    Ok(Json(ManifestResponse::new(key.namespace, key.name, &manifest, yaml)))
}

#[instrument(skip(handle), fields(namespace = %namespace, name = %name))]
pub async fn get_history(
    State(handle): State<ControllerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let key = ModuleKey::new(namespace, name);
    let items = handle.history(&key).await.map_err(|e| error_response(&e))?;
    let total = items.len();
    Ok(Json(HistoryResponse { items, total }))
}

pub async fn get_phase(
    State(handle): State<ControllerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> Json<PhaseResponse> {
    let key = ModuleKey::new(namespace, name);
    Json(PhaseResponse {
        phase: handle.module_phase(&key),
    })
}

#[instrument(skip(handle), fields(namespace = %namespace, name = %name))]
pub async fn trigger_reconcile(
    State(handle): State<ControllerHandle>,
    Path((namespace, name)): Path<(String, String)>,
) -> (StatusCode, Json<TriggerResponse>) {
    let key = ModuleKey::new(namespace, name);
    handle.trigger_reconcile(&key);
    (
        StatusCode::ACCEPTED,
        Json(TriggerResponse {
            queued: key.to_string(),
        }),
    )
}

#[instrument(skip(handle), fields(namespace = %namespace, name = %name, index = index))]
pub async fn rollback(
    State(handle): State<ControllerHandle>,
    Path((namespace, name, index)): Path<(String, String, usize)>,
) -> Result<(StatusCode, Json<RollbackResponse>), ApiError> {
    let key = ModuleKey::new(namespace, name);
    let entry = handle
        .rollback(&key, index)
        .await
        .map_err(|e| error_response(&e))?;
    Ok((
        StatusCode::ACCEPTED,
        Json(RollbackResponse {
            index,
            template: entry.template,
            content_hash: entry.content_hash,
        }),
    ))
}

pub async fn cache_stats(State(handle): State<ControllerHandle>) -> Json<CacheStatsResponse> {
    Json(CacheStatsResponse {
        stats: handle.cache_stats(),
    })
}

/// Drop one template from the cache, e.g. after a push to a floating branch
#[instrument(skip(handle), fields(template = %reference))]
pub async fn invalidate_template(
    State(handle): State<ControllerHandle>,
    Json(reference): Json<TemplateRef>,
) -> Json<InvalidateResponse> {
    Json(InvalidateResponse {
        invalidated: handle.invalidate_template(&reference),
    })
}
