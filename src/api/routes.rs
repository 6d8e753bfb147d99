//! API route definitions.

use super::state::AppState;
use crate::action::ActionName;
use crate::gate::ApprovalToken;
use crate::incident::IncidentId;
use crate::metrics::{MetricsSummary, METRICS_WINDOW};
use crate::storage::StoreError;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

const DEFAULT_LIMIT: usize = 50;
const MAX_LIMIT: usize = 1000;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/incidents", get(list_incidents))
        .route("/incidents/{id}", get(get_incident))
        .route("/metrics", get(metrics))
        .route("/approvals", post(grant_approval))
}

fn meta() -> Value {
    json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION")
    })
}

enum ApiError {
    NotFound(String),
    BadRequest(String),
    Store(StoreError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Store(e) => {
                warn!(error = %e, "storage error while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
        };
        (status, Json(json!({ "error": { "message": message }, "meta": meta() }))).into_response()
    }
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": meta()
    }))
}

#[derive(Debug, Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

async fn list_incidents(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Value>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let incidents = state.store.list_recent(limit).await?;
    let total = incidents.len();
    Ok(Json(json!({
        "data": incidents,
        "meta": { "total": total, "limit": limit, "timestamp": chrono::Utc::now().to_rfc3339() }
    })))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let id: IncidentId = id
        .parse()
        .map_err(|_| ApiError::BadRequest(format!("invalid incident id: {id}")))?;
    let incident = state
        .store
        .get_incident(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("incident {id} not found")))?;
    Ok(Json(json!({ "data": incident, "meta": meta() })))
}

async fn metrics(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let incidents = state.store.list_recent(METRICS_WINDOW + 1).await?;
    let summary = MetricsSummary::over_window(incidents, METRICS_WINDOW);
    Ok(Json(json!({ "data": summary, "meta": meta() })))
}

#[derive(Debug, Deserialize)]
struct ApprovalRequest {
    action: String,
    approved_by: String,
    ttl_secs: Option<i64>,
}

async fn grant_approval(
    State(state): State<AppState>,
    Json(req): Json<ApprovalRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let action: ActionName = req
        .action
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("{e}")))?;
    let approved_by = req.approved_by.trim();
    if approved_by.is_empty() {
        return Err(ApiError::BadRequest("approved_by must not be empty".to_string()));
    }
    let ttl = match req.ttl_secs {
        Some(secs) if secs <= 0 => {
            return Err(ApiError::BadRequest("ttl_secs must be positive".to_string()))
        }
        Some(secs) => Some(chrono::Duration::seconds(secs)),
        None => None,
    };

    let token = ApprovalToken::new(action, approved_by, ttl);
    state.approvals.grant(token.clone()).await?;
    info!(%action, approved_by = %token.approved_by, expires_at = ?token.expires_at, "approval granted");

    Ok((StatusCode::CREATED, Json(json!({ "data": token, "meta": meta() }))))
}
