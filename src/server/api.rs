use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use runway_common::{ApprovalRequest, Run, RunKind, RunStep};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::errors::StoreError;
use crate::events::EventHub;
use crate::orchestrator::RunLauncher;
use crate::store::{ApprovalResolution, NewRun};

const DEFAULT_LIST_LIMIT: usize = 50;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub launcher: RunLauncher,
    pub hub: Arc<EventHub>,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRunRequest {
    pub kind: String,
    pub project_id: String,
    #[serde(default)]
    pub intent: String,
}

#[derive(Deserialize)]
pub struct ListRunsQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListApprovalsQuery {
    pub run_id: Option<String>,
    pub pending: Option<bool>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApproveRequest {
    pub approved_by: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectRequest {
    pub rejected_by: String,
    pub reason: Option<String>,
}

/// A run together with its steps and approval requests.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDetail {
    #[serde(flatten)]
    pub run: Run,
    pub steps: Vec<RunStep>,
    pub approvals: Vec<ApprovalRequest>,
}

// ── Error handling ────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    Internal(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        let message = format!("{:#}", err);
        match err.downcast_ref::<StoreError>() {
            Some(StoreError::RunNotFound { .. })
            | Some(StoreError::StepNotFound { .. })
            | Some(StoreError::ApprovalNotFound { .. }) => ApiError::NotFound(message),
            Some(StoreError::ApprovalAlreadyResolved { .. })
            | Some(StoreError::RunFinished { .. })
            | Some(StoreError::ActiveStepConflict { .. }) => ApiError::Conflict(message),
            None => ApiError::Internal(message),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/runs", get(list_runs).post(create_run))
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
        .route("/api/approvals", get(list_approvals))
        .route("/api/approvals/{id}", get(get_approval))
        .route("/api/approvals/{id}/approve", post(approve))
        .route("/api/approvals/{id}/reject", post(reject))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListRunsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let runs = state.launcher.orchestrator().store().list_runs(limit).await?;
    Ok(Json(runs))
}

async fn create_run(
    State(state): State<SharedState>,
    Json(req): Json<CreateRunRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let kind: RunKind = req.kind.parse().map_err(ApiError::BadRequest)?;
    let project_id = req.project_id.trim();
    if project_id.is_empty() {
        return Err(ApiError::BadRequest("projectId must not be empty".into()));
    }

    let run = state
        .launcher
        .orchestrator()
        .store()
        .create_run(NewRun {
            kind,
            project_id: project_id.to_string(),
            intent: req.intent,
        })
        .await?;
    info!(run_id = %run.id, kind = %run.kind, project_id = %run.project_id, "run submitted");
    state.launcher.start(&run.id).await;
    Ok((StatusCode::CREATED, Json(run)))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let orchestrator = state.launcher.orchestrator();
    let run = orchestrator.store().get_run_info(&id).await?;
    let steps = orchestrator.store().list_run_steps(&id).await?;
    let approvals = orchestrator
        .approvals()
        .store()
        .list_approvals(Some(&id), false)
        .await?;
    Ok(Json(RunDetail {
        run,
        steps,
        approvals,
    }))
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let run = state.launcher.cancel(&id).await?;
    Ok((StatusCode::ACCEPTED, Json(run)))
}

async fn list_approvals(
    State(state): State<SharedState>,
    Query(query): Query<ListApprovalsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let approvals = state
        .launcher
        .orchestrator()
        .approvals()
        .store()
        .list_approvals(query.run_id.as_deref(), query.pending.unwrap_or(true))
        .await?;
    Ok(Json(approvals))
}

async fn get_approval(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let approval = state
        .launcher
        .orchestrator()
        .approvals()
        .store()
        .get_approval(&id)
        .await?;
    match approval {
        Some(approval) => Ok(Json(approval)),
        None => Err(ApiError::NotFound(format!("Approval {} not found", id))),
    }
}

async fn approve(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<ApproveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let by = non_empty(req.approved_by, "approvedBy")?;
    let resolved = state
        .launcher
        .orchestrator()
        .approvals()
        .resolve(&id, ApprovalResolution::Approve { by })
        .await?;
    Ok(Json(resolved))
}

async fn reject(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RejectRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let by = non_empty(req.rejected_by, "rejectedBy")?;
    let reason = req.reason.filter(|r| !r.trim().is_empty());
    let resolved = state
        .launcher
        .orchestrator()
        .approvals()
        .resolve(&id, ApprovalResolution::Reject { by, reason })
        .await?;
    Ok(Json(resolved))
}

fn non_empty(value: String, field: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(format!("{} must not be empty", field)));
    }
    Ok(trimmed.to_string())
}
