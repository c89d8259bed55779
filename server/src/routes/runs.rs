//! Reconciliation run routes.

use axum::{
    extract::{Path, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use converge_engine::{ReconciliationReport, RunState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::Operator;
use crate::error::{AppError, Result};
use crate::runner::{RunHandle, RunRequest};
use crate::AppState;

/// Create run routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/runs", post(start_run))
        .route("/runs/sync", post(run_blocking))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/report", get(get_report))
        .route("/runs/{id}/confirm", post(confirm_run))
        .route("/runs/{id}/cancel", post(cancel_run))
}

/// Response for accepted runs and state queries.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: Uuid,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<ReconciliationReport>,
}

impl RunStatus {
    fn of(handle: &RunHandle, with_report: bool) -> Self {
        Self {
            run_id: handle.id(),
            state: handle.state(),
            report: with_report.then(|| handle.report()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ConfirmRequest {
    pub token: String,
}

fn lookup(state: &AppState, id: &Uuid) -> Result<Arc<RunHandle>> {
    state
        .runs
        .get(id)
        .ok_or_else(|| AppError::NotFound(format!("run {id}")))
}

/// POST /runs - Start a run in the background.
async fn start_run(
    State(state): State<AppState>,
    _operator: Operator,
    Json(request): Json<RunRequest>,
) -> Result<(StatusCode, Json<RunStatus>)> {
    let handle = state.runner.prepare(&request)?;
    state.runs.register(handle.clone());

    let runner = state.runner.clone();
    let task_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(err) = runner.run(&task_handle, &request).await {
            tracing::warn!(run_id = %task_handle.id(), error = %err, "run ended with error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(RunStatus::of(&handle, false))))
}

/// POST /runs/sync - Run to completion and return the report.
async fn run_blocking(
    State(state): State<AppState>,
    _operator: Operator,
    Json(request): Json<RunRequest>,
) -> Result<Json<ReconciliationReport>> {
    let handle = state.runner.prepare(&request)?;
    state.runs.register(handle.clone());
    let report = state.runner.run(&handle, &request).await?;
    Ok(Json(report))
}

/// GET /runs/{id} - Current state and report.
async fn get_run(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<Json<RunStatus>> {
    let handle = lookup(&state, &id)?;
    Ok(Json(RunStatus::of(&handle, true)))
}

/// GET /runs/{id}/report - Report rendered as JSON lines.
async fn get_report(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let handle = lookup(&state, &id)?;
    let body = handle.report().to_json_lines()?;
    Ok(([(CONTENT_TYPE, "application/x-ndjson")], body))
}

/// POST /runs/{id}/confirm - Supply the plan fingerprint.
async fn confirm_run(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
    Json(request): Json<ConfirmRequest>,
) -> Result<(StatusCode, Json<RunStatus>)> {
    let handle = lookup(&state, &id)?;
    if handle.state().is_terminal() {
        return Err(AppError::Conflict(format!(
            "run {id} already finished as {}",
            handle.state()
        )));
    }
    tracing::info!(run_id = %id, "confirmation received");
    handle.confirm(request.token);
    Ok((StatusCode::ACCEPTED, Json(RunStatus::of(&handle, false))))
}

/// POST /runs/{id}/cancel - Stop before the next operation.
async fn cancel_run(
    State(state): State<AppState>,
    _operator: Operator,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<RunStatus>)> {
    let handle = lookup(&state, &id)?;
    if handle.state().is_terminal() {
        return Err(AppError::Conflict(format!(
            "run {id} already finished as {}",
            handle.state()
        )));
    }
    tracing::info!(run_id = %id, "cancellation requested");
    handle.cancel();
    Ok((StatusCode::ACCEPTED, Json(RunStatus::of(&handle, false))))
}
