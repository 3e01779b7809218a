use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mergegate_core::models::{Run, RunState};
use mergegate_db::RunFilter;
use mergegate_runs::TransitionError;
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    org_id: Option<Uuid>,
    state: Option<String>,
    repo_id: Option<Uuid>,
    head_sha: Option<String>,
    pr_number: Option<u64>,
    #[serde(default)]
    offset: i64,
    #[serde(default = "default_limit")]
    limit: i64,
}

fn default_limit() -> i64 { 100 }

pub async fn list_runs(State(state): State<AppState>, Query(query): Query<ListQuery>) -> Response {
    let run_state = match query.state.as_deref() {
        Some(s) => match s.parse::<RunState>() {
            Ok(parsed) => Some(parsed),
            Err(()) => {
                return (StatusCode::BAD_REQUEST, format!("Unknown run state: {s}"))
                    .into_response();
            }
        },
        None => None,
    };
    let filter = RunFilter {
        org_id: query.org_id,
        state: run_state,
        repo_id: query.repo_id,
        head_sha: query.head_sha,
        pr_number: query.pr_number,
        offset: query.offset,
        limit: query.limit.clamp(1, 1000),
    };
    match state.runs.list_runs(&filter).await {
        Ok(runs) => Json(runs).into_response(),
        Err(e) => error_response(e),
    }
}

pub async fn get_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.runs.get_run_with_transitions(id).await {
        Ok(Some(run)) => Json(run).into_response(),
        Ok(None) => (StatusCode::NOT_FOUND, "Run not found").into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StartBody {
    worker_id: String,
}

pub async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<StartBody>,
) -> Response {
    match state.runs.start_run(id, &body.worker_id).await {
        Ok(run) => Json(run).into_response(),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CompleteBody {
    result: serde_json::Value,
    #[serde(default)]
    findings_count: u32,
}

pub async fn complete_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CompleteBody>,
) -> Response {
    match state.runs.complete_run(id, body.result, body.findings_count).await {
        Ok(run) => {
            report_terminal(&state, &run).await;
            Json(run).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct FailBody {
    error: String,
}

pub async fn fail_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<FailBody>,
) -> Response {
    match state.runs.fail_run(id, &body.error).await {
        Ok(run) => {
            report_terminal(&state, &run).await;
            Json(run).into_response()
        }
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    canceled_by: String,
    reason: Option<String>,
}

pub async fn cancel_run(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CancelBody>,
) -> Response {
    match state.runs.cancel_run(id, &body.canceled_by, body.reason).await {
        Ok(run) => {
            report_terminal(&state, &run).await;
            Json(run).into_response()
        }
        Err(e) => error_response(e),
    }
}

pub async fn replay_run(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.runs.replay_run(id).await {
        Ok(run) => {
            if let Some(reporter) = &state.reporter {
                if let Err(e) = reporter.report_started(&run).await {
                    tracing::error!("Failed to report gate start for replay {}: {e:#}", run.id);
                }
            }
            (StatusCode::CREATED, Json(run)).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn report_terminal(state: &AppState, run: &Run) {
    if let Some(reporter) = &state.reporter {
        if let Err(e) = reporter.report_terminal(run).await {
            tracing::error!("Failed to write back result for run {}: {e:#}", run.id);
        }
    }
}

fn error_response(err: TransitionError) -> Response {
    match err {
        TransitionError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()).into_response(),
        TransitionError::Invalid { .. }
        | TransitionError::Conflict { .. }
        | TransitionError::NotTerminal(_) => {
            (StatusCode::CONFLICT, err.to_string()).into_response()
        }
        TransitionError::Store(e) => {
            tracing::error!("{:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Something went wrong").into_response()
        }
    }
}
