pub mod health;
pub mod runs;
pub mod webhook;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/webhook/{provider}", post(webhook::webhook))
        .route("/health", get(health::health))
        .route("/api/runs", get(runs::list_runs))
        .route("/api/runs/{id}", get(runs::get_run))
        .route("/api/runs/{id}/start", post(runs::start_run))
        .route("/api/runs/{id}/complete", post(runs::complete_run))
        .route("/api/runs/{id}/fail", post(runs::fail_run))
        .route("/api/runs/{id}/cancel", post(runs::cancel_run))
        .route("/api/runs/{id}/replay", post(runs::replay_run))
}
