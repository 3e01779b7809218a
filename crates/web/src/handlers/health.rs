use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mergegate_resilience::ServiceHealth;

use crate::AppState;

/// Degradation status snapshot. Reports 503 while any dependency is
/// unhealthy so load balancers can rotate the instance out.
pub async fn health(State(state): State<AppState>) -> Response {
    let status = state.strategy.status();
    let code = if status.overall_health == ServiceHealth::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(status)).into_response()
}
