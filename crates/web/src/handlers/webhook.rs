use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use mergegate_core::models::{Provider, RunType, WebhookEvent};
use mergegate_runs::CreateRun;
use mergegate_webhook::WebhookError;

use crate::AppState;

/// Inbound webhook endpoint. Returns 2xx on successful ingestion regardless
/// of downstream run outcome; run results are reported asynchronously via
/// write-back.
pub async fn webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(provider) = provider.parse::<Provider>() else {
        return (StatusCode::NOT_FOUND, "Unknown provider").into_response();
    };
    let secret = state.config.webhook.secrets.for_provider(provider).map(str::to_string);

    match state.receiver.receive(provider, &headers, &body, secret.as_deref()).await {
        Ok(event) => {
            dispatch_gate_run(&state, &event).await;
            (StatusCode::OK, "Event processed").into_response()
        }
        Err(e) => {
            tracing::warn!("Rejected webhook from {provider}: {e}");
            (status_for(&e), e.to_string()).into_response()
        }
    }
}

fn status_for(err: &WebhookError) -> StatusCode {
    match err {
        WebhookError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        WebhookError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        WebhookError::MissingSecret(_) | WebhookError::SignatureMismatch => {
            StatusCode::UNAUTHORIZED
        }
        WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// Create a gate run for events that request one. Failures here must not
/// affect the webhook response; the provider already delivered successfully.
async fn dispatch_gate_run(state: &AppState, event: &WebhookEvent) {
    if !event.event_type.requests_gate() {
        return;
    }
    let (Some(org_id), Some(repo_id), Some(head_sha)) =
        (event.org_id, event.repo_id, event.head_sha.clone())
    else {
        tracing::warn!(
            "Gate event {} from {} is missing tenant or commit info, not dispatching",
            event.event_type,
            event.repo_full_name,
        );
        return;
    };

    let params = CreateRun {
        org_id,
        repo_id,
        repo_full_name: event.repo_full_name.clone(),
        head_sha,
        run_type: RunType::Gate,
        event_id: Some(event.id),
        base_sha: event.base_sha.clone(),
        git_ref: event.head_ref.clone(),
        pr_number: event.pr_number,
        timeout_seconds: state.config.runs.timeout_seconds,
        max_attempts: state.config.runs.max_attempts,
        ..Default::default()
    };
    match state.runs.create_run(params).await {
        Ok(run) => {
            tracing::info!(
                "Dispatched gate run {} for {}@{}",
                run.id,
                run.repo_full_name,
                run.head_sha,
            );
            if let Some(reporter) = &state.reporter {
                if let Err(e) = reporter.report_started(&run).await {
                    tracing::error!("Failed to report gate start for run {}: {e:#}", run.id);
                }
            }
        }
        Err(e) => {
            tracing::error!("Failed to create gate run for event {}: {e}", event.id);
        }
    }
}
