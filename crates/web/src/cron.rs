use std::time::Duration;

use anyhow::Result;
use tokio_cron_scheduler::{Job, JobScheduler};

use crate::AppState;

pub type Scheduler = JobScheduler;

pub async fn create(state: AppState) -> Result<Scheduler> {
    let sched = JobScheduler::new().await?;

    // Every 30 seconds: run health checks (also exits degraded mode once
    // dependencies recover)
    {
        let state = state.clone();
        sched
            .add(Job::new_async("1/30 * * * * *", move |_uuid, _l| {
                let state = state.clone();
                Box::pin(async move {
                    state.strategy.run_health_checks().await;
                })
            })?)
            .await?;
    }

    // Every 1 minute: time out overdue runs and report each outcome
    {
        let state = state.clone();
        sched
            .add(Job::new_async("every 1 minute", move |_uuid, _l| {
                let state = state.clone();
                Box::pin(async move {
                    if let Err(e) = sweep_timeouts(&state).await {
                        tracing::error!("Timeout sweep failed: {:?}", e);
                    }
                })
            })?)
            .await?;
    }

    // Every 5 minutes: drop expired replay nonces
    {
        let nonce_store = state.receiver.nonce_store();
        sched
            .add(Job::new_async("every 5 minutes", move |_uuid, _l| {
                let nonce_store = nonce_store.clone();
                Box::pin(async move {
                    match nonce_store.cleanup_expired().await {
                        Ok(0) => {}
                        Ok(removed) => tracing::info!("Removed {} expired nonces", removed),
                        Err(e) => tracing::error!("Nonce cleanup failed: {:?}", e),
                    }
                })
            })?)
            .await?;
    }

    sched.start().await?;
    Ok(sched)
}

/// Force timed-out runs terminal and produce exactly one provider-visible
/// outcome per run, resolved through the tenant's degradation mode.
async fn sweep_timeouts(state: &AppState) -> Result<()> {
    let timed_out = state.runs.check_timeouts().await?;
    for run in timed_out {
        let outcome = state
            .strategy
            .handle_gate_timeout(run.org_id, run.id, Duration::from_secs(run.timeout_seconds))
            .await;
        if let Some(reporter) = &state.reporter {
            if let Err(e) = reporter.report_degraded(&run, &outcome).await {
                tracing::error!("Failed to report timeout for run {}: {:?}", run.id, e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mergegate_core::{
        MemoryEventPublisher,
        config::{Config, DbConfig, ServerConfig},
        models::RunState,
    };
    use mergegate_db::MemoryRunStore;
    use mergegate_resilience::{AlertSeverity, DegradationStrategy, MemoryAlertSink};
    use mergegate_runs::{CreateRun, RunStateMachine};
    use mergegate_webhook::{MemoryNonceStore, MemoryRateLimiter, WebhookReceiver};
    use uuid::Uuid;

    use super::*;

    fn test_state(sink: Arc<MemoryAlertSink>) -> AppState {
        let config = Arc::new(Config {
            server: ServerConfig { port: 0 },
            db: DbConfig { url: "sqlite::memory:".to_string() },
            github: None,
            webhook: Default::default(),
            runs: Default::default(),
            resilience: Default::default(),
            writeback: Default::default(),
        });
        let publisher = Arc::new(MemoryEventPublisher::default());
        let receiver = Arc::new(WebhookReceiver::new(
            config.webhook.clone(),
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemoryRateLimiter::new()),
            publisher.clone(),
        ));
        let runs = Arc::new(RunStateMachine::new(Arc::new(MemoryRunStore::new()), publisher));
        let strategy = Arc::new(DegradationStrategy::new(&config.resilience, sink));
        AppState { config, runs, receiver, strategy, reporter: None }
    }

    #[tokio::test]
    async fn test_sweep_alerts_once_per_timed_out_run() {
        let sink = Arc::new(MemoryAlertSink::default());
        let state = test_state(sink.clone());

        let run = state
            .runs
            .create_run(CreateRun {
                org_id: Uuid::new_v4(),
                repo_id: Uuid::new_v4(),
                repo_full_name: "acme/widgets".to_string(),
                head_sha: "abc123".to_string(),
                timeout_seconds: 0,
                ..Default::default()
            })
            .await
            .unwrap();
        state.runs.start_run(run.id, "worker-1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        sweep_timeouts(&state).await.unwrap();

        let stored = state.runs.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::TimedOut);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertSeverity::Warning);
        assert_eq!(alerts[0].1, "Gate timeout");

        // A second sweep finds nothing to time out and alerts nothing
        sweep_timeouts(&state).await.unwrap();
        assert_eq!(sink.alerts().len(), 1);
    }
}
