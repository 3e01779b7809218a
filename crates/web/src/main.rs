mod cron;
mod gate;
mod handlers;

use std::{
    fs::File,
    io::BufReader,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::extract::FromRef;
use mergegate_core::{TracingEventPublisher, config::Config};
use mergegate_db::{Database, RunStore};
use mergegate_resilience::{DegradationStrategy, TracingAlertSink};
use mergegate_runs::RunStateMachine;
use mergegate_webhook::{MemoryNonceStore, MemoryRateLimiter, WebhookReceiver};
use mergegate_writeback::{GateWriteback, OctocrabClient, RetryPolicy, StaticTokenProvider};
use tokio::{net::TcpListener, signal};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing_subscriber::{
    EnvFilter, filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt,
};
use uuid::Uuid;

use crate::{gate::GateReporter, handlers::build_router};

#[derive(Clone, FromRef)]
pub struct AppState {
    config: Arc<Config>,
    runs: Arc<RunStateMachine>,
    receiver: Arc<WebhookReceiver>,
    strategy: Arc<DegradationStrategy>,
    reporter: Option<Arc<GateReporter>>,
}

#[tokio::main]
async fn main() {
    let env_filter = EnvFilter::builder()
        // Default to info level
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config: Arc<Config> = {
        let file = BufReader::new(File::open("config.yml").expect("Failed to open config file"));
        serde_yaml::from_reader(file).expect("Failed to parse config file")
    };

    let db = Database::new(&config.db).await.expect("Failed to open database");
    let store: Arc<dyn RunStore> = Arc::new(db);
    let publisher = Arc::new(TracingEventPublisher);

    let receiver = Arc::new(WebhookReceiver::new(
        config.webhook.clone(),
        Arc::new(MemoryNonceStore::new()),
        Arc::new(MemoryRateLimiter::new()),
        publisher.clone(),
    ));
    let runs = Arc::new(RunStateMachine::new(store.clone(), publisher));
    let strategy =
        Arc::new(DegradationStrategy::new(&config.resilience, Arc::new(TracingAlertSink)));

    // The run store doubles as the liveness probe for the pipeline
    {
        let store = store.clone();
        strategy.register_health_check(
            "run-store",
            Box::new(move || {
                let store = store.clone();
                Box::pin(async move { Ok(store.get(Uuid::nil()).await.is_ok()) })
            }),
        );
    }

    let reporter = config.github.as_ref().map(|github| {
        Arc::new(GateReporter::new(
            GateWriteback::new(
                Arc::new(OctocrabClient),
                Arc::new(StaticTokenProvider::new(github.token.clone())),
                RetryPolicy::from(&config.writeback),
            ),
            strategy.clone(),
            store.clone(),
        ))
    });
    if reporter.is_none() {
        tracing::warn!("No provider token configured, gate results will not be written back");
    }

    let state = AppState { config: config.clone(), runs, receiver, strategy, reporter };

    // Start the periodic sweeps (timeouts, health checks, nonce cleanup)
    let _scheduler = cron::create(state.clone()).await.expect("Failed to create scheduler");

    let router = build_router()
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .with_state(state);

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.server.port);
    let listener = TcpListener::bind(addr).await.expect("Failed to bind listener");
    tracing::info!("Web server: Listening on {addr}");
    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");
}

async fn shutdown_signal() {
    signal::ctrl_c().await.expect("Failed to install Ctrl+C handler");
    tracing::info!("Shutting down");
}
