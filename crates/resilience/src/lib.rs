mod breaker;
mod health;

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use mergegate_core::{config::ResilienceConfig, models::DegradationMode};
use serde::Serialize;
use tokio::time::Instant;
use uuid::Uuid;

pub use breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState, FallbackResult,
};
pub use health::{CheckFn, HealthCheck, HealthCheckConfig, HealthCheckResult, ServiceHealth};

/// Severity of a degradation alert.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Error,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Capability for publishing degradation alerts (pager, chat, ticket).
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish_alert(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        details: serde_json::Value,
    ) -> anyhow::Result<()>;
}

/// Alert sink that logs instead of paging.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn publish_alert(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        details: serde_json::Value,
    ) -> anyhow::Result<()> {
        tracing::warn!(severity = severity.as_str(), %details, "Alert: {title}: {message}");
        Ok(())
    }
}

/// Alert sink recording alerts in memory, for tests.
#[derive(Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<(AlertSeverity, String, String)>>,
}

#[async_trait]
impl AlertSink for MemoryAlertSink {
    async fn publish_alert(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        _details: serde_json::Value,
    ) -> anyhow::Result<()> {
        self.alerts.lock().unwrap().push((severity, title.to_string(), message.to_string()));
        Ok(())
    }
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> Vec<(AlertSeverity, String, String)> {
        self.alerts.lock().unwrap().clone()
    }
}

/// What the gate should do when it cannot complete normally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateAction {
    /// Block the merge.
    Block,
    /// Mark neutral, flag for manual review.
    Neutral,
    /// Allow the merge, but alert.
    Allow,
}

/// Provider-visible conclusion to report for a degraded gate.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateConclusion {
    Failure,
    Neutral,
}

/// Resolved outcome for a gate that timed out or lost a dependency.
#[derive(Debug, Clone, Serialize)]
pub struct GateOutcome {
    pub action: GateAction,
    pub conclusion: GateConclusion,
    pub mode: DegradationMode,
    pub message: String,
    pub alert_sent: bool,
}

struct Degraded {
    since: Instant,
    reason: String,
}

/// Point-in-time degradation status, served at the health endpoint.
#[derive(Debug, Serialize)]
pub struct DegradationStatus {
    pub is_degraded: bool,
    pub degraded_for_seconds: Option<u64>,
    pub degradation_reason: Option<String>,
    pub overall_health: ServiceHealth,
    pub circuit_breakers: Vec<BreakerSnapshot>,
    pub health_checks: BTreeMap<String, ServiceHealth>,
}

/// Manages graceful degradation for the gate pipeline: per-tenant modes,
/// lazily created circuit breakers, health checks, and the process-wide
/// degraded flag.
pub struct DegradationStrategy {
    default_mode: DegradationMode,
    org_modes: RwLock<HashMap<Uuid, DegradationMode>>,
    breaker_config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
    health_config: HealthCheckConfig,
    health_checks: Mutex<Vec<Arc<HealthCheck>>>,
    alert_sink: Arc<dyn AlertSink>,
    degraded: Mutex<Option<Degraded>>,
}

impl DegradationStrategy {
    pub fn new(config: &ResilienceConfig, alert_sink: Arc<dyn AlertSink>) -> Self {
        Self {
            default_mode: config.default_mode,
            org_modes: RwLock::new(config.org_modes.clone()),
            breaker_config: CircuitBreakerConfig::from(config),
            breakers: Mutex::new(HashMap::new()),
            health_config: HealthCheckConfig::from(config),
            health_checks: Mutex::new(Vec::new()),
            alert_sink,
            degraded: Mutex::new(None),
        }
    }

    // ── Degradation mode ────────────────────────────────────────────────

    pub fn mode(&self, org_id: Uuid) -> DegradationMode {
        self.org_modes.read().unwrap().get(&org_id).copied().unwrap_or(self.default_mode)
    }

    pub fn set_mode(&self, org_id: Uuid, mode: DegradationMode) {
        self.org_modes.write().unwrap().insert(org_id, mode);
    }

    // ── Gate timeout / dependency failure ───────────────────────────────

    /// Resolve the outcome for a gate that ran out of time.
    pub async fn handle_gate_timeout(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        elapsed: Duration,
    ) -> GateOutcome {
        let mode = self.mode(org_id);
        let elapsed_secs = elapsed.as_secs();
        let (action, conclusion, message) = match mode {
            DegradationMode::FailClosed => (
                GateAction::Block,
                GateConclusion::Failure,
                format!("Gate timed out after {elapsed_secs}s"),
            ),
            DegradationMode::FailNeutral => (
                GateAction::Neutral,
                GateConclusion::Neutral,
                format!(
                    "Gate timed out after {elapsed_secs}s. Marked as neutral, manual review recommended."
                ),
            ),
            DegradationMode::FailOpen => (
                GateAction::Allow,
                GateConclusion::Neutral,
                format!(
                    "Gate timed out after {elapsed_secs}s. Allowing merge, manual review required."
                ),
            ),
        };

        let alert_sent = self
            .alert(
                AlertSeverity::Warning,
                "Gate timeout",
                &message,
                serde_json::json!({
                    "org_id": org_id,
                    "run_id": run_id,
                    "mode": mode,
                    "action": action,
                }),
            )
            .await;

        tracing::warn!(
            "Gate timeout: org={org_id} run={run_id} mode={mode} action={action:?}"
        );

        GateOutcome { action, conclusion, mode, message, alert_sent }
    }

    /// Resolve the outcome for a gate whose dependency failed, and flip the
    /// process into degraded mode (health checks exit it once the
    /// dependency recovers).
    pub async fn handle_dependency_failure(
        &self,
        org_id: Uuid,
        run_id: Uuid,
        dependency: &str,
        error: &str,
    ) -> GateOutcome {
        let mode = self.mode(org_id);
        let (action, conclusion, message) = match mode {
            DegradationMode::FailClosed => (
                GateAction::Block,
                GateConclusion::Failure,
                format!("Dependency failure ({dependency}): {error}"),
            ),
            DegradationMode::FailNeutral => (
                GateAction::Neutral,
                GateConclusion::Neutral,
                format!("Dependency failure ({dependency}). Marked as neutral, retry later."),
            ),
            DegradationMode::FailOpen => (
                GateAction::Allow,
                GateConclusion::Neutral,
                format!("Dependency failure ({dependency}). Allowing merge, verify manually."),
            ),
        };

        self.enter_degraded(format!("Dependency failure: {dependency}"));

        let alert_sent = self
            .alert(
                AlertSeverity::Error,
                &format!("Dependency failure: {dependency}"),
                error,
                serde_json::json!({
                    "org_id": org_id,
                    "run_id": run_id,
                    "dependency": dependency,
                    "mode": mode,
                }),
            )
            .await;

        GateOutcome { action, conclusion, mode, message, alert_sent }
    }

    // ── Circuit breakers ────────────────────────────────────────────────

    /// Get or lazily create the breaker for a dependency name.
    pub fn circuit_breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().unwrap();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(name, self.breaker_config.clone()))
            })
            .clone()
    }

    /// Execute an operation through the named dependency's breaker.
    pub async fn call_protected<T, F, Fut>(&self, name: &str, operation: F) -> FallbackResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        self.circuit_breaker(name).call(operation).await
    }

    // ── Health checks ───────────────────────────────────────────────────

    pub fn register_health_check(&self, name: &str, check: CheckFn) -> Arc<HealthCheck> {
        let check = Arc::new(HealthCheck::new(name, check, self.health_config.clone()));
        self.health_checks.lock().unwrap().push(check.clone());
        check
    }

    /// Run every registered probe, entering or exiting degraded mode based
    /// on the results.
    pub async fn run_health_checks(&self) -> Vec<HealthCheckResult> {
        let checks: Vec<Arc<HealthCheck>> = self.health_checks.lock().unwrap().clone();
        let mut results = Vec::with_capacity(checks.len());
        for check in checks {
            results.push(check.run().await);
        }

        let unhealthy =
            results.iter().filter(|r| r.status == ServiceHealth::Unhealthy).count();
        if unhealthy > 0 {
            self.enter_degraded(format!("{unhealthy} services unhealthy"));
        } else {
            self.exit_degraded();
        }

        results
    }

    /// Worst status across all registered checks.
    pub fn overall_health(&self) -> ServiceHealth {
        let checks = self.health_checks.lock().unwrap();
        worst_of(checks.iter().map(|c| c.status()))
    }

    pub fn is_degraded(&self) -> bool { self.degraded.lock().unwrap().is_some() }

    pub fn status(&self) -> DegradationStatus {
        let degraded = self.degraded.lock().unwrap();
        let breakers = self.breakers.lock().unwrap();
        let checks = self.health_checks.lock().unwrap();
        DegradationStatus {
            is_degraded: degraded.is_some(),
            degraded_for_seconds: degraded.as_ref().map(|d| d.since.elapsed().as_secs()),
            degradation_reason: degraded.as_ref().map(|d| d.reason.clone()),
            overall_health: worst_of(checks.iter().map(|c| c.status())),
            circuit_breakers: breakers.values().map(|b| b.snapshot()).collect(),
            health_checks: checks.iter().map(|c| (c.name().to_string(), c.status())).collect(),
        }
    }

    // ── Degraded mode ───────────────────────────────────────────────────

    fn enter_degraded(&self, reason: String) {
        let mut degraded = self.degraded.lock().unwrap();
        if degraded.is_some() {
            return;
        }
        tracing::warn!("Entering degraded mode: {reason}");
        *degraded = Some(Degraded { since: Instant::now(), reason });
    }

    fn exit_degraded(&self) {
        let mut degraded = self.degraded.lock().unwrap();
        if let Some(state) = degraded.take() {
            tracing::info!("Exiting degraded mode after {:?}", state.since.elapsed());
        }
    }

    async fn alert(
        &self,
        severity: AlertSeverity,
        title: &str,
        message: &str,
        details: serde_json::Value,
    ) -> bool {
        match self.alert_sink.publish_alert(severity, title, message, details).await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to publish alert '{title}': {e:#}");
                false
            }
        }
    }
}

fn worst_of(statuses: impl Iterator<Item = ServiceHealth>) -> ServiceHealth {
    let statuses: Vec<ServiceHealth> = statuses.collect();
    if statuses.is_empty() {
        ServiceHealth::Unknown
    } else if statuses.contains(&ServiceHealth::Unhealthy) {
        ServiceHealth::Unhealthy
    } else if statuses.contains(&ServiceHealth::Degraded) {
        ServiceHealth::Degraded
    } else if statuses.iter().all(|s| *s == ServiceHealth::Healthy) {
        ServiceHealth::Healthy
    } else {
        ServiceHealth::Unknown
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn strategy() -> (DegradationStrategy, Arc<MemoryAlertSink>) {
        let sink = Arc::new(MemoryAlertSink::default());
        (DegradationStrategy::new(&ResilienceConfig::default(), sink.clone()), sink)
    }

    #[tokio::test]
    async fn test_gate_timeout_default_mode_is_neutral() {
        let (strategy, sink) = strategy();
        let outcome = strategy
            .handle_gate_timeout(Uuid::new_v4(), Uuid::new_v4(), Duration::from_secs(600))
            .await;
        assert_eq!(outcome.mode, DegradationMode::FailNeutral);
        assert_eq!(outcome.action, GateAction::Neutral);
        assert_eq!(outcome.conclusion, GateConclusion::Neutral);
        assert!(outcome.alert_sent);
        let alerts = sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].0, AlertSeverity::Warning);
    }

    #[tokio::test]
    async fn test_gate_timeout_per_org_modes() {
        let (strategy, _) = strategy();
        let strict = Uuid::new_v4();
        let lax = Uuid::new_v4();
        strategy.set_mode(strict, DegradationMode::FailClosed);
        strategy.set_mode(lax, DegradationMode::FailOpen);

        let outcome = strategy
            .handle_gate_timeout(strict, Uuid::new_v4(), Duration::from_secs(30))
            .await;
        assert_eq!(outcome.action, GateAction::Block);
        assert_eq!(outcome.conclusion, GateConclusion::Failure);

        let outcome =
            strategy.handle_gate_timeout(lax, Uuid::new_v4(), Duration::from_secs(30)).await;
        assert_eq!(outcome.action, GateAction::Allow);
        assert_eq!(outcome.conclusion, GateConclusion::Neutral);
    }

    #[tokio::test]
    async fn test_dependency_failure_enters_degraded() {
        let (strategy, sink) = strategy();
        assert!(!strategy.is_degraded());
        let outcome = strategy
            .handle_dependency_failure(Uuid::new_v4(), Uuid::new_v4(), "provider-api", "503")
            .await;
        assert_eq!(outcome.action, GateAction::Neutral);
        assert!(strategy.is_degraded());
        assert_eq!(sink.alerts()[0].0, AlertSeverity::Error);

        // Healthy sweep exits degraded mode
        strategy.run_health_checks().await;
        assert!(!strategy.is_degraded());
    }

    #[tokio::test]
    async fn test_unhealthy_check_keeps_degraded() {
        let (strategy, _) = strategy();
        let healthy = Arc::new(AtomicBool::new(false));
        let flag = healthy.clone();
        strategy.register_health_check(
            "db",
            Box::new(move || {
                let flag = flag.clone();
                Box::pin(async move { Ok(flag.load(Ordering::SeqCst)) })
            }),
        );

        // failure_threshold (3) consecutive failures flip the check to
        // unhealthy, which enters degraded mode
        for _ in 0..3 {
            strategy.run_health_checks().await;
        }
        assert!(strategy.is_degraded());
        assert_eq!(strategy.overall_health(), ServiceHealth::Unhealthy);

        healthy.store(true, Ordering::SeqCst);
        strategy.run_health_checks().await;
        assert!(!strategy.is_degraded());
        assert_eq!(strategy.overall_health(), ServiceHealth::Healthy);
    }

    #[tokio::test]
    async fn test_overall_health_unknown_without_checks() {
        let (strategy, _) = strategy();
        assert_eq!(strategy.overall_health(), ServiceHealth::Unknown);
    }

    #[tokio::test]
    async fn test_breaker_created_lazily_and_shared() {
        let (strategy, _) = strategy();
        let a = strategy.circuit_breaker("provider-api");
        let b = strategy.circuit_breaker("provider-api");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(strategy.status().circuit_breakers.len(), 1);
    }

    #[tokio::test]
    async fn test_call_protected_wraps_named_breaker() {
        let (strategy, _) = strategy();
        let result = strategy.call_protected("provider-api", || async { Ok(42) }).await;
        assert!(result.success);
        assert_eq!(result.result, Some(42));
        assert_eq!(
            strategy.circuit_breaker("provider-api").state(),
            CircuitState::Closed,
        );
    }
}
