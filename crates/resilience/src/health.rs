use std::{sync::Mutex, time::Duration};

use futures_util::future::BoxFuture;
use mergegate_core::config::ResilienceConfig;
use serde::Serialize;
use tokio::time::{Instant, timeout};

/// Health states for a dependent service.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl ServiceHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
            Self::Unknown => "unknown",
        }
    }
}

/// A probe returning whether the dependency is usable.
pub type CheckFn = Box<dyn Fn() -> BoxFuture<'static, anyhow::Result<bool>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub timeout: Duration,
    /// Consecutive failures before the status flips to unhealthy; fewer
    /// failures report degraded.
    pub failure_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), failure_threshold: 3 }
    }
}

impl From<&ResilienceConfig> for HealthCheckConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.health_timeout_seconds),
            failure_threshold: config.health_failure_threshold,
        }
    }
}

/// Result of a single probe execution.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: ServiceHealth,
    pub latency_ms: u128,
    pub message: Option<String>,
}

struct HealthInner {
    status: ServiceHealth,
    consecutive_failures: u32,
    last_check: Option<Instant>,
    last_success: Option<Instant>,
}

/// Named health probe with its own timeout and failure accounting.
pub struct HealthCheck {
    name: String,
    check: CheckFn,
    config: HealthCheckConfig,
    inner: Mutex<HealthInner>,
}

impl HealthCheck {
    pub fn new(name: impl Into<String>, check: CheckFn, config: HealthCheckConfig) -> Self {
        Self {
            name: name.into(),
            check,
            config,
            inner: Mutex::new(HealthInner {
                status: ServiceHealth::Unknown,
                consecutive_failures: 0,
                last_check: None,
                last_success: None,
            }),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn status(&self) -> ServiceHealth { self.inner.lock().unwrap().status }

    /// Run the probe once, updating the recorded status.
    pub async fn run(&self) -> HealthCheckResult {
        let start = Instant::now();
        let outcome = timeout(self.config.timeout, (self.check)()).await;
        let latency_ms = start.elapsed().as_millis();

        let (status, message) = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_check = Some(Instant::now());
            match outcome {
                Ok(Ok(true)) => {
                    inner.consecutive_failures = 0;
                    inner.status = ServiceHealth::Healthy;
                    inner.last_success = Some(Instant::now());
                    (ServiceHealth::Healthy, None)
                }
                Ok(Ok(false)) => {
                    let status = record_failure(&mut inner, self.config.failure_threshold);
                    (status, Some("check returned false".to_string()))
                }
                Ok(Err(e)) => {
                    let status = record_failure(&mut inner, self.config.failure_threshold);
                    (status, Some(format!("{e:#}")))
                }
                Err(_) => {
                    let status = record_failure(&mut inner, self.config.failure_threshold);
                    (status, Some(format!("timeout after {:?}", self.config.timeout)))
                }
            }
        };

        if status != ServiceHealth::Healthy {
            tracing::warn!(
                "Health check '{}' {}: {}",
                self.name,
                status.as_str(),
                message.as_deref().unwrap_or(""),
            );
        }

        HealthCheckResult { name: self.name.clone(), status, latency_ms, message }
    }
}

fn record_failure(inner: &mut HealthInner, threshold: u32) -> ServiceHealth {
    inner.consecutive_failures += 1;
    inner.status = if inner.consecutive_failures >= threshold {
        ServiceHealth::Unhealthy
    } else {
        ServiceHealth::Degraded
    };
    inner.status
}
