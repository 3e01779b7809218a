use std::{future::Future, sync::Mutex, time::Duration};

use mergegate_core::config::ResilienceConfig;
use serde::Serialize;
use tokio::time::{Instant, timeout};

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast, operations are not invoked.
    Open,
    /// Testing recovery with a limited number of calls.
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Consecutive successes in half-open before it closes again.
    pub success_threshold: u32,
    /// Per-call timeout; a timeout counts as a failure.
    pub call_timeout: Duration,
    /// How long the breaker stays open before probing with half-open.
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            call_timeout: Duration::from_secs(30),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

impl From<&ResilienceConfig> for CircuitBreakerConfig {
    fn from(config: &ResilienceConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            success_threshold: config.success_threshold,
            call_timeout: Duration::from_secs(config.call_timeout_seconds),
            reset_timeout: Duration::from_secs(config.reset_timeout_seconds),
        }
    }
}

/// Outcome of a breaker-wrapped call. Dependency errors are captured here
/// rather than propagated, so callers always get a structured result.
#[derive(Debug)]
pub struct FallbackResult<T> {
    pub success: bool,
    pub used_fallback: bool,
    pub fallback_reason: Option<&'static str>,
    pub original_error: Option<String>,
    pub result: Option<T>,
    pub duration: Duration,
}

struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
}

/// Stateful guard around one dependency. Process-local; each instance of
/// the service trips independently.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

enum Preflight {
    Proceed,
    ShortCircuit,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                last_state_change: Instant::now(),
            }),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    pub fn state(&self) -> CircuitState { self.inner.lock().unwrap().state }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().unwrap();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
        }
    }

    /// Execute an operation through the breaker. When the breaker is open
    /// the operation is not invoked and a structured failure is returned.
    pub async fn call<T, F, Fut>(&self, operation: F) -> FallbackResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.call_inner(operation, None::<fn() -> std::future::Ready<anyhow::Result<T>>>).await
    }

    /// Like [`CircuitBreaker::call`], but with a fallback that supplies a
    /// result when the breaker is open or the call fails while open.
    pub async fn call_with_fallback<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: G,
    ) -> FallbackResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        self.call_inner(operation, Some(fallback)).await
    }

    async fn call_inner<T, F, Fut, G, GFut>(
        &self,
        operation: F,
        fallback: Option<G>,
    ) -> FallbackResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
        G: FnOnce() -> GFut,
        GFut: Future<Output = anyhow::Result<T>>,
    {
        let start = Instant::now();

        if let Preflight::ShortCircuit = self.preflight() {
            return match fallback {
                Some(fallback) => match fallback().await {
                    Ok(result) => FallbackResult {
                        success: true,
                        used_fallback: true,
                        fallback_reason: Some("circuit_open"),
                        original_error: None,
                        result: Some(result),
                        duration: start.elapsed(),
                    },
                    Err(e) => FallbackResult {
                        success: false,
                        used_fallback: true,
                        fallback_reason: Some("circuit_open"),
                        original_error: Some(format!("{e:#}")),
                        result: None,
                        duration: start.elapsed(),
                    },
                },
                None => FallbackResult {
                    success: false,
                    used_fallback: false,
                    fallback_reason: Some("circuit_open_no_fallback"),
                    original_error: None,
                    result: None,
                    duration: start.elapsed(),
                },
            };
        }

        let (error, reason) = match timeout(self.config.call_timeout, operation()).await {
            Ok(Ok(result)) => {
                self.record_success();
                return FallbackResult {
                    success: true,
                    used_fallback: false,
                    fallback_reason: None,
                    original_error: None,
                    result: Some(result),
                    duration: start.elapsed(),
                };
            }
            Ok(Err(e)) => {
                self.record_failure();
                (format!("{e:#}"), "exception")
            }
            Err(_) => {
                self.record_failure();
                (
                    format!("operation timed out after {:?}", self.config.call_timeout),
                    "timeout",
                )
            }
        };

        // The failure may have tripped the breaker; if so, the fallback
        // covers this call as well.
        if self.state() == CircuitState::Open {
            if let Some(fallback) = fallback {
                if let Ok(result) = fallback().await {
                    return FallbackResult {
                        success: true,
                        used_fallback: true,
                        fallback_reason: Some(reason),
                        original_error: Some(error),
                        result: Some(result),
                        duration: start.elapsed(),
                    };
                }
            }
        }

        FallbackResult {
            success: false,
            used_fallback: false,
            fallback_reason: None,
            original_error: Some(error),
            result: None,
            duration: start.elapsed(),
        }
    }

    fn preflight(&self) -> Preflight {
        let mut inner = self.inner.lock().unwrap();
        if inner.state != CircuitState::Open {
            return Preflight::Proceed;
        }
        let reset_due = inner
            .last_failure
            .is_none_or(|last| last.elapsed() >= self.config.reset_timeout);
        if reset_due {
            self.transition_to(&mut inner, CircuitState::HalfOpen);
            Preflight::Proceed
        } else {
            Preflight::ShortCircuit
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.state == CircuitState::HalfOpen {
            inner.success_count += 1;
            if inner.success_count >= self.config.success_threshold {
                self.transition_to(&mut inner, CircuitState::Closed);
            }
        } else {
            inner.failure_count = 0;
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());
        inner.success_count = 0;
        if inner.state == CircuitState::HalfOpen
            || inner.failure_count >= self.config.failure_threshold
        {
            self.transition_to(&mut inner, CircuitState::Open);
        }
    }

    fn transition_to(&self, inner: &mut Inner, new_state: CircuitState) {
        let old_state = inner.state;
        if old_state == new_state {
            return;
        }
        inner.state = new_state;
        inner.last_state_change = Instant::now();
        match new_state {
            CircuitState::Closed => {
                inner.failure_count = 0;
                inner.success_count = 0;
            }
            CircuitState::HalfOpen => inner.success_count = 0,
            CircuitState::Open => {}
        }
        tracing::info!(
            "Circuit breaker '{}' transitioned: {} -> {}",
            self.name,
            old_state.as_str(),
            new_state.as_str(),
        );
    }
}

/// Point-in-time view of a breaker for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use anyhow::{anyhow, bail};

    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(60),
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let result: FallbackResult<()> =
            breaker.call(|| async { bail!("dependency down") }).await;
        assert!(!result.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_failure_threshold() {
        let breaker = CircuitBreaker::new("deps", config());
        for _ in 0..2 {
            fail(&breaker).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_short_circuits_without_invoking() {
        let breaker = CircuitBreaker::new("deps", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let calls = AtomicU32::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await;
        assert!(!result.success);
        assert_eq!(result.fallback_reason, Some("circuit_open_no_fallback"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_used_when_open() {
        let breaker = CircuitBreaker::new("deps", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        let result = breaker
            .call_with_fallback(|| async { Ok("live") }, || async { Ok("cached") })
            .await;
        assert!(result.success);
        assert!(result.used_fallback);
        assert_eq!(result.result, Some("cached"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_closes_after_successes() {
        let breaker = CircuitBreaker::new("deps", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        let result = breaker.call(|| async { Ok(1) }).await;
        assert!(result.success);
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let result = breaker.call(|| async { Ok(2) }).await;
        assert!(result.success);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_reopens_on_failure() {
        let breaker = CircuitBreaker::new("deps", config());
        for _ in 0..3 {
            fail(&breaker).await;
        }
        tokio::time::advance(Duration::from_secs(61)).await;

        breaker.call(|| async { Ok(1) }).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        fail(&breaker).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failure() {
        let breaker = CircuitBreaker::new("deps", CircuitBreakerConfig {
            call_timeout: Duration::from_millis(50),
            ..config()
        });
        let result: FallbackResult<()> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(())
            })
            .await;
        assert!(!result.success);
        assert!(result.original_error.unwrap().contains("timed out"));
        assert_eq!(breaker.snapshot().failure_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new("deps", config());
        fail(&breaker).await;
        fail(&breaker).await;
        let result = breaker.call(|| async { Ok(()) }).await;
        assert!(result.success);
        assert_eq!(breaker.snapshot().failure_count, 0);
        let result = breaker.call(|| async { Err::<(), _>(anyhow!("nope")) }).await;
        assert!(!result.success);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }
}
