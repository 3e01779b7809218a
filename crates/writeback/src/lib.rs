mod api;
mod check_run;
mod comment;
mod gate;
mod retry;
mod status;

pub use api::{OctocrabClient, ProviderClient, StaticTokenProvider, TokenProvider, WriteTarget};
pub use check_run::{
    Annotation, AnnotationLevel, CheckRunConclusion, CheckRunOutput, CheckRunResult,
    CheckRunStatus, CheckRunWriter, MAX_ANNOTATIONS,
};
pub use comment::{CommentResult, CommentWriter};
pub use gate::{CHECK_NAME, GateWriteback};
pub use retry::RetryPolicy;
pub use status::{CommitStatusState, StatusResult, StatusWriter};

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::{
        Mutex,
        atomic::{AtomicU32, AtomicU64, Ordering},
    };

    use anyhow::bail;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use uuid::Uuid;

    use crate::api::{ProviderClient, TokenProvider};

    #[derive(Debug, Clone)]
    pub struct RecordedCall {
        pub method: &'static str,
        pub route: String,
        pub body: Value,
    }

    /// Provider client that records every request and can fail the first N
    /// of them with a transport error.
    pub struct MockClient {
        calls: Mutex<Vec<RecordedCall>>,
        failures_left: AtomicU32,
        next_id: AtomicU64,
    }

    impl MockClient {
        pub fn new() -> Self { Self::failing(0) }

        pub fn failing(failures: u32) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                failures_left: AtomicU32::new(failures),
                next_id: AtomicU64::new(1),
            }
        }

        pub fn calls(&self) -> Vec<RecordedCall> { self.calls.lock().unwrap().clone() }

        fn maybe_fail(&self) -> anyhow::Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                bail!("503 Service Unavailable");
            }
            Ok(())
        }

        fn record(&self, method: &'static str, route: &str, body: Value) {
            self.calls.lock().unwrap().push(RecordedCall {
                method,
                route: route.to_string(),
                body,
            });
        }
    }

    #[async_trait]
    impl ProviderClient for MockClient {
        async fn post(&self, _token: &str, route: &str, body: &Value) -> anyhow::Result<Value> {
            self.maybe_fail()?;
            self.record("POST", route, body.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(json!({
                "id": id,
                "html_url": format!("https://example.invalid/{route}/{id}"),
                "url": format!("https://example.invalid/{route}/{id}"),
            }))
        }

        async fn patch(&self, _token: &str, route: &str, body: &Value) -> anyhow::Result<Value> {
            self.maybe_fail()?;
            self.record("PATCH", route, body.clone());
            Ok(json!({ "html_url": format!("https://example.invalid/{route}") }))
        }

        async fn delete(&self, _token: &str, route: &str) -> anyhow::Result<()> {
            self.maybe_fail()?;
            self.record("DELETE", route, Value::Null);
            Ok(())
        }
    }

    pub struct MockTokens;

    #[async_trait]
    impl TokenProvider for MockTokens {
        async fn token(&self, _org_id: Uuid) -> anyhow::Result<String> {
            Ok("test-token".to_string())
        }
    }
}
