use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use serde::Serialize;
use serde_json::{Map, Value};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{
    api::{ProviderClient, TokenProvider, WriteTarget},
    retry::RetryPolicy,
};

/// Provider limit on annotations per check-run request.
pub const MAX_ANNOTATIONS: usize = 50;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunStatus {
    Queued,
    InProgress,
    Completed,
}

impl CheckRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckRunConclusion {
    Success,
    Failure,
    Neutral,
    Cancelled,
    Skipped,
    TimedOut,
    ActionRequired,
}

impl CheckRunConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Neutral => "neutral",
            Self::Cancelled => "cancelled",
            Self::Skipped => "skipped",
            Self::TimedOut => "timed_out",
            Self::ActionRequired => "action_required",
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationLevel {
    Notice,
    Warning,
    Failure,
}

/// One file-anchored finding attached to a check run.
#[derive(Debug, Clone, Serialize)]
pub struct Annotation {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub annotation_level: AnnotationLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Rendered output block for a check run.
#[derive(Debug, Clone, Default)]
pub struct CheckRunOutput {
    pub title: String,
    pub summary: String,
    pub text: Option<String>,
    pub annotations: Vec<Annotation>,
}

impl CheckRunOutput {
    fn to_json(&self, annotations: &[Annotation]) -> anyhow::Result<Value> {
        let mut obj = Map::new();
        obj.insert("title".to_string(), self.title.clone().into());
        obj.insert("summary".to_string(), self.summary.clone().into());
        if let Some(text) = &self.text {
            obj.insert("text".to_string(), text.clone().into());
        }
        if !annotations.is_empty() {
            obj.insert("annotations".to_string(), serde_json::to_value(annotations)?);
        }
        Ok(Value::Object(obj))
    }
}

/// Result of creating or updating a check run.
#[derive(Debug, Clone)]
pub struct CheckRunResult {
    pub check_run_id: u64,
    pub url: String,
    pub status: CheckRunStatus,
    pub conclusion: Option<CheckRunConclusion>,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CheckKey {
    repo: String,
    sha: String,
    name: String,
    external_id: String,
}

/// Creates and updates provider check runs. `create_check_run` is
/// idempotent on (repo, sha, name, external id): a repeated call returns
/// the cached id without a network call.
pub struct CheckRunWriter {
    client: Arc<dyn ProviderClient>,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    created: Cache<CheckKey, u64>,
}

impl CheckRunWriter {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        tokens: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
    ) -> Self {
        let created = Cache::builder()
            .max_capacity(16 * 1024)
            .time_to_live(Duration::from_secs(24 * 60 * 60))
            .build();
        Self { client, tokens, retry, created }
    }

    pub async fn create_check_run(
        &self,
        target: &WriteTarget,
        name: &str,
        head_sha: &str,
        status: CheckRunStatus,
        external_id: Option<&str>,
        details_url: Option<&str>,
        output: Option<&CheckRunOutput>,
    ) -> anyhow::Result<CheckRunResult> {
        let key = CheckKey {
            repo: target.repo.clone(),
            sha: head_sha.to_string(),
            name: name.to_string(),
            external_id: external_id.unwrap_or_default().to_string(),
        };
        if let Some(check_run_id) = self.created.get(&key).await {
            tracing::debug!(
                "Check run already created: repo={} sha={} name={name} id={check_run_id}",
                target.repo,
                head_sha,
            );
            return Ok(CheckRunResult {
                check_run_id,
                url: String::new(),
                status,
                conclusion: None,
            });
        }

        let mut payload = Map::new();
        payload.insert("name".to_string(), name.into());
        payload.insert("head_sha".to_string(), head_sha.into());
        payload.insert("status".to_string(), status.as_str().into());
        if let Some(external_id) = external_id {
            payload.insert("external_id".to_string(), external_id.into());
        }
        if let Some(details_url) = details_url {
            payload.insert("details_url".to_string(), details_url.into());
        }
        if status == CheckRunStatus::InProgress {
            payload.insert("started_at".to_string(), now_rfc3339().into());
        }
        if let Some(output) = output {
            payload.insert(
                "output".to_string(),
                output.to_json(&output.annotations[..output.annotations.len().min(MAX_ANNOTATIONS)])?,
            );
        }

        let token = self.tokens.token(target.org_id).await?;
        let route = format!("/repos/{}/check-runs", target.repo);
        let payload = Value::Object(payload);
        let response = self
            .retry
            .run("create check run", || self.client.post(&token, &route, &payload))
            .await?;

        let check_run_id = response["id"].as_u64().unwrap_or_default();
        self.created.insert(key, check_run_id).await;

        tracing::info!(
            "Check run created: repo={} sha={} name={name} id={check_run_id}",
            target.repo,
            head_sha,
        );

        Ok(CheckRunResult {
            check_run_id,
            url: response["html_url"].as_str().unwrap_or_default().to_string(),
            status,
            conclusion: None,
        })
    }

    pub async fn update_check_run(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        status: Option<CheckRunStatus>,
        conclusion: Option<CheckRunConclusion>,
        output: Option<&CheckRunOutput>,
        details_url: Option<&str>,
    ) -> anyhow::Result<CheckRunResult> {
        let mut payload = Map::new();
        if let Some(status) = status {
            payload.insert("status".to_string(), status.as_str().into());
        }
        if let Some(conclusion) = conclusion {
            // A conclusion always completes the run
            payload.insert("status".to_string(), CheckRunStatus::Completed.as_str().into());
            payload.insert("conclusion".to_string(), conclusion.as_str().into());
            payload.insert("completed_at".to_string(), now_rfc3339().into());
        }
        if let Some(details_url) = details_url {
            payload.insert("details_url".to_string(), details_url.into());
        }
        if let Some(output) = output {
            payload.insert(
                "output".to_string(),
                output.to_json(&output.annotations[..output.annotations.len().min(MAX_ANNOTATIONS)])?,
            );
        }

        let token = self.tokens.token(target.org_id).await?;
        let route = format!("/repos/{}/check-runs/{check_run_id}", target.repo);
        let payload = Value::Object(payload);
        let response = self
            .retry
            .run("update check run", || self.client.patch(&token, &route, &payload))
            .await?;

        tracing::info!(
            "Check run updated: repo={} id={check_run_id} status={status:?} conclusion={conclusion:?}",
            target.repo,
        );

        Ok(CheckRunResult {
            check_run_id,
            url: response["html_url"].as_str().unwrap_or_default().to_string(),
            status: if conclusion.is_some() {
                CheckRunStatus::Completed
            } else {
                status.unwrap_or(CheckRunStatus::Completed)
            },
            conclusion,
        })
    }

    /// Complete a check run with a conclusion. Annotations beyond the
    /// per-request maximum are sent as follow-up updates.
    pub async fn complete_check_run(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        conclusion: CheckRunConclusion,
        output: Option<&CheckRunOutput>,
    ) -> anyhow::Result<CheckRunResult> {
        let result = self
            .update_check_run(target, check_run_id, None, Some(conclusion), output, None)
            .await?;
        if let Some(output) = output {
            if output.annotations.len() > MAX_ANNOTATIONS {
                self.add_annotations(
                    target,
                    check_run_id,
                    &output.title,
                    &output.summary,
                    &output.annotations[MAX_ANNOTATIONS..],
                )
                .await?;
            }
        }
        Ok(result)
    }

    /// Attach annotations in batches of [`MAX_ANNOTATIONS`].
    pub async fn add_annotations(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        title: &str,
        summary: &str,
        annotations: &[Annotation],
    ) -> anyhow::Result<()> {
        for batch in annotations.chunks(MAX_ANNOTATIONS) {
            let output = CheckRunOutput {
                title: title.to_string(),
                summary: summary.to_string(),
                text: None,
                annotations: batch.to_vec(),
            };
            self.update_check_run(target, check_run_id, None, None, Some(&output), None)
                .await?;
        }
        Ok(())
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::mock::{MockClient, MockTokens};

    fn writer(client: Arc<MockClient>) -> CheckRunWriter {
        CheckRunWriter::new(client, Arc::new(MockTokens), RetryPolicy::default())
    }

    fn target() -> WriteTarget {
        WriteTarget { org_id: Uuid::new_v4(), repo: "acme/widgets".to_string() }
    }

    fn annotation(i: usize) -> Annotation {
        Annotation {
            path: "src/lib.rs".to_string(),
            start_line: i as u32,
            end_line: i as u32,
            annotation_level: AnnotationLevel::Warning,
            message: format!("finding {i}"),
            title: None,
        }
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let client = Arc::new(MockClient::new());
        let writer = writer(client.clone());
        let target = target();

        let first = writer
            .create_check_run(
                &target,
                "mergegate",
                "abc123",
                CheckRunStatus::InProgress,
                Some("run-1"),
                None,
                None,
            )
            .await
            .unwrap();
        let second = writer
            .create_check_run(
                &target,
                "mergegate",
                "abc123",
                CheckRunStatus::InProgress,
                Some("run-1"),
                None,
                None,
            )
            .await
            .unwrap();

        assert_eq!(first.check_run_id, second.check_run_id);
        // One network call for two create requests
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_create_separately() {
        let client = Arc::new(MockClient::new());
        let writer = writer(client.clone());
        let target = target();

        let a = writer
            .create_check_run(&target, "mergegate", "abc123", CheckRunStatus::Queued, Some("run-1"), None, None)
            .await
            .unwrap();
        let b = writer
            .create_check_run(&target, "mergegate", "abc123", CheckRunStatus::Queued, Some("run-2"), None, None)
            .await
            .unwrap();
        assert_ne!(a.check_run_id, b.check_run_id);
        assert_eq!(client.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_retries_transport_errors() {
        let client = Arc::new(MockClient::failing(2));
        let writer = writer(client.clone());
        let result = writer
            .create_check_run(&target(), "mergegate", "abc123", CheckRunStatus::Queued, None, None, None)
            .await
            .unwrap();
        assert!(result.check_run_id > 0);
        assert_eq!(client.calls().len(), 3);
    }

    #[tokio::test]
    async fn test_complete_sets_conclusion() {
        let client = Arc::new(MockClient::new());
        let writer = writer(client.clone());
        let result = writer
            .complete_check_run(&target(), 99, CheckRunConclusion::Success, None)
            .await
            .unwrap();
        assert_eq!(result.status, CheckRunStatus::Completed);
        assert_eq!(result.conclusion, Some(CheckRunConclusion::Success));
        let calls = client.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].method, "PATCH");
        assert_eq!(calls[0].body["status"], "completed");
        assert_eq!(calls[0].body["conclusion"], "success");
        assert!(calls[0].body["completed_at"].is_string());
    }

    #[tokio::test]
    async fn test_annotations_chunked_to_fifty() {
        let client = Arc::new(MockClient::new());
        let writer = writer(client.clone());
        let output = CheckRunOutput {
            title: "Findings".to_string(),
            summary: "120 findings".to_string(),
            text: None,
            annotations: (0..120).map(annotation).collect(),
        };
        writer
            .complete_check_run(&target(), 99, CheckRunConclusion::Failure, Some(&output))
            .await
            .unwrap();

        // Completing update carries 50, then two follow-up batches of 50/20
        let calls = client.calls();
        assert_eq!(calls.len(), 3);
        let lens: Vec<usize> = calls
            .iter()
            .map(|c| c.body["output"]["annotations"].as_array().map_or(0, Vec::len))
            .collect();
        assert_eq!(lens, vec![50, 50, 20]);
    }
}
