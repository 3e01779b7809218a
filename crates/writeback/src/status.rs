use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::{
    api::{ProviderClient, TokenProvider, WriteTarget},
    retry::RetryPolicy,
};

/// Provider limit on commit status descriptions.
const MAX_DESCRIPTION: usize = 140;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitStatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CommitStatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
        }
    }
}

/// Result of creating a commit status.
#[derive(Debug, Clone)]
pub struct StatusResult {
    pub status_id: u64,
    pub url: String,
    pub state: CommitStatusState,
}

/// One-shot commit status writer. Works on providers without a checks API;
/// prefer the check-run writer where available.
pub struct StatusWriter {
    client: Arc<dyn ProviderClient>,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
}

impl StatusWriter {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        tokens: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self { client, tokens, retry }
    }

    pub async fn create_status(
        &self,
        target: &WriteTarget,
        sha: &str,
        state: CommitStatusState,
        context: &str,
        description: &str,
        target_url: Option<&str>,
    ) -> anyhow::Result<StatusResult> {
        let mut payload = Map::new();
        payload.insert("state".to_string(), state.as_str().into());
        payload.insert("context".to_string(), context.into());
        payload.insert(
            "description".to_string(),
            description.chars().take(MAX_DESCRIPTION).collect::<String>().into(),
        );
        if let Some(target_url) = target_url {
            payload.insert("target_url".to_string(), target_url.into());
        }

        let token = self.tokens.token(target.org_id).await?;
        let route = format!("/repos/{}/statuses/{sha}", target.repo);
        let payload = Value::Object(payload);
        let response = self
            .retry
            .run("create status", || self.client.post(&token, &route, &payload))
            .await?;

        tracing::info!(
            "Status created: repo={} sha={sha} context={context} state={}",
            target.repo,
            state.as_str(),
        );

        Ok(StatusResult {
            status_id: response["id"].as_u64().unwrap_or_default(),
            url: response["url"].as_str().unwrap_or_default().to_string(),
            state,
        })
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::mock::{MockClient, MockTokens};

    #[tokio::test]
    async fn test_create_status_truncates_description() {
        let client = Arc::new(MockClient::new());
        let writer =
            StatusWriter::new(client.clone(), Arc::new(MockTokens), RetryPolicy::default());
        let target = WriteTarget { org_id: Uuid::new_v4(), repo: "acme/widgets".to_string() };
        let long = "x".repeat(300);
        let result = writer
            .create_status(&target, "abc123", CommitStatusState::Failure, "mergegate", &long, None)
            .await
            .unwrap();
        assert_eq!(result.state, CommitStatusState::Failure);
        let calls = client.calls();
        assert_eq!(calls[0].route, "/repos/acme/widgets/statuses/abc123");
        assert_eq!(calls[0].body["description"].as_str().unwrap().len(), 140);
    }
}
