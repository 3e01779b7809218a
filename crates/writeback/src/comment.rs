use std::{sync::Arc, time::Duration};

use moka::future::Cache;
use serde_json::json;

use crate::{
    api::{ProviderClient, TokenProvider, WriteTarget},
    retry::RetryPolicy,
};

/// Result of creating or updating a PR comment.
#[derive(Debug, Clone)]
pub struct CommentResult {
    pub comment_id: u64,
    pub url: String,
}

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct CommentKey {
    repo: String,
    pr_number: u64,
    key: String,
}

/// Create-or-update writer for PR comments. A hidden marker embedded in the
/// body identifies our comment on later calls, so each logical key maps to
/// one comment per pull request.
pub struct CommentWriter {
    client: Arc<dyn ProviderClient>,
    tokens: Arc<dyn TokenProvider>,
    retry: RetryPolicy,
    created: Cache<CommentKey, u64>,
}

impl CommentWriter {
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

    fn marker(comment_key: &str) -> String { format!("<!-- mergegate:{comment_key} -->") }

    pub async fn create_or_update_comment(
        &self,
        target: &WriteTarget,
        pr_number: u64,
        body: &str,
        comment_key: &str,
    ) -> anyhow::Result<CommentResult> {
        let full_body = format!("{}\n{body}", Self::marker(comment_key));
        let payload = json!({ "body": full_body });
        let token = self.tokens.token(target.org_id).await?;

        let cache_key = CommentKey {
            repo: target.repo.clone(),
            pr_number,
            key: comment_key.to_string(),
        };
        if let Some(comment_id) = self.created.get(&cache_key).await {
            let route =
                format!("/repos/{}/issues/comments/{comment_id}", target.repo);
            let response = self
                .retry
                .run("update comment", || self.client.patch(&token, &route, &payload))
                .await?;
            tracing::info!(
                "Comment updated: repo={} pr={pr_number} id={comment_id}",
                target.repo,
            );
            return Ok(CommentResult {
                comment_id,
                url: response["html_url"].as_str().unwrap_or_default().to_string(),
            });
        }

        let route = format!("/repos/{}/issues/{pr_number}/comments", target.repo);
        let response = self
            .retry
            .run("create comment", || self.client.post(&token, &route, &payload))
            .await?;
        let comment_id = response["id"].as_u64().unwrap_or_default();
        self.created.insert(cache_key, comment_id).await;

        tracing::info!("Comment created: repo={} pr={pr_number} id={comment_id}", target.repo);

        Ok(CommentResult {
            comment_id,
            url: response["html_url"].as_str().unwrap_or_default().to_string(),
        })
    }

    pub async fn delete_comment(
        &self,
        target: &WriteTarget,
        pr_number: u64,
        comment_key: &str,
        comment_id: u64,
    ) -> anyhow::Result<()> {
        let token = self.tokens.token(target.org_id).await?;
        let route = format!("/repos/{}/issues/comments/{comment_id}", target.repo);
        self.retry.run("delete comment", || self.client.delete(&token, &route)).await?;
        self.created
            .invalidate(&CommentKey {
                repo: target.repo.clone(),
                pr_number,
                key: comment_key.to_string(),
            })
            .await;
        tracing::info!("Comment deleted: repo={} pr={pr_number} id={comment_id}", target.repo);
        Ok(())
    }
}
