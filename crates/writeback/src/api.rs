use anyhow::Context;
use async_trait::async_trait;
use octocrab::Octocrab;
use serde_json::Value;
use uuid::Uuid;

/// REST capability for provider write-back calls. Routes are
/// provider-relative (`/repos/{owner}/{repo}/check-runs`); authentication is
/// per call so installation tokens can rotate between requests.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn post(&self, token: &str, route: &str, body: &Value) -> anyhow::Result<Value>;

    async fn patch(&self, token: &str, route: &str, body: &Value) -> anyhow::Result<Value>;

    async fn delete(&self, token: &str, route: &str) -> anyhow::Result<()>;
}

/// Capability for resolving the bearer token to write back as a tenant.
/// Implementations own the org-to-installation mapping.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn token(&self, org_id: Uuid) -> anyhow::Result<String>;
}

/// Token provider for single-token deployments (a personal access token or
/// a pre-issued installation token shared by all tenants).
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self { Self { token: token.into() } }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn token(&self, _org_id: Uuid) -> anyhow::Result<String> { Ok(self.token.clone()) }
}

/// Production [`ProviderClient`] backed by octocrab. A client is built per
/// call because the token differs per tenant.
pub struct OctocrabClient;

impl OctocrabClient {
    fn client(token: &str) -> anyhow::Result<Octocrab> {
        Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .context("Failed to build provider client")
    }
}

#[async_trait]
impl ProviderClient for OctocrabClient {
    async fn post(&self, token: &str, route: &str, body: &Value) -> anyhow::Result<Value> {
        let client = Self::client(token)?;
        let response: Value =
            client.post(route, Some(body)).await.with_context(|| format!("POST {route}"))?;
        Ok(response)
    }

    async fn patch(&self, token: &str, route: &str, body: &Value) -> anyhow::Result<Value> {
        let client = Self::client(token)?;
        let response: Value =
            client.patch(route, Some(body)).await.with_context(|| format!("PATCH {route}"))?;
        Ok(response)
    }

    async fn delete(&self, token: &str, route: &str) -> anyhow::Result<()> {
        let client = Self::client(token)?;
        let response = client
            ._delete(route, None::<&()>)
            .await
            .with_context(|| format!("DELETE {route}"))?;
        anyhow::ensure!(
            response.status().is_success(),
            "DELETE {route} returned {}",
            response.status(),
        );
        Ok(())
    }
}

/// Identifies where an artifact is written: the tenant (for token lookup)
/// and the repository.
#[derive(Debug, Clone)]
pub struct WriteTarget {
    pub org_id: Uuid,
    /// Repository full name (`owner/repo`).
    pub repo: String,
}
