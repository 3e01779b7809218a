mod nonce;
mod providers;
mod rate_limit;

use std::{sync::Arc, time::Duration};

use hmac::{Hmac, Mac};
use http::HeaderMap;
use mergegate_core::{
    EventPublisher,
    config::WebhookConfig,
    models::{Provider, VerificationMethod, WebhookEvent},
};
use sha1::Sha1;
use sha2::{Digest, Sha256};

pub use nonce::{MemoryNonceStore, NonceStore};
pub use rate_limit::{MemoryRateLimiter, RateLimiter};

const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Validation failures for inbound deliveries. None of these are retried
/// here; the provider redelivers on a non-2xx response.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("malformed {0} header")]
    MalformedHeader(&'static str),

    #[error("no webhook secret configured for {0}")]
    MissingSecret(Provider),

    #[error("webhook signature mismatch")]
    SignatureMismatch,

    #[error("replayed delivery: {delivery_id}")]
    Replay { delivery_id: String },

    #[error("rate limit exceeded for {key}")]
    RateLimited { key: String },

    #[error("invalid JSON payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Validates and normalizes inbound provider webhooks.
///
/// Checks run in a fixed order: size cap, signature, anti-replay, rate
/// limit, then payload normalization. Nothing is published until every
/// check passes.
pub struct WebhookReceiver {
    config: WebhookConfig,
    nonce_store: Arc<dyn NonceStore>,
    rate_limiter: Arc<dyn RateLimiter>,
    publisher: Arc<dyn EventPublisher>,
}

impl WebhookReceiver {
    pub fn new(
        config: WebhookConfig,
        nonce_store: Arc<dyn NonceStore>,
        rate_limiter: Arc<dyn RateLimiter>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self { config, nonce_store, rate_limiter, publisher }
    }

    pub fn nonce_store(&self) -> Arc<dyn NonceStore> { self.nonce_store.clone() }

    /// Receive a raw delivery, returning the verified canonical event.
    pub async fn receive(
        &self,
        provider: Provider,
        headers: &HeaderMap,
        body: &[u8],
        secret: Option<&str>,
    ) -> Result<WebhookEvent, WebhookError> {
        if body.len() > self.config.max_payload_bytes {
            return Err(WebhookError::PayloadTooLarge {
                size: body.len(),
                max: self.config.max_payload_bytes,
            });
        }

        let method = verify_signature(provider, headers, body, secret)?;

        let delivery_id = providers::delivery_id(provider, headers);
        match &delivery_id {
            Some(id) => {
                let ttl = Duration::from_secs(self.config.replay_window_seconds);
                if !self.nonce_store.check_and_store(id, ttl).await? {
                    return Err(WebhookError::Replay { delivery_id: id.clone() });
                }
            }
            None => {
                tracing::warn!("Webhook from {provider} without a delivery id, skipping replay check");
            }
        }

        let rate_key = providers::rate_limit_key(provider, headers);
        let (allowed, _remaining) = self
            .rate_limiter
            .check(&rate_key, self.config.rate_limit_per_minute, RATE_WINDOW)
            .await?;
        if !allowed {
            return Err(WebhookError::RateLimited { key: rate_key });
        }

        let payload: serde_json::Value = serde_json::from_slice(body)?;
        let mut event = providers::parse_event(provider, headers, payload);
        event.delivery_id = delivery_id.unwrap_or_default();
        event.is_verified = true;
        event.verification_method = Some(method);

        let payload =
            serde_json::to_value(&event).map_err(|e| WebhookError::Internal(e.into()))?;
        self.publisher.publish("webhook.received", payload).await?;

        tracing::info!(
            "Received webhook: provider={} type={} repo={} delivery={}",
            provider,
            event.event_type,
            event.repo_full_name,
            event.delivery_id,
        );

        Ok(event)
    }
}

fn verify_signature(
    provider: Provider,
    headers: &HeaderMap,
    body: &[u8],
    secret: Option<&str>,
) -> Result<VerificationMethod, WebhookError> {
    match provider {
        Provider::GitHub => {
            if let Some(value) = header(headers, "X-Hub-Signature-256") {
                let signature = decode_signature(value, "sha256=", "X-Hub-Signature-256")?;
                verify_hmac_sha256(body, require_secret(provider, secret)?, &signature)?;
                Ok(VerificationMethod::HmacSha256)
            } else if let Some(value) = header(headers, "X-Hub-Signature") {
                // Legacy SHA-1 signature, still sent by older deployments
                let signature = decode_signature(value, "sha1=", "X-Hub-Signature")?;
                verify_hmac_sha1(body, require_secret(provider, secret)?, &signature)?;
                Ok(VerificationMethod::HmacSha1)
            } else {
                Err(WebhookError::MissingHeader("X-Hub-Signature-256"))
            }
        }
        Provider::GitLab => {
            let token = header(headers, "X-Gitlab-Token")
                .ok_or(WebhookError::MissingHeader("X-Gitlab-Token"))?;
            let secret = require_secret(provider, secret)?;
            // Compare digests of both values so the comparison cannot
            // shortcut on a matching prefix of the raw secret.
            if Sha256::digest(token.as_bytes()) != Sha256::digest(secret.as_bytes()) {
                return Err(WebhookError::SignatureMismatch);
            }
            Ok(VerificationMethod::Token)
        }
        Provider::Bitbucket => {
            let value = header(headers, "X-Hub-Signature")
                .ok_or(WebhookError::MissingHeader("X-Hub-Signature"))?;
            let signature = decode_signature(value, "sha256=", "X-Hub-Signature")?;
            verify_hmac_sha256(body, require_secret(provider, secret)?, &signature)?;
            Ok(VerificationMethod::HmacSha256)
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_secret(provider: Provider, secret: Option<&str>) -> Result<&str, WebhookError> {
    secret.ok_or(WebhookError::MissingSecret(provider))
}

fn decode_signature(
    value: &str,
    prefix: &str,
    name: &'static str,
) -> Result<Vec<u8>, WebhookError> {
    let hex_digest =
        value.strip_prefix(prefix).ok_or(WebhookError::MalformedHeader(name))?;
    hex::decode(hex_digest).map_err(|_| WebhookError::MalformedHeader(name))
}

fn verify_hmac_sha256(body: &[u8], secret: &str, signature: &[u8]) -> Result<(), WebhookError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(signature).map_err(|_| WebhookError::SignatureMismatch)
}

fn verify_hmac_sha1(body: &[u8], secret: &str, signature: &[u8]) -> Result<(), WebhookError> {
    let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(body);
    mac.verify_slice(signature).map_err(|_| WebhookError::SignatureMismatch)
}

#[cfg(test)]
mod tests {
    use mergegate_core::MemoryEventPublisher;
    use mergegate_core::models::WebhookEventType;
    use serde_json::json;

    use super::*;

    const SECRET: &str = "hunter2";

    fn sign_sha256(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn sign_sha1(secret: &str, body: &[u8]) -> String {
        let mut mac = Hmac::<Sha1>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha1={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn receiver(config: WebhookConfig) -> (WebhookReceiver, Arc<MemoryEventPublisher>) {
        let publisher = Arc::new(MemoryEventPublisher::default());
        let receiver = WebhookReceiver::new(
            config,
            Arc::new(MemoryNonceStore::new()),
            Arc::new(MemoryRateLimiter::new()),
            publisher.clone(),
        );
        (receiver, publisher)
    }

    fn github_headers(body: &[u8], delivery_id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", "pull_request".parse().unwrap());
        headers.insert("X-GitHub-Delivery", delivery_id.parse().unwrap());
        headers.insert("X-Hub-Signature-256", sign_sha256(SECRET, body).parse().unwrap());
        headers
    }

    fn pr_body() -> Vec<u8> {
        json!({
            "action": "opened",
            "repository": {"full_name": "acme/widgets", "id": 42},
            "pull_request": {"number": 3, "head": {"sha": "abc123"}, "base": {"sha": "def456"}},
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn test_receive_github() {
        let (receiver, publisher) = receiver(WebhookConfig::default());
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        let event =
            receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap();
        assert!(event.is_verified);
        assert_eq!(event.verification_method, Some(VerificationMethod::HmacSha256));
        assert_eq!(event.event_type, WebhookEventType::PullRequestOpened);
        assert_eq!(event.delivery_id, "delivery-1");
        assert_eq!(publisher.event_types(), vec!["webhook.received".to_string()]);
    }

    #[tokio::test]
    async fn test_tampered_body_rejected() {
        let (receiver, publisher) = receiver(WebhookConfig::default());
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        let mut tampered = body.clone();
        tampered.extend_from_slice(b" ");
        let err = receiver
            .receive(Provider::GitHub, &headers, &tampered, Some(SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::SignatureMismatch));
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_sha1_fallback() {
        let (receiver, _) = receiver(WebhookConfig::default());
        let body = pr_body();
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", "pull_request".parse().unwrap());
        headers.insert("X-GitHub-Delivery", "delivery-1".parse().unwrap());
        headers.insert("X-Hub-Signature", sign_sha1(SECRET, &body).parse().unwrap());
        let event =
            receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap();
        assert_eq!(event.verification_method, Some(VerificationMethod::HmacSha1));
    }

    #[tokio::test]
    async fn test_missing_signature_header() {
        let (receiver, _) = receiver(WebhookConfig::default());
        let body = pr_body();
        let mut headers = HeaderMap::new();
        headers.insert("X-GitHub-Event", "pull_request".parse().unwrap());
        let err =
            receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap_err();
        assert!(matches!(err, WebhookError::MissingHeader("X-Hub-Signature-256")));
    }

    #[tokio::test]
    async fn test_missing_secret() {
        let (receiver, _) = receiver(WebhookConfig::default());
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        let err = receiver.receive(Provider::GitHub, &headers, &body, None).await.unwrap_err();
        assert!(matches!(err, WebhookError::MissingSecret(Provider::GitHub)));
    }

    #[tokio::test]
    async fn test_gitlab_token() {
        let (receiver, _) = receiver(WebhookConfig::default());
        let body = json!({"object_kind": "push", "after": "abc", "before": "def",
            "ref": "refs/heads/main", "project": {"path_with_namespace": "acme/widgets", "id": 9}})
            .to_string()
            .into_bytes();
        let mut headers = HeaderMap::new();
        headers.insert("X-Gitlab-Token", SECRET.parse().unwrap());
        headers.insert("X-Gitlab-Event-UUID", "uuid-1".parse().unwrap());
        let event =
            receiver.receive(Provider::GitLab, &headers, &body, Some(SECRET)).await.unwrap();
        assert_eq!(event.verification_method, Some(VerificationMethod::Token));

        headers.insert("X-Gitlab-Token", "wrong".parse().unwrap());
        headers.insert("X-Gitlab-Event-UUID", "uuid-2".parse().unwrap());
        let err =
            receiver.receive(Provider::GitLab, &headers, &body, Some(SECRET)).await.unwrap_err();
        assert!(matches!(err, WebhookError::SignatureMismatch));
    }

    #[tokio::test]
    async fn test_payload_too_large() {
        let config = WebhookConfig { max_payload_bytes: 16, ..Default::default() };
        let (receiver, publisher) = receiver(config);
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        let err =
            receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap_err();
        assert!(matches!(err, WebhookError::PayloadTooLarge { .. }));
        assert!(publisher.events().is_empty());
    }

    #[tokio::test]
    async fn test_replay_rejected() {
        let (receiver, publisher) = receiver(WebhookConfig::default());
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap();
        let err =
            receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap_err();
        assert!(matches!(err, WebhookError::Replay { .. }));
        // Exactly one event made it through
        assert_eq!(publisher.events().len(), 1);
    }

    #[tokio::test]
    async fn test_replay_window_expiry() {
        let config = WebhookConfig { replay_window_seconds: 0, ..Default::default() };
        let (receiver, _) = receiver(config);
        let body = pr_body();
        let headers = github_headers(&body, "delivery-1");
        receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        // Window elapsed, the same delivery id is accepted as new
        receiver.receive(Provider::GitHub, &headers, &body, Some(SECRET)).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limited() {
        let config = WebhookConfig { rate_limit_per_minute: 1, ..Default::default() };
        let (receiver, _) = receiver(config);
        let body = pr_body();
        receiver
            .receive(Provider::GitHub, &github_headers(&body, "delivery-1"), &body, Some(SECRET))
            .await
            .unwrap();
        let err = receiver
            .receive(Provider::GitHub, &github_headers(&body, "delivery-2"), &body, Some(SECRET))
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::RateLimited { .. }));
    }
}
