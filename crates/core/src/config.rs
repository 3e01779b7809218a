use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{DegradationMode, Provider};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub github: Option<GitHubConfig>,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub runs: RunConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub writeback: WritebackConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DbConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    /// Token used for provider API write-back when no GitHub App installation
    /// token flow is configured.
    pub token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookConfig {
    #[serde(default = "default_replay_window_seconds")]
    pub replay_window_seconds: u64,
    #[serde(default = "default_rate_limit_per_minute")]
    pub rate_limit_per_minute: u32,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
    #[serde(default)]
    pub secrets: WebhookSecrets,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            replay_window_seconds: default_replay_window_seconds(),
            rate_limit_per_minute: default_rate_limit_per_minute(),
            max_payload_bytes: default_max_payload_bytes(),
            secrets: WebhookSecrets::default(),
        }
    }
}

/// Per-provider webhook secrets. A provider without a secret configured
/// rejects all deliveries.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookSecrets {
    pub github: Option<String>,
    pub gitlab: Option<String>,
    pub bitbucket: Option<String>,
}

impl WebhookSecrets {
    pub fn for_provider(&self, provider: Provider) -> Option<&str> {
        match provider {
            Provider::GitHub => self.github.as_deref(),
            Provider::GitLab => self.gitlab.as_deref(),
            Provider::Bitbucket => self.bitbucket.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RunConfig {
    #[serde(default = "default_run_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_run_timeout_seconds(),
            max_attempts: default_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResilienceConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_call_timeout_seconds")]
    pub call_timeout_seconds: u64,
    #[serde(default = "default_reset_timeout_seconds")]
    pub reset_timeout_seconds: u64,
    #[serde(default = "default_health_timeout_seconds")]
    pub health_timeout_seconds: u64,
    #[serde(default = "default_health_failure_threshold")]
    pub health_failure_threshold: u32,
    #[serde(default)]
    pub default_mode: DegradationMode,
    /// Per-tenant overrides of the degradation mode.
    #[serde(default)]
    pub org_modes: HashMap<Uuid, DegradationMode>,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            call_timeout_seconds: default_call_timeout_seconds(),
            reset_timeout_seconds: default_reset_timeout_seconds(),
            health_timeout_seconds: default_health_timeout_seconds(),
            health_failure_threshold: default_health_failure_threshold(),
            default_mode: DegradationMode::default(),
            org_modes: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WritebackConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for WritebackConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_replay_window_seconds() -> u64 { 300 }

fn default_rate_limit_per_minute() -> u32 { 1000 }

fn default_max_payload_bytes() -> usize { 10 * 1024 * 1024 }

fn default_run_timeout_seconds() -> u64 { 600 }

fn default_max_attempts() -> u32 { 3 }

fn default_failure_threshold() -> u32 { 5 }

fn default_success_threshold() -> u32 { 3 }

fn default_call_timeout_seconds() -> u64 { 30 }

fn default_reset_timeout_seconds() -> u64 { 60 }

fn default_health_timeout_seconds() -> u64 { 10 }

fn default_health_failure_threshold() -> u32 { 3 }

fn default_max_retries() -> u32 { 3 }

fn default_base_delay_ms() -> u64 { 1000 }

fn default_max_delay_ms() -> u64 { 30000 }
