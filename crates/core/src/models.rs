use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::UtcDateTime;
use uuid::Uuid;

/// Git hosting providers we accept webhooks from.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
    Bitbucket,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitHub => "github",
            Self::GitLab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }
}

impl FromStr for Provider {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(Self::GitHub),
            "gitlab" => Ok(Self::GitLab),
            "bitbucket" => Ok(Self::Bitbucket),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Canonical event vocabulary across providers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WebhookEventType {
    PullRequestOpened,
    PullRequestSynchronize,
    PullRequestClosed,
    PullRequestReopened,
    PullRequestMerged,
    Push,
    CheckSuiteRequested,
    CheckRunRequested,
    CheckRunRerequested,
    PullRequestReview,
    PullRequestReviewComment,
    IssueComment,
    InstallationCreated,
    InstallationDeleted,
    #[default]
    Unknown,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PullRequestOpened => "pull_request.opened",
            Self::PullRequestSynchronize => "pull_request.synchronize",
            Self::PullRequestClosed => "pull_request.closed",
            Self::PullRequestReopened => "pull_request.reopened",
            Self::PullRequestMerged => "pull_request.merged",
            Self::Push => "push",
            Self::CheckSuiteRequested => "check_suite.requested",
            Self::CheckRunRequested => "check_run.requested",
            Self::CheckRunRerequested => "check_run.rerequested",
            Self::PullRequestReview => "pull_request_review",
            Self::PullRequestReviewComment => "pull_request_review_comment",
            Self::IssueComment => "issue_comment",
            Self::InstallationCreated => "installation.created",
            Self::InstallationDeleted => "installation.deleted",
            Self::Unknown => "unknown",
        }
    }

    /// Whether this event should dispatch a gate run for its head commit.
    pub fn requests_gate(&self) -> bool {
        matches!(
            self,
            Self::PullRequestOpened
                | Self::PullRequestSynchronize
                | Self::PullRequestReopened
                | Self::CheckSuiteRequested
                | Self::CheckRunRequested
                | Self::CheckRunRerequested
        )
    }
}

impl fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// How an inbound webhook was authenticated.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    HmacSha256,
    HmacSha1,
    Token,
}

/// Normalized representation of a provider notification.
///
/// Immutable once constructed; created once per inbound delivery and retained
/// for audit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub event_type: WebhookEventType,
    pub provider: Provider,
    pub delivery_id: String,
    pub received_at: UtcDateTime,

    // Tenant isolation
    pub org_id: Option<Uuid>,
    pub repo_id: Option<Uuid>,
    pub installation_id: Option<String>,

    pub repo_full_name: String,
    pub repo_provider_id: String,
    pub action: String,

    // Git coordinates
    pub head_sha: Option<String>,
    pub base_sha: Option<String>,
    pub head_ref: Option<String>,
    pub base_ref: Option<String>,
    pub pr_number: Option<u64>,
    pub pr_title: Option<String>,
    pub pr_url: Option<String>,

    pub sender_login: Option<String>,
    pub sender_id: Option<String>,

    /// Raw payload, retained for audit only.
    pub raw_payload: serde_json::Value,

    pub is_verified: bool,
    pub verification_method: Option<VerificationMethod>,
}

impl WebhookEvent {
    pub fn new(provider: Provider, raw_payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: WebhookEventType::Unknown,
            provider,
            delivery_id: String::new(),
            received_at: UtcDateTime::now(),
            org_id: None,
            repo_id: None,
            installation_id: None,
            repo_full_name: String::new(),
            repo_provider_id: String::new(),
            action: String::new(),
            head_sha: None,
            base_sha: None,
            head_ref: None,
            base_ref: None,
            pr_number: None,
            pr_title: None,
            pr_url: None,
            sender_login: None,
            sender_id: None,
            raw_payload,
            is_verified: false,
            verification_method: None,
        }
    }
}

/// Derive a stable tenant UUID from a provider-scoped external identifier.
///
/// The same provider id always maps to the same UUID, so events and runs for
/// one repository or organization group together without a registry lookup.
pub fn tenant_uuid(provider: Provider, external_id: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, format!("{provider}:{external_id}").as_bytes())
}

/// Run lifecycle states.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Preparing,
    Running,
    Completed,
    Failed,
    Canceled,
    TimedOut,
    Skipped,
}

impl RunState {
    /// States reachable from this one. Terminal states have no outgoing
    /// transitions.
    pub const fn allowed_transitions(self) -> &'static [RunState] {
        match self {
            Self::Queued => &[Self::Preparing, Self::Running, Self::Canceled, Self::Skipped],
            Self::Preparing => &[Self::Running, Self::Failed, Self::Canceled, Self::TimedOut],
            Self::Running => &[Self::Completed, Self::Failed, Self::Canceled, Self::TimedOut],
            Self::Completed | Self::Failed | Self::Canceled | Self::TimedOut | Self::Skipped => &[],
        }
    }

    pub const fn is_terminal(self) -> bool { self.allowed_transitions().is_empty() }

    pub fn can_transition_to(self, to: RunState) -> bool {
        self.allowed_transitions().contains(&to)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Preparing => "preparing",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::TimedOut => "timed_out",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for RunState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "preparing" => Ok(Self::Preparing),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            "timed_out" => Ok(Self::TimedOut),
            "skipped" => Ok(Self::Skipped),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// What triggered a state transition.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransitionType {
    #[default]
    Automatic,
    Manual,
    Timeout,
    Error,
}

impl TransitionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Automatic => "automatic",
            Self::Manual => "manual",
            Self::Timeout => "timeout",
            Self::Error => "error",
        }
    }
}

impl FromStr for TransitionType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "automatic" => Ok(Self::Automatic),
            "manual" => Ok(Self::Manual),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            _ => Err(()),
        }
    }
}

impl fmt::Display for TransitionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Classification of a run.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunType {
    #[default]
    Gate,
    Report,
    Scan,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Gate => "gate",
            Self::Report => "report",
            Self::Scan => "scan",
        }
    }
}

impl FromStr for RunType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gate" => Ok(Self::Gate),
            "report" => Ok(Self::Report),
            "scan" => Ok(Self::Scan),
            _ => Err(()),
        }
    }
}

impl fmt::Display for RunType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Append-only audit record of a single state transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunTransition {
    pub id: Uuid,
    pub run_id: Uuid,
    /// Per-run ordering, assigned by the store on insert.
    pub seq: i64,
    pub from_state: RunState,
    pub to_state: RunState,
    pub transition_type: TransitionType,
    pub reason: String,
    pub error: Option<String>,
    /// User id, or "system" for automatic transitions.
    pub triggered_by: Option<String>,
    pub worker_id: Option<String>,
    pub created_at: UtcDateTime,
}

/// A single tracked execution of gate checks against a commit.
///
/// Owned by the state machine: created on webhook-derived dispatch, mutated
/// only through transitions, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub org_id: Uuid,
    pub repo_id: Uuid,
    pub repo_full_name: String,
    pub event_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub correlation_id: Option<Uuid>,

    // Git coordinates
    pub head_sha: String,
    pub base_sha: Option<String>,
    pub git_ref: Option<String>,
    pub pr_number: Option<u64>,

    pub state: RunState,
    pub previous_state: Option<RunState>,

    pub run_type: RunType,
    pub policy_ids: Vec<Uuid>,
    pub tools: Vec<String>,

    pub result: Option<serde_json::Value>,
    pub findings_count: u32,
    pub error: Option<String>,

    // Provider write-back handles
    pub check_run_id: Option<u64>,
    pub status_id: Option<u64>,
    pub comment_id: Option<u64>,

    pub created_at: UtcDateTime,
    pub queued_at: Option<UtcDateTime>,
    pub started_at: Option<UtcDateTime>,
    pub completed_at: Option<UtcDateTime>,

    pub timeout_seconds: u64,
    pub deadline: Option<UtcDateTime>,

    pub worker_id: Option<String>,
    pub worker_version: Option<String>,

    pub attempt: u32,
    pub max_attempts: u32,

    /// Transition history. Populated only when fetched with history; the
    /// authoritative copy lives in its own table keyed by run id.
    #[serde(default)]
    pub transitions: Vec<RunTransition>,
}

impl Run {
    pub fn is_terminal(&self) -> bool { self.state.is_terminal() }

    /// Wall-clock duration from start to completion (or now, if running).
    pub fn duration(&self) -> Option<time::Duration> {
        let started = self.started_at?;
        let end = self.completed_at.unwrap_or_else(UtcDateTime::now);
        Some(end - started)
    }
}

/// What provider-visible outcome is produced when the pipeline cannot
/// complete a gate normally.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DegradationMode {
    /// Block the merge on any failure (strictest).
    FailClosed,
    /// Mark neutral and alert for manual review.
    #[default]
    FailNeutral,
    /// Allow the merge and alert (least strict).
    FailOpen,
}

impl DegradationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FailClosed => "fail_closed",
            Self::FailNeutral => "fail_neutral",
            Self::FailOpen => "fail_open",
        }
    }
}

impl fmt::Display for DegradationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[cfg(test)]
mod tests {
    use super::RunState;

    #[test]
    fn test_transition_table() {
        let terminal = [
            RunState::Completed,
            RunState::Failed,
            RunState::Canceled,
            RunState::TimedOut,
            RunState::Skipped,
        ];
        for state in terminal {
            assert!(state.is_terminal());
            assert!(state.allowed_transitions().is_empty());
        }
        assert!(RunState::Queued.can_transition_to(RunState::Running));
        assert!(RunState::Queued.can_transition_to(RunState::Skipped));
        assert!(!RunState::Queued.can_transition_to(RunState::Completed));
        assert!(!RunState::Queued.can_transition_to(RunState::TimedOut));
        assert!(RunState::Preparing.can_transition_to(RunState::TimedOut));
        assert!(RunState::Running.can_transition_to(RunState::TimedOut));
        assert!(!RunState::Completed.can_transition_to(RunState::Running));
    }

    #[test]
    fn test_state_round_trip() {
        for s in ["queued", "preparing", "running", "completed", "failed", "canceled", "timed_out", "skipped"]
        {
            let state: RunState = s.parse().unwrap();
            assert_eq!(state.as_str(), s);
        }
        assert!("paused".parse::<RunState>().is_err());
    }
}
