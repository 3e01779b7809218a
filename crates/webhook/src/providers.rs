use http::HeaderMap;
use mergegate_core::models::{
    Provider, WebhookEvent, WebhookEventType, tenant_uuid,
};
use serde_json::Value;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// The provider-assigned delivery identifier used for replay detection.
pub fn delivery_id(provider: Provider, headers: &HeaderMap) -> Option<String> {
    let name = match provider {
        Provider::GitHub => "X-GitHub-Delivery",
        Provider::GitLab => "X-Gitlab-Event-UUID",
        Provider::Bitbucket => "X-Request-UUID",
    };
    header(headers, name).map(str::to_string)
}

/// Rate-limit scope: per GitHub App installation target when known,
/// otherwise one global bucket per provider.
pub fn rate_limit_key(provider: Provider, headers: &HeaderMap) -> String {
    if provider == Provider::GitHub {
        if let Some(target) = header(headers, "X-GitHub-Hook-Installation-Target-ID") {
            return format!("github:{target}");
        }
    }
    format!("{provider}:global")
}

/// Map a raw provider payload onto the canonical event.
pub fn parse_event(provider: Provider, headers: &HeaderMap, payload: Value) -> WebhookEvent {
    match provider {
        Provider::GitHub => parse_github(headers, payload),
        Provider::GitLab => parse_gitlab(payload),
        Provider::Bitbucket => parse_bitbucket(headers, payload),
    }
}

fn set_tenant(event: &mut WebhookEvent) {
    if !event.repo_provider_id.is_empty() {
        event.repo_id = Some(tenant_uuid(event.provider, &event.repo_provider_id));
    }
    // Tenant = the owner half of the repository path
    if let Some((owner, _)) = event.repo_full_name.split_once('/') {
        event.org_id = Some(tenant_uuid(event.provider, owner));
    }
}

fn parse_github(headers: &HeaderMap, payload: Value) -> WebhookEvent {
    let event_name = header(headers, "X-GitHub-Event").unwrap_or_default().to_string();
    let action = payload["action"].as_str().unwrap_or_default().to_string();

    let mut event = WebhookEvent::new(Provider::GitHub, Value::Null);
    event.event_type = map_github_event(&event_name, &action);
    event.action = action;
    event.repo_full_name =
        payload["repository"]["full_name"].as_str().unwrap_or_default().to_string();
    event.repo_provider_id =
        payload["repository"]["id"].as_u64().map(|id| id.to_string()).unwrap_or_default();
    event.installation_id = payload["installation"]["id"].as_u64().map(|id| id.to_string());
    event.sender_login = payload["sender"]["login"].as_str().map(str::to_string);
    event.sender_id = payload["sender"]["id"].as_u64().map(|id| id.to_string());

    let pr = &payload["pull_request"];
    if pr.is_object() {
        event.pr_number = pr["number"].as_u64();
        event.pr_title = pr["title"].as_str().map(str::to_string);
        event.pr_url = pr["html_url"].as_str().map(str::to_string);
        event.head_sha = pr["head"]["sha"].as_str().map(str::to_string);
        event.base_sha = pr["base"]["sha"].as_str().map(str::to_string);
        event.head_ref = pr["head"]["ref"].as_str().map(str::to_string);
        event.base_ref = pr["base"]["ref"].as_str().map(str::to_string);
    }

    if event_name == "push" {
        event.head_sha = payload["after"].as_str().map(str::to_string);
        event.base_sha = payload["before"].as_str().map(str::to_string);
        event.head_ref = payload["ref"]
            .as_str()
            .map(|r| r.trim_start_matches("refs/heads/").to_string());
    }

    // Check suite/run events carry the head SHA on the inner object
    if let Some(sha) = payload["check_suite"]["head_sha"].as_str() {
        event.head_sha = Some(sha.to_string());
    }
    if let Some(sha) = payload["check_run"]["head_sha"].as_str() {
        event.head_sha = Some(sha.to_string());
    }

    set_tenant(&mut event);
    event.raw_payload = payload;
    event
}

fn map_github_event(event_name: &str, action: &str) -> WebhookEventType {
    match (event_name, action) {
        ("pull_request", "opened") => WebhookEventType::PullRequestOpened,
        ("pull_request", "synchronize") => WebhookEventType::PullRequestSynchronize,
        ("pull_request", "closed") => WebhookEventType::PullRequestClosed,
        ("pull_request", "reopened") => WebhookEventType::PullRequestReopened,
        ("push", _) => WebhookEventType::Push,
        ("check_suite", "requested") => WebhookEventType::CheckSuiteRequested,
        ("check_run", "requested_action") => WebhookEventType::CheckRunRequested,
        ("check_run", "rerequested") => WebhookEventType::CheckRunRerequested,
        ("pull_request_review", _) => WebhookEventType::PullRequestReview,
        ("pull_request_review_comment", _) => WebhookEventType::PullRequestReviewComment,
        ("issue_comment", _) => WebhookEventType::IssueComment,
        ("installation", "created") => WebhookEventType::InstallationCreated,
        ("installation", "deleted") => WebhookEventType::InstallationDeleted,
        _ => WebhookEventType::Unknown,
    }
}

fn parse_gitlab(payload: Value) -> WebhookEvent {
    let object_kind = payload["object_kind"].as_str().unwrap_or_default().to_string();

    let mut event = WebhookEvent::new(Provider::GitLab, Value::Null);
    event.repo_full_name =
        payload["project"]["path_with_namespace"].as_str().unwrap_or_default().to_string();
    event.repo_provider_id =
        payload["project"]["id"].as_u64().map(|id| id.to_string()).unwrap_or_default();
    event.sender_login = payload["user"]["username"].as_str().map(str::to_string);
    event.sender_id = payload["user"]["id"].as_u64().map(|id| id.to_string());

    match object_kind.as_str() {
        "merge_request" => {
            let mr = &payload["object_attributes"];
            let action = mr["action"].as_str().unwrap_or_default();
            event.event_type = match action {
                "open" => WebhookEventType::PullRequestOpened,
                "update" => WebhookEventType::PullRequestSynchronize,
                "close" => WebhookEventType::PullRequestClosed,
                "reopen" => WebhookEventType::PullRequestReopened,
                "merge" => WebhookEventType::PullRequestMerged,
                _ => WebhookEventType::Unknown,
            };
            event.action = action.to_string();
            event.pr_number = mr["iid"].as_u64();
            event.pr_title = mr["title"].as_str().map(str::to_string);
            event.pr_url = mr["url"].as_str().map(str::to_string);
            event.head_sha = mr["last_commit"]["id"].as_str().map(str::to_string);
            event.head_ref = mr["source_branch"].as_str().map(str::to_string);
            event.base_ref = mr["target_branch"].as_str().map(str::to_string);
        }
        "push" => {
            event.event_type = WebhookEventType::Push;
            event.head_sha = payload["after"].as_str().map(str::to_string);
            event.base_sha = payload["before"].as_str().map(str::to_string);
            event.head_ref = payload["ref"]
                .as_str()
                .map(|r| r.trim_start_matches("refs/heads/").to_string());
        }
        _ => {}
    }

    set_tenant(&mut event);
    event.raw_payload = payload;
    event
}

fn parse_bitbucket(headers: &HeaderMap, payload: Value) -> WebhookEvent {
    let event_key = header(headers, "X-Event-Key").unwrap_or_default().to_string();

    let mut event = WebhookEvent::new(Provider::Bitbucket, Value::Null);
    event.repo_full_name =
        payload["repository"]["full_name"].as_str().unwrap_or_default().to_string();
    event.repo_provider_id =
        payload["repository"]["uuid"].as_str().unwrap_or_default().to_string();
    event.sender_login = payload["actor"]["username"]
        .as_str()
        .or_else(|| payload["actor"]["nickname"].as_str())
        .map(str::to_string);
    event.sender_id = payload["actor"]["uuid"].as_str().map(str::to_string);

    if let Some(action) = event_key.strip_prefix("pullrequest:") {
        let pr = &payload["pullrequest"];
        event.event_type = match action {
            "created" => WebhookEventType::PullRequestOpened,
            "updated" => WebhookEventType::PullRequestSynchronize,
            "fulfilled" | "rejected" => WebhookEventType::PullRequestClosed,
            _ => WebhookEventType::Unknown,
        };
        event.action = action.to_string();
        event.pr_number = pr["id"].as_u64();
        event.pr_title = pr["title"].as_str().map(str::to_string);
        event.head_sha = pr["source"]["commit"]["hash"].as_str().map(str::to_string);
        event.head_ref = pr["source"]["branch"]["name"].as_str().map(str::to_string);
        event.base_ref = pr["destination"]["branch"]["name"].as_str().map(str::to_string);
    } else if event_key == "repo:push" {
        event.event_type = WebhookEventType::Push;
        let change = &payload["push"]["changes"][0];
        event.head_sha = change["new"]["target"]["hash"].as_str().map(str::to_string);
        event.base_sha = change["old"]["target"]["hash"].as_str().map(str::to_string);
        event.head_ref = change["new"]["name"].as_str().map(str::to_string);
    }

    set_tenant(&mut event);
    event.raw_payload = payload;
    event
}
