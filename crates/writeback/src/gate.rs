use std::sync::Arc;

use uuid::Uuid;

use crate::{
    api::{ProviderClient, TokenProvider, WriteTarget},
    check_run::{
        Annotation, CheckRunConclusion, CheckRunOutput, CheckRunResult, CheckRunStatus,
        CheckRunWriter,
    },
    comment::CommentWriter,
    retry::RetryPolicy,
    status::StatusWriter,
};

/// Name shown for the gate check in the provider UI, also used as the
/// commit status context.
pub const CHECK_NAME: &str = "mergegate";

/// Combines the three writers for gate reporting. Callers map a terminal
/// run to exactly one report call.
pub struct GateWriteback {
    pub check_runs: CheckRunWriter,
    pub statuses: StatusWriter,
    pub comments: CommentWriter,
}

impl GateWriteback {
    pub fn new(
        client: Arc<dyn ProviderClient>,
        tokens: Arc<dyn TokenProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            check_runs: CheckRunWriter::new(client.clone(), tokens.clone(), retry.clone()),
            statuses: StatusWriter::new(client.clone(), tokens.clone(), retry.clone()),
            comments: CommentWriter::new(client, tokens, retry),
        }
    }

    /// Report that gate analysis has started, creating the check run the
    /// later completion call updates. Idempotent per (repo, sha, run id).
    pub async fn report_gate_started(
        &self,
        target: &WriteTarget,
        head_sha: &str,
        run_id: Uuid,
        details_url: Option<&str>,
    ) -> anyhow::Result<CheckRunResult> {
        self.check_runs
            .create_check_run(
                target,
                CHECK_NAME,
                head_sha,
                CheckRunStatus::InProgress,
                Some(&run_id.to_string()),
                details_url,
                Some(&CheckRunOutput {
                    title: "Analysis in progress".to_string(),
                    summary: "Running policy and analysis checks...".to_string(),
                    ..Default::default()
                }),
            )
            .await
    }

    pub async fn report_gate_success(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        summary: Option<&str>,
        annotations: Vec<Annotation>,
    ) -> anyhow::Result<CheckRunResult> {
        let output = CheckRunOutput {
            title: "All checks passed".to_string(),
            summary: summary.unwrap_or("No issues found.").to_string(),
            text: None,
            annotations,
        };
        self.check_runs
            .complete_check_run(target, check_run_id, CheckRunConclusion::Success, Some(&output))
            .await
    }

    pub async fn report_gate_failure(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        summary: Option<&str>,
        annotations: Vec<Annotation>,
    ) -> anyhow::Result<CheckRunResult> {
        let output = CheckRunOutput {
            title: "Checks failed".to_string(),
            summary: summary.unwrap_or("Issues were found that must be addressed.").to_string(),
            text: None,
            annotations,
        };
        self.check_runs
            .complete_check_run(target, check_run_id, CheckRunConclusion::Failure, Some(&output))
            .await
    }

    /// Report a neutral conclusion: warnings only, or a degraded pipeline.
    pub async fn report_gate_neutral(
        &self,
        target: &WriteTarget,
        check_run_id: u64,
        summary: Option<&str>,
    ) -> anyhow::Result<CheckRunResult> {
        let output = CheckRunOutput {
            title: "Checks completed with warnings".to_string(),
            summary: summary
                .unwrap_or("Some warnings were found but no blocking issues.")
                .to_string(),
            ..Default::default()
        };
        self.check_runs
            .complete_check_run(target, check_run_id, CheckRunConclusion::Neutral, Some(&output))
            .await
    }
}
