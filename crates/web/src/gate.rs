use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use mergegate_core::models::{Run, RunState};
use mergegate_db::RunStore;
use mergegate_resilience::{DegradationStrategy, GateConclusion, GateOutcome};
use mergegate_writeback::{
    CHECK_NAME, CheckRunConclusion, CheckRunOutput, CommitStatusState, GateWriteback,
    WriteTarget,
};

/// Maps terminal runs and degradation outcomes to provider-visible
/// artifacts: one check-run conclusion, one commit status, and (for pull
/// requests) one summary comment per run.
pub struct GateReporter {
    writeback: GateWriteback,
    strategy: Arc<DegradationStrategy>,
    store: Arc<dyn RunStore>,
}

impl GateReporter {
    pub fn new(
        writeback: GateWriteback,
        strategy: Arc<DegradationStrategy>,
        store: Arc<dyn RunStore>,
    ) -> Self {
        Self { writeback, strategy, store }
    }

    fn target(run: &Run) -> WriteTarget {
        WriteTarget { org_id: run.org_id, repo: run.repo_full_name.clone() }
    }

    /// Create the in-progress check run and pending status for a freshly
    /// dispatched run, persisting the provider handles on the run record.
    pub async fn report_started(&self, run: &Run) -> Result<()> {
        let target = Self::target(run);
        let check = self
            .writeback
            .report_gate_started(&target, &run.head_sha, run.id, None)
            .await
            .context("Failed to create check run")?;
        let status = self
            .writeback
            .statuses
            .create_status(
                &target,
                &run.head_sha,
                CommitStatusState::Pending,
                CHECK_NAME,
                "Gate analysis in progress",
                None,
            )
            .await
            .context("Failed to create commit status")?;

        let mut run = run.clone();
        run.check_run_id = Some(check.check_run_id);
        run.status_id = Some(status.status_id);
        self.store.update_details(&run).await?;
        Ok(())
    }

    /// Report a run that completed, failed, was canceled, or was skipped.
    /// Timed-out runs go through [`GateReporter::report_degraded`] instead.
    pub async fn report_terminal(&self, run: &Run) -> Result<()> {
        ensure!(run.is_terminal(), "run {} is not terminal", run.id);
        let target = Self::target(run);
        let check_run_id = self.ensure_check_run(&target, run).await?;

        let (status_state, summary) = match run.state {
            RunState::Completed if run.findings_count > 0 => {
                let summary = format!("{} findings require attention.", run.findings_count);
                self.writeback
                    .report_gate_failure(&target, check_run_id, Some(&summary), Vec::new())
                    .await?;
                (CommitStatusState::Failure, summary)
            }
            RunState::Completed => {
                let summary = "No issues found.".to_string();
                self.writeback
                    .report_gate_success(&target, check_run_id, Some(&summary), Vec::new())
                    .await?;
                (CommitStatusState::Success, summary)
            }
            RunState::Failed => {
                let summary = run
                    .error
                    .clone()
                    .unwrap_or_else(|| "Analysis failed.".to_string());
                self.writeback
                    .report_gate_failure(&target, check_run_id, Some(&summary), Vec::new())
                    .await?;
                (CommitStatusState::Error, summary)
            }
            RunState::Canceled => {
                let summary = "Run was canceled.".to_string();
                self.writeback
                    .check_runs
                    .complete_check_run(
                        &target,
                        check_run_id,
                        CheckRunConclusion::Cancelled,
                        Some(&CheckRunOutput {
                            title: "Canceled".to_string(),
                            summary: summary.clone(),
                            ..Default::default()
                        }),
                    )
                    .await?;
                (CommitStatusState::Error, summary)
            }
            RunState::Skipped => {
                let summary = "Gate does not apply to this commit.".to_string();
                self.writeback
                    .check_runs
                    .complete_check_run(
                        &target,
                        check_run_id,
                        CheckRunConclusion::Skipped,
                        Some(&CheckRunOutput {
                            title: "Skipped".to_string(),
                            summary: summary.clone(),
                            ..Default::default()
                        }),
                    )
                    .await?;
                (CommitStatusState::Success, summary)
            }
            RunState::TimedOut => {
                let outcome = self
                    .strategy
                    .handle_gate_timeout(
                        run.org_id,
                        run.id,
                        std::time::Duration::from_secs(run.timeout_seconds),
                    )
                    .await;
                return self.report_degraded(run, &outcome).await;
            }
            state => unreachable!("non-terminal state {state} after ensure"),
        };

        self.finish(&target, run, check_run_id, status_state, &summary).await
    }

    /// Report a run resolved by the degradation strategy (timeout or
    /// dependency failure), honoring the tenant's degradation mode.
    pub async fn report_degraded(&self, run: &Run, outcome: &GateOutcome) -> Result<()> {
        let target = Self::target(run);
        let check_run_id = self.ensure_check_run(&target, run).await?;

        match outcome.conclusion {
            GateConclusion::Failure => {
                self.writeback
                    .report_gate_failure(&target, check_run_id, Some(&outcome.message), Vec::new())
                    .await?;
            }
            GateConclusion::Neutral => {
                self.writeback
                    .report_gate_neutral(&target, check_run_id, Some(&outcome.message))
                    .await?;
            }
        }

        let status_state = match outcome.conclusion {
            GateConclusion::Failure => CommitStatusState::Failure,
            GateConclusion::Neutral => CommitStatusState::Success,
        };
        self.finish(&target, run, check_run_id, status_state, &outcome.message).await
    }

    /// The sweep can reach runs that never had a check run created (e.g.
    /// the dispatch write-back failed); create one on the fly so the
    /// conclusion has somewhere to land.
    async fn ensure_check_run(&self, target: &WriteTarget, run: &Run) -> Result<u64> {
        if let Some(check_run_id) = run.check_run_id {
            return Ok(check_run_id);
        }
        let check = self
            .writeback
            .report_gate_started(target, &run.head_sha, run.id, None)
            .await
            .context("Failed to create check run for terminal report")?;
        Ok(check.check_run_id)
    }

    async fn finish(
        &self,
        target: &WriteTarget,
        run: &Run,
        check_run_id: u64,
        status_state: CommitStatusState,
        summary: &str,
    ) -> Result<()> {
        let status = self
            .writeback
            .statuses
            .create_status(target, &run.head_sha, status_state, CHECK_NAME, summary, None)
            .await
            .context("Failed to create commit status")?;

        let mut updated = run.clone();
        updated.check_run_id = Some(check_run_id);
        updated.status_id = Some(status.status_id);

        if let Some(pr_number) = run.pr_number {
            let body = format!(
                "### Merge gate: {}\n\n{summary}\n\n<sub>commit {} · attempt {}</sub>",
                run.state, run.head_sha, run.attempt,
            );
            match self
                .writeback
                .comments
                .create_or_update_comment(target, pr_number, &body, "gate")
                .await
            {
                Ok(comment) => updated.comment_id = Some(comment.comment_id),
                Err(e) => {
                    tracing::error!(
                        "Failed to post gate comment for run {} on PR {pr_number}: {e:#}",
                        run.id,
                    );
                }
            }
        }

        self.store.update_details(&updated).await?;
        Ok(())
    }
}
