use std::{sync::Arc, time::Duration};

use mergegate_core::{
    EventPublisher,
    models::{Run, RunState, RunTransition, RunType, TransitionType},
};
use mergegate_db::{RunFilter, RunStore, StoreError};
use time::UtcDateTime;
use uuid::Uuid;

/// Errors surfaced by state machine operations. These are programming or
/// race-condition signals and are never silently absorbed.
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("run not found: {0}")]
    NotFound(Uuid),

    #[error("invalid transition: {from} -> {to}")]
    Invalid { from: RunState, to: RunState },

    #[error("run {run_id} left state {expected} concurrently")]
    Conflict { run_id: Uuid, expected: RunState },

    #[error("cannot replay run {0}: not in a terminal state")]
    NotTerminal(Uuid),

    #[error(transparent)]
    Store(anyhow::Error),
}

impl From<StoreError> for TransitionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::StateConflict { run_id, expected } => Self::Conflict { run_id, expected },
            StoreError::Backend(e) => Self::Store(e),
        }
    }
}

/// Parameters for creating a run. Everything optional carries the value the
/// webhook event supplied, if any.
#[derive(Debug, Clone)]
pub struct CreateRun {
    pub org_id: Uuid,
    pub repo_id: Uuid,
    pub repo_full_name: String,
    pub head_sha: String,
    pub run_type: RunType,
    pub event_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
    pub base_sha: Option<String>,
    pub git_ref: Option<String>,
    pub pr_number: Option<u64>,
    pub policy_ids: Vec<Uuid>,
    pub tools: Vec<String>,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
    pub attempt: u32,
}

impl Default for CreateRun {
    fn default() -> Self {
        Self {
            org_id: Uuid::nil(),
            repo_id: Uuid::nil(),
            repo_full_name: String::new(),
            head_sha: String::new(),
            run_type: RunType::Gate,
            event_id: None,
            job_id: None,
            base_sha: None,
            git_ref: None,
            pr_number: None,
            policy_ids: Vec::new(),
            tools: Vec::new(),
            timeout_seconds: 600,
            max_attempts: 3,
            attempt: 1,
        }
    }
}

/// Context attached to a transition for the audit trail.
#[derive(Debug, Clone, Default)]
pub struct TransitionContext {
    pub reason: String,
    pub error: Option<String>,
    pub transition_type: TransitionType,
    /// User id, or None for system-initiated transitions.
    pub triggered_by: Option<String>,
    pub worker_id: Option<String>,
}

/// Drives runs through their lifecycle, persisting every transition and
/// publishing a `run.<state>` event for each.
pub struct RunStateMachine {
    store: Arc<dyn RunStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl RunStateMachine {
    pub fn new(store: Arc<dyn RunStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    pub fn store(&self) -> Arc<dyn RunStore> { self.store.clone() }

    /// Create a run in `QUEUED` state with its deadline set from the timeout.
    /// An initial self-transition is recorded so the audit trail starts at
    /// creation.
    pub async fn create_run(&self, params: CreateRun) -> Result<Run, TransitionError> {
        let now = UtcDateTime::now();
        let mut run = Run {
            id: Uuid::new_v4(),
            org_id: params.org_id,
            repo_id: params.repo_id,
            repo_full_name: params.repo_full_name,
            event_id: params.event_id,
            job_id: params.job_id,
            correlation_id: Some(Uuid::new_v4()),
            head_sha: params.head_sha,
            base_sha: params.base_sha,
            git_ref: params.git_ref,
            pr_number: params.pr_number,
            state: RunState::Queued,
            previous_state: None,
            run_type: params.run_type,
            policy_ids: params.policy_ids,
            tools: params.tools,
            result: None,
            findings_count: 0,
            error: None,
            check_run_id: None,
            status_id: None,
            comment_id: None,
            created_at: now,
            queued_at: Some(now),
            started_at: None,
            completed_at: None,
            timeout_seconds: params.timeout_seconds,
            deadline: Some(now + Duration::from_secs(params.timeout_seconds)),
            worker_id: None,
            worker_version: None,
            attempt: params.attempt,
            max_attempts: params.max_attempts,
            transitions: Vec::new(),
        };
        self.store.save(&run).await?;

        let mut transition = RunTransition {
            id: Uuid::new_v4(),
            run_id: run.id,
            seq: 0,
            from_state: RunState::Queued,
            to_state: RunState::Queued,
            transition_type: TransitionType::Automatic,
            reason: "Run created".to_string(),
            error: None,
            triggered_by: None,
            worker_id: None,
            created_at: now,
        };
        transition.seq = self.store.append_transition(&transition).await?;
        run.transitions.push(transition);

        self.publish("run.created", &run).await;

        tracing::info!(
            "Run created: id={} type={} repo={} sha={} attempt={}",
            run.id,
            run.run_type,
            run.repo_full_name,
            &run.head_sha[..run.head_sha.len().min(8)],
            run.attempt,
        );

        Ok(run)
    }

    /// Transition a run to a new state, appending an audit record.
    ///
    /// Fails with [`TransitionError::Invalid`] if the target state is not
    /// reachable from the current one, and [`TransitionError::Conflict`] if
    /// a concurrent transition won the compare-and-swap.
    pub async fn transition(
        &self,
        run_id: Uuid,
        to_state: RunState,
        ctx: TransitionContext,
    ) -> Result<Run, TransitionError> {
        let mut run =
            self.store.get(run_id).await?.ok_or(TransitionError::NotFound(run_id))?;
        let from_state = run.state;
        if !from_state.can_transition_to(to_state) {
            return Err(TransitionError::Invalid { from: from_state, to: to_state });
        }

        let now = UtcDateTime::now();
        let mut transition = RunTransition {
            id: Uuid::new_v4(),
            run_id,
            seq: 0,
            from_state,
            to_state,
            transition_type: ctx.transition_type,
            reason: ctx.reason.clone(),
            error: ctx.error.clone(),
            triggered_by: ctx.triggered_by,
            worker_id: ctx.worker_id.clone(),
            created_at: now,
        };

        run.previous_state = Some(from_state);
        run.state = to_state;
        if to_state == RunState::Running {
            run.started_at = Some(now);
            if ctx.worker_id.is_some() {
                run.worker_id = ctx.worker_id;
            }
        }
        if to_state.is_terminal() {
            run.completed_at = Some(now);
        }
        if let Some(error) = ctx.error {
            run.error = Some(error);
        }

        transition.seq = self.store.commit_transition(&run, &transition, from_state).await?;
        run.transitions.push(transition);

        self.publish(&format!("run.{}", to_state.as_str()), &run).await;

        tracing::info!(
            "Run transitioned: id={} {} -> {} reason={}",
            run_id,
            from_state,
            to_state,
            ctx.reason,
        );

        Ok(run)
    }

    // ── Convenience wrappers ────────────────────────────────────────────

    /// QUEUED -> PREPARING, when a worker picks up the run for setup.
    pub async fn prepare_run(&self, run_id: Uuid, worker_id: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::Preparing, TransitionContext {
            reason: "Worker preparing run".to_string(),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Start processing (QUEUED/PREPARING -> RUNNING).
    pub async fn start_run(&self, run_id: Uuid, worker_id: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::Running, TransitionContext {
            reason: "Worker started processing".to_string(),
            worker_id: Some(worker_id.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Complete a run, storing its result payload first.
    pub async fn complete_run(
        &self,
        run_id: Uuid,
        result: serde_json::Value,
        findings_count: u32,
    ) -> Result<Run, TransitionError> {
        let mut run =
            self.store.get(run_id).await?.ok_or(TransitionError::NotFound(run_id))?;
        run.result = Some(result);
        run.findings_count = findings_count;
        self.store.update_details(&run).await?;

        self.transition(run_id, RunState::Completed, TransitionContext {
            reason: "Analysis completed".to_string(),
            ..Default::default()
        })
        .await
    }

    pub async fn fail_run(&self, run_id: Uuid, error: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::Failed, TransitionContext {
            reason: "Analysis failed".to_string(),
            error: Some(error.to_string()),
            transition_type: TransitionType::Error,
            ..Default::default()
        })
        .await
    }

    pub async fn cancel_run(
        &self,
        run_id: Uuid,
        canceled_by: &str,
        reason: Option<String>,
    ) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::Canceled, TransitionContext {
            reason: reason.unwrap_or_else(|| "Manually canceled".to_string()),
            transition_type: TransitionType::Manual,
            triggered_by: Some(canceled_by.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn timeout_run(&self, run_id: Uuid) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::TimedOut, TransitionContext {
            reason: "Run exceeded timeout".to_string(),
            transition_type: TransitionType::Timeout,
            ..Default::default()
        })
        .await
    }

    pub async fn skip_run(&self, run_id: Uuid, reason: &str) -> Result<Run, TransitionError> {
        self.transition(run_id, RunState::Skipped, TransitionContext {
            reason: reason.to_string(),
            ..Default::default()
        })
        .await
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, TransitionError> {
        Ok(self.store.get(run_id).await?)
    }

    pub async fn get_run_with_transitions(
        &self,
        run_id: Uuid,
    ) -> Result<Option<Run>, TransitionError> {
        let Some(mut run) = self.store.get(run_id).await? else {
            return Ok(None);
        };
        run.transitions = self.store.transitions(run_id).await?;
        Ok(Some(run))
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, TransitionError> {
        Ok(self.store.query(filter).await?)
    }

    /// Most recent run for a commit, optionally narrowed to a run type.
    pub async fn get_latest_run(
        &self,
        org_id: Uuid,
        repo_id: Uuid,
        head_sha: &str,
        run_type: Option<RunType>,
    ) -> Result<Option<Run>, TransitionError> {
        let runs = self
            .store
            .query(&RunFilter {
                org_id: Some(org_id),
                repo_id: Some(repo_id),
                head_sha: Some(head_sha.to_string()),
                limit: 10,
                ..Default::default()
            })
            .await?;
        Ok(runs.into_iter().find(|run| run_type.is_none_or(|t| run.run_type == t)))
    }

    // ── Timeout sweep ───────────────────────────────────────────────────

    /// Force a timeout transition for every in-flight run past its deadline.
    /// Returns the runs that were timed out so the caller can report each
    /// outcome exactly once. Runs that reach a terminal state concurrently
    /// are skipped.
    pub async fn check_timeouts(&self) -> Result<Vec<Run>, TransitionError> {
        let due = self.store.due_for_timeout(UtcDateTime::now(), 1000).await?;
        let mut timed_out = Vec::new();
        for run in due {
            match self.timeout_run(run.id).await {
                Ok(run) => timed_out.push(run),
                Err(TransitionError::Invalid { .. } | TransitionError::Conflict { .. }) => {
                    tracing::debug!("Run {} finished before the timeout sweep, skipping", run.id);
                }
                Err(e) => return Err(e),
            }
        }
        if !timed_out.is_empty() {
            tracing::warn!("Timed out {} runs", timed_out.len());
        }
        Ok(timed_out)
    }

    // ── Replay ──────────────────────────────────────────────────────────

    /// Create a fresh QUEUED run replaying a terminal one, with the attempt
    /// counter advanced and identical git coordinates, policies, and tools.
    pub async fn replay_run(&self, run_id: Uuid) -> Result<Run, TransitionError> {
        let original =
            self.store.get(run_id).await?.ok_or(TransitionError::NotFound(run_id))?;
        if !original.is_terminal() {
            return Err(TransitionError::NotTerminal(run_id));
        }
        let replay = self
            .create_run(CreateRun {
                org_id: original.org_id,
                repo_id: original.repo_id,
                repo_full_name: original.repo_full_name.clone(),
                head_sha: original.head_sha.clone(),
                run_type: original.run_type,
                event_id: original.event_id,
                job_id: original.job_id,
                base_sha: original.base_sha.clone(),
                git_ref: original.git_ref.clone(),
                pr_number: original.pr_number,
                policy_ids: original.policy_ids.clone(),
                tools: original.tools.clone(),
                timeout_seconds: original.timeout_seconds,
                max_attempts: original.max_attempts,
                attempt: original.attempt + 1,
            })
            .await?;
        tracing::info!(
            "Run replayed: original={} new={} attempt={}",
            run_id,
            replay.id,
            replay.attempt,
        );
        Ok(replay)
    }

    async fn publish(&self, event_type: &str, run: &Run) {
        let payload = match serde_json::to_value(run) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!("Failed to serialize run {} for publishing: {e}", run.id);
                return;
            }
        };
        if let Err(e) = self.publisher.publish(event_type, payload).await {
            tracing::error!("Failed to publish {event_type} for run {}: {e:#}", run.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use mergegate_core::MemoryEventPublisher;
    use mergegate_db::MemoryRunStore;

    use super::*;

    fn machine() -> (RunStateMachine, Arc<MemoryEventPublisher>) {
        let publisher = Arc::new(MemoryEventPublisher::default());
        let machine =
            RunStateMachine::new(Arc::new(MemoryRunStore::new()), publisher.clone());
        (machine, publisher)
    }

    fn params() -> CreateRun {
        CreateRun {
            org_id: Uuid::new_v4(),
            repo_id: Uuid::new_v4(),
            repo_full_name: "acme/widgets".to_string(),
            head_sha: "abc123def456".to_string(),
            tools: vec!["scanner".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_create_run_starts_queued() {
        let (machine, publisher) = machine();
        let run = machine.create_run(params()).await.unwrap();
        assert_eq!(run.state, RunState::Queued);
        assert!(run.queued_at.is_some());
        assert!(run.deadline.is_some());
        assert_eq!(run.attempt, 1);
        // Initial self-transition for audit symmetry
        assert_eq!(run.transitions.len(), 1);
        assert_eq!(run.transitions[0].from_state, RunState::Queued);
        assert_eq!(run.transitions[0].to_state, RunState::Queued);
        assert_eq!(publisher.event_types(), vec!["run.created".to_string()]);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let (machine, publisher) = machine();
        let run = machine.create_run(params()).await.unwrap();
        let run = machine.start_run(run.id, "worker-1").await.unwrap();
        assert_eq!(run.state, RunState::Running);
        assert_eq!(run.previous_state, Some(RunState::Queued));
        assert!(run.started_at.is_some());
        assert_eq!(run.worker_id.as_deref(), Some("worker-1"));

        let run = machine
            .complete_run(run.id, serde_json::json!({"verdict": "pass"}), 2)
            .await
            .unwrap();
        assert_eq!(run.state, RunState::Completed);
        assert_eq!(run.findings_count, 2);
        assert!(run.completed_at.is_some());

        let stored = machine.get_run_with_transitions(run.id).await.unwrap().unwrap();
        let states: Vec<RunState> =
            stored.transitions.iter().map(|t| t.to_state).collect();
        assert_eq!(states, vec![RunState::Queued, RunState::Running, RunState::Completed]);
        // Each transition's from_state matches the run's state just prior
        for pair in stored.transitions.windows(2) {
            assert_eq!(pair[1].from_state, pair[0].to_state);
        }
        let seqs: Vec<i64> = stored.transitions.iter().map(|t| t.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        assert_eq!(publisher.event_types(), vec![
            "run.created".to_string(),
            "run.running".to_string(),
            "run.completed".to_string(),
        ]);
    }

    #[tokio::test]
    async fn test_invalid_transition_rejected() {
        let (machine, _) = machine();
        let run = machine.create_run(params()).await.unwrap();
        let err = machine
            .transition(run.id, RunState::Completed, TransitionContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TransitionError::Invalid {
            from: RunState::Queued,
            to: RunState::Completed
        }));

        machine.start_run(run.id, "worker-1").await.unwrap();
        let run = machine.complete_run(run.id, serde_json::json!({}), 0).await.unwrap();
        let err = machine.start_run(run.id, "worker-2").await.unwrap_err();
        assert!(matches!(err, TransitionError::Invalid { from: RunState::Completed, .. }));
    }

    #[tokio::test]
    async fn test_completed_at_iff_terminal() {
        let (machine, _) = machine();
        let run = machine.create_run(params()).await.unwrap();
        assert!(run.completed_at.is_none());
        let run = machine.skip_run(run.id, "No policies apply").await.unwrap();
        assert_eq!(run.state, RunState::Skipped);
        assert!(run.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_records_actor() {
        let (machine, _) = machine();
        let run = machine.create_run(params()).await.unwrap();
        let run = machine.cancel_run(run.id, "user-42", None).await.unwrap();
        assert_eq!(run.state, RunState::Canceled);
        let transitions = machine.store().transitions(run.id).await.unwrap();
        let last = transitions.last().unwrap();
        assert_eq!(last.transition_type, TransitionType::Manual);
        assert_eq!(last.triggered_by.as_deref(), Some("user-42"));
    }

    #[tokio::test]
    async fn test_timeout_sweep() {
        let (machine, _) = machine();
        let run = machine
            .create_run(CreateRun { timeout_seconds: 0, ..params() })
            .await
            .unwrap();
        let run = machine.start_run(run.id, "worker-1").await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let timed_out = machine.check_timeouts().await.unwrap();
        assert_eq!(timed_out.len(), 1);
        assert_eq!(timed_out[0].id, run.id);
        assert_eq!(timed_out[0].state, RunState::TimedOut);

        // Re-running the sweep on an already-terminal run is a no-op
        let timed_out = machine.check_timeouts().await.unwrap();
        assert!(timed_out.is_empty());
    }

    #[tokio::test]
    async fn test_sweep_ignores_queued_runs() {
        let (machine, _) = machine();
        let run = machine
            .create_run(CreateRun { timeout_seconds: 0, ..params() })
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(machine.check_timeouts().await.unwrap().is_empty());
        let stored = machine.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(stored.state, RunState::Queued);
    }

    #[tokio::test]
    async fn test_replay_run() {
        let (machine, _) = machine();
        let run = machine.create_run(params()).await.unwrap();
        let run = machine.start_run(run.id, "worker-1").await.unwrap();
        let run = machine.fail_run(run.id, "scanner crashed").await.unwrap();

        let replay = machine.replay_run(run.id).await.unwrap();
        assert_eq!(replay.state, RunState::Queued);
        assert_eq!(replay.attempt, 2);
        assert_eq!(replay.head_sha, run.head_sha);
        assert_eq!(replay.tools, run.tools);
        assert_ne!(replay.id, run.id);
    }

    #[tokio::test]
    async fn test_replay_requires_terminal() {
        let (machine, _) = machine();
        let run = machine.create_run(params()).await.unwrap();
        let err = machine.replay_run(run.id).await.unwrap_err();
        assert!(matches!(err, TransitionError::NotTerminal(_)));
    }

    #[tokio::test]
    async fn test_latest_run_filters_by_type() {
        let (machine, _) = machine();
        let p = params();
        machine.create_run(p.clone()).await.unwrap();
        let scan = machine
            .create_run(CreateRun { run_type: RunType::Scan, ..p.clone() })
            .await
            .unwrap();
        let latest = machine
            .get_latest_run(p.org_id, p.repo_id, &p.head_sha, Some(RunType::Scan))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(latest.id, scan.id);
        assert!(machine
            .get_latest_run(p.org_id, p.repo_id, "other", None)
            .await
            .unwrap()
            .is_none());
    }
}
