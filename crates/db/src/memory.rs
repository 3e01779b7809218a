use std::{
    collections::HashMap,
    sync::Mutex,
};

use async_trait::async_trait;
use mergegate_core::models::{Run, RunState, RunTransition};
use time::UtcDateTime;
use uuid::Uuid;

use crate::{RunFilter, RunStore, StoreError};

/// In-memory run store for tests and single-process deployments.
///
/// All state lives behind one mutex, so the compare-and-swap in
/// `commit_transition` is trivially atomic.
#[derive(Default)]
pub struct MemoryRunStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, Run>,
    transitions: HashMap<Uuid, Vec<RunTransition>>,
}

impl MemoryRunStore {
    pub fn new() -> Self { Self::default() }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let mut run = run.clone();
        run.transitions = Vec::new();
        inner.runs.insert(run.id, run);
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.runs.get(&run_id).cloned())
    }

    async fn commit_transition(
        &self,
        run: &Run,
        transition: &RunTransition,
        expected_state: RunState,
    ) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.runs.get(&run.id).ok_or(StoreError::NotFound(run.id))?;
        if stored.state != expected_state {
            return Err(StoreError::StateConflict { run_id: run.id, expected: expected_state });
        }
        let mut updated = run.clone();
        updated.transitions = Vec::new();
        inner.runs.insert(run.id, updated);
        let log = inner.transitions.entry(transition.run_id).or_default();
        let seq = log.len() as i64 + 1;
        let mut transition = transition.clone();
        transition.seq = seq;
        log.push(transition);
        Ok(seq)
    }

    async fn append_transition(&self, transition: &RunTransition) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let log = inner.transitions.entry(transition.run_id).or_default();
        let seq = log.len() as i64 + 1;
        let mut transition = transition.clone();
        transition.seq = seq;
        log.push(transition);
        Ok(seq)
    }

    async fn update_details(&self, run: &Run) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let stored = inner.runs.get_mut(&run.id).ok_or(StoreError::NotFound(run.id))?;
        stored.result = run.result.clone();
        stored.findings_count = run.findings_count;
        stored.error = run.error.clone();
        stored.check_run_id = run.check_run_id;
        stored.status_id = run.status_id;
        stored.comment_id = run.comment_id;
        stored.worker_id = run.worker_id.clone();
        stored.worker_version = run.worker_version.clone();
        stored.attempt = run.attempt;
        Ok(())
    }

    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| {
                filter.org_id.is_none_or(|org_id| run.org_id == org_id)
                    && filter.state.is_none_or(|state| run.state == state)
                    && filter.repo_id.is_none_or(|repo_id| run.repo_id == repo_id)
                    && filter.head_sha.as_deref().is_none_or(|sha| run.head_sha == sha)
                    && filter.pr_number.is_none_or(|pr| run.pr_number == Some(pr))
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs
            .into_iter()
            .skip(filter.offset.max(0) as usize)
            .take(filter.limit.max(0) as usize)
            .collect())
    }

    async fn transitions(&self, run_id: Uuid) -> Result<Vec<RunTransition>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.transitions.get(&run_id).cloned().unwrap_or_default())
    }

    async fn due_for_timeout(
        &self,
        now: UtcDateTime,
        limit: i64,
    ) -> Result<Vec<Run>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut due: Vec<Run> = inner
            .runs
            .values()
            .filter(|run| {
                matches!(run.state, RunState::Preparing | RunState::Running)
                    && run.deadline.is_some_and(|deadline| deadline < now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|run| run.deadline);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}
