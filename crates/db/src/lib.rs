mod memory;
mod sqlite;

use async_trait::async_trait;
use mergegate_core::models::{Run, RunState, RunTransition};
use time::UtcDateTime;
use uuid::Uuid;

pub use memory::MemoryRunStore;
pub use sqlite::Database;

/// Errors returned by a [`RunStore`] implementation.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("run not found: {0}")]
    NotFound(Uuid),

    /// The compare-and-swap on the persisted state column found a different
    /// state than expected. Another transition won the race.
    #[error("run {run_id} is no longer in state {expected}")]
    StateConflict { run_id: Uuid, expected: RunState },

    #[error("storage backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self { Self::Backend(err.into()) }
}

/// Filters for run queries. All filters are optional and combine with AND.
#[derive(Debug, Clone)]
pub struct RunFilter {
    pub org_id: Option<Uuid>,
    pub state: Option<RunState>,
    pub repo_id: Option<Uuid>,
    pub head_sha: Option<String>,
    pub pr_number: Option<u64>,
    pub offset: i64,
    pub limit: i64,
}

impl Default for RunFilter {
    fn default() -> Self {
        Self {
            org_id: None,
            state: None,
            repo_id: None,
            head_sha: None,
            pr_number: None,
            offset: 0,
            limit: 100,
        }
    }
}

/// Storage capability for runs and their transition log.
///
/// Implementations must linearize concurrent transitions on a single run:
/// [`RunStore::commit_transition`] performs a compare-and-swap on the
/// persisted state and fails with [`StoreError::StateConflict`] when the run
/// is no longer in the expected state, so two racing transitions can never
/// both succeed.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a new run (or overwrite it wholesale during creation).
    async fn save(&self, run: &Run) -> Result<(), StoreError>;

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>, StoreError>;

    /// Persist a state transition atomically: update the run row only if it
    /// is still in `expected_state`, and append the transition record with
    /// the next per-run sequence number. Returns the assigned sequence.
    async fn commit_transition(
        &self,
        run: &Run,
        transition: &RunTransition,
        expected_state: RunState,
    ) -> Result<i64, StoreError>;

    /// Append a transition record without touching the run row (used for the
    /// initial self-transition at creation). Returns the assigned sequence.
    async fn append_transition(&self, transition: &RunTransition) -> Result<i64, StoreError>;

    /// Update the run's mutable detail fields (result payload, write-back
    /// handles, worker attribution). Never touches state or timestamps.
    async fn update_details(&self, run: &Run) -> Result<(), StoreError>;

    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    async fn transitions(&self, run_id: Uuid) -> Result<Vec<RunTransition>, StoreError>;

    /// Non-terminal runs with a `TIMED_OUT` edge whose deadline has passed.
    async fn due_for_timeout(
        &self,
        now: UtcDateTime,
        limit: i64,
    ) -> Result<Vec<Run>, StoreError>;
}
