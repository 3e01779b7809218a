use std::str::FromStr;

use anyhow::{Context, anyhow};
use mergegate_core::{
    config::DbConfig,
    models::{Run, RunState, RunTransition, RunType, TransitionType},
};
use sqlx::{
    Pool, Row, Sqlite, SqliteConnection, SqlitePool, migrate::MigrateDatabase,
    sqlite::SqliteRow,
};
use time::{OffsetDateTime, PrimitiveDateTime, UtcDateTime};
use uuid::Uuid;

use crate::{RunFilter, RunStore, StoreError};

/// SQLite-backed run store.
#[derive(Clone)]
pub struct Database {
    pub pool: Pool<Sqlite>,
}

impl Database {
    pub async fn new(config: &DbConfig) -> anyhow::Result<Self> {
        if !Sqlite::database_exists(&config.url).await.unwrap_or(false) {
            tracing::info!(url = %config.url, "Creating database");
            Sqlite::create_database(&config.url).await.context("Failed to create database")?;
            tracing::info!("Database created");
        }
        let pool =
            SqlitePool::connect(&config.url).await.context("Failed to connect to database")?;
        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(Self { pool })
    }

    pub async fn close(&self) { self.pool.close().await }
}

fn to_primitive(ts: UtcDateTime) -> PrimitiveDateTime {
    let odt = OffsetDateTime::from(ts);
    PrimitiveDateTime::new(odt.date(), odt.time())
}

fn from_primitive(ts: PrimitiveDateTime) -> UtcDateTime { ts.assume_utc().into() }

fn parse_state(s: &str) -> Result<RunState, StoreError> {
    RunState::from_str(s).map_err(|()| StoreError::Backend(anyhow!("invalid run state: {s}")))
}

fn parse_uuid(s: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(s).map_err(|e| StoreError::Backend(anyhow!("invalid uuid {s}: {e}")))
}

fn opt_uuid(s: Option<String>) -> Result<Option<Uuid>, StoreError> {
    s.map(|s| parse_uuid(&s)).transpose()
}

fn run_from_row(row: &SqliteRow) -> Result<Run, StoreError> {
    let state = parse_state(&row.try_get::<String, _>("state")?)?;
    let previous_state =
        row.try_get::<Option<String>, _>("previous_state")?.map(|s| parse_state(&s)).transpose()?;
    let run_type = RunType::from_str(&row.try_get::<String, _>("run_type")?)
        .map_err(|()| StoreError::Backend(anyhow!("invalid run type")))?;
    let policy_ids: Vec<Uuid> =
        serde_json::from_str(&row.try_get::<String, _>("policy_ids")?)
            .map_err(|e| StoreError::Backend(e.into()))?;
    let tools: Vec<String> = serde_json::from_str(&row.try_get::<String, _>("tools")?)
        .map_err(|e| StoreError::Backend(e.into()))?;
    let result = row
        .try_get::<Option<String>, _>("result")?
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| StoreError::Backend(e.into()))?;
    Ok(Run {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        org_id: parse_uuid(&row.try_get::<String, _>("org_id")?)?,
        repo_id: parse_uuid(&row.try_get::<String, _>("repo_id")?)?,
        repo_full_name: row.try_get("repo_full_name")?,
        event_id: opt_uuid(row.try_get("event_id")?)?,
        job_id: opt_uuid(row.try_get("job_id")?)?,
        correlation_id: opt_uuid(row.try_get("correlation_id")?)?,
        head_sha: row.try_get("head_sha")?,
        base_sha: row.try_get("base_sha")?,
        git_ref: row.try_get("git_ref")?,
        pr_number: row.try_get::<Option<i64>, _>("pr_number")?.map(|n| n as u64),
        state,
        previous_state,
        run_type,
        policy_ids,
        tools,
        result,
        findings_count: row.try_get::<i64, _>("findings_count")? as u32,
        error: row.try_get("error")?,
        check_run_id: row.try_get::<Option<i64>, _>("check_run_id")?.map(|n| n as u64),
        status_id: row.try_get::<Option<i64>, _>("status_id")?.map(|n| n as u64),
        comment_id: row.try_get::<Option<i64>, _>("comment_id")?.map(|n| n as u64),
        created_at: from_primitive(row.try_get("created_at")?),
        queued_at: row.try_get::<Option<PrimitiveDateTime>, _>("queued_at")?.map(from_primitive),
        started_at: row.try_get::<Option<PrimitiveDateTime>, _>("started_at")?.map(from_primitive),
        completed_at: row
            .try_get::<Option<PrimitiveDateTime>, _>("completed_at")?
            .map(from_primitive),
        timeout_seconds: row.try_get::<i64, _>("timeout_seconds")? as u64,
        deadline: row.try_get::<Option<PrimitiveDateTime>, _>("deadline")?.map(from_primitive),
        worker_id: row.try_get("worker_id")?,
        worker_version: row.try_get("worker_version")?,
        attempt: row.try_get::<i64, _>("attempt")? as u32,
        max_attempts: row.try_get::<i64, _>("max_attempts")? as u32,
        transitions: Vec::new(),
    })
}

fn transition_from_row(row: &SqliteRow) -> Result<RunTransition, StoreError> {
    Ok(RunTransition {
        id: parse_uuid(&row.try_get::<String, _>("id")?)?,
        run_id: parse_uuid(&row.try_get::<String, _>("run_id")?)?,
        seq: row.try_get("seq")?,
        from_state: parse_state(&row.try_get::<String, _>("from_state")?)?,
        to_state: parse_state(&row.try_get::<String, _>("to_state")?)?,
        transition_type: TransitionType::from_str(&row.try_get::<String, _>("transition_type")?)
            .map_err(|()| StoreError::Backend(anyhow!("invalid transition type")))?,
        reason: row.try_get("reason")?,
        error: row.try_get("error")?,
        triggered_by: row.try_get("triggered_by")?,
        worker_id: row.try_get("worker_id")?,
        created_at: from_primitive(row.try_get("created_at")?),
    })
}

async fn next_seq(conn: &mut SqliteConnection, run_id: Uuid) -> Result<i64, StoreError> {
    let seq: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) + 1 FROM run_transitions WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_one(conn)
            .await?;
    Ok(seq)
}

async fn insert_transition(
    conn: &mut SqliteConnection,
    transition: &RunTransition,
    seq: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO run_transitions
            (id, run_id, seq, from_state, to_state, transition_type, reason, error, triggered_by, worker_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(transition.id.to_string())
    .bind(transition.run_id.to_string())
    .bind(seq)
    .bind(transition.from_state.as_str())
    .bind(transition.to_state.as_str())
    .bind(transition.transition_type.as_str())
    .bind(&transition.reason)
    .bind(&transition.error)
    .bind(&transition.triggered_by)
    .bind(&transition.worker_id)
    .bind(to_primitive(transition.created_at))
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait::async_trait]
impl RunStore for Database {
    async fn save(&self, run: &Run) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO runs
                (id, org_id, repo_id, repo_full_name, event_id, job_id, correlation_id,
                 head_sha, base_sha, git_ref, pr_number, state, previous_state, run_type,
                 policy_ids, tools, result, findings_count, error, check_run_id, status_id,
                 comment_id, created_at, queued_at, started_at, completed_at, timeout_seconds,
                 deadline, worker_id, worker_version, attempt, max_attempts)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(run.id.to_string())
        .bind(run.org_id.to_string())
        .bind(run.repo_id.to_string())
        .bind(&run.repo_full_name)
        .bind(run.event_id.map(|u| u.to_string()))
        .bind(run.job_id.map(|u| u.to_string()))
        .bind(run.correlation_id.map(|u| u.to_string()))
        .bind(&run.head_sha)
        .bind(&run.base_sha)
        .bind(&run.git_ref)
        .bind(run.pr_number.map(|n| n as i64))
        .bind(run.state.as_str())
        .bind(run.previous_state.map(|s| s.as_str()))
        .bind(run.run_type.as_str())
        .bind(serde_json::to_string(&run.policy_ids).map_err(|e| anyhow!(e))?)
        .bind(serde_json::to_string(&run.tools).map_err(|e| anyhow!(e))?)
        .bind(
            run.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| anyhow!(e))?,
        )
        .bind(run.findings_count as i64)
        .bind(&run.error)
        .bind(run.check_run_id.map(|n| n as i64))
        .bind(run.status_id.map(|n| n as i64))
        .bind(run.comment_id.map(|n| n as i64))
        .bind(to_primitive(run.created_at))
        .bind(run.queued_at.map(to_primitive))
        .bind(run.started_at.map(to_primitive))
        .bind(run.completed_at.map(to_primitive))
        .bind(run.timeout_seconds as i64)
        .bind(run.deadline.map(to_primitive))
        .bind(&run.worker_id)
        .bind(&run.worker_version)
        .bind(run.attempt as i64)
        .bind(run.max_attempts as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, run_id: Uuid) -> Result<Option<Run>, StoreError> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn commit_transition(
        &self,
        run: &Run,
        transition: &RunTransition,
        expected_state: RunState,
    ) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET state = ?, previous_state = ?, started_at = ?, completed_at = ?, error = ?, worker_id = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(run.state.as_str())
        .bind(run.previous_state.map(|s| s.as_str()))
        .bind(run.started_at.map(to_primitive))
        .bind(run.completed_at.map(to_primitive))
        .bind(&run.error)
        .bind(&run.worker_id)
        .bind(run.id.to_string())
        .bind(expected_state.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::StateConflict { run_id: run.id, expected: expected_state });
        }
        let seq = next_seq(&mut *tx, transition.run_id).await?;
        insert_transition(&mut *tx, transition, seq).await?;
        tx.commit().await?;
        Ok(seq)
    }

    async fn append_transition(&self, transition: &RunTransition) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;
        let seq = next_seq(&mut *tx, transition.run_id).await?;
        insert_transition(&mut *tx, transition, seq).await?;
        tx.commit().await?;
        Ok(seq)
    }

    async fn update_details(&self, run: &Run) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE runs
            SET result = ?, findings_count = ?, error = ?, check_run_id = ?, status_id = ?,
                comment_id = ?, worker_id = ?, worker_version = ?, attempt = ?
            WHERE id = ?
            "#,
        )
        .bind(
            run.result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| anyhow!(e))?,
        )
        .bind(run.findings_count as i64)
        .bind(&run.error)
        .bind(run.check_run_id.map(|n| n as i64))
        .bind(run.status_id.map(|n| n as i64))
        .bind(run.comment_id.map(|n| n as i64))
        .bind(&run.worker_id)
        .bind(&run.worker_version)
        .bind(run.attempt as i64)
        .bind(run.id.to_string())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(run.id));
        }
        Ok(())
    }

    async fn query(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        let mut builder = sqlx::QueryBuilder::<Sqlite>::new("SELECT * FROM runs WHERE 1 = 1");
        if let Some(org_id) = filter.org_id {
            builder.push(" AND org_id = ").push_bind(org_id.to_string());
        }
        if let Some(state) = filter.state {
            builder.push(" AND state = ").push_bind(state.as_str());
        }
        if let Some(repo_id) = filter.repo_id {
            builder.push(" AND repo_id = ").push_bind(repo_id.to_string());
        }
        if let Some(head_sha) = &filter.head_sha {
            builder.push(" AND head_sha = ").push_bind(head_sha.clone());
        }
        if let Some(pr_number) = filter.pr_number {
            builder.push(" AND pr_number = ").push_bind(pr_number as i64);
        }
        builder.push(" ORDER BY created_at DESC");
        builder.push(" LIMIT ").push_bind(filter.limit);
        builder.push(" OFFSET ").push_bind(filter.offset);
        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(run_from_row).collect()
    }

    async fn transitions(&self, run_id: Uuid) -> Result<Vec<RunTransition>, StoreError> {
        let rows = sqlx::query("SELECT * FROM run_transitions WHERE run_id = ? ORDER BY seq")
            .bind(run_id.to_string())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transition_from_row).collect()
    }

    async fn due_for_timeout(
        &self,
        now: UtcDateTime,
        limit: i64,
    ) -> Result<Vec<Run>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM runs
            WHERE state IN ('preparing', 'running') AND deadline IS NOT NULL AND deadline < ?
            ORDER BY deadline
            LIMIT ?
            "#,
        )
        .bind(to_primitive(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}
