//! PostgreSQL outbox.
//!
//! - Enqueue and merge run under `pg_advisory_xact_lock(hashtext(merge_key))`, so two
//!   submissions of the same work serialize and the second merges into the first.
//! - Claims use `FOR UPDATE SKIP LOCKED`, so concurrent workers never block on or
//!   double-claim a task.
//! - Seed sets above `inline_seed_limit` are stored one row per record in
//!   `recalc_outbox_seeds` and rehydrated on read.
//! - A unique partial index allows one pending task per merge key. A failed task
//!   going back to pending absorbs any newer pending task with its key.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, Row, Transaction};

use recalc_core::{OutboxTaskId, RecordId, RunId, TableId, WorkspaceId};

use super::{
    DeadLetter, EnqueueResult, FailureOutcome, NewOutboxTask, Outbox, OutboxConfig, OutboxTask,
    TaskPayload, TaskStatus, backoff_delay,
};
use crate::error::{Error, Result};
use crate::executor::DirtyStats;
use crate::metrics::EngineMetrics;
use crate::plan::{ChangeType, SeedGroup, merge_seed_groups};

const SCHEMA: &[&str] = &[
    r"
    CREATE TABLE IF NOT EXISTS recalc_outbox (
        id TEXT PRIMARY KEY,
        workspace_id TEXT NOT NULL,
        table_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        merge_key TEXT NOT NULL,
        plan_hash TEXT NOT NULL,
        change_type TEXT NOT NULL,
        payload JSONB NOT NULL,
        seed_groups JSONB NOT NULL,
        seeds_overflowed BOOLEAN NOT NULL DEFAULT FALSE,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        max_attempts INTEGER NOT NULL,
        next_run_at TIMESTAMPTZ NOT NULL,
        locked_at TIMESTAMPTZ,
        locked_by TEXT,
        run_id TEXT NOT NULL,
        origin_run_ids JSONB NOT NULL,
        last_error TEXT,
        dirty_stats JSONB NOT NULL,
        stage_depth INTEGER NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )
    ",
    r"
    CREATE INDEX IF NOT EXISTS recalc_outbox_due_idx
        ON recalc_outbox (status, next_run_at)
    ",
    r"
    DROP INDEX IF EXISTS recalc_outbox_merge_idx
    ",
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS recalc_outbox_pending_merge_key
        ON recalc_outbox (merge_key) WHERE status = 'pending'
    ",
    r"
    CREATE TABLE IF NOT EXISTS recalc_outbox_seeds (
        task_id TEXT NOT NULL,
        table_id TEXT NOT NULL,
        record_id TEXT NOT NULL,
        PRIMARY KEY (task_id, table_id, record_id)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS recalc_outbox_dead (
        id TEXT PRIMARY KEY,
        task JSONB NOT NULL,
        error TEXT NOT NULL,
        failed_at TIMESTAMPTZ NOT NULL
    )
    ",
];

fn parse_status(value: &str) -> Result<TaskStatus> {
    match value {
        "pending" => Ok(TaskStatus::Pending),
        "processing" => Ok(TaskStatus::Processing),
        "done" => Ok(TaskStatus::Done),
        "dead" => Ok(TaskStatus::Dead),
        other => Err(Error::storage(format!("unknown outbox status '{other}'"))),
    }
}

fn parse_change_type(value: &str) -> Result<ChangeType> {
    match value {
        "insert" => Ok(ChangeType::Insert),
        "update" => Ok(ChangeType::Update),
        "delete" => Ok(ChangeType::Delete),
        other => Err(Error::storage(format!("unknown change type '{other}'"))),
    }
}

fn to_u32(value: i32, column: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::storage(format!("negative {column}: {value}")))
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn task_from_row(row: &PgRow) -> Result<OutboxTask> {
    let id: String = row.try_get("id")?;
    let run_id: String = row.try_get("run_id")?;
    let status: String = row.try_get("status")?;
    let change_type: String = row.try_get("change_type")?;
    let Json(payload): Json<TaskPayload> = row.try_get("payload")?;
    let Json(seed_groups): Json<Vec<SeedGroup>> = row.try_get("seed_groups")?;
    let Json(origin_run_ids): Json<Vec<RunId>> = row.try_get("origin_run_ids")?;
    let Json(dirty_stats): Json<DirtyStats> = row.try_get("dirty_stats")?;

    Ok(OutboxTask {
        id: id.parse()?,
        workspace_id: WorkspaceId::new(row.try_get::<String, _>("workspace_id")?),
        table_id: TableId::new(row.try_get::<String, _>("table_id")?),
        payload,
        change_type: parse_change_type(&change_type)?,
        plan_hash: row.try_get("plan_hash")?,
        seed_groups,
        status: parse_status(&status)?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        next_run_at: row.try_get("next_run_at")?,
        locked_at: row.try_get("locked_at")?,
        locked_by: row.try_get("locked_by")?,
        run_id: run_id.parse()?,
        origin_run_ids,
        last_error: row.try_get("last_error")?,
        dirty_stats,
        stage_depth: to_u32(row.try_get("stage_depth")?, "stage_depth")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// PostgreSQL-backed outbox.
#[derive(Debug, Clone)]
pub struct PgOutbox {
    pool: PgPool,
    config: OutboxConfig,
    metrics: EngineMetrics,
}

impl PgOutbox {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: PgPool, config: OutboxConfig) -> Self {
        Self {
            pool,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Connects to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool cannot connect.
    pub async fn connect(database_url: &str, max_connections: u32, config: OutboxConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool, config))
    }

    /// Creates the outbox tables if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a statement fails.
    pub async fn migrate(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn overflow_seeds(
        tx: &mut Transaction<'_, Postgres>,
        task_id: &OutboxTaskId,
    ) -> Result<Vec<SeedGroup>> {
        let rows = sqlx::query("SELECT table_id, record_id FROM recalc_outbox_seeds WHERE task_id = $1")
            .bind(task_id.to_string())
            .fetch_all(&mut **tx)
            .await?;
        let mut grouped: BTreeMap<TableId, Vec<RecordId>> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("table_id")?;
            let record: String = row.try_get("record_id")?;
            grouped.entry(TableId::new(table)).or_default().push(RecordId::new(record));
        }
        Ok(grouped
            .into_iter()
            .map(|(table_id, ids)| SeedGroup::new(table_id, ids))
            .collect())
    }

    async fn hydrate(&self, tx: &mut Transaction<'_, Postgres>, row: &PgRow) -> Result<OutboxTask> {
        let mut task = task_from_row(row)?;
        let overflowed: bool = row.try_get("seeds_overflowed")?;
        if overflowed {
            let extra = Self::overflow_seeds(tx, &task.id).await?;
            task.seed_groups = merge_seed_groups(task.seed_groups.drain(..).chain(extra));
        }
        Ok(task)
    }

    /// Folds a pending task sharing `stored`'s merge key into it, so `stored` can go
    /// back to pending without breaking the one-pending-task-per-key index.
    async fn fold_pending_sibling(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        stored: &mut OutboxTask,
    ) -> Result<()> {
        let key = stored.merge_key();
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&key)
            .execute(&mut **tx)
            .await?;
        let row = sqlx::query(
            "SELECT * FROM recalc_outbox WHERE merge_key = $1 AND status = 'pending' AND id <> $2 FOR UPDATE",
        )
        .bind(&key)
        .bind(stored.id.to_string())
        .fetch_optional(&mut **tx)
        .await?;
        let Some(row) = row else {
            return Ok(());
        };

        let sibling = self.hydrate(tx, &row).await?;
        sqlx::query("DELETE FROM recalc_outbox_seeds WHERE task_id = $1")
            .bind(sibling.id.to_string())
            .execute(&mut **tx)
            .await?;
        sqlx::query("DELETE FROM recalc_outbox WHERE id = $1")
            .bind(sibling.id.to_string())
            .execute(&mut **tx)
            .await?;
        tracing::debug!(task = %stored.id, sibling = %sibling.id, "folded pending sibling into retried task");
        stored.absorb_sibling(sibling);

        let (inline, overflowed) = self.store_seeds(tx, &stored.id, &stored.seed_groups).await?;
        sqlx::query(
            r"
            UPDATE recalc_outbox
            SET seed_groups = $2, seeds_overflowed = $3, dirty_stats = $4, origin_run_ids = $5
            WHERE id = $1
            ",
        )
        .bind(stored.id.to_string())
        .bind(Json(&inline))
        .bind(overflowed)
        .bind(Json(&stored.dirty_stats))
        .bind(Json(&stored.origin_run_ids))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Splits seeds into the inline column and overflow rows; returns the inline part.
    async fn store_seeds(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: &OutboxTaskId,
        seeds: &[SeedGroup],
    ) -> Result<(Vec<SeedGroup>, bool)> {
        sqlx::query("DELETE FROM recalc_outbox_seeds WHERE task_id = $1")
            .bind(task_id.to_string())
            .execute(&mut **tx)
            .await?;
        let count: usize = seeds.iter().map(|g| g.record_ids.len()).sum();
        if count <= self.config.inline_seed_limit {
            return Ok((seeds.to_vec(), false));
        }

        let mut tables = Vec::with_capacity(count);
        let mut records = Vec::with_capacity(count);
        for group in seeds {
            for record in &group.record_ids {
                tables.push(group.table_id.to_string());
                records.push(record.to_string());
            }
        }
        sqlx::query(
            r"
            INSERT INTO recalc_outbox_seeds (task_id, table_id, record_id)
            SELECT $1, t, r FROM UNNEST($2::text[], $3::text[]) AS u(t, r)
            ON CONFLICT DO NOTHING
            ",
        )
        .bind(task_id.to_string())
        .bind(&tables)
        .bind(&records)
        .execute(&mut **tx)
        .await?;
        Ok((Vec::new(), true))
    }
}

#[async_trait]
impl Outbox for PgOutbox {
    #[tracing::instrument(skip(self, task), fields(kind = task.payload.kind().as_str(), table = %task.table_id))]
    async fn enqueue_or_merge(&self, task: NewOutboxTask) -> Result<EnqueueResult> {
        let key = task.merge_key();
        let kind = task.payload.kind();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&key)
            .execute(&mut *tx)
            .await?;

        let existing = sqlx::query(
            "SELECT * FROM recalc_outbox WHERE merge_key = $1 AND status = 'pending' LIMIT 1 FOR UPDATE",
        )
        .bind(&key)
        .fetch_optional(&mut *tx)
        .await?;

        let result = if let Some(row) = existing {
            let mut stored = self.hydrate(&mut tx, &row).await?;
            stored.absorb(task, now);
            let (inline, overflowed) = self.store_seeds(&mut tx, &stored.id, &stored.seed_groups).await?;
            sqlx::query(
                r"
                UPDATE recalc_outbox
                SET seed_groups = $2, seeds_overflowed = $3, dirty_stats = $4,
                    origin_run_ids = $5, next_run_at = $6, updated_at = $6
                WHERE id = $1
                ",
            )
            .bind(stored.id.to_string())
            .bind(Json(&inline))
            .bind(overflowed)
            .bind(Json(&stored.dirty_stats))
            .bind(Json(&stored.origin_run_ids))
            .bind(now)
            .execute(&mut *tx)
            .await?;
            EnqueueResult {
                task_id: stored.id,
                merged: true,
            }
        } else {
            let stored = task.into_task(self.config.max_attempts, now);
            let (inline, overflowed) = self.store_seeds(&mut tx, &stored.id, &stored.seed_groups).await?;
            sqlx::query(
                r"
                INSERT INTO recalc_outbox (
                    id, workspace_id, table_id, kind, merge_key, plan_hash, change_type,
                    payload, seed_groups, seeds_overflowed, status, attempts, max_attempts,
                    next_run_at, run_id, origin_run_ids, dirty_stats, stage_depth,
                    created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', 0, $11,
                        $12, $13, $14, $15, $16, $12, $12)
                ",
            )
            .bind(stored.id.to_string())
            .bind(stored.workspace_id.as_str())
            .bind(stored.table_id.as_str())
            .bind(kind.as_str())
            .bind(&key)
            .bind(&stored.plan_hash)
            .bind(stored.change_type.as_str())
            .bind(Json(&stored.payload))
            .bind(Json(&inline))
            .bind(overflowed)
            .bind(to_i32(stored.max_attempts))
            .bind(now)
            .bind(stored.run_id.to_string())
            .bind(Json(&stored.origin_run_ids))
            .bind(Json(&stored.dirty_stats))
            .bind(to_i32(stored.stage_depth))
            .execute(&mut *tx)
            .await?;
            EnqueueResult {
                task_id: stored.id,
                merged: false,
            }
        };

        tx.commit().await?;
        self.metrics.record_enqueue(kind.as_str(), result.merged);
        Ok(result)
    }

    #[tracing::instrument(skip(self))]
    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxTask>> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r"
            WITH due AS (
                SELECT id
                FROM recalc_outbox
                WHERE status = 'pending' AND next_run_at <= NOW()
                ORDER BY next_run_at, id
                FOR UPDATE SKIP LOCKED
                LIMIT $1
            )
            UPDATE recalc_outbox o
            SET status = 'processing', locked_at = NOW(), locked_by = $2, updated_at = NOW()
            FROM due
            WHERE o.id = due.id
            RETURNING o.*
            ",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .bind(worker_id)
        .fetch_all(&mut *tx)
        .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in &rows {
            tasks.push(self.hydrate(&mut tx, row).await?);
        }
        tx.commit().await?;
        tasks.sort_by(|a, b| (a.next_run_at, a.id).cmp(&(b.next_run_at, b.id)));
        Ok(tasks)
    }

    async fn mark_done(&self, task_id: &OutboxTaskId) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM recalc_outbox_seeds WHERE task_id = $1")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM recalc_outbox WHERE id = $1")
            .bind(task_id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        if deleted == 0 {
            return Err(Error::TaskNotFound { task_id: *task_id });
        }
        Ok(())
    }

    async fn mark_failed(&self, task: &OutboxTask, error: &str) -> Result<FailureOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query("SELECT * FROM recalc_outbox WHERE id = $1 FOR UPDATE")
            .bind(task.id.to_string())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(Error::TaskNotFound { task_id: task.id })?;
        let mut stored = self.hydrate(&mut tx, &row).await?;

        let previous = stored.attempts;
        let attempts = previous + 1;
        if attempts < stored.max_attempts {
            self.fold_pending_sibling(&mut tx, &mut stored).await?;
            let delay = backoff_delay(&self.config, previous);
            let next_run_at: DateTime<Utc> =
                now + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            sqlx::query(
                r"
                UPDATE recalc_outbox
                SET status = 'pending', attempts = $2, last_error = $3, next_run_at = $4,
                    locked_at = NULL, locked_by = NULL, updated_at = $5
                WHERE id = $1
                ",
            )
            .bind(task.id.to_string())
            .bind(to_i32(attempts))
            .bind(error)
            .bind(next_run_at)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(FailureOutcome::Rescheduled { attempts, next_run_at });
        }

        stored.attempts = attempts;
        stored.status = TaskStatus::Dead;
        stored.last_error = Some(error.to_string());
        stored.locked_at = None;
        stored.locked_by = None;
        stored.updated_at = now;
        sqlx::query("INSERT INTO recalc_outbox_dead (id, task, error, failed_at) VALUES ($1, $2, $3, $4)")
            .bind(task.id.to_string())
            .bind(Json(&stored))
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM recalc_outbox_seeds WHERE task_id = $1")
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM recalc_outbox WHERE id = $1")
            .bind(task.id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::warn!(task = %task.id, attempts, error, "outbox task dead-lettered");
        Ok(FailureOutcome::DeadLettered { attempts })
    }

    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query("SELECT task, error, failed_at FROM recalc_outbox_dead ORDER BY failed_at DESC LIMIT $1")
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let Json(task): Json<OutboxTask> = row.try_get("task")?;
                Ok(DeadLetter {
                    task,
                    error: row.try_get("error")?,
                    failed_at: row.try_get("failed_at")?,
                })
            })
            .collect()
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM recalc_outbox WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_allows_one_pending_task_per_merge_key() {
        let unique = SCHEMA
            .iter()
            .find(|statement| statement.contains("recalc_outbox_pending_merge_key") && statement.contains("CREATE"))
            .expect("pending merge key index");
        assert!(unique.contains("CREATE UNIQUE INDEX"));
        assert!(unique.contains("(merge_key) WHERE status = 'pending'"));
    }
}
