//! Durable outbox for deferred and cascading propagation work.
//!
//! ## Lifecycle
//!
//! ```text
//! enqueue ──► pending ──claim──► processing ──done──► (deleted)
//!               ▲  │                  │
//!          merge┘  │                  └─failed─► pending (backoff) or dead letter
//! ```
//!
//! Tasks are deduplicated by a merge key `(workspace, table, plan hash, change type)`.
//! Enqueuing a task whose key matches a pending task merges into it instead: seed
//! records, dirty stats and lineage are unioned and the task becomes due immediately.
//! A failed task returning to pending absorbs any newer pending task with its key, so
//! each key has at most one pending task.
//!
//! Two implementations ship: [`memory::InMemoryOutbox`] for tests and single-process
//! embedding, and `postgres::PgOutbox` (feature `postgres`).

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use recalc_core::{FieldId, OutboxTaskId, RunId, TableId, WorkspaceId};

use crate::error::Result;
use crate::executor::DirtyStats;
use crate::plan::{ChangeType, SeedGroup, UpdatePlan, merge_seed_groups};
use crate::planner::ImpactHint;

/// Outbox settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Attempts before a task is dead-lettered.
    pub max_attempts: u32,
    /// Delay after the first failure, in milliseconds.
    pub backoff_base_ms: u64,
    /// Upper bound on any retry delay, in milliseconds.
    pub backoff_max_ms: u64,
    /// Random spread applied to retry delays, in percent of the delay.
    pub jitter_percent: u32,
    /// Seed records stored inline on the task; larger sets go to the overflow table.
    pub inline_seed_limit: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            backoff_base_ms: 1_000,
            backoff_max_ms: 300_000,
            jitter_percent: 20,
            inline_seed_limit: 1_000,
        }
    }
}

/// Retry delay after `attempts` failed attempts: `base * 2^attempts`, capped at
/// `backoff_max_ms` and spread by `jitter_percent` without exceeding the cap.
#[must_use]
pub fn backoff_delay(config: &OutboxConfig, attempts: u32) -> Duration {
    let factor = 1_u64.checked_shl(attempts.min(63)).unwrap_or(u64::MAX);
    let raw = config
        .backoff_base_ms
        .saturating_mul(factor)
        .min(config.backoff_max_ms);
    let spread = raw.saturating_mul(u64::from(config.jitter_percent)) / 100;
    if spread == 0 {
        return Duration::from_millis(raw);
    }
    let low = raw.saturating_sub(spread);
    let high = raw.saturating_add(spread).min(config.backoff_max_ms).max(low);
    Duration::from_millis(rand::thread_rng().gen_range(low..=high))
}

/// Kind of outbox work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxTaskKind {
    /// Replay a serialized plan.
    ComputedUpdate,
    /// Plan lazily from a change description.
    Seed,
    /// Recompute fields over a whole table.
    FieldBackfill,
}

impl OutboxTaskKind {
    /// Stable name used in storage, metrics and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ComputedUpdate => "computed_update",
            Self::Seed => "seed",
            Self::FieldBackfill => "field_backfill",
        }
    }
}

/// Work carried by a task. Seed records live on the task itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TaskPayload {
    /// A plan continuation.
    #[serde(rename_all = "camelCase")]
    ComputedUpdate {
        /// Plan to execute.
        plan: Box<UpdatePlan>,
    },
    /// A change to plan when claimed.
    #[serde(rename_all = "camelCase")]
    Seed {
        /// Fields written by the change.
        changed_field_ids: Vec<FieldId>,
        /// Caller classification of the change.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        impact_hint: Option<ImpactHint>,
    },
    /// A whole-table recompute.
    #[serde(rename_all = "camelCase")]
    FieldBackfill {
        /// Fields to recompute.
        field_ids: Vec<FieldId>,
    },
}

impl TaskPayload {
    /// Kind of this payload.
    #[must_use]
    pub const fn kind(&self) -> OutboxTaskKind {
        match self {
            Self::ComputedUpdate { .. } => OutboxTaskKind::ComputedUpdate,
            Self::Seed { .. } => OutboxTaskKind::Seed,
            Self::FieldBackfill { .. } => OutboxTaskKind::FieldBackfill,
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Waiting for `next_run_at`.
    Pending,
    /// Claimed by a worker.
    Processing,
    /// Finished; rows in this state are deleted.
    Done,
    /// Gave up after `max_attempts`.
    Dead,
}

impl TaskStatus {
    /// Stable name used in storage.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Done => "done",
            Self::Dead => "dead",
        }
    }
}

/// A stored outbox task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxTask {
    /// Task id.
    pub id: OutboxTaskId,
    /// Workspace of the work.
    pub workspace_id: WorkspaceId,
    /// Table the work is seeded on.
    pub table_id: TableId,
    /// Work to do.
    pub payload: TaskPayload,
    /// Change type of the seed.
    pub change_type: ChangeType,
    /// Plan hash, or the seed/backfill descriptor hash.
    pub plan_hash: String,
    /// Initially dirty records.
    pub seed_groups: Vec<SeedGroup>,
    /// Current status.
    pub status: TaskStatus,
    /// Failed attempts so far.
    pub attempts: u32,
    /// Attempts before dead-lettering.
    pub max_attempts: u32,
    /// Earliest time the task may be claimed.
    pub next_run_at: DateTime<Utc>,
    /// When the current claim was taken.
    pub locked_at: Option<DateTime<Utc>>,
    /// Worker holding the current claim.
    pub locked_by: Option<String>,
    /// Run this stage executes as.
    pub run_id: RunId,
    /// Runs that led to this one, oldest first.
    pub origin_run_ids: Vec<RunId>,
    /// Error of the last failed attempt.
    pub last_error: Option<String>,
    /// Dirty-set sizes seen so far in the cascade.
    pub dirty_stats: DirtyStats,
    /// Number of stages executed before this one.
    pub stage_depth: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl OutboxTask {
    /// Kind of work.
    #[must_use]
    pub const fn kind(&self) -> OutboxTaskKind {
        self.payload.kind()
    }

    /// Key pending tasks are merged by.
    #[must_use]
    pub fn merge_key(&self) -> String {
        merge_key(&self.workspace_id, &self.table_id, &self.plan_hash, self.change_type)
    }

    /// Number of seed records across groups.
    #[must_use]
    pub fn seed_record_count(&self) -> usize {
        self.seed_groups.iter().map(|g| g.record_ids.len()).sum()
    }

    /// Folds a new submission into this pending task.
    pub(crate) fn absorb(&mut self, new: NewOutboxTask, now: DateTime<Utc>) {
        self.fold(new.seed_groups, &new.dirty_stats, new.origin_run_ids);
        self.next_run_at = now;
        self.updated_at = now;
    }

    /// Folds a pending task with the same merge key into this one, which keeps its
    /// attempts and schedule.
    pub(crate) fn absorb_sibling(&mut self, sibling: OutboxTask) {
        self.fold(sibling.seed_groups, &sibling.dirty_stats, sibling.origin_run_ids);
    }

    fn fold(&mut self, seeds: Vec<SeedGroup>, stats: &DirtyStats, origin_run_ids: Vec<RunId>) {
        self.seed_groups = merge_seed_groups(self.seed_groups.drain(..).chain(seeds));
        self.dirty_stats.merge(stats);
        let mut origins = std::mem::take(&mut self.origin_run_ids);
        origins.extend(origin_run_ids);
        origins.sort();
        origins.dedup();
        self.origin_run_ids = origins;
    }
}

/// Builds the merge key of a task.
#[must_use]
pub fn merge_key(workspace_id: &WorkspaceId, table_id: &TableId, plan_hash: &str, change_type: ChangeType) -> String {
    format!("{workspace_id}:{table_id}:{plan_hash}:{}", change_type.as_str())
}

/// A task to enqueue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOutboxTask {
    /// Workspace of the work.
    pub workspace_id: WorkspaceId,
    /// Table the work is seeded on.
    pub table_id: TableId,
    /// Work to do.
    pub payload: TaskPayload,
    /// Change type of the seed.
    pub change_type: ChangeType,
    /// Merge identity.
    pub plan_hash: String,
    /// Initially dirty records.
    pub seed_groups: Vec<SeedGroup>,
    /// Stage depth of the work.
    pub stage_depth: u32,
    /// Run the work executes as.
    pub run_id: RunId,
    /// Runs that led to this one.
    pub origin_run_ids: Vec<RunId>,
    /// Dirty-set sizes carried from earlier stages.
    pub dirty_stats: DirtyStats,
}

fn descriptor_hash(domain: &str, preimage: &impl Serialize) -> Result<String> {
    let bytes = serde_json::to_vec(preimage)?;
    let mut hasher = Sha256::new();
    hasher.update(domain.as_bytes());
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

impl NewOutboxTask {
    /// A continuation replaying `plan` at `stage_depth`.
    #[must_use]
    pub fn computed_update(plan: UpdatePlan, stage_depth: u32) -> Self {
        Self {
            workspace_id: plan.workspace_id.clone(),
            table_id: plan.seed_table_id.clone(),
            change_type: plan.change_type,
            plan_hash: plan.plan_hash.clone(),
            seed_groups: plan.seed_groups(),
            stage_depth,
            run_id: RunId::generate(),
            origin_run_ids: Vec::new(),
            dirty_stats: DirtyStats::default(),
            payload: TaskPayload::ComputedUpdate { plan: Box::new(plan) },
        }
    }

    /// A change to plan when claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be hashed.
    pub fn seed(
        workspace_id: WorkspaceId,
        table_id: TableId,
        mut changed_field_ids: Vec<FieldId>,
        seed_groups: Vec<SeedGroup>,
        change_type: ChangeType,
        impact_hint: Option<ImpactHint>,
    ) -> Result<Self> {
        changed_field_ids.sort();
        changed_field_ids.dedup();
        let plan_hash = descriptor_hash(
            "recalc-seed:v1:",
            &(&workspace_id, &table_id, &changed_field_ids, change_type, &impact_hint),
        )?;
        Ok(Self {
            workspace_id,
            table_id,
            change_type,
            plan_hash,
            seed_groups: merge_seed_groups(seed_groups),
            stage_depth: 0,
            run_id: RunId::generate(),
            origin_run_ids: Vec::new(),
            dirty_stats: DirtyStats::default(),
            payload: TaskPayload::Seed {
                changed_field_ids,
                impact_hint,
            },
        })
    }

    /// A whole-table recompute of `field_ids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the descriptor cannot be hashed.
    pub fn field_backfill(workspace_id: WorkspaceId, table_id: TableId, mut field_ids: Vec<FieldId>) -> Result<Self> {
        field_ids.sort();
        field_ids.dedup();
        let plan_hash = descriptor_hash("recalc-backfill:v1:", &(&workspace_id, &table_id, &field_ids))?;
        Ok(Self {
            workspace_id,
            table_id,
            change_type: ChangeType::Update,
            plan_hash,
            seed_groups: Vec::new(),
            stage_depth: 0,
            run_id: RunId::generate(),
            origin_run_ids: Vec::new(),
            dirty_stats: DirtyStats::default(),
            payload: TaskPayload::FieldBackfill { field_ids },
        })
    }

    /// Records the run that produced this task.
    #[must_use]
    pub fn with_parent(mut self, parent: &OutboxTask) -> Self {
        let mut origins = parent.origin_run_ids.clone();
        origins.push(parent.run_id);
        self.origin_run_ids = origins;
        self
    }

    /// Carries dirty stats forward.
    #[must_use]
    pub fn with_dirty_stats(mut self, stats: DirtyStats) -> Self {
        self.dirty_stats = stats;
        self
    }

    /// Key pending tasks are merged by.
    #[must_use]
    pub fn merge_key(&self) -> String {
        merge_key(&self.workspace_id, &self.table_id, &self.plan_hash, self.change_type)
    }

    /// Materializes the stored form.
    pub(crate) fn into_task(self, max_attempts: u32, now: DateTime<Utc>) -> OutboxTask {
        OutboxTask {
            id: OutboxTaskId::generate(),
            workspace_id: self.workspace_id,
            table_id: self.table_id,
            payload: self.payload,
            change_type: self.change_type,
            plan_hash: self.plan_hash,
            seed_groups: self.seed_groups,
            status: TaskStatus::Pending,
            attempts: 0,
            max_attempts,
            next_run_at: now,
            locked_at: None,
            locked_by: None,
            run_id: self.run_id,
            origin_run_ids: self.origin_run_ids,
            last_error: None,
            dirty_stats: self.dirty_stats,
            stage_depth: self.stage_depth,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Result of [`Outbox::enqueue_or_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueResult {
    /// Task holding the work.
    pub task_id: OutboxTaskId,
    /// Whether the work merged into an existing pending task.
    pub merged: bool,
}

/// Result of [`Outbox::mark_failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// The task will run again.
    Rescheduled {
        /// Failed attempts so far.
        attempts: u32,
        /// When the task becomes due.
        next_run_at: DateTime<Utc>,
    },
    /// The task was moved to the dead-letter table.
    DeadLettered {
        /// Failed attempts so far.
        attempts: u32,
    },
}

impl FailureOutcome {
    /// Stable outcome name for metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Rescheduled { .. } => "rescheduled",
            Self::DeadLettered { .. } => "dead",
        }
    }
}

/// A task that exhausted its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Task as of its last attempt.
    pub task: OutboxTask,
    /// Error of the last attempt.
    pub error: String,
    /// When it was dead-lettered.
    pub failed_at: DateTime<Utc>,
}

/// Durable queue of propagation work.
#[async_trait]
pub trait Outbox: Send + Sync {
    /// Inserts a task, or merges it into a pending task with the same merge key.
    async fn enqueue_or_merge(&self, task: NewOutboxTask) -> Result<EnqueueResult>;

    /// Claims up to `limit` due pending tasks for `worker_id`.
    async fn claim_batch(&self, worker_id: &str, limit: usize) -> Result<Vec<OutboxTask>>;

    /// Deletes a finished task and its overflow seeds.
    async fn mark_done(&self, task_id: &OutboxTaskId) -> Result<()>;

    /// Records a failed attempt; reschedules with backoff or dead-letters.
    async fn mark_failed(&self, task: &OutboxTask, error: &str) -> Result<FailureOutcome>;

    /// Lists dead letters, newest first.
    async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>>;

    /// Number of pending tasks.
    async fn pending_count(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::RecordId;

    fn no_jitter() -> OutboxConfig {
        OutboxConfig {
            jitter_percent: 0,
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..OutboxConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let config = no_jitter();
        let delays: Vec<u64> = (0..6)
            .map(|a| u64::try_from(backoff_delay(&config, a).as_millis()).unwrap())
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1_000, 1_000]);
        assert_eq!(backoff_delay(&config, 200), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_spread_and_cap() {
        let config = OutboxConfig {
            jitter_percent: 50,
            ..no_jitter()
        };
        for _ in 0..100 {
            let d = backoff_delay(&config, 1);
            assert!(d >= Duration::from_millis(100) && d <= Duration::from_millis(300));
            assert!(backoff_delay(&config, 10) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn seed_tasks_with_same_change_share_a_key() -> Result<()> {
        let a = NewOutboxTask::seed(
            WorkspaceId::new("bse1"),
            TableId::new("tblA"),
            vec![FieldId::new("fldB"), FieldId::new("fldA")],
            vec![SeedGroup::new(TableId::new("tblA"), [RecordId::new("rec1")])],
            ChangeType::Update,
            None,
        )?;
        let b = NewOutboxTask::seed(
            WorkspaceId::new("bse1"),
            TableId::new("tblA"),
            vec![FieldId::new("fldA"), FieldId::new("fldB")],
            vec![SeedGroup::new(TableId::new("tblA"), [RecordId::new("rec2")])],
            ChangeType::Update,
            None,
        )?;
        assert_eq!(a.merge_key(), b.merge_key());

        let mut task = a.into_task(3, Utc::now());
        task.absorb(b, Utc::now());
        assert_eq!(task.seed_record_count(), 2);
        Ok(())
    }

    #[test]
    fn payload_serializes_with_kind_tag() -> Result<()> {
        let task = NewOutboxTask::field_backfill(
            WorkspaceId::new("bse1"),
            TableId::new("tblA"),
            vec![FieldId::new("fldX")],
        )?;
        let json = serde_json::to_value(&task.payload)?;
        assert_eq!(json["kind"], "fieldBackfill");
        assert_eq!(json["fieldIds"][0], "fldX");
        Ok(())
    }
}
