//! Stage execution shared by the service and the outbox worker.
//!
//! A stage runs a window of plan levels in one transaction: locks, dirty propagation,
//! bulk updates, commit. Whatever the stage updated seeds the next stage, which is
//! re-planned from the updated fields and enqueued as a computed-update task.

use std::collections::HashSet;
use std::sync::Arc;

use recalc_core::catalog::FieldCatalog;
use recalc_core::{FieldId, RunId, TableId, WorkspaceId};

use crate::error::Result;
use crate::events::{RecordChangeSink, publish_best_effort};
use crate::executor::{DirtyStats, ExecutionOutcome, Executor};
use crate::graph::GraphBuilder;
use crate::lock::{LockConfig, LockMode, LockPlan, acquire_lock_plan, build_lock_plan};
use crate::metrics::EngineMetrics;
use crate::outbox::{EnqueueResult, NewOutboxTask, Outbox};
use crate::plan::{ChangeType, UpdatePlan, UpdateStep};
use crate::planner::{PlanRequest, Planner};
use crate::retry::{RetryPolicy, with_retry};
use crate::store::{ComputeTransaction, RecordStore};

/// Result of one committed stage.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Run id of this stage.
    pub run_id: RunId,
    /// Lock granularity used.
    pub lock_mode: LockMode,
    /// Dirty-set sizes after propagation.
    pub dirty_stats: DirtyStats,
    /// What the stage wrote.
    pub outcome: ExecutionOutcome,
    /// Plan levels executed.
    pub executed_levels: Vec<u32>,
    /// True if the plan had levels beyond the window.
    pub truncated: bool,
}

/// Where a continuation came from.
#[derive(Debug, Clone, Default)]
pub(crate) struct Lineage {
    pub(crate) origin_run_ids: Vec<RunId>,
    pub(crate) stage_depth: u32,
    pub(crate) dirty_stats: DirtyStats,
}

/// Components needed to run stages.
pub(crate) struct Cascade {
    pub(crate) catalog: Arc<dyn FieldCatalog>,
    pub(crate) graphs: GraphBuilder,
    pub(crate) planner: Planner,
    pub(crate) executor: Executor,
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) outbox: Arc<dyn Outbox>,
    pub(crate) sink: Arc<dyn RecordChangeSink>,
    pub(crate) locks: LockConfig,
    pub(crate) retry: RetryPolicy,
    pub(crate) metrics: EngineMetrics,
}

impl Cascade {
    /// Loads the graph a request needs and plans it.
    ///
    /// Inserts and deletes load every field of the changed table so context-free
    /// formulas and conditional sources are visible to the planner.
    pub(crate) async fn plan(&self, request: &PlanRequest) -> Result<UpdatePlan> {
        let mut seeds: Vec<FieldId> = request.changed_field_ids.clone();
        if matches!(request.change_type, ChangeType::Insert | ChangeType::Delete) {
            seeds.extend(
                self.catalog
                    .list_fields(&request.table_id)
                    .await?
                    .into_iter()
                    .map(|f| f.id),
            );
            seeds.sort();
            seeds.dedup();
        }
        let graph = self.graphs.load(&request.workspace_id, Some(&seeds)).await?;
        self.planner.plan(&graph, request)
    }

    /// Runs the first `max_levels` levels of `plan` (0 runs all) in one transaction as
    /// run `run_id`, retrying transient failures, then publishes the collected changes.
    #[tracing::instrument(
        skip(self, plan),
        fields(run_id = %run_id, workspace = %plan.workspace_id, table = %plan.seed_table_id, plan_hash = %plan.plan_hash)
    )]
    pub(crate) async fn run_stage(&self, plan: &UpdatePlan, max_levels: usize, run_id: RunId) -> Result<StageReport> {
        let levels = plan.levels();
        let window = if max_levels == 0 { levels.len() } else { max_levels.min(levels.len()) };
        let executed_levels: Vec<u32> = levels[..window].to_vec();
        let steps: Vec<UpdateStep> = plan
            .steps
            .iter()
            .filter(|s| executed_levels.contains(&s.level))
            .cloned()
            .collect();

        let lock_plan = build_lock_plan(&plan.workspace_id, &plan.seed_groups(), &self.locks);
        let (dirty_stats, outcome) = with_retry(&self.retry, "execute_stage", || async {
            let mut tx = self.store.begin().await?;
            let result = self.run_in(tx.as_mut(), plan, &steps, &lock_plan).await;
            finish(tx, result).await
        })
        .await?;

        publish_best_effort(self.sink.as_ref(), &outcome.record_changes).await;
        tracing::info!(
            levels = executed_levels.len(),
            remaining_levels = levels.len() - window,
            updated_groups = outcome.updated.len(),
            dirty = dirty_stats.total(),
            "stage committed"
        );
        Ok(StageReport {
            run_id,
            lock_mode: lock_plan.mode,
            dirty_stats,
            outcome,
            executed_levels,
            truncated: window < levels.len(),
        })
    }

    async fn run_in(
        &self,
        tx: &mut dyn ComputeTransaction,
        plan: &UpdatePlan,
        steps: &[UpdateStep],
        lock_plan: &LockPlan,
    ) -> Result<(DirtyStats, ExecutionOutcome)> {
        acquire_lock_plan(tx, lock_plan, &self.metrics).await?;
        let stats = self.executor.prepare_dirty_state(tx, plan).await?;
        let outcome = self.executor.execute_steps(tx, plan, steps).await?;
        Ok((stats, outcome))
    }

    /// Recomputes `field_ids` over every row of `table_id` in one transaction, then
    /// publishes the collected changes.
    #[tracing::instrument(skip(self, field_ids), fields(table = %table_id, fields = field_ids.len()))]
    pub(crate) async fn run_backfill(&self, table_id: &TableId, field_ids: &[FieldId]) -> Result<ExecutionOutcome> {
        let outcome = with_retry(&self.retry, "field_backfill", || async {
            let mut tx = self.store.begin().await?;
            let result = self.executor.execute_backfill(tx.as_mut(), table_id, field_ids).await;
            finish(tx, result).await
        })
        .await?;
        publish_best_effort(self.sink.as_ref(), &outcome.record_changes).await;
        tracing::info!(updated_groups = outcome.updated.len(), "field backfill committed");
        Ok(outcome)
    }

    /// Re-plans the work that follows `outcome`: one plan per table that received
    /// updates, seeded by the updated rows and fields, minus fields this stage already
    /// computed. Empty plans are dropped.
    pub(crate) async fn follow_on_plans(
        &self,
        workspace_id: &WorkspaceId,
        seed_table_id: &TableId,
        change_type: ChangeType,
        outcome: &ExecutionOutcome,
    ) -> Result<Vec<UpdatePlan>> {
        let executed: HashSet<FieldId> = outcome.executed_field_ids();
        let mut plans = Vec::new();
        for group in &outcome.updated {
            if group.record_ids.is_empty() || group.field_ids.is_empty() {
                continue;
            }
            // Rows touched by a stage were updated, whatever started the cascade.
            let follow_on_type = if &group.table_id == seed_table_id {
                change_type.downgraded()
            } else {
                ChangeType::Update
            };
            let request = PlanRequest::new(
                workspace_id.clone(),
                group.table_id.clone(),
                group.field_ids.clone(),
                group.record_ids.clone(),
                follow_on_type,
            );
            let plan = self.plan(&request).await?.without_fields(&executed)?;
            if !plan.is_empty() {
                plans.push(plan);
            }
        }
        Ok(plans)
    }

    /// Enqueues follow-on plans at `lineage.stage_depth + 1`, or drops them when that
    /// exceeds `max_stage_depth`.
    pub(crate) async fn enqueue_follow_ons(
        &self,
        plans: Vec<UpdatePlan>,
        lineage: &Lineage,
        max_stage_depth: u32,
    ) -> Result<Vec<EnqueueResult>> {
        if plans.is_empty() {
            return Ok(Vec::new());
        }
        let depth = lineage.stage_depth + 1;
        if depth > max_stage_depth {
            self.metrics.record_depth_truncated();
            tracing::warn!(
                depth,
                max_stage_depth,
                dropped_plans = plans.len(),
                "cascade reached the stage-depth cap; follow-on stages are not enqueued"
            );
            return Ok(Vec::new());
        }

        let mut results = Vec::with_capacity(plans.len());
        for plan in plans {
            let mut task = NewOutboxTask::computed_update(plan, depth).with_dirty_stats(lineage.dirty_stats.clone());
            task.origin_run_ids.clone_from(&lineage.origin_run_ids);
            results.push(self.enqueue(task).await?);
        }
        Ok(results)
    }

    /// Enqueues `task`, retrying transient merge races.
    pub(crate) async fn enqueue(&self, task: NewOutboxTask) -> Result<EnqueueResult> {
        let kind = task.payload.kind().as_str();
        let result = with_retry(&self.retry, "enqueue_or_merge", || self.outbox.enqueue_or_merge(task.clone())).await?;
        self.metrics.record_enqueue(kind, result.merged);
        tracing::debug!(task_id = %result.task_id, kind, merged = result.merged, "enqueued outbox task");
        Ok(result)
    }
}

/// Commits on success and rolls back on failure.
async fn finish<T>(tx: Box<dyn ComputeTransaction>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(error)
        }
    }
}
