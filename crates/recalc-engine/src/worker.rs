//! Outbox worker: claims due tasks and runs them as cascade stages.
//!
//! Each computed-update task executes a window of its plan's levels, re-plans the
//! follow-on work from what it updated, durably enqueues that continuation, and only
//! then retires the task. Seed tasks are planned on claim; field-backfill tasks
//! recompute whole tables. Task failures are recorded on the task (rescheduled with
//! backoff or dead-lettered) and never surface to the caller of [`OutboxWorker::run_once`].

use std::sync::Arc;
use std::time::Duration;

use recalc_core::FieldId;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cascade::{Cascade, Lineage, StageReport};
use crate::error::Result;
use crate::executor::DirtyStats;
use crate::outbox::{OutboxTask, TaskPayload};
use crate::plan::{ChangeType, SeedGroup, UpdatePlan};
use crate::planner::{ImpactHint, PlanRequest};

/// Worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Identity recorded as `lockedBy` on claimed tasks.
    pub worker_id: String,
    /// Tasks claimed per poll.
    pub batch_size: usize,
    /// Sleep between polls that found nothing, in milliseconds.
    pub poll_interval_ms: u64,
    /// Plan levels executed per stage; 0 runs the whole plan.
    pub max_levels_per_stage: usize,
    /// Deepest continuation the worker enqueues.
    pub max_stage_depth: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "recalc-worker".to_string(),
            batch_size: 10,
            poll_interval_ms: 1_000,
            max_levels_per_stage: 0,
            max_stage_depth: 16,
        }
    }
}

impl WorkerConfig {
    /// Poll interval as a duration.
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Counts from one claim-and-process pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Tasks claimed.
    pub claimed: usize,
    /// Tasks retired as done.
    pub succeeded: usize,
    /// Tasks rescheduled or dead-lettered.
    pub failed: usize,
}

/// Polls the outbox and executes claimed tasks.
#[derive(Clone)]
pub struct OutboxWorker {
    cascade: Arc<Cascade>,
    config: WorkerConfig,
}

impl std::fmt::Debug for OutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker").field("config", &self.config).finish_non_exhaustive()
    }
}

impl OutboxWorker {
    pub(crate) const fn new(cascade: Arc<Cascade>, config: WorkerConfig) -> Self {
        Self { cascade, config }
    }

    /// Returns the worker settings.
    #[must_use]
    pub const fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Claims one batch and processes every task in it.
    ///
    /// # Errors
    ///
    /// Returns an error only if claiming, or recording a task's outcome, fails.
    #[tracing::instrument(skip(self), fields(worker = %self.config.worker_id))]
    pub async fn run_once(&self) -> Result<BatchReport> {
        let tasks = self
            .cascade
            .outbox
            .claim_batch(&self.config.worker_id, self.config.batch_size.max(1))
            .await?;
        let mut report = BatchReport {
            claimed: tasks.len(),
            ..BatchReport::default()
        };
        for task in tasks {
            if self.process(&task).await? {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                succeeded = report.succeeded,
                failed = report.failed,
                "processed outbox batch"
            );
        }
        Ok(report)
    }

    /// Runs passes until one claims nothing, returning the accumulated counts.
    ///
    /// Tasks waiting out a backoff are not due and end the drain.
    ///
    /// # Errors
    ///
    /// Returns the first error from [`Self::run_once`].
    pub async fn drain(&self) -> Result<BatchReport> {
        let mut total = BatchReport::default();
        loop {
            let pass = self.run_once().await?;
            if pass.claimed == 0 {
                return Ok(total);
            }
            total.claimed += pass.claimed;
            total.succeeded += pass.succeeded;
            total.failed += pass.failed;
        }
    }

    /// Polls until `shutdown` turns true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            worker = %self.config.worker_id,
            poll_interval_ms = self.config.poll_interval_ms,
            "outbox worker started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.run_once().await {
                Ok(report) => report.claimed == 0,
                Err(error) => {
                    tracing::error!(error = %error, "outbox poll failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    () = tokio::time::sleep(self.config.poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!(worker = %self.config.worker_id, "outbox worker stopped");
    }

    /// Processes one task, recording its outcome. Returns true when it was retired.
    async fn process(&self, task: &OutboxTask) -> Result<bool> {
        match self.execute_task(task).await {
            Ok(()) => {
                self.cascade.outbox.mark_done(&task.id).await?;
                self.cascade.metrics.record_task_outcome("done");
                Ok(true)
            }
            Err(error) => {
                let outcome = self.cascade.outbox.mark_failed(task, &error.to_string()).await?;
                self.cascade.metrics.record_task_outcome(outcome.as_str());
                tracing::warn!(
                    task_id = %task.id,
                    kind = task.kind().as_str(),
                    outcome = outcome.as_str(),
                    error = %error,
                    "outbox task failed"
                );
                Ok(false)
            }
        }
    }

    #[tracing::instrument(
        skip(self, task),
        fields(
            task_id = %task.id,
            kind = task.kind().as_str(),
            workspace = %task.workspace_id,
            table = %task.table_id,
            stage_depth = task.stage_depth,
        )
    )]
    async fn execute_task(&self, task: &OutboxTask) -> Result<()> {
        match &task.payload {
            TaskPayload::ComputedUpdate { plan } => {
                let mut plan = (**plan).clone();
                // Merged tasks carry the union of seeds on the task row.
                plan.seed_record_ids = Vec::new();
                plan.extra_seed_records.clone_from(&task.seed_groups);
                self.run_plan(task, &plan).await
            }
            TaskPayload::Seed {
                changed_field_ids,
                impact_hint,
            } => {
                let request = seed_request(task, changed_field_ids.clone(), impact_hint.clone());
                let plan = self.cascade.plan(&request).await?;
                if plan.is_empty() {
                    tracing::debug!("seed task planned to nothing");
                    return Ok(());
                }
                self.run_plan(task, &plan).await
            }
            TaskPayload::FieldBackfill { field_ids } => self.run_backfill(task, field_ids).await,
        }
    }

    async fn run_plan(&self, task: &OutboxTask, plan: &UpdatePlan) -> Result<()> {
        let report = self.cascade.run_stage(plan, self.config.max_levels_per_stage, task.run_id).await?;
        let follow_ons = self
            .cascade
            .follow_on_plans(&plan.workspace_id, &plan.seed_table_id, plan.change_type, &report.outcome)
            .await?;
        self.cascade
            .enqueue_follow_ons(follow_ons, &lineage(task, &report.dirty_stats), self.config.max_stage_depth)
            .await?;
        log_stage(task, &report);
        Ok(())
    }

    async fn run_backfill(&self, task: &OutboxTask, field_ids: &[FieldId]) -> Result<()> {
        let cascade = &self.cascade;
        let outcome = cascade.run_backfill(&task.table_id, field_ids).await?;

        let follow_ons = cascade
            .follow_on_plans(&task.workspace_id, &task.table_id, ChangeType::Update, &outcome)
            .await?;
        cascade
            .enqueue_follow_ons(follow_ons, &lineage(task, &DirtyStats::default()), self.config.max_stage_depth)
            .await?;
        Ok(())
    }
}

/// Plan request for a claimed seed task: seeds on the task's table are the changed
/// records, seeds elsewhere ride along as extra dirty records.
fn seed_request(task: &OutboxTask, changed_field_ids: Vec<FieldId>, hint: Option<ImpactHint>) -> PlanRequest {
    let (own, extra): (Vec<SeedGroup>, Vec<SeedGroup>) =
        task.seed_groups.iter().cloned().partition(|g| g.table_id == task.table_id);
    let mut request = PlanRequest::new(
        task.workspace_id.clone(),
        task.table_id.clone(),
        changed_field_ids,
        own.into_iter().flat_map(|g| g.record_ids).collect(),
        task.change_type,
    );
    request.impact_hint = hint;
    request.extra_seed_records = extra;
    request
}

fn lineage(task: &OutboxTask, stage_stats: &DirtyStats) -> Lineage {
    let mut origin_run_ids = task.origin_run_ids.clone();
    origin_run_ids.push(task.run_id);
    let mut dirty_stats = task.dirty_stats.clone();
    dirty_stats.merge(stage_stats);
    Lineage {
        origin_run_ids,
        stage_depth: task.stage_depth,
        dirty_stats,
    }
}

fn log_stage(task: &OutboxTask, report: &StageReport) {
    tracing::info!(
        task_id = %task.id,
        run_id = %report.run_id,
        lock_mode = report.lock_mode.as_str(),
        levels = ?report.executed_levels,
        truncated = report.truncated,
        "outbox stage complete"
    );
}
