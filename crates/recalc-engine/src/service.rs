//! Service facade over the planner, executor and outbox.
//!
//! The service runs small changes synchronously within [`SyncPolicy`] limits and
//! hands everything else to the outbox. Errors raised before work is durably enqueued
//! reach the caller; once a task is enqueued its failures are recorded on the task.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use recalc_core::catalog::InMemoryCatalog;
//! use recalc_core::{FieldId, RecordId, TableId, WorkspaceId};
//! use recalc_engine::outbox::memory::InMemoryOutbox;
//! use recalc_engine::plan::ChangeType;
//! use recalc_engine::planner::PlanRequest;
//! use recalc_engine::service::ComputedUpdateService;
//! use recalc_engine::store::memory::InMemoryRecordStore;
//!
//! # async fn example() -> recalc_engine::error::Result<()> {
//! let service = ComputedUpdateService::builder(
//!     Arc::new(InMemoryCatalog::new()),
//!     Arc::new(InMemoryRecordStore::new()),
//!     Arc::new(InMemoryOutbox::default()),
//! )
//! .inline_dispatch(true)
//! .build()?;
//!
//! let report = service
//!     .submit_change(PlanRequest::new(
//!         WorkspaceId::new("bse1"),
//!         TableId::new("tblComponents"),
//!         vec![FieldId::new("fldName")],
//!         vec![RecordId::new("rec1")],
//!         ChangeType::Update,
//!     ))
//!     .await?;
//! println!("updated {} groups", report.outcome.updated.len());
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use recalc_core::catalog::FieldCatalog;
use recalc_core::observability::compute_span;
use recalc_core::{FieldId, RunId, TableId, WorkspaceId};
use tracing::Instrument;

use crate::cascade::{Cascade, Lineage};
use crate::config::{EngineConfig, SyncPolicy};
use crate::dispatch::InlineDispatcher;
use crate::error::{Error, Result};
use crate::events::{NoopChangeSink, RecordChangeSink};
use crate::executor::{DirtyStats, ExecutionOutcome, Executor};
use crate::graph::GraphBuilder;
use crate::metrics::EngineMetrics;
use crate::outbox::{DeadLetter, EnqueueResult, NewOutboxTask, Outbox};
use crate::plan::{ChangeType, SeedGroup, UpdatePlan};
use crate::planner::{PlanRequest, Planner};
use crate::store::RecordStore;
use crate::worker::{OutboxWorker, WorkerConfig};

/// What a synchronous call did.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    /// Run id of the synchronous stage.
    pub run_id: RunId,
    /// Set when the whole plan went to the outbox without running.
    pub deferred: Option<EnqueueResult>,
    /// Plan levels executed synchronously.
    pub executed_levels: Vec<u32>,
    /// Dirty-set sizes of the synchronous stage.
    pub dirty_stats: DirtyStats,
    /// What the synchronous stage wrote.
    pub outcome: ExecutionOutcome,
    /// Continuations enqueued for the remaining work.
    pub follow_ons: Vec<EnqueueResult>,
}

impl ExecutionReport {
    fn empty(run_id: RunId) -> Self {
        Self {
            run_id,
            deferred: None,
            executed_levels: Vec::new(),
            dirty_stats: DirtyStats::default(),
            outcome: ExecutionOutcome::default(),
            follow_ons: Vec::new(),
        }
    }

    /// Returns true if any work was left to the outbox.
    #[must_use]
    pub fn has_pending_work(&self) -> bool {
        self.deferred.is_some() || !self.follow_ons.is_empty()
    }
}

/// Builder for [`ComputedUpdateService`].
pub struct ComputedUpdateServiceBuilder {
    catalog: Arc<dyn FieldCatalog>,
    store: Arc<dyn RecordStore>,
    outbox: Arc<dyn Outbox>,
    sink: Arc<dyn RecordChangeSink>,
    config: EngineConfig,
    inline_dispatch: bool,
}

impl ComputedUpdateServiceBuilder {
    /// Uses `config` instead of the defaults.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Publishes record changes to `sink`.
    #[must_use]
    pub fn change_sink(mut self, sink: Arc<dyn RecordChangeSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Drains the outbox in the background whenever work is deferred.
    #[must_use]
    pub const fn inline_dispatch(mut self, enabled: bool) -> Self {
        self.inline_dispatch = enabled;
        self
    }

    /// Builds the service.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configuration is inconsistent.
    pub fn build(self) -> Result<ComputedUpdateService> {
        self.config.validate()?;
        let config = self.config;
        let cascade = Arc::new(Cascade {
            graphs: GraphBuilder::new(Arc::clone(&self.catalog), config.graph.clone()),
            planner: Planner::new(config.planner.clone()),
            executor: Executor::new(Arc::clone(&self.catalog), config.executor.clone()),
            catalog: self.catalog,
            store: self.store,
            outbox: self.outbox,
            sink: self.sink,
            locks: config.locks.clone(),
            retry: config.retry.clone(),
            metrics: EngineMetrics::new(),
        });
        let dispatcher = self
            .inline_dispatch
            .then(|| InlineDispatcher::new(OutboxWorker::new(Arc::clone(&cascade), config.worker.clone())));
        Ok(ComputedUpdateService {
            cascade,
            config,
            dispatcher,
        })
    }
}

/// Entry point for computed-field propagation.
pub struct ComputedUpdateService {
    cascade: Arc<Cascade>,
    config: EngineConfig,
    dispatcher: Option<InlineDispatcher>,
}

impl std::fmt::Debug for ComputedUpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputedUpdateService")
            .field("config", &self.config)
            .field("inline_dispatch", &self.dispatcher.is_some())
            .finish_non_exhaustive()
    }
}

impl ComputedUpdateService {
    /// Starts building a service over the given collaborators.
    #[must_use]
    pub fn builder(
        catalog: Arc<dyn FieldCatalog>,
        store: Arc<dyn RecordStore>,
        outbox: Arc<dyn Outbox>,
    ) -> ComputedUpdateServiceBuilder {
        ComputedUpdateServiceBuilder {
            catalog,
            store,
            outbox,
            sink: Arc::new(NoopChangeSink),
            config: EngineConfig::default(),
            inline_dispatch: false,
        }
    }

    /// Returns the engine settings.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the synchronous execution policy.
    #[must_use]
    pub const fn sync_policy(&self) -> &SyncPolicy {
        &self.config.sync
    }

    /// Returns the inline dispatcher, if enabled.
    #[must_use]
    pub const fn dispatcher(&self) -> Option<&InlineDispatcher> {
        self.dispatcher.as_ref()
    }

    /// A worker sharing this service's collaborators, using the configured settings.
    #[must_use]
    pub fn worker(&self) -> OutboxWorker {
        self.worker_with(self.config.worker.clone())
    }

    /// A worker sharing this service's collaborators.
    #[must_use]
    pub fn worker_with(&self, config: WorkerConfig) -> OutboxWorker {
        OutboxWorker::new(Arc::clone(&self.cascade), config)
    }

    /// Loads the graph for `request` and plans it.
    ///
    /// # Errors
    ///
    /// - [`Error::FieldNotFound`] / [`Error::Validation`] for a bad request
    /// - [`Error::CycleDetected`] under the `error` cycle policy
    /// - any catalog error
    pub async fn plan(&self, request: &PlanRequest) -> Result<UpdatePlan> {
        self.cascade.plan(request).await
    }

    /// Executes `plan` within the sync policy and enqueues whatever remains.
    ///
    /// Plans above the complexity limit are enqueued whole. Otherwise the first
    /// `max_sync_levels` levels run in one transaction and the follow-on stages are
    /// re-planned and enqueued.
    ///
    /// # Errors
    ///
    /// Returns an error if the synchronous stage or an enqueue fails.
    #[tracing::instrument(
        skip(self, plan),
        fields(
            workspace = %plan.workspace_id,
            table = %plan.seed_table_id,
            steps = plan.steps.len(),
            complexity = plan.estimated_complexity,
        )
    )]
    pub async fn execute(&self, plan: &UpdatePlan) -> Result<ExecutionReport> {
        let run_id = RunId::generate();
        if plan.is_empty() {
            return Ok(ExecutionReport::empty(run_id));
        }

        let policy = &self.config.sync;
        if plan.estimated_complexity > policy.max_sync_complexity {
            tracing::info!(
                max_sync_complexity = policy.max_sync_complexity,
                "plan exceeds synchronous complexity limit; deferring to outbox"
            );
            let mut task = NewOutboxTask::computed_update(plan.clone(), 0);
            task.run_id = run_id;
            let enqueued = self.cascade.enqueue(task).await?;
            self.schedule_drain();
            let mut report = ExecutionReport::empty(run_id);
            report.deferred = Some(enqueued);
            return Ok(report);
        }

        let stage = self.cascade.run_stage(plan, policy.max_sync_levels, run_id).await?;
        let follow_ons = self
            .cascade
            .follow_on_plans(&plan.workspace_id, &plan.seed_table_id, plan.change_type, &stage.outcome)
            .await?;
        let lineage = Lineage {
            origin_run_ids: vec![run_id],
            stage_depth: 0,
            dirty_stats: stage.dirty_stats.clone(),
        };
        let follow_ons = self
            .cascade
            .enqueue_follow_ons(follow_ons, &lineage, self.config.worker.max_stage_depth)
            .await?;
        if !follow_ons.is_empty() {
            self.schedule_drain();
        }
        Ok(ExecutionReport {
            run_id,
            deferred: None,
            executed_levels: stage.executed_levels,
            dirty_stats: stage.dirty_stats,
            outcome: stage.outcome,
            follow_ons,
        })
    }

    /// Plans and executes a record change.
    ///
    /// # Errors
    ///
    /// Returns an error from [`Self::plan`] or [`Self::execute`].
    pub async fn submit_change(&self, request: PlanRequest) -> Result<ExecutionReport> {
        let span = compute_span("submit_change", request.workspace_id.as_str(), request.table_id.as_str());
        async {
            let plan = self.plan(&request).await?;
            self.execute(&plan).await
        }
        .instrument(span)
        .await
    }

    /// Enqueues a change for the worker to plan and execute later.
    ///
    /// # Errors
    ///
    /// Returns an error if the task cannot be built or enqueued.
    #[tracing::instrument(
        skip(self, request),
        fields(workspace = %request.workspace_id, table = %request.table_id, records = request.changed_record_ids.len())
    )]
    pub async fn enqueue_seed(&self, request: PlanRequest) -> Result<EnqueueResult> {
        let mut seed_groups = vec![SeedGroup::new(request.table_id.clone(), request.changed_record_ids)];
        seed_groups.extend(request.extra_seed_records);
        let task = NewOutboxTask::seed(
            request.workspace_id,
            request.table_id,
            request.changed_field_ids,
            seed_groups,
            request.change_type,
            request.impact_hint,
        )?;
        let enqueued = self.cascade.enqueue(task).await?;
        self.schedule_drain();
        Ok(enqueued)
    }

    /// Recomputes one new computed field over every row of its table.
    ///
    /// # Errors
    ///
    /// Returns an error from [`Self::backfill_many`].
    pub async fn backfill(&self, table_id: &TableId, field_id: &FieldId) -> Result<ExecutionReport> {
        self.backfill_many(table_id, std::slice::from_ref(field_id)).await
    }

    /// Recomputes new computed fields over every row of their table, in dependency
    /// order, and enqueues the dependents they feed.
    ///
    /// # Errors
    ///
    /// - [`Error::TableNotFound`] if the table is unknown
    /// - [`Error::FieldNotFound`] / [`Error::Validation`] for bad fields
    /// - any store error
    pub async fn backfill_many(&self, table_id: &TableId, field_ids: &[FieldId]) -> Result<ExecutionReport> {
        let run_id = RunId::generate();
        if field_ids.is_empty() {
            return Ok(ExecutionReport::empty(run_id));
        }
        let workspace_id = self.workspace_of(table_id).await?;
        let outcome = self.cascade.run_backfill(table_id, field_ids).await?;

        let follow_ons = self
            .cascade
            .follow_on_plans(&workspace_id, table_id, ChangeType::Update, &outcome)
            .await?;
        let lineage = Lineage {
            origin_run_ids: vec![run_id],
            ..Lineage::default()
        };
        let follow_ons = self
            .cascade
            .enqueue_follow_ons(follow_ons, &lineage, self.config.worker.max_stage_depth)
            .await?;
        if !follow_ons.is_empty() {
            self.schedule_drain();
        }
        let mut report = ExecutionReport::empty(run_id);
        report.outcome = outcome;
        report.follow_ons = follow_ons;
        Ok(report)
    }

    /// Enqueues a whole-table recompute of `field_ids` for the worker.
    ///
    /// # Errors
    ///
    /// - [`Error::TableNotFound`] if the table is unknown
    /// - any outbox error
    pub async fn enqueue_backfill(&self, table_id: &TableId, field_ids: Vec<FieldId>) -> Result<EnqueueResult> {
        let workspace_id = self.workspace_of(table_id).await?;
        let task = NewOutboxTask::field_backfill(workspace_id, table_id.clone(), field_ids)?;
        let enqueued = self.cascade.enqueue(task).await?;
        self.schedule_drain();
        Ok(enqueued)
    }

    /// Dead-lettered tasks, up to `limit`.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox fails.
    pub async fn list_dead_letters(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        self.cascade.outbox.list_dead_letters(limit).await
    }

    /// Number of tasks waiting to run.
    ///
    /// # Errors
    ///
    /// Returns an error if the outbox fails.
    pub async fn pending_count(&self) -> Result<u64> {
        self.cascade.outbox.pending_count().await
    }

    async fn workspace_of(&self, table_id: &TableId) -> Result<WorkspaceId> {
        self.cascade
            .catalog
            .get_table(table_id)
            .await?
            .map(|t| t.workspace_id)
            .ok_or_else(|| Error::TableNotFound {
                table_id: table_id.clone(),
            })
    }

    fn schedule_drain(&self) {
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.schedule(self.config.sync.inline_dispatch_delay());
        }
    }
}
