//! Dirty-set executor.
//!
//! Executes an [`UpdatePlan`] inside one [`ComputeTransaction`] in two phases:
//!
//! 1. **Prepare**: reset the dirty marker, seed it with the plan's seed records, then
//!    propagate across the plan's edges until an iteration adds nothing or the
//!    iteration budget runs out.
//! 2. **Execute**: run steps in ascending level order, each as a bulk update over the
//!    dirty rows of its table. A same-table batch runs as one chained update at its
//!    first step.
//!
//! Steps can be executed in windows (`execute_steps` with a slice of the plan's steps);
//! the worker uses this to split long cascades into stages.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use recalc_core::catalog::FieldCatalog;
use recalc_core::{Field, FieldId, RecordId, TableId};

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::events::RecordChange;
use crate::metrics::EngineMetrics;
use crate::plan::{SameTableBatch, UpdatePlan, UpdateStep};
use crate::store::{BulkUpdate, ComputeTransaction};

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Seed records per mark call.
    pub seed_batch_size: usize,
    /// Upper bound on propagation rounds.
    pub max_propagation_iterations: usize,
    /// Whether to collect before/after values.
    pub collect_changes: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            seed_batch_size: 1_000,
            max_propagation_iterations: 32,
            collect_changes: true,
        }
    }
}

/// Dirty-set sizes after propagation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirtyStats {
    /// Dirty rows per table.
    pub per_table: BTreeMap<TableId, u64>,
    /// Propagation rounds run.
    pub iterations: usize,
    /// Whether propagation stopped at the budget while still growing.
    pub budget_exhausted: bool,
}

impl DirtyStats {
    /// Dirty rows across all tables.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.per_table.values().sum()
    }

    /// Folds `other` in, keeping the larger count per table.
    pub fn merge(&mut self, other: &Self) {
        for (table, count) in &other.per_table {
            let entry = self.per_table.entry(table.clone()).or_default();
            *entry = (*entry).max(*count);
        }
        self.iterations = self.iterations.max(other.iterations);
        self.budget_exhausted |= other.budget_exhausted;
    }
}

/// What one executed update did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepTrace {
    /// Table updated.
    pub table_id: TableId,
    /// Levels covered (several for a batch).
    pub levels: Vec<u32>,
    /// Fields computed.
    pub field_ids: Vec<FieldId>,
    /// Whether the update ran as a chained batch.
    pub batched: bool,
    /// Rows updated.
    pub updated_records: usize,
    /// Wall time in milliseconds.
    pub duration_ms: u64,
}

/// Fields recomputed on one table and the rows they were written to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatedGroup {
    /// Table updated.
    pub table_id: TableId,
    /// Fields computed, sorted.
    pub field_ids: Vec<FieldId>,
    /// Rows updated, sorted.
    pub record_ids: Vec<RecordId>,
}

/// Result of executing steps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutcome {
    /// One entry per bulk update.
    pub trace: Vec<StepTrace>,
    /// Rows whose values changed, when collected.
    pub record_changes: Vec<RecordChange>,
    /// Updates grouped by table, sorted by table.
    pub updated: Vec<UpdatedGroup>,
}

impl ExecutionOutcome {
    /// Every field computed, across tables.
    #[must_use]
    pub fn executed_field_ids(&self) -> HashSet<FieldId> {
        self.updated.iter().flat_map(|g| g.field_ids.iter().cloned()).collect()
    }

    fn absorb(&mut self, other: Self) {
        self.trace.extend(other.trace);
        self.record_changes.extend(other.record_changes);
        let mut groups: BTreeMap<TableId, (BTreeSet<FieldId>, BTreeSet<RecordId>)> = BTreeMap::new();
        for group in self.updated.drain(..).chain(other.updated) {
            let entry = groups.entry(group.table_id).or_default();
            entry.0.extend(group.field_ids);
            entry.1.extend(group.record_ids);
        }
        self.updated = groups
            .into_iter()
            .map(|(table_id, (fields, records))| UpdatedGroup {
                table_id,
                field_ids: fields.into_iter().collect(),
                record_ids: records.into_iter().collect(),
            })
            .collect();
    }
}

/// Executes plans against a record store transaction.
pub struct Executor {
    catalog: Arc<dyn FieldCatalog>,
    config: ExecutorConfig,
    metrics: EngineMetrics,
}

impl Executor {
    /// Creates an executor.
    #[must_use]
    pub fn new(catalog: Arc<dyn FieldCatalog>, config: ExecutorConfig) -> Self {
        Self {
            catalog,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the executor settings.
    #[must_use]
    pub const fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Seeds and propagates the dirty marker for `plan`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    #[tracing::instrument(
        skip(self, tx, plan),
        fields(workspace = %plan.workspace_id, table = %plan.seed_table_id, edges = plan.edges.len())
    )]
    pub async fn prepare_dirty_state(
        &self,
        tx: &mut dyn ComputeTransaction,
        plan: &UpdatePlan,
    ) -> Result<DirtyStats> {
        tx.reset_dirty().await?;

        let batch_size = self.config.seed_batch_size.max(1);
        let mut tables: BTreeSet<TableId> = BTreeSet::new();
        for group in plan.seed_groups() {
            for chunk in group.record_ids.chunks(batch_size) {
                tx.mark_dirty(&group.table_id, chunk).await?;
            }
            tables.insert(group.table_id);
        }

        let mut stats = DirtyStats::default();
        if !plan.edges.is_empty() {
            let budget = self.config.max_propagation_iterations.min(plan.edges.len() + 1);
            for round in 0..budget {
                let mut added = 0;
                for edge in &plan.edges {
                    added += tx.propagate_dirty(edge).await?;
                }
                stats.iterations = round + 1;
                if added == 0 {
                    break;
                }
                if round + 1 == budget {
                    stats.budget_exhausted = true;
                    tracing::warn!(
                        budget,
                        last_added = added,
                        "dirty propagation budget exhausted before reaching a fixed point"
                    );
                }
            }
        }

        tables.extend(plan.edges.iter().map(|e| e.to_table_id.clone()));
        tables.extend(plan.steps.iter().map(|s| s.table_id.clone()));
        for table in tables {
            let count = tx.dirty_count(&table).await?;
            stats.per_table.insert(table, count);
        }
        self.metrics.observe_dirty_records(stats.total());
        tracing::debug!(dirty = stats.total(), iterations = stats.iterations, "prepared dirty state");
        Ok(stats)
    }

    /// Executes `steps` (a level-ordered slice of `plan.steps`) over the dirty rows.
    ///
    /// # Errors
    ///
    /// - [`Error::FieldNotFound`] if a step field is missing from the catalog
    /// - any store error
    #[tracing::instrument(skip(self, tx, plan, steps), fields(workspace = %plan.workspace_id, steps = steps.len()))]
    pub async fn execute_steps(
        &self,
        tx: &mut dyn ComputeTransaction,
        plan: &UpdatePlan,
        steps: &[UpdateStep],
    ) -> Result<ExecutionOutcome> {
        let field_ids: Vec<FieldId> = steps.iter().flat_map(|s| s.field_ids.iter().cloned()).collect();
        let fields = self.resolve_fields(&field_ids).await?;

        let mut outcome = ExecutionOutcome::default();
        let mut consumed: HashSet<(TableId, u32)> = HashSet::new();
        for step in steps {
            if consumed.contains(&(step.table_id.clone(), step.level)) {
                continue;
            }
            let batch: Option<&SameTableBatch> = plan.same_table_batches.iter().find(|b| b.contains(step));
            let chain: Vec<&UpdateStep> = match batch {
                Some(batch) => steps.iter().filter(|s| batch.contains(s)).collect(),
                None => vec![step],
            };
            for s in &chain {
                consumed.insert((s.table_id.clone(), s.level));
            }

            let stages: Vec<Vec<Field>> = chain
                .iter()
                .map(|s| {
                    s.field_ids
                        .iter()
                        .filter_map(|id| fields.get(id))
                        .filter(|f| !f.db_generated)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .filter(|stage| !stage.is_empty())
                .collect();
            if stages.is_empty() {
                tracing::debug!(table = %step.table_id, level = step.level, "skipping step with only generated fields");
                continue;
            }

            let levels: Vec<u32> = chain.iter().map(|s| s.level).collect();
            let single = self.run_update(tx, &step.table_id, stages, levels, chain.len() > 1).await?;
            outcome.absorb(single);
        }
        Ok(outcome)
    }

    /// Prepares dirty state and executes every step of `plan`.
    ///
    /// # Errors
    ///
    /// Returns an error if preparation or any step fails.
    pub async fn execute(
        &self,
        tx: &mut dyn ComputeTransaction,
        plan: &UpdatePlan,
    ) -> Result<(DirtyStats, ExecutionOutcome)> {
        let stats = self.prepare_dirty_state(tx, plan).await?;
        let outcome = self.execute_steps(tx, plan, &plan.steps).await?;
        Ok((stats, outcome))
    }

    /// Recomputes `field_ids` for every row of `table_id`, ordering the fields by their
    /// same-table dependencies. Fields in a dependency cycle are skipped.
    ///
    /// # Errors
    ///
    /// - [`Error::FieldNotFound`] if a field is missing from the catalog
    /// - [`Error::Validation`] if a field belongs to another table
    /// - any store error
    #[tracing::instrument(skip(self, tx, field_ids), fields(table = %table_id, fields = field_ids.len()))]
    pub async fn execute_backfill(
        &self,
        tx: &mut dyn ComputeTransaction,
        table_id: &TableId,
        field_ids: &[FieldId],
    ) -> Result<ExecutionOutcome> {
        let fields = self.resolve_fields(field_ids).await?;
        if let Some(foreign) = fields.values().find(|f| &f.table_id != table_id) {
            return Err(Error::validation(format!(
                "backfill field {} belongs to table {}, not {table_id}",
                foreign.id, foreign.table_id
            )));
        }

        let mut dag: Dag<FieldId> = Dag::new();
        let computed: BTreeMap<&FieldId, &Field> = fields
            .iter()
            .filter(|(_, f)| f.is_computed() && !f.is_deleted && !f.db_generated)
            .collect();
        for id in computed.keys() {
            dag.add_node((*id).clone());
        }
        for (id, field) in &computed {
            for dependency in field.dependencies() {
                if let (Some(from), Some(to)) = (dag.get_index(&dependency), dag.get_index(id)) {
                    dag.add_edge(from, to)?;
                }
            }
        }
        let order = dag.partial_toposort();
        if !order.is_complete() {
            tracing::warn!(skipped = ?order.unsorted, "skipping backfill fields in a dependency cycle");
        }

        let mut levels: HashMap<FieldId, u32> = HashMap::new();
        let mut stages: BTreeMap<u32, Vec<Field>> = BTreeMap::new();
        for id in &order.sorted {
            let level = dag
                .upstream(id)?
                .iter()
                .filter_map(|up| levels.get(up))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(id.clone(), level);
            if let Some(field) = computed.get(id) {
                stages.entry(level).or_default().push((*field).clone());
            }
        }
        if stages.is_empty() {
            return Ok(ExecutionOutcome::default());
        }

        tx.reset_dirty().await?;
        let marked = tx.mark_all_dirty(table_id).await?;
        self.metrics.observe_dirty_records(marked);
        let level_list: Vec<u32> = stages.keys().copied().collect();
        let batched = level_list.len() > 1;
        self.run_update(tx, table_id, stages.into_values().collect(), level_list, batched)
            .await
    }

    async fn resolve_fields(&self, field_ids: &[FieldId]) -> Result<HashMap<FieldId, Field>> {
        let mut unique: Vec<FieldId> = field_ids.to_vec();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Ok(HashMap::new());
        }
        let fields: HashMap<FieldId, Field> = self
            .catalog
            .get_fields(&unique)
            .await?
            .into_iter()
            .map(|f| (f.id.clone(), f))
            .collect();
        if let Some(missing) = unique.into_iter().find(|id| !fields.contains_key(id)) {
            return Err(Error::FieldNotFound { field_id: missing });
        }
        Ok(fields)
    }

    async fn run_update(
        &self,
        tx: &mut dyn ComputeTransaction,
        table_id: &TableId,
        stages: Vec<Vec<Field>>,
        levels: Vec<u32>,
        batched: bool,
    ) -> Result<ExecutionOutcome> {
        let field_ids: Vec<FieldId> = stages.iter().flatten().map(|f| f.id.clone()).collect();
        let update = BulkUpdate {
            table_id: table_id.clone(),
            stages,
            collect_changes: self.config.collect_changes,
        };

        let started = Instant::now();
        let result = tx.update_from_projection(&update).await?;
        let elapsed = started.elapsed();
        self.metrics.record_step(batched, elapsed);
        tracing::debug!(
            table = %table_id,
            ?levels,
            batched,
            updated = result.updated_record_ids.len(),
            "executed update"
        );

        let mut sorted_fields = field_ids.clone();
        sorted_fields.sort();
        Ok(ExecutionOutcome {
            trace: vec![StepTrace {
                table_id: table_id.clone(),
                levels,
                field_ids,
                batched,
                updated_records: result.updated_record_ids.len(),
                duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
            }],
            record_changes: result.changes,
            updated: vec![UpdatedGroup {
                table_id: table_id.clone(),
                field_ids: sorted_fields,
                record_ids: result.updated_record_ids,
            }],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::catalog::{InMemoryCatalog, Table};
    use recalc_core::field::FormulaOptions;
    use recalc_core::{FieldKind, WorkspaceId};
    use serde_json::json;

    use crate::plan::{ChangeType, CyclePolicy};
    use crate::store::RecordStore;
    use crate::store::memory::InMemoryRecordStore;

    fn f(id: &str) -> FieldId {
        FieldId::new(id)
    }

    fn formula(id: &str, refs: &[&str]) -> Field {
        Field::new(
            f(id),
            TableId::new("tblT"),
            id,
            FieldKind::Formula(FormulaOptions {
                expression: id.to_string(),
                references: refs.iter().map(|r| f(r)).collect(),
            }),
        )
    }

    fn setup() -> Result<(Arc<InMemoryCatalog>, InMemoryRecordStore)> {
        let catalog = Arc::new(InMemoryCatalog::new());
        catalog.put_table(Table {
            id: TableId::new("tblT"),
            workspace_id: WorkspaceId::new("bse1"),
            name: "T".into(),
            db_table_name: "t".into(),
        })?;
        catalog.put_field(Field::new(f("fldA"), TableId::new("tblT"), "A", FieldKind::Plain))?;
        catalog.put_field(formula("fldB", &["fldA"]))?;
        catalog.put_field(formula("fldC", &["fldB"]))?;

        let store = InMemoryRecordStore::new();
        store.register_formula(f("fldB"), |row| json!(row.get(&f("fldA")).as_i64().unwrap_or(0) * 2))?;
        store.register_formula(f("fldC"), |row| json!(row.get(&f("fldB")).as_i64().unwrap_or(0) + 1))?;
        for (id, a) in [("rec1", 1), ("rec2", 5)] {
            store.insert_row(&TableId::new("tblT"), &RecordId::new(id), [(f("fldA"), json!(a))])?;
        }
        Ok((catalog, store))
    }

    fn plan(steps: Vec<UpdateStep>, batches: Vec<SameTableBatch>) -> UpdatePlan {
        UpdatePlan {
            workspace_id: WorkspaceId::new("bse1"),
            seed_table_id: TableId::new("tblT"),
            change_type: ChangeType::Update,
            seed_field_ids: vec![f("fldA")],
            seed_record_ids: vec![RecordId::new("rec1")],
            extra_seed_records: Vec::new(),
            steps,
            edges: Vec::new(),
            same_table_batches: batches,
            cycle_policy: CyclePolicy::Skip,
            cycle_info: None,
            estimated_complexity: 0,
            plan_hash: String::new(),
        }
    }

    #[tokio::test]
    async fn batched_steps_run_as_one_chained_update() -> Result<()> {
        let (catalog, store) = setup()?;
        let executor = Executor::new(catalog, ExecutorConfig::default());
        let steps = vec![
            UpdateStep { table_id: TableId::new("tblT"), level: 1, field_ids: vec![f("fldB")] },
            UpdateStep { table_id: TableId::new("tblT"), level: 2, field_ids: vec![f("fldC")] },
        ];
        let plan = plan(
            steps,
            vec![SameTableBatch { table_id: TableId::new("tblT"), levels: vec![1, 2] }],
        );

        let mut tx = store.begin().await?;
        let (stats, outcome) = executor.execute(tx.as_mut(), &plan).await?;
        tx.commit().await?;

        assert_eq!(stats.per_table.get(&TableId::new("tblT")), Some(&1));
        assert_eq!(outcome.trace.len(), 1);
        assert!(outcome.trace[0].batched);
        assert_eq!(outcome.trace[0].levels, vec![1, 2]);
        assert_eq!(store.cell(&TableId::new("tblT"), &RecordId::new("rec1"), &f("fldC"))?, json!(3));
        // Only the seed row was dirty.
        assert_eq!(store.cell(&TableId::new("tblT"), &RecordId::new("rec2"), &f("fldC"))?, serde_json::Value::Null);
        assert_eq!(outcome.record_changes.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_field_is_not_found() -> Result<()> {
        let (catalog, store) = setup()?;
        let executor = Executor::new(catalog, ExecutorConfig::default());
        let plan = plan(
            vec![UpdateStep { table_id: TableId::new("tblT"), level: 1, field_ids: vec![f("fldGone")] }],
            Vec::new(),
        );
        let mut tx = store.begin().await?;
        let err = executor.execute(tx.as_mut(), &plan).await.unwrap_err();
        assert!(matches!(err, Error::FieldNotFound { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn backfill_orders_fields_and_touches_every_row() -> Result<()> {
        let (catalog, store) = setup()?;
        let executor = Executor::new(catalog, ExecutorConfig::default());
        let mut tx = store.begin().await?;
        let outcome = executor
            .execute_backfill(tx.as_mut(), &TableId::new("tblT"), &[f("fldC"), f("fldB")])
            .await?;
        tx.commit().await?;

        assert_eq!(outcome.updated[0].record_ids.len(), 2);
        assert_eq!(store.cell(&TableId::new("tblT"), &RecordId::new("rec2"), &f("fldC"))?, json!(11));
        Ok(())
    }

    #[test]
    fn dirty_stats_merge_keeps_maximum() {
        let mut a = DirtyStats {
            per_table: BTreeMap::from([(TableId::new("tblA"), 3)]),
            iterations: 1,
            budget_exhausted: false,
        };
        let b = DirtyStats {
            per_table: BTreeMap::from([(TableId::new("tblA"), 2), (TableId::new("tblB"), 4)]),
            iterations: 2,
            budget_exhausted: true,
        };
        a.merge(&b);
        assert_eq!(a.total(), 7);
        assert_eq!(a.iterations, 2);
        assert!(a.budget_exhausted);
    }
}
