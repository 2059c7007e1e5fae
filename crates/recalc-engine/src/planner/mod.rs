//! Update planner: turns a change event into a leveled [`UpdatePlan`].
//!
//! ## Algorithm
//!
//! 1. Classify seeds into value and link-relation changes.
//! 2. Breadth-first search over dependents; seeds only count as affected when another
//!    seed reaches them, except on insert.
//! 3. Keep computed fields, then order them with Kahn's algorithm. Seeds anchor level 0
//!    and every other field sits one level above its deepest dependency.
//! 4. Cycles either fail the plan or are dropped with diagnostics, per [`CyclePolicy`].
//! 5. Group into `(table, level)` steps and derive propagation edges and batches.
//!
//! Planning is pure: it reads a [`DependencyGraph`] and never touches the store.

mod edges;
mod impact;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use recalc_core::field::Relationship;
use recalc_core::{FieldId, FieldKind, RecordId, TableId, WorkspaceId};

use crate::dag::Dag;
use crate::error::{Error, Result};
use crate::graph::{DependencyEdge, DependencyGraph, EdgeSemantic};
use crate::metrics::EngineMetrics;
use crate::plan::{
    ChangeType, CycleInfo, CyclePolicy, SeedGroup, UpdatePlan, UpdateStep, compute_plan_hash,
};

/// Caller-supplied classification of what changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpactHint {
    /// Seeds whose stored value changed.
    #[serde(default)]
    pub value_field_ids: Vec<FieldId>,
    /// Link seeds whose set of linked records changed.
    #[serde(default)]
    pub relation_field_ids: Vec<FieldId>,
}

/// A change event to plan for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    /// Workspace of the change.
    pub workspace_id: WorkspaceId,
    /// Table the records belong to.
    pub table_id: TableId,
    /// Fields written by the change.
    pub changed_field_ids: Vec<FieldId>,
    /// Records written by the change.
    pub changed_record_ids: Vec<RecordId>,
    /// Kind of change.
    pub change_type: ChangeType,
    /// Optional value/relation classification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact_hint: Option<ImpactHint>,
    /// Additional initially-dirty records.
    #[serde(default)]
    pub extra_seed_records: Vec<SeedGroup>,
}

impl PlanRequest {
    /// Creates a request without hint or extra seeds.
    #[must_use]
    pub fn new(
        workspace_id: WorkspaceId,
        table_id: TableId,
        changed_field_ids: Vec<FieldId>,
        changed_record_ids: Vec<RecordId>,
        change_type: ChangeType,
    ) -> Self {
        Self {
            workspace_id,
            table_id,
            changed_field_ids,
            changed_record_ids,
            change_type,
            impact_hint: None,
            extra_seed_records: Vec::new(),
        }
    }
}

/// Planner settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Cycle handling.
    pub cycle_policy: CyclePolicy,
}

/// Builds update plans.
#[derive(Debug, Clone, Default)]
pub struct Planner {
    config: PlannerConfig,
    metrics: EngineMetrics,
}

impl Planner {
    /// Creates a planner.
    #[must_use]
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Returns the configured cycle policy.
    #[must_use]
    pub const fn cycle_policy(&self) -> CyclePolicy {
        self.config.cycle_policy
    }

    /// Builds a plan for `request` over `graph`.
    ///
    /// # Errors
    ///
    /// - [`Error::FieldNotFound`] if a changed field is not in the graph
    /// - [`Error::Validation`] if a changed field belongs to another table
    /// - [`Error::CycleDetected`] under [`CyclePolicy::Error`] when affected fields
    ///   form a cycle
    #[tracing::instrument(
        skip(self, graph, request),
        fields(
            workspace = %request.workspace_id,
            table = %request.table_id,
            change = request.change_type.as_str(),
            changed_fields = request.changed_field_ids.len(),
        )
    )]
    pub fn plan(&self, graph: &DependencyGraph, request: &PlanRequest) -> Result<UpdatePlan> {
        let explicit = validate_request(graph, request)?;
        let mut seeds = explicit.clone();
        if request.change_type == ChangeType::Delete {
            seeds.extend(conditional_sources_on(graph, &request.table_id));
        }

        let impact = impact::classify(graph, &seeds, request.change_type, request.impact_hint.as_ref());
        let reach = impact::reach(graph, &impact);

        let mut included: BTreeSet<FieldId> = reach.affected.clone();
        if request.change_type == ChangeType::Insert {
            included.extend(seeds.iter().cloned());
            included.extend(context_free_formulas(graph, &request.table_id));
            prune_insert_links(graph, &request.table_id, &explicit, &mut included);
        }
        included.retain(|id| graph.field(id).is_some_and(|f| f.is_computed() && !f.is_deleted));

        // Seeds anchor the ordering even when they are not recomputed themselves.
        let nodes: BTreeSet<FieldId> = seeds.iter().chain(included.iter()).cloned().collect();
        let ordering_edges: Vec<DependencyEdge> = graph
            .edges()
            .iter()
            .filter(|e| nodes.contains(&e.from_field_id) && nodes.contains(&e.to_field_id))
            .filter(|e| e.semantic != EdgeSemantic::LookupLink || reach.traversed.contains(e))
            .cloned()
            .collect();

        let (levels, cycle_info) = self.order(&nodes, &ordering_edges)?;

        let mut grouped: BTreeMap<(u32, TableId), Vec<FieldId>> = BTreeMap::new();
        for (field_id, level) in &levels {
            if !included.contains(field_id) {
                continue;
            }
            let Some(field) = graph.field(field_id) else {
                continue;
            };
            if request.change_type == ChangeType::Delete && field.table_id == request.table_id {
                continue;
            }
            grouped
                .entry((*level, field.table_id.clone()))
                .or_default()
                .push(field_id.clone());
        }
        let steps: Vec<UpdateStep> = grouped
            .into_iter()
            .map(|((level, table_id), mut field_ids)| {
                field_ids.sort();
                UpdateStep {
                    table_id,
                    level,
                    field_ids,
                }
            })
            .collect();

        let planned: HashSet<FieldId> = steps.iter().flat_map(|s| s.field_ids.iter().cloned()).collect();
        // A filter field recomputed by this plan still holds its old value during
        // dirty propagation, so it counts as changed.
        let edges = edges::propagation_edges(graph, &reach.traversed, &planned, &nodes, request.change_type);
        let same_table_batches = edges::same_table_batches(&steps, &ordering_edges);

        let mut seed_record_ids: Vec<RecordId> = request.changed_record_ids.clone();
        seed_record_ids.sort();
        seed_record_ids.dedup();
        let extra_seed_records = request.extra_seed_records.clone();
        let seed_record_count = seed_record_ids.len()
            + extra_seed_records.iter().map(|g| g.record_ids.len()).sum::<usize>();

        let plan_hash = compute_plan_hash(
            &request.workspace_id,
            &request.table_id,
            request.change_type,
            &steps,
            &edges,
        )?;
        let plan = UpdatePlan {
            workspace_id: request.workspace_id.clone(),
            seed_table_id: request.table_id.clone(),
            change_type: request.change_type,
            seed_field_ids: seeds.into_iter().collect(),
            seed_record_ids,
            extra_seed_records,
            estimated_complexity: steps.len() + edges.len() + seed_record_count,
            steps,
            edges,
            same_table_batches,
            cycle_policy: self.config.cycle_policy,
            cycle_info,
            plan_hash,
        };

        self.metrics.record_plan(plan.change_type, plan.cycle_info.is_some());
        tracing::debug!(
            steps = plan.steps.len(),
            edges = plan.edges.len(),
            complexity = plan.estimated_complexity,
            hash = %plan.plan_hash,
            "built update plan"
        );
        Ok(plan)
    }

    /// Assigns levels, handling cycles per policy.
    fn order(
        &self,
        nodes: &BTreeSet<FieldId>,
        edges: &[DependencyEdge],
    ) -> Result<(Vec<(FieldId, u32)>, Option<CycleInfo>)> {
        let mut dag: Dag<FieldId> = Dag::new();
        for node in nodes {
            dag.add_node(node.clone());
        }
        for edge in edges {
            if let (Some(from), Some(to)) = (dag.get_index(&edge.from_field_id), dag.get_index(&edge.to_field_id)) {
                dag.add_edge(from, to)?;
            }
        }

        let order = dag.partial_toposort();
        let cycle_info = if order.is_complete() {
            None
        } else {
            let example_cycle = dag.find_cycle(&order.unsorted).unwrap_or_default();
            if self.config.cycle_policy == CyclePolicy::Error {
                return Err(Error::CycleDetected {
                    cycle: example_cycle.iter().map(ToString::to_string).collect(),
                });
            }
            let mut unsorted_field_ids = order.unsorted.clone();
            unsorted_field_ids.sort();
            tracing::warn!(
                unsorted = unsorted_field_ids.len(),
                cycle = ?example_cycle,
                "dependency cycle detected; skipping unsortable fields"
            );
            Some(CycleInfo {
                unsorted_field_ids,
                example_cycle,
            })
        };

        let mut levels: HashMap<FieldId, u32> = HashMap::with_capacity(order.sorted.len());
        let mut out = Vec::with_capacity(order.sorted.len());
        for field in order.sorted {
            let level = dag
                .upstream(&field)?
                .iter()
                .filter_map(|up| levels.get(up))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            levels.insert(field.clone(), level);
            out.push((field, level));
        }
        Ok((out, cycle_info))
    }
}

fn validate_request(graph: &DependencyGraph, request: &PlanRequest) -> Result<BTreeSet<FieldId>> {
    let mut explicit = BTreeSet::new();
    for field_id in &request.changed_field_ids {
        let field = graph.field(field_id).ok_or_else(|| Error::FieldNotFound {
            field_id: field_id.clone(),
        })?;
        if field.table_id != request.table_id {
            return Err(Error::validation(format!(
                "changed field {field_id} belongs to table {}, not {}",
                field.table_id, request.table_id
            )));
        }
        explicit.insert(field_id.clone());
    }
    Ok(explicit)
}

/// Fields of `table` read by conditional fields hosted on other tables.
fn conditional_sources_on(graph: &DependencyGraph, table: &TableId) -> BTreeSet<FieldId> {
    graph
        .edges()
        .iter()
        .filter(|e| {
            matches!(
                e.semantic,
                EdgeSemantic::ConditionalLookupSource
                    | EdgeSemantic::ConditionalRollupSource
                    | EdgeSemantic::ConditionalFilter
            ) && e.is_cross_record()
                && &e.from_table_id == table
                && &e.to_table_id != table
        })
        .map(|e| e.from_field_id.clone())
        .collect()
}

/// Formulas of `table` with no references at all.
fn context_free_formulas(graph: &DependencyGraph, table: &TableId) -> Vec<FieldId> {
    graph
        .fields()
        .filter(|f| &f.table_id == table && !f.is_deleted)
        .filter(|f| matches!(&f.kind, FieldKind::Formula(options) if options.references.is_empty()))
        .map(|f| f.id.clone())
        .collect()
}

/// Removes link fields a freshly inserted row cannot have populated yet.
///
/// One-to-many links hosted on the inserted table keep their pointers on the other
/// side, and links in other tables that point at the inserted table cannot reference a
/// row that did not exist. Both are kept when the insert set them explicitly, or set
/// their symmetric counterpart.
fn prune_insert_links(
    graph: &DependencyGraph,
    table: &TableId,
    explicit: &BTreeSet<FieldId>,
    included: &mut BTreeSet<FieldId>,
) {
    let counterparts: BTreeSet<FieldId> = explicit
        .iter()
        .filter_map(|id| graph.field(id))
        .filter_map(|f| f.kind.link_options()?.symmetric_field_id.clone())
        .collect();

    included.retain(|id| {
        let Some((field, options)) = graph
            .field(id)
            .and_then(|f| f.kind.link_options().map(|o| (f, o)))
        else {
            return true;
        };
        let prunable = (&field.table_id == table && options.relationship == Relationship::OneMany)
            || (&field.table_id != table && &options.foreign_table_id == table);
        let keep = !prunable || explicit.contains(id) || counterparts.contains(id);
        if !keep {
            tracing::debug!(field = %id, "pruning link not populated by insert");
        }
        keep
    });
}
