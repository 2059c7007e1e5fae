//! Update plans: the unit of propagation work.
//!
//! A plan is produced by the [`crate::planner::Planner`] and consumed by the executor,
//! the lock coordinator and the outbox. It is fully serializable so it can be stored
//! as a computed-update outbox task and replayed by a worker.
//!
//! ## Identity
//!
//! Plans are deduplicated by [`UpdatePlan::plan_hash`], a SHA-256 over the plan's
//! semantic content (workspace, seed table, change type, steps, propagation edges).
//! Seed records are deliberately excluded so concurrent changes that need the same
//! work merge into one outbox task.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use recalc_core::{FieldId, FilterExpr, RecordId, TableId, WorkspaceId};

use crate::error::{Error, Result};

/// Kind of record mutation that triggered a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// Rows were created.
    Insert,
    /// Rows were modified.
    Update,
    /// Rows were removed.
    Delete,
}

impl ChangeType {
    /// Stable name used in keys and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Change type for follow-on stages: inserts continue as updates.
    #[must_use]
    pub const fn downgraded(self) -> Self {
        match self {
            Self::Insert => Self::Update,
            other => other,
        }
    }
}

/// What to do when the affected fields contain a dependency cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CyclePolicy {
    /// Fail the plan.
    Error,
    /// Drop the unsortable fields and keep going.
    #[default]
    Skip,
}

/// How a propagation edge finds newly dirty target rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PropagationMode {
    /// Target rows whose link field points at a dirty source row.
    LinkTraversal,
    /// Every target row, whenever the source table has any dirty row.
    AllTargetRecords,
    /// Target rows for which some dirty source row satisfies the edge's condition.
    ConditionalFiltered,
}

/// One leveled group of fields to recompute on one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStep {
    /// Table whose rows are updated.
    pub table_id: TableId,
    /// Topological distance from the seed change.
    pub level: u32,
    /// Fields recomputed by this step, sorted.
    pub field_ids: Vec<FieldId>,
}

/// How dirtiness travels from rows of one table to rows of another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationEdge {
    /// Table whose dirty rows drive the edge.
    pub from_table_id: TableId,
    /// Table whose rows become dirty.
    pub to_table_id: TableId,
    /// Link field on `to_table_id`, for link traversal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_field_id: Option<FieldId>,
    /// Row-finding strategy.
    pub mode: PropagationMode,
    /// Condition joined through, for `conditionalFiltered` edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter_condition: Option<FilterExpr>,
    /// Conditional field the condition belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conditional_field_id: Option<FieldId>,
    /// Source-side fields whose change the edge carries, sorted.
    pub source_field_ids: Vec<FieldId>,
    /// Target-side fields the edge feeds, sorted.
    pub target_field_ids: Vec<FieldId>,
}

/// Seed records of one table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedGroup {
    /// Table the records belong to.
    pub table_id: TableId,
    /// Record ids, sorted and deduplicated.
    pub record_ids: Vec<RecordId>,
}

impl SeedGroup {
    /// Creates a group, sorting and deduplicating the ids.
    #[must_use]
    pub fn new(table_id: TableId, record_ids: impl IntoIterator<Item = RecordId>) -> Self {
        let record_ids: BTreeSet<RecordId> = record_ids.into_iter().collect();
        Self {
            table_id,
            record_ids: record_ids.into_iter().collect(),
        }
    }
}

/// Merges seed groups of the same table.
#[must_use]
pub fn merge_seed_groups(groups: impl IntoIterator<Item = SeedGroup>) -> Vec<SeedGroup> {
    let mut merged: BTreeMap<TableId, BTreeSet<RecordId>> = BTreeMap::new();
    for group in groups {
        merged.entry(group.table_id).or_default().extend(group.record_ids);
    }
    merged
        .into_iter()
        .map(|(table_id, ids)| SeedGroup::new(table_id, ids))
        .collect()
}

/// A run of same-table steps that can execute as one chained update.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SameTableBatch {
    /// Table all steps update.
    pub table_id: TableId,
    /// Levels of the batched steps, ascending.
    pub levels: Vec<u32>,
}

impl SameTableBatch {
    /// Returns true if the batch covers `step`.
    #[must_use]
    pub fn contains(&self, step: &UpdateStep) -> bool {
        self.table_id == step.table_id && self.levels.contains(&step.level)
    }
}

/// Diagnostics for fields dropped because of a dependency cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleInfo {
    /// Every field that could not be ordered, sorted.
    pub unsorted_field_ids: Vec<FieldId>,
    /// One concrete cycle, closed (first and last element are equal).
    pub example_cycle: Vec<FieldId>,
}

/// An ordered, leveled propagation plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePlan {
    /// Workspace the change happened in.
    pub workspace_id: WorkspaceId,
    /// Table of the triggering change.
    pub seed_table_id: TableId,
    /// Kind of triggering change.
    pub change_type: ChangeType,
    /// Fields changed by the trigger.
    pub seed_field_ids: Vec<FieldId>,
    /// Records of `seed_table_id` changed by the trigger.
    pub seed_record_ids: Vec<RecordId>,
    /// Additional initially-dirty records, grouped by table.
    #[serde(default)]
    pub extra_seed_records: Vec<SeedGroup>,
    /// Steps in execution order.
    pub steps: Vec<UpdateStep>,
    /// Propagation edges between tables.
    pub edges: Vec<PropagationEdge>,
    /// Collapsible same-table step runs.
    #[serde(default)]
    pub same_table_batches: Vec<SameTableBatch>,
    /// Cycle handling policy the plan was built with.
    pub cycle_policy: CyclePolicy,
    /// Cycle diagnostics, when fields were dropped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cycle_info: Option<CycleInfo>,
    /// `steps + edges + seed records`; used to choose sync or async execution.
    pub estimated_complexity: usize,
    /// Content hash (`sha256:<hex>`).
    pub plan_hash: String,
}

impl UpdatePlan {
    /// Returns true if the plan has nothing to execute.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Seed records grouped by table (trigger records plus extras).
    #[must_use]
    pub fn seed_groups(&self) -> Vec<SeedGroup> {
        let primary = SeedGroup::new(self.seed_table_id.clone(), self.seed_record_ids.iter().cloned());
        merge_seed_groups(
            std::iter::once(primary)
                .chain(self.extra_seed_records.iter().cloned())
                .filter(|g| !g.record_ids.is_empty()),
        )
    }

    /// Number of seed records across all groups.
    #[must_use]
    pub fn seed_record_count(&self) -> usize {
        self.seed_groups().iter().map(|g| g.record_ids.len()).sum()
    }

    /// Every field the plan recomputes.
    #[must_use]
    pub fn step_field_ids(&self) -> BTreeSet<FieldId> {
        self.steps.iter().flat_map(|s| s.field_ids.iter().cloned()).collect()
    }

    /// Distinct step levels, ascending.
    #[must_use]
    pub fn levels(&self) -> Vec<u32> {
        let levels: BTreeSet<u32> = self.steps.iter().map(|s| s.level).collect();
        levels.into_iter().collect()
    }

    /// Removes `fields` from the plan, dropping emptied steps, propagation edges that
    /// no longer feed any remaining field, and batches that no longer span two steps.
    /// Complexity and hash are recomputed.
    ///
    /// # Errors
    ///
    /// Returns an error if the plan cannot be serialized for hashing.
    pub fn without_fields(mut self, fields: &HashSet<FieldId>) -> Result<Self> {
        for step in &mut self.steps {
            step.field_ids.retain(|f| !fields.contains(f));
        }
        self.steps.retain(|s| !s.field_ids.is_empty());
        for edge in &mut self.edges {
            edge.target_field_ids.retain(|f| !fields.contains(f));
        }
        self.edges.retain(|e| !e.target_field_ids.is_empty());

        let remaining: HashSet<(TableId, u32)> = self
            .steps
            .iter()
            .map(|s| (s.table_id.clone(), s.level))
            .collect();
        for batch in &mut self.same_table_batches {
            let table = batch.table_id.clone();
            batch.levels.retain(|l| remaining.contains(&(table.clone(), *l)));
        }
        self.same_table_batches.retain(|b| b.levels.len() >= 2);

        self.estimated_complexity = self.steps.len() + self.edges.len() + self.seed_record_count();
        self.plan_hash = compute_plan_hash(
            &self.workspace_id,
            &self.seed_table_id,
            self.change_type,
            &self.steps,
            &self.edges,
        )?;
        Ok(self)
    }
}

/// Version of the plan hash preimage format.
///
/// Increment when intentionally changing hash semantics.
const PLAN_HASH_VERSION: u32 = 1;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PlanHashPreimage<'a> {
    version: u32,
    workspace_id: &'a WorkspaceId,
    seed_table_id: &'a TableId,
    change_type: ChangeType,
    steps: &'a [UpdateStep],
    edges: &'a [PropagationEdge],
}

/// Computes the content hash of a plan.
///
/// Steps and edges are already in deterministic order when they leave the planner;
/// JSON object keys inside filters are ordered by `serde_json`'s default map.
///
/// # Errors
///
/// Returns a serialization error if the preimage cannot be encoded.
pub fn compute_plan_hash(
    workspace_id: &WorkspaceId,
    seed_table_id: &TableId,
    change_type: ChangeType,
    steps: &[UpdateStep],
    edges: &[PropagationEdge],
) -> Result<String> {
    let preimage = PlanHashPreimage {
        version: PLAN_HASH_VERSION,
        workspace_id,
        seed_table_id,
        change_type,
        steps,
        edges,
    };
    let bytes = serde_json::to_vec(&preimage).map_err(|e| Error::Serialization {
        message: format!("failed to serialize plan hash preimage: {e}"),
    })?;

    let mut hasher = Sha256::new();
    hasher.update(format!("recalc-plan:v{PLAN_HASH_VERSION}:").as_bytes());
    hasher.update(&bytes);
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}
