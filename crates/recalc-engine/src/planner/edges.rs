//! Propagation edges and same-table batches.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use recalc_core::{FieldId, FilterExpr, TableId};

use crate::graph::{DependencyEdge, DependencyGraph};
use crate::plan::{ChangeType, PropagationEdge, PropagationMode, SameTableBatch, UpdateStep};

/// Chooses how dirtiness crosses `edge`.
///
/// Conditional targets use their condition only when it is present and no rows are
/// being deleted, and none of its fields are in `changed` (seeds plus every field the
/// plan recomputes). Otherwise every target row is treated as dirty.
fn select_mode<'g>(
    graph: &'g DependencyGraph,
    edge: &DependencyEdge,
    changed: &BTreeSet<FieldId>,
    change_type: ChangeType,
) -> (PropagationMode, Option<&'g FilterExpr>) {
    let target = graph.field(&edge.to_field_id);
    if let Some(options) = target.and_then(|f| f.kind.conditional_options()) {
        return match &options.filter {
            Some(filter)
                if change_type != ChangeType::Delete
                    && filter.field_ids().iter().all(|f| !changed.contains(f)) =>
            {
                (PropagationMode::ConditionalFiltered, Some(filter))
            }
            _ => (PropagationMode::AllTargetRecords, None),
        };
    }
    if edge.link_field_id.is_some() {
        (PropagationMode::LinkTraversal, None)
    } else {
        (PropagationMode::AllTargetRecords, None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct EdgeKey {
    from_table_id: TableId,
    to_table_id: TableId,
    link_field_id: Option<FieldId>,
    mode: PropagationMode,
    conditional_field_id: Option<FieldId>,
}

/// Builds merged propagation edges from the traversed cross-record edges whose
/// target is still part of the plan.
pub(crate) fn propagation_edges(
    graph: &DependencyGraph,
    traversed: &[DependencyEdge],
    planned: &HashSet<FieldId>,
    changed: &BTreeSet<FieldId>,
    change_type: ChangeType,
) -> Vec<PropagationEdge> {
    let mut merged: BTreeMap<EdgeKey, PropagationEdge> = BTreeMap::new();

    for edge in traversed
        .iter()
        .filter(|e| e.is_cross_record() && planned.contains(&e.to_field_id))
    {
        let (mode, filter) = select_mode(graph, edge, changed, change_type);
        let conditional = graph
            .field(&edge.to_field_id)
            .filter(|f| f.kind.is_conditional())
            .map(|f| f.id.clone());
        let link_field_id = match mode {
            PropagationMode::LinkTraversal => edge.link_field_id.clone(),
            _ => None,
        };
        let key = EdgeKey {
            from_table_id: edge.from_table_id.clone(),
            to_table_id: edge.to_table_id.clone(),
            link_field_id: link_field_id.clone(),
            mode,
            conditional_field_id: conditional.clone(),
        };
        let entry = merged.entry(key).or_insert_with(|| PropagationEdge {
            from_table_id: edge.from_table_id.clone(),
            to_table_id: edge.to_table_id.clone(),
            link_field_id,
            mode,
            filter_condition: filter.cloned(),
            conditional_field_id: conditional,
            source_field_ids: Vec::new(),
            target_field_ids: Vec::new(),
        });
        entry.source_field_ids.push(edge.from_field_id.clone());
        entry.target_field_ids.push(edge.to_field_id.clone());
    }

    merged
        .into_values()
        .map(|mut edge| {
            edge.source_field_ids.sort();
            edge.source_field_ids.dedup();
            edge.target_field_ids.sort();
            edge.target_field_ids.dedup();
            edge
        })
        .collect()
}

/// Finds runs of at least two adjacent steps on one table whose fields have no
/// cross-record dependency in the plan.
pub(crate) fn same_table_batches(
    steps: &[UpdateStep],
    ordering_edges: &[DependencyEdge],
) -> Vec<SameTableBatch> {
    let cross_dependent: HashSet<&FieldId> = ordering_edges
        .iter()
        .filter(|e| e.is_cross_record())
        .map(|e| &e.to_field_id)
        .collect();
    let eligible = |step: &UpdateStep| step.field_ids.iter().all(|f| !cross_dependent.contains(f));

    let mut batches = Vec::new();
    let mut current: Option<SameTableBatch> = None;
    for step in steps {
        if !eligible(step) {
            if let Some(batch) = current.take() {
                batches.push(batch);
            }
            continue;
        }
        match current.as_mut() {
            Some(batch) if batch.table_id == step.table_id => batch.levels.push(step.level),
            _ => {
                if let Some(batch) = current.replace(SameTableBatch {
                    table_id: step.table_id.clone(),
                    levels: vec![step.level],
                }) {
                    batches.push(batch);
                }
            }
        }
    }
    if let Some(batch) = current {
        batches.push(batch);
    }
    batches.retain(|b| b.levels.len() >= 2);
    batches
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::{Field, FieldKind};
    use crate::graph::EdgeSemantic;

    fn step(table: &str, level: u32, fields: &[&str]) -> UpdateStep {
        UpdateStep {
            table_id: TableId::new(table),
            level,
            field_ids: fields.iter().map(|f| FieldId::new(*f)).collect(),
        }
    }

    #[test]
    fn batches_need_two_adjacent_eligible_steps() {
        let steps = vec![
            step("tblA", 1, &["fldB"]),
            step("tblA", 2, &["fldC"]),
            step("tblA", 3, &["fldD"]),
            step("tblB", 4, &["fldE"]),
            step("tblA", 5, &["fldF"]),
        ];
        let batches = same_table_batches(&steps, &[]);
        assert_eq!(
            batches,
            vec![SameTableBatch {
                table_id: TableId::new("tblA"),
                levels: vec![1, 2, 3],
            }]
        );
    }

    #[test]
    fn cross_record_dependents_break_batches() {
        let a = Field::new(FieldId::new("fldX"), TableId::new("tblZ"), "X", FieldKind::Plain);
        let c = Field::new(FieldId::new("fldC"), TableId::new("tblA"), "C", FieldKind::Plain);
        let steps = vec![
            step("tblA", 1, &["fldB"]),
            step("tblA", 2, &["fldC"]),
            step("tblA", 3, &["fldD"]),
            step("tblA", 4, &["fldE"]),
        ];
        let edges = vec![DependencyEdge::cross_record(&a, &c, EdgeSemantic::GenericRef, None)];
        let batches = same_table_batches(&steps, &edges);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].levels, vec![3, 4]);
    }
}
