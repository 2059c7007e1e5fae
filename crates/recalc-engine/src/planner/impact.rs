//! Impact classification and dependent discovery.

use std::collections::{BTreeSet, VecDeque};

use recalc_core::{FieldId, FieldKind};

use crate::graph::{DependencyEdge, DependencyGraph, EdgeSemantic};
use crate::plan::ChangeType;

use super::ImpactHint;

/// Seeds split by how they changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Impact {
    /// Fields whose value changed.
    pub(crate) values: BTreeSet<FieldId>,
    /// Link fields whose set of linked rows changed.
    pub(crate) relations: BTreeSet<FieldId>,
}

/// Splits the seed fields into value and relation changes.
///
/// Without a hint, a changed link is both (its title and its targets may have
/// changed) and anything else is a value change. Deletes imply both for every seed.
pub(crate) fn classify(
    graph: &DependencyGraph,
    seeds: &BTreeSet<FieldId>,
    change_type: ChangeType,
    hint: Option<&ImpactHint>,
) -> Impact {
    if change_type == ChangeType::Delete {
        return Impact {
            values: seeds.clone(),
            relations: seeds.clone(),
        };
    }
    if let Some(hint) = hint {
        return Impact {
            values: hint.value_field_ids.iter().filter(|f| seeds.contains(*f)).cloned().collect(),
            relations: hint
                .relation_field_ids
                .iter()
                .filter(|f| seeds.contains(*f))
                .cloned()
                .collect(),
        };
    }

    let mut impact = Impact::default();
    for seed in seeds {
        let is_link = graph
            .field(seed)
            .is_some_and(|f| matches!(f.kind, FieldKind::Link(_)));
        impact.values.insert(seed.clone());
        if is_link {
            impact.relations.insert(seed.clone());
        }
    }
    impact
}

/// Fields reached from the seeds and the edges walked to reach them.
#[derive(Debug, Clone, Default)]
pub(crate) struct Reach {
    pub(crate) affected: BTreeSet<FieldId>,
    pub(crate) traversed: Vec<DependencyEdge>,
}

fn follows_value_change(edge: &DependencyEdge) -> bool {
    edge.semantic != EdgeSemantic::LookupLink
}

fn follows_relation_change(edge: &DependencyEdge) -> bool {
    matches!(
        edge.semantic,
        EdgeSemantic::LookupLink | EdgeSemantic::FormulaRef | EdgeSemantic::GenericRef
    )
}

/// Breadth-first search over dependents.
///
/// Relation changes only exist at the seeds; every reached field continues as a value
/// change.
pub(crate) fn reach(graph: &DependencyGraph, impact: &Impact) -> Reach {
    let mut out = Reach::default();
    let mut expanded: BTreeSet<FieldId> = BTreeSet::new();
    let mut queue: VecDeque<FieldId> = VecDeque::new();

    for relation in &impact.relations {
        for edge in graph.dependents(relation).filter(|e| follows_relation_change(e)) {
            out.traversed.push(edge.clone());
            if out.affected.insert(edge.to_field_id.clone()) {
                queue.push_back(edge.to_field_id.clone());
            }
        }
    }
    queue.extend(impact.values.iter().cloned());

    while let Some(field) = queue.pop_front() {
        if !expanded.insert(field.clone()) {
            continue;
        }
        for edge in graph.dependents(&field).filter(|e| follows_value_change(e)) {
            out.traversed.push(edge.clone());
            out.affected.insert(edge.to_field_id.clone());
            if !expanded.contains(&edge.to_field_id) {
                queue.push_back(edge.to_field_id.clone());
            }
        }
    }

    out.traversed.sort();
    out.traversed.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::field::{LinkOptions, LookupOptions, Relationship};
    use recalc_core::{Field, TableId};

    fn graph() -> DependencyGraph {
        let name = Field::new(FieldId::new("fldName"), TableId::new("tblC"), "Name", FieldKind::Plain);
        let link = Field::new(
            FieldId::new("fldLink"),
            TableId::new("tblB"),
            "Component",
            FieldKind::Link(LinkOptions {
                foreign_table_id: TableId::new("tblC"),
                lookup_field_id: FieldId::new("fldName"),
                relationship: Relationship::ManyOne,
                symmetric_field_id: None,
            }),
        );
        let lookup = Field::new(
            FieldId::new("fldLookup"),
            TableId::new("tblB"),
            "Component Name",
            FieldKind::Lookup(LookupOptions {
                link_field_id: FieldId::new("fldLink"),
                foreign_table_id: TableId::new("tblC"),
                lookup_field_id: FieldId::new("fldName"),
                filter: None,
            }),
        );
        let edges = vec![
            DependencyEdge::same_record(&link, &lookup, EdgeSemantic::LookupLink),
            DependencyEdge::cross_record(&name, &lookup, EdgeSemantic::LookupSource, Some(link.id.clone())),
            DependencyEdge::cross_record(&name, &link, EdgeSemantic::LinkTitle, Some(link.id.clone())),
        ];
        DependencyGraph::new([name, link, lookup], edges)
    }

    #[test]
    fn link_without_hint_is_value_and_relation() {
        let graph = graph();
        let seeds = BTreeSet::from([FieldId::new("fldLink")]);
        let impact = classify(&graph, &seeds, ChangeType::Update, None);
        assert!(impact.values.contains(&FieldId::new("fldLink")));
        assert!(impact.relations.contains(&FieldId::new("fldLink")));
    }

    #[test]
    fn title_change_does_not_follow_lookup_link() {
        let graph = graph();
        let impact = Impact {
            values: BTreeSet::from([FieldId::new("fldLink")]),
            relations: BTreeSet::new(),
        };
        let reach = reach(&graph, &impact);
        assert!(reach.affected.is_empty());
    }

    #[test]
    fn relation_change_reaches_lookup() {
        let graph = graph();
        let impact = Impact {
            values: BTreeSet::new(),
            relations: BTreeSet::from([FieldId::new("fldLink")]),
        };
        let reach = reach(&graph, &impact);
        assert_eq!(reach.affected, BTreeSet::from([FieldId::new("fldLookup")]));
        assert_eq!(reach.traversed.len(), 1);
    }

    #[test]
    fn source_change_reaches_link_and_lookup() {
        let graph = graph();
        let seeds = BTreeSet::from([FieldId::new("fldName")]);
        let impact = classify(&graph, &seeds, ChangeType::Update, None);
        let reach = reach(&graph, &impact);
        assert_eq!(
            reach.affected,
            BTreeSet::from([FieldId::new("fldLink"), FieldId::new("fldLookup")])
        );
        assert_eq!(reach.traversed.len(), 2);
    }

    #[test]
    fn hint_restricts_to_seeds() {
        let graph = graph();
        let seeds = BTreeSet::from([FieldId::new("fldLink")]);
        let hint = ImpactHint {
            value_field_ids: vec![FieldId::new("fldLink"), FieldId::new("fldOther")],
            relation_field_ids: vec![],
        };
        let impact = classify(&graph, &seeds, ChangeType::Update, Some(&hint));
        assert_eq!(impact.values, seeds);
        assert!(impact.relations.is_empty());
    }
}
