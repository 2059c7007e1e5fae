//! Field dependency graph.
//!
//! A [`DependencyGraph`] is the arena the planner works over: field metadata indexed by
//! id plus a flat, sorted list of [`DependencyEdge`]s. Edges are derived from field
//! configuration by [`derive`] and loaded from a catalog by [`GraphBuilder`].

mod builder;
pub mod derive;

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use recalc_core::{Field, FieldId, TableId};

pub use builder::{GraphBuilder, GraphLoadConfig};

/// Whether a dependency stays inside one row or crosses rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Recompute the dependent on the same row.
    SameRecord,
    /// Dirtiness travels to other rows (through a link or a condition).
    CrossRecord,
}

/// Why an edge exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeSemantic {
    /// Lookup/rollup depends on which rows its link points at.
    LookupLink,
    /// Lookup/rollup reads a foreign source field.
    LookupSource,
    /// Lookup/rollup filter references a field.
    LookupFilter,
    /// Link mirrors the foreign title field.
    LinkTitle,
    /// Conditional lookup reads a foreign source field.
    ConditionalLookupSource,
    /// Conditional rollup reads a foreign source field.
    ConditionalRollupSource,
    /// Conditional field's condition references a field.
    ConditionalFilter,
    /// Formula references a field of its own table.
    FormulaRef,
    /// Catalog reference with no derivable meaning.
    GenericRef,
}

/// A directed `from → to` dependency between two fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyEdge {
    /// Field being read.
    pub from_field_id: FieldId,
    /// Field that must be recomputed.
    pub to_field_id: FieldId,
    /// Table of `from_field_id`.
    pub from_table_id: TableId,
    /// Table of `to_field_id`.
    pub to_table_id: TableId,
    /// Row scope of the dependency.
    pub kind: EdgeKind,
    /// Reason for the dependency.
    pub semantic: EdgeSemantic,
    /// Link field (on the target table) dirtiness travels through, for link-based
    /// cross-record edges.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_field_id: Option<FieldId>,
}

impl DependencyEdge {
    /// Creates a same-record edge.
    #[must_use]
    pub fn same_record(from: &Field, to: &Field, semantic: EdgeSemantic) -> Self {
        Self {
            from_field_id: from.id.clone(),
            to_field_id: to.id.clone(),
            from_table_id: from.table_id.clone(),
            to_table_id: to.table_id.clone(),
            kind: EdgeKind::SameRecord,
            semantic,
            link_field_id: None,
        }
    }

    /// Creates a cross-record edge, optionally through a link field.
    #[must_use]
    pub fn cross_record(
        from: &Field,
        to: &Field,
        semantic: EdgeSemantic,
        link_field_id: Option<FieldId>,
    ) -> Self {
        Self {
            from_field_id: from.id.clone(),
            to_field_id: to.id.clone(),
            from_table_id: from.table_id.clone(),
            to_table_id: to.table_id.clone(),
            kind: EdgeKind::CrossRecord,
            semantic,
            link_field_id,
        }
    }

    /// Returns true for cross-record edges.
    #[must_use]
    pub fn is_cross_record(&self) -> bool {
        self.kind == EdgeKind::CrossRecord
    }
}

/// Field metadata plus the dependency edges between fields.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    fields: BTreeMap<FieldId, Field>,
    edges: Vec<DependencyEdge>,
    outgoing: HashMap<FieldId, Vec<usize>>,
}

impl DependencyGraph {
    /// Creates a graph; edges are sorted and deduplicated.
    #[must_use]
    pub fn new(fields: impl IntoIterator<Item = Field>, mut edges: Vec<DependencyEdge>) -> Self {
        edges.sort();
        edges.dedup();
        let mut outgoing: HashMap<FieldId, Vec<usize>> = HashMap::new();
        for (idx, edge) in edges.iter().enumerate() {
            outgoing.entry(edge.from_field_id.clone()).or_default().push(idx);
        }
        Self {
            fields: fields.into_iter().map(|f| (f.id.clone(), f)).collect(),
            edges,
            outgoing,
        }
    }

    /// Looks up a field.
    #[must_use]
    pub fn field(&self, field_id: &FieldId) -> Option<&Field> {
        self.fields.get(field_id)
    }

    /// All loaded fields, ordered by id.
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.values()
    }

    /// All edges, sorted.
    #[must_use]
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Edges leaving `field_id` (its dependents).
    pub fn dependents<'a>(&'a self, field_id: &FieldId) -> impl Iterator<Item = &'a DependencyEdge> {
        self.outgoing
            .get(field_id)
            .into_iter()
            .flatten()
            .filter_map(|&idx| self.edges.get(idx))
    }

    /// Edges entering `field_id` (its dependencies).
    pub fn dependencies<'a>(
        &'a self,
        field_id: &'a FieldId,
    ) -> impl Iterator<Item = &'a DependencyEdge> {
        self.edges.iter().filter(move |e| &e.to_field_id == field_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recalc_core::FieldKind;

    fn plain(id: &str, table: &str) -> Field {
        Field::new(FieldId::new(id), TableId::new(table), id, FieldKind::Plain)
    }

    #[test]
    fn edges_are_sorted_and_indexed() {
        let a = plain("fldA", "tblA");
        let b = plain("fldB", "tblA");
        let c = plain("fldC", "tblB");
        let edges = vec![
            DependencyEdge::cross_record(&a, &c, EdgeSemantic::GenericRef, None),
            DependencyEdge::same_record(&a, &b, EdgeSemantic::FormulaRef),
            DependencyEdge::same_record(&a, &b, EdgeSemantic::FormulaRef),
        ];
        let graph = DependencyGraph::new([a.clone(), b.clone(), c], edges);

        assert_eq!(graph.edges().len(), 2);
        assert_eq!(graph.edges()[0].to_field_id, b.id);
        let dependents: Vec<_> = graph.dependents(&a.id).map(|e| e.to_field_id.clone()).collect();
        assert_eq!(dependents, vec![FieldId::new("fldB"), FieldId::new("fldC")]);
        assert_eq!(graph.dependencies(&b.id).count(), 1);
        assert!(graph.edges()[1].is_cross_record());
    }
}
