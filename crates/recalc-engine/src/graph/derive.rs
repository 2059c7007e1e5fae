//! Edge derivation rules.
//!
//! Every computed field kind implies a fixed set of dependency edges. Derived edges
//! carry exact semantics and win over catalog references for the same field pair;
//! leftover references become `generic_ref` edges.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use recalc_core::catalog::FieldReference;
use recalc_core::field::{ConditionalRollupOptions, LookupOptions, RollupOptions};
use recalc_core::{Field, FieldId, FieldKind, FilterExpr};

use super::{DependencyEdge, EdgeSemantic};

/// Derives the edges of every field in `targets`, then folds in catalog references.
///
/// Edges whose source field is not present in `fields` are skipped with a warning.
#[must_use]
pub fn derive_edges<'a>(
    fields: &BTreeMap<FieldId, Field>,
    targets: impl IntoIterator<Item = &'a FieldId>,
    references: &[FieldReference],
) -> Vec<DependencyEdge> {
    let targets: BTreeSet<&FieldId> = targets.into_iter().collect();
    let mut edges = Vec::new();
    for id in &targets {
        if let Some(field) = fields.get(*id) {
            edges.extend(edges_for_field(fields, field));
        }
    }

    let derived_pairs: HashSet<(FieldId, FieldId)> = edges
        .iter()
        .map(|e| (e.from_field_id.clone(), e.to_field_id.clone()))
        .collect();

    for reference in references {
        if !targets.contains(&reference.to_field_id)
            || derived_pairs.contains(&(reference.from_field_id.clone(), reference.to_field_id.clone()))
        {
            continue;
        }
        let (Some(from), Some(to)) = (
            fields.get(&reference.from_field_id),
            fields.get(&reference.to_field_id),
        ) else {
            tracing::warn!(
                from = %reference.from_field_id,
                to = %reference.to_field_id,
                "skipping reference to unloaded field"
            );
            continue;
        };
        if from.is_deleted || to.is_deleted {
            continue;
        }
        edges.push(if from.table_id == to.table_id {
            DependencyEdge::same_record(from, to, EdgeSemantic::GenericRef)
        } else {
            DependencyEdge::cross_record(from, to, EdgeSemantic::GenericRef, None)
        });
    }

    edges.sort();
    edges.dedup();
    edges
}

fn edges_for_field(fields: &BTreeMap<FieldId, Field>, field: &Field) -> Vec<DependencyEdge> {
    let mut edges = Vec::new();
    let mut resolve = |id: &FieldId| {
        let found = fields.get(id).filter(|f| !f.is_deleted);
        if found.is_none() {
            tracing::warn!(
                field = %field.id,
                dependency = %id,
                kind = field.kind.name(),
                "skipping edge from missing or deleted field"
            );
        }
        found
    };

    match &field.kind {
        FieldKind::Plain => {}
        FieldKind::Formula(options) => {
            for reference in &options.references {
                if let Some(from) = resolve(reference) {
                    if from.table_id == field.table_id {
                        edges.push(DependencyEdge::same_record(from, field, EdgeSemantic::FormulaRef));
                    }
                }
            }
        }
        FieldKind::Lookup(options)
        | FieldKind::Rollup(RollupOptions {
            lookup: options, ..
        }) => lookup_edges(field, options, &mut resolve, &mut edges),
        FieldKind::Link(options) => {
            if let Some(title) = resolve(&options.lookup_field_id) {
                edges.push(DependencyEdge::cross_record(
                    title,
                    field,
                    EdgeSemantic::LinkTitle,
                    Some(field.id.clone()),
                ));
            }
        }
        FieldKind::ConditionalLookup(options)
        | FieldKind::ConditionalRollup(ConditionalRollupOptions {
            condition: options, ..
        }) => {
            let semantic = if matches!(field.kind, FieldKind::ConditionalRollup(_)) {
                EdgeSemantic::ConditionalRollupSource
            } else {
                EdgeSemantic::ConditionalLookupSource
            };
            if let Some(source) = resolve(&options.lookup_field_id) {
                edges.push(DependencyEdge::cross_record(source, field, semantic, None));
            }
            if let Some(filter) = &options.filter {
                filter_edges(field, filter, None, EdgeSemantic::ConditionalFilter, &mut resolve, &mut edges);
            }
        }
    }
    edges
}

fn lookup_edges<'f>(
    field: &Field,
    options: &LookupOptions,
    resolve: &mut impl FnMut(&FieldId) -> Option<&'f Field>,
    edges: &mut Vec<DependencyEdge>,
) {
    if let Some(link) = resolve(&options.link_field_id) {
        edges.push(DependencyEdge::same_record(link, field, EdgeSemantic::LookupLink));
    }
    if let Some(source) = resolve(&options.lookup_field_id) {
        edges.push(DependencyEdge::cross_record(
            source,
            field,
            EdgeSemantic::LookupSource,
            Some(options.link_field_id.clone()),
        ));
    }
    if let Some(filter) = &options.filter {
        filter_edges(
            field,
            filter,
            Some(&options.link_field_id),
            EdgeSemantic::LookupFilter,
            resolve,
            edges,
        );
    }
}

fn filter_edges<'f>(
    field: &Field,
    filter: &FilterExpr,
    link_field_id: Option<&FieldId>,
    semantic: EdgeSemantic,
    resolve: &mut impl FnMut(&FieldId) -> Option<&'f Field>,
    edges: &mut Vec<DependencyEdge>,
) {
    for id in filter.field_ids() {
        if let Some(from) = resolve(&id) {
            edges.push(DependencyEdge::cross_record(from, field, semantic, link_field_id.cloned()));
        }
    }
    for id in filter.host_field_ids() {
        if let Some(from) = resolve(&id) {
            edges.push(DependencyEdge::same_record(from, field, semantic));
        }
    }
}

/// Degrades links whose declared symmetric counterpart is invalid to one-way links.
///
/// A counterpart is valid when it exists, is not deleted, is a link, and declares the
/// original link as its own counterpart.
pub fn validate_symmetric_links(fields: &mut BTreeMap<FieldId, Field>) {
    let invalid: Vec<FieldId> = fields
        .values()
        .filter_map(|field| {
            let symmetric = field.kind.link_options()?.symmetric_field_id.as_ref()?;
            let valid = fields
                .get(symmetric)
                .filter(|s| !s.is_deleted)
                .and_then(|s| s.kind.link_options())
                .is_some_and(|s| s.symmetric_field_id.as_ref() == Some(&field.id));
            (!valid).then(|| field.id.clone())
        })
        .collect();

    for id in invalid {
        if let Some(FieldKind::Link(options)) = fields.get_mut(&id).map(|f| &mut f.kind) {
            tracing::warn!(
                field = %id,
                symmetric = ?options.symmetric_field_id,
                "symmetric link counterpart is invalid; treating link as one-way"
            );
            options.symmetric_field_id = None;
        }
    }
}
