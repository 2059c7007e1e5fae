//! Loading a dependency graph from the catalog.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use recalc_core::catalog::{FieldCatalog, FieldReference};
use recalc_core::{Field, FieldId, WorkspaceId};

use super::DependencyGraph;
use super::derive::{derive_edges, validate_symmetric_links};
use crate::error::Result;

/// Bounds for incremental graph loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphLoadConfig {
    /// Field ids per catalog call.
    pub batch_size: usize,
    /// Maximum breadth-first rounds.
    pub max_iterations: usize,
    /// Maximum number of fields in the closure.
    pub max_visited: usize,
}

impl Default for GraphLoadConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_iterations: 64,
            max_visited: 10_000,
        }
    }
}

/// Loads [`DependencyGraph`]s through a [`FieldCatalog`].
pub struct GraphBuilder {
    catalog: Arc<dyn FieldCatalog>,
    config: GraphLoadConfig,
}

impl GraphBuilder {
    /// Creates a builder.
    #[must_use]
    pub fn new(catalog: Arc<dyn FieldCatalog>, config: GraphLoadConfig) -> Self {
        Self { catalog, config }
    }

    /// Loads the graph for a workspace.
    ///
    /// With `seed_field_ids` the graph holds the breadth-first closure of the seeds'
    /// dependents (plus the fields their configuration reads); without, it holds every
    /// field of the workspace.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog fails.
    #[tracing::instrument(skip(self, seed_field_ids), fields(seeds = seed_field_ids.map_or(0, <[FieldId]>::len)))]
    pub async fn load(
        &self,
        workspace_id: &WorkspaceId,
        seed_field_ids: Option<&[FieldId]>,
    ) -> Result<DependencyGraph> {
        match seed_field_ids {
            None => self.load_full(workspace_id).await,
            Some(seeds) => self.load_incremental(seeds).await,
        }
    }

    async fn load_full(&self, workspace_id: &WorkspaceId) -> Result<DependencyGraph> {
        let fields = self.catalog.list_workspace_fields(workspace_id).await?;
        let references = self.catalog.list_workspace_references(workspace_id).await?;
        let mut fields: BTreeMap<FieldId, Field> =
            fields.into_iter().map(|f| (f.id.clone(), f)).collect();
        validate_symmetric_links(&mut fields);

        let targets: Vec<FieldId> = fields.keys().cloned().collect();
        let edges = derive_edges(&fields, &targets, &references);
        tracing::debug!(fields = fields.len(), edges = edges.len(), "loaded full graph");
        Ok(DependencyGraph::new(fields.into_values(), edges))
    }

    async fn load_incremental(&self, seeds: &[FieldId]) -> Result<DependencyGraph> {
        let batch_size = self.config.batch_size.max(1);
        let mut visited: BTreeSet<FieldId> = seeds.iter().cloned().collect();
        let mut frontier: Vec<FieldId> = visited.iter().cloned().collect();
        let mut references: Vec<FieldReference> = Vec::new();
        let mut iterations = 0;

        while !frontier.is_empty() {
            if iterations >= self.config.max_iterations {
                tracing::warn!(
                    iterations,
                    visited = visited.len(),
                    "graph closure hit iteration cap; dependents beyond this depth are not loaded"
                );
                break;
            }
            if visited.len() > self.config.max_visited {
                tracing::warn!(
                    visited = visited.len(),
                    max_visited = self.config.max_visited,
                    "graph closure hit visited-node cap"
                );
                break;
            }
            iterations += 1;

            let mut next = Vec::new();
            for batch in frontier.chunks(batch_size) {
                for reference in self.catalog.references_from(batch).await? {
                    if visited.insert(reference.to_field_id.clone()) {
                        next.push(reference.to_field_id.clone());
                    }
                    references.push(reference);
                }
            }
            frontier = next;
        }

        let mut fields = self.fetch(&visited.iter().cloned().collect::<Vec<_>>()).await?;

        // Fields read by configuration (links, foreign sources, filter fields, symmetric
        // counterparts) are loaded so edges carry the right table ids.
        let context: Vec<FieldId> = fields
            .values()
            .flat_map(|f| {
                let mut ids = f.dependencies();
                if let Some(symmetric) = f.kind.link_options().and_then(|o| o.symmetric_field_id.clone()) {
                    ids.push(symmetric);
                }
                ids
            })
            .filter(|id| !fields.contains_key(id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        fields.extend(self.fetch(&context).await?);
        validate_symmetric_links(&mut fields);

        let targets: Vec<FieldId> = visited.iter().filter(|id| fields.contains_key(*id)).cloned().collect();
        let edges = derive_edges(&fields, &targets, &references);
        tracing::debug!(
            iterations,
            closure = visited.len(),
            fields = fields.len(),
            edges = edges.len(),
            "loaded incremental graph"
        );
        Ok(DependencyGraph::new(fields.into_values(), edges))
    }

    async fn fetch(&self, ids: &[FieldId]) -> Result<BTreeMap<FieldId, Field>> {
        let mut out = BTreeMap::new();
        let mut seen = HashSet::new();
        for batch in ids.chunks(self.config.batch_size.max(1)) {
            for field in self.catalog.get_fields(batch).await? {
                if seen.insert(field.id.clone()) {
                    out.insert(field.id.clone(), field);
                }
            }
        }
        Ok(out)
    }
}
