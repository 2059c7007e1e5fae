//! Read-only access to table and field metadata.
//!
//! The catalog is an external collaborator. [`FieldCatalog`] is the seam recalc reads
//! it through; [`InMemoryCatalog`] backs tests and embedded use.

use std::collections::{BTreeMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::field::Field;
use crate::id::{FieldId, TableId, WorkspaceId};

/// Table metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Table {
    /// Table identifier.
    pub id: TableId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Display name.
    pub name: String,
    /// Physical table name.
    pub db_table_name: String,
}

/// A generic "field A is read by field B" reference.
///
/// The catalog records these for every dependency it knows about, including the
/// ones the graph builder can also derive from field options.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldReference {
    /// Field being read.
    pub from_field_id: FieldId,
    /// Field that reads it.
    pub to_field_id: FieldId,
}

/// Read-only table/field metadata.
#[async_trait]
pub trait FieldCatalog: Send + Sync {
    /// Gets a table by id.
    async fn get_table(&self, table_id: &TableId) -> Result<Option<Table>>;

    /// Gets the fields with the given ids; missing ids are absent from the result.
    async fn get_fields(&self, field_ids: &[FieldId]) -> Result<Vec<Field>>;

    /// Lists the non-deleted fields of one table.
    async fn list_fields(&self, table_id: &TableId) -> Result<Vec<Field>>;

    /// Lists the non-deleted fields of every table in a workspace.
    async fn list_workspace_fields(&self, workspace_id: &WorkspaceId) -> Result<Vec<Field>>;

    /// Lists references whose `from_field_id` is one of `field_ids` (dependents direction).
    async fn references_from(&self, field_ids: &[FieldId]) -> Result<Vec<FieldReference>>;

    /// Lists every reference between fields of a workspace.
    async fn list_workspace_references(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<FieldReference>>;
}

#[derive(Debug, Default)]
struct CatalogState {
    tables: BTreeMap<TableId, Table>,
    fields: BTreeMap<FieldId, Field>,
    references: Vec<FieldReference>,
}

/// In-memory catalog.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::storage("catalog lock poisoned")
}

impl InMemoryCatalog {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog lock is poisoned.
    pub fn put_table(&self, table: Table) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.tables.insert(table.id.clone(), table);
        Ok(())
    }

    /// Registers (or replaces) a field after validating it, recording the references
    /// its configuration implies.
    ///
    /// # Errors
    ///
    /// Returns an error if the field's table is unknown, its configuration is invalid,
    /// or the catalog lock is poisoned.
    pub fn put_field(&self, field: Field) -> Result<()> {
        field.validate()?;
        let mut state = self.state.write().map_err(poison_err)?;
        if !state.tables.contains_key(&field.table_id) {
            return Err(Error::resource_not_found("table", &field.table_id));
        }
        state.references.retain(|r| r.to_field_id != field.id);
        for from in field.dependencies() {
            state.references.push(FieldReference {
                from_field_id: from,
                to_field_id: field.id.clone(),
            });
        }
        state.fields.insert(field.id.clone(), field);
        Ok(())
    }

    /// Records a generic reference.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog lock is poisoned.
    pub fn add_reference(&self, from: FieldId, to: FieldId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let reference = FieldReference {
            from_field_id: from,
            to_field_id: to,
        };
        if !state.references.contains(&reference) {
            state.references.push(reference);
        }
        Ok(())
    }

    /// Soft-deletes a field.
    ///
    /// # Errors
    ///
    /// Returns not-found if the field does not exist.
    pub fn delete_field(&self, field_id: &FieldId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        let field = state
            .fields
            .get_mut(field_id)
            .ok_or_else(|| Error::resource_not_found("field", field_id))?;
        field.is_deleted = true;
        Ok(())
    }

    fn workspace_tables(state: &CatalogState, workspace_id: &WorkspaceId) -> HashSet<TableId> {
        state
            .tables
            .values()
            .filter(|t| &t.workspace_id == workspace_id)
            .map(|t| t.id.clone())
            .collect()
    }
}

#[async_trait]
impl FieldCatalog for InMemoryCatalog {
    async fn get_table(&self, table_id: &TableId) -> Result<Option<Table>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state.tables.get(table_id).cloned())
    }

    async fn get_fields(&self, field_ids: &[FieldId]) -> Result<Vec<Field>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(field_ids
            .iter()
            .filter_map(|id| state.fields.get(id))
            .filter(|f| !f.is_deleted)
            .cloned()
            .collect())
    }

    async fn list_fields(&self, table_id: &TableId) -> Result<Vec<Field>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .fields
            .values()
            .filter(|f| &f.table_id == table_id && !f.is_deleted)
            .cloned()
            .collect())
    }

    async fn list_workspace_fields(&self, workspace_id: &WorkspaceId) -> Result<Vec<Field>> {
        let state = self.state.read().map_err(poison_err)?;
        let tables = Self::workspace_tables(&state, workspace_id);
        Ok(state
            .fields
            .values()
            .filter(|f| tables.contains(&f.table_id) && !f.is_deleted)
            .cloned()
            .collect())
    }

    async fn references_from(&self, field_ids: &[FieldId]) -> Result<Vec<FieldReference>> {
        let state = self.state.read().map_err(poison_err)?;
        Ok(state
            .references
            .iter()
            .filter(|r| field_ids.contains(&r.from_field_id))
            .cloned()
            .collect())
    }

    async fn list_workspace_references(
        &self,
        workspace_id: &WorkspaceId,
    ) -> Result<Vec<FieldReference>> {
        let state = self.state.read().map_err(poison_err)?;
        let tables = Self::workspace_tables(&state, workspace_id);
        let in_workspace = |id: &FieldId| {
            state
                .fields
                .get(id)
                .is_some_and(|f| tables.contains(&f.table_id))
        };
        Ok(state
            .references
            .iter()
            .filter(|r| in_workspace(&r.from_field_id) && in_workspace(&r.to_field_id))
            .cloned()
            .collect())
    }
}
