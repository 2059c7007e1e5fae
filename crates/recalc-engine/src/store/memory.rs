//! In-memory record store for testing.
//!
//! [`InMemoryRecordStore`] keeps rows as JSON cells keyed by field id and evaluates
//! computed fields the way the SQL projection would:
//!
//! - link cells are arrays of `{"id", "title"}` objects; recomputing a link refreshes
//!   titles and drops ids whose row no longer exists
//! - lookups and rollups follow link ids into the foreign table, honoring the optional
//!   lookup filter with the host row bound
//! - conditional fields scan the foreign table with their condition
//! - formulas are closures registered per field
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: No durability, no cross-process coordination
//! - Transactions run one at a time; a transaction works on a private copy of every
//!   table and publishes it on commit

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::OwnedMutexGuard;

use recalc_core::field::{ConditionalOptions, LinkOptions, LookupOptions, RollupFunction};
use recalc_core::filter::{RowView, is_empty};
use recalc_core::{Field, FieldId, FieldKind, RecordId, TableId};

use super::{BulkUpdate, ComputeTransaction, RecordStore, UpdateOutcome};
use crate::error::{Error, Result};
use crate::events::{FieldChange, RecordChange};
use crate::plan::{PropagationEdge, PropagationMode};

/// Formula evaluator registered for one field.
pub type FormulaFn = Arc<dyn Fn(&Row) -> Value + Send + Sync>;

/// One stored row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    /// Incremented by every applied update.
    pub version: u64,
    /// Cell values by field.
    pub cells: HashMap<FieldId, Value>,
}

impl Row {
    /// Returns a cell, or null when unset.
    #[must_use]
    pub fn get(&self, field_id: &FieldId) -> Value {
        self.cells.get(field_id).cloned().unwrap_or(Value::Null)
    }
}

impl RowView for Row {
    fn cell(&self, field_id: &FieldId) -> Option<&Value> {
        self.cells.get(field_id)
    }
}

type Tables = BTreeMap<TableId, BTreeMap<RecordId, Row>>;
type Formulas = HashMap<FieldId, FormulaFn>;

/// Builds a link cell pointing at `ids`.
#[must_use]
pub fn link_value<'a>(ids: impl IntoIterator<Item = &'a str>) -> Value {
    Value::Array(ids.into_iter().map(|id| json!({ "id": id })).collect())
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

/// In-memory relational test double.
#[derive(Clone)]
pub struct InMemoryRecordStore {
    tables: Arc<RwLock<Tables>>,
    formulas: Arc<RwLock<Formulas>>,
    gate: Arc<tokio::sync::Mutex<()>>,
    lock_log: Arc<Mutex<Vec<String>>>,
}

impl fmt::Debug for InMemoryRecordStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryRecordStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryRecordStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(RwLock::new(BTreeMap::new())),
            formulas: Arc::new(RwLock::new(HashMap::new())),
            gate: Arc::new(tokio::sync::Mutex::new(())),
            lock_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Registers the evaluator of a formula field.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn register_formula(
        &self,
        field_id: FieldId,
        formula: impl Fn(&Row) -> Value + Send + Sync + 'static,
    ) -> Result<()> {
        self.formulas
            .write()
            .map_err(poison_err)?
            .insert(field_id, Arc::new(formula));
        Ok(())
    }

    /// Inserts (or replaces) a row at version 1.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn insert_row(
        &self,
        table_id: &TableId,
        record_id: &RecordId,
        cells: impl IntoIterator<Item = (FieldId, Value)>,
    ) -> Result<()> {
        let row = Row {
            version: 1,
            cells: cells.into_iter().collect(),
        };
        self.tables
            .write()
            .map_err(poison_err)?
            .entry(table_id.clone())
            .or_default()
            .insert(record_id.clone(), row);
        Ok(())
    }

    /// Writes user cells of an existing row, bumping its version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the row does not exist.
    pub fn set_cells(
        &self,
        table_id: &TableId,
        record_id: &RecordId,
        cells: impl IntoIterator<Item = (FieldId, Value)>,
    ) -> Result<()> {
        let mut tables = self.tables.write().map_err(poison_err)?;
        let row = tables
            .get_mut(table_id)
            .and_then(|t| t.get_mut(record_id))
            .ok_or_else(|| Error::validation(format!("row {table_id}/{record_id} does not exist")))?;
        row.cells.extend(cells);
        row.version += 1;
        Ok(())
    }

    /// Removes a row. Links pointing at it keep the stale id until recomputed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn delete_row(&self, table_id: &TableId, record_id: &RecordId) -> Result<bool> {
        Ok(self
            .tables
            .write()
            .map_err(poison_err)?
            .get_mut(table_id)
            .and_then(|t| t.remove(record_id))
            .is_some())
    }

    /// Returns a copy of a row.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row(&self, table_id: &TableId, record_id: &RecordId) -> Result<Option<Row>> {
        Ok(self
            .tables
            .read()
            .map_err(poison_err)?
            .get(table_id)
            .and_then(|t| t.get(record_id))
            .cloned())
    }

    /// Returns one cell (null when the row or cell is missing).
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn cell(&self, table_id: &TableId, record_id: &RecordId, field_id: &FieldId) -> Result<Value> {
        Ok(self
            .row(table_id, record_id)?
            .map(|r| r.get(field_id))
            .unwrap_or(Value::Null))
    }

    /// Number of rows in a table.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn row_count(&self, table_id: &TableId) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .map_err(poison_err)?
            .get(table_id)
            .map_or(0, BTreeMap::len))
    }

    /// Advisory lock keys taken so far, in acquisition order.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn advisory_locks(&self) -> Result<Vec<String>> {
        Ok(self.lock_log.lock().map_err(poison_err)?.clone())
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn begin(&self) -> Result<Box<dyn ComputeTransaction>> {
        let gate = Arc::clone(&self.gate).lock_owned().await;
        let tables = self.tables.read().map_err(poison_err)?.clone();
        let formulas = self.formulas.read().map_err(poison_err)?.clone();
        Ok(Box::new(MemoryTransaction {
            tables,
            formulas,
            dirty: BTreeMap::new(),
            shared: Arc::clone(&self.tables),
            lock_log: Arc::clone(&self.lock_log),
            _gate: gate,
        }))
    }
}

struct MemoryTransaction {
    tables: Tables,
    formulas: Formulas,
    dirty: BTreeMap<TableId, BTreeSet<RecordId>>,
    shared: Arc<RwLock<Tables>>,
    lock_log: Arc<Mutex<Vec<String>>>,
    _gate: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn insert_dirty(&mut self, table_id: &TableId, record_ids: impl IntoIterator<Item = RecordId>) -> u64 {
        let set = self.dirty.entry(table_id.clone()).or_default();
        let mut added = 0;
        for id in record_ids {
            if set.insert(id) {
                added += 1;
            }
        }
        added
    }

    fn rows(&self, table_id: &TableId) -> impl Iterator<Item = (&RecordId, &Row)> {
        self.tables.get(table_id).into_iter().flat_map(BTreeMap::iter)
    }

    fn compute(&self, field: &Field, row: &Row) -> Result<Value> {
        match &field.kind {
            FieldKind::Plain => Ok(row.get(&field.id)),
            FieldKind::Formula(_) => self
                .formulas
                .get(&field.id)
                .map(|formula| formula(row))
                .ok_or_else(|| Error::validation(format!("no formula registered for {}", field.id))),
            FieldKind::Lookup(options) => Ok(Value::Array(self.lookup_values(options, row))),
            FieldKind::Rollup(options) => Ok(aggregate(options.function, &self.lookup_values(&options.lookup, row))),
            FieldKind::Link(options) => Ok(self.refresh_link(&field.id, options, row)),
            FieldKind::ConditionalLookup(options) => Ok(Value::Array(self.conditional_values(options, row))),
            FieldKind::ConditionalRollup(options) => Ok(aggregate(
                options.function,
                &self.conditional_values(&options.condition, row),
            )),
        }
    }

    fn lookup_values(&self, options: &LookupOptions, host: &Row) -> Vec<Value> {
        let Some(foreign) = self.tables.get(&options.foreign_table_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for id in link_ids(&host.get(&options.link_field_id)) {
            let Some(row) = foreign.get(&id) else {
                continue;
            };
            if options
                .filter
                .as_ref()
                .is_some_and(|filter| !filter.matches(row, Some(host as &dyn RowView)))
            {
                continue;
            }
            push_flat(&mut out, row.get(&options.lookup_field_id));
        }
        out
    }

    fn conditional_values(&self, options: &ConditionalOptions, host: &Row) -> Vec<Value> {
        let mut out = Vec::new();
        for (_, row) in self.rows(&options.foreign_table_id) {
            if options
                .filter
                .as_ref()
                .is_some_and(|filter| !filter.matches(row, Some(host as &dyn RowView)))
            {
                continue;
            }
            push_flat(&mut out, row.get(&options.lookup_field_id));
        }
        out
    }

    fn refresh_link(&self, link_field_id: &FieldId, options: &LinkOptions, host: &Row) -> Value {
        let foreign = self.tables.get(&options.foreign_table_id);
        let items = link_ids(&host.get(link_field_id))
            .into_iter()
            .filter_map(|id| {
                let row = foreign?.get(&id)?;
                Some(json!({ "id": id.as_str(), "title": row.get(&options.lookup_field_id) }))
            })
            .collect();
        Value::Array(items)
    }
}

#[async_trait]
impl ComputeTransaction for MemoryTransaction {
    async fn advisory_lock(&mut self, key: &str) -> Result<()> {
        self.lock_log.lock().map_err(poison_err)?.push(key.to_string());
        Ok(())
    }

    async fn reset_dirty(&mut self) -> Result<()> {
        self.dirty.clear();
        Ok(())
    }

    async fn mark_dirty(&mut self, table_id: &TableId, record_ids: &[RecordId]) -> Result<u64> {
        Ok(self.insert_dirty(table_id, record_ids.iter().cloned()))
    }

    async fn mark_all_dirty(&mut self, table_id: &TableId) -> Result<u64> {
        let ids: Vec<RecordId> = self.rows(table_id).map(|(id, _)| id.clone()).collect();
        Ok(self.insert_dirty(table_id, ids))
    }

    async fn propagate_dirty(&mut self, edge: &PropagationEdge) -> Result<u64> {
        let sources = self.dirty.get(&edge.from_table_id).cloned().unwrap_or_default();
        if sources.is_empty() {
            return Ok(0);
        }

        let targets: Vec<RecordId> = match (edge.mode, &edge.link_field_id, &edge.filter_condition) {
            (PropagationMode::LinkTraversal, Some(link), _) => self
                .rows(&edge.to_table_id)
                .filter(|(_, row)| link_ids(&row.get(link)).iter().any(|id| sources.contains(id)))
                .map(|(id, _)| id.clone())
                .collect(),
            (PropagationMode::LinkTraversal, None, _) => {
                return Err(Error::validation(format!(
                    "link traversal edge {} -> {} has no link field",
                    edge.from_table_id, edge.to_table_id
                )));
            }
            (PropagationMode::ConditionalFiltered, _, Some(filter)) => {
                let source_rows: Vec<&Row> = self
                    .tables
                    .get(&edge.from_table_id)
                    .map(|t| sources.iter().filter_map(|id| t.get(id)).collect())
                    .unwrap_or_default();
                self.rows(&edge.to_table_id)
                    .filter(|(_, host)| source_rows.iter().any(|src| filter.matches(*src, Some(*host as &dyn RowView))))
                    .map(|(id, _)| id.clone())
                    .collect()
            }
            (PropagationMode::AllTargetRecords | PropagationMode::ConditionalFiltered, _, _) => {
                self.rows(&edge.to_table_id).map(|(id, _)| id.clone()).collect()
            }
        };
        Ok(self.insert_dirty(&edge.to_table_id, targets))
    }

    async fn dirty_count(&mut self, table_id: &TableId) -> Result<u64> {
        Ok(self.dirty.get(table_id).map_or(0, |s| s.len() as u64))
    }

    async fn dirty_records(&mut self, table_id: &TableId) -> Result<Vec<RecordId>> {
        Ok(self
            .dirty
            .get(table_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_from_projection(&mut self, update: &BulkUpdate) -> Result<UpdateOutcome> {
        let table_id = &update.table_id;
        let targets: Vec<RecordId> = match (self.dirty.get(table_id), self.tables.get(table_id)) {
            (Some(dirty), Some(rows)) => dirty.iter().filter(|id| rows.contains_key(*id)).cloned().collect(),
            _ => Vec::new(),
        };
        if targets.is_empty() || update.is_empty() {
            return Ok(UpdateOutcome::default());
        }

        let before: HashMap<RecordId, Row> = self
            .rows(table_id)
            .filter(|(id, _)| targets.contains(id))
            .map(|(id, row)| (id.clone(), row.clone()))
            .collect();

        for stage in &update.stages {
            let fields: Vec<&Field> = stage.iter().filter(|f| !f.db_generated).collect();
            let mut writes: Vec<(RecordId, FieldId, Value)> = Vec::with_capacity(targets.len() * fields.len());
            for record_id in &targets {
                let Some(row) = self.tables.get(table_id).and_then(|t| t.get(record_id)) else {
                    continue;
                };
                for field in &fields {
                    writes.push((record_id.clone(), field.id.clone(), self.compute(field, row)?));
                }
            }
            if let Some(rows) = self.tables.get_mut(table_id) {
                for (record_id, field_id, value) in writes {
                    if let Some(row) = rows.get_mut(&record_id) {
                        row.cells.insert(field_id, value);
                    }
                }
            }
        }

        let field_ids: Vec<&FieldId> = update.stages.iter().flatten().filter(|f| !f.db_generated).map(|f| &f.id).collect();
        let mut outcome = UpdateOutcome::default();
        if let Some(rows) = self.tables.get_mut(table_id) {
            for record_id in &targets {
                let Some(row) = rows.get_mut(record_id) else {
                    continue;
                };
                row.version += 1;
                outcome.updated_record_ids.push(record_id.clone());

                if !update.collect_changes {
                    continue;
                }
                let Some(old) = before.get(record_id) else {
                    continue;
                };
                let fields: Vec<FieldChange> = field_ids
                    .iter()
                    .filter_map(|id| {
                        let old_value = old.get(id);
                        let new_value = row.get(id);
                        (old_value != new_value).then(|| FieldChange {
                            field_id: (*id).clone(),
                            old_value,
                            new_value,
                        })
                    })
                    .collect();
                if !fields.is_empty() {
                    outcome.changes.push(RecordChange {
                        table_id: table_id.clone(),
                        record_id: record_id.clone(),
                        old_version: old.version,
                        new_version: row.version,
                        fields,
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        *this.shared.write().map_err(poison_err)? = this.tables;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

/// Reads record ids out of a link cell.
fn link_ids(cell: &Value) -> Vec<RecordId> {
    let id_of = |item: &Value| match item {
        Value::String(id) => Some(RecordId::new(id.as_str())),
        Value::Object(map) => map.get("id").and_then(Value::as_str).map(RecordId::new),
        _ => None,
    };
    match cell {
        Value::Array(items) => items.iter().filter_map(id_of).collect(),
        other => id_of(other).into_iter().collect(),
    }
}

fn push_flat(out: &mut Vec<Value>, value: Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => out.extend(items.into_iter().filter(|v| !v.is_null())),
        other => out.push(other),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < 9.0e15 {
        return json!(value as i64);
    }
    json!(value)
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => map.get("title").map(display).unwrap_or_default(),
        other => other.to_string(),
    }
}

fn aggregate(function: RollupFunction, values: &[Value]) -> Value {
    let numbers = || values.iter().filter_map(Value::as_f64);
    match function {
        RollupFunction::Count => json!(values.iter().filter(|v| !is_empty(v)).count()),
        RollupFunction::Sum => number(numbers().sum()),
        RollupFunction::Min => numbers().reduce(f64::min).map_or(Value::Null, number),
        RollupFunction::Max => numbers().reduce(f64::max).map_or(Value::Null, number),
        RollupFunction::ArrayJoin => Value::String(values.iter().map(display).collect::<Vec<_>>().join(", ")),
    }
}
