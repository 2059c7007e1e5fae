//! Record storage seam used by the executor.
//!
//! The executor never renders SQL itself. It drives a [`ComputeTransaction`] through a
//! small set of relational primitives:
//!
//! - **Dirty marker**: a transaction-scoped set of `(table, record)` pairs, seeded from
//!   the change and grown by [`ComputeTransaction::propagate_dirty`]
//! - **Bulk update**: recompute a list of fields for every dirty row of one table,
//!   optionally as a chain of stages where later stages observe earlier results
//! - **Advisory locks**: transaction-scoped, released on commit or rollback
//!
//! [`memory::InMemoryRecordStore`] is a relational test double that evaluates every
//! computed kind in process.

pub mod memory;

use async_trait::async_trait;

use recalc_core::{Field, RecordId, TableId};

use crate::error::Result;
use crate::events::RecordChange;
use crate::plan::PropagationEdge;

/// One bulk "update rows from a computed projection" statement.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkUpdate {
    /// Table whose dirty rows are updated.
    pub table_id: TableId,
    /// Field groups computed in order; each group observes the results of earlier groups.
    pub stages: Vec<Vec<Field>>,
    /// Whether to report before/after values.
    pub collect_changes: bool,
}

impl BulkUpdate {
    /// Creates a single-stage update.
    #[must_use]
    pub fn single(table_id: TableId, fields: Vec<Field>, collect_changes: bool) -> Self {
        Self {
            table_id,
            stages: vec![fields],
            collect_changes,
        }
    }

    /// Returns true if no stage has any field.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(Vec::is_empty)
    }
}

/// Result of a [`BulkUpdate`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateOutcome {
    /// Rows whose version was bumped, sorted.
    pub updated_record_ids: Vec<RecordId>,
    /// Rows whose values actually changed, when requested.
    pub changes: Vec<RecordChange>,
}

/// A unit of work against the record store.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait ComputeTransaction: Send {
    /// Takes a transaction-scoped advisory lock, waiting if another transaction holds it.
    async fn advisory_lock(&mut self, key: &str) -> Result<()>;

    /// Clears the dirty marker.
    async fn reset_dirty(&mut self) -> Result<()>;

    /// Marks records dirty, ignoring ones already marked.
    ///
    /// Returns the number of newly marked pairs.
    async fn mark_dirty(&mut self, table_id: &TableId, record_ids: &[RecordId]) -> Result<u64>;

    /// Marks every row of a table dirty.
    ///
    /// Returns the number of newly marked pairs.
    async fn mark_all_dirty(&mut self, table_id: &TableId) -> Result<u64>;

    /// Marks rows of `edge.to_table_id` reachable from dirty rows of `edge.from_table_id`.
    ///
    /// Returns the number of newly marked pairs.
    async fn propagate_dirty(&mut self, edge: &PropagationEdge) -> Result<u64>;

    /// Number of dirty rows of a table.
    async fn dirty_count(&mut self, table_id: &TableId) -> Result<u64>;

    /// Dirty rows of a table, sorted.
    async fn dirty_records(&mut self, table_id: &TableId) -> Result<Vec<RecordId>>;

    /// Recomputes fields for every dirty row of `update.table_id`.
    async fn update_from_projection(&mut self, update: &BulkUpdate) -> Result<UpdateOutcome>;

    /// Makes the transaction's writes durable.
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Discards the transaction's writes.
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens compute transactions.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Begins a transaction.
    async fn begin(&self) -> Result<Box<dyn ComputeTransaction>>;
}
