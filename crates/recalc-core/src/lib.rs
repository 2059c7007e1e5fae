//! # recalc-core
//!
//! Shared primitives for the recalc computed-field propagation engine.
//!
//! This crate provides the types every recalc component agrees on:
//!
//! - **Identifiers**: Strongly-typed ids for workspaces, tables, fields, records and runs
//! - **Field Model**: A closed enum over field kinds with their configuration
//! - **Filters**: Condition trees used by filtered lookups and conditional fields
//! - **Catalog**: The read-only metadata seam and an in-memory implementation
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Example
//!
//! ```rust
//! use recalc_core::prelude::*;
//!
//! let table = TableId::new("tblBugs");
//! let field = Field::new(FieldId::generate(), table, "Name", FieldKind::Plain);
//! assert!(!field.is_computed());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod catalog;
pub mod error;
pub mod field;
pub mod filter;
pub mod id;
pub mod observability;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use recalc_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::catalog::{FieldCatalog, FieldReference, InMemoryCatalog, Table};
    pub use crate::error::{Error, Result};
    pub use crate::field::{
        ConditionalOptions, ConditionalRollupOptions, Field, FieldKind, FormulaOptions,
        LinkOptions, LookupOptions, Relationship, RollupFunction, RollupOptions,
    };
    pub use crate::filter::{FilterCondition, FilterExpr, FilterOperator, RowView};
    pub use crate::id::{FieldId, OutboxTaskId, RecordId, RunId, TableId, WorkspaceId};
}

pub use error::{Error, Result};
pub use field::{Field, FieldKind};
pub use filter::FilterExpr;
pub use id::{FieldId, OutboxTaskId, RecordId, RunId, TableId, WorkspaceId};
pub use observability::{LogFormat, init_logging};
