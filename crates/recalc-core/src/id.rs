//! Strongly-typed identifiers for recalc entities.
//!
//! Schema and row identifiers (`WorkspaceId`, `TableId`, `FieldId`, `RecordId`) are
//! opaque strings owned by the external catalog and record store; recalc only compares,
//! orders and hashes them. Identifiers minted by recalc itself (`RunId`, `OutboxTaskId`)
//! are ULIDs, so they sort by creation time.
//!
//! # Example
//!
//! ```rust
//! use recalc_core::id::{FieldId, RunId, TableId};
//!
//! let table = TableId::new("tblBugs");
//! let field = FieldId::generate();
//! assert!(field.as_str().starts_with("fld"));
//!
//! let run = RunId::generate();
//! // IDs are different types - this won't compile:
//! // let wrong: FieldId = table;
//! # let _ = (table, run);
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Prefix used by [`Self::generate`].
            pub const PREFIX: &'static str = $prefix;

            /// Wraps an existing identifier.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Generates a new prefixed identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(format!("{}{}", Self::PREFIX, Ulid::new()))
            }

            /// Returns the identifier as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                if s.trim().is_empty() {
                    return Err(Error::InvalidId {
                        message: format!("{} must not be empty", stringify!($name)),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

string_id!(
    /// Identifier of a workspace (the "base" every table belongs to).
    WorkspaceId,
    "bse"
);
string_id!(
    /// Identifier of a table.
    TableId,
    "tbl"
);
string_id!(
    /// Identifier of a field (column) within a table.
    FieldId,
    "fld"
);
string_id!(
    /// Identifier of a record (row) within a table.
    RecordId,
    "rec"
);

/// A unique identifier for one propagation run (one stage of a cascade).
///
/// Continuations carry the run ids of the stages that produced them so a multi-stage
/// cascade can be correlated end to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Ulid);

impl RunId {
    /// Generates a new unique run ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid run ID '{s}': {e}"),
            })
    }
}

/// A unique identifier for a durable outbox task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxTaskId(Ulid);

impl OutboxTaskId {
    /// Generates a new unique task ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Returns the creation timestamp encoded in the ID.
    #[must_use]
    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        let ms = i64::try_from(self.0.timestamp_ms()).unwrap_or(i64::MAX);
        chrono::DateTime::from_timestamp_millis(ms).unwrap_or_else(chrono::Utc::now)
    }
}

impl fmt::Display for OutboxTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OutboxTaskId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid outbox task ID '{s}': {e}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_string_ids_carry_prefix() {
        assert!(FieldId::generate().as_str().starts_with("fld"));
        assert!(TableId::generate().as_str().starts_with("tbl"));
        assert!(RecordId::generate().as_str().starts_with("rec"));
        assert!(WorkspaceId::generate().as_str().starts_with("bse"));
    }

    #[test]
    fn empty_string_id_is_rejected() {
        let result: Result<FieldId> = "  ".parse();
        assert!(result.is_err());
    }

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::generate();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn outbox_task_id_roundtrip() {
        let id = OutboxTaskId::generate();
        let parsed: OutboxTaskId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn invalid_run_id_returns_error() {
        let result: Result<RunId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn string_ids_order_lexicographically() {
        let mut ids = vec![RecordId::new("rec3"), RecordId::new("rec1"), RecordId::new("rec2")];
        ids.sort();
        assert_eq!(ids, vec![RecordId::new("rec1"), RecordId::new("rec2"), RecordId::new("rec3")]);
    }
}
