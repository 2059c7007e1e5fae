//! Error types for the propagation engine.

use recalc_core::{FieldId, OutboxTaskId, TableId};

/// The result type used throughout recalc-engine.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification used by callers to decide how to react to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Malformed input; never retried.
    Validation,
    /// The request conflicts with schema state (dependency cycle under the error policy).
    Conflict,
    /// A referenced table, field or task is missing.
    NotFound,
    /// Store, lock or transient transaction failure.
    Infrastructure,
}

/// Transient store failures worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransientKind {
    /// The store aborted the transaction to break a deadlock.
    Deadlock,
    /// Serializable isolation rejected the transaction.
    SerializationFailure,
    /// Two writers raced on the pending-task uniqueness constraint.
    UniqueViolation,
}

/// Errors that can occur in propagation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A request or payload failed validation.
    #[error("validation failed: {message}")]
    Validation {
        /// Description of the failure.
        message: String,
    },

    /// A cycle was detected in the dependency graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// The cycle path (field ids).
        cycle: Vec<String>,
    },

    /// A field was not found.
    #[error("field not found: {field_id}")]
    FieldNotFound {
        /// The field ID that was not found.
        field_id: FieldId,
    },

    /// A table was not found.
    #[error("table not found: {table_id}")]
    TableNotFound {
        /// The table ID that was not found.
        table_id: TableId,
    },

    /// An outbox task was not found.
    #[error("outbox task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: OutboxTaskId,
    },

    /// A DAG node was not found (internal graph operation error).
    #[error("DAG node not found: {node}")]
    DagNodeNotFound {
        /// The node identifier (index or value).
        node: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transaction failed in a way that may succeed on retry.
    #[error("transient {kind:?} failure: {message}")]
    Transient {
        /// What kind of transient failure occurred.
        kind: TransientKind,
        /// Description of the failure.
        message: String,
    },

    /// An advisory lock could not be acquired.
    #[error("lock unavailable: {key}")]
    LockUnavailable {
        /// The lock key.
        key: String,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// An error from recalc-core.
    #[error("core error: {0}")]
    Core(#[from] recalc_core::Error),
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new transient error.
    #[must_use]
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Returns the error's category.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } | Self::Serialization { .. } => ErrorCategory::Validation,
            Self::CycleDetected { .. } => ErrorCategory::Conflict,
            Self::FieldNotFound { .. }
            | Self::TableNotFound { .. }
            | Self::TaskNotFound { .. }
            | Self::DagNodeNotFound { .. } => ErrorCategory::NotFound,
            Self::Storage { .. } | Self::Transient { .. } | Self::LockUnavailable { .. } => {
                ErrorCategory::Infrastructure
            }
            Self::Core(inner) => match inner {
                recalc_core::Error::Validation(_)
                | recalc_core::Error::InvalidId { .. }
                | recalc_core::Error::Serialization { .. } => ErrorCategory::Validation,
                recalc_core::Error::ResourceNotFound { .. } => ErrorCategory::NotFound,
                recalc_core::Error::Storage { .. } | recalc_core::Error::Internal { .. } => {
                    ErrorCategory::Infrastructure
                }
            },
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::Serialization {
            message: value.to_string(),
        }
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for Error {
    fn from(value: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &value {
            // SQLSTATE codes: 40P01 deadlock, 40001 serialization, 23505 unique violation.
            let kind = match db.code().as_deref() {
                Some("40P01") => Some(TransientKind::Deadlock),
                Some("40001") => Some(TransientKind::SerializationFailure),
                Some("23505") => Some(TransientKind::UniqueViolation),
                _ => None,
            };
            if let Some(kind) = kind {
                return Self::transient(kind, db.message().to_string());
            }
        }
        Self::storage_with_source("database error", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn cycle_error_display_and_category() {
        let err = Error::CycleDetected {
            cycle: vec!["fldB".into(), "fldC".into(), "fldB".into()],
        };
        assert!(err.to_string().contains("cycle detected"));
        assert_eq!(err.category(), ErrorCategory::Conflict);
        assert!(!err.is_transient());
    }

    #[test]
    fn transient_errors_are_infrastructure() {
        let err = Error::transient(TransientKind::Deadlock, "deadlock detected");
        assert!(err.is_transient());
        assert_eq!(err.category(), ErrorCategory::Infrastructure);
    }

    #[test]
    fn core_errors_keep_their_category() {
        let err: Error = recalc_core::Error::resource_not_found("field", "fldX").into();
        assert_eq!(err.category(), ErrorCategory::NotFound);
        let err: Error = recalc_core::Error::validation("bad filter").into();
        assert_eq!(err.category(), ErrorCategory::Validation);
    }

    #[test]
    fn storage_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "connection refused");
        let err = Error::storage_with_source("failed to claim tasks", source);
        assert!(err.to_string().contains("storage error"));
        assert!(StdError::source(&err).is_some());
        assert!(!err.is_transient());
    }
}
