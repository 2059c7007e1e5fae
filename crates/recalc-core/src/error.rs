//! Error types and result aliases for recalc.
//!
//! This module defines the shared error type used by the catalog, the field model,
//! and filter parsing. Engine-level failures live in `recalc_engine::error` and wrap
//! this type.

use std::fmt;

/// The result type used throughout recalc-core.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in shared recalc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A payload (field options, filter, request) failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The requested resource was not found.
    #[error("not found: {resource_type} with id {id}")]
    ResourceNotFound {
        /// The type of resource that was not found.
        resource_type: &'static str,
        /// The identifier that was looked up.
        id: String,
    },

    /// A serialization or deserialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
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

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Creates a new storage error with the given message.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source cause.
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

    /// Creates a new resource not found error.
    #[must_use]
    pub fn resource_not_found(resource_type: &'static str, id: impl fmt::Display) -> Self {
        Self::ResourceNotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    /// Returns true if this error reports a missing resource.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::ResourceNotFound { .. })
    }
}
