//! Storage error types for the OMOP storage port.

use std::fmt;

use crate::predicate::PredicateError;

/// Errors reported by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// No row exists at the given key.
    #[error("Row not found: {table}/{key}")]
    NotFound {
        /// Table that was searched.
        table: String,
        /// Native primary key.
        key: i64,
    },

    /// A row with the given key already exists.
    #[error("Row already exists: {table}/{key}")]
    AlreadyExists {
        /// Target table.
        table: String,
        /// Native primary key.
        key: i64,
    },

    /// The entity cannot be stored as given.
    #[error("Invalid entity: {message}")]
    InvalidEntity {
        /// Description of the problem.
        message: String,
    },

    /// A predicate references something the backend cannot execute.
    #[error("Invalid predicate: {0}")]
    InvalidPredicate(#[from] PredicateError),

    /// Failed to reach the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error.
    #[must_use]
    pub fn not_found(table: impl fmt::Display, key: i64) -> Self {
        Self::NotFound {
            table: table.to_string(),
            key,
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(table: impl fmt::Display, key: i64) -> Self {
        Self::AlreadyExists {
            table: table.to_string(),
            key,
        }
    }

    /// Creates a new `InvalidEntity` error.
    #[must_use]
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this is a not found error.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::InvalidEntity { .. } | Self::InvalidPredicate(_) => ErrorCategory::Validation,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Conflict,
    Validation,
    Infrastructure,
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "not_found"),
            Self::Conflict => write!(f, "conflict"),
            Self::Validation => write!(f, "validation"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}
