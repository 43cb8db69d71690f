//! Error taxonomy for resource mapping.

use std::fmt;

use omopfhir_core::{CoreError, ResourceType};
use omopfhir_storage::{PredicateError, StorageError};

/// Errors raised while translating between FHIR resources and OMOP rows.
#[derive(Debug, thiserror::Error)]
pub enum MappingError {
    /// The id does not translate, or no row exists at the translated id.
    #[error("Resource not found: {resource_type}/{id}")]
    NotFound {
        resource_type: ResourceType,
        id: String,
    },

    /// A required field is missing or holds an unusable value.
    #[error("Validation failed for '{field}': {message}")]
    Validation { field: String, message: String },

    /// A coding on a required field has no OMOP concept.
    #[error("No concept for '{field}': {system}|{code}")]
    UnresolvableCode {
        field: String,
        system: String,
        code: String,
    },

    /// A reference that is neither in the current batch nor in storage.
    #[error("Unresolvable reference: {reference}")]
    UnresolvableReference { reference: String },

    /// A search parameter or sort field without an OMOP equivalent.
    #[error("Unsupported search parameter: {name}")]
    UnsupportedParameter { name: String },

    /// Propagated unchanged from the storage backend.
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl MappingError {
    #[must_use]
    pub fn not_found(resource_type: ResourceType, id: impl fmt::Display) -> Self {
        Self::NotFound {
            resource_type,
            id: id.to_string(),
        }
    }

    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn missing(field: impl Into<String>) -> Self {
        Self::validation(field, "required element is missing")
    }

    #[must_use]
    pub fn unresolvable_code(
        field: impl Into<String>,
        system: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self::UnresolvableCode {
            field: field.into(),
            system: system.into(),
            code: code.into(),
        }
    }

    #[must_use]
    pub fn unresolvable_reference(reference: impl Into<String>) -> Self {
        Self::UnresolvableReference {
            reference: reference.into(),
        }
    }

    #[must_use]
    pub fn unsupported_parameter(name: impl Into<String>) -> Self {
        Self::UnsupportedParameter { name: name.into() }
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Storage(e) => e.is_not_found(),
            _ => false,
        }
    }

    /// HTTP status a transport boundary reports for this error.
    ///
    /// | kind | status |
    /// |---|---|
    /// | `NotFound` | 404 |
    /// | `Validation`, `UnsupportedParameter`, client-side `Core` | 400 |
    /// | `UnresolvableCode` | 422 |
    /// | `UnresolvableReference` | 424 |
    /// | storage conflict | 409 |
    /// | storage unavailable | 503 |
    /// | anything else | 500 |
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::Validation { .. } | Self::UnsupportedParameter { .. } => 400,
            Self::UnresolvableCode { .. } => 422,
            Self::UnresolvableReference { .. } => 424,
            Self::Storage(StorageError::NotFound { .. }) => 404,
            Self::Storage(StorageError::AlreadyExists { .. }) => 409,
            Self::Storage(StorageError::InvalidEntity { .. } | StorageError::InvalidPredicate(_)) => 400,
            Self::Storage(StorageError::ConnectionError { .. }) => 503,
            Self::Storage(StorageError::Internal { .. }) => 500,
            Self::Core(e) if e.is_client_error() => 400,
            Self::Core(_) => 500,
        }
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::Validation { .. } | Self::UnsupportedParameter { .. } | Self::Core(_) => {
                ErrorCategory::Validation
            }
            Self::UnresolvableCode { .. } => ErrorCategory::Vocabulary,
            Self::UnresolvableReference { .. } => ErrorCategory::Reference,
            Self::Storage(_) => ErrorCategory::Storage,
        }
    }
}

impl From<PredicateError> for MappingError {
    fn from(err: PredicateError) -> Self {
        Self::Storage(StorageError::InvalidPredicate(err))
    }
}

/// Categories of mapping errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    NotFound,
    Validation,
    Vocabulary,
    Reference,
    Storage,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::Vocabulary => "vocabulary",
            Self::Reference => "reference",
            Self::Storage => "storage",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omopfhir_core::OmopTable;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            MappingError::not_found(ResourceType::Patient, 9).status_code(),
            404
        );
        assert_eq!(MappingError::missing("subject").status_code(), 400);
        assert_eq!(
            MappingError::unresolvable_code("code", "http://snomed.info/sct", "1").status_code(),
            422
        );
        assert_eq!(
            MappingError::unresolvable_reference("urn:uuid:x").status_code(),
            424
        );
        assert_eq!(
            MappingError::from(StorageError::connection_error("down")).status_code(),
            503
        );
    }

    #[test]
    fn test_storage_not_found_is_not_found() {
        let err = MappingError::from(StorageError::not_found(OmopTable::Person, 3));
        assert!(err.is_not_found());
        assert_eq!(err.category(), ErrorCategory::Storage);
        assert_eq!(err.to_string(), "Row not found: person/3");
    }

    #[test]
    fn test_validation_names_field() {
        let err = MappingError::missing("subject");
        assert_eq!(
            err.to_string(),
            "Validation failed for 'subject': required element is missing"
        );
    }
}
