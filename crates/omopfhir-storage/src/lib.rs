//! Storage layer for the OMOP FHIR bridge.
//!
//! This crate defines:
//!
//! - the OMOP rows the bridge reads and writes ([`OmopEntity`], [`Concept`])
//! - the backend-agnostic [`Predicate`] filter model and its grouping rules
//! - the [`OmopStorage`] and [`ConceptStore`] ports implemented by backends
//!
//! # Example
//!
//! ```
//! use omopfhir_storage::{FilterExpr, Operator, Predicate, ValueType};
//!
//! let predicates = vec![
//!     Predicate::compare(ValueType::Long, "condition_concept_id", Operator::Eq, "201826")?,
//!     Predicate::compare(ValueType::Long, "condition_concept_id", Operator::Eq, "4329847")?
//!         .alternative(true),
//! ];
//! assert!(matches!(FilterExpr::build(&predicates), FilterExpr::Or(_)));
//! # Ok::<(), omopfhir_storage::PredicateError>(())
//! ```

mod entity;
mod error;
mod predicate;
mod traits;
mod types;

use std::sync::Arc;

pub use entity::{
    Concept, ConditionOccurrence, DrugExposure, Measurement, NO_MATCHING_CONCEPT,
    ObservationRecord, OmopEntity, Person, Provider, VisitOccurrence,
};
pub use error::{ErrorCategory, StorageError};
pub use predicate::{
    FilterExpr, JoinOp, LIKE_ESCAPE, Operator, Predicate, PredicateError, ValueType, escape_like,
    group, is_valid_column_path,
};
pub use traits::{ConceptStore, OmopStorage};
pub use types::{Page, SortDirection, SortSpec};

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared handle to a clinical storage backend.
pub type DynStorage = Arc<dyn OmopStorage>;

/// Shared handle to a concept store.
pub type DynConceptStore = Arc<dyn ConceptStore>;
