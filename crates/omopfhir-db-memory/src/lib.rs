//! In-memory OMOP storage backend.
//!
//! Implements [`OmopStorage`](omopfhir_storage::OmopStorage) and
//! [`ConceptStore`](omopfhir_storage::ConceptStore) on papaya lock-free maps,
//! evaluating predicates in process. Used by tests and the developer CLI.
//!
//! # Example
//!
//! ```ignore
//! use omopfhir_db_memory::InMemoryOmopStore;
//! use omopfhir_storage::{OmopEntity, OmopStorage, Person};
//!
//! let store = InMemoryOmopStore::with_fixture_vocabulary();
//! let person = store.create(OmopEntity::Person(Person::new(8507, 1980))).await?;
//! assert_eq!(person.key(), 1);
//! ```

pub mod fixtures;
pub mod query;
pub mod storage;

pub use storage::InMemoryOmopStore;
