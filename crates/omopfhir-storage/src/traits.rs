//! Storage port traits.
//!
//! The translation engine talks to the OMOP database only through these
//! traits. Backends decide how predicates execute; they never see FHIR.

use async_trait::async_trait;

use omopfhir_core::{InternalId, OmopTable};

use crate::StorageResult;
use crate::entity::{Concept, OmopEntity};
use crate::predicate::Predicate;
use crate::types::{Page, SortSpec};

/// Clinical row access.
#[async_trait]
pub trait OmopStorage: Send + Sync {
    // ==================== CRUD Operations ====================

    /// Reads one row.
    ///
    /// # Errors
    ///
    /// Returns an error only for backend failures; a missing row is `Ok(None)`.
    async fn find_by_id(&self, id: InternalId) -> StorageResult<Option<OmopEntity>>;

    /// Inserts a row and returns it with its newly assigned key.
    ///
    /// Any key already set on `entity` is ignored.
    async fn create(&self, entity: OmopEntity) -> StorageResult<OmopEntity>;

    /// Replaces an existing row.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if no row exists at the entity's key.
    async fn update(&self, entity: OmopEntity) -> StorageResult<OmopEntity>;

    /// Removes a row, returning it when it existed.
    async fn delete(&self, id: InternalId) -> StorageResult<Option<OmopEntity>>;

    /// Writes a row back under its own key, replacing anything present.
    ///
    /// Used to undo earlier writes; never assigns a key.
    async fn restore(&self, entity: OmopEntity) -> StorageResult<()>;

    // ==================== Query Operations ====================

    /// Returns the rows of `table` matching `predicates`, ordered by `sort`
    /// and then by primary key, windowed by `page`.
    async fn search(
        &self,
        table: OmopTable,
        predicates: &[Predicate],
        page: Page,
        sort: &[SortSpec],
    ) -> StorageResult<Vec<OmopEntity>>;

    /// Number of rows `search` would return with an unbounded page.
    async fn count(&self, table: OmopTable, predicates: &[Predicate]) -> StorageResult<u64>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Read-only access to the vocabulary tables.
#[async_trait]
pub trait ConceptStore: Send + Sync {
    /// Looks up a concept by vocabulary and code.
    async fn find_concept(&self, vocabulary_id: &str, code: &str)
    -> StorageResult<Option<Concept>>;

    /// Looks up a concept by id.
    async fn concept_by_id(&self, concept_id: i64) -> StorageResult<Option<Concept>>;
}
