//! The resource mapper contract.
//!
//! One [`ResourceMapper`] per FHIR resource type translates in three
//! directions: rows to resources, resources to rows and search parameters to
//! predicates. Mappers hold no per-request state; their collaborators are
//! injected through [`MapperContext`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};

use omopfhir_core::model::FhirResource;
use omopfhir_core::time::split_date_time;
use omopfhir_core::{ExternalId, IdMapper, InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchModifier, SearchParam};
use omopfhir_storage::{DynStorage, OmopEntity, Predicate};

use crate::defaults::MappingConfig;
use crate::error::MappingError;
use crate::vocabulary::VocabularyTranslator;

/// A resource produced from one row, with the resources it points to.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedResource {
    pub id: ExternalId,
    pub resource: FhirResource,
    /// `(search parameter, target)` for every outgoing reference.
    pub references: Vec<(String, ExternalId)>,
}

impl MappedResource {
    pub fn new(id: ExternalId, resource: FhirResource) -> Self {
        Self {
            id,
            resource,
            references: Vec::new(),
        }
    }

    pub fn add_reference(&mut self, param: &str, target: Option<ExternalId>) {
        if let Some(target) = target {
            self.references.push((param.to_string(), target));
        }
    }

    /// Targets of the references exposed under `param`.
    pub fn references_for<'a>(&'a self, param: &'a str) -> impl Iterator<Item = &'a ExternalId> {
        self.references
            .iter()
            .filter(move |(name, _)| name == param)
            .map(|(_, target)| target)
    }
}

/// Rows written for one resource.
///
/// `primary` owns the resource id. Split concepts add `companions`, which
/// are written after the primary row and deleted with it.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityWrite {
    pub primary: OmopEntity,
    pub companions: Vec<OmopEntity>,
}

impl EntityWrite {
    pub fn single(primary: OmopEntity) -> Self {
        Self {
            primary,
            companions: Vec::new(),
        }
    }
}

/// Outcome of translating one search parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterTranslation {
    /// Predicates to append. An empty list adds no constraint.
    Predicates(Vec<Predicate>),
    /// The parameter has no OMOP equivalent on this table.
    Unsupported,
}

/// Collaborators shared by every mapper.
#[derive(Clone)]
pub struct MapperContext {
    pub ids: Arc<IdMapper>,
    pub vocabulary: Arc<VocabularyTranslator>,
    pub storage: DynStorage,
    pub config: Arc<MappingConfig>,
    /// Base URL that absolute references must start with to count as local.
    pub base_url: Option<String>,
}

impl fmt::Debug for MapperContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapperContext")
            .field("vocabulary", &self.vocabulary)
            .field("storage", &self.storage.backend_name())
            .field("config", &self.config)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl MapperContext {
    pub fn new(
        ids: Arc<IdMapper>,
        vocabulary: Arc<VocabularyTranslator>,
        storage: DynStorage,
        config: Arc<MappingConfig>,
    ) -> Self {
        Self {
            ids,
            vocabulary,
            storage,
            config,
            base_url: None,
        }
    }

    #[must_use]
    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }
}

#[async_trait]
pub trait ResourceMapper: Send + Sync {
    fn resource_type(&self) -> ResourceType;

    /// Tables backing this resource type.
    fn binding(&self) -> TableBinding;

    /// Search parameters translated by [`ResourceMapper::to_predicates`].
    fn supported_parameters(&self) -> &'static [ParamDefinition];

    fn parameter(&self, name: &str) -> Option<&'static ParamDefinition> {
        self.supported_parameters().iter().find(|p| p.name == name)
    }

    /// Builds the resource stored at `id`.
    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError>;

    /// Builds the rows for `resource`. `None` creates; `Some` loads the row
    /// at `id` and overwrites the fields the resource carries.
    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError>;

    /// Translates one parameter occurrence for `table`.
    ///
    /// Every value of `param` yields one predicate; values after the first
    /// are OR alternatives. The first predicate attaches to the preceding
    /// list with OR when `is_or_alternative` is set and AND otherwise.
    async fn to_predicates(
        &self,
        table: OmopTable,
        param: &SearchParam,
        is_or_alternative: bool,
    ) -> Result<ParameterTranslation, MappingError>;

    /// Rows written and deleted together with `entity`.
    async fn companions(&self, _entity: &OmopEntity) -> Result<Vec<OmopEntity>, MappingError> {
        Ok(Vec::new())
    }

    /// Filters always applied when searching `table`.
    fn default_predicates(&self, _table: OmopTable) -> Vec<Predicate> {
        Vec::new()
    }

    /// Column backing a FHIR sort field on `table`.
    fn sort_column(&self, table: OmopTable, field: &str) -> Option<&'static str>;
}

/// Shared handle to a mapper.
pub type DynMapper = Arc<dyn ResourceMapper>;

/// Applies the OR/AND grouping contract to per-value predicates.
///
/// The values of one parameter are OR alternatives, except under `:not`,
/// where every value is excluded and the predicates join with AND.
pub fn alternatives(
    param: &SearchParam,
    predicates: Vec<Predicate>,
    is_or_alternative: bool,
) -> Vec<Predicate> {
    let negated = param.modifier == Some(SearchModifier::Not);
    predicates
        .into_iter()
        .enumerate()
        .map(|(i, p)| match i {
            0 => p.alternative(is_or_alternative),
            _ => p.alternative(!negated),
        })
        .collect()
}

/// Error for a row that does not belong to the mapper's tables.
pub(crate) fn unexpected_entity(resource_type: ResourceType, entity: &OmopEntity) -> MappingError {
    MappingError::validation(
        "id",
        format!("{} row cannot back a {resource_type}", entity.table()),
    )
}

/// Error for a resource handed to the wrong mapper.
pub(crate) fn unexpected_resource(expected: ResourceType, resource: &FhirResource) -> MappingError {
    MappingError::validation(
        "resourceType",
        format!("expected {expected}, got {}", resource.resource_type()),
    )
}

/// Parses an optional FHIR date/dateTime element into OMOP date and
/// datetime columns.
pub(crate) fn date_field(
    field: &str,
    raw: Option<&str>,
) -> Result<Option<(Date, Option<OffsetDateTime>)>, MappingError> {
    raw.map(|raw| split_date_time(raw).map_err(|e| MappingError::validation(field, e.to_string())))
        .transpose()
}

/// Loads the row an update applies to.
pub(crate) async fn load_existing(
    ctx: &MapperContext,
    resource_type: ResourceType,
    id: InternalId,
) -> Result<OmopEntity, MappingError> {
    ctx.storage
        .find_by_id(id)
        .await?
        .ok_or_else(|| MappingError::not_found(resource_type, id))
}
