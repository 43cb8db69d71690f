//! Translation between FHIR resources and OMOP CDM rows.
//!
//! - [`vocabulary`] maps FHIR codings to OMOP concepts and back, with a
//!   concurrent cache in front of the concept tables.
//! - [`mapper`] defines the [`ResourceMapper`] contract; [`mappers`] holds
//!   one implementation per resource type and [`registry`] looks them up.
//! - [`predicates`] and [`references`] are the building blocks the mappers
//!   share for search values and reference elements.

pub mod defaults;
pub mod error;
pub mod mapper;
pub mod mappers;
pub mod predicates;
pub mod references;
pub mod registry;
pub mod vocabulary;

pub use defaults::{MappingConfig, MappingDefaults, MedicationRendering};
pub use error::{ErrorCategory, MappingError};
pub use mapper::{
    DynMapper, EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives,
};
pub use registry::MapperRegistry;
pub use vocabulary::{
    CodeResolution, ConceptLookup, SourceValue, VOCABULARY_TABLE, VocabularyEntry,
    VocabularyTranslator,
};
