//! Core types for the FHIR over OMOP CDM bridge: the FHIR model, resource
//! and table identifiers, and the identifier mapper that links them.

pub mod error;
pub mod fhir;
pub mod fhir_reference;
pub mod id;
pub mod model;
pub mod omop;
pub mod time;

pub use error::{CoreError, Result};
pub use fhir::ResourceType;
pub use fhir_reference::{FhirReference, UnresolvableReference, parse_reference};
pub use id::{ExternalId, IdMapper, InternalId, TableBinding, TableSlot};
pub use omop::OmopTable;
pub use time::{FhirDateTime, PartialDateTime};
