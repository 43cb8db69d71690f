//! Typed FHIR model.

pub mod bundle;
pub mod datatypes;
pub mod resources;

pub use bundle::{
    Bundle, BundleEntry, BundleEntryRequest, BundleEntryResponse, BundleEntrySearch, BundleType,
    HttpVerb, SearchEntryMode,
};
pub use datatypes::{
    Annotation, CodeableConcept, Coding, Dosage, HumanName, Identifier, Period, Quantity,
    Reference,
};
pub use resources::{
    Condition, DispenseRequest, Encounter, EncounterParticipant, FhirResource, Medication,
    MedicationRequest, Observation, ObservationComponent, ObservationReferenceRange, Patient,
    Practitioner,
};
