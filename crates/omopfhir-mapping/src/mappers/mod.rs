//! One mapper per supported resource type.

pub mod condition;
pub mod encounter;
pub mod medication;
pub mod medication_request;
pub mod observation;
pub mod patient;
pub mod practitioner;

pub use condition::ConditionMapper;
pub use encounter::EncounterMapper;
pub use medication::MedicationMapper;
pub use medication_request::MedicationRequestMapper;
pub use observation::ObservationMapper;
pub use patient::PatientMapper;
pub use practitioner::PractitionerMapper;
