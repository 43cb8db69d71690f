//! Default concepts and mapping configuration.
//!
//! OMOP rows carry "type" concepts recording the provenance of a record
//! (EHR, lab, prescription). FHIR has no equivalent element, so every write
//! substitutes a fixed type concept. These substitutions are lossy: reading
//! a row back never reproduces a type concept in the resource, and a row
//! loaded by ETL with another type keeps it untouched on update.

use serde::{Deserialize, Serialize};

/// `EHR` record type (OMOP Type Concept).
pub const EHR_TYPE_CONCEPT: i64 = 32817;
/// `Lab` record type, used for measurements.
pub const LAB_TYPE_CONCEPT: i64 = 32856;
/// `EHR prescription` record type, used for drug exposures.
pub const EHR_PRESCRIPTION_TYPE_CONCEPT: i64 = 32838;

pub const GENDER_MALE: i64 = 8507;
pub const GENDER_FEMALE: i64 = 8532;
/// OMOP `UNKNOWN` gender, substituted for FHIR `other` and `unknown`.
pub const GENDER_UNKNOWN: i64 = 8551;

/// LOINC 8480-6 and 8462-4, the two halves of a blood pressure reading.
pub const SYSTOLIC_BP_CONCEPT: i64 = 3004249;
pub const DIASTOLIC_BP_CONCEPT: i64 = 3012888;

/// Type concepts written when the resource cannot supply one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingDefaults {
    pub condition_type_concept_id: i64,
    pub measurement_type_concept_id: i64,
    pub observation_type_concept_id: i64,
    pub drug_type_concept_id: i64,
    pub visit_type_concept_id: i64,
    pub unknown_gender_concept_id: i64,
    pub systolic_bp_concept_id: i64,
    pub diastolic_bp_concept_id: i64,
}

impl Default for MappingDefaults {
    fn default() -> Self {
        Self {
            condition_type_concept_id: EHR_TYPE_CONCEPT,
            measurement_type_concept_id: LAB_TYPE_CONCEPT,
            observation_type_concept_id: EHR_TYPE_CONCEPT,
            drug_type_concept_id: EHR_PRESCRIPTION_TYPE_CONCEPT,
            visit_type_concept_id: EHR_TYPE_CONCEPT,
            unknown_gender_concept_id: GENDER_UNKNOWN,
            systolic_bp_concept_id: SYSTOLIC_BP_CONCEPT,
            diastolic_bp_concept_id: DIASTOLIC_BP_CONCEPT,
        }
    }
}

/// How `MedicationRequest.medication` is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MedicationRendering {
    /// `medicationReference` to `Medication/{id}`.
    #[default]
    Reference,
    /// A `contained` Medication referenced as `#med`.
    Contained,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub medication_rendering: MedicationRendering,
    /// Vocabulary ids tried first when a CodeableConcept has several
    /// resolvable codings, most preferred first.
    pub preferred_vocabularies: Vec<String>,
    pub defaults: MappingDefaults,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            medication_rendering: MedicationRendering::default(),
            preferred_vocabularies: default_preferred_vocabularies(),
            defaults: MappingDefaults::default(),
        }
    }
}

fn default_preferred_vocabularies() -> Vec<String> {
    vec!["SNOMED".to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_named_constants() {
        let config = MappingConfig::default();
        assert_eq!(config.defaults.condition_type_concept_id, EHR_TYPE_CONCEPT);
        assert_eq!(config.defaults.drug_type_concept_id, EHR_PRESCRIPTION_TYPE_CONCEPT);
        assert_eq!(config.preferred_vocabularies, vec!["SNOMED"]);
        assert_eq!(config.medication_rendering, MedicationRendering::Reference);
    }

    #[test]
    fn test_partial_deserialization_keeps_defaults() {
        let config: MappingConfig = serde_json::from_value(serde_json::json!({
            "medication_rendering": "contained",
            "defaults": {"condition_type_concept_id": 32020}
        }))
        .unwrap();
        assert_eq!(config.medication_rendering, MedicationRendering::Contained);
        assert_eq!(config.defaults.condition_type_concept_id, 32020);
        assert_eq!(config.defaults.measurement_type_concept_id, LAB_TYPE_CONCEPT);
        assert_eq!(config.preferred_vocabularies, vec!["SNOMED"]);
    }
}
