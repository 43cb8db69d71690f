//! A small slice of the OMOP standard vocabularies for tests and the CLI.
//!
//! Concept ids match the public OHDSI vocabulary release.

use omopfhir_storage::Concept;

use crate::storage::InMemoryOmopStore;

pub const SNOMED_TYPE_2_DIABETES: i64 = 201826;
pub const SNOMED_ESSENTIAL_HYPERTENSION: i64 = 320128;
pub const SNOMED_MYOCARDIAL_INFARCTION: i64 = 4329847;
pub const ICD10CM_TYPE_2_DIABETES: i64 = 45533017;
pub const LOINC_SYSTOLIC_BP: i64 = 3004249;
pub const LOINC_DIASTOLIC_BP: i64 = 3012888;
pub const LOINC_HEART_RATE: i64 = 3027018;
pub const LOINC_HBA1C: i64 = 3004410;
pub const LOINC_SMOKING_STATUS: i64 = 40766362;
pub const UCUM_MM_HG: i64 = 8876;
pub const UCUM_PER_MINUTE: i64 = 8541;
pub const UCUM_PERCENT: i64 = 8554;
pub const RXNORM_ACETAMINOPHEN_325: i64 = 1127433;
pub const RXNORM_IBUPROFEN_200: i64 = 19019073;
pub const SNOMED_ORAL_ROUTE: i64 = 4132161;
pub const VISIT_INPATIENT: i64 = 9201;
pub const VISIT_OUTPATIENT: i64 = 9202;
pub const VISIT_EMERGENCY: i64 = 9203;

/// Concepts loaded by [`InMemoryOmopStore::with_fixture_vocabulary`].
pub fn standard_concepts() -> Vec<Concept> {
    vec![
        Concept::new(SNOMED_TYPE_2_DIABETES, "SNOMED", "44054006", "Type 2 diabetes mellitus", "Condition"),
        Concept::new(SNOMED_ESSENTIAL_HYPERTENSION, "SNOMED", "59621000", "Essential hypertension", "Condition"),
        Concept::new(SNOMED_MYOCARDIAL_INFARCTION, "SNOMED", "22298006", "Myocardial infarction", "Condition"),
        Concept {
            standard_concept: None,
            ..Concept::new(
                ICD10CM_TYPE_2_DIABETES,
                "ICD10CM",
                "E11.9",
                "Type 2 diabetes mellitus without complications",
                "Condition",
            )
        },
        Concept::new(LOINC_SYSTOLIC_BP, "LOINC", "8480-6", "Systolic blood pressure", "Measurement"),
        Concept::new(LOINC_DIASTOLIC_BP, "LOINC", "8462-4", "Diastolic blood pressure", "Measurement"),
        Concept::new(LOINC_HEART_RATE, "LOINC", "8867-4", "Heart rate", "Measurement"),
        Concept::new(LOINC_HBA1C, "LOINC", "4548-4", "Hemoglobin A1c/Hemoglobin.total in Blood", "Measurement"),
        Concept::new(LOINC_SMOKING_STATUS, "LOINC", "72166-2", "Tobacco smoking status", "Observation"),
        Concept::new(UCUM_MM_HG, "UCUM", "mm[Hg]", "millimeter mercury column", "Unit"),
        Concept::new(UCUM_PER_MINUTE, "UCUM", "/min", "per minute", "Unit"),
        Concept::new(UCUM_PERCENT, "UCUM", "%", "percent", "Unit"),
        Concept::new(RXNORM_ACETAMINOPHEN_325, "RxNorm", "313782", "acetaminophen 325 MG Oral Tablet", "Drug"),
        Concept::new(RXNORM_IBUPROFEN_200, "RxNorm", "310965", "ibuprofen 200 MG Oral Tablet", "Drug"),
        Concept::new(SNOMED_ORAL_ROUTE, "SNOMED", "26643006", "Oral", "Route"),
        Concept::new(VISIT_INPATIENT, "Visit", "IP", "Inpatient Visit", "Visit"),
        Concept::new(VISIT_OUTPATIENT, "Visit", "OP", "Outpatient Visit", "Visit"),
        Concept::new(VISIT_EMERGENCY, "Visit", "ER", "Emergency Room Visit", "Visit"),
        Concept::new(8507, "Gender", "M", "MALE", "Gender"),
        Concept::new(8532, "Gender", "F", "FEMALE", "Gender"),
        Concept::new(32817, "Type Concept", "OMOP4976890", "EHR", "Type Concept"),
        Concept::new(32856, "Type Concept", "OMOP4976929", "Lab", "Type Concept"),
        Concept::new(32838, "Type Concept", "OMOP4976911", "EHR prescription", "Type Concept"),
    ]
}

impl InMemoryOmopStore {
    /// Store preloaded with [`standard_concepts`].
    pub fn with_fixture_vocabulary() -> Self {
        let store = Self::new();
        store.insert_concepts(standard_concepts());
        store
    }
}
