//! OMOP CDM table identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Physical OMOP tables that back FHIR resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OmopTable {
    Person,
    Provider,
    VisitOccurrence,
    ConditionOccurrence,
    Measurement,
    Observation,
    DrugExposure,
    Concept,
}

impl OmopTable {
    /// SQL table name.
    pub fn name(&self) -> &'static str {
        match self {
            OmopTable::Person => "person",
            OmopTable::Provider => "provider",
            OmopTable::VisitOccurrence => "visit_occurrence",
            OmopTable::ConditionOccurrence => "condition_occurrence",
            OmopTable::Measurement => "measurement",
            OmopTable::Observation => "observation",
            OmopTable::DrugExposure => "drug_exposure",
            OmopTable::Concept => "concept",
        }
    }

    /// Primary key column of the table.
    pub fn key_column(&self) -> &'static str {
        match self {
            OmopTable::Person => "person_id",
            OmopTable::Provider => "provider_id",
            OmopTable::VisitOccurrence => "visit_occurrence_id",
            OmopTable::ConditionOccurrence => "condition_occurrence_id",
            OmopTable::Measurement => "measurement_id",
            OmopTable::Observation => "observation_id",
            OmopTable::DrugExposure => "drug_exposure_id",
            OmopTable::Concept => "concept_id",
        }
    }
}

impl fmt::Display for OmopTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
