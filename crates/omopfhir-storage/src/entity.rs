//! OMOP CDM rows handled by the bridge.
//!
//! Concept id `0` is the OMOP convention for "no matching concept"; such rows
//! carry their original code in the `*_source_value` column instead.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::{Date, OffsetDateTime};

use omopfhir_core::{InternalId, OmopTable};

use crate::error::StorageError;

/// Concept id meaning "no matching concept".
pub const NO_MATCHING_CONCEPT: i64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub person_id: i64,
    pub gender_concept_id: i64,
    pub year_of_birth: i32,
    pub month_of_birth: Option<u8>,
    pub day_of_birth: Option<u8>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub birth_datetime: Option<OffsetDateTime>,
    pub race_concept_id: i64,
    pub ethnicity_concept_id: i64,
    pub provider_id: Option<i64>,
    pub person_source_value: Option<String>,
    pub gender_source_value: Option<String>,
}

impl Person {
    pub fn new(gender_concept_id: i64, year_of_birth: i32) -> Self {
        Self {
            person_id: 0,
            gender_concept_id,
            year_of_birth,
            month_of_birth: None,
            day_of_birth: None,
            birth_datetime: None,
            race_concept_id: NO_MATCHING_CONCEPT,
            ethnicity_concept_id: NO_MATCHING_CONCEPT,
            provider_id: None,
            person_source_value: None,
            gender_source_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub provider_id: i64,
    pub provider_name: Option<String>,
    pub npi: Option<String>,
    pub specialty_concept_id: i64,
    pub gender_concept_id: i64,
    pub provider_source_value: Option<String>,
    pub gender_source_value: Option<String>,
}

impl Provider {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_id: 0,
            provider_name: Some(provider_name.into()),
            npi: None,
            specialty_concept_id: NO_MATCHING_CONCEPT,
            gender_concept_id: NO_MATCHING_CONCEPT,
            provider_source_value: None,
            gender_source_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitOccurrence {
    pub visit_occurrence_id: i64,
    pub person_id: i64,
    pub visit_concept_id: i64,
    pub visit_start_date: Date,
    #[serde(with = "time::serde::rfc3339::option")]
    pub visit_start_datetime: Option<OffsetDateTime>,
    pub visit_end_date: Option<Date>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub visit_end_datetime: Option<OffsetDateTime>,
    pub visit_type_concept_id: i64,
    pub provider_id: Option<i64>,
    pub visit_source_value: Option<String>,
}

impl VisitOccurrence {
    pub fn new(person_id: i64, visit_concept_id: i64, visit_start_date: Date) -> Self {
        Self {
            visit_occurrence_id: 0,
            person_id,
            visit_concept_id,
            visit_start_date,
            visit_start_datetime: None,
            visit_end_date: None,
            visit_end_datetime: None,
            visit_type_concept_id: NO_MATCHING_CONCEPT,
            provider_id: None,
            visit_source_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionOccurrence {
    pub condition_occurrence_id: i64,
    pub person_id: i64,
    pub condition_concept_id: i64,
    pub condition_start_date: Date,
    #[serde(with = "time::serde::rfc3339::option")]
    pub condition_start_datetime: Option<OffsetDateTime>,
    pub condition_end_date: Option<Date>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub condition_end_datetime: Option<OffsetDateTime>,
    pub condition_type_concept_id: i64,
    pub condition_status_concept_id: i64,
    pub stop_reason: Option<String>,
    pub provider_id: Option<i64>,
    pub visit_occurrence_id: Option<i64>,
    pub condition_source_value: Option<String>,
    pub condition_status_source_value: Option<String>,
}

impl ConditionOccurrence {
    pub fn new(person_id: i64, condition_concept_id: i64, condition_start_date: Date) -> Self {
        Self {
            condition_occurrence_id: 0,
            person_id,
            condition_concept_id,
            condition_start_date,
            condition_start_datetime: None,
            condition_end_date: None,
            condition_end_datetime: None,
            condition_type_concept_id: NO_MATCHING_CONCEPT,
            condition_status_concept_id: NO_MATCHING_CONCEPT,
            stop_reason: None,
            provider_id: None,
            visit_occurrence_id: None,
            condition_source_value: None,
            condition_status_source_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub measurement_id: i64,
    pub person_id: i64,
    pub measurement_concept_id: i64,
    pub measurement_date: Date,
    #[serde(with = "time::serde::rfc3339::option")]
    pub measurement_datetime: Option<OffsetDateTime>,
    pub measurement_type_concept_id: i64,
    pub value_as_number: Option<f64>,
    pub value_as_concept_id: i64,
    pub unit_concept_id: i64,
    pub range_low: Option<f64>,
    pub range_high: Option<f64>,
    pub provider_id: Option<i64>,
    pub visit_occurrence_id: Option<i64>,
    pub measurement_source_value: Option<String>,
    pub unit_source_value: Option<String>,
    pub value_source_value: Option<String>,
}

impl Measurement {
    pub fn new(person_id: i64, measurement_concept_id: i64, measurement_date: Date) -> Self {
        Self {
            measurement_id: 0,
            person_id,
            measurement_concept_id,
            measurement_date,
            measurement_datetime: None,
            measurement_type_concept_id: NO_MATCHING_CONCEPT,
            value_as_number: None,
            value_as_concept_id: NO_MATCHING_CONCEPT,
            unit_concept_id: NO_MATCHING_CONCEPT,
            range_low: None,
            range_high: None,
            provider_id: None,
            visit_occurrence_id: None,
            measurement_source_value: None,
            unit_source_value: None,
            value_source_value: None,
        }
    }
}

/// Row of the OMOP `observation` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationRecord {
    pub observation_id: i64,
    pub person_id: i64,
    pub observation_concept_id: i64,
    pub observation_date: Date,
    #[serde(with = "time::serde::rfc3339::option")]
    pub observation_datetime: Option<OffsetDateTime>,
    pub observation_type_concept_id: i64,
    pub value_as_number: Option<f64>,
    pub value_as_string: Option<String>,
    pub value_as_concept_id: i64,
    pub unit_concept_id: i64,
    pub provider_id: Option<i64>,
    pub visit_occurrence_id: Option<i64>,
    pub observation_source_value: Option<String>,
    pub unit_source_value: Option<String>,
}

impl ObservationRecord {
    pub fn new(person_id: i64, observation_concept_id: i64, observation_date: Date) -> Self {
        Self {
            observation_id: 0,
            person_id,
            observation_concept_id,
            observation_date,
            observation_datetime: None,
            observation_type_concept_id: NO_MATCHING_CONCEPT,
            value_as_number: None,
            value_as_string: None,
            value_as_concept_id: NO_MATCHING_CONCEPT,
            unit_concept_id: NO_MATCHING_CONCEPT,
            provider_id: None,
            visit_occurrence_id: None,
            observation_source_value: None,
            unit_source_value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugExposure {
    pub drug_exposure_id: i64,
    pub person_id: i64,
    pub drug_concept_id: i64,
    pub drug_exposure_start_date: Date,
    #[serde(with = "time::serde::rfc3339::option")]
    pub drug_exposure_start_datetime: Option<OffsetDateTime>,
    pub drug_exposure_end_date: Option<Date>,
    pub drug_type_concept_id: i64,
    pub stop_reason: Option<String>,
    pub refills: Option<i32>,
    pub quantity: Option<f64>,
    pub sig: Option<String>,
    pub route_concept_id: i64,
    pub provider_id: Option<i64>,
    pub visit_occurrence_id: Option<i64>,
    pub drug_source_value: Option<String>,
    pub route_source_value: Option<String>,
}

impl DrugExposure {
    pub fn new(person_id: i64, drug_concept_id: i64, drug_exposure_start_date: Date) -> Self {
        Self {
            drug_exposure_id: 0,
            person_id,
            drug_concept_id,
            drug_exposure_start_date,
            drug_exposure_start_datetime: None,
            drug_exposure_end_date: None,
            drug_type_concept_id: NO_MATCHING_CONCEPT,
            stop_reason: None,
            refills: None,
            quantity: None,
            sig: None,
            route_concept_id: NO_MATCHING_CONCEPT,
            provider_id: None,
            visit_occurrence_id: None,
            drug_source_value: None,
            route_source_value: None,
        }
    }
}

/// Vocabulary reference row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Concept {
    pub concept_id: i64,
    pub concept_name: String,
    pub domain_id: String,
    pub vocabulary_id: String,
    pub concept_class_id: String,
    pub standard_concept: Option<String>,
    pub concept_code: String,
}

impl Concept {
    pub fn new(
        concept_id: i64,
        vocabulary_id: impl Into<String>,
        concept_code: impl Into<String>,
        concept_name: impl Into<String>,
        domain_id: impl Into<String>,
    ) -> Self {
        Self {
            concept_id,
            concept_name: concept_name.into(),
            domain_id: domain_id.into(),
            vocabulary_id: vocabulary_id.into(),
            concept_class_id: String::new(),
            standard_concept: Some("S".to_string()),
            concept_code: concept_code.into(),
        }
    }
}

/// Any clinical row the storage port reads or writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", rename_all = "snake_case")]
pub enum OmopEntity {
    Person(Person),
    Provider(Provider),
    VisitOccurrence(VisitOccurrence),
    ConditionOccurrence(ConditionOccurrence),
    Measurement(Measurement),
    Observation(ObservationRecord),
    DrugExposure(DrugExposure),
}

impl OmopEntity {
    pub fn table(&self) -> OmopTable {
        match self {
            OmopEntity::Person(_) => OmopTable::Person,
            OmopEntity::Provider(_) => OmopTable::Provider,
            OmopEntity::VisitOccurrence(_) => OmopTable::VisitOccurrence,
            OmopEntity::ConditionOccurrence(_) => OmopTable::ConditionOccurrence,
            OmopEntity::Measurement(_) => OmopTable::Measurement,
            OmopEntity::Observation(_) => OmopTable::Observation,
            OmopEntity::DrugExposure(_) => OmopTable::DrugExposure,
        }
    }

    /// Native primary key; `0` before the row is created.
    pub fn key(&self) -> i64 {
        match self {
            OmopEntity::Person(row) => row.person_id,
            OmopEntity::Provider(row) => row.provider_id,
            OmopEntity::VisitOccurrence(row) => row.visit_occurrence_id,
            OmopEntity::ConditionOccurrence(row) => row.condition_occurrence_id,
            OmopEntity::Measurement(row) => row.measurement_id,
            OmopEntity::Observation(row) => row.observation_id,
            OmopEntity::DrugExposure(row) => row.drug_exposure_id,
        }
    }

    pub fn set_key(&mut self, key: i64) {
        match self {
            OmopEntity::Person(row) => row.person_id = key,
            OmopEntity::Provider(row) => row.provider_id = key,
            OmopEntity::VisitOccurrence(row) => row.visit_occurrence_id = key,
            OmopEntity::ConditionOccurrence(row) => row.condition_occurrence_id = key,
            OmopEntity::Measurement(row) => row.measurement_id = key,
            OmopEntity::Observation(row) => row.observation_id = key,
            OmopEntity::DrugExposure(row) => row.drug_exposure_id = key,
        }
    }

    pub fn internal_id(&self) -> InternalId {
        InternalId::new(self.table(), self.key())
    }

    /// Subject of clinical rows; `None` for Person and Provider.
    pub fn person_id(&self) -> Option<i64> {
        match self {
            OmopEntity::Person(_) | OmopEntity::Provider(_) => None,
            OmopEntity::VisitOccurrence(row) => Some(row.person_id),
            OmopEntity::ConditionOccurrence(row) => Some(row.person_id),
            OmopEntity::Measurement(row) => Some(row.person_id),
            OmopEntity::Observation(row) => Some(row.person_id),
            OmopEntity::DrugExposure(row) => Some(row.person_id),
        }
    }

    /// Column name to value map, used by backends that filter by column path.
    pub fn to_columns(&self) -> Result<Map<String, Value>, StorageError> {
        let value = match self {
            OmopEntity::Person(row) => serde_json::to_value(row),
            OmopEntity::Provider(row) => serde_json::to_value(row),
            OmopEntity::VisitOccurrence(row) => serde_json::to_value(row),
            OmopEntity::ConditionOccurrence(row) => serde_json::to_value(row),
            OmopEntity::Measurement(row) => serde_json::to_value(row),
            OmopEntity::Observation(row) => serde_json::to_value(row),
            OmopEntity::DrugExposure(row) => serde_json::to_value(row),
        }
        .map_err(|e| StorageError::internal(format!("failed to project columns: {e}")))?;

        match value {
            Value::Object(map) => Ok(map),
            _ => Err(StorageError::internal("entity did not serialize to an object")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime};

    #[test]
    fn test_key_accessors() {
        let mut entity = OmopEntity::ConditionOccurrence(ConditionOccurrence::new(
            1,
            201826,
            date!(2020 - 01 - 02),
        ));
        assert_eq!(entity.key(), 0);
        entity.set_key(44);
        assert_eq!(entity.key(), 44);
        assert_eq!(
            entity.internal_id(),
            InternalId::new(OmopTable::ConditionOccurrence, 44)
        );
        assert_eq!(entity.person_id(), Some(1));
    }

    #[test]
    fn test_to_columns_formats() {
        let mut row = Measurement::new(3, 3004249, date!(2021 - 03 - 04));
        row.measurement_datetime = Some(datetime!(2021-03-04 10:30:00 UTC));
        row.value_as_number = Some(120.0);
        let columns = OmopEntity::Measurement(row).to_columns().unwrap();

        assert_eq!(columns["measurement_date"], "2021-03-04");
        assert_eq!(columns["measurement_datetime"], "2021-03-04T10:30:00Z");
        assert_eq!(columns["value_as_number"], 120.0);
        assert_eq!(columns["person_id"], 3);
        assert!(columns["provider_id"].is_null());
    }

    #[test]
    fn test_person_has_no_subject() {
        let entity = OmopEntity::Person(Person::new(8507, 1980));
        assert_eq!(entity.person_id(), None);
        assert_eq!(entity.table(), OmopTable::Person);
    }
}
