//! Condition ⇄ `condition_occurrence`.
//!
//! | FHIR | OMOP |
//! |---|---|
//! | `code` | `condition_concept_id`, `condition_source_value` |
//! | `subject` | `person_id` |
//! | `encounter` | `visit_occurrence_id` |
//! | `asserter` | `provider_id` |
//! | `onsetDateTime` | `condition_start_date`, `condition_start_datetime` |
//! | `abatementDateTime` | `condition_end_date`, `condition_end_datetime` |
//! | `clinicalStatus` | `condition_status_source_value` |
//! | `note[0].text` | `stop_reason` |
//!
//! Lossy spots:
//! - `condition_type_concept_id` has no FHIR element; new rows get
//!   [`MappingDefaults::condition_type_concept_id`](crate::defaults::MappingDefaults).
//! - `category` is not stored and always reads back as `encounter-diagnosis`.
//! - Only the first note survives.

use async_trait::async_trait;

use omopfhir_core::model::{Annotation, CodeableConcept, Coding, Condition, FhirResource};
use omopfhir_core::time::render_date_time;
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchParam, SearchParameterType, SearchValue};
use omopfhir_storage::{ConditionOccurrence, OmopEntity, Operator, Predicate, ValueType};

use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, date_field, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{
    code_predicate, date_predicate, id_predicate, match_all, match_nothing, reference_predicate,
};
use crate::references::{reference_key, render_reference};

pub const CLINICAL_STATUS_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/condition-clinical";
pub const CATEGORY_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/condition-category";
pub const ENCOUNTER_DIAGNOSIS: &str = "encounter-diagnosis";

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("code", SearchParameterType::Token),
    ParamDefinition::reference("subject", &[ResourceType::Patient]),
    ParamDefinition::reference("patient", &[ResourceType::Patient]),
    ParamDefinition::reference("encounter", &[ResourceType::Encounter]),
    ParamDefinition::reference("asserter", &[ResourceType::Practitioner]),
    ParamDefinition::new("onset-date", SearchParameterType::Date),
    ParamDefinition::new("abatement-date", SearchParameterType::Date),
    ParamDefinition::new("clinical-status", SearchParameterType::Token),
    ParamDefinition::new("category", SearchParameterType::Token),
];

pub struct ConditionMapper {
    ctx: MapperContext,
}

impl ConditionMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    async fn value_predicate(
        &self,
        table: OmopTable,
        param: &SearchParam,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let predicate = match param.name.as_str() {
            "_id" => id_predicate(&self.ctx, ResourceType::Condition, table, value)?,
            "code" => {
                code_predicate(
                    &self.ctx,
                    "condition_concept_id",
                    "condition_source_value",
                    param.modifier.as_ref(),
                    value,
                )
                .await?
            }
            "subject" | "patient" => {
                reference_predicate(&self.ctx, table, "person_id", ResourceType::Patient, value)?
            }
            "encounter" => reference_predicate(
                &self.ctx,
                table,
                "visit_occurrence_id",
                ResourceType::Encounter,
                value,
            )?,
            "asserter" => reference_predicate(
                &self.ctx,
                table,
                "provider_id",
                ResourceType::Practitioner,
                value,
            )?,
            "onset-date" => date_predicate("condition_start_date", value)?,
            "abatement-date" => date_predicate("condition_end_date", value)?,
            "clinical-status" => match value {
                SearchValue::Token {
                    code: Some(code), ..
                } => Predicate::compare(
                    ValueType::String,
                    "condition_status_source_value",
                    Operator::Eq,
                    code.clone(),
                )?,
                SearchValue::Missing(missing) => {
                    Predicate::null_check("condition_status_source_value", *missing)?
                }
                _ => return Ok(None),
            },
            // Every stored condition reads back as an encounter diagnosis.
            "category" => match value {
                SearchValue::Token {
                    code: Some(code), ..
                } if code == ENCOUNTER_DIAGNOSIS => match_all(table)?,
                _ => match_nothing(table)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for ConditionMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Condition
    }

    fn binding(&self) -> TableBinding {
        TableBinding::single(OmopTable::ConditionOccurrence)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let OmopEntity::ConditionOccurrence(row) = entity else {
            return Err(unexpected_entity(ResourceType::Condition, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Condition)
            .ok_or_else(|| MappingError::not_found(ResourceType::Condition, id))?;

        let code = self
            .ctx
            .vocabulary
            .codeable_concept_for(row.condition_concept_id, row.condition_source_value.as_deref())
            .await?;
        let subject = render_reference(&self.ctx, ResourceType::Patient, Some(row.person_id));
        let encounter =
            render_reference(&self.ctx, ResourceType::Encounter, row.visit_occurrence_id);
        let asserter = render_reference(&self.ctx, ResourceType::Practitioner, row.provider_id);

        let condition = Condition {
            id: Some(external.id.to_string()),
            clinical_status: row.condition_status_source_value.as_ref().map(|status| {
                CodeableConcept::from_coding(Coding::new(CLINICAL_STATUS_SYSTEM, status.as_str()))
            }),
            category: vec![CodeableConcept::from_coding(
                Coding::new(CATEGORY_SYSTEM, ENCOUNTER_DIAGNOSIS).with_display("Encounter Diagnosis"),
            )],
            code,
            subject: subject.as_ref().map(|(r, _)| r.clone()),
            encounter: encounter.as_ref().map(|(r, _)| r.clone()),
            onset_date_time: render_date_time(
                Some(row.condition_start_date),
                row.condition_start_datetime,
            ),
            abatement_date_time: render_date_time(
                row.condition_end_date,
                row.condition_end_datetime,
            ),
            asserter: asserter.as_ref().map(|(r, _)| r.clone()),
            note: row
                .stop_reason
                .iter()
                .map(|text| Annotation { text: text.clone() })
                .collect(),
        };

        let mut mapped = MappedResource::new(external, FhirResource::Condition(condition));
        let subject = subject.map(|(_, target)| target);
        mapped.add_reference("subject", subject);
        mapped.add_reference("patient", subject);
        mapped.add_reference("encounter", encounter.map(|(_, target)| target));
        mapped.add_reference("asserter", asserter.map(|(_, target)| target));
        Ok(mapped)
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Condition(condition) = resource else {
            return Err(unexpected_resource(ResourceType::Condition, resource));
        };

        let person_id = reference_key(
            &self.ctx,
            "subject",
            condition.subject.as_ref(),
            ResourceType::Patient,
        )?;
        let code = match &condition.code {
            Some(cc) => self.ctx.vocabulary.resolve_codeable_concept(cc).await?,
            None => None,
        };
        let onset = date_field("onsetDateTime", condition.onset_date_time.as_deref())?;
        let abatement = date_field("abatementDateTime", condition.abatement_date_time.as_deref())?;
        let visit_id = reference_key(
            &self.ctx,
            "encounter",
            condition.encounter.as_ref(),
            ResourceType::Encounter,
        )?;
        let provider_id = reference_key(
            &self.ctx,
            "asserter",
            condition.asserter.as_ref(),
            ResourceType::Practitioner,
        )?;

        let mut row = match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::Condition, id).await? {
                OmopEntity::ConditionOccurrence(row) => row,
                other => return Err(unexpected_entity(ResourceType::Condition, &other)),
            },
            None => {
                let person_id = person_id.ok_or_else(|| MappingError::missing("subject"))?;
                let code = code.as_ref().ok_or_else(|| MappingError::missing("code"))?;
                let (start, _) = onset.ok_or_else(|| MappingError::missing("onsetDateTime"))?;
                let mut row = ConditionOccurrence::new(person_id, code.concept_id(), start);
                row.condition_type_concept_id =
                    self.ctx.config.defaults.condition_type_concept_id;
                row
            }
        };

        if let Some(person_id) = person_id {
            row.person_id = person_id;
        }
        if let Some(code) = code {
            row.condition_concept_id = code.concept_id();
            row.condition_source_value = Some(code.source().encode());
        }
        if let Some((date, datetime)) = onset {
            row.condition_start_date = date;
            row.condition_start_datetime = datetime;
        }
        if let Some((date, datetime)) = abatement {
            if date < row.condition_start_date {
                return Err(MappingError::validation(
                    "abatementDateTime",
                    "abatement precedes onset",
                ));
            }
            row.condition_end_date = Some(date);
            row.condition_end_datetime = datetime;
        }
        if visit_id.is_some() {
            row.visit_occurrence_id = visit_id;
        }
        if provider_id.is_some() {
            row.provider_id = provider_id;
        }
        if let Some(status) = &condition.clinical_status {
            row.condition_status_source_value = status
                .coding_for(CLINICAL_STATUS_SYSTEM)
                .or_else(|| status.coding.first())
                .and_then(|c| c.code.clone());
        }
        if let Some(note) = condition.note.first() {
            row.stop_reason = Some(note.text.clone());
        }

        Ok(EntityWrite::single(OmopEntity::ConditionOccurrence(row)))
    }

    async fn to_predicates(
        &self,
        table: OmopTable,
        param: &SearchParam,
        is_or_alternative: bool,
    ) -> Result<ParameterTranslation, MappingError> {
        let mut predicates = Vec::with_capacity(param.values.len());
        for value in &param.values {
            match self.value_predicate(table, param, value).await? {
                Some(predicate) => predicates.push(predicate),
                None => return Ok(ParameterTranslation::Unsupported),
            }
        }
        Ok(ParameterTranslation::Predicates(alternatives(
            param,
            predicates,
            is_or_alternative,
        )))
    }

    fn sort_column(&self, _table: OmopTable, field: &str) -> Option<&'static str> {
        match field {
            "_id" => Some("condition_occurrence_id"),
            "date" | "onset-date" => Some("condition_start_date"),
            "abatement-date" => Some("condition_end_date"),
            "code" => Some("condition_concept_id"),
            "subject" | "patient" => Some("person_id"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, context_with, store};
    use assert_json_diff::assert_json_eq;
    use omopfhir_db_memory::fixtures::SNOMED_TYPE_2_DIABETES;
    use omopfhir_search::SearchModifier;
    use omopfhir_storage::{JoinOp, NO_MATCHING_CONCEPT, OmopStorage};
    use serde_json::json;

    fn condition(value: serde_json::Value) -> FhirResource {
        FhirResource::from_value(value).unwrap()
    }

    fn diabetes() -> FhirResource {
        condition(json!({
            "resourceType": "Condition",
            "clinicalStatus": {"coding": [{"system": CLINICAL_STATUS_SYSTEM, "code": "active"}]},
            "code": {"coding": [{"system": "http://snomed.info/sct", "code": "44054006"}]},
            "subject": {"reference": "Patient/3"},
            "encounter": {"reference": "Encounter/8"},
            "asserter": {"reference": "Practitioner/2"},
            "onsetDateTime": "2020-01-02",
            "abatementDateTime": "2021-03-04T10:00:00Z",
            "note": [{"text": "resolved after diet change"}]
        }))
    }

    #[tokio::test]
    async fn test_round_trip_preserves_mapped_fields() {
        let store = store();
        let mapper = ConditionMapper::new(context_with(store.clone(), Default::default()));

        let write = mapper.to_entity(None, &diabetes()).await.unwrap();
        let OmopEntity::ConditionOccurrence(row) = &write.primary else {
            panic!("expected a condition row");
        };
        assert_eq!(row.condition_concept_id, SNOMED_TYPE_2_DIABETES);
        // Lossy: no FHIR element carries the record type.
        assert_eq!(row.condition_type_concept_id, crate::defaults::EHR_TYPE_CONCEPT);

        let created = store.create(write.primary).await.unwrap();
        let mapped = mapper
            .to_resource(created.internal_id(), &created)
            .await
            .unwrap();
        let value = mapped.resource.to_value().unwrap();
        assert_json_eq!(
            value,
            json!({
                "resourceType": "Condition",
                "id": created.key().to_string(),
                "clinicalStatus": {"coding": [{"system": CLINICAL_STATUS_SYSTEM, "code": "active"}]},
                "category": [{"coding": [{
                    "system": CATEGORY_SYSTEM,
                    "code": "encounter-diagnosis",
                    "display": "Encounter Diagnosis"
                }]}],
                "code": {"coding": [{
                    "system": "http://snomed.info/sct",
                    "code": "44054006",
                    "display": "Type 2 diabetes mellitus"
                }]},
                "subject": {"reference": "Patient/3"},
                "encounter": {"reference": "Encounter/8"},
                "asserter": {"reference": "Practitioner/2"},
                "onsetDateTime": "2020-01-02",
                "abatementDateTime": "2021-03-04T10:00:00Z",
                "note": [{"text": "resolved after diet change"}]
            })
        );
        let patients: Vec<_> = mapped.references_for("patient").collect();
        assert_eq!(patients.len(), 1);
        assert_eq!(patients[0].to_reference(), "Patient/3");
    }

    #[tokio::test]
    async fn test_unknown_vocabulary_degrades_to_source_value() {
        let mapper = ConditionMapper::new(context());
        let resource = condition(json!({
            "resourceType": "Condition",
            "code": {"coding": [{
                "system": "http://example.org/local-codes",
                "code": "LC-17",
                "display": "Local condition"
            }]},
            "subject": {"reference": "Patient/1"},
            "onsetDateTime": "2022"
        }));
        let write = mapper.to_entity(None, &resource).await.unwrap();
        let OmopEntity::ConditionOccurrence(row) = &write.primary else {
            panic!("expected a condition row");
        };
        assert_eq!(row.condition_concept_id, NO_MATCHING_CONCEPT);
        assert_eq!(
            row.condition_source_value.as_deref(),
            Some("http://example.org/local-codes^LC-17^Local condition")
        );

        let mapped = mapper
            .to_resource(InternalId::new(OmopTable::ConditionOccurrence, 1), &write.primary)
            .await
            .unwrap();
        let FhirResource::Condition(back) = mapped.resource else {
            panic!("expected a Condition");
        };
        assert_eq!(
            back.code.unwrap().coding[0],
            Coding::new("http://example.org/local-codes", "LC-17").with_display("Local condition")
        );
    }

    #[tokio::test]
    async fn test_required_fields() {
        let mapper = ConditionMapper::new(context());
        let missing_subject = condition(json!({
            "resourceType": "Condition",
            "code": {"text": "headache"},
            "onsetDateTime": "2022-01-01"
        }));
        let err = mapper.to_entity(None, &missing_subject).await.unwrap_err();
        assert!(matches!(err, MappingError::Validation { ref field, .. } if field == "subject"));

        let missing_onset = condition(json!({
            "resourceType": "Condition",
            "code": {"text": "headache"},
            "subject": {"reference": "Patient/1"}
        }));
        let err = mapper.to_entity(None, &missing_onset).await.unwrap_err();
        assert!(matches!(err, MappingError::Validation { ref field, .. } if field == "onsetDateTime"));

        let wrong_type = condition(json!({
            "resourceType": "Condition",
            "code": {"text": "headache"},
            "subject": {"reference": "Practitioner/1"},
            "onsetDateTime": "2022-01-01"
        }));
        let err = mapper.to_entity(None, &wrong_type).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_update_leaves_absent_fields_untouched() {
        let store = store();
        let mapper = ConditionMapper::new(context_with(store.clone(), Default::default()));
        let created = store
            .create(mapper.to_entity(None, &diabetes()).await.unwrap().primary)
            .await
            .unwrap();

        let patch = FhirResource::Condition(Condition {
            abatement_date_time: Some("2021-06-01".into()),
            ..Default::default()
        });
        let write = mapper
            .to_entity(Some(created.internal_id()), &patch)
            .await
            .unwrap();
        let OmopEntity::ConditionOccurrence(row) = write.primary else {
            panic!("expected a condition row");
        };
        assert_eq!(row.condition_occurrence_id, created.key());
        assert_eq!(row.condition_concept_id, SNOMED_TYPE_2_DIABETES);
        assert_eq!(row.person_id, 3);
        assert_eq!(row.condition_end_datetime, None);
        assert_eq!(
            row.stop_reason.as_deref(),
            Some("resolved after diet change")
        );

        let missing = mapper
            .to_entity(Some(InternalId::new(OmopTable::ConditionOccurrence, 999)), &patch)
            .await
            .unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn test_or_within_parameter_and_across_parameters() {
        let mapper = ConditionMapper::new(context());
        let code = SearchParam::new(
            "code",
            vec![
                SearchValue::Token {
                    system: Some("http://snomed.info/sct".into()),
                    code: Some("44054006".into()),
                },
                SearchValue::Token {
                    system: Some("http://snomed.info/sct".into()),
                    code: Some("22298006".into()),
                },
            ],
        );
        let subject = SearchParam::references("subject", ResourceType::Patient, [3]);

        let ParameterTranslation::Predicates(mut predicates) = mapper
            .to_predicates(OmopTable::ConditionOccurrence, &code, false)
            .await
            .unwrap()
        else {
            panic!("code is supported");
        };
        let ParameterTranslation::Predicates(more) = mapper
            .to_predicates(OmopTable::ConditionOccurrence, &subject, false)
            .await
            .unwrap()
        else {
            panic!("subject is supported");
        };
        predicates.extend(more);

        let joins: Vec<JoinOp> = predicates.iter().map(|p| p.outer_join).collect();
        assert_eq!(joins, vec![JoinOp::And, JoinOp::Or, JoinOp::And]);
        assert_eq!(predicates[0].column_paths, vec!["condition_concept_id"]);
        assert_eq!(predicates[2].column_paths, vec!["person_id"]);
    }

    #[tokio::test]
    async fn test_unsupported_parameter_is_distinct_from_no_constraint() {
        let mapper = ConditionMapper::new(context());
        let severity = SearchParam::token("severity", None, "24484000");
        assert_eq!(
            mapper
                .to_predicates(OmopTable::ConditionOccurrence, &severity, false)
                .await
                .unwrap(),
            ParameterTranslation::Unsupported
        );

        let missing = SearchParam::new("encounter", vec![SearchValue::Missing(true)])
            .with_modifier(SearchModifier::Missing);
        let ParameterTranslation::Predicates(predicates) = mapper
            .to_predicates(OmopTable::ConditionOccurrence, &missing, false)
            .await
            .unwrap()
        else {
            panic!("encounter:missing is supported");
        };
        assert_eq!(predicates[0].operators, vec![Operator::IsNull]);
    }

    #[test]
    fn test_sort_columns() {
        let mapper = ConditionMapper::new(context());
        assert_eq!(
            mapper.sort_column(OmopTable::ConditionOccurrence, "onset-date"),
            Some("condition_start_date")
        );
        assert_eq!(mapper.sort_column(OmopTable::ConditionOccurrence, "severity"), None);
    }
}
