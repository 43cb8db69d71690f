//! Encounter ⇄ `visit_occurrence`.
//!
//! `class` is a v3 ActCode coding translated through a fixed table onto
//! the OMOP `Visit` vocabulary (`IMP` ⇄ `IP`, `AMB` ⇄ `OP`, `EMER` ⇄ `ER`).
//! Codes outside the table cannot be stored.
//!
//! Lossy spots:
//! - `visit_type_concept_id` comes from configuration on create.
//! - `status` is not stored; it reads back as `finished` when the visit has
//!   an end date and `in-progress` otherwise.
//! - Only the first participant is kept, as `provider_id`.

use async_trait::async_trait;

use omopfhir_core::model::{Coding, Encounter, EncounterParticipant, FhirResource, Period};
use omopfhir_core::time::render_date_time;
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchParam, SearchParameterType, SearchValue};
use omopfhir_storage::{OmopEntity, Operator, Predicate, ValueType, VisitOccurrence};

use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, date_field, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{date_predicate, id_predicate, match_nothing, reference_predicate};
use crate::references::{reference_key, render_reference};
use crate::vocabulary::ConceptLookup;

pub const ACT_CODE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";
const VISIT_VOCABULARY: &str = "Visit";

/// ActCode class ⇄ OMOP `Visit` concept code.
const CLASS_TABLE: &[(&str, &str)] = &[("IMP", "IP"), ("AMB", "OP"), ("EMER", "ER")];

fn visit_code(class: &str) -> Option<&'static str> {
    CLASS_TABLE
        .iter()
        .find(|(act, _)| *act == class)
        .map(|(_, visit)| *visit)
}

fn class_code(visit: &str) -> Option<&'static str> {
    CLASS_TABLE
        .iter()
        .find(|(_, v)| *v == visit)
        .map(|(act, _)| *act)
}

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("class", SearchParameterType::Token),
    ParamDefinition::reference("subject", &[ResourceType::Patient]),
    ParamDefinition::reference("patient", &[ResourceType::Patient]),
    ParamDefinition::reference("participant", &[ResourceType::Practitioner]),
    ParamDefinition::reference("practitioner", &[ResourceType::Practitioner]),
    ParamDefinition::new("date", SearchParameterType::Date),
];

pub struct EncounterMapper {
    ctx: MapperContext,
}

impl EncounterMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    /// Visit concept for an ActCode class, `None` when the class is outside
    /// the table or the vocabulary lacks the concept.
    async fn visit_concept(&self, class: &str) -> Result<Option<i64>, MappingError> {
        let Some(code) = visit_code(class) else {
            return Ok(None);
        };
        let lookup = self.ctx.vocabulary.resolve_concept(VISIT_VOCABULARY, code).await?;
        Ok(match lookup {
            ConceptLookup::Found(concept) => Some(concept.concept_id),
            _ => None,
        })
    }

    async fn class_coding(&self, visit_concept_id: i64) -> Result<Option<Coding>, MappingError> {
        let Some(concept) = self.ctx.vocabulary.concept_by_id(visit_concept_id).await? else {
            return Ok(None);
        };
        Ok(class_code(&concept.concept_code)
            .map(|code| Coding::new(ACT_CODE_SYSTEM, code).with_display(concept.concept_name)))
    }

    async fn value_predicate(
        &self,
        table: OmopTable,
        param: &SearchParam,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let predicate = match param.name.as_str() {
            "_id" => id_predicate(&self.ctx, ResourceType::Encounter, table, value)?,
            "class" => match value {
                SearchValue::Token {
                    code: Some(code), ..
                } => match self.visit_concept(code).await? {
                    Some(concept_id) => Predicate::compare(
                        ValueType::Long,
                        "visit_concept_id",
                        Operator::Eq,
                        concept_id.to_string(),
                    )?,
                    None => match_nothing(table)?,
                },
                _ => return Ok(None),
            },
            "subject" | "patient" => {
                reference_predicate(&self.ctx, table, "person_id", ResourceType::Patient, value)?
            }
            "participant" | "practitioner" => reference_predicate(
                &self.ctx,
                table,
                "provider_id",
                ResourceType::Practitioner,
                value,
            )?,
            "date" => date_predicate("visit_start_date", value)?,
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for EncounterMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Encounter
    }

    fn binding(&self) -> TableBinding {
        TableBinding::single(OmopTable::VisitOccurrence)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let OmopEntity::VisitOccurrence(row) = entity else {
            return Err(unexpected_entity(ResourceType::Encounter, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Encounter)
            .ok_or_else(|| MappingError::not_found(ResourceType::Encounter, id))?;

        let subject = render_reference(&self.ctx, ResourceType::Patient, Some(row.person_id));
        let participant = render_reference(&self.ctx, ResourceType::Practitioner, row.provider_id);
        let status = if row.visit_end_date.is_some() {
            "finished"
        } else {
            "in-progress"
        };

        let encounter = Encounter {
            id: Some(external.id.to_string()),
            status: Some(status.to_string()),
            class: self.class_coding(row.visit_concept_id).await?,
            kind: Vec::new(),
            subject: subject.as_ref().map(|(r, _)| r.clone()),
            participant: participant
                .iter()
                .map(|(r, _)| EncounterParticipant {
                    individual: Some(r.clone()),
                })
                .collect(),
            period: Some(Period {
                start: render_date_time(Some(row.visit_start_date), row.visit_start_datetime),
                end: render_date_time(row.visit_end_date, row.visit_end_datetime),
            }),
        };

        let mut mapped = MappedResource::new(external, FhirResource::Encounter(encounter));
        let subject = subject.map(|(_, target)| target);
        let participant = participant.map(|(_, target)| target);
        mapped.add_reference("subject", subject);
        mapped.add_reference("patient", subject);
        mapped.add_reference("participant", participant);
        mapped.add_reference("practitioner", participant);
        Ok(mapped)
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Encounter(encounter) = resource else {
            return Err(unexpected_resource(ResourceType::Encounter, resource));
        };

        let visit_concept = match &encounter.class {
            Some(class) => {
                let code = class.code.as_deref().unwrap_or_default();
                let concept = self.visit_concept(code).await?.ok_or_else(|| {
                    MappingError::unresolvable_code(
                        "class",
                        class.system.as_deref().unwrap_or_default(),
                        code,
                    )
                })?;
                Some((concept, code))
            }
            None => None,
        };
        let person_id = reference_key(
            &self.ctx,
            "subject",
            encounter.subject.as_ref(),
            ResourceType::Patient,
        )?;
        let provider_id = reference_key(
            &self.ctx,
            "participant",
            encounter
                .participant
                .iter()
                .find_map(|p| p.individual.as_ref()),
            ResourceType::Practitioner,
        )?;
        let period = encounter.period.as_ref();
        let start = date_field("period.start", period.and_then(|p| p.start.as_deref()))?;
        let end = date_field("period.end", period.and_then(|p| p.end.as_deref()))?;

        let mut row = match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::Encounter, id).await? {
                OmopEntity::VisitOccurrence(row) => row,
                other => return Err(unexpected_entity(ResourceType::Encounter, &other)),
            },
            None => {
                let (concept, _) = visit_concept.ok_or_else(|| MappingError::missing("class"))?;
                let person_id = person_id.ok_or_else(|| MappingError::missing("subject"))?;
                let (start, _) = start.ok_or_else(|| MappingError::missing("period.start"))?;
                let mut row = VisitOccurrence::new(person_id, concept, start);
                row.visit_type_concept_id = self.ctx.config.defaults.visit_type_concept_id;
                row
            }
        };

        if let Some((concept, code)) = visit_concept {
            row.visit_concept_id = concept;
            row.visit_source_value = Some(code.to_string());
        }
        if let Some(person_id) = person_id {
            row.person_id = person_id;
        }
        if provider_id.is_some() {
            row.provider_id = provider_id;
        }
        if let Some((date, datetime)) = start {
            row.visit_start_date = date;
            row.visit_start_datetime = datetime;
        }
        if let Some((date, datetime)) = end {
            if date < row.visit_start_date {
                return Err(MappingError::validation("period.end", "period ends before it starts"));
            }
            row.visit_end_date = Some(date);
            row.visit_end_datetime = datetime;
        }

        Ok(EntityWrite::single(OmopEntity::VisitOccurrence(row)))
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
            "_id" => Some("visit_occurrence_id"),
            "date" => Some("visit_start_date"),
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
    use omopfhir_db_memory::fixtures::VISIT_INPATIENT;
    use omopfhir_storage::OmopStorage;
    use serde_json::json;

    fn encounter(value: serde_json::Value) -> FhirResource {
        FhirResource::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let store = store();
        let mapper = EncounterMapper::new(context_with(store.clone(), Default::default()));
        let resource = encounter(json!({
            "resourceType": "Encounter",
            "class": {"system": ACT_CODE_SYSTEM, "code": "IMP"},
            "subject": {"reference": "Patient/1"},
            "participant": [{"individual": {"reference": "Practitioner/2"}}],
            "period": {"start": "2021-05-01T08:00:00Z", "end": "2021-05-04"}
        }));
        let write = mapper.to_entity(None, &resource).await.unwrap();
        let OmopEntity::VisitOccurrence(row) = &write.primary else {
            panic!("expected a visit row");
        };
        assert_eq!(row.visit_concept_id, VISIT_INPATIENT);
        // Lossy: the record type is configuration, not data.
        assert_eq!(row.visit_type_concept_id, crate::defaults::EHR_TYPE_CONCEPT);

        let created = store.create(write.primary).await.unwrap();
        let mapped = mapper
            .to_resource(created.internal_id(), &created)
            .await
            .unwrap();
        assert_json_eq!(
            mapped.resource.to_value().unwrap(),
            json!({
                "resourceType": "Encounter",
                "id": created.key().to_string(),
                "status": "finished",
                "class": {"system": ACT_CODE_SYSTEM, "code": "IMP", "display": "Inpatient Visit"},
                "subject": {"reference": "Patient/1"},
                "participant": [{"individual": {"reference": "Practitioner/2"}}],
                "period": {"start": "2021-05-01T08:00:00Z", "end": "2021-05-04"}
            })
        );
    }

    #[tokio::test]
    async fn test_class_outside_table_is_unresolvable() {
        let mapper = EncounterMapper::new(context());
        let resource = encounter(json!({
            "resourceType": "Encounter",
            "class": {"system": ACT_CODE_SYSTEM, "code": "HH"},
            "subject": {"reference": "Patient/1"},
            "period": {"start": "2021-05-01"}
        }));
        let err = mapper.to_entity(None, &resource).await.unwrap_err();
        assert!(matches!(err, MappingError::UnresolvableCode { ref code, .. } if code == "HH"));
    }

    #[tokio::test]
    async fn test_period_must_not_end_before_start() {
        let mapper = EncounterMapper::new(context());
        let resource = encounter(json!({
            "resourceType": "Encounter",
            "class": {"system": ACT_CODE_SYSTEM, "code": "AMB"},
            "subject": {"reference": "Patient/1"},
            "period": {"start": "2021-05-04", "end": "2021-05-01"}
        }));
        let err = mapper.to_entity(None, &resource).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn test_class_search_resolves_visit_concept() {
        let mapper = EncounterMapper::new(context());
        let param = SearchParam::token("class", Some(ACT_CODE_SYSTEM), "IMP");
        let ParameterTranslation::Predicates(predicates) = mapper
            .to_predicates(OmopTable::VisitOccurrence, &param, false)
            .await
            .unwrap()
        else {
            panic!("class is supported");
        };
        assert_eq!(predicates[0].values, vec![VISIT_INPATIENT.to_string()]);

        let param = SearchParam::token("class", Some(ACT_CODE_SYSTEM), "HH");
        let ParameterTranslation::Predicates(predicates) = mapper
            .to_predicates(OmopTable::VisitOccurrence, &param, false)
            .await
            .unwrap()
        else {
            panic!("class is supported");
        };
        assert_eq!(predicates[0].operators, vec![Operator::IsNull]);
    }
}
