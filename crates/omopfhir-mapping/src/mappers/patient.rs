//! Patient ⇄ `person`.
//!
//! `gender` uses a fixed table (`male` 8507, `female` 8532); `other` and
//! `unknown` both store the configured unknown gender concept and keep the
//! FHIR code in `gender_source_value`. `birthDate` is split into year, month
//! and day columns, and `birth_datetime` holds its first instant so date
//! searches have a column to compare. The first identifier's value is kept in
//! `person_source_value`; its system is not stored.

use async_trait::async_trait;

use omopfhir_core::model::{FhirResource, Identifier, Patient};
use omopfhir_core::time::{DatePrecision, start_of_day};
use omopfhir_core::{InternalId, OmopTable, PartialDateTime, ResourceType, TableBinding};
use omopfhir_search::{
    ParamDefinition, SearchModifier, SearchParam, SearchParameterType, SearchValue,
};
use omopfhir_storage::{OmopEntity, Operator, Person, Predicate, ValueType};

use crate::defaults::{GENDER_FEMALE, GENDER_MALE};
use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{
    date_predicate, id_predicate, match_nothing, reference_predicate, string_predicate,
};
use crate::references::{reference_key, render_reference};

pub const ADMINISTRATIVE_GENDER_SYSTEM: &str = "http://hl7.org/fhir/administrative-gender";

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("gender", SearchParameterType::Token),
    ParamDefinition::new("birthdate", SearchParameterType::Date),
    ParamDefinition::new("identifier", SearchParameterType::Token),
    ParamDefinition::reference("general-practitioner", &[ResourceType::Practitioner]),
];

/// Birth date as stored in the split `person` columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BirthDate {
    year: i32,
    month: Option<u8>,
    day: Option<u8>,
}

impl BirthDate {
    fn parse(raw: &str) -> Result<(Self, PartialDateTime), MappingError> {
        let parsed = PartialDateTime::parse(raw)
            .map_err(|e| MappingError::validation("birthDate", e.to_string()))?;
        if parsed.precision == DatePrecision::Instant {
            return Err(MappingError::validation(
                "birthDate",
                "expected a date without time",
            ));
        }
        let date = parsed.start.date();
        let birth = Self {
            year: date.year(),
            month: (parsed.precision != DatePrecision::Year).then(|| u8::from(date.month())),
            day: (parsed.precision == DatePrecision::Day).then(|| date.day()),
        };
        Ok((birth, parsed))
    }

    fn render(&self) -> String {
        match (self.month, self.day) {
            (Some(month), Some(day)) => format!("{:04}-{month:02}-{day:02}", self.year),
            (Some(month), None) => format!("{:04}-{month:02}", self.year),
            _ => format!("{:04}", self.year),
        }
    }
}

pub struct PatientMapper {
    ctx: MapperContext,
}

impl PatientMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    fn gender_concept(&self, code: &str) -> Result<i64, MappingError> {
        match code {
            "male" => Ok(GENDER_MALE),
            "female" => Ok(GENDER_FEMALE),
            "other" | "unknown" => Ok(self.ctx.config.defaults.unknown_gender_concept_id),
            _ => Err(MappingError::unresolvable_code(
                "gender",
                ADMINISTRATIVE_GENDER_SYSTEM,
                code,
            )),
        }
    }

    fn gender_code(row: &Person) -> &str {
        match row.gender_concept_id {
            GENDER_MALE => "male",
            GENDER_FEMALE => "female",
            _ => match row.gender_source_value.as_deref() {
                Some("other") => "other",
                _ => "unknown",
            },
        }
    }

    fn value_predicate(
        &self,
        table: OmopTable,
        param: &SearchParam,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let predicate = match param.name.as_str() {
            "_id" => id_predicate(&self.ctx, ResourceType::Patient, table, value)?,
            "gender" => match value {
                // `other` and `unknown` share one concept; only the source
                // value tells `other` apart.
                SearchValue::Token {
                    code: Some(code), ..
                } if code == "other" => Predicate::compare(
                    ValueType::String,
                    "gender_source_value",
                    Operator::Eq,
                    code.clone(),
                )?,
                SearchValue::Token {
                    code: Some(code), ..
                } => match self.gender_concept(code) {
                    Ok(concept_id) => Predicate::compare(
                        ValueType::Long,
                        "gender_concept_id",
                        Operator::Eq,
                        concept_id.to_string(),
                    )?,
                    Err(_) => match_nothing(table)?,
                },
                SearchValue::Missing(missing) => {
                    Predicate::null_check("gender_source_value", *missing)?
                }
                _ => return Ok(None),
            },
            "birthdate" => date_predicate("birth_datetime", value)?,
            "identifier" => match value {
                SearchValue::Token {
                    code: Some(code), ..
                } => string_predicate(
                    "person_source_value",
                    Some(&SearchModifier::Exact),
                    &SearchValue::String(code.clone()),
                )?,
                SearchValue::Missing(missing) => {
                    Predicate::null_check("person_source_value", *missing)?
                }
                _ => return Ok(None),
            },
            "general-practitioner" => reference_predicate(
                &self.ctx,
                table,
                "provider_id",
                ResourceType::Practitioner,
                value,
            )?,
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for PatientMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Patient
    }

    fn binding(&self) -> TableBinding {
        TableBinding::single(OmopTable::Person)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let OmopEntity::Person(row) = entity else {
            return Err(unexpected_entity(ResourceType::Patient, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Patient)
            .ok_or_else(|| MappingError::not_found(ResourceType::Patient, id))?;

        let birth = BirthDate {
            year: row.year_of_birth,
            month: row.month_of_birth,
            day: row.month_of_birth.and(row.day_of_birth),
        };
        let practitioner = render_reference(&self.ctx, ResourceType::Practitioner, row.provider_id);

        let patient = Patient {
            id: Some(external.id.to_string()),
            identifier: row
                .person_source_value
                .iter()
                .map(|value| Identifier {
                    system: None,
                    value: Some(value.clone()),
                })
                .collect(),
            gender: Some(Self::gender_code(row).to_string()),
            birth_date: Some(birth.render()),
            general_practitioner: practitioner.iter().map(|(r, _)| r.clone()).collect(),
        };

        let mut mapped = MappedResource::new(external, FhirResource::Patient(patient));
        mapped.add_reference("general-practitioner", practitioner.map(|(_, target)| target));
        Ok(mapped)
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Patient(patient) = resource else {
            return Err(unexpected_resource(ResourceType::Patient, resource));
        };

        let gender = patient
            .gender
            .as_deref()
            .map(|code| self.gender_concept(code).map(|concept| (concept, code)))
            .transpose()?;
        let birth = patient
            .birth_date
            .as_deref()
            .map(BirthDate::parse)
            .transpose()?;
        let provider_id = reference_key(
            &self.ctx,
            "generalPractitioner",
            patient.general_practitioner.first(),
            ResourceType::Practitioner,
        )?;

        let mut row = match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::Patient, id).await? {
                OmopEntity::Person(row) => row,
                other => return Err(unexpected_entity(ResourceType::Patient, &other)),
            },
            None => {
                let (birth, _) = birth.ok_or_else(|| MappingError::missing("birthDate"))?;
                // Lossy: an absent gender is stored as unknown.
                Person::new(self.ctx.config.defaults.unknown_gender_concept_id, birth.year)
            }
        };

        if let Some((concept_id, code)) = gender {
            row.gender_concept_id = concept_id;
            row.gender_source_value = Some(code.to_string());
        }
        if let Some((birth, parsed)) = birth {
            row.year_of_birth = birth.year;
            row.month_of_birth = birth.month;
            row.day_of_birth = birth.day;
            row.birth_datetime = Some(start_of_day(parsed.start.date()));
        }
        if provider_id.is_some() {
            row.provider_id = provider_id;
        }
        if let Some(value) = patient.identifier.iter().find_map(|i| i.value.as_ref()) {
            row.person_source_value = Some(value.clone());
        }

        Ok(EntityWrite::single(OmopEntity::Person(row)))
    }

    async fn to_predicates(
        &self,
        table: OmopTable,
        param: &SearchParam,
        is_or_alternative: bool,
    ) -> Result<ParameterTranslation, MappingError> {
        let mut predicates = Vec::with_capacity(param.values.len());
        for value in &param.values {
            match self.value_predicate(table, param, value)? {
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
            "_id" => Some("person_id"),
            "birthdate" => Some("birth_datetime"),
            "gender" => Some("gender_concept_id"),
            _ => None,
        }
    }
}
