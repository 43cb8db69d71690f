//! Practitioner ⇄ `provider`.
//!
//! The first name is stored as display text in `provider_name`, so
//! structured given/family parts read back as `name[0].text`. An NPI
//! identifier goes to `npi`; any other identifier value is kept in
//! `provider_source_value`.

use async_trait::async_trait;

use omopfhir_core::model::{FhirResource, HumanName, Identifier, Practitioner};
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{
    ParamDefinition, SearchModifier, SearchParam, SearchParameterType, SearchValue,
};
use omopfhir_storage::{
    JoinOp, NO_MATCHING_CONCEPT, OmopEntity, Operator, Predicate, Provider, ValueType,
};

use crate::defaults::{GENDER_FEMALE, GENDER_MALE};
use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{id_predicate, match_nothing, string_predicate};

pub const NPI_SYSTEM: &str = "http://hl7.org/fhir/sid/us-npi";

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("name", SearchParameterType::String),
    ParamDefinition::new("identifier", SearchParameterType::Token),
    ParamDefinition::new("gender", SearchParameterType::Token),
];

pub struct PractitionerMapper {
    ctx: MapperContext,
}

impl PractitionerMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    fn identifier_predicate(
        &self,
        table: OmopTable,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let predicate = match value {
            SearchValue::Token {
                system,
                code: Some(code),
            } => {
                let column = match system.as_deref() {
                    Some(NPI_SYSTEM) => "npi",
                    Some(_) => "provider_source_value",
                    None => {
                        return Ok(Some(Predicate::new(
                            ValueType::String,
                            vec!["npi".into(), "provider_source_value".into()],
                            vec![Operator::Eq, Operator::Eq],
                            vec![code.clone(), code.clone()],
                            JoinOp::Or,
                        )?));
                    }
                };
                Predicate::compare(ValueType::String, column, Operator::Eq, code.clone())?
            }
            SearchValue::Missing(missing) => Predicate::null_check("npi", *missing)?,
            _ => match_nothing(table)?,
        };
        Ok(Some(predicate))
    }
}

fn gender_concept(code: &str) -> i64 {
    match code {
        "male" => GENDER_MALE,
        "female" => GENDER_FEMALE,
        _ => NO_MATCHING_CONCEPT,
    }
}

#[async_trait]
impl ResourceMapper for PractitionerMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Practitioner
    }

    fn binding(&self) -> TableBinding {
        TableBinding::single(OmopTable::Provider)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let OmopEntity::Provider(row) = entity else {
            return Err(unexpected_entity(ResourceType::Practitioner, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Practitioner)
            .ok_or_else(|| MappingError::not_found(ResourceType::Practitioner, id))?;

        let mut identifier = Vec::new();
        if let Some(npi) = &row.npi {
            identifier.push(Identifier {
                system: Some(NPI_SYSTEM.to_string()),
                value: Some(npi.clone()),
            });
        }
        if let Some(source) = &row.provider_source_value {
            identifier.push(Identifier {
                system: None,
                value: Some(source.clone()),
            });
        }
        let gender = match row.gender_concept_id {
            GENDER_MALE => Some("male"),
            GENDER_FEMALE => Some("female"),
            _ => row.gender_source_value.as_deref(),
        };

        let practitioner = Practitioner {
            id: Some(external.id.to_string()),
            identifier,
            name: row
                .provider_name
                .iter()
                .map(|name| HumanName {
                    text: Some(name.clone()),
                    ..Default::default()
                })
                .collect(),
            gender: gender.map(str::to_string),
        };
        Ok(MappedResource::new(
            external,
            FhirResource::Practitioner(practitioner),
        ))
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Practitioner(practitioner) = resource else {
            return Err(unexpected_resource(ResourceType::Practitioner, resource));
        };
        let name = practitioner.name.first().and_then(HumanName::display);

        let mut row = match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::Practitioner, id).await? {
                OmopEntity::Provider(row) => row,
                other => return Err(unexpected_entity(ResourceType::Practitioner, &other)),
            },
            None => {
                let name = name.clone().ok_or_else(|| MappingError::missing("name"))?;
                Provider::new(name)
            }
        };

        if let Some(name) = name {
            row.provider_name = Some(name);
        }
        for identifier in &practitioner.identifier {
            let Some(value) = identifier.value.clone() else {
                continue;
            };
            if identifier.system.as_deref() == Some(NPI_SYSTEM) {
                row.npi = Some(value);
            } else {
                row.provider_source_value = Some(value);
            }
        }
        if let Some(gender) = &practitioner.gender {
            row.gender_concept_id = gender_concept(gender);
            row.gender_source_value = Some(gender.clone());
        }

        Ok(EntityWrite::single(OmopEntity::Provider(row)))
    }

    async fn to_predicates(
        &self,
        table: OmopTable,
        param: &SearchParam,
        is_or_alternative: bool,
    ) -> Result<ParameterTranslation, MappingError> {
        if param.modifier == Some(SearchModifier::Not) {
            return Err(MappingError::unsupported_parameter(format!("{}:not", param.name)));
        }
        let mut predicates = Vec::with_capacity(param.values.len());
        for value in &param.values {
            let predicate = match param.name.as_str() {
                "_id" => Some(id_predicate(&self.ctx, ResourceType::Practitioner, table, value)?),
                "name" => Some(string_predicate(
                    "provider_name",
                    param.modifier.as_ref(),
                    value,
                )?),
                "identifier" => self.identifier_predicate(table, value)?,
                "gender" => match value {
                    SearchValue::Token {
                        code: Some(code), ..
                    } => Some(Predicate::compare(
                        ValueType::String,
                        "gender_source_value",
                        Operator::Eq,
                        code.clone(),
                    )?),
                    SearchValue::Missing(missing) => {
                        Some(Predicate::null_check("gender_source_value", *missing)?)
                    }
                    _ => None,
                },
                _ => None,
            };
            match predicate {
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
            "_id" => Some("provider_id"),
            "name" => Some("provider_name"),
            _ => None,
        }
    }
}
