//! Medication ⇄ the drug columns of `drug_exposure`.
//!
//! OMOP has no medication table, so a Medication is a view of one drug
//! exposure row and shares its id with the MedicationRequest stored there.
//! Medications are created together with their request; creating one on its
//! own is rejected. Updating one rewrites the row's drug concept.

use async_trait::async_trait;

use omopfhir_core::model::{FhirResource, Medication};
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchParam, SearchParameterType, SearchValue};
use omopfhir_storage::{OmopEntity, Predicate};

use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{code_predicate, id_predicate};

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("code", SearchParameterType::Token),
];

pub struct MedicationMapper {
    ctx: MapperContext,
}

impl MedicationMapper {
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
            "_id" => id_predicate(&self.ctx, ResourceType::Medication, table, value)?,
            "code" => {
                code_predicate(
                    &self.ctx,
                    "drug_concept_id",
                    "drug_source_value",
                    param.modifier.as_ref(),
                    value,
                )
                .await?
            }
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for MedicationMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Medication
    }

    fn binding(&self) -> TableBinding {
        TableBinding::single(OmopTable::DrugExposure)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let OmopEntity::DrugExposure(row) = entity else {
            return Err(unexpected_entity(ResourceType::Medication, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Medication)
            .ok_or_else(|| MappingError::not_found(ResourceType::Medication, id))?;
        let code = self
            .ctx
            .vocabulary
            .codeable_concept_for(row.drug_concept_id, row.drug_source_value.as_deref())
            .await?;
        let medication = Medication {
            id: Some(external.id.to_string()),
            code,
        };
        Ok(MappedResource::new(external, FhirResource::Medication(medication)))
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Medication(medication) = resource else {
            return Err(unexpected_resource(ResourceType::Medication, resource));
        };
        let Some(id) = id else {
            return Err(MappingError::validation(
                "resourceType",
                "Medication is created through a MedicationRequest",
            ));
        };
        let OmopEntity::DrugExposure(mut row) =
            load_existing(&self.ctx, ResourceType::Medication, id).await?
        else {
            return Err(MappingError::not_found(ResourceType::Medication, id));
        };
        if let Some(code) = &medication.code {
            if let Some(resolution) = self.ctx.vocabulary.resolve_codeable_concept(code).await? {
                row.drug_concept_id = resolution.concept_id();
                row.drug_source_value = Some(resolution.source().encode());
            }
        }
        Ok(EntityWrite::single(OmopEntity::DrugExposure(row)))
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

    fn sort_column(&self, table: OmopTable, field: &str) -> Option<&'static str> {
        match field {
            "_id" => Some(table.key_column()),
            "code" => Some("drug_concept_id"),
            _ => None,
        }
    }
}
