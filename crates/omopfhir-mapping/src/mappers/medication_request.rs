//! MedicationRequest ⇄ `drug_exposure`.
//!
//! | FHIR | OMOP |
//! |---|---|
//! | `medication[x]` | `drug_concept_id`, `drug_source_value` |
//! | `subject` | `person_id` |
//! | `encounter` | `visit_occurrence_id` |
//! | `requester` | `provider_id` |
//! | `authoredOn` | `drug_exposure_start_date`, `drug_exposure_start_datetime` |
//! | `dosageInstruction[0].text` | `sig` |
//! | `dosageInstruction[0].route` | `route_concept_id`, `route_source_value` |
//! | `dispenseRequest.quantity.value` | `quantity` |
//! | `dispenseRequest.numberOfRepeatsAllowed` | `refills` |
//!
//! The medication may arrive as a CodeableConcept, as a `#id` reference into
//! `contained`, or as a reference to an existing `Medication`, whose drug
//! concept is copied. It is rendered according to
//! [`MedicationRendering`](crate::defaults::MedicationRendering).
//!
//! Lossy spots: `status` and `intent` are not stored and read back as
//! `active` and `order`; only the first dosage instruction survives.

use async_trait::async_trait;

use omopfhir_core::model::{
    CodeableConcept, DispenseRequest, Dosage, FhirResource, Medication, MedicationRequest,
    Quantity, Reference,
};
use omopfhir_core::time::render_date_time;
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchParam, SearchParameterType, SearchValue};
use omopfhir_storage::{DrugExposure, NO_MATCHING_CONCEPT, OmopEntity, Predicate};

use crate::defaults::MedicationRendering;
use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, date_field, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{code_predicate, date_predicate, id_predicate, reference_predicate};
use crate::references::{reference_key, render_reference};

/// Local id of the contained Medication in
/// [`MedicationRendering::Contained`] mode.
pub const CONTAINED_MEDICATION_ID: &str = "med";

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("code", SearchParameterType::Token),
    ParamDefinition::reference("subject", &[ResourceType::Patient]),
    ParamDefinition::reference("patient", &[ResourceType::Patient]),
    ParamDefinition::reference("encounter", &[ResourceType::Encounter]),
    ParamDefinition::reference("requester", &[ResourceType::Practitioner]),
    ParamDefinition::reference("medication", &[ResourceType::Medication]),
    ParamDefinition::new("authoredon", SearchParameterType::Date),
];

/// Drug concept and source value of the requested medication.
struct DrugCode {
    concept_id: i64,
    source_value: Option<String>,
}

pub struct MedicationRequestMapper {
    ctx: MapperContext,
}

impl MedicationRequestMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    async fn code_of(&self, concept: &CodeableConcept) -> Result<Option<DrugCode>, MappingError> {
        Ok(self
            .ctx
            .vocabulary
            .resolve_codeable_concept(concept)
            .await?
            .map(|resolution| DrugCode {
                concept_id: resolution.concept_id(),
                source_value: Some(resolution.source().encode()),
            }))
    }

    async fn medication(&self, request: &MedicationRequest) -> Result<Option<DrugCode>, MappingError> {
        if let Some(concept) = &request.medication_codeable_concept {
            return self.code_of(concept).await;
        }
        let Some(raw) = request.medication_reference.as_ref().and_then(Reference::target) else {
            return Ok(None);
        };

        if let Some(local) = raw.strip_prefix('#') {
            let contained = request.contained.iter().find_map(|resource| match resource {
                FhirResource::Medication(m) if m.id.as_deref() == Some(local) => Some(m),
                _ => None,
            });
            let Some(medication) = contained else {
                return Err(MappingError::unresolvable_reference(raw));
            };
            return match &medication.code {
                Some(code) => self.code_of(code).await,
                None => Err(MappingError::missing("contained Medication.code")),
            };
        }

        let key = reference_key(
            &self.ctx,
            "medicationReference",
            request.medication_reference.as_ref(),
            ResourceType::Medication,
        )?;
        let Some(key) = key else {
            return Ok(None);
        };
        match self
            .ctx
            .storage
            .find_by_id(InternalId::new(OmopTable::DrugExposure, key))
            .await?
        {
            Some(OmopEntity::DrugExposure(row)) => Ok(Some(DrugCode {
                concept_id: row.drug_concept_id,
                source_value: row.drug_source_value,
            })),
            _ => Err(MappingError::unresolvable_reference(raw)),
        }
    }

    async fn render_medication(
        &self,
        row: &DrugExposure,
        request: &mut MedicationRequest,
        id: InternalId,
    ) -> Result<Option<Reference>, MappingError> {
        let code = self
            .ctx
            .vocabulary
            .codeable_concept_for(row.drug_concept_id, row.drug_source_value.as_deref())
            .await?;
        let display = code
            .as_ref()
            .and_then(|c| c.coding.first())
            .and_then(|c| c.display.clone())
            .or_else(|| code.as_ref().and_then(|c| c.text.clone()));

        match self.ctx.config.medication_rendering {
            MedicationRendering::Reference => {
                let Some(external) = self.ctx.ids.to_external(&id, ResourceType::Medication) else {
                    return Ok(None);
                };
                let reference = Reference {
                    reference: Some(external.to_reference()),
                    display,
                };
                request.medication_reference = Some(reference.clone());
                Ok(Some(reference))
            }
            MedicationRendering::Contained => {
                request.contained = vec![FhirResource::Medication(Medication {
                    id: Some(CONTAINED_MEDICATION_ID.to_string()),
                    code,
                })];
                request.medication_reference = Some(Reference {
                    reference: Some(format!("#{CONTAINED_MEDICATION_ID}")),
                    display,
                });
                Ok(None)
            }
        }
    }

    async fn value_predicate(
        &self,
        table: OmopTable,
        param: &SearchParam,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let predicate = match param.name.as_str() {
            "_id" => id_predicate(&self.ctx, ResourceType::MedicationRequest, table, value)?,
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
            "requester" => reference_predicate(
                &self.ctx,
                table,
                "provider_id",
                ResourceType::Practitioner,
                value,
            )?,
            // A request and its Medication share the row.
            "medication" => reference_predicate(
                &self.ctx,
                table,
                table.key_column(),
                ResourceType::Medication,
                value,
            )?,
            "authoredon" => date_predicate("drug_exposure_start_date", value)?,
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for MedicationRequestMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::MedicationRequest
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
            return Err(unexpected_entity(ResourceType::MedicationRequest, entity));
        };
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::MedicationRequest)
            .ok_or_else(|| MappingError::not_found(ResourceType::MedicationRequest, id))?;

        let subject = render_reference(&self.ctx, ResourceType::Patient, Some(row.person_id));
        let encounter =
            render_reference(&self.ctx, ResourceType::Encounter, row.visit_occurrence_id);
        let requester = render_reference(&self.ctx, ResourceType::Practitioner, row.provider_id);
        let route = self
            .ctx
            .vocabulary
            .codeable_concept_for(row.route_concept_id, row.route_source_value.as_deref())
            .await?;

        let mut request = MedicationRequest {
            id: Some(external.id.to_string()),
            status: Some("active".to_string()),
            intent: Some("order".to_string()),
            subject: subject.as_ref().map(|(r, _)| r.clone()),
            encounter: encounter.as_ref().map(|(r, _)| r.clone()),
            requester: requester.as_ref().map(|(r, _)| r.clone()),
            authored_on: render_date_time(
                Some(row.drug_exposure_start_date),
                row.drug_exposure_start_datetime,
            ),
            ..Default::default()
        };
        if row.sig.is_some() || route.is_some() {
            request.dosage_instruction = vec![Dosage {
                text: row.sig.clone(),
                route,
            }];
        }
        if row.quantity.is_some() || row.refills.is_some() {
            request.dispense_request = Some(DispenseRequest {
                number_of_repeats_allowed: row.refills.and_then(|r| u32::try_from(r).ok()),
                quantity: row.quantity.map(|value| Quantity {
                    value: Some(value),
                    ..Default::default()
                }),
            });
        }
        let medication = self.render_medication(row, &mut request, id).await?;

        let mut mapped = MappedResource::new(external, FhirResource::MedicationRequest(request));
        let subject = subject.map(|(_, target)| target);
        mapped.add_reference("subject", subject);
        mapped.add_reference("patient", subject);
        mapped.add_reference("encounter", encounter.map(|(_, target)| target));
        mapped.add_reference("requester", requester.map(|(_, target)| target));
        if medication.is_some() {
            mapped.add_reference("medication", self.ctx.ids.to_external(&id, ResourceType::Medication));
        }
        Ok(mapped)
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::MedicationRequest(request) = resource else {
            return Err(unexpected_resource(ResourceType::MedicationRequest, resource));
        };

        let person_id = reference_key(
            &self.ctx,
            "subject",
            request.subject.as_ref(),
            ResourceType::Patient,
        )?;
        let visit_id = reference_key(
            &self.ctx,
            "encounter",
            request.encounter.as_ref(),
            ResourceType::Encounter,
        )?;
        let provider_id = reference_key(
            &self.ctx,
            "requester",
            request.requester.as_ref(),
            ResourceType::Practitioner,
        )?;
        let authored = date_field("authoredOn", request.authored_on.as_deref())?;
        let drug = self.medication(request).await?;

        let mut row = match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::MedicationRequest, id).await? {
                OmopEntity::DrugExposure(row) => row,
                other => return Err(unexpected_entity(ResourceType::MedicationRequest, &other)),
            },
            None => {
                let person_id = person_id.ok_or_else(|| MappingError::missing("subject"))?;
                let (start, _) = authored.ok_or_else(|| MappingError::missing("authoredOn"))?;
                let drug = drug
                    .as_ref()
                    .ok_or_else(|| MappingError::missing("medication[x]"))?;
                let mut row = DrugExposure::new(person_id, drug.concept_id, start);
                row.drug_type_concept_id = self.ctx.config.defaults.drug_type_concept_id;
                row
            }
        };

        if let Some(person_id) = person_id {
            row.person_id = person_id;
        }
        if let Some((date, datetime)) = authored {
            row.drug_exposure_start_date = date;
            row.drug_exposure_start_datetime = datetime;
        }
        if let Some(drug) = drug {
            row.drug_concept_id = drug.concept_id;
            row.drug_source_value = drug.source_value;
        }
        if visit_id.is_some() {
            row.visit_occurrence_id = visit_id;
        }
        if provider_id.is_some() {
            row.provider_id = provider_id;
        }
        if let Some(dosage) = request.dosage_instruction.first() {
            if dosage.text.is_some() {
                row.sig = dosage.text.clone();
            }
            if let Some(route) = &dosage.route {
                if let Some(code) = self.code_of(route).await? {
                    row.route_concept_id = code.concept_id;
                    row.route_source_value = code.source_value;
                }
            }
        }
        if let Some(dispense) = &request.dispense_request {
            if let Some(quantity) = dispense.quantity.as_ref().and_then(|q| q.value) {
                if quantity < 0.0 {
                    return Err(MappingError::validation(
                        "dispenseRequest.quantity",
                        "quantity cannot be negative",
                    ));
                }
                row.quantity = Some(quantity);
            }
            if let Some(repeats) = dispense.number_of_repeats_allowed {
                row.refills = Some(i32::try_from(repeats).map_err(|_| {
                    MappingError::validation(
                        "dispenseRequest.numberOfRepeatsAllowed",
                        "too many repeats",
                    )
                })?);
            }
        }
        if row.drug_concept_id == NO_MATCHING_CONCEPT && row.drug_source_value.is_none() {
            return Err(MappingError::missing("medication[x]"));
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
            "authoredon" => Some("drug_exposure_start_date"),
            "code" => Some("drug_concept_id"),
            "subject" | "patient" => Some("person_id"),
            _ => None,
        }
    }
}
