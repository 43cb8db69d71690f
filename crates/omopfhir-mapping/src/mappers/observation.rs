//! Observation ⇄ `measurement` (primary) + `observation` (secondary).
//!
//! New resources go to `measurement` when the code's concept belongs to the
//! Measurement domain, or, for codes without a concept, when the value is a
//! Quantity. Everything else goes to the OMOP `observation` table. Ids of
//! `observation` rows use the secondary encoding (see
//! [`omopfhir_core::id`]), so a resource never changes table on update.
//!
//! # Blood pressure
//!
//! A panel with systolic (LOINC 8480-6) and diastolic (LOINC 8462-4)
//! components is stored as two `measurement` rows sharing subject, date and
//! time. The systolic row owns the resource id and keeps the panel coding in
//! `measurement_source_value`; the diastolic row is its companion. The
//! companion carries [`BP_COMPANION_SOURCE`] as its source value, is hidden
//! from searches and is re-joined on read. A diastolic Observation posted on
//! its own is an ordinary measurement.
//!
//! Lossy spots:
//! - type concepts: `laboratory` stores the lab type, `vital-signs` the EHR
//!   type, anything else the configured default. Reading maps the lab type
//!   back to `laboratory`, every other measurement to `vital-signs` and every
//!   `observation` row to `social-history`.
//! - `status` is not stored and reads back as `final`.
//! - only the first performer and reference range are kept.
//! - an unmapped `valueCodeableConcept` on an `observation` row is kept as
//!   `value_as_string`.

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use tracing::debug;

use omopfhir_core::model::{
    CodeableConcept, Coding, FhirResource, Observation, ObservationComponent,
    ObservationReferenceRange, Quantity,
};
use omopfhir_core::time::{format_date, render_date_time};
use omopfhir_core::{InternalId, OmopTable, ResourceType, TableBinding};
use omopfhir_search::{ParamDefinition, SearchParam, SearchParameterType, SearchValue};
use omopfhir_storage::{
    Measurement, NO_MATCHING_CONCEPT, ObservationRecord, OmopEntity, Operator, Page, Predicate,
    ValueType,
};

use crate::defaults::{EHR_TYPE_CONCEPT, LAB_TYPE_CONCEPT};
use crate::error::MappingError;
use crate::mapper::{
    EntityWrite, MappedResource, MapperContext, ParameterTranslation, ResourceMapper,
    alternatives, date_field, load_existing, unexpected_entity, unexpected_resource,
};
use crate::predicates::{
    code_predicate, date_predicate, id_predicate, match_all, match_nothing, number_predicate,
    reference_predicate, string_predicate,
};
use crate::references::{reference_key, render_reference};
use crate::vocabulary::{CodeResolution, ConceptLookup, SourceValue};

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const BP_PANEL_CODE: &str = "85354-9";
pub const SYSTOLIC_CODE: &str = "8480-6";
pub const DIASTOLIC_CODE: &str = "8462-4";
/// Source value of a diastolic companion row. Encoded codings always
/// contain `^`, so no resource-backed row carries this value.
pub const BP_COMPANION_SOURCE: &str = "bp-companion:8462-4";
pub const CATEGORY_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/observation-category";

const LABORATORY: &str = "laboratory";
const VITAL_SIGNS: &str = "vital-signs";
const SOCIAL_HISTORY: &str = "social-history";

const PARAMETERS: &[ParamDefinition] = &[
    ParamDefinition::new("_id", SearchParameterType::Token),
    ParamDefinition::new("code", SearchParameterType::Token),
    ParamDefinition::new("category", SearchParameterType::Token),
    ParamDefinition::reference("subject", &[ResourceType::Patient]),
    ParamDefinition::reference("patient", &[ResourceType::Patient]),
    ParamDefinition::reference("encounter", &[ResourceType::Encounter]),
    ParamDefinition::reference("performer", &[ResourceType::Practitioner]),
    ParamDefinition::new("date", SearchParameterType::Date),
    ParamDefinition::new("value-quantity", SearchParameterType::Number),
    ParamDefinition::new("value-string", SearchParameterType::String),
];

/// Column names of the two backing tables.
struct Columns {
    concept: &'static str,
    source: &'static str,
    date: &'static str,
    type_concept: &'static str,
}

fn columns(table: OmopTable) -> Option<Columns> {
    match table {
        OmopTable::Measurement => Some(Columns {
            concept: "measurement_concept_id",
            source: "measurement_source_value",
            date: "measurement_date",
            type_concept: "measurement_type_concept_id",
        }),
        OmopTable::Observation => Some(Columns {
            concept: "observation_concept_id",
            source: "observation_source_value",
            date: "observation_date",
            type_concept: "observation_type_concept_id",
        }),
        _ => None,
    }
}

fn category(code: &str, display: &str) -> CodeableConcept {
    CodeableConcept::from_coding(Coding::new(CATEGORY_SYSTEM, code).with_display(display))
}

fn is_blood_pressure(observation: &Observation) -> bool {
    let has = |code: &str| {
        observation
            .component
            .iter()
            .any(|c| c.code.has_code(LOINC_SYSTEM, code))
    };
    has(SYSTOLIC_CODE) && has(DIASTOLIC_CODE)
}

fn component_value<'a>(observation: &'a Observation, code: &str) -> Option<&'a Quantity> {
    observation
        .component
        .iter()
        .find(|c| c.code.has_code(LOINC_SYSTEM, code))
        .and_then(|c| c.value_quantity.as_ref())
}

/// Fields shared by both tables, parsed once per write.
struct Parsed {
    person_id: Option<i64>,
    visit_id: Option<i64>,
    provider_id: Option<i64>,
    effective: Option<(Date, Option<OffsetDateTime>)>,
    code: Option<CodeResolution>,
    category: Option<String>,
}

pub struct ObservationMapper {
    ctx: MapperContext,
}

impl ObservationMapper {
    pub fn new(ctx: MapperContext) -> Self {
        Self { ctx }
    }

    async fn parse(&self, observation: &Observation) -> Result<Parsed, MappingError> {
        let code = match &observation.code {
            Some(cc) => self.ctx.vocabulary.resolve_codeable_concept(cc).await?,
            None => None,
        };
        Ok(Parsed {
            person_id: reference_key(
                &self.ctx,
                "subject",
                observation.subject.as_ref(),
                ResourceType::Patient,
            )?,
            visit_id: reference_key(
                &self.ctx,
                "encounter",
                observation.encounter.as_ref(),
                ResourceType::Encounter,
            )?,
            provider_id: reference_key(
                &self.ctx,
                "performer",
                observation.performer.first(),
                ResourceType::Practitioner,
            )?,
            effective: date_field("effectiveDateTime", observation.effective_date_time.as_deref())?,
            code,
            category: observation
                .category
                .iter()
                .find_map(|c| c.coding_for(CATEGORY_SYSTEM))
                .and_then(|c| c.code.clone()),
        })
    }

    /// Table a new resource is written to.
    fn target_table(observation: &Observation, parsed: &Parsed) -> OmopTable {
        if is_blood_pressure(observation) {
            return OmopTable::Measurement;
        }
        match &parsed.code {
            Some(CodeResolution::Resolved { concept, .. }) if concept.domain_id == "Measurement" => {
                OmopTable::Measurement
            }
            Some(CodeResolution::Resolved { .. }) => OmopTable::Observation,
            _ if observation.value_quantity.is_some() => OmopTable::Measurement,
            _ => OmopTable::Observation,
        }
    }

    fn measurement_type(&self, category: Option<&str>) -> i64 {
        match category {
            Some(LABORATORY) => LAB_TYPE_CONCEPT,
            Some(VITAL_SIGNS) => EHR_TYPE_CONCEPT,
            _ => self.ctx.config.defaults.measurement_type_concept_id,
        }
    }

    /// Unit concept and source value of a quantity.
    async fn unit_of(&self, quantity: &Quantity) -> Result<(i64, Option<String>), MappingError> {
        let Some(code) = quantity.code.as_deref().or(quantity.unit.as_deref()) else {
            return Ok((NO_MATCHING_CONCEPT, None));
        };
        let concept_id = match quantity.system.as_deref() {
            Some(system) => match self.ctx.vocabulary.resolve_system_code(system, code).await? {
                ConceptLookup::Found(concept) => concept.concept_id,
                _ => NO_MATCHING_CONCEPT,
            },
            None => NO_MATCHING_CONCEPT,
        };
        let source = SourceValue {
            system: quantity.system.clone().unwrap_or_default(),
            code: code.to_string(),
            display: quantity.unit.clone().unwrap_or_default(),
        };
        Ok((concept_id, Some(source.encode())))
    }

    async fn quantity(
        &self,
        value: Option<f64>,
        unit_concept_id: i64,
        unit_source: Option<&str>,
    ) -> Result<Option<Quantity>, MappingError> {
        let Some(value) = value else {
            return Ok(None);
        };
        let coding = self
            .ctx
            .vocabulary
            .coding_for(unit_concept_id, unit_source)
            .await?;
        let unit_text = unit_source
            .and_then(SourceValue::parse)
            .map(|sv| sv.display)
            .filter(|d| !d.is_empty());
        Ok(Some(match coding {
            Some(coding) => Quantity {
                value: Some(value),
                unit: unit_text.or_else(|| coding.code.clone()),
                system: coding.system,
                code: coding.code,
            },
            None => Quantity {
                value: Some(value),
                unit: unit_text,
                ..Default::default()
            },
        }))
    }

    async fn write_measurement(
        &self,
        existing: Option<Measurement>,
        observation: &Observation,
        parsed: Parsed,
    ) -> Result<EntityWrite, MappingError> {
        let blood_pressure = is_blood_pressure(observation);
        let defaults = &self.ctx.config.defaults;

        let mut row = match existing {
            Some(row) => row,
            None => {
                let person_id = parsed.person_id.ok_or_else(|| MappingError::missing("subject"))?;
                let (date, _) = parsed
                    .effective
                    .ok_or_else(|| MappingError::missing("effectiveDateTime"))?;
                let concept_id = if blood_pressure {
                    defaults.systolic_bp_concept_id
                } else {
                    parsed
                        .code
                        .as_ref()
                        .ok_or_else(|| MappingError::missing("code"))?
                        .concept_id()
                };
                let mut row = Measurement::new(person_id, concept_id, date);
                row.measurement_type_concept_id = self.measurement_type(parsed.category.as_deref());
                row
            }
        };
        let companion = if blood_pressure {
            let existing = self
                .companions(&OmopEntity::Measurement(row.clone()))
                .await?
                .into_iter()
                .find_map(|entity| match entity {
                    OmopEntity::Measurement(m) => Some(m),
                    _ => None,
                });
            Some(existing.unwrap_or_else(|| {
                Measurement::new(row.person_id, defaults.diastolic_bp_concept_id, row.measurement_date)
            }))
        } else {
            None
        };

        if let Some(person_id) = parsed.person_id {
            row.person_id = person_id;
        }
        if let Some((date, datetime)) = parsed.effective {
            row.measurement_date = date;
            row.measurement_datetime = datetime;
        }
        if parsed.visit_id.is_some() {
            row.visit_occurrence_id = parsed.visit_id;
        }
        if parsed.provider_id.is_some() {
            row.provider_id = parsed.provider_id;
        }
        if parsed.category.is_some() {
            row.measurement_type_concept_id = self.measurement_type(parsed.category.as_deref());
        }
        if let Some(code) = &parsed.code {
            if !blood_pressure {
                row.measurement_concept_id = code.concept_id();
            }
            row.measurement_source_value = Some(code.source().encode());
        }

        let (value, coded) = if blood_pressure {
            row.measurement_concept_id = defaults.systolic_bp_concept_id;
            (component_value(observation, SYSTOLIC_CODE), None)
        } else {
            (observation.value_quantity.as_ref(), observation.value_codeable_concept.as_ref())
        };
        if let Some(quantity) = value {
            let (unit_concept_id, unit_source) = self.unit_of(quantity).await?;
            row.value_as_number = quantity.value;
            row.unit_concept_id = unit_concept_id;
            row.unit_source_value = unit_source;
        }
        if let Some(value) = coded {
            if let Some(resolved) = self.ctx.vocabulary.resolve_codeable_concept(value).await? {
                row.value_as_concept_id = resolved.concept_id();
                row.value_source_value = Some(resolved.source().encode());
            }
        }
        if let Some(range) = observation.reference_range.first() {
            row.range_low = range.low.as_ref().and_then(|q| q.value);
            row.range_high = range.high.as_ref().and_then(|q| q.value);
        }

        let mut companions = Vec::new();
        if let Some(mut diastolic) = companion {
            diastolic.person_id = row.person_id;
            diastolic.measurement_concept_id = defaults.diastolic_bp_concept_id;
            diastolic.measurement_date = row.measurement_date;
            diastolic.measurement_datetime = row.measurement_datetime;
            diastolic.measurement_type_concept_id = row.measurement_type_concept_id;
            diastolic.visit_occurrence_id = row.visit_occurrence_id;
            diastolic.provider_id = row.provider_id;
            diastolic.measurement_source_value = Some(BP_COMPANION_SOURCE.to_string());
            if let Some(quantity) = component_value(observation, DIASTOLIC_CODE) {
                let (unit_concept_id, unit_source) = self.unit_of(quantity).await?;
                diastolic.value_as_number = quantity.value;
                diastolic.unit_concept_id = unit_concept_id;
                diastolic.unit_source_value = unit_source;
            }
            companions.push(OmopEntity::Measurement(diastolic));
        }

        Ok(EntityWrite {
            primary: OmopEntity::Measurement(row),
            companions,
        })
    }

    async fn write_observation(
        &self,
        existing: Option<ObservationRecord>,
        observation: &Observation,
        parsed: Parsed,
    ) -> Result<EntityWrite, MappingError> {
        let mut row = match existing {
            Some(row) => row,
            None => {
                let person_id = parsed.person_id.ok_or_else(|| MappingError::missing("subject"))?;
                let code = parsed.code.as_ref().ok_or_else(|| MappingError::missing("code"))?;
                let (date, _) = parsed
                    .effective
                    .ok_or_else(|| MappingError::missing("effectiveDateTime"))?;
                let mut row = ObservationRecord::new(person_id, code.concept_id(), date);
                row.observation_type_concept_id = self.ctx.config.defaults.observation_type_concept_id;
                row
            }
        };

        if let Some(person_id) = parsed.person_id {
            row.person_id = person_id;
        }
        if let Some((date, datetime)) = parsed.effective {
            row.observation_date = date;
            row.observation_datetime = datetime;
        }
        if parsed.visit_id.is_some() {
            row.visit_occurrence_id = parsed.visit_id;
        }
        if parsed.provider_id.is_some() {
            row.provider_id = parsed.provider_id;
        }
        if let Some(code) = &parsed.code {
            row.observation_concept_id = code.concept_id();
            row.observation_source_value = Some(code.source().encode());
        }
        if let Some(quantity) = &observation.value_quantity {
            let (unit_concept_id, unit_source) = self.unit_of(quantity).await?;
            row.value_as_number = quantity.value;
            row.unit_concept_id = unit_concept_id;
            row.unit_source_value = unit_source;
        }
        if let Some(text) = &observation.value_string {
            row.value_as_string = Some(text.clone());
        }
        if let Some(value) = &observation.value_codeable_concept {
            match self.ctx.vocabulary.resolve_codeable_concept(value).await? {
                Some(CodeResolution::Resolved { concept, .. }) => {
                    row.value_as_concept_id = concept.concept_id;
                }
                Some(CodeResolution::Unresolved(source)) => {
                    debug!(code = %source, "observation value kept as text");
                    row.value_as_concept_id = NO_MATCHING_CONCEPT;
                    row.value_as_string = Some(if source.display.is_empty() {
                        source.code
                    } else {
                        source.display
                    });
                }
                None => {}
            }
        }

        Ok(EntityWrite::single(OmopEntity::Observation(row)))
    }

    async fn measurement_resource(
        &self,
        row: &Measurement,
    ) -> Result<(Observation, Option<Measurement>), MappingError> {
        let diastolic = self
            .companions(&OmopEntity::Measurement(row.clone()))
            .await?
            .into_iter()
            .find_map(|entity| match entity {
                OmopEntity::Measurement(m) => Some(m),
                _ => None,
            });

        let category = if row.measurement_type_concept_id == LAB_TYPE_CONCEPT {
            category(LABORATORY, "Laboratory")
        } else {
            category(VITAL_SIGNS, "Vital Signs")
        };
        let mut observation = Observation {
            status: Some("final".to_string()),
            category: vec![category],
            effective_date_time: render_date_time(
                Some(row.measurement_date),
                row.measurement_datetime,
            ),
            ..Default::default()
        };

        match &diastolic {
            Some(diastolic) => {
                observation.code = match row
                    .measurement_source_value
                    .as_deref()
                    .and_then(SourceValue::parse)
                    .and_then(|sv| sv.to_coding())
                {
                    Some(coding) => Some(CodeableConcept::from_coding(coding)),
                    None => Some(CodeableConcept::from_coding(Coding::new(
                        LOINC_SYSTEM,
                        BP_PANEL_CODE,
                    ))),
                };
                let mut component = Vec::with_capacity(2);
                for half in [row, diastolic] {
                    let code = self
                        .ctx
                        .vocabulary
                        .codeable_concept_for(half.measurement_concept_id, None)
                        .await?
                        .unwrap_or_default();
                    component.push(ObservationComponent {
                        code,
                        value_quantity: self
                            .quantity(
                                half.value_as_number,
                                half.unit_concept_id,
                                half.unit_source_value.as_deref(),
                            )
                            .await?,
                    });
                }
                observation.component = component;
            }
            None => {
                observation.code = self
                    .ctx
                    .vocabulary
                    .codeable_concept_for(
                        row.measurement_concept_id,
                        row.measurement_source_value.as_deref(),
                    )
                    .await?;
                observation.value_quantity = self
                    .quantity(
                        row.value_as_number,
                        row.unit_concept_id,
                        row.unit_source_value.as_deref(),
                    )
                    .await?;
                if observation.value_quantity.is_none() {
                    observation.value_codeable_concept = match row.value_as_concept_id {
                        NO_MATCHING_CONCEPT if row.value_source_value.is_none() => None,
                        concept_id => {
                            self.ctx
                                .vocabulary
                                .codeable_concept_for(concept_id, row.value_source_value.as_deref())
                                .await?
                        }
                    };
                }
            }
        }
        if row.range_low.is_some() || row.range_high.is_some() {
            let bound = |value: Option<f64>| {
                value.map(|v| Quantity {
                    value: Some(v),
                    ..Default::default()
                })
            };
            observation.reference_range = vec![ObservationReferenceRange {
                low: bound(row.range_low),
                high: bound(row.range_high),
            }];
        }
        Ok((observation, diastolic))
    }

    async fn observation_resource(&self, row: &ObservationRecord) -> Result<Observation, MappingError> {
        let code = self
            .ctx
            .vocabulary
            .codeable_concept_for(row.observation_concept_id, row.observation_source_value.as_deref())
            .await?;
        let value_codeable_concept = match row.value_as_concept_id {
            NO_MATCHING_CONCEPT => None,
            concept_id => {
                self.ctx
                    .vocabulary
                    .codeable_concept_for(concept_id, None)
                    .await?
            }
        };
        Ok(Observation {
            status: Some("final".to_string()),
            category: vec![category(SOCIAL_HISTORY, "Social History")],
            code,
            effective_date_time: render_date_time(
                Some(row.observation_date),
                row.observation_datetime,
            ),
            value_quantity: self
                .quantity(
                    row.value_as_number,
                    row.unit_concept_id,
                    row.unit_source_value.as_deref(),
                )
                .await?,
            value_string: row.value_as_string.clone(),
            value_codeable_concept,
            ..Default::default()
        })
    }

    async fn value_predicate(
        &self,
        table: OmopTable,
        param: &SearchParam,
        value: &SearchValue,
    ) -> Result<Option<Predicate>, MappingError> {
        let Some(cols) = columns(table) else {
            return Ok(None);
        };
        let predicate = match param.name.as_str() {
            "_id" => id_predicate(&self.ctx, ResourceType::Observation, table, value)?,
            "code" => {
                code_predicate(&self.ctx, cols.concept, cols.source, param.modifier.as_ref(), value)
                    .await?
            }
            "category" => {
                let SearchValue::Token {
                    code: Some(code), ..
                } = value
                else {
                    return Ok(None);
                };
                match (table, code.as_str()) {
                    (OmopTable::Measurement, LABORATORY) => Predicate::compare(
                        ValueType::Long,
                        cols.type_concept,
                        Operator::Eq,
                        LAB_TYPE_CONCEPT.to_string(),
                    )?,
                    (OmopTable::Measurement, VITAL_SIGNS) => Predicate::compare(
                        ValueType::Long,
                        cols.type_concept,
                        Operator::Ne,
                        LAB_TYPE_CONCEPT.to_string(),
                    )?,
                    (OmopTable::Observation, SOCIAL_HISTORY) => match_all(table)?,
                    _ => match_nothing(table)?,
                }
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
            "performer" => reference_predicate(
                &self.ctx,
                table,
                "provider_id",
                ResourceType::Practitioner,
                value,
            )?,
            "date" => date_predicate(cols.date, value)?,
            "value-quantity" => number_predicate("value_as_number", value)?,
            "value-string" => match (table, value) {
                (OmopTable::Observation, _) => {
                    string_predicate("value_as_string", param.modifier.as_ref(), value)?
                }
                (_, SearchValue::Missing(true)) => match_all(table)?,
                _ => match_nothing(table)?,
            },
            _ => return Ok(None),
        };
        Ok(Some(predicate))
    }
}

#[async_trait]
impl ResourceMapper for ObservationMapper {
    fn resource_type(&self) -> ResourceType {
        ResourceType::Observation
    }

    fn binding(&self) -> TableBinding {
        TableBinding::split(OmopTable::Measurement, OmopTable::Observation)
    }

    fn supported_parameters(&self) -> &'static [ParamDefinition] {
        PARAMETERS
    }

    async fn to_resource(
        &self,
        id: InternalId,
        entity: &OmopEntity,
    ) -> Result<MappedResource, MappingError> {
        let external = self
            .ctx
            .ids
            .to_external(&id, ResourceType::Observation)
            .ok_or_else(|| MappingError::not_found(ResourceType::Observation, id))?;
        let (mut observation, person_id, visit_id, provider_id) = match entity {
            OmopEntity::Measurement(row) => {
                let (observation, _) = self.measurement_resource(row).await?;
                (observation, row.person_id, row.visit_occurrence_id, row.provider_id)
            }
            OmopEntity::Observation(row) => (
                self.observation_resource(row).await?,
                row.person_id,
                row.visit_occurrence_id,
                row.provider_id,
            ),
            other => return Err(unexpected_entity(ResourceType::Observation, other)),
        };

        let subject = render_reference(&self.ctx, ResourceType::Patient, Some(person_id));
        let encounter = render_reference(&self.ctx, ResourceType::Encounter, visit_id);
        let performer = render_reference(&self.ctx, ResourceType::Practitioner, provider_id);
        observation.id = Some(external.id.to_string());
        observation.subject = subject.as_ref().map(|(r, _)| r.clone());
        observation.encounter = encounter.as_ref().map(|(r, _)| r.clone());
        observation.performer = performer.iter().map(|(r, _)| r.clone()).collect();

        let mut mapped = MappedResource::new(external, FhirResource::Observation(observation));
        let subject = subject.map(|(_, target)| target);
        mapped.add_reference("subject", subject);
        mapped.add_reference("patient", subject);
        mapped.add_reference("encounter", encounter.map(|(_, target)| target));
        mapped.add_reference("performer", performer.map(|(_, target)| target));
        Ok(mapped)
    }

    async fn to_entity(
        &self,
        id: Option<InternalId>,
        resource: &FhirResource,
    ) -> Result<EntityWrite, MappingError> {
        let FhirResource::Observation(observation) = resource else {
            return Err(unexpected_resource(ResourceType::Observation, resource));
        };
        let parsed = self.parse(observation).await?;

        match id {
            Some(id) => match load_existing(&self.ctx, ResourceType::Observation, id).await? {
                OmopEntity::Measurement(row) => {
                    self.write_measurement(Some(row), observation, parsed).await
                }
                OmopEntity::Observation(row) => {
                    self.write_observation(Some(row), observation, parsed).await
                }
                other => Err(unexpected_entity(ResourceType::Observation, &other)),
            },
            None => match Self::target_table(observation, &parsed) {
                OmopTable::Measurement => self.write_measurement(None, observation, parsed).await,
                _ => self.write_observation(None, observation, parsed).await,
            },
        }
    }

    /// The diastolic half of a systolic measurement, matched by subject,
    /// date and time. Among several candidates the first one written after
    /// the systolic row wins.
    async fn companions(&self, entity: &OmopEntity) -> Result<Vec<OmopEntity>, MappingError> {
        let defaults = &self.ctx.config.defaults;
        let OmopEntity::Measurement(row) = entity else {
            return Ok(Vec::new());
        };
        if row.measurement_concept_id != defaults.systolic_bp_concept_id || row.measurement_id == 0 {
            return Ok(Vec::new());
        }
        let predicates = vec![
            Predicate::compare(
                ValueType::Long,
                "person_id",
                Operator::Eq,
                row.person_id.to_string(),
            )?,
            Predicate::compare(
                ValueType::Long,
                "measurement_concept_id",
                Operator::Eq,
                defaults.diastolic_bp_concept_id.to_string(),
            )?,
            Predicate::compare(
                ValueType::Date,
                "measurement_date",
                Operator::Eq,
                format_date(row.measurement_date),
            )?,
            Predicate::compare(
                ValueType::String,
                "measurement_source_value",
                Operator::Eq,
                BP_COMPANION_SOURCE,
            )?,
        ];
        let candidates = self
            .ctx
            .storage
            .search(OmopTable::Measurement, &predicates, Page::from_offset(0), &[])
            .await?;
        let companion = candidates
            .into_iter()
            .filter_map(|entity| match entity {
                OmopEntity::Measurement(m) if m.measurement_datetime == row.measurement_datetime => {
                    Some(m)
                }
                _ => None,
            })
            .min_by_key(|m| (m.measurement_id < row.measurement_id, m.measurement_id));
        Ok(companion.map(OmopEntity::Measurement).into_iter().collect())
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

    /// Companion rows are only reachable through their systolic row.
    fn default_predicates(&self, table: OmopTable) -> Vec<Predicate> {
        if table != OmopTable::Measurement {
            return Vec::new();
        }
        // `<>` alone would drop rows without a source value.
        let untagged = Predicate::null_check("measurement_source_value", true).and_then(|unset| {
            let other = Predicate::compare(
                ValueType::String,
                "measurement_source_value",
                Operator::Ne,
                BP_COMPANION_SOURCE,
            )?;
            Ok(vec![unset, other.alternative(true)])
        });
        untagged.unwrap_or_default()
    }

    fn sort_column(&self, table: OmopTable, field: &str) -> Option<&'static str> {
        let cols = columns(table)?;
        match field {
            "_id" => Some(table.key_column()),
            "date" => Some(cols.date),
            "code" => Some(cols.concept),
            "value-quantity" => Some("value_as_number"),
            "subject" | "patient" => Some("person_id"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{context, context_with, store};
    use omopfhir_db_memory::fixtures::{
        LOINC_DIASTOLIC_BP, LOINC_HBA1C, LOINC_SMOKING_STATUS, LOINC_SYSTOLIC_BP, UCUM_MM_HG,
        UCUM_PERCENT,
    };
    use omopfhir_storage::OmopStorage;
    use serde_json::json;

    fn observation(value: serde_json::Value) -> FhirResource {
        FhirResource::from_value(value).unwrap()
    }

    fn blood_pressure() -> FhirResource {
        observation(json!({
            "resourceType": "Observation",
            "status": "final",
            "category": [{"coding": [{"system": CATEGORY_SYSTEM, "code": "vital-signs"}]}],
            "code": {"coding": [{"system": LOINC_SYSTEM, "code": BP_PANEL_CODE, "display": "Blood pressure panel"}]},
            "subject": {"reference": "Patient/1"},
            "effectiveDateTime": "2022-02-03T09:30:00Z",
            "component": [
                {
                    "code": {"coding": [{"system": LOINC_SYSTEM, "code": SYSTOLIC_CODE}]},
                    "valueQuantity": {"value": 128.0, "unit": "mmHg", "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}
                },
                {
                    "code": {"coding": [{"system": LOINC_SYSTEM, "code": DIASTOLIC_CODE}]},
                    "valueQuantity": {"value": 84.0, "unit": "mmHg", "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}
                }
            ]
        }))
    }

    /// Writes `resource` the way the service does: primary first, then
    /// companions.
    async fn persist(
        store: &omopfhir_db_memory::InMemoryOmopStore,
        write: EntityWrite,
    ) -> OmopEntity {
        let primary = store.create(write.primary).await.unwrap();
        for companion in write.companions {
            store.create(companion).await.unwrap();
        }
        primary
    }

    #[tokio::test]
    async fn test_blood_pressure_split_and_rejoin() {
        let store = store();
        let mapper = ObservationMapper::new(context_with(store.clone(), Default::default()));

        let write = mapper.to_entity(None, &blood_pressure()).await.unwrap();
        assert_eq!(write.companions.len(), 1);
        let OmopEntity::Measurement(systolic) = &write.primary else {
            panic!("expected a measurement row");
        };
        assert_eq!(systolic.measurement_concept_id, LOINC_SYSTOLIC_BP);
        assert_eq!(systolic.value_as_number, Some(128.0));
        assert_eq!(systolic.unit_concept_id, UCUM_MM_HG);
        let OmopEntity::Measurement(diastolic) = &write.companions[0] else {
            panic!("expected a measurement companion");
        };
        assert_eq!(diastolic.measurement_concept_id, LOINC_DIASTOLIC_BP);
        assert_eq!(diastolic.value_as_number, Some(84.0));
        assert_eq!(diastolic.measurement_datetime, systolic.measurement_datetime);
        assert_eq!(diastolic.measurement_source_value.as_deref(), Some(BP_COMPANION_SOURCE));

        let primary = persist(&store, write).await;
        let mapped = mapper
            .to_resource(primary.internal_id(), &primary)
            .await
            .unwrap();
        let FhirResource::Observation(back) = mapped.resource else {
            panic!("expected an Observation");
        };
        assert!(back.code.as_ref().unwrap().has_code(LOINC_SYSTEM, BP_PANEL_CODE));
        assert_eq!(back.category[0].coding[0].code.as_deref(), Some("vital-signs"));
        assert_eq!(back.effective_date_time.as_deref(), Some("2022-02-03T09:30:00Z"));
        assert_eq!(back.component.len(), 2);
        assert!(back.component[0].code.has_code(LOINC_SYSTEM, SYSTOLIC_CODE));
        assert!(back.component[1].code.has_code(LOINC_SYSTEM, DIASTOLIC_CODE));
        let diastolic_value = back.component[1].value_quantity.as_ref().unwrap();
        assert_eq!(diastolic_value.value, Some(84.0));
        assert_eq!(diastolic_value.unit.as_deref(), Some("mmHg"));
        assert_eq!(diastolic_value.code.as_deref(), Some("mm[Hg]"));
    }

    #[tokio::test]
    async fn test_blood_pressure_update_rewrites_both_halves() {
        let store = store();
        let mapper = ObservationMapper::new(context_with(store.clone(), Default::default()));
        let primary = persist(&store, mapper.to_entity(None, &blood_pressure()).await.unwrap()).await;

        let mut value = blood_pressure().to_value().unwrap();
        value["component"][1]["valueQuantity"]["value"] = json!(90.0);
        let write = mapper
            .to_entity(Some(primary.internal_id()), &observation(value))
            .await
            .unwrap();
        assert_eq!(write.primary.key(), primary.key());
        let OmopEntity::Measurement(diastolic) = &write.companions[0] else {
            panic!("expected a measurement companion");
        };
        assert_ne!(diastolic.measurement_id, 0);
        assert_eq!(diastolic.value_as_number, Some(90.0));
    }

    #[tokio::test]
    async fn test_table_choice_and_id_encoding() {
        let store = store();
        let mapper = ObservationMapper::new(context_with(store.clone(), Default::default()));

        let lab = observation(json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": LOINC_SYSTEM, "code": "4548-4"}]},
            "subject": {"reference": "Patient/1"},
            "effectiveDateTime": "2022-01-01",
            "valueQuantity": {"value": 6.1, "unit": "%", "system": "http://unitsofmeasure.org", "code": "%"}
        }));
        let smoking = observation(json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": LOINC_SYSTEM, "code": "72166-2"}]},
            "subject": {"reference": "Patient/1"},
            "effectiveDateTime": "2022-01-01",
            "valueString": "Never smoker"
        }));

        let lab_row = persist(&store, mapper.to_entity(None, &lab).await.unwrap()).await;
        let smoking_row = persist(&store, mapper.to_entity(None, &smoking).await.unwrap()).await;
        assert_eq!(lab_row.table(), OmopTable::Measurement);
        assert_eq!(smoking_row.table(), OmopTable::Observation);
        // Both tables start their keys at 1.
        assert_eq!(lab_row.key(), smoking_row.key());

        let lab_mapped = mapper.to_resource(lab_row.internal_id(), &lab_row).await.unwrap();
        let smoking_mapped = mapper
            .to_resource(smoking_row.internal_id(), &smoking_row)
            .await
            .unwrap();
        assert_ne!(lab_mapped.id, smoking_mapped.id);
        assert!(smoking_mapped.id.id < 0);

        let OmopEntity::Measurement(row) = &lab_row else {
            panic!("expected a measurement row");
        };
        assert_eq!(row.measurement_concept_id, LOINC_HBA1C);
        assert_eq!(row.unit_concept_id, UCUM_PERCENT);
        // Lossy: the lab type comes from configuration.
        assert_eq!(row.measurement_type_concept_id, LAB_TYPE_CONCEPT);
        let OmopEntity::Observation(row) = &smoking_row else {
            panic!("expected an observation row");
        };
        assert_eq!(row.observation_concept_id, LOINC_SMOKING_STATUS);
        let FhirResource::Observation(back) = smoking_mapped.resource else {
            panic!("expected an Observation");
        };
        assert_eq!(back.value_string.as_deref(), Some("Never smoker"));
    }

    #[tokio::test]
    async fn test_search_is_per_table() {
        let mapper = ObservationMapper::new(context());
        let category = SearchParam::token("category", Some(CATEGORY_SYSTEM), "social-history");
        let ParameterTranslation::Predicates(on_measurement) = mapper
            .to_predicates(OmopTable::Measurement, &category, false)
            .await
            .unwrap()
        else {
            panic!("category is supported");
        };
        assert_eq!(on_measurement[0].operators, vec![Operator::IsNull]);

        let code = SearchParam::token("code", Some(LOINC_SYSTEM), "72166-2");
        let ParameterTranslation::Predicates(on_observation) = mapper
            .to_predicates(OmopTable::Observation, &code, false)
            .await
            .unwrap()
        else {
            panic!("code is supported");
        };
        assert_eq!(on_observation[0].column_paths, vec!["observation_concept_id"]);
        assert_eq!(on_observation[0].values, vec![LOINC_SMOKING_STATUS.to_string()]);

        let hidden = mapper.default_predicates(OmopTable::Measurement);
        assert_eq!(hidden.len(), 2);
        assert_eq!(hidden[0].operators, vec![Operator::IsNull]);
        assert_eq!(hidden[1].operators, vec![Operator::Ne]);
        assert_eq!(hidden[1].values, vec![BP_COMPANION_SOURCE.to_string()]);
        assert!(mapper.default_predicates(OmopTable::Observation).is_empty());
        assert_eq!(
            mapper.sort_column(OmopTable::Observation, "date"),
            Some("observation_date")
        );
    }

    #[tokio::test]
    async fn test_required_fields_on_create() {
        let mapper = ObservationMapper::new(context());
        let err = mapper
            .to_entity(
                None,
                &observation(json!({
                    "resourceType": "Observation",
                    "code": {"coding": [{"system": LOINC_SYSTEM, "code": "8867-4"}]},
                    "effectiveDateTime": "2022-01-01"
                })),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MappingError::Validation { ref field, .. } if field == "subject"));
    }
}
