//! Single-resource dispatch: read, create, update and delete through the
//! mapper registered for the resource type.
//!
//! Every write returns a [`WriteJournal`] recording the rows it touched, so
//! a transaction can undo it.

use std::sync::Arc;

use tracing::{debug, info};

use omopfhir_core::model::FhirResource;
use omopfhir_core::{ExternalId, IdMapper, InternalId, ResourceType};
use omopfhir_mapping::{DynMapper, MappedResource, MapperRegistry, MappingError};
use omopfhir_storage::{DynStorage, OmopEntity, OmopStorage, Operator, Predicate, StorageError, ValueType};

/// Rows touched by one write, in the order they were written.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteJournal {
    pub created: Vec<InternalId>,
    /// Pre-images of updated rows.
    pub replaced: Vec<OmopEntity>,
    pub deleted: Vec<OmopEntity>,
}

impl WriteJournal {
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.replaced.is_empty() && self.deleted.is_empty()
    }

    /// Reverts the recorded writes. Stops at the first storage failure.
    pub async fn undo(self, storage: &dyn OmopStorage) -> Result<(), StorageError> {
        for id in self.created.into_iter().rev() {
            storage.delete(id).await?;
        }
        for entity in self.replaced.into_iter().rev() {
            storage.restore(entity).await?;
        }
        for entity in self.deleted.into_iter().rev() {
            storage.restore(entity).await?;
        }
        Ok(())
    }
}

/// Result of a create or update.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    pub resource: MappedResource,
    pub journal: WriteJournal,
}

#[derive(Debug, Clone)]
pub struct FhirOmopService {
    registry: Arc<MapperRegistry>,
}

impl FhirOmopService {
    pub fn new(registry: Arc<MapperRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &MapperRegistry {
        &self.registry
    }

    pub fn storage(&self) -> &DynStorage {
        &self.registry.context().storage
    }

    pub fn ids(&self) -> &IdMapper {
        &self.registry.context().ids
    }

    /// Translates a textual id, or fails with NotFound.
    pub fn resolve_id(&self, resource_type: ResourceType, raw: &str) -> Result<InternalId, MappingError> {
        self.ids()
            .parse_and_resolve(resource_type, raw)
            .ok_or_else(|| MappingError::not_found(resource_type, raw))
    }

    /// Loads the row behind `id`. Rows excluded by the mapper's default
    /// filters, such as the diastolic half of a blood pressure, are not
    /// readable on their own.
    async fn load(&self, mapper: &DynMapper, id: InternalId) -> Result<Option<OmopEntity>, MappingError> {
        let Some(entity) = self.storage().find_by_id(id).await? else {
            return Ok(None);
        };
        let mut filters = mapper.default_predicates(id.table);
        if filters.is_empty() {
            return Ok(Some(entity));
        }
        filters.push(Predicate::compare(
            ValueType::Long,
            id.table.key_column(),
            Operator::Eq,
            id.key.to_string(),
        )?);
        if self.storage().count(id.table, &filters).await? == 0 {
            debug!(id = %id, "row hidden by default filters");
            return Ok(None);
        }
        Ok(Some(entity))
    }

    pub async fn read(&self, resource_type: ResourceType, raw_id: &str) -> Result<MappedResource, MappingError> {
        let id = self.resolve_id(resource_type, raw_id)?;
        self.read_external_internal(resource_type, id)
            .await?
            .ok_or_else(|| MappingError::not_found(resource_type, raw_id))
    }

    /// Reads the resource an external id denotes; `None` when it does not
    /// exist.
    pub async fn read_external(&self, id: ExternalId) -> Result<Option<MappedResource>, MappingError> {
        match self.ids().to_internal(&id, id.resource_type) {
            Some(internal) => self.read_external_internal(id.resource_type, internal).await,
            None => Ok(None),
        }
    }

    async fn read_external_internal(
        &self,
        resource_type: ResourceType,
        id: InternalId,
    ) -> Result<Option<MappedResource>, MappingError> {
        let mapper = self.registry.get(resource_type)?;
        match self.load(mapper, id).await? {
            Some(entity) => Ok(Some(mapper.to_resource(id, &entity).await?)),
            None => Ok(None),
        }
    }

    /// `true` when `id` denotes a stored, readable resource.
    pub async fn exists(&self, id: ExternalId) -> Result<bool, MappingError> {
        let Some(internal) = self.ids().to_internal(&id, id.resource_type) else {
            return Ok(false);
        };
        let mapper = self.registry.get(id.resource_type)?;
        Ok(self.load(mapper, internal).await?.is_some())
    }

    /// Creates the rows for `resource`. A client-supplied id is ignored.
    pub async fn create(&self, resource: &FhirResource) -> Result<WriteOutcome, MappingError> {
        let resource_type = resource.resource_type();
        let mapper = self.registry.get(resource_type)?;
        let write = mapper.to_entity(None, resource).await?;

        let mut journal = WriteJournal::default();
        let primary = self.storage().create(write.primary).await?;
        journal.created.push(primary.internal_id());
        for companion in write.companions {
            match self.storage().create(companion).await {
                Ok(row) => journal.created.push(row.internal_id()),
                Err(err) => return Err(self.abandon(journal, err.into()).await),
            }
        }

        let mapped = mapper.to_resource(primary.internal_id(), &primary).await?;
        info!(resource_type = %resource_type, id = mapped.id.id, rows = journal.created.len(), "resource created");
        Ok(WriteOutcome {
            resource: mapped,
            journal,
        })
    }

    /// Updates the resource at `raw_id` with the fields `resource` carries.
    pub async fn update(
        &self,
        resource_type: ResourceType,
        raw_id: &str,
        resource: &FhirResource,
    ) -> Result<WriteOutcome, MappingError> {
        if resource.resource_type() != resource_type {
            return Err(MappingError::validation(
                "resourceType",
                format!("expected {resource_type}, got {}", resource.resource_type()),
            ));
        }
        if let Some(body_id) = resource.id()
            && body_id != raw_id
        {
            return Err(MappingError::validation(
                "id",
                format!("body id {body_id} does not match {raw_id}"),
            ));
        }
        let id = self.resolve_id(resource_type, raw_id)?;
        let mapper = self.registry.get(resource_type)?;
        let existing = self
            .load(mapper, id)
            .await?
            .ok_or_else(|| MappingError::not_found(resource_type, raw_id))?;
        let previous = mapper.companions(&existing).await?;
        let write = mapper.to_entity(Some(id), resource).await?;

        let mut journal = WriteJournal::default();
        let primary = self.storage().update(write.primary).await?;
        journal.replaced.push(existing);
        let mut kept = Vec::with_capacity(write.companions.len());
        for companion in write.companions {
            let pre_image = previous
                .iter()
                .find(|p| p.internal_id() == companion.internal_id())
                .cloned();
            if pre_image.is_some() {
                kept.push(companion.internal_id());
            }
            let result = match pre_image {
                Some(pre_image) if companion.key() != 0 => {
                    self.storage().update(companion).await.map(|_| {
                        journal.replaced.push(pre_image);
                    })
                }
                _ => self.storage().create(companion).await.map(|row| {
                    journal.created.push(row.internal_id());
                }),
            };
            if let Err(err) = result {
                return Err(self.abandon(journal, err.into()).await);
            }
        }
        for stale in previous.iter().filter(|p| !kept.contains(&p.internal_id())) {
            match self.storage().delete(stale.internal_id()).await {
                Ok(Some(row)) => journal.deleted.push(row),
                Ok(None) => {}
                Err(err) => return Err(self.abandon(journal, err.into()).await),
            }
        }

        let mapped = mapper.to_resource(id, &primary).await?;
        info!(resource_type = %resource_type, id = raw_id, "resource updated");
        Ok(WriteOutcome {
            resource: mapped,
            journal,
        })
    }

    /// Deletes the resource at `raw_id` and its companion rows.
    pub async fn delete(&self, resource_type: ResourceType, raw_id: &str) -> Result<WriteJournal, MappingError> {
        let id = self.resolve_id(resource_type, raw_id)?;
        let mapper = self.registry.get(resource_type)?;
        let existing = self
            .load(mapper, id)
            .await?
            .ok_or_else(|| MappingError::not_found(resource_type, raw_id))?;
        let companions = mapper.companions(&existing).await?;

        let mut journal = WriteJournal::default();
        for target in std::iter::once(id).chain(companions.iter().map(OmopEntity::internal_id)) {
            match self.storage().delete(target).await {
                Ok(Some(row)) => journal.deleted.push(row),
                Ok(None) => {}
                Err(err) => return Err(self.abandon(journal, err.into()).await),
            }
        }
        info!(resource_type = %resource_type, id = raw_id, rows = journal.deleted.len(), "resource deleted");
        Ok(journal)
    }

    /// Undoes a partially applied write and hands back `err`.
    async fn abandon(&self, journal: WriteJournal, err: MappingError) -> MappingError {
        if let Err(undo) = journal.undo(self.storage().as_ref()).await {
            tracing::error!(error = %undo, "failed to undo partial write");
        }
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::OmopFhirApp;
    use crate::config::AppConfig;
    use serde_json::json;

    fn resource(value: serde_json::Value) -> FhirResource {
        FhirResource::from_value(value).unwrap()
    }

    fn blood_pressure(systolic: f64, diastolic: f64) -> FhirResource {
        resource(json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": "http://loinc.org", "code": "85354-9"}]},
            "subject": {"reference": "Patient/1"},
            "effectiveDateTime": "2022-02-03T09:30:00Z",
            "component": [
                {"code": {"coding": [{"system": "http://loinc.org", "code": "8480-6"}]},
                 "valueQuantity": {"value": systolic, "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}},
                {"code": {"coding": [{"system": "http://loinc.org", "code": "8462-4"}]},
                 "valueQuantity": {"value": diastolic, "system": "http://unitsofmeasure.org", "code": "mm[Hg]"}}
            ]
        }))
    }

    #[tokio::test]
    async fn test_companion_rows_follow_their_primary() {
        let app = OmopFhirApp::from_config(AppConfig::default());
        let service = &app.service;

        let created = service.create(&blood_pressure(120.0, 80.0)).await.unwrap();
        assert_eq!(created.journal.created.len(), 2);
        assert_eq!(app.store.len(), 2);
        let id = created.resource.id.id.to_string();

        // The diastolic half is not addressable on its own.
        let hidden = created.journal.created[1];
        let hidden_id = service
            .ids()
            .to_external(&hidden, ResourceType::Observation)
            .unwrap();
        assert!(!service.exists(hidden_id).await.unwrap());

        let updated = service
            .update(ResourceType::Observation, &id, &blood_pressure(130.0, 85.0))
            .await
            .unwrap();
        assert_eq!(updated.journal.replaced.len(), 2);
        assert_eq!(app.store.len(), 2);

        let journal = service.delete(ResourceType::Observation, &id).await.unwrap();
        assert_eq!(journal.deleted.len(), 2);
        assert!(app.store.is_empty());

        journal.undo(service.storage().as_ref()).await.unwrap();
        let read = service.read(ResourceType::Observation, &id).await.unwrap();
        let FhirResource::Observation(obs) = read.resource else {
            panic!("expected an Observation");
        };
        assert_eq!(obs.component[1].value_quantity.as_ref().unwrap().value, Some(85.0));
    }

    #[tokio::test]
    async fn test_update_drops_stale_companions() {
        let app = OmopFhirApp::from_config(AppConfig::default());
        let service = &app.service;
        let created = service.create(&blood_pressure(120.0, 80.0)).await.unwrap();
        let id = created.resource.id.id.to_string();

        let hba1c = resource(json!({
            "resourceType": "Observation",
            "code": {"coding": [{"system": "http://loinc.org", "code": "4548-4"}]},
            "subject": {"reference": "Patient/1"},
            "effectiveDateTime": "2022-02-03T09:30:00Z",
            "valueQuantity": {"value": 6.1, "system": "http://unitsofmeasure.org", "code": "%"}
        }));
        let updated = service
            .update(ResourceType::Observation, &id, &hba1c)
            .await
            .unwrap();
        assert_eq!(updated.journal.deleted.len(), 1);
        assert_eq!(app.store.len(), 1);

        let journal = service.delete(ResourceType::Observation, &id).await.unwrap();
        assert_eq!(journal.deleted.len(), 1);
        assert!(app.store.is_empty());

        // Undoing the update brings the diastolic half back.
        journal.undo(service.storage().as_ref()).await.unwrap();
        updated.journal.undo(service.storage().as_ref()).await.unwrap();
        assert_eq!(app.store.len(), 2);
        let read = service.read(ResourceType::Observation, &id).await.unwrap();
        let FhirResource::Observation(obs) = read.resource else {
            panic!("expected an Observation");
        };
        assert_eq!(obs.component.len(), 2);
    }

    #[tokio::test]
    async fn test_update_checks_ids() {
        let app = OmopFhirApp::from_config(AppConfig::default());
        let patient = resource(json!({"resourceType": "Patient", "id": "7", "birthDate": "1970"}));
        let err = app
            .service
            .update(ResourceType::Patient, "8", &patient)
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let err = app.service.read(ResourceType::Patient, "abc").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
