//! Lookup of mappers by resource type.

use std::collections::HashMap;
use std::sync::Arc;

use omopfhir_core::ResourceType;

use crate::error::MappingError;
use crate::mapper::{DynMapper, MapperContext};
use crate::mappers::{
    ConditionMapper, EncounterMapper, MedicationMapper, MedicationRequestMapper,
    ObservationMapper, PatientMapper, PractitionerMapper,
};

/// Registered mappers, one per resource type.
#[derive(Clone)]
pub struct MapperRegistry {
    ctx: MapperContext,
    mappers: HashMap<ResourceType, DynMapper>,
}

impl std::fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapperRegistry")
            .field("resource_types", &self.resource_types())
            .finish()
    }
}

impl MapperRegistry {
    /// Empty registry sharing `ctx` with the mappers registered later.
    pub fn new(ctx: MapperContext) -> Self {
        Self {
            ctx,
            mappers: HashMap::new(),
        }
    }

    /// Registry with a mapper for every [`ResourceType`].
    pub fn standard(ctx: MapperContext) -> Self {
        let mut registry = Self::new(ctx.clone());
        registry.register(Arc::new(PatientMapper::new(ctx.clone())));
        registry.register(Arc::new(PractitionerMapper::new(ctx.clone())));
        registry.register(Arc::new(EncounterMapper::new(ctx.clone())));
        registry.register(Arc::new(ConditionMapper::new(ctx.clone())));
        registry.register(Arc::new(ObservationMapper::new(ctx.clone())));
        registry.register(Arc::new(MedicationRequestMapper::new(ctx.clone())));
        registry.register(Arc::new(MedicationMapper::new(ctx)));
        registry
    }

    /// Adds `mapper`, replacing any mapper for the same type.
    pub fn register(&mut self, mapper: DynMapper) {
        self.mappers.insert(mapper.resource_type(), mapper);
    }

    /// Mapper for `resource_type`. Asking for a type without one is a client
    /// error.
    pub fn get(&self, resource_type: ResourceType) -> Result<&DynMapper, MappingError> {
        self.mappers.get(&resource_type).ok_or_else(|| {
            MappingError::unsupported_parameter(format!("resource type {resource_type}"))
        })
    }

    /// Same as [`Self::get`] for a type name from a URL or a bundle entry.
    pub fn get_by_name(&self, name: &str) -> Result<&DynMapper, MappingError> {
        let resource_type: ResourceType = name.parse().map_err(|_| {
            MappingError::unsupported_parameter(format!("resource type {name}"))
        })?;
        self.get(resource_type)
    }

    /// Registered types in [`ResourceType::ALL`] order.
    pub fn resource_types(&self) -> Vec<ResourceType> {
        ResourceType::ALL
            .iter()
            .copied()
            .filter(|rt| self.mappers.contains_key(rt))
            .collect()
    }

    pub fn context(&self) -> &MapperContext {
        &self.ctx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::context;

    #[test]
    fn test_standard_covers_every_type() {
        let registry = MapperRegistry::standard(context());
        assert_eq!(registry.resource_types(), ResourceType::ALL.to_vec());
        for rt in ResourceType::ALL {
            assert_eq!(registry.get(rt).unwrap().resource_type(), rt);
        }
    }

    #[test]
    fn test_unknown_type_is_client_error() {
        let registry = MapperRegistry::new(context());
        let Err(err) = registry.get(ResourceType::Patient) else {
            panic!("empty registry resolved Patient");
        };
        assert_eq!(err.status_code(), 400);
        assert!(MapperRegistry::standard(context()).get_by_name("Specimen").is_err());
        assert!(MapperRegistry::standard(context()).get_by_name("Patient").is_ok());
    }
}
