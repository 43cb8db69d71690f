//! Dependency wiring.
//!
//! Every collaborator is built once here and handed down explicitly; no
//! component looks up its own dependencies.

use std::sync::Arc;

use tracing::info;

use omopfhir_core::IdMapper;
use omopfhir_db_memory::InMemoryOmopStore;
use omopfhir_mapping::{MapperContext, MapperRegistry, VocabularyTranslator};
use omopfhir_storage::{DynConceptStore, DynStorage, OmopStorage};

use crate::config::{AppConfig, StorageBackend};
use crate::engine::SearchEngine;
use crate::service::FhirOmopService;
use crate::transaction::BundleProcessor;

#[derive(Debug, Clone)]
pub struct OmopFhirApp {
    pub config: Arc<AppConfig>,
    pub store: Arc<InMemoryOmopStore>,
    pub service: FhirOmopService,
    pub engine: SearchEngine,
    pub bundles: BundleProcessor,
}

impl OmopFhirApp {
    /// Builds the application over a fresh store for `config.storage`.
    pub fn from_config(config: AppConfig) -> Self {
        let store = match config.storage.backend {
            StorageBackend::Memory if config.storage.seed_vocabulary => {
                InMemoryOmopStore::with_fixture_vocabulary()
            }
            StorageBackend::Memory => InMemoryOmopStore::new(),
        };
        Self::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: AppConfig, store: Arc<InMemoryOmopStore>) -> Self {
        let concepts: DynConceptStore = store.clone();
        let storage: DynStorage = store.clone();
        let vocabulary = VocabularyTranslator::shared(
            concepts,
            config.mapping.preferred_vocabularies.clone(),
        );
        let context = MapperContext::new(
            Arc::new(IdMapper::new()),
            vocabulary,
            storage,
            Arc::new(config.mapping.clone()),
        )
        .with_base_url(config.search.base_url.clone());

        let registry = Arc::new(MapperRegistry::standard(context));
        let service = FhirOmopService::new(registry);
        let engine = SearchEngine::new(service.clone(), config.search.clone());
        let bundles = BundleProcessor::new(engine.clone(), config.search.base_url.clone());
        info!(
            backend = store.backend_name(),
            resource_types = service.registry().resource_types().len(),
            "application initialized"
        );

        Self {
            config: Arc::new(config),
            store,
            service,
            engine,
            bundles,
        }
    }
}
