//! Orchestration for the OMOP FHIR bridge: single-resource dispatch, search,
//! batch/transaction bundles, configuration and tracing setup.
//!
//! [`OmopFhirApp`] wires the pieces together:
//!
//! ```no_run
//! use omopfhir_core::ResourceType;
//! use omopfhir_service::{AppConfig, OmopFhirApp};
//!
//! # async fn demo() -> Result<(), omopfhir_service::EngineError> {
//! let app = OmopFhirApp::from_config(AppConfig::default());
//! let outcome = app
//!     .engine
//!     .search_query(ResourceType::Condition, "code=http://snomed.info/sct|44054006")
//!     .await?;
//! println!("{} matches", outcome.total);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod config;
pub mod engine;
pub mod observability;
pub mod service;
pub mod transaction;

pub use app::OmopFhirApp;
pub use config::{AppConfig, ConfigError, SearchSettings};
pub use engine::{ChainedSearch, EngineError, SearchEngine, SearchOutcome, SearchRequest};
pub use service::{FhirOmopService, WriteJournal, WriteOutcome};
pub use transaction::{BundleError, BundleProcessor};
