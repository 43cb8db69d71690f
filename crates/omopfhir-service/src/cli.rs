use std::path::PathBuf;

use clap::{Parser, Subcommand};

use omopfhir_core::ResourceType;

#[derive(Parser)]
#[command(name = "omopfhir")]
#[command(about = "Run FHIR reads, searches and bundles against an in-memory OMOP CDM store")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML); defaults to ./omopfhir.toml when present
    #[arg(short, long, global = true, env = "OMOPFHIR_CONFIG")]
    pub config: Option<String>,

    /// Log level or filter directive, overriding the configuration
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Batch or transaction bundle applied before the command runs
    #[arg(long = "load", global = true, value_name = "BUNDLE")]
    pub load: Vec<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Search resources, e.g. `search Condition "code=http://snomed.info/sct|44054006"`
    Search(SearchArgs),
    /// Read one resource by id
    Read(ReadArgs),
    /// Process a batch or transaction bundle and print the response bundle
    Bundle(BundleArgs),
    /// Print the effective configuration as TOML
    Config,
}

#[derive(clap::Args)]
pub struct SearchArgs {
    /// Resource type, e.g. Observation
    pub resource_type: ResourceType,
    /// Query string without the leading `?`
    #[arg(default_value = "")]
    pub query: String,
}

#[derive(clap::Args)]
pub struct ReadArgs {
    pub resource_type: ResourceType,
    pub id: String,
}

#[derive(clap::Args)]
pub struct BundleArgs {
    /// Bundle JSON file
    pub file: PathBuf,
}
