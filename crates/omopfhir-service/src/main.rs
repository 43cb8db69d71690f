mod cli;

use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;

use omopfhir_core::model::Bundle;
use omopfhir_service::OmopFhirApp;
use omopfhir_service::config::loader::load_config;
use omopfhir_service::observability::{apply_logging_level, init_tracing};

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_deref().unwrap_or("warn"));

    let config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if cli.log_level.is_none() {
        apply_logging_level(&config.logging.level);
    }
    if let Commands::Config = cli.command {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let app = OmopFhirApp::from_config(config);
    for path in &cli.load {
        let bundle = read_bundle(path)?;
        app.bundles
            .process(&bundle)
            .await
            .with_context(|| format!("failed to load {}", path.display()))?;
        tracing::info!(path = %path.display(), rows = app.store.len(), "bundle loaded");
    }

    let output: Value = match &cli.command {
        Commands::Search(args) => {
            let outcome = app
                .engine
                .search_query(args.resource_type, &args.query)
                .await
                .with_context(|| format!("search on {} failed", args.resource_type))?;
            serde_json::to_value(outcome.to_bundle()?)?
        }
        Commands::Read(args) => app
            .service
            .read(args.resource_type, &args.id)
            .await?
            .resource
            .to_value()?,
        Commands::Bundle(args) => {
            let bundle = read_bundle(&args.file)?;
            serde_json::to_value(app.bundles.process(&bundle).await?)?
        }
        Commands::Config => return Ok(()),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read_bundle(path: &Path) -> Result<Bundle> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a FHIR Bundle", path.display()))
}
