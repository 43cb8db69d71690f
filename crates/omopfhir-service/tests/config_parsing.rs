use std::{env, fs};

use omopfhir_mapping::MedicationRendering;
use omopfhir_service::config::loader::load_config;

#[test]
fn config_parsing_and_env_overrides_and_validation() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("omopfhir.toml");

    let toml_content = r#"
[logging]
level = "debug"

[search]
default_count = 5
max_count = 10
strict_parameters = true
base_url = "http://example.org/fhir"

[mapping]
medication_rendering = "contained"
preferred_vocabularies = ["RxNorm", "SNOMED"]

[mapping.defaults]
condition_type_concept_id = 32020

[storage]
backend = "memory"
seed_vocabulary = false
"#;
    fs::write(&path, toml_content).expect("write toml");

    // 1) Valid config parses
    let cfg = load_config(path.to_str()).expect("should parse config");
    assert_eq!(cfg.logging.level, "debug");
    assert_eq!(cfg.search.default_count, 5);
    assert_eq!(cfg.search.max_count, 10);
    assert!(cfg.search.strict_parameters);
    assert_eq!(cfg.search.base_url.as_deref(), Some("http://example.org/fhir"));
    assert_eq!(cfg.mapping.medication_rendering, MedicationRendering::Contained);
    assert_eq!(cfg.mapping.preferred_vocabularies, vec!["RxNorm", "SNOMED"]);
    assert_eq!(cfg.mapping.defaults.condition_type_concept_id, 32020);
    // untouched defaults survive a partial section
    assert_ne!(
        cfg.mapping.defaults.systolic_bp_concept_id,
        cfg.mapping.defaults.diastolic_bp_concept_id
    );
    assert!(!cfg.storage.seed_vocabulary);

    // 2) Env override should win over file
    unsafe {
        env::set_var("OMOPFHIR__SEARCH__DEFAULT_COUNT", "9");
    }
    let cfg_env = load_config(path.to_str()).expect("should parse config with env overrides");
    assert_eq!(cfg_env.search.default_count, 9);
    unsafe {
        env::remove_var("OMOPFHIR__SEARCH__DEFAULT_COUNT");
    }

    // 3) Invalid: default_count > max_count
    let invalid = toml_content.replace("default_count = 5", "default_count = 50");
    fs::write(&path, invalid).expect("write invalid toml");
    let err = load_config(path.to_str()).expect_err("validation should fail");
    assert!(
        err.to_string().contains("default_count must be <="),
        "unexpected error: {err}"
    );

    // 4) Rendering the effective config and loading it back is lossless
    let rendered = cfg.to_toml().expect("render toml");
    let rendered_path = dir.path().join("rendered.toml");
    fs::write(&rendered_path, rendered).expect("write rendered toml");
    let reloaded = load_config(rendered_path.to_str()).expect("reload rendered config");
    assert_eq!(reloaded, cfg);
}

#[test]
fn missing_explicit_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tmp dir");
    let path = dir.path().join("absent.toml");
    let cfg = load_config(path.to_str()).expect("defaults are valid");
    assert_eq!(cfg.search.max_count, 100);
    assert!(cfg.storage.seed_vocabulary);
}
