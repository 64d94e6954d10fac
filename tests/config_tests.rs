//! Configuration file driven ingestion setup

use std::fs;

use tempfile::tempdir;
use temporal_ingest::config::{CONFIG_FILENAME, IngestConfig, sample_config};
use temporal_ingest::{
    AppendOnly, CaseConversion, DataType, Dataset, Datasets, DigestGenStrategy, Field, IngestMode,
    RelationalGenerator, SchemaDefinition, SinkDialect,
};

#[test]
fn test_missing_file_gives_defaults() {
    let dir = tempdir().unwrap();
    assert!(!IngestConfig::exists(dir.path()));

    let config = IngestConfig::parse("").unwrap();
    assert_eq!(config.ingest.dialect, SinkDialect::DuckDB);
    assert_eq!(config.metadata_dataset().reference.name, "batch_metadata");
}

#[test]
fn test_config_file_drives_generation() {
    let dir = tempdir().unwrap();
    fs::write(
        dir.path().join(CONFIG_FILENAME),
        r#"
[ingest]
dialect = "ansi"
case_conversion = "TO_LOWER"
batch_success_status = "SUCCEEDED"

[metadata]
table = "INGEST_LEDGER"
"#,
    )
    .unwrap();

    let config = IngestConfig::parse(&fs::read_to_string(dir.path().join(CONFIG_FILENAME)).unwrap())
        .unwrap();
    let options = config.ingestor_options();
    assert_eq!(options.case_conversion, CaseConversion::ToLower);

    let staging = SchemaDefinition::new(vec![
        Field::new("ID", DataType::Int).primary_key(),
        Field::new("DIGEST", DataType::Varchar),
    ])
    .unwrap();
    let datasets = Datasets::new(
        Dataset::new("MAIN", SchemaDefinition::empty()),
        Dataset::new("STAGING", staging),
    )
    .unwrap()
    .with_metadata(config.metadata_dataset());

    let mode = IngestMode::from(AppendOnly {
        digest: DigestGenStrategy::user_provided("DIGEST"),
        ..Default::default()
    });
    let result = RelationalGenerator::new(mode, config.sink(), options)
        .generate_operations(&datasets)
        .unwrap();

    let ledger = &result.metadata_ingest_sql[0];
    assert!(ledger.starts_with("INSERT INTO \"ingest_ledger\""));
    assert!(ledger.contains("'SUCCEEDED'"));
    assert!(result.ingest_sql[0].starts_with("INSERT INTO \"main\" (\"id\", \"digest\""));
}

#[test]
fn test_save_round_trips_sample() {
    let dir = tempdir().unwrap();
    let config = IngestConfig::parse(sample_config()).unwrap();
    config.save(dir.path()).unwrap();

    let reloaded = IngestConfig::parse(&config.to_toml().unwrap()).unwrap();
    assert_eq!(
        reloaded.ingestor_options(),
        config.ingestor_options()
    );
    assert!(IngestConfig::exists(dir.path()));
}
