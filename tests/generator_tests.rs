//! Generate-only tests: SQL produced for each mode without touching a database

use temporal_ingest::lock::parse_timestamp;
use temporal_ingest::{
    AnsiSqlSink, BitemporalDelta, CaseConversion, DataType, Dataset, Datasets, DigestGenStrategy,
    DuckDbSink, Field, IngestError, IngestMode, IngestorOptions, NontemporalSnapshot,
    PostgresSink, RelationalGenerator, SchemaDefinition, StatisticName, TransactionMilestoning,
    UnitemporalDelta, ValidityMilestoning,
};

fn options() -> IngestorOptions {
    IngestorOptions {
        execution_timestamp: parse_timestamp("2024-03-01 10:00:00"),
        ..Default::default()
    }
}

fn datasets(fields: Vec<Field>) -> Datasets {
    Datasets::new(
        Dataset::new("main", SchemaDefinition::empty()),
        Dataset::new("staging", SchemaDefinition::new(fields).unwrap()),
    )
    .unwrap()
}

fn keyed_fields() -> Vec<Field> {
    vec![
        Field::new("id", DataType::Int).primary_key(),
        Field::new("name", DataType::Varchar),
        Field::new("digest", DataType::Varchar),
    ]
}

fn unitemporal() -> IngestMode {
    IngestMode::from(UnitemporalDelta::new(
        TransactionMilestoning::batch_id("batch_in", "batch_out"),
        DigestGenStrategy::user_provided("digest"),
    ))
}

#[test]
fn test_unitemporal_delta_statements() {
    let result = RelationalGenerator::new(unitemporal(), &AnsiSqlSink, options())
        .generate_operations(&datasets(keyed_fields()))
        .unwrap();

    assert_eq!(result.create_datasets_sql.len(), 2);
    assert!(result.create_datasets_sql[0].contains("PRIMARY KEY (\"id\", \"batch_in\")"));
    assert!(result.create_datasets_sql[1].starts_with("CREATE TABLE IF NOT EXISTS \"batch_metadata\""));

    assert_eq!(result.ingest_sql.len(), 2);
    assert!(result.ingest_sql[0].starts_with("UPDATE \"main\" as sink SET sink.\"batch_out\""));
    assert!(result.ingest_sql[1].starts_with("INSERT INTO \"main\""));

    let statistics = result.statistics_sql();
    assert!(statistics.contains_key(&StatisticName::IncomingRecordCount));
    assert!(statistics.contains_key(&StatisticName::RowsInserted));
    assert!(statistics.contains_key(&StatisticName::RowsUpdated));

    // generate-only output carries no lock or idempotency statements
    assert!(result.lock_acquire_sql.is_empty());
    assert!(result.idempotency_check_sql.is_none());
    assert!(result.max_data_split_sql.is_none());
}

#[test]
fn test_case_conversion_and_request_id() {
    let result = RelationalGenerator::new(
        unitemporal(),
        &DuckDbSink,
        IngestorOptions {
            case_conversion: CaseConversion::ToUpper,
            ingest_request_id: Some("req-7".to_string()),
            ..options()
        },
    )
    .generate_operations(&datasets(keyed_fields()))
    .unwrap();

    assert!(result.ingest_sql[1].starts_with("INSERT INTO \"MAIN\" (\"ID\", \"NAME\", \"DIGEST\""));
    assert!(result.create_datasets_sql[1].starts_with("CREATE TABLE IF NOT EXISTS \"BATCH_METADATA\""));

    let idempotency = result.idempotency_check_sql.unwrap();
    assert!(idempotency.contains("meta.\"INGEST_REQUEST_ID\" = 'req-7'"));
    assert!(idempotency.contains("as \"batchStatistics\""));
    assert!(result.metadata_ingest_sql[0].contains("'req-7'"));
}

#[test]
fn test_snapshot_replaces_main() {
    let result = RelationalGenerator::new(
        IngestMode::from(NontemporalSnapshot::default()),
        &PostgresSink,
        options(),
    )
    .generate_operations(&datasets(keyed_fields()))
    .unwrap();

    assert!(result.ingest_sql[0].starts_with("DELETE FROM \"main\""));
    assert!(result.ingest_sql.last().unwrap().starts_with("INSERT INTO \"main\""));
    assert_eq!(
        result.post_actions_sql,
        vec!["DELETE FROM \"staging\" as stage".to_string()]
    );
}

#[test]
fn test_bitemporal_uses_temp_table() {
    let mut fields = keyed_fields();
    fields.push(Field::new("valid_from", DataType::DateTime).primary_key());
    let mode = IngestMode::from(BitemporalDelta::new(
        TransactionMilestoning::batch_id("batch_in", "batch_out"),
        ValidityMilestoning::from_only("from_z", "thru_z", "valid_from"),
        DigestGenStrategy::user_provided("digest"),
    ));
    let result = RelationalGenerator::new(mode, &DuckDbSink, options())
        .generate_operations(&datasets(fields))
        .unwrap();

    assert!(result
        .pre_actions_sql
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS \"main_ingest_temp\"")));
    assert!(result
        .post_actions_sql
        .iter()
        .any(|s| s.starts_with("DROP TABLE IF EXISTS \"main_ingest_temp\"")));
    assert!(!result.post_ingest_checks_sql.is_empty());
}

#[test]
fn test_invalid_modes_are_rejected_before_sql() {
    let keyless = vec![
        Field::new("id", DataType::Int),
        Field::new("digest", DataType::Varchar),
    ];
    let err = RelationalGenerator::new(unitemporal(), &AnsiSqlSink, options())
        .generate_operations(&datasets(keyless))
        .unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));

    let mut with_milestone = keyed_fields();
    with_milestone.push(Field::new("batch_in", DataType::Int));
    let err = RelationalGenerator::new(unitemporal(), &AnsiSqlSink, options())
        .generate_operations(&datasets(with_milestone))
        .unwrap_err();
    assert!(err.to_string().contains("batch_in"));
}
