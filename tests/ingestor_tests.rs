//! Orchestration tests for the ingestion runtime against a recording executor

use std::collections::BTreeSet;

use temporal_ingest::executor::{QueryResult, RecordingExecutor};
use temporal_ingest::ingestor::IngestStatus;
use temporal_ingest::lock::parse_timestamp;
use temporal_ingest::{
    AppendOnly, DataErrorKind, DataSplitRange, DataType, Dataset, Datasets,
    DeduplicationStrategy, DigestGenStrategy, DuckDbSink, Field, IngestError, IngestMode,
    IngestorOptions, RelationalIngestor, SchemaDefinition, SchemaEvolutionCapability,
    StatisticName, VersioningStrategy,
};

fn staging_schema() -> SchemaDefinition {
    SchemaDefinition::new(vec![
        Field::new("id", DataType::Int).primary_key(),
        Field::new("name", DataType::Varchar),
        Field::new("version", DataType::Int),
        Field::new("digest", DataType::Varchar),
    ])
    .unwrap()
}

fn datasets() -> Datasets {
    Datasets::new(
        Dataset::new("main", SchemaDefinition::empty()),
        Dataset::new("staging", staging_schema()),
    )
    .unwrap()
}

fn options() -> IngestorOptions {
    IngestorOptions {
        execution_timestamp: parse_timestamp("2024-03-01 10:00:00"),
        ..Default::default()
    }
}

fn append_only(
    deduplication: DeduplicationStrategy,
    versioning: VersioningStrategy,
) -> IngestMode {
    IngestMode::from(AppendOnly {
        digest: DigestGenStrategy::user_provided("digest"),
        deduplication,
        versioning,
        ..Default::default()
    })
}

fn count_prefix(transcript: &[String], prefix: &str) -> usize {
    transcript.iter().filter(|s| s.starts_with(prefix)).count()
}

#[test]
fn test_all_versions_runs_one_pass_per_data_split() {
    let executor = RecordingExecutor::new();
    executor.respond("\"maxDataSplit\"", QueryResult::single("maxDataSplit", 2));
    executor.respond("\"nextBatchId\"", QueryResult::single("nextBatchId", 7));
    executor.respond("\"nextBatchId\"", QueryResult::single("nextBatchId", 8));

    let ingestor = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::FilterDuplicates,
            VersioningStrategy::all_versions("version"),
        ),
        &DuckDbSink,
        options(),
    );
    let results = ingestor.perform_full_ingestion(&executor, &datasets()).unwrap();

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data_split_range, Some(DataSplitRange::single(1)));
    assert_eq!(results[1].data_split_range, Some(DataSplitRange::single(2)));
    assert_eq!(results[0].batch_id, Some(7));
    assert_eq!(results[1].batch_id, Some(8));
    assert_eq!(results[0].run_id, results[1].run_id);

    let transcript = executor.transcript();
    assert_eq!(count_prefix(&transcript, "BEGIN"), 1);
    assert_eq!(count_prefix(&transcript, "INSERT INTO \"batch_metadata\""), 2);

    let inserts: Vec<&String> = transcript
        .iter()
        .filter(|s| s.starts_with("INSERT INTO \"main\""))
        .collect();
    assert_eq!(inserts.len(), 2);
    assert!(inserts[0].contains("stage.\"data_split\" >= 1"));
    assert!(inserts[1].contains("stage.\"data_split\" >= 2"));
    assert!(transcript.iter().all(|s| !s.contains("PLACEHOLDER")));

    // the versioned temp table is dropped before commit
    let drop = transcript
        .iter()
        .position(|s| s.starts_with("DROP TABLE IF EXISTS \"staging_ingest_temp_staging\""))
        .unwrap();
    let commit = transcript.iter().position(|s| s == "COMMIT").unwrap();
    assert!(drop < commit);
}

#[test]
fn test_explicit_data_splits_are_validated() {
    let executor = RecordingExecutor::new();
    let ingestor = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::AllowDuplicates,
            VersioningStrategy::all_versions("version"),
        ),
        &DuckDbSink,
        options(),
    );
    let overlapping = [
        DataSplitRange::new(1, 2).unwrap(),
        DataSplitRange::new(2, 3).unwrap(),
    ];
    let err = ingestor
        .perform_full_ingestion_with_data_splits(&executor, &datasets(), &overlapping)
        .unwrap_err();
    assert!(matches!(err, IngestError::Configuration(_)));
    assert!(executor.transcript().is_empty());

    let ranges = [DataSplitRange::new(1, 2).unwrap(), DataSplitRange::single(3)];
    let results = ingestor
        .perform_full_ingestion_with_data_splits(&executor, &datasets(), &ranges)
        .unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].data_split_range, Some(ranges[0]));
    // explicit ranges skip the max data split query
    assert!(executor.queries().iter().all(|q| !q.contains("\"maxDataSplit\"")));
}

#[test]
fn test_duplicate_check_aborts_batch() {
    let executor = RecordingExecutor::new();
    executor.respond("\"maxDuplicates\"", QueryResult::single("maxDuplicates", 3));

    let err = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::FailOnDuplicates,
            VersioningStrategy::NoVersioning,
        ),
        &DuckDbSink,
        options(),
    )
    .perform_full_ingestion(&executor, &datasets())
    .unwrap_err();

    match err {
        IngestError::DataError(kind, message) => {
            assert_eq!(kind, DataErrorKind::Duplicates);
            assert!(message.contains("max count 3"));
        }
        other => panic!("unexpected error: {}", other),
    }
    let transcript = executor.transcript();
    assert_eq!(count_prefix(&transcript, "INSERT INTO \"main\""), 0);
    assert_eq!(transcript.last().map(String::as_str), Some("ROLLBACK"));
}

#[test]
fn test_schema_evolution_runs_inside_transaction() {
    let live_main = SchemaDefinition::new(vec![
        Field::new("id", DataType::Int).primary_key(),
        Field::new("version", DataType::Int),
        Field::new("digest", DataType::Varchar),
        Field::new("batch_id", DataType::Int),
    ])
    .unwrap();
    let executor = RecordingExecutor::new().with_table("main", live_main);

    let results = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::AllowDuplicates,
            VersioningStrategy::NoVersioning,
        ),
        &DuckDbSink,
        IngestorOptions {
            enable_schema_evolution: true,
            schema_evolution_capabilities: BTreeSet::from([SchemaEvolutionCapability::AddColumn]),
            ..options()
        },
    )
    .perform_full_ingestion(&executor, &datasets())
    .unwrap();

    let result = &results[0];
    assert_eq!(result.status, IngestStatus::Succeeded);
    assert_eq!(result.schema_evolution_sql.len(), 1);
    assert!(result.schema_evolution_sql[0].starts_with("ALTER TABLE \"main\" ADD COLUMN \"name\""));
    assert!(result.updated_datasets.main.schema.contains("name"));

    let transcript = executor.transcript();
    let begin = transcript.iter().position(|s| s == "BEGIN").unwrap();
    let alter = transcript
        .iter()
        .position(|s| s.starts_with("ALTER TABLE"))
        .unwrap();
    let insert = transcript
        .iter()
        .position(|s| s.starts_with("INSERT INTO \"main\""))
        .unwrap();
    assert!(begin < alter && alter < insert);
}

#[test]
fn test_schema_evolution_without_capability_fails_closed() {
    let live_main = SchemaDefinition::new(vec![
        Field::new("id", DataType::Int).primary_key(),
        Field::new("digest", DataType::Varchar),
    ])
    .unwrap();
    let executor = RecordingExecutor::new().with_table("main", live_main);

    let err = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::AllowDuplicates,
            VersioningStrategy::NoVersioning,
        ),
        &DuckDbSink,
        IngestorOptions {
            enable_schema_evolution: true,
            ..options()
        },
    )
    .perform_full_ingestion(&executor, &datasets())
    .unwrap_err();

    assert!(matches!(err, IngestError::SchemaIncompatible(_)));
    assert!(executor.transcript().is_empty());
}

#[test]
fn test_statistics_can_be_disabled() {
    let executor = RecordingExecutor::new();
    let results = RelationalIngestor::new(
        append_only(
            DeduplicationStrategy::AllowDuplicates,
            VersioningStrategy::NoVersioning,
        ),
        &DuckDbSink,
        IngestorOptions {
            collect_statistics: false,
            ..options()
        },
    )
    .perform_full_ingestion(&executor, &datasets())
    .unwrap();

    assert!(results[0].statistics.is_empty());
    assert_eq!(results[0].statistic(StatisticName::RowsInserted), None);
    let ledger = executor
        .transcript()
        .into_iter()
        .find(|s| s.starts_with("INSERT INTO \"batch_metadata\""))
        .unwrap();
    assert!(ledger.ends_with(",NULL)"));
}
