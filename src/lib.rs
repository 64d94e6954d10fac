//! Temporal Ingest - batch ingestion into relational tables with full history
//!
//! Provides:
//! - Ingest modes (append-only, snapshot, delta, bitemporal, bulk load)
//! - A dialect-free logical plan and SQL rendering for ANSI, DuckDB and PostgreSQL
//! - Deduplication, versioning and data-quality checks on staged rows
//! - Schema evolution gated by an explicit capability set
//! - A transactional runtime with batch ledger, idempotency and per-table locks

pub mod cleaner;
pub mod config;
pub mod digest;
pub mod error;
pub mod executor;
pub mod ingest_mode;
pub mod ingestor;
pub mod lock;
pub mod logical;
pub mod models;
pub mod planner;
pub mod schema_evolution;
pub mod sink;

pub use cleaner::{CleanupStatus, SinkCleaner, SinkCleanupResult};
pub use config::{IngestConfig, SinkDialect};
pub use error::{DataErrorKind, IngestError, IngestResult};
#[cfg(feature = "duckdb-backend")]
pub use executor::DuckDbExecutor;
pub use executor::{
    ExecutorError, ExecutorResult, QueryResult, RecordingExecutor, RelationalExecutor,
};
pub use ingest_mode::{
    AppendOnly, Auditing, BitemporalDelta, BulkLoad, DeduplicationStrategy, DigestGenStrategy,
    IngestMode, MergeStrategy, NontemporalDelta, NontemporalSnapshot, TransactionMilestoning,
    UnitemporalDelta, UnitemporalSnapshot, ValidityMilestoning, VersioningStrategy,
};
pub use ingestor::{
    DataSplitRange, GeneratorResult, IngestStage, IngestStatus, IngestorOptions, IngestorResult,
    LogicalDataset, RelationalGenerator, RelationalIngestor, RelationalMultiDatasetIngestor,
};
pub use lock::LockProvider;
pub use models::{
    DataType, Dataset, DatasetReference, Datasets, Field, LockInfoDataset, MetadataDataset,
    SchemaDefinition,
};
pub use planner::{DataQualityCheck, StatisticName};
pub use schema_evolution::{SchemaEvolution, SchemaEvolutionCapability};
pub use sink::{AnsiSqlSink, CaseConversion, DuckDbSink, PostgresSink, RelationalSink};
