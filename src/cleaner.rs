//! Decommissioning of a target table
//!
//! [`SinkCleaner`] archives the ledger rows of a table into an audit table,
//! removes them from the live ledger and optionally drops the table itself.

use serde::{Deserialize, Serialize};

use crate::error::{IngestError, IngestResult};
use crate::executor::RelationalExecutor;
use crate::ingestor::{IngestorOptions, Runtime, format_timestamp};
use crate::lock::LockProvider;
use crate::logical::{Condition, Expr, LogicalPlan, Operation, Select, Source, aliased};
use crate::models::{
    DataType, DatasetReference, Field, LockInfoDataset, MetadataDataset, SchemaDefinition,
};
use crate::planner::{insert_select, timestamp};
use crate::sink::{RelationalSink, SqlRenderer};

/// Default audit table for archived ledger rows
pub const DEFAULT_CLEANUP_AUDIT_TABLE: &str = "sink_cleanup_audit";

const META_ALIAS: &str = "meta";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CleanupStatus {
    Succeeded,
    Failed,
}

impl std::fmt::Display for CleanupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CleanupStatus::Succeeded => write!(f, "SUCCEEDED"),
            CleanupStatus::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkCleanupResult {
    pub status: CleanupStatus,
    pub rows_archived: i64,
    /// Failure message when the cleanup was rolled back
    pub message: Option<String>,
}

/// Removes a table's ledger history, keeping an audit copy
pub struct SinkCleaner<'a> {
    sink: &'a dyn RelationalSink,
    main: DatasetReference,
    metadata: MetadataDataset,
    lock_info: Option<LockInfoDataset>,
    audit: DatasetReference,
    requested_by: String,
    drop_main: bool,
    options: IngestorOptions,
}

impl<'a> SinkCleaner<'a> {
    pub fn new(
        sink: &'a dyn RelationalSink,
        main: DatasetReference,
        requested_by: impl Into<String>,
    ) -> Self {
        let metadata = MetadataDataset::default().in_database_of(&main);
        let audit = main.sibling(DEFAULT_CLEANUP_AUDIT_TABLE);
        Self {
            sink,
            main,
            metadata,
            lock_info: None,
            audit,
            requested_by: requested_by.into(),
            drop_main: false,
            options: IngestorOptions::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: MetadataDataset) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_lock_info(mut self, lock_info: LockInfoDataset) -> Self {
        self.lock_info = Some(lock_info);
        self
    }

    pub fn with_audit_table(mut self, audit: DatasetReference) -> Self {
        self.audit = audit;
        self
    }

    /// Drop the main table along with its history
    pub fn drop_main(mut self, drop_main: bool) -> Self {
        self.drop_main = drop_main;
        self
    }

    /// Clock, lock discipline and case conversion of the cleanup
    pub fn with_options(mut self, options: IngestorOptions) -> Self {
        self.options = options;
        self
    }

    fn converted(&self, name: &str) -> String {
        self.options.case_conversion.apply(name)
    }

    fn metadata(&self) -> MetadataDataset {
        self.metadata.map_names(|n| self.converted(n))
    }

    fn audit_fields(&self) -> (String, String, String) {
        (
            self.converted("cleanup_ts_utc"),
            self.converted("requested_by"),
            self.converted("rows_archived"),
        )
    }

    /// Ledger columns followed by the cleanup columns
    pub fn audit_schema(&self) -> SchemaDefinition {
        let (cleanup_ts, requested_by, rows_archived) = self.audit_fields();
        let mut fields = self.metadata().schema().fields().to_vec();
        fields.push(Field::new(cleanup_ts, DataType::DateTime));
        fields.push(Field::new(requested_by, DataType::Varchar).with_length(255));
        fields.push(Field::new(rows_archived, DataType::BigInt));
        SchemaDefinition::trusted(fields)
    }

    fn audit_reference(&self) -> DatasetReference {
        self.audit.map_names(|n| self.converted(n))
    }

    fn rows_of_table(&self, metadata: &MetadataDataset) -> Condition {
        Expr::func(
            "UPPER",
            vec![Expr::col(META_ALIAS, &metadata.table_name_field)],
        )
        .equals(Expr::string(self.main.name.to_uppercase()))
    }

    /// Number of ledger rows the cleanup archives
    pub fn count_query(&self) -> Select {
        let metadata = self.metadata();
        Select::from_source(
            Source::Table(metadata.reference.clone().with_alias(META_ALIAS)),
            vec![aliased(Expr::count_star(), "rowsArchived")],
        )
        .with_where(self.rows_of_table(&metadata))
    }

    /// Archive, delete and optionally drop
    pub fn cleanup_plan(&self, cleanup_ts: &str, rows_archived: i64) -> LogicalPlan {
        let metadata = self.metadata();
        let (cleanup_ts_field, requested_by_field, rows_archived_field) = self.audit_fields();
        let mut values: Vec<(String, Expr)> = metadata
            .schema()
            .fields()
            .iter()
            .map(|f| (f.name.clone(), Expr::col(META_ALIAS, &f.name)))
            .collect();
        values.push((cleanup_ts_field, timestamp(cleanup_ts)));
        values.push((requested_by_field, Expr::string(self.requested_by.clone())));
        values.push((rows_archived_field, Expr::int(rows_archived)));

        let source = Select::star_from(&metadata.reference.clone().with_alias(META_ALIAS))
            .with_where(self.rows_of_table(&metadata));
        let mut plan = LogicalPlan::new(vec![
            insert_select(self.audit_reference(), values, source),
            Operation::Delete {
                table: metadata.reference.clone().with_alias(META_ALIAS),
                where_clause: Some(self.rows_of_table(&metadata)),
            },
        ]);
        if self.drop_main {
            plan.push(Operation::DropTable {
                table: self.main.map_names(|n| self.converted(n)),
                if_exists: true,
            });
        }
        plan
    }

    fn lock_provider(&self) -> LockProvider<'a> {
        let lock_info = self
            .lock_info
            .clone()
            .unwrap_or_else(|| LockInfoDataset::for_main(&self.main))
            .map_names(|n| self.options.case_conversion.apply(n));
        LockProvider::new(self.sink, lock_info, self.converted(&self.main.name))
    }

    fn run(&self, executor: &dyn RelationalExecutor) -> IngestResult<i64> {
        let renderer = SqlRenderer::new(self.sink);
        let runtime = Runtime {
            executor,
            options: &self.options,
        };
        let cleanup_ts = format_timestamp(self.options.clock());
        let metadata = self.metadata();

        if !executor.table_exists(&metadata.reference)? {
            return Err(IngestError::Resource(format!(
                "Metadata table {} does not exist",
                metadata.reference.name
            )));
        }
        runtime.execute_all(&renderer.render_plan(&LogicalPlan::new(vec![
            Operation::CreateTable {
                table: self.audit_reference(),
                schema: self.audit_schema(),
                if_not_exists: true,
            },
        ]))?)?;

        let lock = self.lock_provider();
        if self.options.enable_concurrent_safety {
            lock.create_and_initialize(executor, &cleanup_ts)?;
        }

        let count_sql = renderer.render_select(&self.count_query())?;
        runtime.in_transaction(lock.table_name(), || {
            if self.options.enable_concurrent_safety {
                lock.lock(executor, &cleanup_ts)?;
            }
            let rows_archived = executor.query(&count_sql)?.first_i64("rowsArchived").unwrap_or(0);
            runtime.execute_all(
                &renderer.render_plan(&self.cleanup_plan(&cleanup_ts, rows_archived))?,
            )?;
            Ok(rows_archived)
        })
    }

    /// Run the cleanup; failures roll back and are reported in the result
    pub fn execute(&self, executor: &dyn RelationalExecutor) -> SinkCleanupResult {
        tracing::info!(
            "Cleaning up {} on behalf of {}",
            self.main.name,
            self.requested_by
        );
        match self.run(executor) {
            Ok(rows_archived) => {
                tracing::info!(
                    "Archived {} ledger row(s) of {}",
                    rows_archived,
                    self.main.name
                );
                SinkCleanupResult {
                    status: CleanupStatus::Succeeded,
                    rows_archived,
                    message: None,
                }
            }
            Err(e) => {
                tracing::error!("Cleanup of {} failed: {}", self.main.name, e);
                SinkCleanupResult {
                    status: CleanupStatus::Failed,
                    rows_archived: 0,
                    message: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorError, QueryResult, RecordingExecutor};
    use crate::lock::parse_timestamp;
    use crate::sink::DuckDbSink;

    fn options() -> IngestorOptions {
        IngestorOptions {
            execution_timestamp: parse_timestamp("2024-03-01 10:00:00"),
            ..Default::default()
        }
    }

    #[test]
    fn test_cleanup_archives_then_deletes() {
        let executor = RecordingExecutor::new()
            .with_table("batch_metadata", MetadataDataset::default().schema());
        executor.respond("\"rowsArchived\"", QueryResult::single("rowsArchived", 3));

        let result = SinkCleaner::new(&DuckDbSink, DatasetReference::new("orders"), "ops")
            .drop_main(true)
            .with_options(options())
            .execute(&executor);

        assert_eq!(result.status, CleanupStatus::Succeeded);
        assert_eq!(result.rows_archived, 3);

        let executed = executor.executed();
        assert!(executed[0].starts_with("CREATE TABLE IF NOT EXISTS \"sink_cleanup_audit\""));
        assert!(executed[1].starts_with("INSERT INTO \"sink_cleanup_audit\""));
        assert!(executed[1].contains("'ops',3 FROM \"batch_metadata\" as meta"));
        assert!(executed[1].contains("UPPER(meta.\"table_name\") = 'ORDERS'"));
        assert_eq!(
            executed[2],
            "DELETE FROM \"batch_metadata\" as meta WHERE UPPER(meta.\"table_name\") = 'ORDERS'"
        );
        assert_eq!(executed[3], "DROP TABLE IF EXISTS \"orders\"");
        assert_eq!(executor.transcript().last().map(String::as_str), Some("COMMIT"));
    }

    #[test]
    fn test_failure_reports_failed_status() {
        let executor = RecordingExecutor::new()
            .with_table("batch_metadata", MetadataDataset::default().schema());
        executor.fail_on("DELETE FROM", ExecutorError::QueryFailed("denied".into()));

        let result = SinkCleaner::new(&DuckDbSink, DatasetReference::new("orders"), "ops")
            .with_options(options())
            .execute(&executor);

        assert_eq!(result.status, CleanupStatus::Failed);
        assert!(result.message.unwrap().contains("denied"));
        assert_eq!(executor.transcript().last().map(String::as_str), Some("ROLLBACK"));
    }

    #[test]
    fn test_missing_ledger_fails() {
        let result = SinkCleaner::new(&DuckDbSink, DatasetReference::new("orders"), "ops")
            .execute(&RecordingExecutor::new());
        assert_eq!(result.status, CleanupStatus::Failed);
        assert_eq!(result.status.to_string(), "FAILED");
    }
}
