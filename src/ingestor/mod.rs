//! Ingestion runtime
//!
//! [`RelationalIngestor`] executes the SQL produced by [`RelationalGenerator`]:
//! it creates missing tables, takes the per-table lock, runs every data-split
//! pass inside one transaction and records one ledger row per pass.

pub mod data_split;
pub mod generator;
pub mod multi;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use crate::error::{IngestError, IngestResult};
use crate::executor::{RelationalExecutor, TransactionGuard};
use crate::ingest_mode::IngestMode;
use crate::lock::{LockProvider, retry_on_conflict};
use crate::models::Datasets;
use crate::planner::{DataQualityCheck, StatisticName};
use crate::schema_evolution::SchemaEvolutionCapability;
use crate::sink::{CaseConversion, RelationalSink};

pub use data_split::DataSplitRange;
pub use generator::{GeneratorResult, RelationalGenerator};
pub use multi::{IngestStage, LogicalDataset, RelationalMultiDatasetIngestor};

/// Default time to wait for the lock before giving up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Default first wait after a lock conflict
pub const DEFAULT_LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Default idle time after which a lock row is reported as stale
pub const DEFAULT_STALE_LOCK_THRESHOLD: Duration = Duration::from_secs(6 * 60 * 60);

/// Format used for every timestamp literal written by the ingestor
pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}

/// Runtime switches of an ingestion
#[derive(Debug, Clone, PartialEq)]
pub struct IngestorOptions {
    /// Delete staged rows after a successful ingest
    pub cleanup_staging_data: bool,
    pub collect_statistics: bool,
    pub enable_schema_evolution: bool,
    pub schema_evolution_capabilities: BTreeSet<SchemaEvolutionCapability>,
    /// Create main, staging and ledger tables when missing
    pub create_datasets: bool,
    /// Create staging up front and drop it after commit
    pub create_staging_dataset: bool,
    /// Serialise writers of the same table through the lock table
    pub enable_concurrent_safety: bool,
    pub case_conversion: CaseConversion,
    pub batch_success_status: String,
    pub additional_metadata: BTreeMap<String, serde_json::Value>,
    /// Makes the ingestion idempotent per request
    pub ingest_request_id: Option<String>,
    /// Fixed clock; the system clock when `None`
    pub execution_timestamp: Option<NaiveDateTime>,
    pub lock_timeout: Duration,
    pub lock_retry_interval: Duration,
    pub stale_lock_threshold: Duration,
}

impl Default for IngestorOptions {
    fn default() -> Self {
        Self {
            cleanup_staging_data: true,
            collect_statistics: true,
            enable_schema_evolution: false,
            schema_evolution_capabilities: BTreeSet::new(),
            create_datasets: true,
            create_staging_dataset: false,
            enable_concurrent_safety: false,
            case_conversion: CaseConversion::None,
            batch_success_status: "DONE".to_string(),
            additional_metadata: BTreeMap::new(),
            ingest_request_id: None,
            execution_timestamp: None,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_retry_interval: DEFAULT_LOCK_RETRY_INTERVAL,
            stale_lock_threshold: DEFAULT_STALE_LOCK_THRESHOLD,
        }
    }
}

impl IngestorOptions {
    /// Current time of the run
    pub fn clock(&self) -> NaiveDateTime {
        self.execution_timestamp
            .unwrap_or_else(|| chrono::Utc::now().naive_utc())
    }
}

/// Outcome of one ingestion pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestStatus {
    Succeeded,
    /// The request id was already recorded; nothing was written
    AlreadyIngested,
}

/// Result of one ingestion pass
#[derive(Debug, Clone, PartialEq)]
pub struct IngestorResult {
    /// Identifier shared by every result of one ingestion call
    pub run_id: uuid::Uuid,
    pub status: IngestStatus,
    pub batch_id: Option<i64>,
    pub data_split_range: Option<DataSplitRange>,
    pub statistics: BTreeMap<StatisticName, i64>,
    /// Datasets as ingested, after case conversion and schema evolution
    pub updated_datasets: Datasets,
    pub schema_evolution_sql: Vec<String>,
    pub ingestion_timestamp_utc: String,
}

impl IngestorResult {
    pub fn statistic(&self, name: StatisticName) -> Option<i64> {
        self.statistics.get(&name).copied()
    }
}

/// Outcome of executing one pass inside the transaction
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PassOutcome {
    pub batch_id: Option<i64>,
    pub statistics: BTreeMap<StatisticName, i64>,
}

/// What a committed ingestion transaction did
enum Applied {
    /// The request id was found in the ledger
    Recorded(Vec<IngestorResult>),
    Ingested(Vec<(Option<DataSplitRange>, PassOutcome)>),
}

/// Statement runner shared by the single and multi-dataset ingestors
pub(crate) struct Runtime<'e> {
    pub executor: &'e dyn RelationalExecutor,
    pub options: &'e IngestorOptions,
}

impl<'e> Runtime<'e> {
    pub fn execute_all(&self, statements: &[String]) -> IngestResult<()> {
        for sql in statements {
            tracing::debug!("Executing: {}", sql);
            self.executor.execute(sql)?;
        }
        Ok(())
    }

    /// Fail when any check reports more violations than it tolerates
    pub fn run_checks(
        &self,
        checks: &BTreeMap<DataQualityCheck, String>,
        table: &str,
    ) -> IngestResult<()> {
        for (check, sql) in checks {
            tracing::debug!("Checking {}: {}", check.alias(), sql);
            let observed = self
                .executor
                .query(sql)?
                .first_i64(check.alias())
                .unwrap_or(0);
            if observed > check.threshold() {
                return Err(check.to_error(observed, table));
            }
        }
        Ok(())
    }

    pub fn collect_statistics(
        &self,
        queries: &BTreeMap<StatisticName, String>,
        into: &mut BTreeMap<StatisticName, i64>,
    ) -> IngestResult<()> {
        for (statistic, sql) in queries {
            tracing::debug!("Collecting {}: {}", statistic, sql);
            let value = self
                .executor
                .query(sql)?
                .first_i64(statistic.alias())
                .unwrap_or(0);
            into.insert(*statistic, value);
        }
        Ok(())
    }

    /// Next batch id as read from the ledger
    pub fn next_batch_id(&self, sql: &str) -> IngestResult<Option<i64>> {
        Ok(self.executor.query(sql)?.first_i64("nextBatchId"))
    }

    /// Checks, statistics, data movement and optionally the ledger row of one pass
    pub fn run_pass(
        &self,
        pass: &GeneratorResult,
        table: &str,
        record_ledger: bool,
    ) -> IngestResult<PassOutcome> {
        let batch_id = self.next_batch_id(&pass.next_batch_id_sql)?;
        let mut statistics = BTreeMap::new();

        self.run_checks(&pass.pre_ingest_checks_sql, table)?;
        if self.options.collect_statistics {
            self.collect_statistics(&pass.pre_ingest_statistics_sql, &mut statistics)?;
        }
        self.execute_all(&pass.ingest_sql)?;
        self.run_checks(&pass.post_ingest_checks_sql, table)?;
        if self.options.collect_statistics {
            self.collect_statistics(&pass.post_ingest_statistics_sql, &mut statistics)?;
        }

        if record_ledger {
            let end_ts = format_timestamp(self.options.clock());
            let statistics_json = if self.options.collect_statistics {
                Some(serde_json::to_string(&statistics)?)
            } else {
                None
            };
            self.execute_all(&pass.metadata_ingest_sql_for(&end_ts, statistics_json.as_deref()))?;
        }

        Ok(PassOutcome {
            batch_id,
            statistics,
        })
    }

    /// Run `body` in a transaction, retrying it on write conflicts when the
    /// lock discipline is enabled
    pub fn in_transaction<T>(
        &self,
        table: &str,
        mut body: impl FnMut() -> IngestResult<T>,
    ) -> IngestResult<T> {
        let mut attempt = || -> IngestResult<T> {
            let guard = TransactionGuard::begin(self.executor)?;
            let value = body()?;
            guard.commit()?;
            Ok(value)
        };
        if self.options.enable_concurrent_safety {
            retry_on_conflict(
                table,
                self.options.lock_timeout,
                self.options.lock_retry_interval,
                attempt,
            )
        } else {
            attempt()
        }
    }
}

/// Executes ingestions of one mode against a sink
pub struct RelationalIngestor<'a> {
    generator: RelationalGenerator<'a>,
}

impl<'a> RelationalIngestor<'a> {
    pub fn new(mode: IngestMode, sink: &'a dyn RelationalSink, options: IngestorOptions) -> Self {
        Self {
            generator: RelationalGenerator::new(mode, sink, options),
        }
    }

    pub fn generator(&self) -> &RelationalGenerator<'a> {
        &self.generator
    }

    pub fn options(&self) -> &IngestorOptions {
        self.generator.options()
    }

    /// Ingest `datasets`, one result per data-split pass
    ///
    /// Data splits are derived from the versioned temp staging table when
    /// the mode keeps all versions, otherwise a single pass runs.
    pub fn perform_full_ingestion(
        &self,
        executor: &dyn RelationalExecutor,
        datasets: &Datasets,
    ) -> IngestResult<Vec<IngestorResult>> {
        self.ingest(executor, datasets, None)
    }

    /// Ingest `datasets` in the given data-split ranges
    pub fn perform_full_ingestion_with_data_splits(
        &self,
        executor: &dyn RelationalExecutor,
        datasets: &Datasets,
        ranges: &[DataSplitRange],
    ) -> IngestResult<Vec<IngestorResult>> {
        data_split::validate_ranges(ranges)?;
        self.ingest(executor, datasets, Some(ranges))
    }

    fn ingest(
        &self,
        executor: &dyn RelationalExecutor,
        datasets: &Datasets,
        ranges: Option<&[DataSplitRange]>,
    ) -> IngestResult<Vec<IngestorResult>> {
        let options = self.generator.options();
        let runtime = Runtime { executor, options };
        let datasets = self.generator.prepare(datasets)?;
        let started = options.clock();
        let batch_start_ts = format_timestamp(started);
        let table = datasets.main.name().to_string();
        let run_id = uuid::Uuid::new_v4();

        tracing::info!(
            "Starting {} ingestion {} of {} into {} ({})",
            self.generator.mode().name(),
            run_id,
            datasets.staging.name(),
            table,
            executor.backend_type()
        );

        let live_main = executor.fetch_schema(&datasets.main.reference)?;
        let generated =
            self.generator
                .generate(&datasets, live_main, &batch_start_ts, None)?;
        let updated_datasets = match &generated.evolved_main {
            Some(main) => datasets.clone().with_main(main.clone()),
            None => datasets.clone(),
        };

        if options.create_datasets {
            runtime.execute_all(&generated.create_datasets_sql)?;
        } else if !executor.table_exists(&datasets.metadata.reference)? {
            return Err(IngestError::Resource(format!(
                "Metadata table {} does not exist and dataset creation is disabled",
                datasets.metadata.reference.name
            )));
        }

        if options.enable_concurrent_safety {
            let lock_info = datasets.lock_info_or_default();
            if !options.create_datasets && !executor.table_exists(&lock_info.reference)? {
                return Err(IngestError::Resource(format!(
                    "Lock table {} does not exist and dataset creation is disabled",
                    lock_info.reference.name
                )));
            }
            runtime.execute_all(&generated.lock_init_sql)?;
            LockProvider::new(self.generator.sink(), lock_info, table.clone()).warn_if_stale(
                executor,
                started,
                options.stale_lock_threshold,
            )?;
        }

        let make_result = |status: IngestStatus,
                           batch_id: Option<i64>,
                           range: Option<DataSplitRange>,
                           statistics: BTreeMap<StatisticName, i64>| IngestorResult {
            run_id,
            status,
            batch_id,
            data_split_range: range,
            statistics,
            updated_datasets: updated_datasets.clone(),
            schema_evolution_sql: generated.schema_evolution_sql.clone(),
            ingestion_timestamp_utc: batch_start_ts.clone(),
        };

        let applied = runtime.in_transaction(&table, || {
            runtime.execute_all(&generated.lock_acquire_sql)?;

            // checked under the lock so concurrent replays of a request see each other
            if let Some(sql) = &generated.idempotency_check_sql {
                let recorded = executor.query(sql)?;
                if !recorded.is_empty() {
                    tracing::warn!(
                        "Request {:?} already ingested into {}; skipping",
                        options.ingest_request_id,
                        table
                    );
                    return recorded
                        .rows
                        .iter()
                        .map(|row| -> IngestResult<IngestorResult> {
                            let batch_id = crate::executor::value_of(row, "batchId")
                                .and_then(crate::executor::json_to_i64);
                            let statistics =
                                match crate::executor::value_of(row, "batchStatistics")
                                    .and_then(|v| v.as_str())
                                {
                                    Some(json) => serde_json::from_str(json)?,
                                    None => BTreeMap::new(),
                                };
                            Ok(make_result(
                                IngestStatus::AlreadyIngested,
                                batch_id,
                                None,
                                statistics,
                            ))
                        })
                        .collect::<IngestResult<Vec<_>>>()
                        .map(Applied::Recorded);
                }
            }

            runtime.execute_all(&generated.schema_evolution_sql)?;
            runtime.execute_all(&generated.pre_actions_sql)?;
            runtime.execute_all(&generated.dedup_and_versioning_sql)?;

            let passes: Vec<Option<DataSplitRange>> = match (ranges, &generated.max_data_split_sql)
            {
                (Some(ranges), _) => ranges.iter().copied().map(Some).collect(),
                (None, Some(sql)) => {
                    let max = executor.query(sql)?.first_i64("maxDataSplit").unwrap_or(0);
                    data_split::ranges_up_to(max).into_iter().map(Some).collect()
                }
                (None, None) => vec![None],
            };

            let mut outcomes = Vec::with_capacity(passes.len());
            for range in passes {
                let pass = match &range {
                    Some(range) => {
                        tracing::info!("Ingesting data split {} of {}", range, table);
                        generated.with_data_split_range(range)
                    }
                    None => generated.clone(),
                };
                outcomes.push((range, runtime.run_pass(&pass, &table, true)?));
            }

            runtime.execute_all(&generated.post_actions_sql)?;
            Ok(Applied::Ingested(outcomes))
        })?;
        let outcomes = match applied {
            Applied::Recorded(results) => return Ok(results),
            Applied::Ingested(outcomes) => outcomes,
        };

        runtime.execute_all(&generated.post_cleanup_sql)?;

        tracing::info!(
            "Finished ingestion {} into {}: {} batch(es)",
            run_id,
            table,
            outcomes.len()
        );
        Ok(outcomes
            .into_iter()
            .map(|(range, outcome)| {
                make_result(
                    IngestStatus::Succeeded,
                    outcome.batch_id,
                    range,
                    outcome.statistics,
                )
            })
            .collect())
    }
}
