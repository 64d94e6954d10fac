//! Chained ingestion of several logical datasets
//!
//! A logical dataset is a sequence of stages, for example a bulk load into a
//! raw append table followed by a unitemporal delta into the curated table.
//! All stages of all logical datasets run in one transaction under a shared
//! lock table; the ledger gets one row per logical dataset, written by its
//! final stage and keyed by the logical name.

use std::collections::{BTreeMap, BTreeSet};

use super::{
    IngestStatus, IngestorOptions, IngestorResult, Runtime, format_timestamp,
    generator::{GeneratorResult, RelationalGenerator},
};
use crate::error::{IngestError, IngestResult};
use crate::executor::RelationalExecutor;
use crate::ingest_mode::{IngestMode, VersioningStrategy};
use crate::lock::LockProvider;
use crate::models::{DatasetReference, Datasets, LockInfoDataset};
use crate::sink::RelationalSink;

/// Lock table shared by every logical dataset
pub const DEFAULT_LOGICAL_LOCK_TABLE: &str = "logical_dataset_lock";

/// One mode applied to one main/staging pair
#[derive(Debug, Clone, PartialEq)]
pub struct IngestStage {
    pub mode: IngestMode,
    pub datasets: Datasets,
}

impl IngestStage {
    pub fn new(mode: IngestMode, datasets: Datasets) -> Self {
        Self { mode, datasets }
    }
}

/// Named chain of stages recorded as one batch
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalDataset {
    pub name: String,
    pub stages: Vec<IngestStage>,
}

impl LogicalDataset {
    pub fn new(name: impl Into<String>, stages: Vec<IngestStage>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }
}

struct PreparedStage<'a> {
    generator: RelationalGenerator<'a>,
    datasets: Datasets,
    generated: GeneratorResult,
}

/// Ingests logical datasets atomically
pub struct RelationalMultiDatasetIngestor<'a> {
    sink: &'a dyn RelationalSink,
    options: IngestorOptions,
    lock_table: DatasetReference,
}

impl<'a> RelationalMultiDatasetIngestor<'a> {
    pub fn new(sink: &'a dyn RelationalSink, options: IngestorOptions) -> Self {
        Self {
            sink,
            options: IngestorOptions {
                enable_concurrent_safety: true,
                ..options
            },
            lock_table: DatasetReference::new(DEFAULT_LOGICAL_LOCK_TABLE),
        }
    }

    pub fn with_lock_table(mut self, lock_table: DatasetReference) -> Self {
        self.lock_table = lock_table;
        self
    }

    fn validate(logical_datasets: &[LogicalDataset]) -> IngestResult<()> {
        let mut names = BTreeSet::new();
        for logical in logical_datasets {
            if !names.insert(logical.name.as_str()) {
                return Err(IngestError::Configuration(format!(
                    "Logical dataset {} is listed twice",
                    logical.name
                )));
            }
            if logical.stages.is_empty() {
                return Err(IngestError::Configuration(format!(
                    "Logical dataset {} has no stages",
                    logical.name
                )));
            }
            if let Some(stage) = logical
                .stages
                .iter()
                .find(|s| matches!(s.mode.versioning(), VersioningStrategy::AllVersions { .. }))
            {
                return Err(IngestError::Configuration(format!(
                    "All-versions ingestion is not supported for logical dataset {} ({})",
                    logical.name,
                    stage.mode.name()
                )));
            }
        }
        Ok(())
    }

    /// Ingest every logical dataset in one transaction
    ///
    /// # Returns
    /// One result per stage, keyed by logical dataset name
    pub fn ingest(
        &self,
        executor: &dyn RelationalExecutor,
        logical_datasets: &[LogicalDataset],
    ) -> IngestResult<BTreeMap<String, Vec<IngestorResult>>> {
        Self::validate(logical_datasets)?;
        let runtime = Runtime {
            executor,
            options: &self.options,
        };
        let started = self.options.clock();
        let batch_start_ts = format_timestamp(started);
        let run_id = uuid::Uuid::new_v4();

        let mut prepared: Vec<(String, Vec<PreparedStage<'_>>)> = Vec::new();
        for logical in logical_datasets {
            let mut stages = Vec::with_capacity(logical.stages.len());
            for stage in &logical.stages {
                let generator =
                    RelationalGenerator::new(stage.mode.clone(), self.sink, self.options.clone());
                let datasets = generator.prepare(
                    &stage
                        .datasets
                        .clone()
                        .with_lock_info(LockInfoDataset::new(self.lock_table.clone())),
                )?;
                let live_main = executor.fetch_schema(&datasets.main.reference)?;
                let generated = generator.generate(
                    &datasets,
                    live_main,
                    &batch_start_ts,
                    Some(logical.name.clone()),
                )?;
                stages.push(PreparedStage {
                    generator,
                    datasets,
                    generated,
                });
            }
            prepared.push((logical.name.clone(), stages));
        }

        for (_, stages) in &prepared {
            for stage in stages {
                if self.options.create_datasets {
                    runtime.execute_all(&stage.generated.create_datasets_sql)?;
                } else if !executor.table_exists(&stage.datasets.metadata.reference)? {
                    return Err(IngestError::Resource(format!(
                        "Metadata table {} does not exist and dataset creation is disabled",
                        stage.datasets.metadata.reference.name
                    )));
                }
            }
        }

        // lock rows, acquired in name order so concurrent callers cannot deadlock
        let mut acquire: BTreeMap<&str, &[String]> = BTreeMap::new();
        for (name, stages) in &prepared {
            if let Some(first) = stages.first() {
                runtime.execute_all(&first.generated.lock_init_sql)?;
                LockProvider::new(
                    self.sink,
                    first.datasets.lock_info_or_default(),
                    name.clone(),
                )
                .warn_if_stale(executor, started, self.options.stale_lock_threshold)?;
                acquire.insert(name.as_str(), &first.generated.lock_acquire_sql);
            }
        }

        tracing::info!(
            "Ingestion {}: {} logical dataset(s) on {}",
            run_id,
            prepared.len(),
            executor.backend_type()
        );

        let lock_names = acquire.keys().copied().collect::<Vec<_>>().join(", ");
        let outcomes = runtime.in_transaction(&lock_names, || {
            for statements in acquire.values() {
                runtime.execute_all(statements)?;
            }
            let mut outcomes = Vec::with_capacity(prepared.len());
            for (name, stages) in &prepared {
                let mut stage_outcomes = Vec::with_capacity(stages.len());
                for (index, stage) in stages.iter().enumerate() {
                    let generated = &stage.generated;
                    let is_final = index + 1 == stages.len();
                    tracing::debug!(
                        "Stage {} of {}: {} into {}",
                        index + 1,
                        name,
                        stage.generator.mode().name(),
                        stage.datasets.main.name()
                    );
                    runtime.execute_all(&generated.schema_evolution_sql)?;
                    runtime.execute_all(&generated.pre_actions_sql)?;
                    runtime.execute_all(&generated.dedup_and_versioning_sql)?;
                    let outcome = runtime.run_pass(generated, name, is_final)?;
                    runtime.execute_all(&generated.post_actions_sql)?;
                    stage_outcomes.push(outcome);
                }
                outcomes.push(stage_outcomes);
            }
            Ok(outcomes)
        })?;

        for (_, stages) in &prepared {
            for stage in stages {
                runtime.execute_all(&stage.generated.post_cleanup_sql)?;
            }
        }

        let mut results = BTreeMap::new();
        for ((name, stages), stage_outcomes) in prepared.into_iter().zip(outcomes) {
            let stage_results = stages
                .into_iter()
                .zip(stage_outcomes)
                .map(|(stage, outcome)| {
                    let updated_datasets = match stage.generated.evolved_main {
                        Some(main) => stage.datasets.with_main(main),
                        None => stage.datasets,
                    };
                    IngestorResult {
                        run_id,
                        status: IngestStatus::Succeeded,
                        batch_id: outcome.batch_id,
                        data_split_range: None,
                        statistics: outcome.statistics,
                        updated_datasets,
                        schema_evolution_sql: stage.generated.schema_evolution_sql,
                        ingestion_timestamp_utc: batch_start_ts.clone(),
                    }
                })
                .collect();
            results.insert(name, stage_results);
        }
        tracing::info!("Finished ingesting logical dataset(s): {}", lock_names);
        Ok(results)
    }
}
