//! Generate-only entry point
//!
//! [`RelationalGenerator`] turns an ingest mode and datasets into rendered
//! SQL without touching a database. The ingestor executes the same output.

use std::collections::BTreeMap;

use crate::error::IngestResult;
use crate::ingest_mode::IngestMode;
use crate::lock::LockProvider;
use crate::logical::{LogicalPlan, Select};
use crate::models::{Dataset, Datasets, SchemaDefinition};
use crate::planner::{
    BATCH_END_TS_PLACEHOLDER, BATCH_STATISTICS_PLACEHOLDER, DataQualityCheck, PlannerOptions,
    StatisticName, plan,
};
use crate::schema_evolution::SchemaEvolution;
use crate::sink::{CaseConversion, RelationalSink, SqlRenderer};

use super::data_split::DataSplitRange;
use super::{IngestorOptions, format_timestamp};

/// Rendered SQL of one ingestion, grouped by phase
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorResult {
    /// `CREATE TABLE IF NOT EXISTS` for main, ledger and optionally staging
    pub create_datasets_sql: Vec<String>,
    /// Lock table creation and lock row initialisation
    pub lock_init_sql: Vec<String>,
    /// Lock acquisition, first statement of the transaction
    pub lock_acquire_sql: Vec<String>,
    pub schema_evolution_sql: Vec<String>,
    /// Main dataset after schema evolution
    pub evolved_main: Option<Dataset>,
    pub pre_actions_sql: Vec<String>,
    pub dedup_and_versioning_sql: Vec<String>,
    pub pre_ingest_checks_sql: BTreeMap<DataQualityCheck, String>,
    pub ingest_sql: Vec<String>,
    pub post_ingest_checks_sql: BTreeMap<DataQualityCheck, String>,
    pub pre_ingest_statistics_sql: BTreeMap<StatisticName, String>,
    pub post_ingest_statistics_sql: BTreeMap<StatisticName, String>,
    /// Ledger insert with end-timestamp and statistics placeholders
    pub metadata_ingest_sql: Vec<String>,
    pub post_actions_sql: Vec<String>,
    /// Statements run after commit
    pub post_cleanup_sql: Vec<String>,
    pub next_batch_id_sql: String,
    pub max_data_split_sql: Option<String>,
    pub idempotency_check_sql: Option<String>,
}

impl GeneratorResult {
    /// Every statistics query, pre- and post-ingest
    pub fn statistics_sql(&self) -> BTreeMap<StatisticName, String> {
        let mut all = self.pre_ingest_statistics_sql.clone();
        all.extend(
            self.post_ingest_statistics_sql
                .iter()
                .map(|(k, v)| (*k, v.clone())),
        );
        all
    }

    /// Copy with the data-split bound placeholders replaced
    pub fn with_data_split_range(&self, range: &DataSplitRange) -> GeneratorResult {
        let list = |sql: &[String]| sql.iter().map(|s| range.apply(s)).collect::<Vec<_>>();
        let checks = |sql: &BTreeMap<DataQualityCheck, String>| {
            sql.iter()
                .map(|(k, v)| (*k, range.apply(v)))
                .collect::<BTreeMap<_, _>>()
        };
        let statistics = |sql: &BTreeMap<StatisticName, String>| {
            sql.iter()
                .map(|(k, v)| (*k, range.apply(v)))
                .collect::<BTreeMap<_, _>>()
        };
        GeneratorResult {
            pre_ingest_checks_sql: checks(&self.pre_ingest_checks_sql),
            ingest_sql: list(&self.ingest_sql),
            post_ingest_checks_sql: checks(&self.post_ingest_checks_sql),
            pre_ingest_statistics_sql: statistics(&self.pre_ingest_statistics_sql),
            post_ingest_statistics_sql: statistics(&self.post_ingest_statistics_sql),
            metadata_ingest_sql: list(&self.metadata_ingest_sql),
            ..self.clone()
        }
    }

    /// Ledger insert completed with the batch end time and statistics JSON
    pub fn metadata_ingest_sql_for(
        &self,
        batch_end_ts: &str,
        batch_statistics: Option<&str>,
    ) -> Vec<String> {
        let statistics = batch_statistics
            .map(quote_literal)
            .unwrap_or_else(|| "NULL".to_string());
        self.metadata_ingest_sql
            .iter()
            .map(|sql| {
                sql.replace(BATCH_END_TS_PLACEHOLDER, &quote_literal(batch_end_ts))
                    .replace(BATCH_STATISTICS_PLACEHOLDER, &statistics)
            })
            .collect()
    }
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Generates the SQL of an ingestion for one sink
pub struct RelationalGenerator<'a> {
    mode: IngestMode,
    sink: &'a dyn RelationalSink,
    options: IngestorOptions,
}

impl<'a> RelationalGenerator<'a> {
    pub fn new(mode: IngestMode, sink: &'a dyn RelationalSink, options: IngestorOptions) -> Self {
        let case = options.case_conversion;
        let mode = match case {
            CaseConversion::None => mode,
            _ => mode.map_names(|n| case.apply(n)),
        };
        Self {
            mode,
            sink,
            options,
        }
    }

    /// Ingest mode with identifier case conversion applied
    pub fn mode(&self) -> &IngestMode {
        &self.mode
    }

    pub fn sink(&self) -> &'a dyn RelationalSink {
        self.sink
    }

    pub fn options(&self) -> &IngestorOptions {
        &self.options
    }

    /// Apply case conversion and check the datasets against the mode
    pub fn prepare(&self, datasets: &Datasets) -> IngestResult<Datasets> {
        let case = self.options.case_conversion;
        let datasets = match case {
            CaseConversion::None => datasets.clone(),
            _ => {
                // default lock table name is converted along with the rest
                let lock_info = datasets.lock_info_or_default();
                datasets
                    .clone()
                    .with_lock_info(lock_info)
                    .map_names(|n| case.apply(n))
            }
        };
        self.mode.validate(&datasets)?;
        Ok(datasets)
    }

    /// Render every statement of an ingestion of `datasets`
    ///
    /// Schema evolution, when enabled, diffs staging against the declared
    /// main schema.
    pub fn generate_operations(&self, datasets: &Datasets) -> IngestResult<GeneratorResult> {
        let prepared = self.prepare(datasets)?;
        let batch_start_ts = format_timestamp(self.options.clock());
        self.generate(&prepared, None, &batch_start_ts, None)
    }

    /// Render for prepared datasets, evolving from `live_main` when known
    pub(crate) fn generate(
        &self,
        datasets: &Datasets,
        live_main: Option<SchemaDefinition>,
        batch_start_ts: &str,
        ledger_table_name: Option<String>,
    ) -> IngestResult<GeneratorResult> {
        let renderer = SqlRenderer::new(self.sink);
        let mut datasets = datasets.clone();
        let mut result = GeneratorResult::default();

        if let Some(live) = live_main
            && (datasets.main.schema.is_empty() || self.options.enable_schema_evolution)
        {
            let main = datasets.main.clone().with_schema(live);
            datasets = datasets.with_main(main);
        }

        if self.options.enable_schema_evolution && !datasets.main.schema.is_empty() {
            let evolution = SchemaEvolution::new(
                self.sink,
                &self.mode,
                self.options.schema_evolution_capabilities.iter().copied(),
            );
            let evolved = evolution.evolve(&datasets.main, &datasets.staging.schema)?;
            result.schema_evolution_sql = renderer.render_plan(&evolved.operations)?;
            datasets = datasets.with_main(evolved.main.clone());
            result.evolved_main = Some(evolved.main);
        }

        let planner_options = PlannerOptions {
            cleanup_staging_data: self.options.cleanup_staging_data,
            collect_statistics: self.options.collect_statistics,
            create_staging_dataset: self.options.create_staging_dataset,
            batch_success_status: self.options.batch_success_status.clone(),
            additional_metadata: self.options.additional_metadata.clone(),
            ingest_request_id: self.options.ingest_request_id.clone(),
            batch_start_ts: batch_start_ts.to_string(),
            ledger_table_name: ledger_table_name.clone(),
        };
        let plan = plan(&self.mode, &datasets, &planner_options)?;
        tracing::debug!(
            "Planned {} for {}: {} ingest statement(s)",
            self.mode.name(),
            datasets.main.name(),
            plan.ingest.len()
        );

        if self.options.create_datasets {
            result.create_datasets_sql = renderer.render_plan(&plan.create_datasets)?;
        }
        if self.options.enable_concurrent_safety {
            let lock = LockProvider::new(
                self.sink,
                datasets.lock_info_or_default(),
                ledger_table_name.unwrap_or_else(|| datasets.main.name().to_string()),
            );
            result.lock_init_sql = lock.create_sql()?;
            result
                .lock_init_sql
                .extend(lock.initialize_sql(batch_start_ts)?);
            result.lock_acquire_sql = lock.acquire_sql(batch_start_ts)?;
        }

        let render_all = |plan: &LogicalPlan| renderer.render_plan(plan);

        result.pre_actions_sql = render_all(&plan.pre_actions)?;
        result.dedup_and_versioning_sql = render_all(&plan.deduplication_and_versioning)?;
        result.pre_ingest_checks_sql = render_selects(&renderer, &plan.pre_ingest_checks)?;
        result.ingest_sql = render_all(&plan.ingest)?;
        result.post_ingest_checks_sql = render_selects(&renderer, &plan.post_ingest_checks)?;
        result.pre_ingest_statistics_sql =
            render_selects(&renderer, &plan.pre_ingest_statistics)?;
        result.post_ingest_statistics_sql =
            render_selects(&renderer, &plan.post_ingest_statistics)?;
        result.metadata_ingest_sql = render_all(&plan.metadata_ingest)?;
        result.post_actions_sql = render_all(&plan.post_actions)?;
        result.post_cleanup_sql = render_all(&plan.post_cleanup)?;
        result.next_batch_id_sql = renderer.render_select(&plan.next_batch_id)?;
        result.max_data_split_sql = plan
            .max_data_split
            .as_ref()
            .map(|s| renderer.render_select(s))
            .transpose()?;
        result.idempotency_check_sql = plan
            .idempotency_check
            .as_ref()
            .map(|s| renderer.render_select(s))
            .transpose()?;

        Ok(result)
    }
}

fn render_selects<K: Ord + Copy>(
    renderer: &SqlRenderer,
    selects: &BTreeMap<K, Select>,
) -> IngestResult<BTreeMap<K, String>> {
    selects
        .iter()
        .map(|(k, s)| Ok((*k, renderer.render_select(s)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest_mode::{
        AppendOnly, DeduplicationStrategy, DigestGenStrategy, VersioningStrategy,
    };
    use crate::models::{DataType, Field};
    use crate::planner::{DATA_SPLIT_LOWER_BOUND_PLACEHOLDER, DATA_SPLIT_UPPER_BOUND_PLACEHOLDER};
    use crate::schema_evolution::SchemaEvolutionCapability;
    use crate::sink::DuckDbSink;

    fn datasets(main: SchemaDefinition) -> Datasets {
        let staging = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("version", DataType::Int),
            Field::new("digest", DataType::Varchar),
        ])
        .unwrap();
        Datasets::new(Dataset::new("main", main), Dataset::new("staging", staging)).unwrap()
    }

    fn options() -> IngestorOptions {
        IngestorOptions {
            execution_timestamp: crate::lock::parse_timestamp("2024-03-01 10:00:00"),
            ..Default::default()
        }
    }

    #[test]
    fn test_generate_append_only() {
        let mode = IngestMode::from(AppendOnly {
            digest: DigestGenStrategy::user_provided("digest"),
            ..Default::default()
        });
        let generator = RelationalGenerator::new(mode, &DuckDbSink, options());
        let result = generator
            .generate_operations(&datasets(SchemaDefinition::empty()))
            .unwrap();

        assert_eq!(result.create_datasets_sql.len(), 2);
        assert!(result.create_datasets_sql[0].starts_with("CREATE TABLE IF NOT EXISTS \"main\""));
        assert!(result.create_datasets_sql[1].starts_with("CREATE TABLE IF NOT EXISTS \"batch_metadata\""));
        assert!(result.lock_init_sql.is_empty());
        assert!(result.pre_actions_sql.is_empty());
        assert_eq!(result.ingest_sql.len(), 1);
        assert_eq!(result.post_actions_sql, vec!["DELETE FROM \"staging\" as stage".to_string()]);
        assert_eq!(
            result.statistics_sql().keys().copied().collect::<Vec<_>>(),
            StatisticName::ALL.to_vec()
        );
        assert!(result.next_batch_id_sql.contains("COALESCE(MAX(meta.\"table_batch_id\"),0)+1"));
        assert!(result.metadata_ingest_sql[0].contains("CAST('2024-03-01 10:00:00' AS TIMESTAMP)"));
    }

    #[test]
    fn test_metadata_placeholders() {
        let mode = IngestMode::from(AppendOnly::default());
        let generator = RelationalGenerator::new(mode, &DuckDbSink, options());
        let result = generator
            .generate_operations(&datasets(SchemaDefinition::empty()))
            .unwrap();
        assert!(result.metadata_ingest_sql[0].contains(BATCH_END_TS_PLACEHOLDER));

        let sql = result.metadata_ingest_sql_for("2024-03-01 10:00:05", Some("{\"ROWS_INSERTED\":2}"));
        assert!(sql[0].contains("CAST('2024-03-01 10:00:05' AS TIMESTAMP)"));
        assert!(sql[0].ends_with(",'{\"ROWS_INSERTED\":2}')"));
        let sql = result.metadata_ingest_sql_for("2024-03-01 10:00:05", None);
        assert!(sql[0].ends_with(",NULL)"));
    }

    #[test]
    fn test_all_versions_split_substitution() {
        let mode = IngestMode::from(AppendOnly {
            digest: DigestGenStrategy::user_provided("digest"),
            deduplication: DeduplicationStrategy::FilterDuplicates,
            versioning: VersioningStrategy::all_versions("version"),
            ..Default::default()
        });
        let generator = RelationalGenerator::new(mode, &DuckDbSink, options());
        let result = generator
            .generate_operations(&datasets(SchemaDefinition::empty()))
            .unwrap();
        assert!(result.max_data_split_sql.is_some());
        assert!(result.ingest_sql[0].contains(DATA_SPLIT_LOWER_BOUND_PLACEHOLDER));

        let pass = result.with_data_split_range(&DataSplitRange::single(2));
        assert!(!pass.ingest_sql[0].contains(DATA_SPLIT_UPPER_BOUND_PLACEHOLDER));
        assert!(pass.ingest_sql[0].contains("<= 2"));
        assert!(pass
            .statistics_sql()
            .values()
            .all(|sql| !sql.contains(DATA_SPLIT_LOWER_BOUND_PLACEHOLDER)));
    }

    #[test]
    fn test_case_conversion_and_lock_sql() {
        let mode = IngestMode::from(AppendOnly::default());
        let generator = RelationalGenerator::new(
            mode,
            &DuckDbSink,
            IngestorOptions {
                case_conversion: CaseConversion::ToUpper,
                enable_concurrent_safety: true,
                ..options()
            },
        );
        let result = generator
            .generate_operations(&datasets(SchemaDefinition::empty()))
            .unwrap();
        assert!(result.create_datasets_sql[0].starts_with("CREATE TABLE IF NOT EXISTS \"MAIN\"(\"ID\" INTEGER NOT NULL"));
        assert!(result.lock_init_sql[0].starts_with("CREATE TABLE IF NOT EXISTS \"MAIN_INGEST_LOCK\""));
        assert!(result.lock_acquire_sql[0].contains("WHERE ingest_lock.\"TABLE_NAME\" = 'MAIN'"));
    }

    #[test]
    fn test_schema_evolution_from_declared_main() {
        let main = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("batch_id", DataType::Int),
        ])
        .unwrap();
        let mode = IngestMode::from(AppendOnly {
            digest: DigestGenStrategy::user_provided("digest"),
            ..Default::default()
        });
        let generator = RelationalGenerator::new(
            mode,
            &DuckDbSink,
            IngestorOptions {
                enable_schema_evolution: true,
                schema_evolution_capabilities: [SchemaEvolutionCapability::AddColumn]
                    .into_iter()
                    .collect(),
                ..options()
            },
        );
        let result = generator.generate_operations(&datasets(main)).unwrap();
        assert_eq!(
            result.schema_evolution_sql,
            vec![
                "ALTER TABLE \"main\" ADD COLUMN \"version\" INTEGER".to_string(),
                "ALTER TABLE \"main\" ADD COLUMN \"digest\" VARCHAR".to_string(),
            ]
        );
        let evolved = result.evolved_main.unwrap();
        assert!(evolved.schema.contains("version"));
        assert!(result.ingest_sql[0].contains("\"version\""));
    }
}
