//! Logical planning of one ingestion
//!
//! [`plan`] turns an ingest mode and a dataset pair into the ordered groups of
//! operations the executor runs: pre-actions, deduplication and versioning,
//! data quality checks, the milestoning statements, statistics, the ledger
//! insert and post-actions. Each mode's milestoning lives in its own module.

mod append_only;
mod bitemporal;
mod bulk_load;
mod dedup;
mod nontemporal;
mod unitemporal;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{DataErrorKind, IngestError, IngestResult};
use crate::ingest_mode::{
    DEFAULT_INFINITY_DATE, INFINITE_BATCH_ID, IngestMode, MergeStrategy, VersionResolver,
};
use crate::logical::{
    CompareOp, Condition, Expr, LogicalPlan, Operation, Select, SelectItem, Source, Value, aliased,
};
use crate::models::{
    DataType, DatasetReference, Datasets, FieldType, FilterCondition, FilterOperator,
    SchemaDefinition,
};

/// Lower bound of the data split processed by one pass
pub const DATA_SPLIT_LOWER_BOUND_PLACEHOLDER: &str = "{DATA_SPLIT_LOWER_BOUND_PLACEHOLDER}";

/// Upper bound of the data split processed by one pass
pub const DATA_SPLIT_UPPER_BOUND_PLACEHOLDER: &str = "{DATA_SPLIT_UPPER_BOUND_PLACEHOLDER}";

/// Statistics JSON literal written to the ledger
pub const BATCH_STATISTICS_PLACEHOLDER: &str = "{BATCH_STATISTICS_PLACEHOLDER}";

/// End timestamp literal written to the ledger
pub const BATCH_END_TS_PLACEHOLDER: &str = "{BATCH_END_TS_PLACEHOLDER}";

/// Duplicate count column of the temp staging table
pub const DEDUP_COUNT_FIELD: &str = "ingest_dup_count";

pub(crate) const MAIN_ALIAS: &str = "sink";
pub(crate) const STAGE_ALIAS: &str = "stage";
pub(crate) const META_ALIAS: &str = "meta";

/// Statistic collected per pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatisticName {
    IncomingRecordCount,
    RowsDeleted,
    RowsInserted,
    RowsTerminated,
    RowsUpdated,
}

impl StatisticName {
    pub const ALL: [StatisticName; 5] = [
        StatisticName::IncomingRecordCount,
        StatisticName::RowsDeleted,
        StatisticName::RowsInserted,
        StatisticName::RowsTerminated,
        StatisticName::RowsUpdated,
    ];

    /// Column alias of the statistic query
    pub fn alias(&self) -> &'static str {
        match self {
            StatisticName::IncomingRecordCount => "incomingRecordCount",
            StatisticName::RowsDeleted => "rowsDeleted",
            StatisticName::RowsInserted => "rowsInserted",
            StatisticName::RowsTerminated => "rowsTerminated",
            StatisticName::RowsUpdated => "rowsUpdated",
        }
    }
}

impl std::fmt::Display for StatisticName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatisticName::IncomingRecordCount => write!(f, "INCOMING_RECORD_COUNT"),
            StatisticName::RowsDeleted => write!(f, "ROWS_DELETED"),
            StatisticName::RowsInserted => write!(f, "ROWS_INSERTED"),
            StatisticName::RowsTerminated => write!(f, "ROWS_TERMINATED"),
            StatisticName::RowsUpdated => write!(f, "ROWS_UPDATED"),
        }
    }
}

/// Query whose non-zero result aborts the batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataQualityCheck {
    /// Highest duplicate count among staged rows
    MaxDuplicates,
    /// Highest number of distinct digests per key (and version)
    MaxDataErrors,
    /// Overlapping or empty staged validity intervals
    StagingIntervalOverlaps,
    /// Overlapping open validity intervals after ingest
    MainIntervalOverlaps,
}

impl DataQualityCheck {
    pub fn alias(&self) -> &'static str {
        match self {
            DataQualityCheck::MaxDuplicates => "maxDuplicates",
            DataQualityCheck::MaxDataErrors => "maxDataErrors",
            DataQualityCheck::StagingIntervalOverlaps => "stagingIntervalOverlaps",
            DataQualityCheck::MainIntervalOverlaps => "mainIntervalOverlaps",
        }
    }

    pub fn error_kind(&self) -> DataErrorKind {
        match self {
            DataQualityCheck::MaxDuplicates => DataErrorKind::Duplicates,
            DataQualityCheck::MaxDataErrors => DataErrorKind::ConflictingDigests,
            DataQualityCheck::StagingIntervalOverlaps | DataQualityCheck::MainIntervalOverlaps => {
                DataErrorKind::IntervalCorruption
            }
        }
    }

    /// Largest value the check may return without failing the batch
    pub fn threshold(&self) -> i64 {
        match self {
            DataQualityCheck::MaxDuplicates | DataQualityCheck::MaxDataErrors => 1,
            DataQualityCheck::StagingIntervalOverlaps | DataQualityCheck::MainIntervalOverlaps => {
                0
            }
        }
    }

    /// Error for an observed value above the threshold
    pub fn to_error(&self, observed: i64, table: &str) -> IngestError {
        let message = match self {
            DataQualityCheck::MaxDuplicates => {
                format!("Encountered duplicates in staging for {}, max count {}", table, observed)
            }
            DataQualityCheck::MaxDataErrors => format!(
                "Encountered {} distinct digests for one key and version in staging for {}",
                observed, table
            ),
            DataQualityCheck::StagingIntervalOverlaps => format!(
                "{} staged rows for {} have empty or overlapping validity intervals",
                observed, table
            ),
            DataQualityCheck::MainIntervalOverlaps => format!(
                "{} open rows of {} have overlapping validity intervals",
                observed, table
            ),
        };
        IngestError::data(self.error_kind(), message)
    }
}

/// Per-run inputs of the planner that are not part of the datasets
#[derive(Debug, Clone, PartialEq)]
pub struct PlannerOptions {
    pub cleanup_staging_data: bool,
    pub collect_statistics: bool,
    pub create_staging_dataset: bool,
    pub batch_success_status: String,
    pub additional_metadata: BTreeMap<String, serde_json::Value>,
    pub ingest_request_id: Option<String>,
    /// Batch start, `YYYY-MM-DD HH:MM:SS[.ffffff]`
    pub batch_start_ts: String,
    /// Name the ledger tracks batches under, the main table by default
    pub ledger_table_name: Option<String>,
}

impl Default for PlannerOptions {
    fn default() -> Self {
        Self {
            cleanup_staging_data: true,
            collect_statistics: true,
            create_staging_dataset: false,
            batch_success_status: "DONE".to_string(),
            additional_metadata: BTreeMap::new(),
            ingest_request_id: None,
            batch_start_ts: "2000-01-01 00:00:00".to_string(),
            ledger_table_name: None,
        }
    }
}

/// Every operation group of one ingestion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestPlan {
    /// `CREATE TABLE IF NOT EXISTS` for main, ledger and optionally staging
    pub create_datasets: LogicalPlan,
    pub pre_actions: LogicalPlan,
    pub deduplication_and_versioning: LogicalPlan,
    pub pre_ingest_checks: BTreeMap<DataQualityCheck, Select>,
    pub ingest: LogicalPlan,
    pub post_ingest_checks: BTreeMap<DataQualityCheck, Select>,
    pub pre_ingest_statistics: BTreeMap<StatisticName, Select>,
    pub post_ingest_statistics: BTreeMap<StatisticName, Select>,
    pub metadata_ingest: LogicalPlan,
    pub post_actions: LogicalPlan,
    pub post_cleanup: LogicalPlan,
    pub next_batch_id: Select,
    pub max_data_split: Option<Select>,
    pub idempotency_check: Option<Select>,
}

/// Statements and statistics contributed by one mode
#[derive(Debug, Default)]
pub(crate) struct ModePlan {
    pub pre_actions: Vec<Operation>,
    pub ingest: Vec<Operation>,
    pub post_actions: Vec<Operation>,
    pub pre_ingest_checks: BTreeMap<DataQualityCheck, Select>,
    pub post_ingest_checks: BTreeMap<DataQualityCheck, Select>,
    pub pre_ingest_statistics: BTreeMap<StatisticName, Select>,
    pub post_ingest_statistics: BTreeMap<StatisticName, Select>,
}

/// Shared facts and expression builders for the mode planners
pub(crate) struct PlanContext<'a> {
    pub mode: &'a IngestMode,
    pub datasets: &'a Datasets,
    pub options: &'a PlannerOptions,
    /// Main schema including mode-owned columns
    pub main_schema: SchemaDefinition,
    pub primary_keys: Vec<String>,
    /// Columns copied verbatim from staging to main
    pub data_columns: Vec<String>,
    /// Whether the mode reads the dedup/versioning temp staging table
    pub uses_temp_staging: bool,
}

impl<'a> PlanContext<'a> {
    pub fn new(
        mode: &'a IngestMode,
        datasets: &'a Datasets,
        options: &'a PlannerOptions,
    ) -> IngestResult<Self> {
        let main_schema = mode.enrich_main_schema(&datasets.main.schema, &datasets.staging.schema);
        let staging = &datasets.staging.schema;

        let owned: Vec<String> = mode
            .main_owned_fields()
            .into_iter()
            .map(|f| f.name)
            .collect();
        let mut staging_only = mode.staging_only_fields();
        if let Some(validity) = mode.validity_milestoning() {
            staging_only.extend(validity.source_fields().into_iter().map(str::to_string));
        }
        let is_business = |name: &&str| {
            !owned.iter().any(|o| o.as_str() == *name)
                && !staging_only.iter().any(|s| s.as_str() == *name)
        };

        let main_keys = main_schema.primary_key_names();
        let mut primary_keys: Vec<String> = staging
            .primary_key_names()
            .into_iter()
            .filter(is_business)
            .filter(|k| main_keys.contains(k))
            .map(str::to_string)
            .collect();
        if primary_keys.is_empty() && !main_keys.iter().any(is_business) {
            primary_keys = staging
                .primary_key_names()
                .into_iter()
                .filter(is_business)
                .filter(|k| main_schema.contains(k))
                .map(str::to_string)
                .collect();
        }

        let data_columns = main_schema
            .fields()
            .iter()
            .map(|f| f.name.clone())
            .filter(|n| staging.contains(n) && !owned.contains(n) && !staging_only.contains(n))
            .collect();

        let uses_temp_staging = !matches!(
            mode.deduplication(),
            crate::ingest_mode::DeduplicationStrategy::AllowDuplicates
        ) || !mode.versioning().is_none();

        let ctx = Self {
            mode,
            datasets,
            options,
            main_schema,
            primary_keys,
            data_columns,
            uses_temp_staging,
        };
        ctx.validate()?;
        Ok(ctx)
    }

    fn validate(&self) -> IngestResult<()> {
        if let Some(resolver) = self.mode.versioning().resolver()
            && resolver != VersionResolver::DigestBased
            && let Some(field) = self.mode.versioning().version_field()
            && !self.main_schema.contains(field)
        {
            return Err(IngestError::Configuration(format!(
                "Version resolver {:?} needs versioning field '{}' in the main dataset",
                resolver, field
            )));
        }
        if let Some(digest) = self.mode.digest().digest_field()
            && !self.main_schema.contains(digest)
        {
            return Err(IngestError::Configuration(format!(
                "Digest field '{}' is not present in the main dataset",
                digest
            )));
        }
        Ok(())
    }

    pub fn key_refs(&self) -> Vec<&str> {
        self.primary_keys.iter().map(String::as_str).collect()
    }

    /// Main table aliased `alias`
    pub fn main_as(&self, alias: &str) -> DatasetReference {
        self.datasets.main.reference.clone().with_alias(alias)
    }

    pub fn main_ref(&self) -> DatasetReference {
        self.main_as(MAIN_ALIAS)
    }

    /// Staging table actually read by the mode, aliased `alias`
    pub fn stage_table_as(&self, alias: &str) -> DatasetReference {
        let reference = if self.uses_temp_staging {
            self.datasets.temp_staging_reference()
        } else {
            let mut reference = self.datasets.staging.reference.clone();
            reference.alias = None;
            reference
        };
        reference.with_alias(alias)
    }

    /// Source of staged rows aliased `alias`
    pub fn stage_source_as(&self, alias: &str) -> IngestResult<Source> {
        match self.datasets.staging.staged_files_properties() {
            Some(properties) => Ok(Source::StagedFiles {
                properties: properties.clone(),
                files: properties.resolve_files()?,
                schema: self.datasets.staging.schema.clone(),
                alias: alias.to_string(),
            }),
            None => Ok(Source::Table(self.stage_table_as(alias))),
        }
    }

    /// Row restriction of the staged rows: dataset filter or data split
    pub fn stage_filter(&self, alias: &str) -> Option<Condition> {
        let mut conditions = Vec::new();
        if !self.uses_temp_staging
            && let Some(filter) = self.datasets.staging.filter_condition()
        {
            conditions.push(filter_to_condition(&filter, alias));
        }
        if let Some(split) = self.data_split_condition(alias) {
            conditions.push(split);
        }
        if conditions.is_empty() {
            None
        } else {
            Some(Condition::all(conditions))
        }
    }

    pub fn data_split_condition(&self, alias: &str) -> Option<Condition> {
        let field = self.mode.versioning().data_split_field()?;
        Some(Condition::all(vec![
            Expr::col(alias, field).gte(Expr::Placeholder(
                DATA_SPLIT_LOWER_BOUND_PLACEHOLDER.to_string(),
            )),
            Expr::col(alias, field).lte(Expr::Placeholder(
                DATA_SPLIT_UPPER_BOUND_PLACEHOLDER.to_string(),
            )),
        ]))
    }

    /// `SELECT <projection> FROM stage WHERE <filter> AND <condition>`
    pub fn select_from_stage(
        &self,
        alias: &str,
        projection: Vec<SelectItem>,
        condition: Option<Condition>,
    ) -> IngestResult<Select> {
        Ok(Select::from_source(self.stage_source_as(alias)?, projection)
            .with_optional_where(self.stage_filter(alias))
            .with_optional_where(condition))
    }

    /// Digest of a staged row aliased `alias`
    pub fn stage_digest(&self, alias: &str) -> Option<Expr> {
        let mut exclusions = self.mode.staging_only_fields();
        if let Some(validity) = self.mode.validity_milestoning() {
            exclusions.extend(validity.source_fields().into_iter().map(str::to_string));
        }
        crate::digest::digest_expression(
            self.mode.digest(),
            &self.datasets.staging.schema,
            alias,
            &exclusions,
        )
    }

    /// Digest column of a main row aliased `alias`
    pub fn main_digest(&self, alias: &str) -> Option<Expr> {
        self.mode.digest().digest_field().map(|f| Expr::col(alias, f))
    }

    /// `sink.digest <> digest(stage)`
    pub fn digest_differs(&self, main_alias: &str, stage_alias: &str) -> Option<Condition> {
        Some(
            self.main_digest(main_alias)?
                .not_equals(self.stage_digest(stage_alias)?),
        )
    }

    /// `sink.digest = digest(stage)`
    pub fn digest_matches(&self, main_alias: &str, stage_alias: &str) -> Option<Condition> {
        Some(self.main_digest(main_alias)?.equals(self.stage_digest(stage_alias)?))
    }

    /// Staged row carries a delete indicator value
    pub fn deleted(&self, alias: &str) -> Option<Condition> {
        match self.mode.merge()? {
            MergeStrategy::NoDeletes => None,
            MergeStrategy::DeleteIndicator { field, values } => Some(Condition::In {
                expr: Expr::col(alias, field),
                values: values.iter().map(|v| Expr::Literal(Value::from(v))).collect(),
                negated: false,
            }),
        }
    }

    /// Staged row does not carry a delete indicator value (NULL included)
    pub fn not_deleted(&self, alias: &str) -> Option<Condition> {
        match self.mode.merge()? {
            MergeStrategy::NoDeletes => None,
            MergeStrategy::DeleteIndicator { field, values } => Some(Condition::any(vec![
                Condition::IsNull(Expr::col(alias, field)),
                Condition::In {
                    expr: Expr::col(alias, field),
                    values: values.iter().map(|v| Expr::Literal(Value::from(v))).collect(),
                    negated: true,
                },
            ])),
        }
    }

    /// Staged version may replace the active main version
    pub fn version_allows_replace(&self, main_alias: &str, stage_alias: &str) -> Option<Condition> {
        let field = self.mode.versioning().version_field()?;
        let op = match self.mode.versioning().resolver()? {
            VersionResolver::DigestBased => return None,
            VersionResolver::GreaterThanActiveVersion => CompareOp::Gt,
            VersionResolver::GreaterThanEqualToActiveVersion => CompareOp::Gte,
        };
        Some(Condition::compare(
            Expr::col(stage_alias, field),
            op,
            Expr::col(main_alias, field),
        ))
    }

    /// Table name the ledger tracks batches under
    pub fn ledger_table_name(&self) -> String {
        self.options
            .ledger_table_name
            .clone()
            .unwrap_or_else(|| self.datasets.main.name().to_string())
    }

    /// `UPPER(meta.table_name) = '<TABLE>'`
    pub fn ledger_row_condition(&self) -> Condition {
        let meta = &self.datasets.metadata;
        Expr::func("UPPER", vec![Expr::col(META_ALIAS, &meta.table_name_field)])
            .equals(Expr::string(self.ledger_table_name().to_uppercase()))
    }

    /// Next batch id of the main table, derived from the ledger
    pub fn batch_id(&self) -> Expr {
        let meta = &self.datasets.metadata;
        let select = Select::from_source(
            Source::Table(meta.reference.clone().with_alias(META_ALIAS)),
            vec![SelectItem::from(
                Expr::coalesce(vec![
                    Expr::max(Expr::col(META_ALIAS, &meta.table_batch_id_field)),
                    Expr::int(0),
                ])
                .plus(Expr::int(1)),
            )],
        )
        .with_where(self.ledger_row_condition());
        Expr::subquery(select)
    }

    /// Batch id that closed rows carry as their out value
    pub fn closing_batch_id(&self) -> Expr {
        self.batch_id().minus(Expr::int(1))
    }

    pub fn batch_ts(&self) -> Expr {
        timestamp(&self.options.batch_start_ts)
    }

    /// Copy of data columns, UDF digest and audit column from `alias`
    pub fn staged_values(&self, alias: &str) -> Vec<(String, Expr)> {
        let mut values: Vec<(String, Expr)> = self
            .data_columns
            .iter()
            .map(|c| (c.clone(), Expr::col(alias, c)))
            .collect();
        if let crate::ingest_mode::DigestGenStrategy::UdfBased { digest_field, .. } =
            self.mode.digest()
            && let Some(digest) = self.stage_digest(alias)
        {
            values.push((digest_field.clone(), digest));
        }
        if let Some(audit) = self.mode.auditing().field() {
            values.push((audit.to_string(), self.batch_ts()));
        }
        values
    }

    /// Incoming record count of the pass
    pub fn incoming_record_count(&self) -> IngestResult<Select> {
        let count = if self.uses_temp_staging && self.has_dedup_count() {
            Expr::coalesce(vec![
                Expr::func("SUM", vec![Expr::col(STAGE_ALIAS, DEDUP_COUNT_FIELD)]),
                Expr::int(0),
            ])
        } else {
            Expr::count_star()
        };
        self.select_from_stage(
            STAGE_ALIAS,
            vec![aliased(count, StatisticName::IncomingRecordCount.alias())],
            None,
        )
    }

    pub fn has_dedup_count(&self) -> bool {
        !matches!(
            self.mode.deduplication(),
            crate::ingest_mode::DeduplicationStrategy::AllowDuplicates
        )
    }

    /// `SELECT COUNT(*) as "<stat>" FROM main as sink WHERE <condition>`
    pub fn count_main(&self, statistic: StatisticName, condition: Condition) -> Select {
        Select::from_source(
            Source::Table(self.main_ref()),
            vec![aliased(Expr::count_star(), statistic.alias())],
        )
        .with_where(condition)
    }
}

/// `SELECT 0 as "<stat>"` for statistics a mode never changes
pub(crate) fn zero_statistic(statistic: StatisticName) -> Select {
    Select::values(vec![aliased(Expr::int(0), statistic.alias())])
}

/// Cast of a timestamp string literal
pub(crate) fn timestamp(value: &str) -> Expr {
    Expr::cast(Expr::string(value), FieldType::of(DataType::DateTime))
}

/// Condition equivalent to a dataset filter tree on rows aliased `alias`
pub fn filter_to_condition(filter: &FilterCondition, alias: &str) -> Condition {
    match filter {
        FilterCondition::Leaf(f) => {
            let op = match f.operator {
                FilterOperator::Eq => CompareOp::Eq,
                FilterOperator::Ne => CompareOp::Ne,
                FilterOperator::Gt => CompareOp::Gt,
                FilterOperator::Gte => CompareOp::Gte,
                FilterOperator::Lt => CompareOp::Lt,
                FilterOperator::Lte => CompareOp::Lte,
            };
            Condition::compare(
                Expr::col(alias, &f.field),
                op,
                Expr::Literal(Value::from(&f.value)),
            )
        }
        FilterCondition::And(children) => Condition::all(
            children
                .iter()
                .map(|c| filter_to_condition(c, alias))
                .collect(),
        ),
        FilterCondition::Or(children) => Condition::any(
            children
                .iter()
                .map(|c| filter_to_condition(c, alias))
                .collect(),
        ),
    }
}

fn create_table(dataset_ref: &DatasetReference, schema: &SchemaDefinition) -> Operation {
    let mut table = dataset_ref.clone();
    table.alias = None;
    Operation::CreateTable {
        table,
        schema: schema.clone(),
        if_not_exists: true,
    }
}

fn drop_table(dataset_ref: &DatasetReference) -> Operation {
    let mut table = dataset_ref.clone();
    table.alias = None;
    Operation::DropTable {
        table,
        if_exists: true,
    }
}

/// Build the full plan of one ingestion
pub fn plan(
    mode: &IngestMode,
    datasets: &Datasets,
    options: &PlannerOptions,
) -> IngestResult<IngestPlan> {
    let ctx = PlanContext::new(mode, datasets, options)?;

    let mode_plan = match mode {
        IngestMode::AppendOnly(m) => append_only::plan(&ctx, m)?,
        IngestMode::NontemporalSnapshot(m) => nontemporal::plan_snapshot(&ctx, m)?,
        IngestMode::NontemporalDelta(_) => nontemporal::plan_delta(&ctx)?,
        IngestMode::UnitemporalSnapshot(m) => unitemporal::plan_snapshot(&ctx, m)?,
        IngestMode::UnitemporalDelta(_) => unitemporal::plan_delta(&ctx)?,
        IngestMode::BitemporalDelta(m) => bitemporal::plan(&ctx, m)?,
        IngestMode::BulkLoad(m) => bulk_load::plan(&ctx, m)?,
    };

    let mut plan = IngestPlan {
        next_batch_id: Select::values(vec![aliased(ctx.batch_id(), "nextBatchId")]),
        ..Default::default()
    };

    plan.create_datasets
        .push(create_table(&datasets.main.reference, &ctx.main_schema));
    if options.create_staging_dataset && !datasets.staging.is_staged_files() {
        plan.create_datasets
            .push(create_table(&datasets.staging.reference, &datasets.staging.schema));
    }
    plan.create_datasets
        .push(create_table(&datasets.metadata.reference, &datasets.metadata.schema()));
    plan.pre_actions = mode_plan.pre_actions.into();

    // deduplication and versioning
    if ctx.uses_temp_staging {
        let dedup = dedup::plan(&ctx)?;
        plan.deduplication_and_versioning = dedup.operations;
        plan.pre_ingest_checks = dedup.checks;
        plan.max_data_split = dedup.max_data_split;
        plan.post_actions
            .push(drop_table(&datasets.temp_staging_reference()));
    }
    plan.pre_ingest_checks.extend(mode_plan.pre_ingest_checks);

    plan.ingest = mode_plan.ingest.into();
    plan.post_ingest_checks = mode_plan.post_ingest_checks;

    if options.collect_statistics {
        plan.pre_ingest_statistics = mode_plan.pre_ingest_statistics;
        plan.pre_ingest_statistics
            .insert(StatisticName::IncomingRecordCount, ctx.incoming_record_count()?);
        plan.post_ingest_statistics = mode_plan.post_ingest_statistics;
    }

    plan.metadata_ingest = metadata_ingest(&ctx)?;
    plan.idempotency_check = idempotency_check(&ctx);

    // post-actions
    if options.cleanup_staging_data && !datasets.staging.is_staged_files() {
        let mut staging = datasets.staging.reference.clone();
        staging.alias = Some(STAGE_ALIAS.to_string());
        plan.post_actions.push(Operation::Delete {
            table: staging,
            where_clause: None,
        });
    }
    plan.post_actions
        .extend(mode_plan.post_actions.into());
    if options.create_staging_dataset && !datasets.staging.is_staged_files() {
        plan.post_cleanup
            .push(drop_table(&datasets.staging.reference));
    }

    Ok(plan)
}

/// Ledger row of the pass
fn metadata_ingest(ctx: &PlanContext) -> IngestResult<LogicalPlan> {
    let meta = &ctx.datasets.metadata;
    let options = ctx.options;

    let mut values: Vec<(String, Expr)> = vec![
        (
            meta.table_name_field.clone(),
            Expr::string(ctx.ledger_table_name()),
        ),
        (meta.table_batch_id_field.clone(), ctx.batch_id()),
        (meta.batch_start_ts_field.clone(), ctx.batch_ts()),
        (
            meta.batch_end_ts_field.clone(),
            Expr::cast(
                Expr::Placeholder(BATCH_END_TS_PLACEHOLDER.to_string()),
                FieldType::of(DataType::DateTime),
            ),
        ),
        (
            meta.batch_status_field.clone(),
            Expr::string(options.batch_success_status.clone()),
        ),
    ];
    if let Some(info) = ctx.datasets.staging.source_info()? {
        values.push((
            meta.batch_source_info_field.clone(),
            Expr::string(serde_json::to_string(&info)?),
        ));
    }
    if !options.additional_metadata.is_empty() {
        values.push((
            meta.additional_metadata_field.clone(),
            Expr::string(serde_json::to_string(&options.additional_metadata)?),
        ));
    }
    if let Some(request_id) = &options.ingest_request_id {
        values.push((
            meta.ingest_request_id_field.clone(),
            Expr::string(request_id.clone()),
        ));
    }
    values.push((
        meta.batch_statistics_field.clone(),
        Expr::Placeholder(BATCH_STATISTICS_PLACEHOLDER.to_string()),
    ));

    Ok(LogicalPlan::new(vec![insert_values(
        meta.reference.clone(),
        values,
    )]))
}

/// Ledger rows already recorded for the run's request id
fn idempotency_check(ctx: &PlanContext) -> Option<Select> {
    let request_id = ctx.options.ingest_request_id.as_ref()?;
    let meta = &ctx.datasets.metadata;
    Some(
        Select::from_source(
            Source::Table(meta.reference.clone().with_alias(META_ALIAS)),
            vec![
                aliased(
                    Expr::col(META_ALIAS, &meta.table_batch_id_field),
                    "batchId",
                ),
                aliased(
                    Expr::cast(
                        Expr::col(META_ALIAS, &meta.batch_statistics_field),
                        FieldType::of(DataType::Varchar),
                    ),
                    "batchStatistics",
                ),
            ],
        )
        .with_where(ctx.ledger_row_condition())
        .with_where(
            Expr::col(META_ALIAS, &meta.ingest_request_id_field)
                .equals(Expr::string(request_id.clone())),
        )
        .with_where(
            Expr::col(META_ALIAS, &meta.batch_status_field)
                .equals(Expr::string(ctx.options.batch_success_status.clone())),
        ),
    )
}

/// `INSERT INTO table (cols) (SELECT values)` without a source table
pub(crate) fn insert_values(table: DatasetReference, values: Vec<(String, Expr)>) -> Operation {
    let (columns, exprs): (Vec<String>, Vec<Expr>) = values.into_iter().unzip();
    Operation::Insert {
        table,
        columns,
        select: Select::values(exprs.into_iter().map(SelectItem::from).collect()),
    }
}

/// `INSERT INTO table (cols) (SELECT values FROM <select source> ...)`
pub(crate) fn insert_select(
    table: DatasetReference,
    values: Vec<(String, Expr)>,
    mut select: Select,
) -> Operation {
    let (columns, exprs): (Vec<String>, Vec<Expr>) = values.into_iter().unzip();
    select.projection = exprs.into_iter().map(SelectItem::from).collect();
    let mut table = table;
    table.alias = None;
    Operation::Insert {
        table,
        columns,
        select,
    }
}

/// Open-row condition on main rows aliased `alias`
pub(crate) fn open_condition(ctx: &PlanContext, alias: &str) -> Option<Condition> {
    let tm = ctx.mode.transaction_milestoning()?;
    Some(match tm.batch_id_fields() {
        Some((_, batch_out)) => Expr::col(alias, batch_out).equals(Expr::int(INFINITE_BATCH_ID)),
        None => {
            let (_, time_out) = tm.date_time_fields()?;
            Expr::col(alias, time_out).equals(timestamp(DEFAULT_INFINITY_DATE))
        }
    })
}
