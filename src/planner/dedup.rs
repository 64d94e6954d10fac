//! Deduplication and versioning of staged rows
//!
//! Rows are copied into a temp staging table: duplicates collapsed with
//! their count, then ranked by version per primary key. Max-version keeps the
//! top rank; all-versions keeps every rank as the row's data split.

use std::collections::BTreeMap;

use crate::error::IngestResult;
use crate::ingest_mode::{DeduplicationStrategy, VersioningStrategy};
use crate::logical::{
    Expr, LogicalPlan, Operation, Order, Select, SelectItem, Source, aliased,
};
use crate::models::{DataType, Field, SchemaDefinition};

use super::{DEDUP_COUNT_FIELD, DataQualityCheck, PlanContext, STAGE_ALIAS, filter_to_condition};

/// Rank column of the max-version filter
const RANK_FIELD: &str = "ingest_rank";
const DISTINCT_COUNT_FIELD: &str = "distinct_count";

#[derive(Debug, Default)]
pub(crate) struct DedupPlan {
    pub operations: LogicalPlan,
    pub checks: BTreeMap<DataQualityCheck, Select>,
    pub max_data_split: Option<Select>,
}

/// Schema of the temp staging table
pub(crate) fn temp_staging_schema(ctx: &PlanContext) -> IngestResult<SchemaDefinition> {
    let mut fields: Vec<Field> = ctx
        .datasets
        .staging
        .schema
        .fields()
        .iter()
        .map(|f| f.clone().without_primary_key())
        .collect();
    if ctx.has_dedup_count() {
        fields.push(Field::new(DEDUP_COUNT_FIELD, DataType::Int));
    }
    if let Some(split) = ctx.mode.versioning().data_split_field() {
        fields.push(Field::new(split, DataType::Int));
    }
    SchemaDefinition::new(fields)
}

fn columns(ctx: &PlanContext, alias: &str) -> Vec<Expr> {
    ctx.datasets
        .staging
        .schema
        .fields()
        .iter()
        .map(|f| Expr::col(alias, &f.name))
        .collect()
}

fn items(exprs: Vec<Expr>) -> Vec<SelectItem> {
    exprs.into_iter().map(SelectItem::from).collect()
}

/// Staged rows of the dataset, filtered, with duplicates collapsed when asked
fn deduplicated(ctx: &PlanContext) -> Select {
    let mut staging = ctx.datasets.staging.reference.clone();
    staging.alias = Some(STAGE_ALIAS.to_string());
    let filter = ctx
        .datasets
        .staging
        .filter_condition()
        .map(|f| filter_to_condition(&f, STAGE_ALIAS));

    let mut projection = items(columns(ctx, STAGE_ALIAS));
    let mut select = Select::from_source(Source::Table(staging), vec![]).with_optional_where(filter);
    if ctx.has_dedup_count() {
        projection.push(aliased(Expr::count_star(), DEDUP_COUNT_FIELD));
        select = select.with_group_by(columns(ctx, STAGE_ALIAS));
    }
    select.projection = projection;
    select
}

fn version_rank(ctx: &PlanContext, field: &str, order: Order) -> Expr {
    Expr::Window {
        function: "DENSE_RANK".to_string(),
        partition_by: ctx
            .primary_keys
            .iter()
            .map(|k| Expr::col(STAGE_ALIAS, k))
            .collect(),
        order_by: vec![(Expr::col(STAGE_ALIAS, field), order)],
    }
}

pub(crate) fn plan(ctx: &PlanContext) -> IngestResult<DedupPlan> {
    let temp = ctx.datasets.temp_staging_reference();
    let schema = temp_staging_schema(ctx)?;

    let mut carried = columns(ctx, STAGE_ALIAS);
    if ctx.has_dedup_count() {
        carried.push(Expr::col(STAGE_ALIAS, DEDUP_COUNT_FIELD));
    }
    let unique = deduplicated(ctx);

    let select = match ctx.mode.versioning() {
        VersioningStrategy::NoVersioning => unique,
        VersioningStrategy::MaxVersion { field, .. } => {
            let mut ranked = items(carried.clone());
            ranked.push(aliased(version_rank(ctx, field, Order::Desc), RANK_FIELD));
            let inner = Select::from_source(
                Source::Subquery {
                    select: Box::new(unique),
                    alias: STAGE_ALIAS.to_string(),
                },
                ranked,
            );
            Select::from_source(
                Source::Subquery {
                    select: Box::new(inner),
                    alias: STAGE_ALIAS.to_string(),
                },
                items(carried.clone()),
            )
            .with_where(Expr::col(STAGE_ALIAS, RANK_FIELD).equals(Expr::int(1)))
        }
        VersioningStrategy::AllVersions {
            field,
            data_split_field,
            ..
        } => {
            let mut projection = items(carried.clone());
            projection.push(aliased(
                version_rank(ctx, field, Order::Asc),
                data_split_field,
            ));
            Select::from_source(
                Source::Subquery {
                    select: Box::new(unique),
                    alias: STAGE_ALIAS.to_string(),
                },
                projection,
            )
        }
    };

    let insert_columns = schema.fields().iter().map(|f| f.name.clone()).collect();
    let operations = LogicalPlan::new(vec![
        Operation::DropTable {
            table: temp.clone(),
            if_exists: true,
        },
        Operation::CreateTable {
            table: temp.clone(),
            schema,
            if_not_exists: true,
        },
        Operation::Insert {
            table: temp.clone(),
            columns: insert_columns,
            select,
        },
    ]);

    let temp_source = || Source::Table(temp.clone().with_alias(STAGE_ALIAS));
    let mut plan = DedupPlan {
        operations,
        ..Default::default()
    };

    if ctx.mode.deduplication() == DeduplicationStrategy::FailOnDuplicates {
        plan.checks.insert(
            DataQualityCheck::MaxDuplicates,
            Select::from_source(
                temp_source(),
                vec![aliased(
                    Expr::coalesce(vec![
                        Expr::max(Expr::col(STAGE_ALIAS, DEDUP_COUNT_FIELD)),
                        Expr::int(0),
                    ]),
                    DataQualityCheck::MaxDuplicates.alias(),
                )],
            ),
        );
    }

    let versioned = !ctx.mode.versioning().is_none();
    let strict = ctx.mode.deduplication() == DeduplicationStrategy::FailOnDuplicates;
    if (versioned || strict) && !ctx.primary_keys.is_empty() {
        let mut group: Vec<Expr> = ctx
            .primary_keys
            .iter()
            .map(|k| Expr::col(STAGE_ALIAS, k))
            .collect();
        group.extend(
            ctx.mode
                .versioning()
                .version_field()
                .map(|v| Expr::col(STAGE_ALIAS, v)),
        );

        // distinct digests per key, or distinct rows when there is no digest
        let per_key = match ctx.stage_digest(STAGE_ALIAS) {
            Some(digest) => Select::from_source(
                temp_source(),
                vec![aliased(Expr::count_distinct(digest), DISTINCT_COUNT_FIELD)],
            ),
            None => Select::from_source(
                Source::Subquery {
                    select: Box::new(
                        Select::from_source(temp_source(), items(columns(ctx, STAGE_ALIAS)))
                            .distinct(),
                    ),
                    alias: STAGE_ALIAS.to_string(),
                },
                vec![aliased(Expr::count_star(), DISTINCT_COUNT_FIELD)],
            ),
        }
        .with_group_by(group);

        plan.checks.insert(
            DataQualityCheck::MaxDataErrors,
            Select::from_source(
                Source::Subquery {
                    select: Box::new(per_key),
                    alias: STAGE_ALIAS.to_string(),
                },
                vec![aliased(
                    Expr::coalesce(vec![
                        Expr::max(Expr::col(STAGE_ALIAS, DISTINCT_COUNT_FIELD)),
                        Expr::int(0),
                    ]),
                    DataQualityCheck::MaxDataErrors.alias(),
                )],
            ),
        );
    }

    if let Some(split) = ctx.mode.versioning().data_split_field() {
        plan.max_data_split = Some(Select::from_source(
            temp_source(),
            vec![aliased(
                Expr::coalesce(vec![Expr::max(Expr::col(STAGE_ALIAS, split)), Expr::int(0)]),
                "maxDataSplit",
            )],
        ));
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use crate::ingest_mode::{
        AppendOnly, DeduplicationStrategy, DigestGenStrategy, IngestMode, VersioningStrategy,
    };
    use crate::models::{
        DataType, Dataset, Datasets, DatasetFilter, Field, FilterCondition, FilterOperator,
        FilterValue, SchemaDefinition,
    };
    use crate::planner::{DataQualityCheck, PlannerOptions, plan};
    use crate::sink::{DuckDbSink, SqlRenderer};

    fn datasets() -> Datasets {
        let staging = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("version", DataType::Int),
        ])
        .unwrap();
        Datasets::new(
            Dataset::new("main", SchemaDefinition::empty()),
            Dataset::new("staging", staging),
        )
        .unwrap()
    }

    #[test]
    fn test_filter_duplicates_then_max_version() {
        let mode = IngestMode::from(AppendOnly {
            deduplication: DeduplicationStrategy::FilterDuplicates,
            versioning: VersioningStrategy::max_version("version"),
            ..Default::default()
        });
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.deduplication_and_versioning)
            .unwrap();

        assert_eq!(sql[0], "DROP TABLE IF EXISTS \"staging_ingest_temp_staging\"");
        assert_eq!(
            sql[1],
            "CREATE TABLE IF NOT EXISTS \"staging_ingest_temp_staging\"(\"id\" INTEGER NOT NULL, \"name\" VARCHAR, \"version\" INTEGER, \"ingest_dup_count\" INTEGER)"
        );
        assert_eq!(
            sql[2],
            "INSERT INTO \"staging_ingest_temp_staging\" (\"id\", \"name\", \"version\", \"ingest_dup_count\") \
             (SELECT stage.\"id\",stage.\"name\",stage.\"version\",stage.\"ingest_dup_count\" FROM \
             (SELECT stage.\"id\",stage.\"name\",stage.\"version\",stage.\"ingest_dup_count\",DENSE_RANK() OVER (PARTITION BY stage.\"id\" ORDER BY stage.\"version\" DESC) as \"ingest_rank\" FROM \
             (SELECT stage.\"id\",stage.\"name\",stage.\"version\",COUNT(*) as \"ingest_dup_count\" FROM \"staging\" as stage GROUP BY stage.\"id\", stage.\"name\", stage.\"version\") as stage) as stage \
             WHERE stage.\"ingest_rank\" = 1)"
        );

        // conflicts are checked per key and version, without a digest by distinct rows
        let check = SqlRenderer::new(&DuckDbSink)
            .render_select(&plan.pre_ingest_checks[&DataQualityCheck::MaxDataErrors])
            .unwrap();
        assert_eq!(
            check,
            "SELECT COALESCE(MAX(stage.\"distinct_count\"),0) as \"maxDataErrors\" FROM \
             (SELECT COUNT(*) as \"distinct_count\" FROM (SELECT DISTINCT stage.\"id\",stage.\"name\",stage.\"version\" FROM \"staging_ingest_temp_staging\" as stage) as stage \
             GROUP BY stage.\"id\", stage.\"version\") as stage"
        );
        assert!(!plan
            .pre_ingest_checks
            .contains_key(&DataQualityCheck::MaxDuplicates));
    }

    #[test]
    fn test_fail_on_duplicates_and_all_versions() {
        let mode = IngestMode::from(AppendOnly {
            digest: DigestGenStrategy::udf_based("md5", "digest"),
            deduplication: DeduplicationStrategy::FailOnDuplicates,
            versioning: VersioningStrategy::all_versions("version"),
            ..Default::default()
        });
        let filtered = datasets().with_staging(
            Dataset::new("staging", datasets().staging.schema).filtered(FilterCondition::Leaf(
                DatasetFilter::new("version", FilterOperator::Gt, FilterValue::Integer(0)),
            )),
        );
        let plan = plan(&mode, &filtered, &PlannerOptions::default()).unwrap();
        let renderer = SqlRenderer::new(&DuckDbSink);
        let sql = renderer
            .render_plan(&plan.deduplication_and_versioning)
            .unwrap();

        assert!(sql[1].ends_with("\"ingest_dup_count\" INTEGER, \"data_split\" INTEGER)"));
        assert!(sql[2].contains(
            "DENSE_RANK() OVER (PARTITION BY stage.\"id\" ORDER BY stage.\"version\" ASC) as \"data_split\""
        ));
        // the dataset filter applies while copying
        assert!(sql[2].contains("FROM \"staging\" as stage WHERE stage.\"version\" > 0 GROUP BY"));

        let duplicates = renderer
            .render_select(&plan.pre_ingest_checks[&DataQualityCheck::MaxDuplicates])
            .unwrap();
        assert_eq!(
            duplicates,
            "SELECT COALESCE(MAX(stage.\"ingest_dup_count\"),0) as \"maxDuplicates\" FROM \"staging_ingest_temp_staging\" as stage"
        );
        assert!(renderer
            .render_select(&plan.pre_ingest_checks[&DataQualityCheck::MaxDataErrors])
            .unwrap()
            .contains("COUNT(DISTINCT md5(CONCAT("));
        assert!(plan.max_data_split.is_some());

        // passes read their data split through placeholders
        let ingest = renderer.render_plan(&plan.ingest).unwrap();
        assert!(ingest[0].contains(
            "stage.\"data_split\" >= {DATA_SPLIT_LOWER_BOUND_PLACEHOLDER}"
        ));
    }
}
