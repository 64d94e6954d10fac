//! Append-only milestoning

use crate::error::IngestResult;
use crate::ingest_mode::AppendOnly;
use crate::logical::{Condition, Expr, Select};

use super::{
    MAIN_ALIAS, ModePlan, PlanContext, STAGE_ALIAS, StatisticName, insert_select, zero_statistic,
};

pub(super) fn plan(ctx: &PlanContext, mode: &AppendOnly) -> IngestResult<ModePlan> {
    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.push((mode.batch_id_field.clone(), ctx.batch_id()));

    let mut condition = None;
    if mode.filter_existing_records {
        let mut matched = vec![];
        if !ctx.primary_keys.is_empty() {
            matched.push(Condition::columns_match(
                MAIN_ALIAS,
                STAGE_ALIAS,
                &ctx.key_refs(),
            ));
        }
        matched.extend(ctx.digest_matches(MAIN_ALIAS, STAGE_ALIAS));
        condition = Some(Condition::not_exists(
            Select::star_from(&ctx.main_ref()).with_where(Condition::all(matched)),
        ));
    }

    let select = ctx.select_from_stage(STAGE_ALIAS, vec![], condition)?;
    let mut plan = ModePlan {
        ingest: vec![insert_select(ctx.main_ref(), values, select)],
        ..Default::default()
    };
    insert_only_statistics(ctx, &mode.batch_id_field, &mut plan);
    Ok(plan)
}

/// Statistics of modes that only ever insert rows tagged with the batch id
pub(super) fn insert_only_statistics(ctx: &PlanContext, batch_id_field: &str, plan: &mut ModePlan) {
    plan.post_ingest_statistics.insert(
        StatisticName::RowsInserted,
        ctx.count_main(
            StatisticName::RowsInserted,
            Expr::col(MAIN_ALIAS, batch_id_field).equals(ctx.batch_id()),
        ),
    );
    for statistic in [
        StatisticName::RowsUpdated,
        StatisticName::RowsDeleted,
        StatisticName::RowsTerminated,
    ] {
        plan.post_ingest_statistics
            .insert(statistic, zero_statistic(statistic));
    }
}

#[cfg(test)]
mod tests {
    use crate::ingest_mode::{AppendOnly, DigestGenStrategy, IngestMode};
    use crate::models::{DataType, Dataset, Datasets, Field, SchemaDefinition};
    use crate::planner::{PlannerOptions, plan};
    use crate::sink::{AnsiSqlSink, SqlRenderer};

    fn datasets() -> Datasets {
        let staging = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("digest", DataType::Varchar),
        ])
        .unwrap();
        Datasets::new(
            Dataset::new("main", SchemaDefinition::empty()),
            Dataset::new("staging", staging),
        )
        .unwrap()
    }

    #[test]
    fn test_filter_existing_records_anti_joins_on_key_and_digest() {
        let mode = IngestMode::from(AppendOnly {
            digest: DigestGenStrategy::user_provided("digest"),
            filter_existing_records: true,
            ..Default::default()
        });
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&AnsiSqlSink)
            .render_plan(&plan.ingest)
            .unwrap();
        assert_eq!(sql.len(), 1);
        assert!(sql[0].starts_with(
            "INSERT INTO \"main\" (\"id\", \"name\", \"digest\", \"batch_id\") (SELECT stage.\"id\",stage.\"name\",stage.\"digest\","
        ));
        assert!(sql[0].contains(
            "WHERE NOT (EXISTS (SELECT * FROM \"main\" as sink WHERE (sink.\"id\" = stage.\"id\") AND (sink.\"digest\" = stage.\"digest\")))"
        ));
    }

    #[test]
    fn test_statistics_count_batch_rows() {
        let mode = IngestMode::from(AppendOnly::default());
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        assert_eq!(plan.post_ingest_statistics.len(), 4);
        assert_eq!(plan.pre_ingest_statistics.len(), 1);
        assert!(plan.ingest.operations.len() == 1);
    }
}
