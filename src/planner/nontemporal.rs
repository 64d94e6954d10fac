//! Nontemporal snapshot and delta

use crate::error::IngestResult;
use crate::ingest_mode::{EmptyBatchHandling, NontemporalSnapshot};
use crate::logical::{Condition, Expr, Operation, Select, SelectItem, aliased};

use super::{
    MAIN_ALIAS, ModePlan, PlanContext, STAGE_ALIAS, StatisticName, insert_select, zero_statistic,
};

/// Condition that holds when the pass has staged rows
pub(super) fn stage_not_empty(ctx: &PlanContext) -> IngestResult<Condition> {
    Ok(Condition::exists(ctx.select_from_stage(
        STAGE_ALIAS,
        vec![SelectItem::from(Expr::Star)],
        None,
    )?))
}

/// `SELECT COUNT(*) as "<stat>" FROM stage WHERE <condition>`
pub(super) fn count_stage(
    ctx: &PlanContext,
    statistic: StatisticName,
    condition: Option<Condition>,
) -> IngestResult<Select> {
    ctx.select_from_stage(
        STAGE_ALIAS,
        vec![aliased(Expr::count_star(), statistic.alias())],
        condition,
    )
}

pub(super) fn plan_snapshot(ctx: &PlanContext, mode: &NontemporalSnapshot) -> IngestResult<ModePlan> {
    let guard = match mode.empty_batch_handling {
        EmptyBatchHandling::DeleteTargetData => None,
        EmptyBatchHandling::NoOp => Some(stage_not_empty(ctx)?),
    };

    let delete = Operation::Delete {
        table: ctx.main_ref(),
        where_clause: guard.clone(),
    };
    let insert = insert_select(
        ctx.main_ref(),
        ctx.staged_values(STAGE_ALIAS),
        ctx.select_from_stage(STAGE_ALIAS, vec![], None)?,
    );

    let mut plan = ModePlan {
        ingest: vec![delete, insert],
        ..Default::default()
    };

    let mut deleted = Select::from_source(
        crate::logical::Source::Table(ctx.main_ref()),
        vec![aliased(Expr::count_star(), StatisticName::RowsDeleted.alias())],
    );
    if let Some(guard) = guard {
        deleted = deleted.with_where(guard);
    }
    plan.pre_ingest_statistics
        .insert(StatisticName::RowsDeleted, deleted);
    plan.pre_ingest_statistics.insert(
        StatisticName::RowsInserted,
        count_stage(ctx, StatisticName::RowsInserted, None)?,
    );
    for statistic in [StatisticName::RowsUpdated, StatisticName::RowsTerminated] {
        plan.post_ingest_statistics
            .insert(statistic, zero_statistic(statistic));
    }
    Ok(plan)
}

pub(super) fn plan_delta(ctx: &PlanContext) -> IngestResult<ModePlan> {
    let keys = ctx.key_refs();
    let key_match = Condition::columns_match(MAIN_ALIAS, STAGE_ALIAS, &keys);

    // staged row replaces the main row of the same key
    let mut changed = vec![key_match.clone()];
    changed.extend(ctx.digest_differs(MAIN_ALIAS, STAGE_ALIAS));
    changed.extend(ctx.version_allows_replace(MAIN_ALIAS, STAGE_ALIAS));
    changed.extend(ctx.not_deleted(STAGE_ALIAS));
    let changed = Condition::all(changed);

    let audit_field = ctx.mode.auditing().field();
    let mut assignments = Vec::new();
    // key columns already match
    for (column, value) in ctx
        .staged_values(STAGE_ALIAS)
        .into_iter()
        .filter(|(column, _)| !ctx.primary_keys.contains(column))
    {
        let value = if Some(column.as_str()) == audit_field {
            value
        } else {
            Expr::subquery(ctx.select_from_stage(
                STAGE_ALIAS,
                vec![SelectItem::from(value)],
                Some(changed.clone()),
            )?)
        };
        assignments.push((column, value));
    }
    let update = Operation::Update {
        table: ctx.main_ref(),
        assignments,
        where_clause: Some(Condition::exists(ctx.select_from_stage(
            STAGE_ALIAS,
            vec![SelectItem::from(Expr::Star)],
            Some(changed.clone()),
        )?)),
    };

    let absent = Condition::not_exists(Select::star_from(&ctx.main_ref()).with_where(key_match.clone()));
    let new_rows = Condition::all(
        std::iter::once(absent)
            .chain(ctx.not_deleted(STAGE_ALIAS))
            .collect(),
    );
    let insert = insert_select(
        ctx.main_ref(),
        ctx.staged_values(STAGE_ALIAS),
        ctx.select_from_stage(STAGE_ALIAS, vec![], Some(new_rows.clone()))?,
    );

    let mut plan = ModePlan {
        ingest: vec![update, insert],
        ..Default::default()
    };

    plan.pre_ingest_statistics.insert(
        StatisticName::RowsUpdated,
        count_stage(
            ctx,
            StatisticName::RowsUpdated,
            Some(Condition::exists(
                Select::star_from(&ctx.main_ref()).with_where(changed),
            )),
        )?,
    );
    plan.pre_ingest_statistics.insert(
        StatisticName::RowsInserted,
        count_stage(ctx, StatisticName::RowsInserted, Some(new_rows))?,
    );

    match ctx.deleted(STAGE_ALIAS) {
        Some(deleted) => {
            let doomed = Condition::exists(ctx.select_from_stage(
                STAGE_ALIAS,
                vec![SelectItem::from(Expr::Star)],
                Some(key_match.and(deleted)),
            )?);
            plan.ingest.push(Operation::Delete {
                table: ctx.main_ref(),
                where_clause: Some(doomed.clone()),
            });
            plan.pre_ingest_statistics.insert(
                StatisticName::RowsDeleted,
                ctx.count_main(StatisticName::RowsDeleted, doomed),
            );
        }
        None => {
            plan.post_ingest_statistics.insert(
                StatisticName::RowsDeleted,
                zero_statistic(StatisticName::RowsDeleted),
            );
        }
    }
    plan.post_ingest_statistics.insert(
        StatisticName::RowsTerminated,
        zero_statistic(StatisticName::RowsTerminated),
    );
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use crate::ingest_mode::{
        DigestGenStrategy, EmptyBatchHandling, IngestMode, MergeStrategy, NontemporalDelta,
        NontemporalSnapshot,
    };
    use crate::models::{DataType, Dataset, Datasets, Field, FilterValue, SchemaDefinition};
    use crate::planner::{PlannerOptions, StatisticName, plan};
    use crate::sink::{DuckDbSink, SqlRenderer};

    fn datasets() -> Datasets {
        let staging = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("digest", DataType::Varchar),
            Field::new("op", DataType::Varchar),
        ])
        .unwrap();
        Datasets::new(
            Dataset::new("main", SchemaDefinition::empty()),
            Dataset::new("staging", staging),
        )
        .unwrap()
    }

    #[test]
    fn test_snapshot_noop_guards_delete() {
        let mode = IngestMode::from(NontemporalSnapshot {
            empty_batch_handling: EmptyBatchHandling::NoOp,
            ..Default::default()
        });
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.ingest)
            .unwrap();
        assert_eq!(
            sql[0],
            "DELETE FROM \"main\" as sink WHERE EXISTS (SELECT * FROM \"staging\" as stage)"
        );
        assert!(sql[1].starts_with("INSERT INTO \"main\""));
    }

    #[test]
    fn test_delta_with_delete_indicator() {
        let mode = IngestMode::from(NontemporalDelta {
            digest: DigestGenStrategy::user_provided("digest"),
            merge: MergeStrategy::delete_indicator("op", vec![FilterValue::from("D")]),
            ..Default::default()
        });
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.ingest)
            .unwrap();

        assert_eq!(sql.len(), 3);
        assert!(sql[0].starts_with("UPDATE \"main\" as sink SET \"name\" = (SELECT stage.\"name\" FROM \"staging\" as stage WHERE"));
        assert!(!sql[0].contains("SET \"id\""));
        assert!(sql[0].contains("(sink.\"digest\" <> stage.\"digest\")"));
        assert!(sql[0].contains("((stage.\"op\" IS NULL) OR (stage.\"op\" NOT IN ('D')))"));
        // the delete indicator is never copied to main
        assert!(!sql[1].contains("\"op\", "));
        assert_eq!(
            sql[2],
            "DELETE FROM \"main\" as sink WHERE EXISTS (SELECT * FROM \"staging\" as stage WHERE (sink.\"id\" = stage.\"id\") AND (stage.\"op\" IN ('D')))"
        );
        assert!(plan
            .pre_ingest_statistics
            .contains_key(&StatisticName::RowsDeleted));
    }
}
