//! Processing-time milestoning shared by the unitemporal and bitemporal modes
//!
//! A row is open while its out batch id is the infinite sentinel (or, with
//! date-time milestoning only, while its out timestamp is the infinity date).
//! Replacing a row closes it with the previous batch id and opens a new row
//! with the current one, so history is never overwritten.

use crate::error::{IngestError, IngestResult};
use crate::ingest_mode::{
    DEFAULT_INFINITY_DATE, EmptyBatchHandling, INFINITE_BATCH_ID, TransactionMilestoning,
    UnitemporalSnapshot,
};
use crate::logical::{Condition, Expr, Operation, Select, SelectItem, aliased};

use super::nontemporal::stage_not_empty;
use super::{
    MAIN_ALIAS, ModePlan, PlanContext, STAGE_ALIAS, StatisticName, insert_select, open_condition,
    timestamp, zero_statistic,
};

const REPLACEMENT_ALIAS: &str = "sink_new";

pub(super) fn milestoning<'c>(ctx: &'c PlanContext) -> IngestResult<&'c TransactionMilestoning> {
    ctx.mode.transaction_milestoning().ok_or_else(|| {
        IngestError::Configuration(format!(
            "{} has no transaction milestoning",
            ctx.mode.name()
        ))
    })
}

/// Open-row condition, never absent for milestoned modes
pub(super) fn is_open(ctx: &PlanContext, alias: &str) -> IngestResult<Condition> {
    open_condition(ctx, alias).ok_or_else(|| {
        IngestError::Configuration("Transaction milestoning declares no out field".to_string())
    })
}

/// Milestoning values of a row opened by the current batch
pub(super) fn open_values(ctx: &PlanContext) -> IngestResult<Vec<(String, Expr)>> {
    let tm = milestoning(ctx)?;
    let mut values = Vec::new();
    if let Some((batch_in, batch_out)) = tm.batch_id_fields() {
        values.push((batch_in.to_string(), ctx.batch_id()));
        values.push((batch_out.to_string(), Expr::int(INFINITE_BATCH_ID)));
    }
    if let Some((time_in, time_out)) = tm.date_time_fields() {
        values.push((time_in.to_string(), ctx.batch_ts()));
        values.push((time_out.to_string(), timestamp(DEFAULT_INFINITY_DATE)));
    }
    Ok(values)
}

/// Assignments closing a row in the current batch
pub(super) fn close_assignments(ctx: &PlanContext) -> IngestResult<Vec<(String, Expr)>> {
    let tm = milestoning(ctx)?;
    let mut assignments = Vec::new();
    if let Some((_, batch_out)) = tm.batch_id_fields() {
        assignments.push((batch_out.to_string(), ctx.closing_batch_id()));
    }
    if let Some((_, time_out)) = tm.date_time_fields() {
        assignments.push((time_out.to_string(), ctx.batch_ts()));
    }
    Ok(assignments)
}

/// Row opened by the current batch
fn opened_in_batch(ctx: &PlanContext, alias: &str) -> IngestResult<Condition> {
    let tm = milestoning(ctx)?;
    Ok(match tm.batch_id_fields() {
        Some((batch_in, _)) => Expr::col(alias, batch_in).equals(ctx.batch_id()),
        None => Expr::col(alias, tm.in_field()).equals(ctx.batch_ts()),
    })
}

/// Row closed by the current batch
fn closed_in_batch(ctx: &PlanContext, alias: &str) -> IngestResult<Condition> {
    let tm = milestoning(ctx)?;
    Ok(match (tm.batch_id_fields(), tm.date_time_fields()) {
        (Some((_, batch_out)), _) => Expr::col(alias, batch_out).equals(ctx.closing_batch_id()),
        (None, Some((_, time_out))) => Expr::col(alias, time_out).equals(ctx.batch_ts()),
        (None, None) => Condition::Or(vec![]),
    })
}

/// Post-ingest statistics derived from the milestoning columns
///
/// A closed row whose key was reopened in the batch counts as updated; the
/// remaining closed rows were terminated and the remaining opened rows are new.
pub(super) fn milestoned_statistics(ctx: &PlanContext, plan: &mut ModePlan) -> IngestResult<()> {
    let keys = ctx.key_refs();
    let replaced = Condition::all(vec![
        closed_in_batch(ctx, MAIN_ALIAS)?,
        Condition::exists(
            Select::star_from(&ctx.main_as(REPLACEMENT_ALIAS)).with_where(Condition::all(vec![
                Condition::columns_match(MAIN_ALIAS, REPLACEMENT_ALIAS, &keys),
                opened_in_batch(ctx, REPLACEMENT_ALIAS)?,
            ])),
        ),
    ]);

    let updated = ctx.count_main(StatisticName::RowsUpdated, replaced);
    let opened = ctx.count_main(StatisticName::RowsInserted, opened_in_batch(ctx, MAIN_ALIAS)?);
    let closed = ctx.count_main(StatisticName::RowsTerminated, closed_in_batch(ctx, MAIN_ALIAS)?);

    let difference = |total: Select, statistic: StatisticName| {
        let mut minuend = total;
        minuend.projection = vec![SelectItem::from(Expr::count_star())];
        let mut subtrahend = updated.clone();
        subtrahend.projection = vec![SelectItem::from(Expr::count_star())];
        Select::values(vec![aliased(
            Expr::subquery(minuend).minus(Expr::subquery(subtrahend)),
            statistic.alias(),
        )])
    };

    plan.post_ingest_statistics.insert(
        StatisticName::RowsInserted,
        difference(opened, StatisticName::RowsInserted),
    );
    plan.post_ingest_statistics.insert(
        StatisticName::RowsTerminated,
        difference(closed, StatisticName::RowsTerminated),
    );
    plan.post_ingest_statistics
        .insert(StatisticName::RowsUpdated, updated);
    plan.post_ingest_statistics.insert(
        StatisticName::RowsDeleted,
        zero_statistic(StatisticName::RowsDeleted),
    );
    Ok(())
}

pub(super) fn plan_delta(ctx: &PlanContext) -> IngestResult<ModePlan> {
    let keys = ctx.key_refs();
    let key_match = Condition::columns_match(MAIN_ALIAS, STAGE_ALIAS, &keys);

    let mut replaced = Vec::new();
    replaced.extend(ctx.digest_differs(MAIN_ALIAS, STAGE_ALIAS));
    replaced.extend(ctx.version_allows_replace(MAIN_ALIAS, STAGE_ALIAS));
    let mut reasons = vec![Condition::all(replaced)];
    reasons.extend(ctx.deleted(STAGE_ALIAS));

    let close = Operation::Update {
        table: ctx.main_ref(),
        assignments: close_assignments(ctx)?,
        where_clause: Some(Condition::all(vec![
            is_open(ctx, MAIN_ALIAS)?,
            Condition::exists(ctx.select_from_stage(
                STAGE_ALIAS,
                vec![SelectItem::from(Expr::Star)],
                Some(key_match.clone().and(Condition::any(reasons))),
            )?),
        ])),
    };

    // an open row with the same digest, or a newer version, keeps the staged row out
    let mut kept = Vec::new();
    kept.extend(ctx.digest_matches(MAIN_ALIAS, STAGE_ALIAS));
    kept.extend(
        ctx.version_allows_replace(MAIN_ALIAS, STAGE_ALIAS)
            .map(Condition::negate),
    );
    let mut new_rows = vec![Condition::not_exists(
        Select::star_from(&ctx.main_ref()).with_where(Condition::all(vec![
            is_open(ctx, MAIN_ALIAS)?,
            key_match,
            Condition::any(kept),
        ])),
    )];
    new_rows.extend(ctx.not_deleted(STAGE_ALIAS));

    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.extend(open_values(ctx)?);
    let insert = insert_select(
        ctx.main_ref(),
        values,
        ctx.select_from_stage(STAGE_ALIAS, vec![], Some(Condition::all(new_rows)))?,
    );

    let mut plan = ModePlan {
        ingest: vec![close, insert],
        ..Default::default()
    };
    milestoned_statistics(ctx, &mut plan)?;
    Ok(plan)
}

pub(super) fn plan_snapshot(ctx: &PlanContext, mode: &UnitemporalSnapshot) -> IngestResult<ModePlan> {
    let keys = ctx.key_refs();
    let mut same = vec![Condition::columns_match(MAIN_ALIAS, STAGE_ALIAS, &keys)];
    same.extend(ctx.digest_matches(MAIN_ALIAS, STAGE_ALIAS));
    let same = Condition::all(same);

    let mut closing = vec![
        is_open(ctx, MAIN_ALIAS)?,
        Condition::not_exists(ctx.select_from_stage(
            STAGE_ALIAS,
            vec![SelectItem::from(Expr::Star)],
            Some(same.clone()),
        )?),
    ];
    if mode.empty_batch_handling == EmptyBatchHandling::NoOp {
        closing.push(stage_not_empty(ctx)?);
    }
    let close = Operation::Update {
        table: ctx.main_ref(),
        assignments: close_assignments(ctx)?,
        where_clause: Some(Condition::all(closing)),
    };

    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.extend(open_values(ctx)?);
    let unchanged = Condition::not_exists(
        Select::star_from(&ctx.main_ref())
            .with_where(is_open(ctx, MAIN_ALIAS)?)
            .with_where(same),
    );
    let insert = insert_select(
        ctx.main_ref(),
        values,
        ctx.select_from_stage(STAGE_ALIAS, vec![], Some(unchanged))?,
    );

    let mut plan = ModePlan {
        ingest: vec![close, insert],
        ..Default::default()
    };
    milestoned_statistics(ctx, &mut plan)?;
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use crate::ingest_mode::{
        DigestGenStrategy, EmptyBatchHandling, IngestMode, MergeStrategy, TransactionMilestoning,
        UnitemporalDelta, UnitemporalSnapshot, VersionResolver, VersioningStrategy,
    };
    use crate::models::{DataType, Dataset, Datasets, Field, FilterValue, SchemaDefinition};
    use crate::planner::{PlannerOptions, StatisticName, plan};
    use crate::sink::{AnsiSqlSink, DuckDbSink, SqlRenderer};

    const BATCH_ID: &str = "(SELECT COALESCE(MAX(meta.\"table_batch_id\"),0)+1 FROM \"batch_metadata\" as meta WHERE UPPER(meta.\"table_name\") = 'MAIN')";

    fn datasets() -> Datasets {
        let staging = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar),
            Field::new("version", DataType::Int),
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

    fn delta() -> UnitemporalDelta {
        UnitemporalDelta::new(
            TransactionMilestoning::batch_id("batch_in", "batch_out"),
            DigestGenStrategy::user_provided("digest"),
        )
    }

    #[test]
    fn test_delta_closes_then_inserts() {
        let mode = IngestMode::from(delta());
        let plan = plan(&mode, &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&AnsiSqlSink)
            .render_plan(&plan.ingest)
            .unwrap();

        assert_eq!(
            sql[0],
            format!(
                "UPDATE \"main\" as sink SET sink.\"batch_out\" = {}-1 WHERE (sink.\"batch_out\" = 999999999) AND (EXISTS (SELECT * FROM \"staging\" as stage WHERE (sink.\"id\" = stage.\"id\") AND (sink.\"digest\" <> stage.\"digest\")))",
                BATCH_ID
            )
        );
        assert!(sql[1].starts_with(
            "INSERT INTO \"main\" (\"id\", \"name\", \"version\", \"digest\", \"op\", \"batch_in\", \"batch_out\")"
        ));
        assert!(sql[1].contains(&format!("{},999999999 FROM \"staging\" as stage", BATCH_ID)));
        assert!(sql[1].contains(
            "WHERE NOT (EXISTS (SELECT * FROM \"main\" as sink WHERE (sink.\"batch_out\" = 999999999) AND (sink.\"id\" = stage.\"id\") AND (sink.\"digest\" = stage.\"digest\")))"
        ));
    }

    #[test]
    fn test_delta_with_deletes_and_version_resolver() {
        let mut mode = delta();
        mode.merge = MergeStrategy::delete_indicator("op", vec![FilterValue::from("D")]);
        mode.versioning = VersioningStrategy::max_version("version")
            .with_resolver(VersionResolver::GreaterThanActiveVersion);
        let plan = plan(&IngestMode::from(mode), &datasets(), &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.ingest)
            .unwrap();

        // versioned modes read the temp staging table
        assert!(sql[0].contains("FROM \"staging_ingest_temp_staging\" as stage"));
        assert!(sql[0].contains(
            "(((sink.\"digest\" <> stage.\"digest\") AND (stage.\"version\" > sink.\"version\")) OR (stage.\"op\" IN ('D')))"
        ));
        assert!(sql[1].contains(
            "((sink.\"digest\" = stage.\"digest\") OR (NOT (stage.\"version\" > sink.\"version\")))"
        ));
        // the delete indicator is consumed, never copied
        assert!(sql[1].starts_with(
            "INSERT INTO \"main\" (\"id\", \"name\", \"version\", \"digest\", \"batch_in\", \"batch_out\")"
        ));
    }

    #[test]
    fn test_snapshot_statistics_and_noop() {
        let mut mode = UnitemporalSnapshot::new(
            TransactionMilestoning::batch_id_and_date_time("batch_in", "batch_out", "in_z", "out_z"),
            DigestGenStrategy::user_provided("digest"),
        );
        mode.empty_batch_handling = EmptyBatchHandling::NoOp;
        let options = PlannerOptions {
            batch_start_ts: "2024-01-02 03:04:05".to_string(),
            ..Default::default()
        };
        let plan = plan(&IngestMode::from(mode), &datasets(), &options).unwrap();
        let renderer = SqlRenderer::new(&AnsiSqlSink);
        let sql = renderer.render_plan(&plan.ingest).unwrap();

        assert!(sql[0].contains(&format!(
            "SET sink.\"batch_out\" = {}-1, sink.\"out_z\" = CAST('2024-01-02 03:04:05' AS DATETIME)",
            BATCH_ID
        )));
        assert!(sql[0].ends_with("AND (EXISTS (SELECT * FROM \"staging\" as stage))"));

        let inserted = renderer
            .render_select(&plan.post_ingest_statistics[&StatisticName::RowsInserted])
            .unwrap();
        assert!(inserted.starts_with("SELECT (SELECT COUNT(*) FROM \"main\" as sink WHERE sink.\"batch_in\" = "));
        assert!(inserted.ends_with(") as \"rowsInserted\""));
        assert_eq!(plan.post_ingest_statistics.len(), 4);
    }
}
