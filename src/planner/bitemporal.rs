//! Bitemporal delta
//!
//! Every pass assembles the rows to open in a temp table shaped like main:
//! staged rows with their validity interval plus the remnants of open main
//! rows that staged intervals cut through. Open main rows that are replaced
//! or cut are then closed and the temp rows inserted, so open intervals of a
//! key never overlap.
//!
//! With a from-only derivation an interval runs until the next staged or
//! open start of the same key. With a from-and-through derivation both ends
//! are staged; staged rows identical to an open row are skipped.

use crate::error::IngestResult;
use crate::ingest_mode::{BitemporalDelta, DigestGenStrategy, ValidityMilestoning};
use crate::logical::{
    Condition, Expr, Join, JoinKind, Operation, Select, SelectItem, Source, aliased,
};
use crate::models::DatasetReference;

use super::unitemporal::{close_assignments, is_open, milestoned_statistics, open_values};
use super::{
    DataQualityCheck, MAIN_ALIAS, ModePlan, PlanContext, STAGE_ALIAS, insert_select, timestamp,
};

const TEMP_ALIAS: &str = "temp";
const STAGE_RIGHT_ALIAS: &str = "stage_right";
const MAIN_RIGHT_ALIAS: &str = "sink_right";
const UNCHANGED_ALIAS: &str = "sink_same";

pub(super) fn plan(ctx: &PlanContext, mode: &BitemporalDelta) -> IngestResult<ModePlan> {
    let validity = &mode.validity_milestoning;
    let temp = ctx.datasets.temp_reference();

    let mut plan = ModePlan::default();
    plan.pre_actions.push(Operation::CreateTable {
        table: temp.clone(),
        schema: ctx.main_schema.clone(),
        if_not_exists: true,
    });

    let cutting = if validity.is_from_only() {
        from_only(ctx, validity, &temp)?
    } else {
        plan.pre_ingest_checks.insert(
            DataQualityCheck::StagingIntervalOverlaps,
            staging_overlaps(ctx, validity)?,
        );
        from_and_through(ctx, validity, &temp)?
    };
    plan.ingest.extend(cutting);

    let columns: Vec<(String, Expr)> = ctx
        .main_schema
        .fields()
        .iter()
        .map(|f| (f.name.clone(), Expr::col(TEMP_ALIAS, &f.name)))
        .collect();
    plan.ingest.push(insert_select(
        ctx.main_ref(),
        columns,
        Select::from_source(Source::Table(temp.clone().with_alias(TEMP_ALIAS)), vec![]),
    ));
    plan.ingest.push(Operation::Delete {
        table: temp.clone().with_alias(TEMP_ALIAS),
        where_clause: None,
    });

    plan.post_ingest_checks.insert(
        DataQualityCheck::MainIntervalOverlaps,
        main_overlaps(ctx, validity)?,
    );
    plan.post_actions.push(Operation::DropTable {
        table: temp,
        if_exists: true,
    });

    milestoned_statistics(ctx, &mut plan)?;
    Ok(plan)
}

/// Business columns (and a generated digest) copied from a main row
fn main_values(ctx: &PlanContext, alias: &str) -> Vec<(String, Expr)> {
    let mut values: Vec<(String, Expr)> = ctx
        .data_columns
        .iter()
        .map(|c| (c.clone(), Expr::col(alias, c)))
        .collect();
    if let DigestGenStrategy::UdfBased { digest_field, .. } = ctx.mode.digest() {
        values.push((digest_field.clone(), Expr::col(alias, digest_field)));
    }
    values
}

fn infinity(validity: &ValidityMilestoning) -> Expr {
    timestamp(&validity.infinity_date)
}

fn keys_match(ctx: &PlanContext, left: &str, right: &str) -> Condition {
    Condition::columns_match(left, right, &ctx.key_refs())
}

fn from_only(
    ctx: &PlanContext,
    validity: &ValidityMilestoning,
    temp: &DatasetReference,
) -> IngestResult<Vec<Operation>> {
    let source_from = validity.source_from();
    let from = validity.from_field.as_str();
    let through = validity.through_field.as_str();

    // staged rows run until the next staged start of the key
    let next_staged = ctx.select_from_stage(
        STAGE_RIGHT_ALIAS,
        vec![SelectItem::from(Expr::min(Expr::col(
            STAGE_RIGHT_ALIAS,
            source_from,
        )))],
        Some(Condition::all(vec![
            keys_match(ctx, STAGE_RIGHT_ALIAS, STAGE_ALIAS),
            Expr::col(STAGE_RIGHT_ALIAS, source_from).gt(Expr::col(STAGE_ALIAS, source_from)),
        ])),
    )?;
    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.push((from.to_string(), Expr::col(STAGE_ALIAS, source_from)));
    values.push((
        through.to_string(),
        Expr::coalesce(vec![Expr::subquery(next_staged), infinity(validity)]),
    ));
    values.extend(open_values(ctx)?);
    let insert_staged = insert_select(
        temp.clone(),
        values,
        ctx.select_from_stage(STAGE_ALIAS, vec![], ctx.not_deleted(STAGE_ALIAS))?,
    );

    // ... or until the next open main start, whichever comes first
    let later_open_start = |projection: Vec<SelectItem>| -> IngestResult<Select> {
        Ok(Select::from_source(Source::Table(ctx.main_ref()), projection).with_where(
            Condition::all(vec![
                is_open(ctx, MAIN_ALIAS)?,
                keys_match(ctx, MAIN_ALIAS, TEMP_ALIAS),
                Expr::col(MAIN_ALIAS, from).gt(Expr::col(TEMP_ALIAS, from)),
                Expr::col(MAIN_ALIAS, from).lt(Expr::col(TEMP_ALIAS, through)),
            ]),
        ))
    };
    let cap_at_main = Operation::Update {
        table: temp.clone().with_alias(TEMP_ALIAS),
        assignments: vec![(
            through.to_string(),
            Expr::subquery(later_open_start(vec![SelectItem::from(Expr::min(
                Expr::col(MAIN_ALIAS, from),
            ))])?),
        )],
        where_clause: Some(Condition::exists(later_open_start(vec![SelectItem::from(
            Expr::Star,
        )])?)),
    };

    // open rows cut by a staged start keep their leading part
    let inside = |projection: Vec<SelectItem>| {
        ctx.select_from_stage(
            STAGE_ALIAS,
            projection,
            Some(Condition::all(vec![
                keys_match(ctx, STAGE_ALIAS, MAIN_ALIAS),
                Expr::col(STAGE_ALIAS, source_from).gt(Expr::col(MAIN_ALIAS, from)),
                Expr::col(STAGE_ALIAS, source_from).lt(Expr::col(MAIN_ALIAS, through)),
            ])),
        )
    };
    let restated = ctx.select_from_stage(
        STAGE_ALIAS,
        vec![SelectItem::from(Expr::Star)],
        Some(Condition::all(vec![
            keys_match(ctx, STAGE_ALIAS, MAIN_ALIAS),
            Expr::col(STAGE_ALIAS, source_from).equals(Expr::col(MAIN_ALIAS, from)),
        ])),
    )?;
    let mut remnant = main_values(ctx, MAIN_ALIAS);
    remnant.push((from.to_string(), Expr::col(MAIN_ALIAS, from)));
    remnant.push((
        through.to_string(),
        Expr::subquery(inside(vec![SelectItem::from(Expr::min(Expr::col(
            STAGE_ALIAS,
            source_from,
        )))])?),
    ));
    remnant.extend(open_values(ctx)?);
    let insert_remnants = insert_select(
        temp.clone(),
        remnant,
        Select::from_source(Source::Table(ctx.main_ref()), vec![]).with_where(Condition::all(vec![
            is_open(ctx, MAIN_ALIAS)?,
            Condition::exists(inside(vec![SelectItem::from(Expr::Star)])?),
            Condition::not_exists(restated),
        ])),
    );

    // close open rows that were restated, cut or deleted
    let mut reasons = vec![Condition::exists(
        Select::star_from(&temp.clone().with_alias(TEMP_ALIAS)).with_where(Condition::all(vec![
            keys_match(ctx, TEMP_ALIAS, MAIN_ALIAS),
            Expr::col(TEMP_ALIAS, from).equals(Expr::col(MAIN_ALIAS, from)),
        ])),
    )];
    if let Some(deleted) = ctx.deleted(STAGE_ALIAS) {
        reasons.push(Condition::exists(ctx.select_from_stage(
            STAGE_ALIAS,
            vec![SelectItem::from(Expr::Star)],
            Some(Condition::all(vec![
                keys_match(ctx, STAGE_ALIAS, MAIN_ALIAS),
                Expr::col(STAGE_ALIAS, source_from).equals(Expr::col(MAIN_ALIAS, from)),
                deleted,
            ])),
        )?));
    }
    let close = Operation::Update {
        table: ctx.main_ref(),
        assignments: close_assignments(ctx)?,
        where_clause: Some(is_open(ctx, MAIN_ALIAS)?.and(Condition::any(reasons))),
    };

    Ok(vec![insert_staged, cap_at_main, insert_remnants, close])
}

/// Staged interval of `alias` overlaps the main row of `main_alias`
fn overlaps(validity: &ValidityMilestoning, alias: &str, main_alias: &str) -> Condition {
    let source_from = validity.source_from();
    let source_through = validity.source_through().unwrap_or(source_from);
    Condition::all(vec![
        Expr::col(alias, source_from).lt(Expr::col(main_alias, &validity.through_field)),
        Expr::col(main_alias, &validity.from_field).lt(Expr::col(alias, source_through)),
    ])
}

/// Staged row of `alias` changes main: a deletion, or not identical to an open row
fn active(
    ctx: &PlanContext,
    validity: &ValidityMilestoning,
    alias: &str,
) -> IngestResult<Condition> {
    let source_from = validity.source_from();
    let source_through = validity.source_through().unwrap_or(source_from);
    let mut identical = vec![
        is_open(ctx, UNCHANGED_ALIAS)?,
        keys_match(ctx, UNCHANGED_ALIAS, alias),
        Expr::col(UNCHANGED_ALIAS, &validity.from_field).equals(Expr::col(alias, source_from)),
        Expr::col(UNCHANGED_ALIAS, &validity.through_field)
            .equals(Expr::col(alias, source_through)),
    ];
    identical.extend(ctx.digest_matches(UNCHANGED_ALIAS, alias));
    let changed = Condition::not_exists(
        Select::star_from(&ctx.main_as(UNCHANGED_ALIAS)).with_where(Condition::all(identical)),
    );
    Ok(match ctx.deleted(alias) {
        Some(deleted) => Condition::any(vec![deleted, changed]),
        None => changed,
    })
}

fn from_and_through(
    ctx: &PlanContext,
    validity: &ValidityMilestoning,
    temp: &DatasetReference,
) -> IngestResult<Vec<Operation>> {
    let source_from = validity.source_from();
    let source_through = validity.source_through().unwrap_or(source_from);
    let from = validity.from_field.as_str();
    let through = validity.through_field.as_str();

    // staged rows keep their own interval
    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.push((from.to_string(), Expr::col(STAGE_ALIAS, source_from)));
    values.push((through.to_string(), Expr::col(STAGE_ALIAS, source_through)));
    values.extend(open_values(ctx)?);
    let mut new_rows = vec![active(ctx, validity, STAGE_ALIAS)?];
    new_rows.extend(ctx.not_deleted(STAGE_ALIAS));
    let insert_staged = insert_select(
        temp.clone(),
        values,
        ctx.select_from_stage(STAGE_ALIAS, vec![], Some(Condition::all(new_rows)))?,
    );

    let cutting = |alias: &str| -> IngestResult<Condition> {
        Ok(Condition::all(vec![
            keys_match(ctx, alias, MAIN_ALIAS),
            active(ctx, validity, alias)?,
            overlaps(validity, alias, MAIN_ALIAS),
        ]))
    };

    // leading remnant: from the open start to the first cutting start
    let first_cut = Expr::subquery(ctx.select_from_stage(
        STAGE_ALIAS,
        vec![SelectItem::from(Expr::min(Expr::col(STAGE_ALIAS, source_from)))],
        Some(cutting(STAGE_ALIAS)?),
    )?);
    let mut leading = main_values(ctx, MAIN_ALIAS);
    leading.push((from.to_string(), Expr::col(MAIN_ALIAS, from)));
    leading.push((through.to_string(), first_cut.clone()));
    leading.extend(open_values(ctx)?);
    let insert_leading = insert_select(
        temp.clone(),
        leading,
        Select::from_source(Source::Table(ctx.main_ref()), vec![]).with_where(Condition::all(
            vec![
                is_open(ctx, MAIN_ALIAS)?,
                Expr::col(MAIN_ALIAS, from).lt(first_cut),
            ],
        )),
    );

    // trailing remnants: from each cutting end to the next cutting start or the open end
    let next_cut = Expr::subquery(ctx.select_from_stage(
        STAGE_RIGHT_ALIAS,
        vec![SelectItem::from(Expr::min(Expr::col(
            STAGE_RIGHT_ALIAS,
            source_from,
        )))],
        Some(Condition::all(vec![
            keys_match(ctx, STAGE_RIGHT_ALIAS, MAIN_ALIAS),
            active(ctx, validity, STAGE_RIGHT_ALIAS)?,
            Expr::col(STAGE_RIGHT_ALIAS, source_from).gte(Expr::col(STAGE_ALIAS, source_through)),
            Expr::col(STAGE_RIGHT_ALIAS, source_from).lt(Expr::col(MAIN_ALIAS, through)),
        ])),
    )?);
    let covered = ctx.select_from_stage(
        STAGE_RIGHT_ALIAS,
        vec![SelectItem::from(Expr::Star)],
        Some(Condition::all(vec![
            keys_match(ctx, STAGE_RIGHT_ALIAS, MAIN_ALIAS),
            active(ctx, validity, STAGE_RIGHT_ALIAS)?,
            Expr::col(STAGE_RIGHT_ALIAS, source_from).lte(Expr::col(STAGE_ALIAS, source_through)),
            Expr::col(STAGE_RIGHT_ALIAS, source_through).gt(Expr::col(STAGE_ALIAS, source_through)),
        ])),
    )?;
    let mut trailing = main_values(ctx, MAIN_ALIAS);
    trailing.push((from.to_string(), Expr::col(STAGE_ALIAS, source_through)));
    trailing.push((
        through.to_string(),
        Expr::coalesce(vec![next_cut, Expr::col(MAIN_ALIAS, through)]),
    ));
    trailing.extend(open_values(ctx)?);
    let mut join_on = vec![cutting(STAGE_ALIAS)?];
    join_on.extend(ctx.stage_filter(STAGE_ALIAS));
    let insert_trailing = insert_select(
        temp.clone(),
        trailing,
        Select::from_source(Source::Table(ctx.main_ref()), vec![])
            .with_join(Join {
                kind: JoinKind::Inner,
                source: ctx.stage_source_as(STAGE_ALIAS)?,
                on: Condition::all(join_on),
            })
            .with_where(Condition::all(vec![
                is_open(ctx, MAIN_ALIAS)?,
                Expr::col(STAGE_ALIAS, source_through).lt(Expr::col(MAIN_ALIAS, through)),
                Condition::not_exists(covered),
            ])),
    );

    // close every open row a changed staged interval overlaps
    let close = Operation::Update {
        table: ctx.main_ref(),
        assignments: close_assignments(ctx)?,
        where_clause: Some(is_open(ctx, MAIN_ALIAS)?.and(Condition::exists(
            ctx.select_from_stage(
                STAGE_ALIAS,
                vec![SelectItem::from(Expr::Star)],
                Some(cutting(STAGE_ALIAS)?),
            )?,
        ))),
    };

    Ok(vec![insert_staged, insert_leading, insert_trailing, close])
}

/// Staged rows with an empty interval or overlapping another staged row of the key
fn staging_overlaps(ctx: &PlanContext, validity: &ValidityMilestoning) -> IngestResult<Select> {
    let source_from = validity.source_from();
    let source_through = validity.source_through().unwrap_or(source_from);

    let mut different = vec![
        Expr::col(STAGE_RIGHT_ALIAS, source_from).not_equals(Expr::col(STAGE_ALIAS, source_from)),
        Expr::col(STAGE_RIGHT_ALIAS, source_through)
            .not_equals(Expr::col(STAGE_ALIAS, source_through)),
    ];
    if let (Some(right), Some(left)) = (
        ctx.stage_digest(STAGE_RIGHT_ALIAS),
        ctx.stage_digest(STAGE_ALIAS),
    ) {
        different.push(right.not_equals(left));
    }
    let overlapping = ctx.select_from_stage(
        STAGE_RIGHT_ALIAS,
        vec![SelectItem::from(Expr::Star)],
        Some(Condition::all(vec![
            keys_match(ctx, STAGE_RIGHT_ALIAS, STAGE_ALIAS),
            Expr::col(STAGE_RIGHT_ALIAS, source_from).lt(Expr::col(STAGE_ALIAS, source_through)),
            Expr::col(STAGE_ALIAS, source_from).lt(Expr::col(STAGE_RIGHT_ALIAS, source_through)),
            Condition::any(different),
        ])),
    )?;

    ctx.select_from_stage(
        STAGE_ALIAS,
        vec![aliased(
            Expr::count_star(),
            DataQualityCheck::StagingIntervalOverlaps.alias(),
        )],
        Some(Condition::any(vec![
            Expr::col(STAGE_ALIAS, source_from).gte(Expr::col(STAGE_ALIAS, source_through)),
            Condition::exists(overlapping),
        ])),
    )
}

/// Open rows overlapping another open row of the same key
fn main_overlaps(ctx: &PlanContext, validity: &ValidityMilestoning) -> IngestResult<Select> {
    let from = validity.from_field.as_str();
    let through = validity.through_field.as_str();
    let in_field = super::unitemporal::milestoning(ctx)?.in_field();

    let overlapping = Select::star_from(&ctx.main_as(MAIN_RIGHT_ALIAS)).with_where(
        Condition::all(vec![
            is_open(ctx, MAIN_RIGHT_ALIAS)?,
            keys_match(ctx, MAIN_RIGHT_ALIAS, MAIN_ALIAS),
            Expr::col(MAIN_RIGHT_ALIAS, from).lt(Expr::col(MAIN_ALIAS, through)),
            Expr::col(MAIN_ALIAS, from).lt(Expr::col(MAIN_RIGHT_ALIAS, through)),
            Condition::any(vec![
                Expr::col(MAIN_RIGHT_ALIAS, from).not_equals(Expr::col(MAIN_ALIAS, from)),
                Expr::col(MAIN_RIGHT_ALIAS, in_field).not_equals(Expr::col(MAIN_ALIAS, in_field)),
            ]),
        ]),
    );
    Ok(Select::from_source(
        Source::Table(ctx.main_ref()),
        vec![aliased(
            Expr::count_star(),
            DataQualityCheck::MainIntervalOverlaps.alias(),
        )],
    )
    .with_where(is_open(ctx, MAIN_ALIAS)?)
    .with_where(Condition::exists(overlapping)))
}
