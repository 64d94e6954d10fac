//! Bulk load of staged files

use crate::error::IngestResult;
use crate::ingest_mode::BulkLoad;

use super::append_only::insert_only_statistics;
use super::{ModePlan, PlanContext, STAGE_ALIAS, insert_select};

pub(super) fn plan(ctx: &PlanContext, mode: &BulkLoad) -> IngestResult<ModePlan> {
    let mut values = ctx.staged_values(STAGE_ALIAS);
    values.push((mode.batch_id_field.clone(), ctx.batch_id()));

    let select = ctx.select_from_stage(STAGE_ALIAS, vec![], None)?;
    let mut plan = ModePlan {
        ingest: vec![insert_select(ctx.main_ref(), values, select)],
        ..Default::default()
    };
    insert_only_statistics(ctx, &mode.batch_id_field, &mut plan);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use crate::ingest_mode::{BulkLoad, DigestGenStrategy, IngestMode};
    use crate::models::{
        DataType, Dataset, Datasets, Field, FileFormat, SchemaDefinition, StagedFilesProperties,
    };
    use crate::planner::{PlannerOptions, plan};
    use crate::sink::{DuckDbSink, SqlRenderer};

    #[test]
    fn test_reads_files_through_table_function() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("part-1.csv");
        std::fs::write(&file, "id,name\n1,a\n").unwrap();

        let staging = Dataset::new(
            "staged_files",
            SchemaDefinition::new(vec![
                Field::new("id", DataType::Int),
                Field::new("name", DataType::Varchar),
            ])
            .unwrap(),
        )
        .staged_files(
            StagedFilesProperties::new(FileFormat::Csv)
                .with_file_path(file.to_string_lossy().to_string()),
        );
        let datasets =
            Datasets::new(Dataset::new("main", SchemaDefinition::empty()), staging).unwrap();
        let mode = IngestMode::from(BulkLoad {
            digest: DigestGenStrategy::udf_based("md5", "digest"),
            ..Default::default()
        });

        let plan = plan(&mode, &datasets, &PlannerOptions::default()).unwrap();
        let sql = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.ingest)
            .unwrap();
        assert!(sql[0].starts_with("INSERT INTO \"main\" (\"id\", \"name\", \"digest\", \"batch_id\")"));
        assert!(sql[0].contains("FROM read_csv(["));
        assert!(sql[0].contains("md5(CONCAT('id',CAST(stage.\"id\" AS VARCHAR),'name',CAST(stage.\"name\" AS VARCHAR)))"));

        // staged files are never deleted or recreated
        assert!(plan.post_actions.is_empty());
        let ledger = SqlRenderer::new(&DuckDbSink)
            .render_plan(&plan.metadata_ingest)
            .unwrap();
        assert!(ledger[0].contains("file_hashes"));
    }
}
