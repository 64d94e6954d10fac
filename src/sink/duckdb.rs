//! DuckDB sink

use super::{Capability, RelationalSink, ansi_type_name};
use crate::error::{IngestError, IngestResult};
use crate::models::{DataType, FieldType, FileFormat, SchemaDefinition, StagedFilesProperties};

/// DuckDB dialect; reads staged files with its `read_*` table functions
#[derive(Debug, Clone, Copy, Default)]
pub struct DuckDbSink;

const CAPABILITIES: &[Capability] = &[
    Capability::AddColumn,
    Capability::ImplicitDataTypeConversion,
    Capability::ExplicitDataTypeConversion,
    Capability::DataTypeLengthChange,
    Capability::DataTypeScaleChange,
];

/// Precision and scale DuckDB assigns to a bare `DECIMAL`
const DEFAULT_DECIMAL: (u32, u32) = (18, 3);

fn string_list(values: &[String]) -> String {
    let quoted: Vec<String> = values
        .iter()
        .map(|v| format!("'{}'", v.replace('\'', "''")))
        .collect();
    format!("[{}]", quoted.join(", "))
}

impl RelationalSink for DuckDbSink {
    fn name(&self) -> &'static str {
        "duckdb"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn type_name(&self, field_type: &FieldType) -> String {
        ansi_type_name(&self.normalize(field_type))
    }

    fn normalize(&self, field_type: &FieldType) -> FieldType {
        match field_type.data_type {
            DataType::Char | DataType::Varchar | DataType::Text | DataType::Json => {
                FieldType::of(DataType::Varchar)
            }
            DataType::DateTime => FieldType::of(DataType::Timestamp),
            DataType::Decimal if field_type.length.is_none() => FieldType {
                data_type: DataType::Decimal,
                length: Some(DEFAULT_DECIMAL.0),
                scale: Some(DEFAULT_DECIMAL.1),
            },
            DataType::Decimal => FieldType {
                data_type: DataType::Decimal,
                length: field_type.length,
                scale: Some(field_type.scale.unwrap_or(0)),
            },
            _ => FieldType::of(field_type.data_type),
        }
    }

    fn default_digest_udf(&self) -> &'static str {
        "md5"
    }

    fn staged_files_source(
        &self,
        properties: &StagedFilesProperties,
        files: &[String],
        schema: &SchemaDefinition,
    ) -> IngestResult<String> {
        if files.is_empty() {
            return Err(IngestError::Resource(
                "No staged files matched the configured paths and patterns".to_string(),
            ));
        }
        let columns = schema
            .fields()
            .iter()
            .map(|f| format!("'{}': '{}'", f.name, self.type_name(&f.field_type)))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(match properties.format {
            FileFormat::Csv => {
                let mut args = vec![
                    string_list(files),
                    format!("header={}", properties.header),
                ];
                if let Some(delimiter) = properties.delimiter {
                    args.push(format!("delim='{}'", delimiter));
                }
                args.push(format!("columns={{{}}}", columns));
                format!("read_csv({})", args.join(", "))
            }
            FileFormat::Json => format!(
                "read_json({}, columns={{{}}})",
                string_list(files),
                columns
            ),
            FileFormat::Parquet => format!("read_parquet({})", string_list(files)),
        })
    }
}
