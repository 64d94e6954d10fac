//! Reference ANSI SQL sink

use super::{Capability, RelationalSink};

/// Reference dialect: qualified `SET` targets, cascading drops
#[derive(Debug, Clone, Copy, Default)]
pub struct AnsiSqlSink;

const CAPABILITIES: &[Capability] = &[
    Capability::AddColumn,
    Capability::ImplicitDataTypeConversion,
    Capability::ExplicitDataTypeConversion,
    Capability::DataTypeLengthChange,
    Capability::DataTypeScaleChange,
];

impl RelationalSink for AnsiSqlSink {
    fn name(&self) -> &'static str {
        "ansi"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn default_digest_udf(&self) -> &'static str {
        "MD5"
    }

    fn qualify_update_columns(&self) -> bool {
        true
    }

    fn drop_cascade(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestError;
    use crate::models::{FileFormat, SchemaDefinition, StagedFilesProperties};

    #[test]
    fn test_ansi_rejects_staged_files() {
        let result = AnsiSqlSink.staged_files_source(
            &StagedFilesProperties::new(FileFormat::Csv),
            &["a.csv".to_string()],
            &SchemaDefinition::empty(),
        );
        assert!(matches!(result, Err(IngestError::Configuration(_))));
        assert!(AnsiSqlSink.supports(Capability::DataTypeScaleChange));
    }
}
