//! PostgreSQL sink (generation only)

use super::{Capability, RelationalSink, ansi_type_name};
use crate::models::{DataType, FieldType};

/// PostgreSQL dialect
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresSink;

const CAPABILITIES: &[Capability] = &[
    Capability::AddColumn,
    Capability::ImplicitDataTypeConversion,
    Capability::ExplicitDataTypeConversion,
    Capability::DataTypeLengthChange,
    Capability::DataTypeScaleChange,
];

impl RelationalSink for PostgresSink {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn capabilities(&self) -> &'static [Capability] {
        CAPABILITIES
    }

    fn type_name(&self, field_type: &FieldType) -> String {
        match field_type.data_type {
            DataType::TinyInt => "SMALLINT".to_string(),
            DataType::Float => "REAL".to_string(),
            DataType::Double => "DOUBLE PRECISION".to_string(),
            DataType::DateTime => "TIMESTAMP".to_string(),
            DataType::Json => "JSONB".to_string(),
            _ => ansi_type_name(field_type),
        }
    }

    fn normalize(&self, field_type: &FieldType) -> FieldType {
        match field_type.data_type {
            DataType::TinyInt => FieldType::of(DataType::SmallInt),
            DataType::DateTime => FieldType::of(DataType::Timestamp),
            _ => *field_type,
        }
    }

    fn default_digest_udf(&self) -> &'static str {
        "md5"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_postgres_type_names() {
        assert_eq!(
            PostgresSink.type_name(&FieldType::of(DataType::Double)),
            "DOUBLE PRECISION"
        );
        assert_eq!(PostgresSink.type_name(&FieldType::of(DataType::Json)), "JSONB");
        assert_eq!(
            PostgresSink.normalize(&FieldType::of(DataType::DateTime)),
            FieldType::of(DataType::Timestamp)
        );
    }
}
