//! Relational sinks
//!
//! A sink describes the narrow set of dialect facts the planner needs:
//! identifier quoting, type names, supported schema changes, the digest
//! function and how staged files are read. Everything else is shared by the
//! renderer in [`render`].

pub mod ansi;
pub mod duckdb;
pub mod postgres;
pub mod render;

use serde::{Deserialize, Serialize};

pub use ansi::AnsiSqlSink;
pub use duckdb::DuckDbSink;
pub use postgres::PostgresSink;
pub use render::SqlRenderer;

use crate::error::{IngestError, IngestResult};
use crate::models::{DataType, FieldType, SchemaDefinition, StagedFilesProperties};

/// Schema change a sink can apply in place
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Capability {
    AddColumn,
    ImplicitDataTypeConversion,
    ExplicitDataTypeConversion,
    DataTypeLengthChange,
    DataTypeScaleChange,
}

/// Identifier case policy applied to every dataset and mode field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CaseConversion {
    #[default]
    None,
    ToUpper,
    ToLower,
}

impl CaseConversion {
    pub fn apply(&self, name: &str) -> String {
        match self {
            CaseConversion::None => name.to_string(),
            CaseConversion::ToUpper => name.to_uppercase(),
            CaseConversion::ToLower => name.to_lowercase(),
        }
    }
}

impl std::str::FromStr for CaseConversion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(CaseConversion::None),
            "to_upper" | "upper" => Ok(CaseConversion::ToUpper),
            "to_lower" | "lower" => Ok(CaseConversion::ToLower),
            _ => Err(format!(
                "Unknown case conversion: {}. Use 'none', 'to_upper' or 'to_lower'.",
                s
            )),
        }
    }
}

/// Dialect facts consumed by the planner and renderer
pub trait RelationalSink: Send + Sync + std::fmt::Debug {
    /// Short dialect name used in logs
    fn name(&self) -> &'static str;

    /// Schema changes the sink can apply
    fn capabilities(&self) -> &'static [Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    /// DDL type name of a field type
    fn type_name(&self, field_type: &FieldType) -> String {
        ansi_type_name(field_type)
    }

    /// Type as stored by the engine, used to compare declared and live schemas
    fn normalize(&self, field_type: &FieldType) -> FieldType {
        *field_type
    }

    /// Hash function applied by UDF-based digests when none is named
    fn default_digest_udf(&self) -> &'static str;

    /// Whether `UPDATE ... SET` targets carry the table alias
    fn qualify_update_columns(&self) -> bool {
        false
    }

    /// Whether `DROP TABLE` cascades
    fn drop_cascade(&self) -> bool {
        false
    }

    /// Whether values of `from` convert losslessly to `to`
    fn supports_implicit_mapping(&self, from: DataType, to: DataType) -> bool {
        implicit_widening(from, to)
    }

    /// Whether values of `from` can be cast to `to` at all
    fn supports_explicit_mapping(&self, from: DataType, to: DataType) -> bool {
        explicit_cast(from, to)
    }

    /// Table function reading staged files, without alias
    fn staged_files_source(
        &self,
        properties: &StagedFilesProperties,
        _files: &[String],
        _schema: &SchemaDefinition,
    ) -> IngestResult<String> {
        Err(IngestError::Configuration(format!(
            "Sink {} cannot read {} staged files",
            self.name(),
            properties.format
        )))
    }
}

/// Reference type names, with length and scale where declared
pub fn ansi_type_name(field_type: &FieldType) -> String {
    let base = field_type.data_type.to_string();
    match (field_type.data_type, field_type.length, field_type.scale) {
        (DataType::Decimal, Some(p), Some(s)) => format!("{}({},{})", base, p, s),
        (DataType::Decimal | DataType::Char | DataType::Varchar, Some(len), _) => {
            format!("{}({})", base, len)
        }
        _ => base,
    }
}

fn integral_rank(data_type: DataType) -> Option<u8> {
    match data_type {
        DataType::TinyInt => Some(1),
        DataType::SmallInt => Some(2),
        DataType::Int => Some(3),
        DataType::BigInt => Some(4),
        _ => None,
    }
}

/// Lossless widening between numeric and character types
pub fn implicit_widening(from: DataType, to: DataType) -> bool {
    if from == to {
        return true;
    }
    if let (Some(a), Some(b)) = (integral_rank(from), integral_rank(to)) {
        return a < b;
    }
    matches!(
        (from, to),
        (DataType::Float, DataType::Double)
            | (DataType::TinyInt | DataType::SmallInt | DataType::Int, DataType::Double)
            | (DataType::Char, DataType::Varchar | DataType::Text)
            | (DataType::Varchar, DataType::Text)
            | (DataType::Date, DataType::Timestamp | DataType::DateTime)
    )
}

/// Casts the engines accept, possibly losing precision
pub fn explicit_cast(from: DataType, to: DataType) -> bool {
    if implicit_widening(from, to) || to.is_textual() {
        return true;
    }
    let numeric = |t: DataType| {
        t.is_integral() || matches!(t, DataType::Float | DataType::Double | DataType::Decimal)
    };
    let dated = |t: DataType| t.is_temporal() && t != DataType::Time;
    (numeric(from) && numeric(to))
        || (dated(from) && dated(to))
        || (from.is_textual() && to != DataType::Json)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_case_conversion() {
        assert_eq!(CaseConversion::ToUpper.apply("main"), "MAIN");
        assert_eq!(CaseConversion::ToLower.apply("MAIN"), "main");
        assert_eq!(CaseConversion::None.apply("Main"), "Main");
        assert_eq!(
            "to_upper".parse::<CaseConversion>().unwrap(),
            CaseConversion::ToUpper
        );
        assert!("sideways".parse::<CaseConversion>().is_err());
    }

    #[test]
    fn test_type_mappings() {
        assert!(implicit_widening(DataType::Int, DataType::BigInt));
        assert!(!implicit_widening(DataType::BigInt, DataType::Int));
        assert!(implicit_widening(DataType::Float, DataType::Double));
        assert!(!implicit_widening(DataType::Varchar, DataType::Int));

        assert!(explicit_cast(DataType::BigInt, DataType::Int));
        assert!(explicit_cast(DataType::Int, DataType::Varchar));
        assert!(explicit_cast(DataType::Varchar, DataType::Int));
        assert!(!explicit_cast(DataType::Boolean, DataType::Date));
    }

    #[test]
    fn test_ansi_type_name() {
        let decimal = FieldType {
            data_type: DataType::Decimal,
            length: Some(18),
            scale: Some(2),
        };
        assert_eq!(ansi_type_name(&decimal), "DECIMAL(18,2)");
        let varchar = FieldType {
            data_type: DataType::Varchar,
            length: Some(64),
            scale: None,
        };
        assert_eq!(ansi_type_name(&varchar), "VARCHAR(64)");
        assert_eq!(ansi_type_name(&FieldType::of(DataType::Int)), "INTEGER");
    }
}
