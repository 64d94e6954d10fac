//! Field model: a typed column of a dataset schema

use serde::{Deserialize, Serialize};

/// Logical data type of a field
///
/// Sinks map these onto their own type names when rendering DDL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataType {
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Boolean,
    Char,
    Varchar,
    Text,
    Date,
    Time,
    Timestamp,
    DateTime,
    Json,
}

impl DataType {
    /// Whether values of this type have a total order usable for versioning
    pub fn is_comparable(&self) -> bool {
        !matches!(self, DataType::Boolean | DataType::Json)
    }

    /// Whether this is an integral type
    pub fn is_integral(&self) -> bool {
        matches!(
            self,
            DataType::TinyInt | DataType::SmallInt | DataType::Int | DataType::BigInt
        )
    }

    /// Whether this is a character type
    pub fn is_textual(&self) -> bool {
        matches!(self, DataType::Char | DataType::Varchar | DataType::Text)
    }

    /// Whether this is a date or time type
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            DataType::Date | DataType::Time | DataType::Timestamp | DataType::DateTime
        )
    }

    /// Parse a type name as reported by an engine catalog
    ///
    /// Accepts forms such as `INTEGER`, `VARCHAR(64)`, `DECIMAL(18,2)` or
    /// `TIMESTAMP WITH TIME ZONE`. Returns the type with its optional length
    /// and scale.
    pub fn from_sql_name(name: &str) -> Option<FieldType> {
        let upper = name.trim().to_uppercase();
        let (base, args) = match upper.find('(') {
            Some(idx) => {
                let args = upper[idx + 1..].trim_end_matches(')');
                (upper[..idx].trim().to_string(), Some(args.to_string()))
            }
            None => (upper.clone(), None),
        };

        let data_type = match base.as_str() {
            "TINYINT" | "INT1" => DataType::TinyInt,
            "SMALLINT" | "INT2" | "SHORT" => DataType::SmallInt,
            "INT" | "INTEGER" | "INT4" | "SIGNED" => DataType::Int,
            "BIGINT" | "INT8" | "LONG" | "HUGEINT" => DataType::BigInt,
            "FLOAT" | "FLOAT4" | "REAL" => DataType::Float,
            "DOUBLE" | "FLOAT8" | "DOUBLE PRECISION" => DataType::Double,
            "DECIMAL" | "NUMERIC" => DataType::Decimal,
            "BOOLEAN" | "BOOL" | "LOGICAL" => DataType::Boolean,
            "CHAR" | "BPCHAR" | "CHARACTER" => DataType::Char,
            "VARCHAR" | "CHARACTER VARYING" | "STRING" => DataType::Varchar,
            "TEXT" => DataType::Text,
            "DATE" => DataType::Date,
            "TIME" => DataType::Time,
            "TIMESTAMP" | "TIMESTAMP WITH TIME ZONE" | "TIMESTAMPTZ"
            | "TIMESTAMP WITHOUT TIME ZONE" => DataType::Timestamp,
            "DATETIME" => DataType::DateTime,
            "JSON" | "JSONB" => DataType::Json,
            _ => return None,
        };

        let mut field_type = FieldType::of(data_type);
        if let Some(args) = args {
            let mut parts = args.split(',').map(|p| p.trim().parse::<u32>().ok());
            field_type.length = parts.next().flatten();
            field_type.scale = parts.next().flatten();
        }
        Some(field_type)
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DataType::TinyInt => "TINYINT",
            DataType::SmallInt => "SMALLINT",
            DataType::Int => "INTEGER",
            DataType::BigInt => "BIGINT",
            DataType::Float => "FLOAT",
            DataType::Double => "DOUBLE",
            DataType::Decimal => "DECIMAL",
            DataType::Boolean => "BOOLEAN",
            DataType::Char => "CHAR",
            DataType::Varchar => "VARCHAR",
            DataType::Text => "TEXT",
            DataType::Date => "DATE",
            DataType::Time => "TIME",
            DataType::Timestamp => "TIMESTAMP",
            DataType::DateTime => "DATETIME",
            DataType::Json => "JSON",
        };
        write!(f, "{}", name)
    }
}

/// Data type plus optional length/precision and scale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldType {
    pub data_type: DataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
}

impl FieldType {
    /// Type without length or scale
    pub fn of(data_type: DataType) -> Self {
        Self {
            data_type,
            length: None,
            scale: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// A single column of a dataset schema
///
/// Primary-key fields are implicitly non-nullable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Column type
    #[serde(rename = "type")]
    pub field_type: FieldType,
    /// Whether the column allows NULL values (default: true)
    #[serde(default = "default_true")]
    pub nullable: bool,
    /// Whether this column is part of the primary key
    #[serde(default)]
    pub primary_key: bool,
    /// Whether a UNIQUE constraint is declared on the column
    #[serde(default)]
    pub unique: bool,
}

impl Field {
    /// Create a nullable, non-key field
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::of(data_type),
            nullable: true,
            primary_key: false,
            unique: false,
        }
    }

    /// Mark as primary key (also makes the field non-nullable)
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Mark as NOT NULL
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Set the nullability explicitly
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Mark as UNIQUE
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Set length (or precision for decimals)
    pub fn with_length(mut self, length: u32) -> Self {
        self.field_type.length = Some(length);
        self
    }

    /// Set scale
    pub fn with_scale(mut self, scale: u32) -> Self {
        self.field_type.scale = Some(scale);
        self
    }

    /// Replace the type
    pub fn with_type(mut self, field_type: FieldType) -> Self {
        self.field_type = field_type;
        self
    }

    /// Rename, keeping every other attribute
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Drop the primary-key flag, keeping nullability
    pub fn without_primary_key(mut self) -> Self {
        self.primary_key = false;
        self
    }

    pub fn data_type(&self) -> DataType {
        self.field_type.data_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_key_is_not_null() {
        let field = Field::new("id", DataType::Int).primary_key();
        assert!(field.primary_key);
        assert!(!field.nullable);
    }

    #[test]
    fn test_from_sql_name() {
        let t = DataType::from_sql_name("VARCHAR(64)").unwrap();
        assert_eq!(t.data_type, DataType::Varchar);
        assert_eq!(t.length, Some(64));

        let t = DataType::from_sql_name("decimal(18, 2)").unwrap();
        assert_eq!(t.data_type, DataType::Decimal);
        assert_eq!(t.length, Some(18));
        assert_eq!(t.scale, Some(2));

        let t = DataType::from_sql_name("TIMESTAMP WITH TIME ZONE").unwrap();
        assert_eq!(t.data_type, DataType::Timestamp);

        assert!(DataType::from_sql_name("GEOMETRY").is_none());
    }

    #[test]
    fn test_comparable_types() {
        assert!(DataType::Int.is_comparable());
        assert!(DataType::Timestamp.is_comparable());
        assert!(!DataType::Boolean.is_comparable());
        assert!(!DataType::Json.is_comparable());
    }

    #[test]
    fn test_field_serde_defaults() {
        let json = r#"{"name":"amount","type":{"data_type":"DOUBLE"}}"#;
        let field: Field = serde_json::from_str(json).unwrap();
        assert!(field.nullable);
        assert!(!field.primary_key);
        assert_eq!(field.data_type(), DataType::Double);
    }
}
