//! Schema definition: an ordered set of uniquely named fields

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::field::Field;
use crate::error::{IngestError, IngestResult};

/// Maximum identifier length accepted for tables and columns
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

static RE_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*$").expect("Invalid regex"));

/// Validate a table or column identifier
pub fn validate_identifier(kind: &str, name: &str) -> IngestResult<()> {
    if name.is_empty() {
        return Err(IngestError::Configuration(format!(
            "{} name cannot be empty",
            kind
        )));
    }
    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(IngestError::Configuration(format!(
            "{} name '{}' exceeds maximum length of {}",
            kind, name, MAX_IDENTIFIER_LENGTH
        )));
    }
    if !RE_IDENTIFIER.is_match(name) {
        return Err(IngestError::Configuration(format!(
            "{} name '{}' contains invalid characters",
            kind, name
        )));
    }
    Ok(())
}

/// Ordered list of fields with unique names
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Field>", into = "Vec<Field>")]
pub struct SchemaDefinition {
    fields: Vec<Field>,
}

impl SchemaDefinition {
    /// Build a schema, rejecting invalid or duplicate field names
    pub fn new(fields: Vec<Field>) -> IngestResult<Self> {
        let mut seen = HashSet::new();
        for field in &fields {
            validate_identifier("Field", &field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(IngestError::Configuration(format!(
                    "Duplicate field '{}' in schema",
                    field.name
                )));
            }
        }
        Ok(Self { fields })
    }

    /// Schema from fields whose names are known to be valid and unique
    pub(crate) fn trusted(fields: Vec<Field>) -> Self {
        Self { fields }
    }

    /// Schema with no fields (main tables derived from staging start here)
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Look up a field by exact name
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn primary_keys(&self) -> Vec<&Field> {
        self.fields.iter().filter(|f| f.primary_key).collect()
    }

    pub fn primary_key_names(&self) -> Vec<&str> {
        self.primary_keys().iter().map(|f| f.name.as_str()).collect()
    }

    /// New schema with `field` appended, or replacing a field of the same name
    pub fn with_field(&self, field: Field) -> Self {
        let mut fields = self.fields.clone();
        match fields.iter_mut().find(|f| f.name == field.name) {
            Some(existing) => *existing = field,
            None => fields.push(field),
        }
        Self { fields }
    }

    /// New schema without the named fields
    pub fn without<S: AsRef<str>>(&self, names: &[S]) -> Self {
        let fields = self
            .fields
            .iter()
            .filter(|f| !names.iter().any(|n| n.as_ref() == f.name))
            .cloned()
            .collect();
        Self { fields }
    }

    /// New schema with every field name rewritten by `convert`
    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        let fields = self
            .fields
            .iter()
            .map(|f| f.clone().with_name(convert(&f.name)))
            .collect();
        Self { fields }
    }
}

impl TryFrom<Vec<Field>> for SchemaDefinition {
    type Error = IngestError;

    fn try_from(fields: Vec<Field>) -> Result<Self, Self::Error> {
        SchemaDefinition::new(fields)
    }
}

impl From<SchemaDefinition> for Vec<Field> {
    fn from(schema: SchemaDefinition) -> Self {
        schema.fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::DataType;

    fn sample() -> SchemaDefinition {
        SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("name", DataType::Varchar).primary_key(),
            Field::new("amount", DataType::Double),
        ])
        .unwrap()
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let result = SchemaDefinition::new(vec![
            Field::new("id", DataType::Int),
            Field::new("id", DataType::BigInt),
        ]);
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_invalid_identifier_rejected() {
        let result = SchemaDefinition::new(vec![Field::new("bad name;", DataType::Int)]);
        assert!(result.is_err());
        assert!(validate_identifier("Table", "").is_err());
        assert!(validate_identifier("Table", "main_2024").is_ok());
    }

    #[test]
    fn test_primary_keys_in_order() {
        assert_eq!(sample().primary_key_names(), vec!["id", "name"]);
    }

    #[test]
    fn test_with_field_replaces() {
        let schema = sample().with_field(Field::new("amount", DataType::Decimal));
        assert_eq!(schema.len(), 3);
        assert_eq!(schema.field("amount").unwrap().data_type(), DataType::Decimal);

        let schema = schema.with_field(Field::new("digest", DataType::Varchar));
        assert_eq!(schema.field_names(), vec!["id", "name", "amount", "digest"]);
    }

    #[test]
    fn test_without_and_map_names() {
        let schema = sample().without(&["amount"]).map_names(|n| n.to_uppercase());
        assert_eq!(schema.field_names(), vec!["ID", "NAME"]);
    }
}
