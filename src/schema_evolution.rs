//! Schema evolution
//!
//! Compares the live main schema with the staging schema and derives the
//! `ALTER TABLE` operations that let staged rows land in main. Every change
//! is classified first; if any change is not allowed by both the caller and
//! the sink, evolution fails before a single statement is produced.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::{IngestError, IngestResult};
use crate::ingest_mode::IngestMode;
use crate::logical::{Alteration, LogicalPlan, Operation};
use crate::models::{Dataset, Field, FieldType, SchemaDefinition};
use crate::planner::DEDUP_COUNT_FIELD;
use crate::sink::{Capability, RelationalSink};

/// Category of schema change the caller may allow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchemaEvolutionCapability {
    AddColumn,
    DataTypeConversion,
    DataTypeSizeChange,
    ColumnNullabilityChange,
}

impl std::fmt::Display for SchemaEvolutionCapability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaEvolutionCapability::AddColumn => write!(f, "ADD_COLUMN"),
            SchemaEvolutionCapability::DataTypeConversion => write!(f, "DATA_TYPE_CONVERSION"),
            SchemaEvolutionCapability::DataTypeSizeChange => write!(f, "DATA_TYPE_SIZE_CHANGE"),
            SchemaEvolutionCapability::ColumnNullabilityChange => {
                write!(f, "COLUMN_NULLABILITY_CHANGE")
            }
        }
    }
}

impl std::str::FromStr for SchemaEvolutionCapability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ADD_COLUMN" => Ok(SchemaEvolutionCapability::AddColumn),
            "DATA_TYPE_CONVERSION" => Ok(SchemaEvolutionCapability::DataTypeConversion),
            "DATA_TYPE_SIZE_CHANGE" => Ok(SchemaEvolutionCapability::DataTypeSizeChange),
            "COLUMN_NULLABILITY_CHANGE" => Ok(SchemaEvolutionCapability::ColumnNullabilityChange),
            _ => Err(format!("Unknown schema evolution capability: {}", s)),
        }
    }
}

/// One classified difference between main and staging
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaChange {
    pub column: String,
    pub category: SchemaEvolutionCapability,
    /// Sink capability the change needs, if any
    pub sink_capability: Option<Capability>,
    pub alteration: Alteration,
}

/// Evolved main dataset and the statements producing it
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaEvolutionResult {
    pub main: Dataset,
    pub changes: Vec<SchemaChange>,
    pub operations: LogicalPlan,
}

impl SchemaEvolutionResult {
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Schema diff gated by the allowed capabilities
pub struct SchemaEvolution<'a> {
    sink: &'a dyn RelationalSink,
    mode: &'a IngestMode,
    allowed: BTreeSet<SchemaEvolutionCapability>,
}

impl<'a> SchemaEvolution<'a> {
    pub fn new(
        sink: &'a dyn RelationalSink,
        mode: &'a IngestMode,
        allowed: impl IntoIterator<Item = SchemaEvolutionCapability>,
    ) -> Self {
        Self {
            sink,
            mode,
            allowed: allowed.into_iter().collect(),
        }
    }

    fn ignored_main_fields(&self) -> Vec<String> {
        self.mode
            .main_owned_fields()
            .into_iter()
            .map(|f| f.name)
            .collect()
    }

    fn ignored_staging_fields(&self) -> Vec<String> {
        let mut fields = self.mode.staging_only_fields();
        if let Some(validity) = self.mode.validity_milestoning() {
            fields.extend(validity.source_fields().into_iter().map(str::to_string));
        }
        if let Some(split) = self.mode.versioning().data_split_field() {
            fields.push(split.to_string());
        }
        fields.push(DEDUP_COUNT_FIELD.to_string());
        fields.extend(self.ignored_main_fields());
        fields
    }

    /// Diff `main` against `staging` and produce the allowed `ALTER` statements
    pub fn evolve(
        &self,
        main: &Dataset,
        staging: &SchemaDefinition,
    ) -> IngestResult<SchemaEvolutionResult> {
        let ignored_main = self.ignored_main_fields();
        let ignored_staging = self.ignored_staging_fields();
        let mut changes = Vec::new();

        for incoming in staging
            .fields()
            .iter()
            .filter(|f| !ignored_staging.contains(&f.name))
        {
            match main.schema.field(&incoming.name) {
                None => {
                    if incoming.primary_key {
                        return Err(IngestError::SchemaIncompatible(format!(
                            "Primary key column '{}' is missing from main table '{}'",
                            incoming.name,
                            main.name()
                        )));
                    }
                    changes.push(SchemaChange {
                        column: incoming.name.clone(),
                        category: SchemaEvolutionCapability::AddColumn,
                        sink_capability: Some(Capability::AddColumn),
                        alteration: Alteration::AddColumn(
                            incoming.clone().without_primary_key().with_nullable(true),
                        ),
                    });
                }
                Some(existing) => {
                    if existing.primary_key != incoming.primary_key {
                        return Err(IngestError::SchemaIncompatible(format!(
                            "Primary key change for column '{}' of main table '{}'",
                            incoming.name,
                            main.name()
                        )));
                    }
                    if let Some(change) = self.type_change(existing, incoming)? {
                        changes.push(change);
                    }
                    if !existing.nullable && incoming.nullable && !existing.primary_key {
                        changes.push(nullability_change(existing));
                    }
                }
            }
        }

        for existing in main
            .schema
            .fields()
            .iter()
            .filter(|f| !ignored_main.contains(&f.name) && !staging.contains(&f.name))
        {
            if existing.primary_key {
                return Err(IngestError::SchemaIncompatible(format!(
                    "Primary key column '{}' of main table '{}' is missing from staging",
                    existing.name,
                    main.name()
                )));
            }
            if !existing.nullable {
                changes.push(nullability_change(existing));
            }
        }

        // all-or-nothing: reject before producing any statement
        for change in &changes {
            if !self.allowed.contains(&change.category) {
                return Err(IngestError::SchemaIncompatible(format!(
                    "Column '{}' needs {} which is not an allowed schema evolution capability",
                    change.column, change.category
                )));
            }
            if let Some(capability) = change.sink_capability
                && !self.sink.supports(capability)
            {
                return Err(IngestError::SchemaIncompatible(format!(
                    "Column '{}' needs {:?} which sink {} does not support",
                    change.column,
                    capability,
                    self.sink.name()
                )));
            }
        }

        let mut table = main.reference.clone();
        table.alias = None;
        let mut schema = main.schema.clone();
        let mut operations = LogicalPlan::default();
        for change in &changes {
            schema = match &change.alteration {
                Alteration::AddColumn(field) | Alteration::ChangeDataType(field) => {
                    schema.with_field(field.clone())
                }
                Alteration::DropNotNull(column) => match schema.field(column) {
                    Some(field) => schema.with_field(field.clone().with_nullable(true)),
                    None => schema,
                },
            };
            operations.push(Operation::Alter {
                table: table.clone(),
                alteration: change.alteration.clone(),
            });
        }

        if !changes.is_empty() {
            tracing::info!(
                "Schema evolution of {} applies {} change(s)",
                main.name(),
                changes.len()
            );
        }

        Ok(SchemaEvolutionResult {
            main: main.clone().with_schema(schema),
            changes,
            operations,
        })
    }

    /// Classify the type difference of one column, `None` when main already fits
    fn type_change(&self, existing: &Field, incoming: &Field) -> IngestResult<Option<SchemaChange>> {
        let current = self.sink.normalize(&existing.field_type);
        let wanted = self.sink.normalize(&incoming.field_type);
        if current == wanted {
            return Ok(None);
        }

        if current.data_type == wanted.data_type {
            let longer = wider(current.length, wanted.length);
            let finer = wider(current.scale, wanted.scale);
            if !longer && !finer {
                // narrower staged values fit the main column as is
                return Ok(None);
            }
            let widened = FieldType {
                data_type: current.data_type,
                length: if longer { wanted.length } else { current.length },
                scale: if finer { wanted.scale } else { current.scale },
            };
            return Ok(Some(SchemaChange {
                column: existing.name.clone(),
                category: SchemaEvolutionCapability::DataTypeSizeChange,
                sink_capability: Some(if longer {
                    Capability::DataTypeLengthChange
                } else {
                    Capability::DataTypeScaleChange
                }),
                alteration: Alteration::ChangeDataType(existing.clone().with_type(widened)),
            }));
        }

        if self
            .sink
            .supports_implicit_mapping(wanted.data_type, current.data_type)
        {
            return Ok(None);
        }
        if self
            .sink
            .supports_implicit_mapping(current.data_type, wanted.data_type)
        {
            return Ok(Some(SchemaChange {
                column: existing.name.clone(),
                category: SchemaEvolutionCapability::DataTypeSizeChange,
                sink_capability: Some(Capability::ImplicitDataTypeConversion),
                alteration: Alteration::ChangeDataType(
                    existing.clone().with_type(incoming.field_type),
                ),
            }));
        }
        if self
            .sink
            .supports_explicit_mapping(current.data_type, wanted.data_type)
        {
            return Ok(Some(SchemaChange {
                column: existing.name.clone(),
                category: SchemaEvolutionCapability::DataTypeConversion,
                sink_capability: Some(Capability::ExplicitDataTypeConversion),
                alteration: Alteration::ChangeDataType(
                    existing.clone().with_type(incoming.field_type),
                ),
            }));
        }
        Err(IngestError::SchemaIncompatible(format!(
            "Column '{}' cannot change from {} to {}",
            existing.name, current.data_type, wanted.data_type
        )))
    }
}

/// Whether `wanted` holds more than `current`; absent means unbounded
fn wider(current: Option<u32>, wanted: Option<u32>) -> bool {
    match (current, wanted) {
        (Some(a), Some(b)) => b > a,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn nullability_change(existing: &Field) -> SchemaChange {
    SchemaChange {
        column: existing.name.clone(),
        category: SchemaEvolutionCapability::ColumnNullabilityChange,
        sink_capability: None,
        alteration: Alteration::DropNotNull(existing.name.clone()),
    }
}
