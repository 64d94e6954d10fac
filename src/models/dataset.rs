//! Dataset model
//!
//! A dataset is a named relational source or target with a schema. Staging
//! datasets can additionally be filtered, derived (a list of ANDed filters
//! over a table) or backed by staged files for bulk loading.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;

use super::filter::{DatasetFilter, FilterCondition, filters_to_json};
use super::metadata::{LockInfoDataset, MetadataDataset};
use super::schema::{SchemaDefinition, validate_identifier};
use crate::error::{IngestError, IngestResult};

/// Suffix of the temp staging table used by deduplication and versioning
pub const TEMP_STAGING_SUFFIX: &str = "_ingest_temp_staging";

/// Suffix of the temp table used by bitemporal ingestion
pub const TEMP_SUFFIX: &str = "_ingest_temp";

/// Fully qualified name of a table with an optional alias
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DatasetReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            database: None,
            group: None,
            name: name.into(),
            alias: None,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Sibling table in the same database and group
    pub fn sibling(&self, name: impl Into<String>) -> Self {
        Self {
            database: self.database.clone(),
            group: self.group.clone(),
            name: name.into(),
            alias: None,
        }
    }

    /// Validate every part of the name
    pub fn validate(&self) -> IngestResult<()> {
        if let Some(database) = &self.database {
            validate_identifier("Database", database)?;
        }
        if let Some(group) = &self.group {
            validate_identifier("Group", group)?;
        }
        validate_identifier("Table", &self.name)
    }

    /// Rewrite database, group and table names
    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        Self {
            database: self.database.as_deref().map(&convert),
            group: self.group.as_deref().map(&convert),
            name: convert(&self.name),
            alias: self.alias.clone(),
        }
    }
}

/// Format of staged files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileFormat {
    Csv,
    Json,
    Parquet,
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileFormat::Csv => write!(f, "CSV"),
            FileFormat::Json => write!(f, "JSON"),
            FileFormat::Parquet => write!(f, "PARQUET"),
        }
    }
}

fn default_header() -> bool {
    true
}

/// Source description of a staged-files dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagedFilesProperties {
    pub format: FileFormat,
    /// Explicit file paths
    #[serde(default)]
    pub file_paths: Vec<String>,
    /// Glob patterns, expanded when the plan is built
    #[serde(default)]
    pub file_patterns: Vec<String>,
    /// Whether CSV files carry a header row
    #[serde(default = "default_header")]
    pub header: bool,
    /// CSV delimiter, engine default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delimiter: Option<char>,
}

impl StagedFilesProperties {
    pub fn new(format: FileFormat) -> Self {
        Self {
            format,
            file_paths: Vec::new(),
            file_patterns: Vec::new(),
            header: true,
            delimiter: None,
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_paths.push(path.into());
        self
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_patterns.push(pattern.into());
        self
    }

    pub fn with_header(mut self, header: bool) -> Self {
        self.header = header;
        self
    }

    pub fn with_delimiter(mut self, delimiter: char) -> Self {
        self.delimiter = Some(delimiter);
        self
    }

    /// Explicit paths followed by the sorted expansion of every pattern
    ///
    /// Unreadable glob entries are logged and skipped. Duplicates are removed.
    pub fn resolve_files(&self) -> IngestResult<Vec<String>> {
        let mut files = self.file_paths.clone();

        for pattern in &self.file_patterns {
            let entries = glob::glob(pattern).map_err(|e| {
                IngestError::Configuration(format!("Invalid file pattern {}: {}", pattern, e))
            })?;

            let mut matched = Vec::new();
            for entry in entries {
                match entry {
                    Ok(path) => {
                        if path.is_file() {
                            matched.push(path.to_string_lossy().into_owned());
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Error accessing staged file: {}", e);
                    }
                }
            }
            matched.sort();
            files.extend(matched);
        }

        let mut seen = std::collections::HashSet::new();
        files.retain(|f| seen.insert(f.clone()));
        Ok(files)
    }
}

/// Compute the SHA-256 content hash of a staged file
pub fn compute_file_hash(path: &Path) -> IngestResult<String> {
    let content = std::fs::read(path)
        .map_err(|e| IngestError::Io(format!("Failed to read {}: {}", path.display(), e)))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// What kind of relation backs a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetKind {
    /// Plain table
    Definition,
    /// Table restricted by a filter tree
    Filtered { filter: FilterCondition },
    /// Table restricted by a list of ANDed filters
    Derived { filters: Vec<DatasetFilter> },
    /// Files read directly by the engine
    StagedFiles { properties: StagedFilesProperties },
}

/// A named relation with a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub reference: DatasetReference,
    pub schema: SchemaDefinition,
    #[serde(flatten)]
    pub kind: DatasetKind,
}

impl Dataset {
    /// Plain table dataset
    pub fn new(name: impl Into<String>, schema: SchemaDefinition) -> Self {
        Self {
            reference: DatasetReference::new(name),
            schema,
            kind: DatasetKind::Definition,
        }
    }

    /// Dataset from an existing reference
    pub fn from_reference(reference: DatasetReference, schema: SchemaDefinition) -> Self {
        Self {
            reference,
            schema,
            kind: DatasetKind::Definition,
        }
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.reference.database = Some(database.into());
        self
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.reference.group = Some(group.into());
        self
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.reference.alias = Some(alias.into());
        self
    }

    pub fn with_schema(mut self, schema: SchemaDefinition) -> Self {
        self.schema = schema;
        self
    }

    /// Restrict the dataset by a filter tree
    pub fn filtered(mut self, filter: FilterCondition) -> Self {
        self.kind = DatasetKind::Filtered { filter };
        self
    }

    /// Restrict the dataset by ANDed filters
    pub fn derived(mut self, filters: Vec<DatasetFilter>) -> Self {
        self.kind = DatasetKind::Derived { filters };
        self
    }

    /// Back the dataset by staged files
    pub fn staged_files(mut self, properties: StagedFilesProperties) -> Self {
        self.kind = DatasetKind::StagedFiles { properties };
        self
    }

    pub fn name(&self) -> &str {
        &self.reference.name
    }

    pub fn is_staged_files(&self) -> bool {
        matches!(self.kind, DatasetKind::StagedFiles { .. })
    }

    pub fn staged_files_properties(&self) -> Option<&StagedFilesProperties> {
        match &self.kind {
            DatasetKind::StagedFiles { properties } => Some(properties),
            _ => None,
        }
    }

    /// Whether the dataset reads a subset of its underlying table
    pub fn is_filtered(&self) -> bool {
        matches!(
            self.kind,
            DatasetKind::Filtered { .. } | DatasetKind::Derived { .. }
        )
    }

    /// Row filter as a single condition tree, if any
    pub fn filter_condition(&self) -> Option<FilterCondition> {
        match &self.kind {
            DatasetKind::Filtered { filter } => Some(filter.clone()),
            DatasetKind::Derived { filters } if !filters.is_empty() => Some(FilterCondition::And(
                filters.iter().cloned().map(FilterCondition::Leaf).collect(),
            )),
            _ => None,
        }
    }

    /// Validate names, schema and filter fields
    pub fn validate(&self) -> IngestResult<()> {
        self.reference.validate()?;
        if let Some(condition) = self.filter_condition() {
            for field in condition.fields() {
                if !self.schema.contains(field) {
                    return Err(IngestError::Configuration(format!(
                        "Filter field '{}' is not part of dataset '{}'",
                        field,
                        self.name()
                    )));
                }
            }
        }
        if let DatasetKind::StagedFiles { properties } = &self.kind
            && properties.file_paths.is_empty()
            && properties.file_patterns.is_empty()
        {
            return Err(IngestError::Configuration(format!(
                "Staged files dataset '{}' has no file paths or patterns",
                self.name()
            )));
        }
        Ok(())
    }

    /// Description of where the rows came from, recorded in the ledger
    ///
    /// Derived and filtered datasets report their filters, staged files report
    /// the resolved file list and a content hash per readable file.
    pub fn source_info(&self) -> IngestResult<Option<serde_json::Value>> {
        match &self.kind {
            DatasetKind::Definition => Ok(None),
            DatasetKind::Derived { filters } => Ok(Some(serde_json::json!({
                "staging_filters": filters_to_json(filters)
            }))),
            DatasetKind::Filtered { filter } => Ok(Some(serde_json::json!({
                "staging_filters": serde_json::to_value(filter)?
            }))),
            DatasetKind::StagedFiles { properties } => {
                let files = properties.resolve_files()?;
                let mut hashes = BTreeMap::new();
                for file in &files {
                    match compute_file_hash(Path::new(file)) {
                        Ok(hash) => {
                            hashes.insert(file.clone(), hash);
                        }
                        Err(e) => tracing::debug!("Skipping hash for {}: {}", file, e),
                    }
                }
                Ok(Some(serde_json::json!({
                    "file_paths": files,
                    "file_hashes": hashes,
                })))
            }
        }
    }

    /// Rewrite table and field names (case conversion)
    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        let kind = match &self.kind {
            DatasetKind::Filtered { filter } => DatasetKind::Filtered {
                filter: map_condition(filter, &convert),
            },
            DatasetKind::Derived { filters } => DatasetKind::Derived {
                filters: filters
                    .iter()
                    .map(|f| DatasetFilter {
                        field: convert(&f.field),
                        ..f.clone()
                    })
                    .collect(),
            },
            other => other.clone(),
        };
        Self {
            reference: self.reference.map_names(&convert),
            schema: self.schema.map_names(&convert),
            kind,
        }
    }
}

fn map_condition(condition: &FilterCondition, convert: &impl Fn(&str) -> String) -> FilterCondition {
    match condition {
        FilterCondition::Leaf(f) => FilterCondition::Leaf(DatasetFilter {
            field: convert(&f.field),
            ..f.clone()
        }),
        FilterCondition::And(children) => {
            FilterCondition::And(children.iter().map(|c| map_condition(c, convert)).collect())
        }
        FilterCondition::Or(children) => {
            FilterCondition::Or(children.iter().map(|c| map_condition(c, convert)).collect())
        }
    }
}

/// The unit of work of one ingestion call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datasets {
    pub main: Dataset,
    pub staging: Dataset,
    pub metadata: MetadataDataset,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_info: Option<LockInfoDataset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_name: Option<String>,
}

impl Datasets {
    /// Pair a main and a staging dataset with the default ledger
    pub fn new(main: Dataset, staging: Dataset) -> IngestResult<Self> {
        main.validate()?;
        staging.validate()?;
        if main.reference.name == staging.reference.name
            && main.reference.group == staging.reference.group
            && main.reference.database == staging.reference.database
        {
            return Err(IngestError::Configuration(format!(
                "Main and staging datasets must differ, both are '{}'",
                main.name()
            )));
        }
        let metadata = MetadataDataset::default().in_database_of(&main.reference);
        Ok(Self {
            main,
            staging,
            metadata,
            lock_info: None,
            temp_name: None,
        })
    }

    pub fn with_metadata(mut self, metadata: MetadataDataset) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_lock_info(mut self, lock_info: LockInfoDataset) -> Self {
        self.lock_info = Some(lock_info);
        self
    }

    pub fn with_temp_name(mut self, name: impl Into<String>) -> Self {
        self.temp_name = Some(name.into());
        self
    }

    pub fn with_main(mut self, main: Dataset) -> Self {
        self.main = main;
        self
    }

    pub fn with_staging(mut self, staging: Dataset) -> Self {
        self.staging = staging;
        self
    }

    /// Lock table, `{main}_ingest_lock` unless overridden
    pub fn lock_info_or_default(&self) -> LockInfoDataset {
        self.lock_info
            .clone()
            .unwrap_or_else(|| LockInfoDataset::for_main(&self.main.reference))
    }

    /// Temp staging table used by dedup and versioning
    pub fn temp_staging_reference(&self) -> DatasetReference {
        self.staging
            .reference
            .sibling(format!("{}{}", self.staging.name(), TEMP_STAGING_SUFFIX))
    }

    /// Temp table used by bitemporal ingestion
    pub fn temp_reference(&self) -> DatasetReference {
        let name = self
            .temp_name
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.main.name(), TEMP_SUFFIX));
        self.main.reference.sibling(name)
    }

    /// Rewrite every table and field name
    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        Self {
            main: self.main.map_names(&convert),
            staging: self.staging.map_names(&convert),
            metadata: self.metadata.map_names(&convert),
            lock_info: self.lock_info.as_ref().map(|l| l.map_names(&convert)),
            temp_name: self.temp_name.as_deref().map(&convert),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::field::{DataType, Field};
    use crate::models::filter::FilterOperator;
    use std::io::Write;
    use tempfile::TempDir;

    fn schema() -> SchemaDefinition {
        SchemaDefinition::new(vec![
            Field::new("id", DataType::Int).primary_key(),
            Field::new("batch", DataType::Int),
        ])
        .unwrap()
    }

    #[test]
    fn test_datasets_defaults() {
        let datasets = Datasets::new(
            Dataset::new("main", schema()).with_group("analytics"),
            Dataset::new("staging", schema()),
        )
        .unwrap();
        assert_eq!(datasets.metadata.reference.name, "batch_metadata");
        assert_eq!(datasets.metadata.reference.group.as_deref(), Some("analytics"));
        assert_eq!(datasets.lock_info_or_default().reference.name, "main_ingest_lock");
        assert_eq!(
            datasets.temp_staging_reference().name,
            "staging_ingest_temp_staging"
        );
        assert_eq!(datasets.temp_reference().name, "main_ingest_temp");
    }

    #[test]
    fn test_same_main_and_staging_rejected() {
        let result = Datasets::new(
            Dataset::new("main", schema()),
            Dataset::new("main", schema()),
        );
        assert!(matches!(result, Err(IngestError::Configuration(_))));
    }

    #[test]
    fn test_derived_source_info() {
        let staging = Dataset::new("staging", schema()).derived(vec![DatasetFilter::new(
            "batch",
            FilterOperator::Gt,
            3,
        )]);
        let info = staging.source_info().unwrap().unwrap();
        assert_eq!(info["staging_filters"]["batch"]["GT"], 3);
        assert!(staging.filter_condition().is_some());
    }

    #[test]
    fn test_unknown_filter_field_rejected() {
        let staging = Dataset::new("staging", schema()).derived(vec![DatasetFilter::new(
            "missing",
            FilterOperator::Eq,
            1,
        )]);
        assert!(staging.validate().is_err());
    }

    #[test]
    fn test_staged_files_resolution_and_hashes() {
        let temp = TempDir::new().unwrap();
        for name in ["b.csv", "a.csv", "skip.txt"] {
            let mut file = std::fs::File::create(temp.path().join(name)).unwrap();
            writeln!(file, "id,batch").unwrap();
            writeln!(file, "1,{}", name.len()).unwrap();
        }
        let pattern = format!("{}/*.csv", temp.path().display());
        let staging = Dataset::new("staging", schema())
            .staged_files(StagedFilesProperties::new(FileFormat::Csv).with_file_pattern(pattern));

        let files = staging
            .staged_files_properties()
            .unwrap()
            .resolve_files()
            .unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("a.csv"));
        assert!(files[1].ends_with("b.csv"));

        let info = staging.source_info().unwrap().unwrap();
        assert_eq!(info["file_paths"].as_array().unwrap().len(), 2);
        assert_eq!(info["file_hashes"].as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_map_names_upper() {
        let staging = Dataset::new("staging", schema()).derived(vec![DatasetFilter::new(
            "batch",
            FilterOperator::Eq,
            1,
        )]);
        let upper = staging.map_names(|n| n.to_uppercase());
        assert_eq!(upper.name(), "STAGING");
        assert_eq!(upper.schema.field_names(), vec!["ID", "BATCH"]);
        assert_eq!(upper.filter_condition().unwrap().fields(), vec!["BATCH"]);
    }
}
