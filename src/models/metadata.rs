//! Ledger and lock table descriptors
//!
//! Both tables persist across runs. The ledger holds one row per committed
//! batch; the lock table holds one row per target table.

use serde::{Deserialize, Serialize};

use super::dataset::DatasetReference;
use super::field::{DataType, Field};
use super::schema::SchemaDefinition;

/// Default ledger table name
pub const DEFAULT_METADATA_TABLE: &str = "batch_metadata";

/// Suffix of the default lock table
pub const LOCK_TABLE_SUFFIX: &str = "_ingest_lock";

/// Audit ledger of committed batches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDataset {
    pub reference: DatasetReference,
    pub table_name_field: String,
    pub batch_start_ts_field: String,
    pub batch_end_ts_field: String,
    pub batch_status_field: String,
    pub table_batch_id_field: String,
    pub batch_source_info_field: String,
    pub additional_metadata_field: String,
    pub ingest_request_id_field: String,
    pub batch_statistics_field: String,
}

impl Default for MetadataDataset {
    fn default() -> Self {
        Self {
            reference: DatasetReference::new(DEFAULT_METADATA_TABLE),
            table_name_field: "table_name".to_string(),
            batch_start_ts_field: "batch_start_ts_utc".to_string(),
            batch_end_ts_field: "batch_end_ts_utc".to_string(),
            batch_status_field: "batch_status".to_string(),
            table_batch_id_field: "table_batch_id".to_string(),
            batch_source_info_field: "batch_source_info".to_string(),
            additional_metadata_field: "additional_metadata".to_string(),
            ingest_request_id_field: "ingest_request_id".to_string(),
            batch_statistics_field: "batch_statistics".to_string(),
        }
    }
}

impl MetadataDataset {
    /// Ledger with a custom table name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            reference: DatasetReference::new(name),
            ..Default::default()
        }
    }

    /// Place the ledger in the database and group of `main`
    pub fn in_database_of(mut self, main: &DatasetReference) -> Self {
        self.reference.database = main.database.clone();
        self.reference.group = main.group.clone();
        self
    }

    pub fn schema(&self) -> SchemaDefinition {
        SchemaDefinition::trusted(vec![
            Field::new(&self.table_name_field, DataType::Varchar).with_length(255),
            Field::new(&self.batch_start_ts_field, DataType::DateTime),
            Field::new(&self.batch_end_ts_field, DataType::DateTime),
            Field::new(&self.batch_status_field, DataType::Varchar).with_length(32),
            Field::new(&self.table_batch_id_field, DataType::Int),
            Field::new(&self.batch_source_info_field, DataType::Json),
            Field::new(&self.additional_metadata_field, DataType::Json),
            Field::new(&self.ingest_request_id_field, DataType::Varchar).with_length(255),
            Field::new(&self.batch_statistics_field, DataType::Json),
        ])
    }

    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        Self {
            reference: self.reference.map_names(&convert),
            table_name_field: convert(&self.table_name_field),
            batch_start_ts_field: convert(&self.batch_start_ts_field),
            batch_end_ts_field: convert(&self.batch_end_ts_field),
            batch_status_field: convert(&self.batch_status_field),
            table_batch_id_field: convert(&self.table_batch_id_field),
            batch_source_info_field: convert(&self.batch_source_info_field),
            additional_metadata_field: convert(&self.additional_metadata_field),
            ingest_request_id_field: convert(&self.ingest_request_id_field),
            batch_statistics_field: convert(&self.batch_statistics_field),
        }
    }
}

/// Per-target-table mutex record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfoDataset {
    pub reference: DatasetReference,
    pub insert_ts_field: String,
    pub last_used_ts_field: String,
    pub table_name_field: String,
}

impl LockInfoDataset {
    pub fn new(reference: DatasetReference) -> Self {
        Self {
            reference,
            insert_ts_field: "insert_ts_utc".to_string(),
            last_used_ts_field: "last_used_ts_utc".to_string(),
            table_name_field: "table_name".to_string(),
        }
    }

    /// `{main}_ingest_lock` next to the main table
    pub fn for_main(main: &DatasetReference) -> Self {
        Self::new(main.sibling(format!("{}{}", main.name, LOCK_TABLE_SUFFIX)))
    }

    pub fn schema(&self) -> SchemaDefinition {
        SchemaDefinition::trusted(vec![
            Field::new(&self.insert_ts_field, DataType::DateTime),
            Field::new(&self.last_used_ts_field, DataType::DateTime),
            Field::new(&self.table_name_field, DataType::Varchar)
                .with_length(255)
                .unique(),
        ])
    }

    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        Self {
            reference: self.reference.map_names(&convert),
            insert_ts_field: convert(&self.insert_ts_field),
            last_used_ts_field: convert(&self.last_used_ts_field),
            table_name_field: convert(&self.table_name_field),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_schema_columns() {
        let schema = MetadataDataset::default().schema();
        assert_eq!(schema.len(), 9);
        assert_eq!(schema.field_names()[0], "table_name");
        assert!(schema.contains("ingest_request_id"));
        assert!(schema.contains("batch_statistics"));
    }

    #[test]
    fn test_lock_for_main() {
        let main = DatasetReference::new("orders").with_group("sales");
        let lock = LockInfoDataset::for_main(&main);
        assert_eq!(lock.reference.name, "orders_ingest_lock");
        assert_eq!(lock.reference.group.as_deref(), Some("sales"));
        assert!(lock.schema().field("table_name").unwrap().unique);
    }
}
