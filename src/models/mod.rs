//! Models module
//!
//! Defines the datasets an ingestion reads from and writes to: fields,
//! schemas, dataset variants, row filters and the ledger/lock tables.

pub mod dataset;
pub mod field;
pub mod filter;
pub mod metadata;
pub mod schema;

pub use dataset::{
    Dataset, DatasetKind, DatasetReference, Datasets, FileFormat, StagedFilesProperties,
    TEMP_STAGING_SUFFIX, TEMP_SUFFIX, compute_file_hash,
};
pub use field::{DataType, Field, FieldType};
pub use filter::{DatasetFilter, FilterCondition, FilterOperator, FilterValue, filters_to_json};
pub use metadata::{DEFAULT_METADATA_TABLE, LOCK_TABLE_SUFFIX, LockInfoDataset, MetadataDataset};
pub use schema::{MAX_IDENTIFIER_LENGTH, SchemaDefinition, validate_identifier};
