//! Ingest modes
//!
//! An ingest mode is the temporal policy applied when staged rows are written
//! to the main table. Every mode composes the same independent axes (auditing,
//! digest, deduplication, versioning, merge) with its own milestoning.

pub mod milestoning;
pub mod strategies;

use serde::{Deserialize, Serialize};

pub use milestoning::{
    DEFAULT_INFINITY_DATE, INFINITE_BATCH_ID, TransactionMilestoning, ValidityDerivation,
    ValidityMilestoning,
};
pub use strategies::{
    Auditing, DEFAULT_DATA_SPLIT_FIELD, DeduplicationStrategy, DigestGenStrategy,
    EmptyBatchHandling, MergeStrategy, VersionResolver, VersioningStrategy,
};

use crate::error::{IngestError, IngestResult};
use crate::models::{DataType, Datasets, Field, SchemaDefinition};

/// Default batch id column of append-style modes
pub const DEFAULT_BATCH_ID_FIELD: &str = "batch_id";

fn default_batch_id_field() -> String {
    DEFAULT_BATCH_ID_FIELD.to_string()
}

/// Insert staged rows, optionally skipping rows already present
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppendOnly {
    #[serde(default)]
    pub auditing: Auditing,
    #[serde(default)]
    pub digest: DigestGenStrategy,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub filter_existing_records: bool,
    #[serde(default = "default_batch_id_field")]
    pub batch_id_field: String,
}

impl Default for AppendOnly {
    fn default() -> Self {
        Self {
            auditing: Auditing::default(),
            digest: DigestGenStrategy::default(),
            deduplication: DeduplicationStrategy::default(),
            versioning: VersioningStrategy::default(),
            filter_existing_records: false,
            batch_id_field: default_batch_id_field(),
        }
    }
}

/// Replace the main table with the staged rows
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NontemporalSnapshot {
    #[serde(default)]
    pub auditing: Auditing,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub empty_batch_handling: EmptyBatchHandling,
}

/// Upsert staged rows by primary key
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NontemporalDelta {
    #[serde(default)]
    pub auditing: Auditing,
    pub digest: DigestGenStrategy,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub merge: MergeStrategy,
}

/// Staging is the complete current state, milestoned in processing time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitemporalSnapshot {
    pub transaction_milestoning: TransactionMilestoning,
    pub digest: DigestGenStrategy,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub empty_batch_handling: EmptyBatchHandling,
}

/// Staged changes milestoned in processing time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitemporalDelta {
    pub transaction_milestoning: TransactionMilestoning,
    pub digest: DigestGenStrategy,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub merge: MergeStrategy,
}

/// Staged changes milestoned in processing and business time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitemporalDelta {
    pub transaction_milestoning: TransactionMilestoning,
    pub validity_milestoning: ValidityMilestoning,
    pub digest: DigestGenStrategy,
    #[serde(default)]
    pub deduplication: DeduplicationStrategy,
    #[serde(default)]
    pub versioning: VersioningStrategy,
    #[serde(default)]
    pub merge: MergeStrategy,
}

/// Append rows read directly from staged files
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkLoad {
    #[serde(default)]
    pub auditing: Auditing,
    #[serde(default)]
    pub digest: DigestGenStrategy,
    #[serde(default = "default_batch_id_field")]
    pub batch_id_field: String,
}

impl Default for BulkLoad {
    fn default() -> Self {
        Self {
            auditing: Auditing::default(),
            digest: DigestGenStrategy::default(),
            batch_id_field: default_batch_id_field(),
        }
    }
}

impl UnitemporalDelta {
    pub fn new(transaction_milestoning: TransactionMilestoning, digest: DigestGenStrategy) -> Self {
        Self {
            transaction_milestoning,
            digest,
            deduplication: DeduplicationStrategy::default(),
            versioning: VersioningStrategy::default(),
            merge: MergeStrategy::default(),
        }
    }
}

impl UnitemporalSnapshot {
    pub fn new(transaction_milestoning: TransactionMilestoning, digest: DigestGenStrategy) -> Self {
        Self {
            transaction_milestoning,
            digest,
            deduplication: DeduplicationStrategy::default(),
            versioning: VersioningStrategy::default(),
            empty_batch_handling: EmptyBatchHandling::default(),
        }
    }
}

impl BitemporalDelta {
    pub fn new(
        transaction_milestoning: TransactionMilestoning,
        validity_milestoning: ValidityMilestoning,
        digest: DigestGenStrategy,
    ) -> Self {
        Self {
            transaction_milestoning,
            validity_milestoning,
            digest,
            deduplication: DeduplicationStrategy::default(),
            versioning: VersioningStrategy::default(),
            merge: MergeStrategy::default(),
        }
    }
}

/// Temporal policy of one ingestion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IngestMode {
    AppendOnly(AppendOnly),
    NontemporalSnapshot(NontemporalSnapshot),
    NontemporalDelta(NontemporalDelta),
    UnitemporalSnapshot(UnitemporalSnapshot),
    UnitemporalDelta(UnitemporalDelta),
    BitemporalDelta(BitemporalDelta),
    BulkLoad(BulkLoad),
}

macro_rules! impl_from_mode {
    ($($variant:ident),*) => {
        $(impl From<$variant> for IngestMode {
            fn from(mode: $variant) -> Self {
                IngestMode::$variant(mode)
            }
        })*
    };
}

impl_from_mode!(
    AppendOnly,
    NontemporalSnapshot,
    NontemporalDelta,
    UnitemporalSnapshot,
    UnitemporalDelta,
    BitemporalDelta,
    BulkLoad
);

impl IngestMode {
    pub fn name(&self) -> &'static str {
        match self {
            IngestMode::AppendOnly(_) => "AppendOnly",
            IngestMode::NontemporalSnapshot(_) => "NontemporalSnapshot",
            IngestMode::NontemporalDelta(_) => "NontemporalDelta",
            IngestMode::UnitemporalSnapshot(_) => "UnitemporalSnapshot",
            IngestMode::UnitemporalDelta(_) => "UnitemporalDelta",
            IngestMode::BitemporalDelta(_) => "BitemporalDelta",
            IngestMode::BulkLoad(_) => "BulkLoad",
        }
    }

    pub fn auditing(&self) -> &Auditing {
        static NO_AUDITING: Auditing = Auditing::NoAuditing;
        match self {
            IngestMode::AppendOnly(m) => &m.auditing,
            IngestMode::NontemporalSnapshot(m) => &m.auditing,
            IngestMode::NontemporalDelta(m) => &m.auditing,
            IngestMode::BulkLoad(m) => &m.auditing,
            IngestMode::UnitemporalSnapshot(_)
            | IngestMode::UnitemporalDelta(_)
            | IngestMode::BitemporalDelta(_) => &NO_AUDITING,
        }
    }

    pub fn digest(&self) -> &DigestGenStrategy {
        static NO_DIGEST: DigestGenStrategy = DigestGenStrategy::NoDigestGen;
        match self {
            IngestMode::AppendOnly(m) => &m.digest,
            IngestMode::NontemporalSnapshot(_) => &NO_DIGEST,
            IngestMode::NontemporalDelta(m) => &m.digest,
            IngestMode::UnitemporalSnapshot(m) => &m.digest,
            IngestMode::UnitemporalDelta(m) => &m.digest,
            IngestMode::BitemporalDelta(m) => &m.digest,
            IngestMode::BulkLoad(m) => &m.digest,
        }
    }

    pub fn deduplication(&self) -> DeduplicationStrategy {
        match self {
            IngestMode::AppendOnly(m) => m.deduplication,
            IngestMode::NontemporalSnapshot(m) => m.deduplication,
            IngestMode::NontemporalDelta(m) => m.deduplication,
            IngestMode::UnitemporalSnapshot(m) => m.deduplication,
            IngestMode::UnitemporalDelta(m) => m.deduplication,
            IngestMode::BitemporalDelta(m) => m.deduplication,
            IngestMode::BulkLoad(_) => DeduplicationStrategy::AllowDuplicates,
        }
    }

    pub fn versioning(&self) -> &VersioningStrategy {
        static NO_VERSIONING: VersioningStrategy = VersioningStrategy::NoVersioning;
        match self {
            IngestMode::AppendOnly(m) => &m.versioning,
            IngestMode::NontemporalSnapshot(m) => &m.versioning,
            IngestMode::NontemporalDelta(m) => &m.versioning,
            IngestMode::UnitemporalSnapshot(m) => &m.versioning,
            IngestMode::UnitemporalDelta(m) => &m.versioning,
            IngestMode::BitemporalDelta(m) => &m.versioning,
            IngestMode::BulkLoad(_) => &NO_VERSIONING,
        }
    }

    pub fn merge(&self) -> Option<&MergeStrategy> {
        match self {
            IngestMode::NontemporalDelta(m) => Some(&m.merge),
            IngestMode::UnitemporalDelta(m) => Some(&m.merge),
            IngestMode::BitemporalDelta(m) => Some(&m.merge),
            _ => None,
        }
    }

    pub fn transaction_milestoning(&self) -> Option<&TransactionMilestoning> {
        match self {
            IngestMode::UnitemporalSnapshot(m) => Some(&m.transaction_milestoning),
            IngestMode::UnitemporalDelta(m) => Some(&m.transaction_milestoning),
            IngestMode::BitemporalDelta(m) => Some(&m.transaction_milestoning),
            _ => None,
        }
    }

    pub fn validity_milestoning(&self) -> Option<&ValidityMilestoning> {
        match self {
            IngestMode::BitemporalDelta(m) => Some(&m.validity_milestoning),
            _ => None,
        }
    }

    /// Batch id column of append-style modes
    pub fn batch_id_field(&self) -> Option<&str> {
        match self {
            IngestMode::AppendOnly(m) => Some(&m.batch_id_field),
            IngestMode::BulkLoad(m) => Some(&m.batch_id_field),
            _ => None,
        }
    }

    pub fn empty_batch_handling(&self) -> Option<EmptyBatchHandling> {
        match self {
            IngestMode::NontemporalSnapshot(m) => Some(m.empty_batch_handling),
            IngestMode::UnitemporalSnapshot(m) => Some(m.empty_batch_handling),
            _ => None,
        }
    }

    /// Whether the mode needs a staging row fingerprint to compare content
    fn requires_digest(&self) -> bool {
        match self {
            IngestMode::AppendOnly(m) => m.filter_existing_records,
            IngestMode::NontemporalSnapshot(_) | IngestMode::BulkLoad(_) => false,
            IngestMode::NontemporalDelta(_)
            | IngestMode::UnitemporalSnapshot(_)
            | IngestMode::UnitemporalDelta(_)
            | IngestMode::BitemporalDelta(_) => true,
        }
    }

    fn requires_primary_keys(&self) -> bool {
        matches!(
            self,
            IngestMode::NontemporalDelta(_)
                | IngestMode::UnitemporalSnapshot(_)
                | IngestMode::UnitemporalDelta(_)
                | IngestMode::BitemporalDelta(_)
        )
    }

    /// Main columns whose values the mode writes itself
    pub fn main_owned_fields(&self) -> Vec<Field> {
        let mut fields = Vec::new();
        if let Some(batch_id) = self.batch_id_field() {
            fields.push(Field::new(batch_id, DataType::Int));
        }
        if let Some(tm) = self.transaction_milestoning() {
            fields.extend(tm.fields());
        }
        if let Some(validity) = self.validity_milestoning() {
            fields.extend(validity.fields());
        }
        if let Some(audit) = self.auditing().field() {
            fields.push(Field::new(audit, DataType::DateTime));
        }
        if let DigestGenStrategy::UdfBased { digest_field, .. } = self.digest() {
            fields.push(Field::new(digest_field, DataType::Varchar));
        }
        fields
    }

    /// Staging columns consumed by the mode and never copied to main
    pub fn staging_only_fields(&self) -> Vec<String> {
        let mut fields = Vec::new();
        if let Some(delete_field) = self.merge().and_then(|m| m.field()) {
            fields.push(delete_field.to_string());
        }
        if let Some(validity) = self.validity_milestoning() {
            for source in validity.source_fields() {
                if source != validity.from_field && source != validity.through_field {
                    fields.push(source.to_string());
                }
            }
        }
        fields
    }

    /// Main schema completed with the mode's own columns
    ///
    /// An empty main schema is derived from staging, minus staging-only
    /// columns. Existing columns are kept as declared.
    pub fn enrich_main_schema(
        &self,
        main: &SchemaDefinition,
        staging: &SchemaDefinition,
    ) -> SchemaDefinition {
        let derived = main.is_empty();
        let mut schema = if derived {
            staging.without(&self.staging_only_fields())
        } else {
            main.clone()
        };
        for field in self.main_owned_fields() {
            match schema.field(&field.name) {
                None => schema = schema.with_field(field),
                // staging columns reused as owned keys join the derived key
                Some(existing) if derived && field.primary_key && !existing.primary_key => {
                    schema = schema.with_field(existing.clone().primary_key());
                }
                Some(_) => {}
            }
        }
        // appended rows of one key are told apart by their batch
        if derived
            && !staging.primary_key_names().is_empty()
            && let Some(batch_id) = self.batch_id_field()
            && let Some(field) = schema.field(batch_id)
            && !field.primary_key
        {
            schema = schema.with_field(field.clone().primary_key());
        }
        schema
    }

    /// Reject combinations that cannot be planned
    pub fn validate(&self, datasets: &Datasets) -> IngestResult<()> {
        let staging = &datasets.staging.schema;
        let staging_keys = staging.primary_key_names();

        match (self, datasets.staging.is_staged_files()) {
            (IngestMode::BulkLoad(_), false) => {
                return Err(IngestError::Configuration(
                    "BulkLoad requires a staged files dataset as staging".to_string(),
                ));
            }
            (IngestMode::BulkLoad(m), true) => {
                if matches!(m.digest, DigestGenStrategy::UserProvided { .. }) {
                    return Err(IngestError::Configuration(
                        "BulkLoad supports only UDF-based or no digest generation".to_string(),
                    ));
                }
            }
            (_, true) => {
                return Err(IngestError::Configuration(format!(
                    "{} cannot read staged files directly; use BulkLoad",
                    self.name()
                )));
            }
            _ => {}
        }

        if self.requires_primary_keys() && staging_keys.is_empty() {
            return Err(IngestError::Configuration(format!(
                "{} requires primary keys in the staging dataset",
                self.name()
            )));
        }

        if self.requires_digest() && self.digest().is_none() {
            return Err(IngestError::Configuration(format!(
                "{} requires a digest generation strategy",
                self.name()
            )));
        }

        if let DigestGenStrategy::UserProvided { field } = self.digest()
            && !staging.contains(field)
        {
            return Err(IngestError::Configuration(format!(
                "Digest field '{}' is not present in the staging dataset",
                field
            )));
        }

        if let Some(field) = self.versioning().version_field() {
            if staging_keys.is_empty() {
                return Err(IngestError::Configuration(
                    "Versioning requires primary keys in the staging dataset".to_string(),
                ));
            }
            let version = staging.field(field).ok_or_else(|| {
                IngestError::Configuration(format!(
                    "Versioning field '{}' is not present in the staging dataset",
                    field
                ))
            })?;
            if version.primary_key {
                return Err(IngestError::Configuration(format!(
                    "Versioning field '{}' cannot be a primary key",
                    field
                )));
            }
            if !version.data_type().is_comparable() {
                return Err(IngestError::Configuration(format!(
                    "Versioning field '{}' of type {} is not comparable",
                    field,
                    version.data_type()
                )));
            }
        }

        if self.versioning().data_split_field().is_some() && self.empty_batch_handling().is_some()
        {
            return Err(IngestError::Configuration(format!(
                "{} cannot ingest all versions; a snapshot holds one version per key",
                self.name()
            )));
        }

        if let Some(tm) = self.transaction_milestoning() {
            let in_field = tm.in_field();
            if staging.contains(in_field) {
                return Err(IngestError::Configuration(format!(
                    "Milestoning field '{}' cannot be present in the staging dataset",
                    in_field
                )));
            }
        }

        if let Some(delete_field) = self.merge().and_then(|m| m.field())
            && !staging.contains(delete_field)
        {
            return Err(IngestError::Configuration(format!(
                "Delete indicator field '{}' is not present in the staging dataset",
                delete_field
            )));
        }

        if let Some(validity) = self.validity_milestoning() {
            validity.validate()?;
            for source in validity.source_fields() {
                if !staging.contains(source) {
                    return Err(IngestError::Configuration(format!(
                        "Validity source field '{}' is not present in the staging dataset",
                        source
                    )));
                }
            }
        }

        Ok(())
    }

    /// Rewrite every column name the mode refers to
    pub fn map_names(&self, convert: impl Fn(&str) -> String) -> Self {
        let c = &convert;
        match self {
            IngestMode::AppendOnly(m) => IngestMode::AppendOnly(AppendOnly {
                auditing: m.auditing.map_names(c),
                digest: m.digest.map_names(c),
                deduplication: m.deduplication,
                versioning: m.versioning.map_names(c),
                filter_existing_records: m.filter_existing_records,
                batch_id_field: convert(&m.batch_id_field),
            }),
            IngestMode::NontemporalSnapshot(m) => {
                IngestMode::NontemporalSnapshot(NontemporalSnapshot {
                    auditing: m.auditing.map_names(c),
                    deduplication: m.deduplication,
                    versioning: m.versioning.map_names(c),
                    empty_batch_handling: m.empty_batch_handling,
                })
            }
            IngestMode::NontemporalDelta(m) => IngestMode::NontemporalDelta(NontemporalDelta {
                auditing: m.auditing.map_names(c),
                digest: m.digest.map_names(c),
                deduplication: m.deduplication,
                versioning: m.versioning.map_names(c),
                merge: m.merge.map_names(c),
            }),
            IngestMode::UnitemporalSnapshot(m) => {
                IngestMode::UnitemporalSnapshot(UnitemporalSnapshot {
                    transaction_milestoning: m.transaction_milestoning.map_names(c),
                    digest: m.digest.map_names(c),
                    deduplication: m.deduplication,
                    versioning: m.versioning.map_names(c),
                    empty_batch_handling: m.empty_batch_handling,
                })
            }
            IngestMode::UnitemporalDelta(m) => IngestMode::UnitemporalDelta(UnitemporalDelta {
                transaction_milestoning: m.transaction_milestoning.map_names(c),
                digest: m.digest.map_names(c),
                deduplication: m.deduplication,
                versioning: m.versioning.map_names(c),
                merge: m.merge.map_names(c),
            }),
            IngestMode::BitemporalDelta(m) => IngestMode::BitemporalDelta(BitemporalDelta {
                transaction_milestoning: m.transaction_milestoning.map_names(c),
                validity_milestoning: m.validity_milestoning.map_names(c),
                digest: m.digest.map_names(c),
                deduplication: m.deduplication,
                versioning: m.versioning.map_names(c),
                merge: m.merge.map_names(c),
            }),
            IngestMode::BulkLoad(m) => IngestMode::BulkLoad(BulkLoad {
                auditing: m.auditing.map_names(c),
                digest: m.digest.map_names(c),
                batch_id_field: convert(&m.batch_id_field),
            }),
        }
    }
}
