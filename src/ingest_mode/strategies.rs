//! Independent policy axes of an ingest mode

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{DataType, FilterValue};

/// Column that stamps the ingestion time on every written row
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Auditing {
    #[default]
    NoAuditing,
    DateTime { field: String },
}

impl Auditing {
    pub fn date_time(field: impl Into<String>) -> Self {
        Auditing::DateTime {
            field: field.into(),
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            Auditing::NoAuditing => None,
            Auditing::DateTime { field } => Some(field),
        }
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        match self {
            Auditing::NoAuditing => Auditing::NoAuditing,
            Auditing::DateTime { field } => Auditing::DateTime {
                field: convert(field),
            },
        }
    }
}

/// How the content digest of a row is obtained
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DigestGenStrategy {
    /// No digest; modes that compare content reject this
    #[default]
    NoDigestGen,
    /// Staging carries the digest in `field`
    UserProvided { field: String },
    /// Digest computed by `udf_name` into `digest_field` of main
    UdfBased {
        udf_name: String,
        digest_field: String,
        /// Per-type stringification functions, generic cast otherwise
        #[serde(default)]
        type_conversion_udfs: BTreeMap<DataType, String>,
        #[serde(default)]
        excluded_fields: Vec<String>,
    },
}

impl DigestGenStrategy {
    pub fn user_provided(field: impl Into<String>) -> Self {
        DigestGenStrategy::UserProvided {
            field: field.into(),
        }
    }

    pub fn udf_based(udf_name: impl Into<String>, digest_field: impl Into<String>) -> Self {
        DigestGenStrategy::UdfBased {
            udf_name: udf_name.into(),
            digest_field: digest_field.into(),
            type_conversion_udfs: BTreeMap::new(),
            excluded_fields: Vec::new(),
        }
    }

    /// Add a conversion function for one data type (UDF-based only)
    pub fn with_type_conversion(mut self, data_type: DataType, udf: impl Into<String>) -> Self {
        if let DigestGenStrategy::UdfBased {
            type_conversion_udfs,
            ..
        } = &mut self
        {
            type_conversion_udfs.insert(data_type, udf.into());
        }
        self
    }

    /// Exclude a staging field from the digest (UDF-based only)
    pub fn with_excluded_field(mut self, field: impl Into<String>) -> Self {
        if let DigestGenStrategy::UdfBased {
            excluded_fields, ..
        } = &mut self
        {
            excluded_fields.push(field.into());
        }
        self
    }

    /// Digest column of the main table
    pub fn digest_field(&self) -> Option<&str> {
        match self {
            DigestGenStrategy::NoDigestGen => None,
            DigestGenStrategy::UserProvided { field } => Some(field),
            DigestGenStrategy::UdfBased { digest_field, .. } => Some(digest_field),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, DigestGenStrategy::NoDigestGen)
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        match self {
            DigestGenStrategy::NoDigestGen => DigestGenStrategy::NoDigestGen,
            DigestGenStrategy::UserProvided { field } => DigestGenStrategy::UserProvided {
                field: convert(field),
            },
            DigestGenStrategy::UdfBased {
                udf_name,
                digest_field,
                type_conversion_udfs,
                excluded_fields,
            } => DigestGenStrategy::UdfBased {
                udf_name: udf_name.clone(),
                digest_field: convert(digest_field),
                type_conversion_udfs: type_conversion_udfs.clone(),
                excluded_fields: excluded_fields.iter().map(|f| convert(f)).collect(),
            },
        }
    }
}

/// Treatment of identical staged rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeduplicationStrategy {
    #[default]
    AllowDuplicates,
    FilterDuplicates,
    FailOnDuplicates,
}

/// Rule applied when a staged version meets the active main version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VersionResolver {
    /// Version ties must agree on the digest
    #[default]
    DigestBased,
    /// Replace the active row only with a strictly greater version
    GreaterThanActiveVersion,
    /// Replace the active row with a greater or equal version
    GreaterThanEqualToActiveVersion,
}

/// Selection of versions per primary key
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VersioningStrategy {
    #[default]
    NoVersioning,
    /// Keep the maximal version per key
    MaxVersion {
        field: String,
        #[serde(default)]
        resolver: VersionResolver,
    },
    /// Keep every version, one data split per version rank
    AllVersions {
        field: String,
        #[serde(default = "default_data_split_field")]
        data_split_field: String,
        #[serde(default)]
        resolver: VersionResolver,
    },
}

/// Default name of the generated data split column
pub const DEFAULT_DATA_SPLIT_FIELD: &str = "data_split";

fn default_data_split_field() -> String {
    DEFAULT_DATA_SPLIT_FIELD.to_string()
}

impl VersioningStrategy {
    pub fn max_version(field: impl Into<String>) -> Self {
        VersioningStrategy::MaxVersion {
            field: field.into(),
            resolver: VersionResolver::default(),
        }
    }

    pub fn all_versions(field: impl Into<String>) -> Self {
        VersioningStrategy::AllVersions {
            field: field.into(),
            data_split_field: default_data_split_field(),
            resolver: VersionResolver::default(),
        }
    }

    pub fn with_resolver(mut self, new_resolver: VersionResolver) -> Self {
        match &mut self {
            VersioningStrategy::NoVersioning => {}
            VersioningStrategy::MaxVersion { resolver, .. }
            | VersioningStrategy::AllVersions { resolver, .. } => *resolver = new_resolver,
        }
        self
    }

    pub fn version_field(&self) -> Option<&str> {
        match self {
            VersioningStrategy::NoVersioning => None,
            VersioningStrategy::MaxVersion { field, .. }
            | VersioningStrategy::AllVersions { field, .. } => Some(field),
        }
    }

    pub fn resolver(&self) -> Option<VersionResolver> {
        match self {
            VersioningStrategy::NoVersioning => None,
            VersioningStrategy::MaxVersion { resolver, .. }
            | VersioningStrategy::AllVersions { resolver, .. } => Some(*resolver),
        }
    }

    pub fn data_split_field(&self) -> Option<&str> {
        match self {
            VersioningStrategy::AllVersions {
                data_split_field, ..
            } => Some(data_split_field),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, VersioningStrategy::NoVersioning)
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        match self {
            VersioningStrategy::NoVersioning => VersioningStrategy::NoVersioning,
            VersioningStrategy::MaxVersion { field, resolver } => VersioningStrategy::MaxVersion {
                field: convert(field),
                resolver: *resolver,
            },
            VersioningStrategy::AllVersions {
                field,
                data_split_field,
                resolver,
            } => VersioningStrategy::AllVersions {
                field: convert(field),
                data_split_field: convert(data_split_field),
                resolver: *resolver,
            },
        }
    }
}

/// How deletions arrive in a delta batch
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MergeStrategy {
    #[default]
    NoDeletes,
    /// Rows whose `field` holds one of `values` delete their key
    DeleteIndicator {
        field: String,
        values: Vec<FilterValue>,
    },
}

impl MergeStrategy {
    pub fn delete_indicator(field: impl Into<String>, values: Vec<FilterValue>) -> Self {
        MergeStrategy::DeleteIndicator {
            field: field.into(),
            values,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            MergeStrategy::NoDeletes => None,
            MergeStrategy::DeleteIndicator { field, .. } => Some(field),
        }
    }

    pub fn map_names(&self, convert: &impl Fn(&str) -> String) -> Self {
        match self {
            MergeStrategy::NoDeletes => MergeStrategy::NoDeletes,
            MergeStrategy::DeleteIndicator { field, values } => MergeStrategy::DeleteIndicator {
                field: convert(field),
                values: values.clone(),
            },
        }
    }
}

/// What a snapshot mode does with an empty staging batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmptyBatchHandling {
    /// Treat the empty batch as an empty snapshot
    #[default]
    DeleteTargetData,
    /// Leave the target untouched
    NoOp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_builders() {
        let digest = DigestGenStrategy::udf_based("md5", "digest")
            .with_type_conversion(DataType::Date, "date_to_text")
            .with_excluded_field("load_ts");
        assert_eq!(digest.digest_field(), Some("digest"));
        match digest {
            DigestGenStrategy::UdfBased {
                type_conversion_udfs,
                excluded_fields,
                ..
            } => {
                assert_eq!(type_conversion_udfs[&DataType::Date], "date_to_text");
                assert_eq!(excluded_fields, vec!["load_ts"]);
            }
            other => panic!("unexpected {:?}", other),
        }

        // builders are no-ops on other variants
        let digest = DigestGenStrategy::user_provided("d").with_excluded_field("x");
        assert_eq!(digest, DigestGenStrategy::user_provided("d"));
    }

    #[test]
    fn test_versioning_accessors() {
        let v = VersioningStrategy::all_versions("version")
            .with_resolver(VersionResolver::GreaterThanActiveVersion);
        assert_eq!(v.version_field(), Some("version"));
        assert_eq!(v.data_split_field(), Some("data_split"));
        assert_eq!(v.resolver(), Some(VersionResolver::GreaterThanActiveVersion));
        assert!(VersioningStrategy::max_version("v").data_split_field().is_none());
    }

    #[test]
    fn test_strategy_serde() {
        let json = r#"{"type":"max_version","field":"version"}"#;
        let v: VersioningStrategy = serde_json::from_str(json).unwrap();
        assert_eq!(v, VersioningStrategy::max_version("version"));

        let d: DeduplicationStrategy = serde_json::from_str("\"FAIL_ON_DUPLICATES\"").unwrap();
        assert_eq!(d, DeduplicationStrategy::FailOnDuplicates);
    }
}
