//! Error taxonomy for ingestion
//!
//! Configuration errors are raised while datasets and ingest modes are
//! constructed, before any SQL runs. Data, schema and resource errors are
//! raised while planning or executing and always abort the enclosing
//! transaction.

use serde::{Deserialize, Serialize};

use crate::executor::ExecutorError;

/// Category of a data error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataErrorKind {
    /// Duplicate rows under `FailOnDuplicates`
    Duplicates,
    /// Same key (and version) carrying more than one distinct digest
    ConflictingDigests,
    /// Overlapping business-time intervals for one key
    IntervalCorruption,
}

impl std::fmt::Display for DataErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataErrorKind::Duplicates => write!(f, "duplicates"),
            DataErrorKind::ConflictingDigests => write!(f, "conflicting digests"),
            DataErrorKind::IntervalCorruption => write!(f, "interval corruption"),
        }
    }
}

/// Error type for ingestion operations
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Invalid dataset, ingest mode or option combination
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Staged data violates the ingest mode's guarantees
    #[error("Data error ({0}): {1}")]
    DataError(DataErrorKind, String),

    /// Schema change not permitted by the capability set
    #[error("Incompatible schema change: {0}")]
    SchemaIncompatible(String),

    /// Required table or resource is missing
    #[error("Resource error: {0}")]
    Resource(String),

    /// The per-table lock could not be acquired in time
    #[error("Lock acquisition timed out after {waited_ms}ms for table {table}")]
    LockTimeout { table: String, waited_ms: u64 },

    /// Failure reported by the statement executor
    #[error(transparent)]
    Executor(#[from] ExecutorError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration file could not be parsed
    #[error("Config file error: {0}")]
    ConfigFile(String),
}

impl IngestError {
    /// Create a data error
    pub fn data(kind: DataErrorKind, message: impl Into<String>) -> Self {
        IngestError::DataError(kind, message.into())
    }

    /// Whether the error came from the staged data rather than the setup
    pub fn is_data_error(&self) -> bool {
        matches!(self, IngestError::DataError(_, _))
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(e: serde_json::Error) -> Self {
        IngestError::Serialization(e.to_string())
    }
}

/// Result type for ingestion operations
pub type IngestResult<T> = Result<T, IngestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = IngestError::data(DataErrorKind::Duplicates, "max count 3");
        assert_eq!(err.to_string(), "Data error (duplicates): max count 3");
        assert!(err.is_data_error());

        let err = IngestError::LockTimeout {
            table: "main".to_string(),
            waited_ms: 250,
        };
        assert!(err.to_string().contains("250ms"));
        assert!(!err.is_data_error());
    }

    #[test]
    fn test_executor_error_converts() {
        let err: IngestError = ExecutorError::QueryFailed("boom".to_string()).into();
        assert!(matches!(err, IngestError::Executor(_)));
        assert!(err.to_string().contains("boom"));
    }
}
