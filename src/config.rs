//! Ingestion configuration file support
//!
//! Handles parsing of `.temporal-ingest.toml` configuration files and
//! environment variable overrides.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{IngestError, IngestResult};
use crate::ingestor::{
    DEFAULT_LOCK_RETRY_INTERVAL, DEFAULT_LOCK_TIMEOUT, DEFAULT_STALE_LOCK_THRESHOLD,
    IngestorOptions,
};
use crate::models::{DEFAULT_METADATA_TABLE, DatasetReference, MetadataDataset};
use crate::schema_evolution::SchemaEvolutionCapability;
use crate::sink::{AnsiSqlSink, CaseConversion, DuckDbSink, PostgresSink, RelationalSink};

/// Default database filename for DuckDB
pub const DEFAULT_DUCKDB_FILENAME: &str = ".temporal-ingest.duckdb";

/// Default configuration filename
pub const CONFIG_FILENAME: &str = ".temporal-ingest.toml";

/// Environment variable for the SQL dialect
pub const ENV_DIALECT: &str = "TEMPORAL_INGEST_DIALECT";

/// Environment variable for DuckDB path
pub const ENV_DUCKDB_PATH: &str = "TEMPORAL_INGEST_DUCKDB_PATH";

/// Environment variable for the identifier case conversion
pub const ENV_CASE_CONVERSION: &str = "TEMPORAL_INGEST_CASE_CONVERSION";

/// Environment variable enabling the per-table lock
pub const ENV_LOCK_ENABLED: &str = "TEMPORAL_INGEST_LOCK_ENABLED";

/// Environment variable for the lock timeout in milliseconds
pub const ENV_LOCK_TIMEOUT_MS: &str = "TEMPORAL_INGEST_LOCK_TIMEOUT_MS";

/// Environment variable enabling schema evolution
pub const ENV_SCHEMA_EVOLUTION: &str = "TEMPORAL_INGEST_SCHEMA_EVOLUTION";

/// Environment variable for the comma-separated evolution capabilities
pub const ENV_SCHEMA_EVOLUTION_CAPABILITIES: &str = "TEMPORAL_INGEST_SCHEMA_EVOLUTION_CAPABILITIES";

/// Environment variable for the ledger table name
pub const ENV_METADATA_TABLE: &str = "TEMPORAL_INGEST_METADATA_TABLE";

/// SQL dialect of the target database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkDialect {
    Ansi,
    /// DuckDB embedded database (default)
    #[default]
    DuckDB,
    Postgres,
}

impl SinkDialect {
    pub fn sink(&self) -> &'static dyn RelationalSink {
        match self {
            SinkDialect::Ansi => &AnsiSqlSink,
            SinkDialect::DuckDB => &DuckDbSink,
            SinkDialect::Postgres => &PostgresSink,
        }
    }
}

impl std::str::FromStr for SinkDialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ansi" => Ok(SinkDialect::Ansi),
            "duckdb" => Ok(SinkDialect::DuckDB),
            "postgres" | "postgresql" => Ok(SinkDialect::Postgres),
            _ => Err(format!(
                "Unknown dialect: {}. Use 'ansi', 'duckdb' or 'postgres'.",
                s
            )),
        }
    }
}

impl std::fmt::Display for SinkDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SinkDialect::Ansi => write!(f, "ansi"),
            SinkDialect::DuckDB => write!(f, "duckdb"),
            SinkDialect::Postgres => write!(f, "postgres"),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_batch_success_status() -> String {
    "DONE".to_string()
}

/// Ingestion behaviour section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestSection {
    #[serde(default)]
    pub dialect: SinkDialect,

    #[serde(default = "default_true")]
    pub cleanup_staging_data: bool,

    #[serde(default = "default_true")]
    pub collect_statistics: bool,

    #[serde(default = "default_true")]
    pub create_datasets: bool,

    #[serde(default)]
    pub create_staging_dataset: bool,

    #[serde(default)]
    pub case_conversion: CaseConversion,

    #[serde(default = "default_batch_success_status")]
    pub batch_success_status: String,
}

impl Default for IngestSection {
    fn default() -> Self {
        Self {
            dialect: SinkDialect::default(),
            cleanup_staging_data: true,
            collect_statistics: true,
            create_datasets: true,
            create_staging_dataset: false,
            case_conversion: CaseConversion::default(),
            batch_success_status: default_batch_success_status(),
        }
    }
}

/// Schema evolution section
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchemaEvolutionSection {
    #[serde(default)]
    pub enabled: bool,

    /// Permitted change categories, e.g. `["ADD_COLUMN"]`
    #[serde(default)]
    pub capabilities: BTreeSet<SchemaEvolutionCapability>,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_millis() as u64
}

fn default_lock_retry_interval_ms() -> u64 {
    DEFAULT_LOCK_RETRY_INTERVAL.as_millis() as u64
}

fn default_stale_threshold_secs() -> u64 {
    DEFAULT_STALE_LOCK_THRESHOLD.as_secs()
}

/// Concurrency section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockSection {
    /// Serialise writers through the lock table
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_lock_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_lock_retry_interval_ms")]
    pub retry_interval_ms: u64,

    /// Idle time after which a lock row is reported as stale
    #[serde(default = "default_stale_threshold_secs")]
    pub stale_threshold_secs: u64,
}

impl Default for LockSection {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_ms: default_lock_timeout_ms(),
            retry_interval_ms: default_lock_retry_interval_ms(),
            stale_threshold_secs: default_stale_threshold_secs(),
        }
    }
}

fn default_metadata_table() -> String {
    DEFAULT_METADATA_TABLE.to_string()
}

/// Ledger location section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataSection {
    #[serde(default = "default_metadata_table")]
    pub table: String,

    #[serde(default)]
    pub database: Option<String>,

    #[serde(default)]
    pub group: Option<String>,
}

impl Default for MetadataSection {
    fn default() -> Self {
        Self {
            table: default_metadata_table(),
            database: None,
            group: None,
        }
    }
}

fn default_duckdb_path() -> String {
    DEFAULT_DUCKDB_FILENAME.to_string()
}

/// DuckDB section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuckDbSection {
    /// Path to DuckDB database file (relative to workspace)
    #[serde(default = "default_duckdb_path")]
    pub path: String,
}

impl Default for DuckDbSection {
    fn default() -> Self {
        Self {
            path: default_duckdb_path(),
        }
    }
}

/// Main configuration structure
///
/// Represents the `.temporal-ingest.toml` configuration file format.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestConfig {
    #[serde(default)]
    pub ingest: IngestSection,

    #[serde(default)]
    pub schema_evolution: SchemaEvolutionSection,

    #[serde(default)]
    pub lock: LockSection,

    #[serde(default)]
    pub metadata: MetadataSection,

    #[serde(default)]
    pub duckdb: DuckDbSection,
}

impl IngestConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a workspace directory
    ///
    /// Looks for `.temporal-ingest.toml` in the workspace directory.
    /// Falls back to defaults if not found.
    pub fn load(workspace_path: &Path) -> IngestResult<Self> {
        let config_path = workspace_path.join(CONFIG_FILENAME);

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)
                .map_err(|e| IngestError::Io(format!("Failed to read config: {}", e)))?;

            Self::parse(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse configuration from TOML string
    pub fn parse(content: &str) -> IngestResult<Self> {
        toml::from_str(content)
            .map_err(|e| IngestError::ConfigFile(format!("Failed to parse config: {}", e)))
    }

    /// Save configuration to a workspace directory
    pub fn save(&self, workspace_path: &Path) -> IngestResult<()> {
        let config_path = workspace_path.join(CONFIG_FILENAME);
        let content = self.to_toml()?;

        std::fs::write(&config_path, content)
            .map_err(|e| IngestError::Io(format!("Failed to write config: {}", e)))?;

        Ok(())
    }

    /// Convert configuration to TOML string
    pub fn to_toml(&self) -> IngestResult<String> {
        toml::to_string_pretty(self).map_err(|e| {
            IngestError::Serialization(format!("Failed to serialize config: {}", e))
        })
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    ///
    /// Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dialect) = lookup(ENV_DIALECT)
            && let Ok(dialect) = dialect.parse()
        {
            self.ingest.dialect = dialect;
        }

        if let Some(path) = lookup(ENV_DUCKDB_PATH) {
            self.duckdb.path = path;
        }

        if let Some(case) = lookup(ENV_CASE_CONVERSION)
            && let Ok(case) = case.parse()
        {
            self.ingest.case_conversion = case;
        }

        if let Some(enabled) = lookup(ENV_LOCK_ENABLED)
            && let Ok(enabled) = enabled.parse()
        {
            self.lock.enabled = enabled;
        }

        if let Some(timeout) = lookup(ENV_LOCK_TIMEOUT_MS)
            && let Ok(timeout) = timeout.parse()
        {
            self.lock.timeout_ms = timeout;
        }

        if let Some(enabled) = lookup(ENV_SCHEMA_EVOLUTION)
            && let Ok(enabled) = enabled.parse()
        {
            self.schema_evolution.enabled = enabled;
        }

        if let Some(capabilities) = lookup(ENV_SCHEMA_EVOLUTION_CAPABILITIES) {
            let parsed: Result<BTreeSet<SchemaEvolutionCapability>, _> = capabilities
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(parsed) => self.schema_evolution.capabilities = parsed,
                Err(e) => tracing::warn!("Ignoring {}: {}", ENV_SCHEMA_EVOLUTION_CAPABILITIES, e),
            }
        }

        if let Some(table) = lookup(ENV_METADATA_TABLE) {
            self.metadata.table = table;
        }
    }

    /// Get the DuckDB database path for a workspace
    pub fn get_duckdb_path(&self, workspace_path: &Path) -> PathBuf {
        if self.duckdb.path.is_empty() {
            workspace_path.join(DEFAULT_DUCKDB_FILENAME)
        } else if Path::new(&self.duckdb.path).is_absolute() {
            PathBuf::from(&self.duckdb.path)
        } else {
            workspace_path.join(&self.duckdb.path)
        }
    }

    /// Sink of the configured dialect
    pub fn sink(&self) -> &'static dyn RelationalSink {
        self.ingest.dialect.sink()
    }

    /// Ingestor options described by this configuration
    pub fn ingestor_options(&self) -> IngestorOptions {
        IngestorOptions {
            cleanup_staging_data: self.ingest.cleanup_staging_data,
            collect_statistics: self.ingest.collect_statistics,
            enable_schema_evolution: self.schema_evolution.enabled,
            schema_evolution_capabilities: self.schema_evolution.capabilities.clone(),
            create_datasets: self.ingest.create_datasets,
            create_staging_dataset: self.ingest.create_staging_dataset,
            enable_concurrent_safety: self.lock.enabled,
            case_conversion: self.ingest.case_conversion,
            batch_success_status: self.ingest.batch_success_status.clone(),
            lock_timeout: Duration::from_millis(self.lock.timeout_ms),
            lock_retry_interval: Duration::from_millis(self.lock.retry_interval_ms),
            stale_lock_threshold: Duration::from_secs(self.lock.stale_threshold_secs),
            ..Default::default()
        }
    }

    /// Ledger described by the `[metadata]` section
    pub fn metadata_dataset(&self) -> MetadataDataset {
        let mut reference = DatasetReference::new(&self.metadata.table);
        reference.database = self.metadata.database.clone();
        reference.group = self.metadata.group.clone();
        MetadataDataset {
            reference,
            ..Default::default()
        }
    }

    /// Open the configured DuckDB database
    #[cfg(feature = "duckdb-backend")]
    pub fn open_duckdb(
        &self,
        workspace_path: &Path,
    ) -> IngestResult<crate::executor::DuckDbExecutor> {
        Ok(crate::executor::DuckDbExecutor::new(
            self.get_duckdb_path(workspace_path),
        )?)
    }

    /// Check if configuration exists in a workspace
    pub fn exists(workspace_path: &Path) -> bool {
        workspace_path.join(CONFIG_FILENAME).exists()
    }
}

/// Generate a sample configuration file content
pub fn sample_config() -> &'static str {
    r#"# Temporal ingest configuration

[ingest]
# SQL dialect: "duckdb" (default), "ansi" or "postgres"
dialect = "duckdb"
cleanup_staging_data = true
collect_statistics = true
# Create main, staging and ledger tables when missing
create_datasets = true
create_staging_dataset = false
# Identifier case: "NONE", "TO_UPPER" or "TO_LOWER"
case_conversion = "NONE"
batch_success_status = "DONE"

[schema_evolution]
enabled = false
# ADD_COLUMN, DATA_TYPE_CONVERSION, DATA_TYPE_SIZE_CHANGE, COLUMN_NULLABILITY_CHANGE
capabilities = ["ADD_COLUMN"]

[lock]
# Serialise concurrent writers of the same table
enabled = false
timeout_ms = 60000
retry_interval_ms = 100
stale_threshold_secs = 21600

[metadata]
table = "batch_metadata"

[duckdb]
# Path to DuckDB database file (relative to workspace, or absolute)
path = ".temporal-ingest.duckdb"
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = IngestConfig::new();
        assert_eq!(config.ingest.dialect, SinkDialect::DuckDB);
        assert_eq!(config.duckdb.path, DEFAULT_DUCKDB_FILENAME);
        assert!(config.ingest.create_datasets);
        assert!(!config.lock.enabled);
        assert_eq!(config.ingestor_options(), IngestorOptions::default());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[ingest]
dialect = "postgres"
case_conversion = "TO_UPPER"
create_datasets = false

[schema_evolution]
enabled = true
capabilities = ["ADD_COLUMN", "DATA_TYPE_SIZE_CHANGE"]

[lock]
enabled = true
timeout_ms = 500

[metadata]
table = "ledger"
database = "audit"
"#;
        let config = IngestConfig::parse(toml).unwrap();
        assert_eq!(config.sink().name(), "postgres");

        let options = config.ingestor_options();
        assert_eq!(options.case_conversion, CaseConversion::ToUpper);
        assert!(!options.create_datasets);
        assert!(options.enable_schema_evolution);
        assert!(
            options
                .schema_evolution_capabilities
                .contains(&SchemaEvolutionCapability::DataTypeSizeChange)
        );
        assert!(options.enable_concurrent_safety);
        assert_eq!(options.lock_timeout, Duration::from_millis(500));
        assert_eq!(options.lock_retry_interval, DEFAULT_LOCK_RETRY_INTERVAL);

        let metadata = config.metadata_dataset();
        assert_eq!(metadata.reference.name, "ledger");
        assert_eq!(metadata.reference.database.as_deref(), Some("audit"));
        assert_eq!(metadata.batch_statistics_field, "batch_statistics");
    }

    #[test]
    fn test_parse_error() {
        let err = IngestConfig::parse("[ingest]\ndialect = \"oracle\"").unwrap_err();
        assert!(matches!(err, IngestError::ConfigFile(_)));
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            (ENV_DIALECT, "ansi"),
            (ENV_LOCK_ENABLED, "true"),
            (ENV_LOCK_TIMEOUT_MS, "not-a-number"),
            (ENV_SCHEMA_EVOLUTION_CAPABILITIES, "add_column, column_nullability_change"),
            (ENV_METADATA_TABLE, "ledger"),
        ]);
        let mut config = IngestConfig::new();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(config.ingest.dialect, SinkDialect::Ansi);
        assert!(config.lock.enabled);
        assert_eq!(config.lock.timeout_ms, default_lock_timeout_ms());
        assert_eq!(config.schema_evolution.capabilities.len(), 2);
        assert_eq!(config.metadata.table, "ledger");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = IngestConfig::new();
        config.duckdb.path = "my-db.duckdb".to_string();
        config.schema_evolution.capabilities =
            BTreeSet::from([SchemaEvolutionCapability::AddColumn]);

        config.save(dir.path()).unwrap();
        assert!(IngestConfig::exists(dir.path()));

        let loaded = IngestConfig::parse(
            &std::fs::read_to_string(dir.path().join(CONFIG_FILENAME)).unwrap(),
        )
        .unwrap();
        assert_eq!(loaded.duckdb.path, "my-db.duckdb");
        assert_eq!(
            loaded.get_duckdb_path(dir.path()),
            dir.path().join("my-db.duckdb")
        );
        assert_eq!(
            loaded.schema_evolution.capabilities,
            config.schema_evolution.capabilities
        );
    }

    #[test]
    fn test_dialect_from_str() {
        assert_eq!("DuckDB".parse::<SinkDialect>().unwrap(), SinkDialect::DuckDB);
        assert_eq!(
            "postgresql".parse::<SinkDialect>().unwrap(),
            SinkDialect::Postgres
        );
        assert!("oracle".parse::<SinkDialect>().is_err());
    }

    #[test]
    fn test_sample_config_is_valid() {
        let config = IngestConfig::parse(sample_config()).unwrap();
        assert_eq!(
            config.schema_evolution.capabilities,
            BTreeSet::from([SchemaEvolutionCapability::AddColumn])
        );
    }
}
