//! Statement execution boundary
//!
//! The ingestor talks to a database only through [`RelationalExecutor`]:
//! raw SQL in, rows out as JSON values, plus transaction control and the
//! catalog lookups needed by the metadata check and schema evolution.

use serde::{Deserialize, Serialize};

use crate::models::{DatasetReference, SchemaDefinition};

#[cfg(feature = "duckdb-backend")]
pub mod duckdb;
pub mod recording;

#[cfg(feature = "duckdb-backend")]
pub use self::duckdb::DuckDbExecutor;
pub use recording::RecordingExecutor;

/// Error type for statement execution
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExecutorError {
    /// Failed to connect to, or lock, the database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Statement execution failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Begin, commit or rollback failed
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// Concurrent write on the same rows; the transaction must be retried
    #[error("Write conflict: {0}")]
    Conflict(String),
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Query result row as a JSON value
pub type QueryRow = serde_json::Value;

/// Query result set
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names
    pub columns: Vec<String>,
    /// Rows of data
    pub rows: Vec<QueryRow>,
    /// Number of rows affected (for INSERT/UPDATE/DELETE)
    pub rows_affected: Option<u64>,
    /// Execution time in milliseconds
    pub execution_time_ms: u64,
}

impl QueryResult {
    /// Create a new query result
    pub fn new(columns: Vec<String>, rows: Vec<QueryRow>) -> Self {
        Self {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: 0,
        }
    }

    /// Create an empty result
    pub fn empty() -> Self {
        Self::default()
    }

    /// Single-row result, handy for canned statistics
    pub fn single(column: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        let column = column.into();
        let mut row = serde_json::Map::new();
        row.insert(column.clone(), value.into());
        Self::new(vec![column], vec![serde_json::Value::Object(row)])
    }

    /// Get the number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Check if the result is empty
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of `column` in the first row
    pub fn first_value(&self, column: &str) -> Option<&serde_json::Value> {
        self.rows.first().and_then(|row| value_of(row, column))
    }

    /// Integer value of `column` in the first row
    ///
    /// Engines report wide sums as strings or decimals, so numeric strings
    /// are accepted too. `NULL` reads as `None`.
    pub fn first_i64(&self, column: &str) -> Option<i64> {
        self.first_value(column).and_then(json_to_i64)
    }
}

/// Look a column up in a row, ignoring identifier case
pub fn value_of<'a>(row: &'a QueryRow, column: &str) -> Option<&'a serde_json::Value> {
    let map = row.as_object()?;
    map.get(column).or_else(|| {
        map.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(column))
            .map(|(_, v)| v)
    })
}

/// Integer from a JSON number or numeric string
pub fn json_to_i64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
            .or_else(|| n.as_f64().map(|f| f as i64)),
        serde_json::Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f as i64))
        }
        _ => None,
    }
}

/// Raw SQL executor used by the ingestor
///
/// Implementations serialise access to their connection so a single
/// executor can be shared between threads.
pub trait RelationalExecutor: Send + Sync {
    /// Open a transaction
    fn begin(&self) -> ExecutorResult<()>;

    /// Commit the open transaction
    fn commit(&self) -> ExecutorResult<()>;

    /// Roll the open transaction back
    fn rollback(&self) -> ExecutorResult<()>;

    /// Execute a statement that returns no rows
    ///
    /// # Returns
    /// Number of rows affected
    fn execute(&self, sql: &str) -> ExecutorResult<u64>;

    /// Execute statements in order, stopping at the first failure
    fn execute_all(&self, statements: &[String]) -> ExecutorResult<()> {
        for sql in statements {
            self.execute(sql)?;
        }
        Ok(())
    }

    /// Execute a query and return its rows
    fn query(&self, sql: &str) -> ExecutorResult<QueryResult>;

    /// Whether the table exists
    fn table_exists(&self, table: &DatasetReference) -> ExecutorResult<bool>;

    /// Live schema of the table, `None` when it does not exist
    fn fetch_schema(&self, table: &DatasetReference) -> ExecutorResult<Option<SchemaDefinition>>;

    /// Short backend name used in logs
    fn backend_type(&self) -> &'static str;
}

/// Open transaction that rolls back on drop unless committed
pub struct TransactionGuard<'a> {
    executor: &'a dyn RelationalExecutor,
    finished: bool,
}

impl<'a> TransactionGuard<'a> {
    /// Begin a transaction on `executor`
    pub fn begin(executor: &'a dyn RelationalExecutor) -> ExecutorResult<Self> {
        executor.begin()?;
        Ok(Self {
            executor,
            finished: false,
        })
    }

    pub fn commit(mut self) -> ExecutorResult<()> {
        self.finished = true;
        self.executor.commit()
    }

    pub fn rollback(mut self) -> ExecutorResult<()> {
        self.finished = true;
        self.executor.rollback()
    }
}

impl Drop for TransactionGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::warn!(
                "Rolling back unfinished {} transaction",
                self.executor.backend_type()
            );
            if let Err(e) = self.executor.rollback() {
                tracing::warn!("Rollback failed: {}", e);
            }
        }
    }
}

/// Map an engine error message to a conflict or a plain failure
#[cfg(feature = "duckdb-backend")]
pub(crate) fn classify_failure(context: &str, message: String) -> ExecutorError {
    if message.to_lowercase().contains("conflict") {
        ExecutorError::Conflict(format!("{}: {}", context, message))
    } else {
        ExecutorError::QueryFailed(format!("{}: {}", context, message))
    }
}
