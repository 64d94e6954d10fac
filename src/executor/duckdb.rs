//! DuckDB executor
//!
//! Runs generated SQL on an embedded DuckDB database, file-based or in
//! memory. The connection sits behind a `Mutex` so the executor can be
//! shared; DuckDB reports concurrent writes to the same rows as a
//! transaction conflict, which surfaces as [`ExecutorError::Conflict`].

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{
    ExecutorError, ExecutorResult, QueryResult, RelationalExecutor, classify_failure, value_of,
};
use crate::models::{DataType, DatasetReference, Field, SchemaDefinition};

/// DuckDB statement executor
pub struct DuckDbExecutor {
    /// Path to the database file (None for in-memory)
    db_path: Option<PathBuf>,
    /// DuckDB connection (wrapped in Mutex for thread safety)
    connection: Mutex<duckdb::Connection>,
}

impl DuckDbExecutor {
    /// Open (or create) a file-based database
    pub fn new(db_path: impl AsRef<Path>) -> ExecutorResult<Self> {
        let path = db_path.as_ref().to_path_buf();
        let connection = duckdb::Connection::open(&path).map_err(|e| {
            ExecutorError::ConnectionFailed(format!("Failed to open DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: Some(path),
            connection: Mutex::new(connection),
        })
    }

    /// Create an in-memory database
    pub fn in_memory() -> ExecutorResult<Self> {
        let connection = duckdb::Connection::open_in_memory().map_err(|e| {
            ExecutorError::ConnectionFailed(format!("Failed to create in-memory DuckDB: {}", e))
        })?;

        Ok(Self {
            db_path: None,
            connection: Mutex::new(connection),
        })
    }

    /// Open a second connection to the same database
    ///
    /// Used to simulate concurrent writers against one file or in-memory
    /// instance.
    pub fn try_clone(&self) -> ExecutorResult<Self> {
        let conn = self.lock()?;
        let connection = conn.try_clone().map_err(|e| {
            ExecutorError::ConnectionFailed(format!("Failed to clone connection: {}", e))
        })?;
        Ok(Self {
            db_path: self.db_path.clone(),
            connection: Mutex::new(connection),
        })
    }

    /// Get the database file path (None for in-memory)
    pub fn db_path(&self) -> Option<&Path> {
        self.db_path.as_deref()
    }

    /// Check if this is an in-memory database
    pub fn is_in_memory(&self) -> bool {
        self.db_path.is_none()
    }

    fn lock(&self) -> ExecutorResult<std::sync::MutexGuard<'_, duckdb::Connection>> {
        self.connection
            .lock()
            .map_err(|e| ExecutorError::ConnectionFailed(format!("Lock error: {}", e)))
    }

    fn transaction_statement(&self, sql: &str) -> ExecutorResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(sql).map_err(|e| {
            let message = e.to_string();
            if message.to_lowercase().contains("conflict") {
                ExecutorError::Conflict(format!("{} failed: {}", sql, message))
            } else {
                ExecutorError::TransactionFailed(format!("{} failed: {}", sql, message))
            }
        })
    }

    /// Convert a DuckDB row to a JSON value
    fn row_to_json(row: &duckdb::Row, columns: &[String]) -> serde_json::Value {
        let mut map = serde_json::Map::new();

        for (i, col_name) in columns.iter().enumerate() {
            let value: serde_json::Value = match row.get_ref(i) {
                Ok(value_ref) => Self::value_ref_to_json(value_ref),
                Err(_) => serde_json::Value::Null,
            };
            map.insert(col_name.clone(), value);
        }

        serde_json::Value::Object(map)
    }

    /// Convert a DuckDB ValueRef to a JSON value
    fn value_ref_to_json(value: duckdb::types::ValueRef) -> serde_json::Value {
        use duckdb::types::{TimeUnit, ValueRef};

        match value {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Boolean(b) => serde_json::Value::Bool(b),
            ValueRef::TinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::SmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Int(i) => serde_json::Value::Number(i.into()),
            ValueRef::BigInt(i) => serde_json::Value::Number(i.into()),
            // sums come back as HUGEINT
            ValueRef::HugeInt(i) => match i64::try_from(i) {
                Ok(n) => serde_json::Value::Number(n.into()),
                Err(_) => serde_json::Value::String(i.to_string()),
            },
            ValueRef::UTinyInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::USmallInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::UBigInt(i) => serde_json::Value::Number(i.into()),
            ValueRef::Float(f) => serde_json::Number::from_f64(f as f64)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Double(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Text(bytes) => String::from_utf8_lossy(bytes).into_owned().into(),
            ValueRef::Timestamp(unit, v) => {
                let micros = match unit {
                    TimeUnit::Second => v.saturating_mul(1_000_000),
                    TimeUnit::Millisecond => v.saturating_mul(1_000),
                    TimeUnit::Microsecond => v,
                    TimeUnit::Nanosecond => v / 1_000,
                };
                chrono::DateTime::from_timestamp_micros(micros)
                    .map(|ts| {
                        serde_json::Value::String(
                            ts.naive_utc().format("%Y-%m-%d %H:%M:%S%.f").to_string(),
                        )
                    })
                    .unwrap_or(serde_json::Value::Null)
            }
            ValueRef::Date32(days) => chrono::DateTime::from_timestamp(i64::from(days) * 86_400, 0)
                .map(|ts| serde_json::Value::String(ts.date_naive().to_string()))
                .unwrap_or(serde_json::Value::Null),
            ValueRef::Decimal(d) => serde_json::Value::String(d.to_string()),
            other => serde_json::Value::String(format!("{:?}", other)),
        }
    }

    fn quote_literal(value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// `WHERE` filter locating a table in the catalog views
    fn catalog_filter(table: &DatasetReference, name_column: &str, schema_column: &str) -> String {
        let mut filter = format!("{} = {}", name_column, Self::quote_literal(&table.name));
        if let Some(group) = &table.group {
            filter.push_str(&format!(
                " AND {} = {}",
                schema_column,
                Self::quote_literal(group)
            ));
        }
        filter
    }
}

impl RelationalExecutor for DuckDbExecutor {
    fn begin(&self) -> ExecutorResult<()> {
        self.transaction_statement("BEGIN TRANSACTION")
    }

    fn commit(&self) -> ExecutorResult<()> {
        self.transaction_statement("COMMIT")
    }

    fn rollback(&self) -> ExecutorResult<()> {
        self.transaction_statement("ROLLBACK")
    }

    fn execute(&self, sql: &str) -> ExecutorResult<u64> {
        tracing::debug!("duckdb execute: {}", sql);
        let conn = self.lock()?;
        conn.execute(sql, [])
            .map(|n| n as u64)
            .map_err(|e| classify_failure("Execute failed", e.to_string()))
    }

    fn query(&self, sql: &str) -> ExecutorResult<QueryResult> {
        tracing::debug!("duckdb query: {}", sql);
        let start = std::time::Instant::now();

        let conn = self.lock()?;

        let mut stmt = conn
            .prepare(sql)
            .map_err(|e| classify_failure("Prepare failed", e.to_string()))?;

        // In DuckDB 1.4+, the query runs before columns are known
        let mut result_rows = stmt
            .query([])
            .map_err(|e| classify_failure("Query failed", e.to_string()))?;

        let column_count = result_rows.as_ref().map(|r| r.column_count()).unwrap_or(0);
        let columns: Vec<String> = (0..column_count)
            .map(|i| {
                result_rows
                    .as_ref()
                    .and_then(|r| r.column_name(i).ok())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| format!("col{}", i))
            })
            .collect();

        let mut rows = Vec::new();
        while let Some(row) = result_rows
            .next()
            .map_err(|e| ExecutorError::QueryFailed(format!("Row fetch error: {}", e)))?
        {
            rows.push(Self::row_to_json(row, &columns));
        }

        Ok(QueryResult {
            columns,
            rows,
            rows_affected: None,
            execution_time_ms: start.elapsed().as_millis() as u64,
        })
    }

    fn table_exists(&self, table: &DatasetReference) -> ExecutorResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) AS table_count FROM information_schema.tables WHERE {}",
            Self::catalog_filter(table, "table_name", "table_schema")
        );
        Ok(self.query(&sql)?.first_i64("table_count").unwrap_or(0) > 0)
    }

    fn fetch_schema(&self, table: &DatasetReference) -> ExecutorResult<Option<SchemaDefinition>> {
        let columns = self.query(&format!(
            "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE {} ORDER BY ordinal_position",
            Self::catalog_filter(table, "table_name", "table_schema")
        ))?;
        if columns.is_empty() {
            return Ok(None);
        }

        let keys = self.query(&format!(
            "SELECT UNNEST(constraint_column_names) AS column_name FROM duckdb_constraints() WHERE constraint_type = 'PRIMARY KEY' AND {}",
            Self::catalog_filter(table, "table_name", "schema_name")
        ))?;
        let key_names: Vec<&str> = keys
            .rows
            .iter()
            .filter_map(|row| value_of(row, "column_name").and_then(|v| v.as_str()))
            .collect();

        let mut fields = Vec::with_capacity(columns.row_count());
        for row in &columns.rows {
            let name = value_of(row, "column_name")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    ExecutorError::QueryFailed(format!("Column without name in {}", table.name))
                })?;
            let type_name = value_of(row, "data_type")
                .and_then(|v| v.as_str())
                .unwrap_or_default();
            let field_type = DataType::from_sql_name(type_name).ok_or_else(|| {
                ExecutorError::QueryFailed(format!(
                    "Unsupported type {} for column {}.{}",
                    type_name, table.name, name
                ))
            })?;

            let mut field = Field::new(name, field_type.data_type).with_type(field_type);
            if key_names.contains(&name) {
                field = field.primary_key();
            } else if value_of(row, "is_nullable").and_then(|v| v.as_str()) == Some("NO") {
                field = field.not_null();
            }
            fields.push(field);
        }
        Ok(Some(SchemaDefinition::trusted(fields)))
    }

    fn backend_type(&self) -> &'static str {
        "duckdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FieldType;

    #[test]
    fn test_in_memory_database() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        assert!(executor.is_in_memory());
        assert!(executor.db_path().is_none());
        assert_eq!(executor.backend_type(), "duckdb");
    }

    #[test]
    fn test_rollback_discards_writes() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        executor
            .execute("CREATE TABLE \"main\"(\"id\" INTEGER)")
            .unwrap();

        executor.begin().unwrap();
        executor
            .execute("INSERT INTO \"main\" VALUES (1), (2)")
            .unwrap();
        executor.rollback().unwrap();

        let result = executor
            .query("SELECT COUNT(*) AS row_count FROM \"main\"")
            .unwrap();
        assert_eq!(result.first_i64("row_count"), Some(0));
    }

    #[test]
    fn test_fetch_schema_reads_keys_and_types() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        executor
            .execute(
                "CREATE TABLE \"main\"(\"id\" INTEGER NOT NULL, \"name\" VARCHAR, \"amount\" DECIMAL(18,2) NOT NULL, PRIMARY KEY (\"id\"))",
            )
            .unwrap();

        let reference = DatasetReference::new("main");
        assert!(executor.table_exists(&reference).unwrap());
        assert!(!executor
            .table_exists(&DatasetReference::new("other"))
            .unwrap());

        let schema = executor.fetch_schema(&reference).unwrap().unwrap();
        assert_eq!(schema.primary_key_names(), vec!["id"]);
        assert!(schema.field("name").unwrap().nullable);
        let amount = schema.field("amount").unwrap();
        assert!(!amount.nullable);
        assert_eq!(
            amount.field_type,
            FieldType {
                data_type: DataType::Decimal,
                length: Some(18),
                scale: Some(2),
            }
        );
        assert!(executor
            .fetch_schema(&DatasetReference::new("other"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_query_converts_values() {
        let executor = DuckDbExecutor::in_memory().unwrap();
        let result = executor
            .query("SELECT SUM(x) AS total, TIMESTAMP '2024-01-02 03:04:05' AS ts, NULL AS nothing FROM (VALUES (1), (2)) t(x)")
            .unwrap();
        assert_eq!(result.first_i64("total"), Some(3));
        assert_eq!(
            result.first_value("ts").and_then(|v| v.as_str()),
            Some("2024-01-02 03:04:05")
        );
        assert!(result.first_value("nothing").unwrap().is_null());
    }
}
