//! Per-table ingestion lock
//!
//! One row per target table in the lock table. Stamping its last-used
//! timestamp inside the ingestion transaction takes the engine's row lock,
//! which serialises concurrent writers of the same table until commit or
//! rollback. Writers that lose the race see a write conflict and retry with
//! exponential backoff.

use chrono::NaiveDateTime;
use std::time::{Duration, Instant};

use crate::error::{IngestError, IngestResult};
use crate::executor::{ExecutorError, RelationalExecutor};
use crate::logical::{Condition, Expr, LogicalPlan, Operation, Select, SelectItem, aliased};
use crate::models::LockInfoDataset;
use crate::planner::timestamp;
use crate::sink::{RelationalSink, SqlRenderer};

const LOCK_ALIAS: &str = "ingest_lock";

/// Backoff never grows beyond this multiple of the initial interval
const MAX_BACKOFF_FACTOR: u32 = 8;

/// Lock row management for one target table
pub struct LockProvider<'a> {
    sink: &'a dyn RelationalSink,
    lock: LockInfoDataset,
    table_name: String,
}

impl<'a> LockProvider<'a> {
    pub fn new(
        sink: &'a dyn RelationalSink,
        lock: LockInfoDataset,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            lock,
            table_name: table_name.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn row_condition(&self) -> Condition {
        Expr::col(LOCK_ALIAS, &self.lock.table_name_field)
            .equals(Expr::string(self.table_name.clone()))
    }

    /// `CREATE TABLE IF NOT EXISTS` for the lock table
    pub fn create_plan(&self) -> LogicalPlan {
        let mut table = self.lock.reference.clone();
        table.alias = None;
        LogicalPlan::new(vec![Operation::CreateTable {
            table,
            schema: self.lock.schema(),
            if_not_exists: true,
        }])
    }

    /// Insert the table's lock row unless present
    pub fn initialize_plan(&self, insert_ts: &str) -> LogicalPlan {
        let mut table = self.lock.reference.clone();
        table.alias = None;
        let absent = Condition::not_exists(
            Select::star_from(&self.lock.reference.clone().with_alias(LOCK_ALIAS))
                .with_where(self.row_condition()),
        );
        LogicalPlan::new(vec![Operation::Insert {
            table,
            columns: vec![
                self.lock.insert_ts_field.clone(),
                self.lock.table_name_field.clone(),
            ],
            select: Select::values(vec![
                SelectItem::from(timestamp(insert_ts)),
                SelectItem::from(Expr::string(self.table_name.clone())),
            ])
            .with_where(absent),
        }])
    }

    /// Stamp last-used, taking the row lock for the rest of the transaction
    pub fn acquire_plan(&self, ts: &str) -> LogicalPlan {
        LogicalPlan::new(vec![Operation::Update {
            table: self.lock.reference.clone().with_alias(LOCK_ALIAS),
            assignments: vec![(self.lock.last_used_ts_field.clone(), timestamp(ts))],
            where_clause: Some(self.row_condition()),
        }])
    }

    /// Last-used timestamp of the lock row
    pub fn last_used_query(&self) -> Select {
        Select::from_source(
            crate::logical::Source::Table(self.lock.reference.clone().with_alias(LOCK_ALIAS)),
            vec![aliased(
                Expr::cast(
                    Expr::col(LOCK_ALIAS, &self.lock.last_used_ts_field),
                    crate::models::FieldType::of(crate::models::DataType::Varchar),
                ),
                "lastUsed",
            )],
        )
        .with_where(self.row_condition())
    }

    pub fn create_sql(&self) -> IngestResult<Vec<String>> {
        SqlRenderer::new(self.sink).render_plan(&self.create_plan())
    }

    pub fn initialize_sql(&self, insert_ts: &str) -> IngestResult<Vec<String>> {
        SqlRenderer::new(self.sink).render_plan(&self.initialize_plan(insert_ts))
    }

    pub fn acquire_sql(&self, ts: &str) -> IngestResult<Vec<String>> {
        SqlRenderer::new(self.sink).render_plan(&self.acquire_plan(ts))
    }

    /// Create the lock table and this table's row if absent
    pub fn create_and_initialize(
        &self,
        executor: &dyn RelationalExecutor,
        insert_ts: &str,
    ) -> IngestResult<()> {
        executor.execute_all(&self.create_sql()?)?;
        if let Err(e) = executor.execute_all(&self.initialize_sql(insert_ts)?) {
            // a concurrent initialiser may have inserted the row first
            if self.last_used(executor).is_err() {
                return Err(e.into());
            }
            tracing::debug!("Lock row for {} initialised concurrently: {}", self.table_name, e);
        }
        Ok(())
    }

    /// Stamp last-used; fails with a conflict while another writer holds the row
    pub fn lock(&self, executor: &dyn RelationalExecutor, ts: &str) -> IngestResult<()> {
        executor.execute_all(&self.acquire_sql(ts)?)?;
        tracing::debug!("Acquired ingestion lock for {}", self.table_name);
        Ok(())
    }

    /// Last-used timestamp, `None` when never locked
    pub fn last_used(&self, executor: &dyn RelationalExecutor) -> IngestResult<Option<String>> {
        let sql = SqlRenderer::new(self.sink).render_select(&self.last_used_query())?;
        let result = executor.query(&sql)?;
        if result.is_empty() {
            return Err(IngestError::Resource(format!(
                "No lock row for table {} in {}",
                self.table_name, self.lock.reference.name
            )));
        }
        Ok(result
            .first_value("lastUsed")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    /// Warn when the lock row has not been used for longer than `threshold`
    ///
    /// The engine releases a crashed holder's row lock with its connection,
    /// so a stale row is reported but never forcibly released.
    pub fn warn_if_stale(
        &self,
        executor: &dyn RelationalExecutor,
        now: NaiveDateTime,
        threshold: Duration,
    ) -> IngestResult<bool> {
        let Some(last_used) = self.last_used(executor)? else {
            return Ok(false);
        };
        let Some(last_used_ts) = parse_timestamp(&last_used) else {
            tracing::debug!("Unparseable lock timestamp {} for {}", last_used, self.table_name);
            return Ok(false);
        };
        let idle = now.signed_duration_since(last_used_ts);
        let stale = idle.to_std().map(|d| d > threshold).unwrap_or(false);
        if stale {
            tracing::warn!(
                "Lock for {} last used at {} ({}s ago); a previous holder may have crashed",
                self.table_name,
                last_used,
                idle.num_seconds()
            );
        }
        Ok(stale)
    }
}

/// Parse the timestamp forms engines report for `CAST(ts AS VARCHAR)`
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let value = value.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
}

/// Run `attempt` until it stops reporting write conflicts
///
/// Waits `interval` after the first conflict and doubles the wait after each
/// further one, up to eight times the interval. Gives up with
/// [`IngestError::LockTimeout`] once `timeout` has elapsed.
pub fn retry_on_conflict<T>(
    table: &str,
    timeout: Duration,
    interval: Duration,
    mut attempt: impl FnMut() -> IngestResult<T>,
) -> IngestResult<T> {
    let start = Instant::now();
    let mut wait = interval;
    let max_wait = interval.saturating_mul(MAX_BACKOFF_FACTOR);
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match attempt() {
            Err(IngestError::Executor(ExecutorError::Conflict(message))) => {
                let elapsed = start.elapsed();
                if elapsed + wait > timeout {
                    tracing::warn!(
                        "Giving up on lock for {} after {} attempts: {}",
                        table,
                        attempts,
                        message
                    );
                    return Err(IngestError::LockTimeout {
                        table: table.to_string(),
                        waited_ms: elapsed.as_millis() as u64,
                    });
                }
                tracing::debug!(
                    "Write conflict on {} (attempt {}), retrying in {}ms",
                    table,
                    attempts,
                    wait.as_millis()
                );
                std::thread::sleep(wait);
                wait = (wait * 2).min(max_wait);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{QueryResult, RecordingExecutor};
    use crate::models::DatasetReference;
    use crate::sink::{AnsiSqlSink, DuckDbSink};

    fn provider(sink: &dyn RelationalSink) -> LockProvider<'_> {
        LockProvider::new(
            sink,
            LockInfoDataset::for_main(&DatasetReference::new("main")),
            "main",
        )
    }

    #[test]
    fn test_lock_sql() {
        let lock = provider(&DuckDbSink);
        assert_eq!(
            lock.create_sql().unwrap(),
            vec!["CREATE TABLE IF NOT EXISTS \"main_ingest_lock\"(\"insert_ts_utc\" TIMESTAMP, \"last_used_ts_utc\" TIMESTAMP, \"table_name\" VARCHAR UNIQUE)".to_string()]
        );
        assert_eq!(
            lock.initialize_sql("2024-01-01 00:00:00").unwrap(),
            vec!["INSERT INTO \"main_ingest_lock\" (\"insert_ts_utc\", \"table_name\") (SELECT CAST('2024-01-01 00:00:00' AS TIMESTAMP),'main' WHERE NOT EXISTS (SELECT * FROM \"main_ingest_lock\" as ingest_lock WHERE ingest_lock.\"table_name\" = 'main'))".to_string()]
        );
        assert_eq!(
            lock.acquire_sql("2024-01-01 00:00:00").unwrap(),
            vec!["UPDATE \"main_ingest_lock\" as ingest_lock SET \"last_used_ts_utc\" = CAST('2024-01-01 00:00:00' AS TIMESTAMP) WHERE ingest_lock.\"table_name\" = 'main'".to_string()]
        );

        let ansi = provider(&AnsiSqlSink);
        assert!(ansi.acquire_sql("2024-01-01 00:00:00").unwrap()[0]
            .contains("SET ingest_lock.\"last_used_ts_utc\" = CAST('2024-01-01 00:00:00' AS DATETIME)"));
    }

    #[test]
    fn test_stale_lock_is_reported() {
        let executor = RecordingExecutor::new();
        executor.respond(
            "\"lastUsed\"",
            QueryResult::single("lastUsed", "2024-01-01 00:00:00"),
        );
        let lock = provider(&DuckDbSink);
        let now = parse_timestamp("2024-01-01 02:00:00").unwrap();
        assert!(lock
            .warn_if_stale(&executor, now, Duration::from_secs(3600))
            .unwrap());
        assert!(!lock
            .warn_if_stale(&executor, now, Duration::from_secs(3 * 3600))
            .unwrap());
    }

    #[test]
    fn test_missing_lock_row() {
        let executor = RecordingExecutor::new();
        let err = provider(&DuckDbSink).last_used(&executor).unwrap_err();
        assert!(matches!(err, IngestError::Resource(_)));
    }

    #[test]
    fn test_retry_on_conflict_backs_off_then_succeeds() {
        let mut calls = 0;
        let result = retry_on_conflict(
            "main",
            Duration::from_secs(5),
            Duration::from_millis(1),
            || {
                calls += 1;
                if calls < 3 {
                    Err(ExecutorError::Conflict("busy".into()).into())
                } else {
                    Ok(calls)
                }
            },
        );
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn test_retry_on_conflict_times_out() {
        let err = retry_on_conflict::<()>(
            "main",
            Duration::from_millis(5),
            Duration::from_millis(2),
            || Err(ExecutorError::Conflict("busy".into()).into()),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::LockTimeout { ref table, .. } if table == "main"));
    }

    #[test]
    fn test_retry_passes_other_errors_through() {
        let err = retry_on_conflict::<()>(
            "main",
            Duration::from_secs(1),
            Duration::from_millis(1),
            || Err(IngestError::Resource("gone".into())),
        )
        .unwrap_err();
        assert!(matches!(err, IngestError::Resource(_)));
    }
}
