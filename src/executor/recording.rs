//! In-memory executor that records statements and serves canned rows
//!
//! Used to test ingestion orchestration without a database: every call is
//! appended to a transcript, queries are answered from registered responses
//! matched by SQL fragment, and failures can be injected the same way.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

use super::{ExecutorError, ExecutorResult, QueryResult, RelationalExecutor};
use crate::models::{DatasetReference, SchemaDefinition};

#[derive(Debug)]
struct Response {
    fragment: String,
    results: VecDeque<QueryResult>,
}

#[derive(Debug)]
struct Failure {
    fragment: String,
    error: ExecutorError,
    remaining: Option<usize>,
}

#[derive(Debug, Default)]
struct State {
    transcript: Vec<String>,
    executed: Vec<String>,
    queries: Vec<String>,
    responses: Vec<Response>,
    failures: Vec<Failure>,
    tables: BTreeMap<String, SchemaDefinition>,
    in_transaction: bool,
}

/// Executor double for orchestration tests
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    state: Mutex<State>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an existing table
    pub fn with_table(self, name: impl Into<String>, schema: SchemaDefinition) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.tables.insert(name.into().to_lowercase(), schema);
        }
        self
    }

    /// Answer queries containing `fragment` with `result`
    ///
    /// Repeated registrations for the same fragment queue up; the last
    /// result keeps being served once the queue is down to one.
    pub fn respond(&self, fragment: impl Into<String>, result: QueryResult) {
        let fragment = fragment.into();
        if let Ok(mut state) = self.state.lock() {
            match state.responses.iter_mut().find(|r| r.fragment == fragment) {
                Some(response) => response.results.push_back(result),
                None => state.responses.push(Response {
                    fragment,
                    results: VecDeque::from([result]),
                }),
            }
        }
    }

    /// Fail every statement or query containing `fragment`
    pub fn fail_on(&self, fragment: impl Into<String>, error: ExecutorError) {
        self.push_failure(fragment.into(), error, None);
    }

    /// Fail the next `times` statements or queries containing `fragment`
    pub fn fail_times(&self, fragment: impl Into<String>, error: ExecutorError, times: usize) {
        self.push_failure(fragment.into(), error, Some(times));
    }

    fn push_failure(&self, fragment: String, error: ExecutorError, remaining: Option<usize>) {
        if let Ok(mut state) = self.state.lock() {
            state.failures.push(Failure {
                fragment,
                error,
                remaining,
            });
        }
    }

    /// Every call in order, transaction control included
    pub fn transcript(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.transcript.clone())
            .unwrap_or_default()
    }

    /// Statements passed to `execute`
    pub fn executed(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.executed.clone())
            .unwrap_or_default()
    }

    /// SQL passed to `query`
    pub fn queries(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|s| s.queries.clone())
            .unwrap_or_default()
    }

    /// Whether a transaction is open
    pub fn in_transaction(&self) -> bool {
        self.state.lock().map(|s| s.in_transaction).unwrap_or(false)
    }

    fn state(&self) -> ExecutorResult<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| ExecutorError::ConnectionFailed(format!("Lock error: {}", e)))
    }
}

impl State {
    fn injected_failure(&mut self, sql: &str) -> Option<ExecutorError> {
        let failure = self
            .failures
            .iter_mut()
            .find(|f| sql.contains(&f.fragment) && f.remaining != Some(0))?;
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(failure.error.clone())
    }

    fn answer(&mut self, sql: &str) -> QueryResult {
        match self
            .responses
            .iter_mut()
            .find(|r| sql.contains(&r.fragment))
        {
            Some(response) if response.results.len() > 1 => {
                response.results.pop_front().unwrap_or_default()
            }
            Some(response) => response.results.front().cloned().unwrap_or_default(),
            None => QueryResult::empty(),
        }
    }
}

impl RelationalExecutor for RecordingExecutor {
    fn begin(&self) -> ExecutorResult<()> {
        let mut state = self.state()?;
        if state.in_transaction {
            return Err(ExecutorError::TransactionFailed(
                "Transaction already open".to_string(),
            ));
        }
        state.in_transaction = true;
        state.transcript.push("BEGIN".to_string());
        Ok(())
    }

    fn commit(&self) -> ExecutorResult<()> {
        let mut state = self.state()?;
        if let Some(error) = state.injected_failure("COMMIT") {
            return Err(error);
        }
        state.in_transaction = false;
        state.transcript.push("COMMIT".to_string());
        Ok(())
    }

    fn rollback(&self) -> ExecutorResult<()> {
        let mut state = self.state()?;
        state.in_transaction = false;
        state.transcript.push("ROLLBACK".to_string());
        Ok(())
    }

    fn execute(&self, sql: &str) -> ExecutorResult<u64> {
        let mut state = self.state()?;
        state.transcript.push(sql.to_string());
        state.executed.push(sql.to_string());
        match state.injected_failure(sql) {
            Some(error) => Err(error),
            None => Ok(0),
        }
    }

    fn query(&self, sql: &str) -> ExecutorResult<QueryResult> {
        let mut state = self.state()?;
        state.transcript.push(sql.to_string());
        state.queries.push(sql.to_string());
        if let Some(error) = state.injected_failure(sql) {
            return Err(error);
        }
        Ok(state.answer(sql))
    }

    fn table_exists(&self, table: &DatasetReference) -> ExecutorResult<bool> {
        Ok(self
            .state()?
            .tables
            .contains_key(&table.name.to_lowercase()))
    }

    fn fetch_schema(&self, table: &DatasetReference) -> ExecutorResult<Option<SchemaDefinition>> {
        Ok(self
            .state()?
            .tables
            .get(&table.name.to_lowercase())
            .cloned())
    }

    fn backend_type(&self) -> &'static str {
        "recording"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_responses_queue_then_stick() {
        let executor = RecordingExecutor::new();
        executor.respond("batch_metadata", QueryResult::single("n", 1));
        executor.respond("batch_metadata", QueryResult::single("n", 2));

        let sql = "SELECT COUNT(*) FROM \"batch_metadata\"";
        assert_eq!(executor.query(sql).unwrap().first_i64("n"), Some(1));
        assert_eq!(executor.query(sql).unwrap().first_i64("n"), Some(2));
        assert_eq!(executor.query(sql).unwrap().first_i64("n"), Some(2));
        assert!(executor.query("SELECT 1").unwrap().is_empty());
        assert_eq!(executor.queries().len(), 4);
    }

    #[test]
    fn test_injected_failures() {
        let executor = RecordingExecutor::new();
        executor.fail_times(
            "UPDATE \"main_lock\"",
            ExecutorError::Conflict("row locked".into()),
            1,
        );
        let sql = "UPDATE \"main_lock\" SET x = 1";
        assert!(matches!(
            executor.execute(sql),
            Err(ExecutorError::Conflict(_))
        ));
        assert_eq!(executor.execute(sql).unwrap(), 0);
        assert_eq!(executor.executed().len(), 2);
    }

    #[test]
    fn test_registered_tables() {
        let executor = RecordingExecutor::new().with_table("Main", SchemaDefinition::empty());
        assert!(executor.table_exists(&DatasetReference::new("main")).unwrap());
        assert!(!executor.table_exists(&DatasetReference::new("other")).unwrap());
        assert!(executor
            .fetch_schema(&DatasetReference::new("other"))
            .unwrap()
            .is_none());
    }
}
