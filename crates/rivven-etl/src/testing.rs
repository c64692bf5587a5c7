//! Test doubles for connections, connectors and inline tasks
//!
//! These run the engine without a database server: a [`MockConnection`]
//! records every statement and transaction event and fails on scripted
//! patterns, a [`MemoryConnector`] populates and persists data sets in
//! memory, and a [`ScriptedTaskExecutor`] answers inline task calls from a
//! table.
//!
//! # Example
//!
//! ```rust,ignore
//! use rivven_etl::testing::*;
//!
//! #[tokio::test]
//! async fn test_duplicate_rows_are_skipped() {
//!     let conn = MockConnection::new().fail_on("VALUES (2", "UNIQUE constraint failed");
//!
//!     // ... execute a destination against `conn` ...
//!
//!     assert!(conn.journal().contains(&"ROLLBACK TO etl_sp_2".to_string()));
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::EtlConfig;
use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, RowStream, VecRowStream};
use crate::connector::{push_record, ConnectorParams, DataSetConnector};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::{DataSet, DataSetRecord, Scenario};
use crate::result::EtlResult;
use crate::task::{TaskExecutor, TaskResult, TaskTarget};
use crate::types::{ColumnMetadata, Row, Value};

// ============================================================================
// Mock Connection
// ============================================================================

#[derive(Debug, Clone)]
struct ScriptedFailure {
    pattern: String,
    message: String,
    constraint: bool,
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct ScriptedResult {
    pattern: String,
    columns: Vec<ColumnMetadata>,
    rows: Vec<Row>,
}

#[derive(Debug, Default)]
struct MockState {
    statements: Vec<String>,
    params: Vec<(String, Vec<Value>)>,
    journal: Vec<String>,
    failures: Vec<ScriptedFailure>,
    results: Vec<ScriptedResult>,
    closed: bool,
}

impl MockState {
    fn check(&mut self, sql: &str) -> Result<()> {
        if self.closed {
            return Err(Error::connection("connection is closed"));
        }
        let Some(failure) = self
            .failures
            .iter_mut()
            .find(|f| sql.contains(&f.pattern) && f.remaining != Some(0))
        else {
            return Ok(());
        };
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(if failure.constraint {
            Error::constraint(failure.message.clone(), Some(sql.to_string()))
        } else {
            Error::query_with_sql(failure.message.clone(), sql)
        })
    }

    fn result_for(&self, sql: &str) -> (Vec<ColumnMetadata>, Vec<Row>) {
        self.results
            .iter()
            .find(|r| sql.contains(&r.pattern))
            .map(|r| (r.columns.clone(), r.rows.clone()))
            .unwrap_or_default()
    }
}

/// A connection that records statements and fails on scripted patterns
///
/// Clones share state, so a clone handed to the engine can be inspected
/// through the original.
#[derive(Debug, Clone, Default)]
pub struct MockConnection {
    state: Arc<Mutex<MockState>>,
}

impl MockConnection {
    /// Create a connection where every statement succeeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every statement containing `pattern` with a query error
    pub fn fail_on(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.script_failure(pattern, message, false, None)
    }

    /// Fail every statement containing `pattern` with a constraint violation
    pub fn fail_with_constraint(self, pattern: impl Into<String>, message: impl Into<String>) -> Self {
        self.script_failure(pattern, message, true, None)
    }

    /// Fail the first `times` statements containing `pattern`
    pub fn fail_times(self, pattern: impl Into<String>, message: impl Into<String>, times: usize) -> Self {
        self.script_failure(pattern, message, false, Some(times))
    }

    fn script_failure(
        self,
        pattern: impl Into<String>,
        message: impl Into<String>,
        constraint: bool,
        remaining: Option<usize>,
    ) -> Self {
        self.state.lock().failures.push(ScriptedFailure {
            pattern: pattern.into(),
            message: message.into(),
            constraint,
            remaining,
        });
        self
    }

    /// Answer queries containing `pattern` with the given rows
    pub fn with_result(self, pattern: impl Into<String>, columns: Vec<ColumnMetadata>, rows: Vec<Row>) -> Self {
        self.state.lock().results.push(ScriptedResult {
            pattern: pattern.into(),
            columns,
            rows,
        });
        self
    }

    /// Every statement, script and query attempted, in order
    pub fn statements(&self) -> Vec<String> {
        self.state.lock().statements.clone()
    }

    /// Parameters bound to each `execute` call
    pub fn executed_params(&self) -> Vec<(String, Vec<Value>)> {
        self.state.lock().params.clone()
    }

    /// Transaction and savepoint events (`BEGIN`, `SAVEPOINT sp`, `ROLLBACK TO sp`, ...)
    pub fn journal(&self) -> Vec<String> {
        self.state.lock().journal.clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn record(&self, sql: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.statements.push(sql.to_string());
        state.check(sql)
    }

    fn event(&self, event: String) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::connection("connection is closed"));
        }
        state.journal.push(event);
        Ok(())
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql)?;
        Ok(self.state.lock().result_for(sql).1)
    }

    async fn query_stream(&self, sql: &str, _params: &[Value]) -> Result<Box<dyn RowStream>> {
        self.record(sql)?;
        let (columns, rows) = self.state.lock().result_for(sql);
        Ok(Box::new(VecRowStream::new(columns, rows)))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.state
            .lock()
            .params
            .push((sql.to_string(), params.to_vec()));
        self.record(sql)?;
        Ok(1)
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        self.record(sql)
    }

    async fn begin(&self) -> Result<()> {
        self.event("BEGIN".into())
    }

    async fn commit(&self) -> Result<()> {
        self.event("COMMIT".into())
    }

    async fn rollback(&self) -> Result<()> {
        self.event("ROLLBACK".into())
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        self.event(format!("SAVEPOINT {}", name))
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.event(format!("ROLLBACK TO {}", name))
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.event(format!("RELEASE {}", name))
    }

    async fn is_valid(&self) -> bool {
        !self.state.lock().closed
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.closed = true;
        state.journal.push("CLOSE".into());
        Ok(())
    }
}

/// Factory handing out clones of one [`MockConnection`]
#[derive(Debug, Default)]
pub struct MockConnectionFactory {
    connection: MockConnection,
    connects: AtomicUsize,
}

impl MockConnectionFactory {
    /// Factory for the given connection
    pub fn new(connection: MockConnection) -> Self {
        Self {
            connection,
            connects: AtomicUsize::new(0),
        }
    }

    /// The shared connection
    pub fn connection(&self) -> &MockConnection {
        &self.connection
    }

    /// Number of `connect` calls
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn connect(&self, _config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let mut state = self.connection.state.lock();
        state.closed = false;
        drop(state);
        Ok(Box::new(self.connection.clone()))
    }
}

// ============================================================================
// Memory Connector
// ============================================================================

/// A data set written by [`MemoryConnector`]
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedDataSet {
    /// Data set name
    pub name: String,
    /// Field names
    pub fields: Vec<String>,
    /// Record values
    pub rows: Vec<Vec<Value>>,
}

/// Property naming a directory the connector spools persisted data sets to
pub const SPOOL_DIR_PROPERTY: &str = "spool_dir";

/// Property making every operation return `ActionFailed`
pub const FAIL_PROPERTY: &str = "fail";

/// In-memory connector under the `memory` format key
///
/// `populate` replays a fixture data set through the listener; `persist`
/// keeps a copy and, when the `spool_dir` property is set, writes
/// `{spool_dir}/{name}.tsv` and registers it with the transaction monitor.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    name: Option<String>,
    input: Arc<Mutex<Option<DataSet>>>,
    persisted: Arc<Mutex<Vec<PersistedDataSet>>>,
    inline: Arc<Mutex<Vec<(usize, Vec<Value>)>>>,
    events: Arc<Mutex<Vec<String>>>,
}

impl MemoryConnector {
    /// Create an empty connector
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under another format key, e.g. to tell input from output
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Data set replayed by `populate`
    pub fn with_input(self, data_set: DataSet) -> Self {
        *self.input.lock() = Some(data_set);
        self
    }

    /// Data sets written by `persist`
    pub fn persisted(&self) -> Vec<PersistedDataSet> {
        self.persisted.lock().clone()
    }

    /// Records written by `inline_persist` with their row index
    pub fn inline_records(&self) -> Vec<(usize, Vec<Value>)> {
        self.inline.lock().clone()
    }

    /// Lifecycle calls in order
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    fn failing(params: &ConnectorParams<'_>, operation: &str) -> Option<EtlResult> {
        (params.property(FAIL_PROPERTY) == Some("true"))
            .then(|| EtlResult::action_failed(format!("memory connector: {} failed", operation)))
    }

    async fn spool(params: &ConnectorParams<'_>, data_set: &DataSet) -> Result<()> {
        let Some(dir) = params.property(SPOOL_DIR_PROPERTY) else {
            return Ok(());
        };
        let path = PathBuf::from(dir).join(format!("{}.tsv", data_set.name));
        let mut text = data_set
            .fields()
            .iter()
            .map(|f| f.name.as_str())
            .collect::<Vec<_>>()
            .join("\t");
        for record in data_set.records() {
            text.push('\n');
            let line: Vec<String> = record.values().iter().map(ToString::to_string).collect();
            text.push_str(&line.join("\t"));
        }
        tokio::fs::write(&path, text).await?;
        if let Some(monitor) = params.monitor {
            monitor.register_file(&path);
        }
        Ok(())
    }
}

#[async_trait]
impl DataSetConnector for MemoryConnector {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("memory")
    }

    async fn populate(
        &self,
        params: &ConnectorParams<'_>,
        data_set: &mut DataSet,
        _driver: Option<&dyn Driver>,
    ) -> Result<EtlResult> {
        self.events.lock().push("populate".into());
        if let Some(failed) = Self::failing(params, "populate") {
            return Ok(failed);
        }
        let Some(input) = self.input.lock().clone() else {
            return Ok(EtlResult::ok());
        };

        if data_set.fields().is_empty() {
            for field in input.fields() {
                data_set.add_field(field.clone());
            }
        }
        if let Some(listener) = params.listener {
            listener.before(data_set).await?;
        }
        for record in input.records() {
            match push_record(params, data_set, record.clone()).await? {
                TaskResult::Proceed | TaskResult::Reject => {}
                TaskResult::Stop => break,
            }
        }
        if let Some(listener) = params.listener {
            listener.after(data_set).await?;
        }
        Ok(EtlResult::ok())
    }

    async fn persist(
        &self,
        params: &ConnectorParams<'_>,
        data_set: &DataSet,
        _driver: Option<&dyn Driver>,
    ) -> Result<EtlResult> {
        self.events.lock().push("persist".into());
        if let Some(failed) = Self::failing(params, "persist") {
            return Ok(failed);
        }
        Self::spool(params, data_set).await?;
        self.persisted.lock().push(PersistedDataSet {
            name: data_set.name.clone(),
            fields: data_set.fields().iter().map(|f| f.name.clone()).collect(),
            rows: data_set
                .records()
                .iter()
                .map(|r| r.values().to_vec())
                .collect(),
        });
        Ok(EtlResult::ok())
    }

    async fn inline_persist(
        &self,
        _params: &ConnectorParams<'_>,
        _data_set: &DataSet,
        _driver: Option<&dyn Driver>,
        record: &DataSetRecord,
        row: usize,
        _total_rows: usize,
    ) -> Result<EtlResult> {
        self.inline.lock().push((row, record.values().to_vec()));
        Ok(EtlResult::ok())
    }

    async fn pre_persist(&self, _params: &ConnectorParams<'_>) -> Result<EtlResult> {
        self.events.lock().push("pre_persist".into());
        Ok(EtlResult::ok())
    }

    async fn post_persist(&self, _params: &ConnectorParams<'_>) -> Result<EtlResult> {
        self.events.lock().push("post_persist".into());
        Ok(EtlResult::ok())
    }

    async fn cleanup(&self) -> Result<()> {
        self.events.lock().push("cleanup".into());
        Ok(())
    }

    async fn test_connection(&self, _properties: &BTreeMap<String, String>) -> Result<String> {
        Ok("memory connector ready".to_string())
    }
}

// ============================================================================
// Scripted Task Executor
// ============================================================================

/// Task executor answering from a table of `(target, row)` entries
///
/// Unlisted calls proceed. Every call is recorded.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTaskExecutor {
    answers: Arc<Mutex<HashMap<(String, Option<usize>), TaskResult>>>,
    failures: Arc<Mutex<Vec<(String, Option<usize>)>>>,
    calls: Arc<Mutex<Vec<(String, Option<usize>)>>>,
}

impl ScriptedTaskExecutor {
    /// Executor that always proceeds
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer for a row of a target
    pub fn on_row(self, target: impl Into<String>, row: usize, result: TaskResult) -> Self {
        self.answers.lock().insert((target.into(), Some(row)), result);
        self
    }

    /// Answer for the call made before a source is fetched
    pub fn before_fetch(self, target: impl Into<String>, result: TaskResult) -> Self {
        self.answers.lock().insert((target.into(), None), result);
        self
    }

    /// Fail with a task error for a row of a target
    pub fn fail_on_row(self, target: impl Into<String>, row: usize) -> Self {
        self.failures.lock().push((target.into(), Some(row)));
        self
    }

    /// Calls received, in order
    pub fn calls(&self) -> Vec<(String, Option<usize>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl TaskExecutor for ScriptedTaskExecutor {
    async fn execute_inline_tasks(
        &self,
        _config: &EtlConfig,
        target: TaskTarget<'_>,
        _scenario: &Scenario,
        row: Option<usize>,
    ) -> Result<TaskResult> {
        let key = (target.name().to_string(), row);
        self.calls.lock().push(key.clone());
        if self.failures.lock().contains(&key) {
            return Err(Error::task(format!("task of '{}' failed at row {:?}", key.0, row)));
        }
        Ok(self
            .answers
            .lock()
            .get(&key)
            .copied()
            .unwrap_or(TaskResult::Proceed))
    }
}
