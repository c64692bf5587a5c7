//! Source extraction
//!
//! The [`Extractor`] turns a [`Source`] into a [`DataSet`], either by running
//! its SQL on a logical connection or by delegating to a connector. Inline
//! tasks run once before the fetch and once per record; a
//! [`DataSetListener`] observes every accepted record.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::EtlConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::connector::{push_record, ConnectorParams, ConnectorRegistry, DataSetListener};
use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::{DataSet, DataSetRecord, FieldDef, Scenario, Source};
use crate::monitor::TransactionMonitor;
use crate::result::EtlResult;
use crate::task::{TaskExecutor, TaskResult, TaskTarget};
use crate::types::Value;

/// What became of a source
#[derive(Debug)]
pub enum ExtractOutcome {
    /// The source has neither SQL nor a connector
    Skipped,
    /// An inline task rejected the fetch
    Rejected,
    /// Rows were extracted; `stopped` marks a fetch ended early by a task,
    /// a listener or the row cap. A task stopping before the fetch yields an
    /// empty data set.
    Extracted {
        /// The extracted data, possibly empty
        data_set: DataSet,
        /// Whether the fetch ended before the source was exhausted
        stopped: bool,
    },
    /// Extraction failed and the source ignores exceptions
    Ignored {
        /// The swallowed error
        error: Error,
    },
    /// The connector returned a non-OK result
    ConnectorFailed(EtlResult),
}

impl ExtractOutcome {
    /// The extracted data set, if any
    pub fn data_set(&self) -> Option<&DataSet> {
        match self {
            Self::Extracted { data_set, .. } => Some(data_set),
            _ => None,
        }
    }

    /// Take the extracted data set, if any
    pub fn into_data_set(self) -> Option<DataSet> {
        match self {
            Self::Extracted { data_set, .. } => Some(data_set),
            _ => None,
        }
    }
}

/// Runs a source's inline tasks for each record before the wrapped listener
///
/// Tasks see the source row index, counting rejected rows too.
struct RowTasks<'a> {
    offered: AtomicUsize,
    config: &'a EtlConfig,
    scenario: &'a Scenario,
    source: &'a Source,
    tasks: &'a dyn TaskExecutor,
    inner: Option<&'a dyn DataSetListener>,
}

#[async_trait]
impl DataSetListener for RowTasks<'_> {
    async fn before(&self, data_set: &DataSet) -> Result<()> {
        match self.inner {
            Some(inner) => inner.before(data_set).await,
            None => Ok(()),
        }
    }

    async fn after(&self, data_set: &DataSet) -> Result<()> {
        match self.inner {
            Some(inner) => inner.after(data_set).await,
            None => Ok(()),
        }
    }

    async fn add_record(&self, data_set: &DataSet, record: &DataSetRecord, row: usize) -> Result<TaskResult> {
        let target = TaskTarget::Source(self.source);
        let offered = self.offered.fetch_add(1, Ordering::Relaxed);
        let answer = self
            .tasks
            .execute_inline_tasks(self.config, target, self.scenario, Some(offered))
            .await?;
        match (answer, self.inner) {
            (TaskResult::Proceed, Some(inner)) => inner.add_record(data_set, record, row).await,
            (answer, _) => Ok(answer),
        }
    }

    async fn add_field_value(&self, field: &FieldDef, value: &Value, row: usize) -> Result<()> {
        match self.inner {
            Some(inner) => inner.add_field_value(field, value, row).await,
            None => Ok(()),
        }
    }
}

/// Extracts sources through connections and connectors
#[derive(Debug, Clone)]
pub struct Extractor {
    connections: Arc<ConnectionRegistry>,
    connectors: Arc<ConnectorRegistry>,
    driver: Option<Arc<dyn Driver>>,
}

impl Extractor {
    /// Create an extractor
    pub fn new(connections: Arc<ConnectionRegistry>, connectors: Arc<ConnectorRegistry>) -> Self {
        Self {
            connections,
            connectors,
            driver: None,
        }
    }

    /// Driver attached to extracted data sets and passed to connectors
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Extract one source
    ///
    /// Errors propagate unless the source ignores exceptions, in which case
    /// the outcome is [`ExtractOutcome::Ignored`]. Zero rows yield an empty
    /// data set, not `None`.
    pub async fn extract(
        &self,
        config: &EtlConfig,
        scenario: &Scenario,
        source: &Source,
        monitor: Option<&TransactionMonitor>,
        tasks: &dyn TaskExecutor,
        listener: Option<&dyn DataSetListener>,
    ) -> Result<ExtractOutcome> {
        if !source.has_input() {
            debug!(source = %source.name, "Nothing to extract");
            return Ok(ExtractOutcome::Skipped);
        }

        match self.run(config, scenario, source, monitor, tasks, listener).await {
            Ok(outcome) => {
                match &outcome {
                    ExtractOutcome::Extracted { data_set, stopped } => info!(
                        source = %source.name,
                        records = data_set.record_count(),
                        stopped,
                        "Extracted source"
                    ),
                    other => info!(source = %source.name, outcome = ?other, "Source not extracted"),
                }
                Ok(outcome)
            }
            Err(error) if source.ignore_exception => {
                warn!(source = %source.name, error = %error, "Ignoring extraction failure");
                Ok(ExtractOutcome::Ignored { error })
            }
            Err(error) => Err(error),
        }
    }

    async fn run(
        &self,
        config: &EtlConfig,
        scenario: &Scenario,
        source: &Source,
        monitor: Option<&TransactionMonitor>,
        tasks: &dyn TaskExecutor,
        listener: Option<&dyn DataSetListener>,
    ) -> Result<ExtractOutcome> {
        let mut data_set = DataSet::new(source.name.clone());
        if let Some(driver) = &self.driver {
            data_set.set_driver(Arc::clone(driver));
        }

        let has_tasks = !source.tasks.is_empty();
        if has_tasks {
            match tasks
                .execute_inline_tasks(config, TaskTarget::Source(source), scenario, None)
                .await?
            {
                TaskResult::Proceed => {}
                TaskResult::Reject => return Ok(ExtractOutcome::Rejected),
                TaskResult::Stop => {
                    debug!(source = %source.name, "Inline task stopped the source before the fetch");
                    return Ok(ExtractOutcome::Extracted {
                        data_set,
                        stopped: true,
                    });
                }
            }
        }

        let row_tasks = RowTasks {
            offered: AtomicUsize::new(0),
            config,
            scenario,
            source,
            tasks,
            inner: listener,
        };
        let listener: Option<&dyn DataSetListener> = if has_tasks { Some(&row_tasks) } else { listener };
        let monitor = monitor.filter(|_| source.use_transaction_monitor);

        let stopped = match (&source.connector, &source.sql) {
            (Some(connector_ref), _) => {
                let connector = self.connectors.get(&connector_ref.key)?;
                let params = ConnectorParams {
                    properties: &connector_ref.properties,
                    params: &source.params,
                    max_rows: source.max_rows,
                    stream: source.stream,
                    monitor,
                    listener,
                };
                match connector
                    .populate(&params, &mut data_set, self.driver.as_deref())
                    .await
                {
                    Ok(result) if !result.is_ok() => return Ok(ExtractOutcome::ConnectorFailed(result)),
                    Ok(_) => false,
                    Err(Error::MaxRowsExceeded { limit }) => {
                        debug!(source = %source.name, limit, "Connector reached its row cap");
                        true
                    }
                    Err(e) => return Err(e),
                }
            }
            (None, Some(sql)) => {
                let conn = if source.reuse_connection {
                    self.connections.get(&source.connection).await?
                } else {
                    self.connections.open(&source.connection).await?
                };
                let fetched = Self::fetch(source, sql, conn.as_ref(), monitor, listener, &mut data_set).await;
                if !source.reuse_connection {
                    self.connections.release(&source.connection, conn).await;
                }
                fetched?
            }
            (None, None) => return Ok(ExtractOutcome::Skipped),
        };

        Ok(ExtractOutcome::Extracted {
            data_set,
            stopped,
        })
    }

    /// Run the query and push every row; returns whether the fetch stopped early
    async fn fetch(
        source: &Source,
        sql: &str,
        conn: &dyn Connection,
        monitor: Option<&TransactionMonitor>,
        listener: Option<&dyn DataSetListener>,
        data_set: &mut DataSet,
    ) -> Result<bool> {
        if let Some(monitor) = monitor {
            monitor.register_statement(source.connection.clone(), sql);
        }

        let mut rows = conn.query_stream(sql, &source.params).await?;
        for column in rows.columns() {
            data_set.add_field(FieldDef::from_column(column));
        }

        let properties = BTreeMap::new();
        let params = ConnectorParams {
            properties: &properties,
            params: &source.params,
            max_rows: source.max_rows,
            stream: source.stream,
            monitor,
            listener,
        };

        if let Some(listener) = listener {
            listener.before(data_set).await?;
        }
        let mut stopped = false;
        while let Some(row) = rows.next().await? {
            match push_record(&params, data_set, DataSetRecord::from(row)).await {
                Ok(TaskResult::Stop) => {
                    stopped = true;
                    break;
                }
                Ok(_) => {}
                Err(Error::MaxRowsExceeded { limit }) => {
                    debug!(source = %source.name, limit, "Row cap reached");
                    stopped = true;
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(listener) = listener {
            listener.after(data_set).await?;
        }
        Ok(stopped)
    }
}
