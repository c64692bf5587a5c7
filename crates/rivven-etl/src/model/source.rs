//! Scenario sources

use std::sync::Arc;

use super::dataset::DataSet;
use super::{ConnectorRef, InlineTask};
use crate::types::Value;

/// Default logical connection name for sources
pub const DEFAULT_SOURCE_CONNECTION: &str = "source";

/// A named data origin
#[derive(Debug, Clone)]
pub struct Source {
    /// Source name, referenced by destinations
    pub name: String,
    /// Raw SQL query
    pub sql: Option<String>,
    /// Connector delegated to instead of SQL
    pub connector: Option<ConnectorRef>,
    /// Logical connection name
    pub connection: String,
    /// Inline tasks run before the fetch and once per row
    pub tasks: Vec<InlineTask>,
    /// Key fields of the extracted data set
    pub key_fields: Vec<String>,
    /// Count rows and forward them instead of retaining them
    pub stream: bool,
    /// Log extraction failures and leave the data set empty
    pub ignore_exception: bool,
    /// Record the query and connector side effects with the transaction monitor
    pub use_transaction_monitor: bool,
    /// Reuse the registry's cached connection instead of opening a transient one
    pub reuse_connection: bool,
    /// Row cap passed to connectors
    pub max_rows: Option<usize>,
    /// Positional statement parameters
    pub params: Vec<Value>,
    /// Extracted data; `None` until something was extracted
    pub data_set: Option<Arc<DataSet>>,
}

impl Source {
    /// Create a source with no SQL and no connector
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: None,
            connector: None,
            connection: DEFAULT_SOURCE_CONNECTION.to_string(),
            tasks: Vec::new(),
            key_fields: Vec::new(),
            stream: false,
            ignore_exception: false,
            use_transaction_monitor: false,
            reuse_connection: true,
            max_rows: None,
            params: Vec::new(),
            data_set: None,
        }
    }

    /// SQL-backed source
    pub fn sql(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::new(name).with_sql(sql)
    }

    /// Set the query
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Delegate to a connector
    pub fn with_connector(mut self, connector: ConnectorRef) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use a different logical connection
    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// Add an inline task
    pub fn with_task(mut self, task: InlineTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Stream rows
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    /// Swallow extraction errors
    pub fn ignoring_exceptions(mut self) -> Self {
        self.ignore_exception = true;
        self
    }

    /// Register side effects with the transaction monitor
    pub fn monitored(mut self) -> Self {
        self.use_transaction_monitor = true;
        self
    }

    /// Open a transient connection released after extraction
    pub fn transient_connection(mut self) -> Self {
        self.reuse_connection = false;
        self
    }

    /// Whether the source has anything to extract
    pub fn has_input(&self) -> bool {
        self.sql.as_deref().is_some_and(|s| !s.trim().is_empty()) || self.connector.is_some()
    }
}
