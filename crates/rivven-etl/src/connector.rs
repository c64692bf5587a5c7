//! Connector contract for non-SQL sources and destinations
//!
//! A [`DataSetConnector`] fills a data set from some format (`populate`) or
//! writes one out (`persist`, or `inline_persist` row by row while a source
//! streams). Connectors report progress through a [`DataSetListener`], which
//! can veto records, and signal a reached row cap with
//! [`Error::MaxRowsExceeded`].

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::{DataSet, DataSetRecord, FieldDef};
use crate::monitor::TransactionMonitor;
use crate::result::EtlResult;
use crate::task::TaskResult;
use crate::types::Value;

/// Observer of data set population
#[async_trait]
pub trait DataSetListener: Send + Sync {
    /// Called once before the first record
    async fn before(&self, _data_set: &DataSet) -> Result<()> {
        Ok(())
    }

    /// Called once after the last record
    async fn after(&self, _data_set: &DataSet) -> Result<()> {
        Ok(())
    }

    /// Called for each record before it is added; may reject it or stop
    async fn add_record(
        &self,
        _data_set: &DataSet,
        _record: &DataSetRecord,
        _row: usize,
    ) -> Result<TaskResult> {
        Ok(TaskResult::Proceed)
    }

    /// Called for each field value of a record
    async fn add_field_value(&self, _field: &FieldDef, _value: &Value, _row: usize) -> Result<()> {
        Ok(())
    }
}

/// Parameters handed to connector operations
#[derive(Clone, Copy)]
pub struct ConnectorParams<'a> {
    /// Connector properties
    pub properties: &'a BTreeMap<String, String>,
    /// Statement or filter parameters
    pub params: &'a [Value],
    /// Row cap; exceeding it yields [`Error::MaxRowsExceeded`]
    pub max_rows: Option<usize>,
    /// Count records instead of retaining them
    pub stream: bool,
    /// Side-effect journal
    pub monitor: Option<&'a TransactionMonitor>,
    /// Progress observer
    pub listener: Option<&'a dyn DataSetListener>,
}

impl std::fmt::Debug for ConnectorParams<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorParams")
            .field("properties", &self.properties)
            .field("params", &self.params.len())
            .field("max_rows", &self.max_rows)
            .field("stream", &self.stream)
            .field("monitor", &self.monitor.map(TransactionMonitor::id))
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl<'a> ConnectorParams<'a> {
    /// Parameters with only properties set
    pub fn new(properties: &'a BTreeMap<String, String>) -> Self {
        Self {
            properties,
            params: &[],
            max_rows: None,
            stream: false,
            monitor: None,
            listener: None,
        }
    }

    /// Property by key
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Offer one record to the listener and add it to the data set
///
/// Returns the listener's decision. Rejected records are not added; with
/// `stream` set, accepted records are counted but not retained.
pub async fn push_record(
    params: &ConnectorParams<'_>,
    data_set: &mut DataSet,
    record: DataSetRecord,
) -> Result<TaskResult> {
    if let Some(limit) = params.max_rows {
        if data_set.record_count() >= limit {
            return Err(Error::MaxRowsExceeded { limit });
        }
    }

    let row = data_set.record_count();
    if let Some(listener) = params.listener {
        for field in data_set.fields() {
            if let Some(value) = record.get(field.index) {
                listener.add_field_value(field, value, row).await?;
            }
        }
        match listener.add_record(data_set, &record, row).await? {
            TaskResult::Proceed => {}
            other => return Ok(other),
        }
    }

    if params.stream {
        data_set.count_streamed_record();
    } else {
        data_set.add_record(record)?;
    }
    Ok(TaskResult::Proceed)
}

/// Pluggable populate/persist implementation for a data format
#[async_trait]
pub trait DataSetConnector: Send + Sync {
    /// Format key
    fn name(&self) -> &str;

    /// Fill a data set
    async fn populate(
        &self,
        params: &ConnectorParams<'_>,
        data_set: &mut DataSet,
        driver: Option<&dyn Driver>,
    ) -> Result<EtlResult>;

    /// Write a whole data set
    async fn persist(
        &self,
        params: &ConnectorParams<'_>,
        data_set: &DataSet,
        driver: Option<&dyn Driver>,
    ) -> Result<EtlResult>;

    /// Write one record as it arrives
    async fn inline_persist(
        &self,
        _params: &ConnectorParams<'_>,
        _data_set: &DataSet,
        _driver: Option<&dyn Driver>,
        _record: &DataSetRecord,
        _row: usize,
        _total_rows: usize,
    ) -> Result<EtlResult> {
        Ok(EtlResult::ok())
    }

    /// Called before the first `persist` or `inline_persist`
    async fn pre_persist(&self, _params: &ConnectorParams<'_>) -> Result<EtlResult> {
        Ok(EtlResult::ok())
    }

    /// Called after the last `persist` or `inline_persist`
    async fn post_persist(&self, _params: &ConnectorParams<'_>) -> Result<EtlResult> {
        Ok(EtlResult::ok())
    }

    /// Release resources
    async fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Probe the connection described by the properties
    async fn test_connection(&self, properties: &BTreeMap<String, String>) -> Result<String>;
}

/// Connectors selected by format key
#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn DataSetConnector>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<_> = self.connectors.keys().collect();
        keys.sort();
        f.debug_struct("ConnectorRegistry").field("connectors", &keys).finish()
    }
}

impl ConnectorRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connector under its name
    pub fn register(&mut self, connector: Arc<dyn DataSetConnector>) {
        self.connectors
            .insert(connector.name().to_lowercase(), connector);
    }

    /// Builder-style `register`
    pub fn with(mut self, connector: Arc<dyn DataSetConnector>) -> Self {
        self.register(connector);
        self
    }

    /// Connector by format key
    pub fn get(&self, key: &str) -> Result<Arc<dyn DataSetConnector>> {
        self.connectors
            .get(&key.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::connector(key, "no connector registered for this format"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SqlType;

    struct RejectOdd;

    #[async_trait]
    impl DataSetListener for RejectOdd {
        async fn add_record(
            &self,
            _data_set: &DataSet,
            record: &DataSetRecord,
            _row: usize,
        ) -> Result<TaskResult> {
            Ok(match record.get(0).and_then(Value::as_i64) {
                Some(n) if n % 2 == 1 => TaskResult::Reject,
                Some(n) if n >= 4 => TaskResult::Stop,
                _ => TaskResult::Proceed,
            })
        }
    }

    fn record(n: i32) -> DataSetRecord {
        DataSetRecord::new(vec![Value::Int32(n)])
    }

    #[tokio::test]
    async fn test_push_record_consults_listener() {
        let props = BTreeMap::new();
        let listener = RejectOdd;
        let params = ConnectorParams {
            listener: Some(&listener),
            ..ConnectorParams::new(&props)
        };
        let mut ds = DataSet::new("n").with_field("n", SqlType::Integer);

        assert_eq!(push_record(&params, &mut ds, record(0)).await.unwrap(), TaskResult::Proceed);
        assert_eq!(push_record(&params, &mut ds, record(1)).await.unwrap(), TaskResult::Reject);
        assert_eq!(push_record(&params, &mut ds, record(2)).await.unwrap(), TaskResult::Proceed);
        assert_eq!(push_record(&params, &mut ds, record(4)).await.unwrap(), TaskResult::Stop);
        assert_eq!(ds.record_count(), 2);
    }

    #[tokio::test]
    async fn test_push_record_enforces_max_rows() {
        let props = BTreeMap::new();
        let params = ConnectorParams {
            max_rows: Some(1),
            ..ConnectorParams::new(&props)
        };
        let mut ds = DataSet::new("n").with_field("n", SqlType::Integer);

        push_record(&params, &mut ds, record(0)).await.unwrap();
        let err = push_record(&params, &mut ds, record(2)).await.unwrap_err();
        assert!(matches!(err, Error::MaxRowsExceeded { limit: 1 }));
    }

    #[tokio::test]
    async fn test_streaming_counts_without_retaining() {
        let props = BTreeMap::new();
        let params = ConnectorParams {
            stream: true,
            ..ConnectorParams::new(&props)
        };
        let mut ds = DataSet::new("n").with_field("n", SqlType::Integer);
        push_record(&params, &mut ds, record(0)).await.unwrap();
        assert_eq!(ds.record_count(), 1);
        assert!(ds.records().is_empty());
    }

    #[test]
    fn test_unknown_connector() {
        let registry = ConnectorRegistry::new();
        let err = registry.get("xlsx").err().unwrap();
        assert!(err.to_string().contains("xlsx"));
    }
}
