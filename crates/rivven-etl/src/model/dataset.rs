//! In-memory data sets produced by extraction and consumed by code generation

use std::collections::HashMap;
use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Row, SqlType, Value};

/// One column descriptor of a data set
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDef {
    /// Field name
    pub name: String,
    /// Logical SQL type
    pub sql_type: SqlType,
    /// Vendor type name as reported by the source
    pub native_type: Option<String>,
    /// Position in the data set (0-based)
    pub index: usize,
    /// Whether the field accepts NULL
    pub nullable: bool,
}

impl FieldDef {
    /// Create a nullable field descriptor
    pub fn new(name: impl Into<String>, sql_type: SqlType) -> Self {
        Self {
            name: name.into(),
            sql_type,
            native_type: None,
            index: 0,
            nullable: true,
        }
    }

    /// Build a field from result-set column metadata
    pub fn from_column(column: &ColumnMetadata) -> Self {
        Self {
            name: column.name.clone(),
            sql_type: SqlType::from_type_name(&column.type_name),
            native_type: (!column.type_name.is_empty()).then(|| column.type_name.clone()),
            index: 0,
            nullable: column.nullable,
        }
    }

    /// Binary large object field
    #[inline]
    pub fn is_blob(&self) -> bool {
        self.sql_type.is_blob()
    }

    /// Character large object field
    #[inline]
    pub fn is_clob(&self) -> bool {
        self.sql_type.is_clob()
    }

    /// Either kind of large object
    #[inline]
    pub fn is_lob(&self) -> bool {
        self.is_blob() || self.is_clob()
    }
}

/// One row of a data set
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DataSetRecord {
    values: Vec<Value>,
}

impl DataSetRecord {
    /// Create a record from values in field order
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Value at a field index
    #[inline]
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// All values in field order
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Replace the value at a field index
    pub fn set(&mut self, index: usize, value: Value) {
        if index >= self.values.len() {
            self.values.resize(index + 1, Value::Null);
        }
        self.values[index] = value;
    }
}

impl From<Row> for DataSetRecord {
    fn from(row: Row) -> Self {
        Self::new(row.into_values())
    }
}

/// Ordered, named collection of fields and records
#[derive(Debug, Clone, Default)]
pub struct DataSet {
    /// Data set name (usually the source name)
    pub name: String,
    fields: Vec<FieldDef>,
    field_index: HashMap<String, usize>,
    records: Vec<DataSetRecord>,
    record_count: usize,
    driver: Option<Arc<dyn Driver>>,
}

impl DataSet {
    /// Create an empty data set
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Attach the driver used to format values
    pub fn with_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the driver used to format values
    pub fn set_driver(&mut self, driver: Arc<dyn Driver>) {
        self.driver = Some(driver);
    }

    /// Driver used to format values, if any
    pub fn driver(&self) -> Option<&Arc<dyn Driver>> {
        self.driver.as_ref()
    }

    /// Append a field; its index is assigned from its position
    pub fn add_field(&mut self, mut field: FieldDef) {
        field.index = self.fields.len();
        self.field_index
            .insert(field.name.to_lowercase(), field.index);
        self.fields.push(field);
    }

    /// Builder-style `add_field`
    pub fn with_field(mut self, name: impl Into<String>, sql_type: SqlType) -> Self {
        self.add_field(FieldDef::new(name, sql_type));
        self
    }

    /// Fields in order
    #[inline]
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }

    /// Look up a field by name (case-insensitive)
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.field_index
            .get(&name.to_lowercase())
            .and_then(|idx| self.fields.get(*idx))
    }

    /// Whether any field is a BLOB or CLOB
    pub fn has_lobs(&self) -> bool {
        self.fields.iter().any(FieldDef::is_lob)
    }

    /// Append a record; it must have one value per field
    pub fn add_record(&mut self, record: DataSetRecord) -> Result<()> {
        if record.values().len() != self.fields.len() {
            return Err(Error::validation(format!(
                "data set '{}' expects {} values per record, got {}",
                self.name,
                self.fields.len(),
                record.values().len()
            )));
        }
        self.records.push(record);
        self.record_count += 1;
        Ok(())
    }

    /// Builder-style `add_record` for fixtures
    pub fn with_record(mut self, values: Vec<Value>) -> Result<Self> {
        self.add_record(DataSetRecord::new(values))?;
        Ok(self)
    }

    /// Count a record that was streamed and not retained
    pub fn count_streamed_record(&mut self) {
        self.record_count += 1;
    }

    /// Retained records
    #[inline]
    pub fn records(&self) -> &[DataSetRecord] {
        &self.records
    }

    /// Record at a row index
    #[inline]
    pub fn record(&self, row: usize) -> Option<&DataSetRecord> {
        self.records.get(row)
    }

    /// Number of records seen, including streamed ones
    #[inline]
    pub fn record_count(&self) -> usize {
        self.record_count
    }

    /// Value of a named field in a row
    pub fn value(&self, row: usize, field: &str) -> Option<&Value> {
        let field = self.field(field)?;
        self.records.get(row)?.get(field.index)
    }

    /// Drop all records but keep the fields
    pub fn clear_records(&mut self) {
        self.records.clear();
        self.record_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn people() -> DataSet {
        DataSet::new("people")
            .with_field("id", SqlType::Integer)
            .with_field("name", SqlType::Varchar)
            .with_field("photo", SqlType::Blob)
            .with_record(vec![
                Value::Int32(1),
                Value::from("Ann"),
                Value::Bytes(vec![1, 2]),
            ])
            .unwrap()
    }

    #[test]
    fn test_field_indexes_follow_insertion_order() {
        let ds = people();
        assert_eq!(ds.fields().len(), 3);
        assert_eq!(ds.field("NAME").unwrap().index, 1);
        assert!(ds.field("photo").unwrap().is_blob());
        assert!(ds.has_lobs());
    }

    #[test]
    fn test_value_lookup() {
        let ds = people();
        assert_eq!(ds.value(0, "name"), Some(&Value::from("Ann")));
        assert_eq!(ds.value(1, "name"), None);
        assert_eq!(ds.record_count(), 1);
    }

    #[test]
    fn test_record_arity_is_validated() {
        let mut ds = people();
        let err = ds
            .add_record(DataSetRecord::new(vec![Value::Int32(2)]))
            .unwrap_err();
        assert!(err.to_string().contains("expects 3 values"));
    }

    #[test]
    fn test_streamed_records_are_counted_not_retained() {
        let mut ds = DataSet::new("s").with_field("id", SqlType::Integer);
        ds.count_streamed_record();
        ds.count_streamed_record();
        assert_eq!(ds.record_count(), 2);
        assert!(ds.records().is_empty());
    }
}
