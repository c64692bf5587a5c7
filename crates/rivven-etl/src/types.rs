//! Value types for rivven-etl
//!
//! - `Value`: a single database value as extracted from a source or bound to a statement
//! - `SqlType`: the logical SQL type of a data set field
//! - `Row` / `ColumnMetadata`: query results as returned by a connection

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// SQL value type that can hold any extracted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean value
    Bool(bool),
    /// 32-bit signed integer (INTEGER)
    Int32(i32),
    /// 64-bit signed integer (BIGINT)
    Int64(i64),
    /// 64-bit floating point (DOUBLE PRECISION)
    Float64(f64),
    /// Arbitrary precision decimal (NUMERIC, DECIMAL)
    Decimal(Decimal),
    /// Text string (VARCHAR, TEXT, CLOB)
    String(String),
    /// Binary data (BLOB, BYTEA, VARBINARY)
    Bytes(Vec<u8>),
    /// Date without time (DATE)
    Date(NaiveDate),
    /// Time without date (TIME)
    Time(NaiveTime),
    /// Timestamp without timezone (TIMESTAMP)
    DateTime(NaiveDateTime),
    /// UUID
    Uuid(Uuid),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> SqlType {
        match self {
            Self::Null => SqlType::Other,
            Self::Bool(_) => SqlType::Boolean,
            Self::Int32(_) => SqlType::Integer,
            Self::Int64(_) => SqlType::BigInt,
            Self::Float64(_) => SqlType::Double,
            Self::Decimal(_) => SqlType::Numeric,
            Self::String(_) => SqlType::Varchar,
            Self::Bytes(_) => SqlType::Blob,
            Self::Date(_) => SqlType::Date,
            Self::Time(_) => SqlType::Time,
            Self::DateTime(_) => SqlType::Timestamp,
            Self::Uuid(_) => SqlType::Varchar,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to borrow as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Convert to owned string representation (None for NULL and binary)
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null | Self::Bytes(_) => None,
            Self::String(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    /// Parse a textual value into the given SQL type.
    ///
    /// Used for literal variable values declared in a scenario. Values that do
    /// not parse for the requested type are kept as strings.
    pub fn parse_as(text: &str, sql_type: SqlType) -> Self {
        let trimmed = text.trim();
        match sql_type {
            SqlType::Integer | SqlType::SmallInt => trimmed
                .parse::<i32>()
                .map(Self::Int32)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            SqlType::BigInt => trimmed
                .parse::<i64>()
                .map(Self::Int64)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            SqlType::Double | SqlType::Real => trimmed
                .parse::<f64>()
                .map(Self::Float64)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            SqlType::Numeric => trimmed
                .parse::<Decimal>()
                .map(Self::Decimal)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            SqlType::Boolean => Self::String(text.to_string())
                .as_bool()
                .map(Self::Bool)
                .unwrap_or_else(|| Self::String(text.to_string())),
            SqlType::Date => NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
                .map(Self::Date)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            SqlType::Timestamp => NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S")
                .map(Self::DateTime)
                .unwrap_or_else(|_| Self::String(text.to_string())),
            _ => Self::String(text.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int32(n) => write!(f, "{}", n),
            Self::Int64(n) => write!(f, "{}", n),
            Self::Float64(n) => write!(f, "{}", n),
            Self::Decimal(d) => write!(f, "{}", d),
            Self::String(s) => write!(f, "{}", s),
            Self::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Self::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
            Self::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Self::Uuid(u) => write!(f, "{}", u),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Self::Date(v)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// Logical SQL type of a data set field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum SqlType {
    Varchar,
    Char,
    SmallInt,
    Integer,
    BigInt,
    Numeric,
    Real,
    Double,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Blob,
    Clob,
    #[default]
    Other,
}

impl SqlType {
    /// Map a vendor type name (as reported by a driver) to a logical type
    pub fn from_type_name(name: &str) -> Self {
        let upper = name.trim().to_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "VARCHAR" | "VARCHAR2" | "NVARCHAR" | "TEXT" | "STRING" | "CHARACTER VARYING" => {
                Self::Varchar
            }
            "CHAR" | "NCHAR" | "CHARACTER" => Self::Char,
            "SMALLINT" | "TINYINT" | "INT2" => Self::SmallInt,
            "INT" | "INTEGER" | "INT4" | "MEDIUMINT" => Self::Integer,
            "BIGINT" | "INT8" => Self::BigInt,
            "NUMERIC" | "DECIMAL" | "NUMBER" => Self::Numeric,
            "REAL" | "FLOAT4" => Self::Real,
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "FLOAT8" => Self::Double,
            "BOOLEAN" | "BOOL" | "BIT" => Self::Boolean,
            "DATE" => Self::Date,
            "TIME" => Self::Time,
            "TIMESTAMP" | "DATETIME" | "TIMESTAMPTZ" => Self::Timestamp,
            "BINARY" | "VARBINARY" => Self::Binary,
            "BLOB" | "BYTEA" | "LONGBLOB" | "IMAGE" => Self::Blob,
            "CLOB" | "NCLOB" | "LONGTEXT" => Self::Clob,
            _ => Self::Other,
        }
    }

    /// Binary large object
    #[inline]
    pub const fn is_blob(self) -> bool {
        matches!(self, Self::Blob)
    }

    /// Character large object
    #[inline]
    pub const fn is_clob(self) -> bool {
        matches!(self, Self::Clob)
    }

    /// Numeric types are rendered without quotes
    #[inline]
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            Self::SmallInt | Self::Integer | Self::BigInt | Self::Numeric | Self::Real | Self::Double
        )
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name (case-insensitive)
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Take ownership of the values
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

/// Column metadata reported with a result set
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// SQL type name (vendor-specific, may be empty for expressions)
    pub type_name: String,
    /// Whether column is nullable
    pub nullable: bool,
}

impl ColumnMetadata {
    /// Create basic column metadata
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            nullable: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::String("yes".into()).as_bool(), Some(true));
        assert_eq!(Value::Int32(42).as_i64(), Some(42));
        assert_eq!(Value::String(" 7 ".into()).as_i64(), Some(7));
        assert_eq!(Value::Float64(1.5).as_f64(), Some(1.5));
        assert_eq!(Value::Null.as_string(), None);
        assert_eq!(Value::Int64(3).as_string(), Some("3".into()));
    }

    #[test]
    fn test_parse_as() {
        assert_eq!(Value::parse_as("12", SqlType::Integer), Value::Int32(12));
        assert_eq!(Value::parse_as("abc", SqlType::Integer), Value::String("abc".into()));
        assert_eq!(
            Value::parse_as("2024-02-29", SqlType::Date),
            Value::Date(NaiveDate::from_ymd_opt(2024, 2, 29).unwrap())
        );
        assert_eq!(Value::parse_as("true", SqlType::Boolean), Value::Bool(true));
    }

    #[test]
    fn test_sql_type_from_type_name() {
        assert_eq!(SqlType::from_type_name("varchar(20)"), SqlType::Varchar);
        assert_eq!(SqlType::from_type_name("INTEGER"), SqlType::Integer);
        assert_eq!(SqlType::from_type_name("bytea"), SqlType::Blob);
        assert_eq!(SqlType::from_type_name("CLOB"), SqlType::Clob);
        assert_eq!(SqlType::from_type_name(""), SqlType::Other);
        assert!(SqlType::Blob.is_blob());
        assert!(SqlType::Clob.is_clob());
        assert!(SqlType::Numeric.is_numeric());
    }

    #[test]
    fn test_row_lookup_is_case_insensitive() {
        let row = Row::new(
            vec!["id".into(), "name".into()],
            vec![Value::Int32(1), Value::String("Alice".into())],
        );

        assert_eq!(row.len(), 2);
        assert_eq!(row.get_by_name("NAME"), Some(&Value::String("Alice".into())));
        assert_eq!(row.get_by_name("missing"), None);
    }
}
