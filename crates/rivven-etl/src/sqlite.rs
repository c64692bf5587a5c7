//! SQLite backend built on rusqlite
//!
//! URLs: `sqlite::memory:`, `sqlite://relative/or/absolute/path.db`,
//! `sqlite:path.db`. Connection properties are applied as `PRAGMA`s.
//!
//! rusqlite is synchronous; statements run inline under a mutex, which keeps
//! one scenario's statements strictly ordered on its session.

use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::ToSql;

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, RowStream, VecRowStream};
use crate::error::{Error, Result};
use crate::types::{ColumnMetadata, Row, Value};

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        use rusqlite::types::Value as Sql;

        Ok(match self {
            Self::Null => ToSqlOutput::Owned(Sql::Null),
            Self::Bool(b) => ToSqlOutput::Owned(Sql::Integer(i64::from(*b))),
            Self::Int32(n) => ToSqlOutput::Owned(Sql::Integer(i64::from(*n))),
            Self::Int64(n) => ToSqlOutput::Owned(Sql::Integer(*n)),
            Self::Float64(n) => ToSqlOutput::Owned(Sql::Real(*n)),
            Self::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Self::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            other => ToSqlOutput::Owned(Sql::Text(other.to_string())),
        })
    }
}

fn from_value_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => Value::Int64(n),
        ValueRef::Real(n) => Value::Float64(n),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

fn type_name_of(value: &Value) -> &'static str {
    match value {
        Value::Int64(_) => "INTEGER",
        Value::Float64(_) => "REAL",
        Value::Bytes(_) => "BLOB",
        Value::Null => "",
        _ => "TEXT",
    }
}

fn map_error(e: rusqlite::Error, sql: &str) -> Error {
    if let rusqlite::Error::SqliteFailure(failure, msg) = &e {
        if failure.code == rusqlite::ErrorCode::ConstraintViolation {
            let message = msg.clone().unwrap_or_else(|| e.to_string());
            return Error::constraint(message, Some(sql.to_string()));
        }
    }
    Error::Query {
        message: e.to_string(),
        sql: Some(sql.to_string()),
        source: Some(Box::new(e)),
    }
}

/// A SQLite session
pub struct SqliteConnection {
    inner: Mutex<Option<rusqlite::Connection>>,
}

impl SqliteConnection {
    /// Open an in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()
            .map_err(|e| Error::connection_with_source("failed to open in-memory database", e))?;
        Ok(Self::from_rusqlite(conn))
    }

    /// Open a database file
    pub fn open(path: &str) -> Result<Self> {
        let conn = rusqlite::Connection::open(path)
            .map_err(|e| Error::connection_with_source(format!("failed to open '{}'", path), e))?;
        Ok(Self::from_rusqlite(conn))
    }

    fn from_rusqlite(conn: rusqlite::Connection) -> Self {
        Self {
            inner: Mutex::new(Some(conn)),
        }
    }

    fn with_conn<T>(&self, f: impl FnOnce(&rusqlite::Connection) -> Result<T>) -> Result<T> {
        let guard = self.inner.lock();
        let conn = guard
            .as_ref()
            .ok_or_else(|| Error::connection("connection is closed"))?;
        f(conn)
    }

    fn batch(&self, sql: &str) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch(sql).map_err(|e| map_error(e, sql)))
    }

    fn fetch(&self, sql: &str, params: &[Value]) -> Result<(Vec<ColumnMetadata>, Vec<Row>)> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql).map_err(|e| map_error(e, sql))?;
            let names: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
            let mut rows = stmt
                .query(rusqlite::params_from_iter(params.iter()))
                .map_err(|e| map_error(e, sql))?;

            let mut fetched = Vec::new();
            while let Some(row) = rows.next().map_err(|e| map_error(e, sql))? {
                let mut values = Vec::with_capacity(names.len());
                for idx in 0..names.len() {
                    let value = row.get_ref(idx).map_err(|e| map_error(e, sql))?;
                    values.push(from_value_ref(value));
                }
                fetched.push(Row::new(names.clone(), values));
            }

            // Column types follow the first non-null value of each column.
            let columns = names
                .iter()
                .enumerate()
                .map(|(idx, name)| {
                    let type_name = fetched
                        .iter()
                        .filter_map(|r| r.get(idx))
                        .find(|v| !v.is_null())
                        .map(type_name_of)
                        .unwrap_or("");
                    ColumnMetadata::new(name.clone(), type_name)
                })
                .collect();

            Ok((columns, fetched))
        })
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        Ok(self.fetch(sql, params)?.1)
    }

    async fn query_stream(&self, sql: &str, params: &[Value]) -> Result<Box<dyn RowStream>> {
        let (columns, rows) = self.fetch(sql, params)?;
        Ok(Box::new(VecRowStream::new(columns, rows)))
    }

    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.with_conn(|conn| {
            conn.execute(sql, rusqlite::params_from_iter(params.iter()))
                .map(|n| n as u64)
                .map_err(|e| map_error(e, sql))
        })
    }

    async fn execute_script(&self, sql: &str) -> Result<()> {
        self.batch(sql)
    }

    async fn begin(&self) -> Result<()> {
        self.batch("BEGIN")
    }

    async fn commit(&self) -> Result<()> {
        self.batch("COMMIT")
    }

    async fn rollback(&self) -> Result<()> {
        self.batch("ROLLBACK")
    }

    async fn savepoint(&self, name: &str) -> Result<()> {
        self.batch(&format!("SAVEPOINT \"{}\"", name))
    }

    async fn rollback_to_savepoint(&self, name: &str) -> Result<()> {
        self.batch(&format!("ROLLBACK TO SAVEPOINT \"{}\"", name))
    }

    async fn release_savepoint(&self, name: &str) -> Result<()> {
        self.batch(&format!("RELEASE SAVEPOINT \"{}\"", name))
    }

    async fn is_valid(&self) -> bool {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(|e| map_error(e, "SELECT 1"))
        })
        .is_ok()
    }

    async fn close(&self) -> Result<()> {
        let conn = self.inner.lock().take();
        if let Some(conn) = conn {
            conn.close()
                .map_err(|(_, e)| Error::connection_with_source("failed to close connection", e))?;
        }
        Ok(())
    }
}

/// Opens [`SqliteConnection`]s from `sqlite:` URLs
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnectionFactory;

impl SqliteConnectionFactory {
    fn path_of(url: &str) -> &str {
        let rest = url
            .strip_prefix("sqlite:")
            .or_else(|| url.strip_prefix("sqlite3:"))
            .unwrap_or(url);
        rest.strip_prefix("//").unwrap_or(rest)
    }
}

#[async_trait]
impl ConnectionFactory for SqliteConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let path = Self::path_of(&config.url);
        let conn = if path.is_empty() || path == ":memory:" {
            SqliteConnection::open_in_memory()?
        } else {
            SqliteConnection::open(path)?
        };

        for (key, value) in &config.properties {
            if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                return Err(Error::config(format!("invalid pragma name '{}'", key)));
            }
            conn.batch(&format!("PRAGMA {} = '{}'", key, value.replace('\'', "''")))?;
        }

        Ok(Box::new(conn))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[test]
    fn test_path_of() {
        assert_eq!(SqliteConnectionFactory::path_of("sqlite::memory:"), ":memory:");
        assert_eq!(SqliteConnectionFactory::path_of("sqlite://data/etl.db"), "data/etl.db");
        assert_eq!(SqliteConnectionFactory::path_of("sqlite:etl.db"), "etl.db");
    }

    #[tokio::test]
    async fn test_query_and_execute() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_script("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, photo BLOB)")
            .await
            .unwrap();
        let affected = conn
            .execute(
                "INSERT INTO t VALUES (?, ?, ?)",
                &[Value::Int32(1), Value::from("Ann"), Value::Bytes(vec![7, 8])],
            )
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let mut stream = conn.query_stream("SELECT * FROM t", &[]).await.unwrap();
        assert_eq!(stream.columns()[2].type_name, "BLOB");
        let row = stream.next().await.unwrap().unwrap();
        assert_eq!(row.get_by_name("name"), Some(&Value::from("Ann")));
        assert_eq!(row.get(2), Some(&Value::Bytes(vec![7, 8])));
    }

    #[tokio::test]
    async fn test_constraint_errors_are_classified() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_script("CREATE TABLE t (id INTEGER PRIMARY KEY)")
            .await
            .unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();

        let err = conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Constraint);
        assert_eq!(err.sql(), Some("INSERT INTO t VALUES (1)"));
    }

    #[tokio::test]
    async fn test_savepoint_rollback() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        conn.execute_script("CREATE TABLE t (id INTEGER)").await.unwrap();
        conn.begin().await.unwrap();
        conn.execute("INSERT INTO t VALUES (1)", &[]).await.unwrap();
        conn.savepoint("sp1").await.unwrap();
        conn.execute("INSERT INTO t VALUES (2)", &[]).await.unwrap();
        conn.rollback_to_savepoint("sp1").await.unwrap();
        conn.release_savepoint("sp1").await.unwrap();
        conn.commit().await.unwrap();

        let rows = conn.query("SELECT id FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let conn = SqliteConnection::open_in_memory().unwrap();
        assert!(conn.is_valid().await);
        conn.close().await.unwrap();
        assert!(!conn.is_valid().await);
        assert!(conn.execute("SELECT 1", &[]).await.is_err());
    }
}
