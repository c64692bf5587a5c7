//! Dialect capability contract
//!
//! A [`Driver`] produces every piece of dialect-specific SQL the code
//! generator emits and answers the feature questions that decide how a
//! destination is executed. Drivers hold configuration only; every method is
//! a pure function of its inputs.
//!
//! Three dialects are built in:
//! - [`SqliteDriver`]: statement by statement, no procedural blocks
//! - [`PostgresDriver`]: anonymous `DO` blocks, cursors, savepoint-required recovery
//! - [`MySqlDriver`]: stored procedures created, called and dropped per script unit

mod mysql;
mod postgres;
mod sqlite;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use sea_query::{Alias, Expr, IntoIden, SimpleExpr, TableRef};

use crate::error::{Error, Result};
use crate::model::{FieldDef, OnExceptionAction};
use crate::types::{SqlType, Value};

pub use mysql::MySqlDriver;
pub use postgres::PostgresDriver;
pub use sqlite::SqliteDriver;

/// Default maximum number of lines in one script unit
pub const DEFAULT_LINES_LIMIT: usize = 1000;

/// Static driver configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    /// Maximum number of lines in one script unit
    pub lines_limit: usize,
    /// Overrides the dialect's default for binary values inside procedures
    pub supports_binary_in_proc: Option<bool>,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            lines_limit: DEFAULT_LINES_LIMIT,
            supports_binary_in_proc: None,
        }
    }
}

impl DriverOptions {
    /// Set the line limit (0 is treated as 1)
    pub fn with_lines_limit(mut self, lines: usize) -> Self {
        self.lines_limit = lines.max(1);
        self
    }
}

/// Statement shape handed to the statement templates
#[derive(Debug, Clone, Copy)]
pub struct StatementParts<'a> {
    /// Target table, optionally `schema.table`
    pub table: &'a str,
    /// Column names
    pub columns: &'a [String],
    /// Rendered value expressions, one per column
    pub values: &'a [String],
    /// Key columns (subset of `columns`)
    pub keys: &'a [String],
}

impl StatementParts<'_> {
    fn check(&self) -> Result<()> {
        if self.columns.len() != self.values.len() {
            return Err(Error::internal(format!(
                "{} columns but {} values for '{}'",
                self.columns.len(),
                self.values.len(),
                self.table
            )));
        }
        Ok(())
    }

    fn value_of(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|idx| self.values.get(idx))
            .map(String::as_str)
    }

    fn is_key(&self, column: &str) -> bool {
        self.keys.iter().any(|k| k.eq_ignore_ascii_case(column))
    }

    fn key_value(&self, key: &str) -> Result<&str> {
        self.value_of(key).ok_or_else(|| {
            Error::validation(format!(
                "key field '{}' is not part of the statement for '{}'",
                key, self.table
            ))
        })
    }
}

/// Dialect capability contract consumed by the code generator
pub trait Driver: Send + Sync + fmt::Debug {
    /// Registry key of the dialect
    fn name(&self) -> &'static str;

    /// Static configuration
    fn options(&self) -> &DriverOptions;

    /// Quote an identifier
    fn quote_identifier(&self, name: &str) -> String;

    /// Native column type for a field
    fn native_type(&self, sql_type: SqlType) -> String;

    /// Render a binary literal
    fn binary_literal(&self, bytes: &[u8]) -> String {
        format!("X'{}'", hex(bytes))
    }

    /// Render a boolean literal
    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    /// Render a value as a SQL literal for a column of the given type
    fn format_value(&self, value: &Value, sql_type: SqlType) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.boolean_literal(*b).to_string(),
            Value::Int32(_) | Value::Int64(_) | Value::Float64(_) | Value::Decimal(_) => {
                value.to_string()
            }
            Value::Bytes(bytes) => self.binary_literal(bytes),
            Value::String(s) if sql_type.is_numeric() && s.trim().parse::<f64>().is_ok() => {
                s.trim().to_string()
            }
            other => quote_literal(&other.to_string()),
        }
    }

    /// INSERT statement
    fn insert_sql(&self, parts: &StatementParts<'_>) -> Result<String>;

    /// UPDATE statement setting the non-key columns by key
    fn update_sql(&self, parts: &StatementParts<'_>) -> Result<String>;

    /// Upsert statement by key
    fn merge_sql(&self, parts: &StatementParts<'_>) -> Result<String>;

    /// DELETE statement by key
    fn delete_sql(&self, parts: &StatementParts<'_>) -> Result<String>;

    /// Opens the declare section of a procedural block
    fn declare_section_start(&self) -> String {
        String::new()
    }

    /// Dialect declare fragment emitted after variable declarations
    fn declare(&self) -> String {
        String::new()
    }

    /// Variable declaration
    fn declare_variable(&self, name: &str, sql_type: SqlType) -> String {
        format!("{} {};", name, self.native_type(sql_type))
    }

    /// Variable assignment
    fn assign_variable(&self, name: &str, expr: &str) -> String {
        format!("{} := {};", name, expr)
    }

    /// Declaration of the record variable a cursor loop fetches into
    fn declare_cursor_variable(&self, _name: &str) -> Option<String> {
        None
    }

    /// Cursor declaration
    fn declare_cursor(&self, _name: &str, _sql: &str) -> Option<String> {
        None
    }

    /// Closes the cursor declarations
    fn declare_cursor_end(&self) -> String {
        String::new()
    }

    /// Opens a cursor loop
    fn cursor_loop_start(&self, _variable: &str, _cursor: &str) -> Option<String> {
        None
    }

    /// Closes a cursor loop
    fn cursor_loop_end(&self) -> String {
        String::new()
    }

    /// Expression reading a field of the cursor record
    fn cursor_field(&self, variable: &str, field: &str) -> String {
        format!("{}.{}", variable, self.quote_identifier(field))
    }

    /// Conditional statement; `None` when the dialect has no procedural IF
    fn conditional(&self, _condition: &str, _then: &str, _otherwise: Option<&str>) -> Option<String> {
        None
    }

    /// Opens a single-unit script
    fn begin(&self) -> String {
        String::new()
    }

    /// Closes a single-unit script
    fn end(&self) -> String {
        String::new()
    }

    /// Opens one unit of a split script
    fn begin_split(&self) -> String {
        self.begin()
    }

    /// Closes one unit of a split script
    fn end_split(&self) -> String {
        self.end()
    }

    /// DROP TABLE statement
    fn drop_table_sql(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote_table(table))
    }

    /// CREATE TABLE statement from data set fields
    fn create_table_sql(&self, table: &str, fields: &[FieldDef]) -> String {
        let columns = fields
            .iter()
            .map(|f| {
                let ty = f
                    .native_type
                    .clone()
                    .unwrap_or_else(|| self.native_type(f.sql_type));
                format!("{} {}", self.quote_identifier(&f.name), ty)
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("CREATE TABLE {} ({})", self.quote_table(table), columns)
    }

    /// Quote a possibly schema-qualified table name
    fn quote_table(&self, table: &str) -> String {
        table
            .split('.')
            .map(|part| self.quote_identifier(part))
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Wrap a script unit in a stored procedure
    fn create_procedure_sql(&self, _name: &str, _body: &str) -> Result<String> {
        Err(Error::unsupported(format!(
            "{} has no stored procedures",
            self.name()
        )))
    }

    /// Call a stored procedure
    fn call_procedure_sql(&self, name: &str) -> String {
        format!("CALL {}()", name)
    }

    /// Drop a stored procedure
    fn drop_procedure_sql(&self, name: &str) -> String {
        format!("DROP PROCEDURE IF EXISTS {}", name)
    }

    /// Procedure name for one script unit
    fn procedure_name(&self, scenario: &str, destination: &str, unit: usize) -> String {
        format!(
            "etl_{}_{}_{}",
            sanitize_identifier(scenario),
            sanitize_identifier(destination),
            unit
        )
    }

    /// Opens an exception-guarded block
    fn on_exception_begin(&self) -> String {
        String::new()
    }

    /// Exception handler for the action; `merge_sql` is the fallback update
    fn on_exception_body(&self, _action: OnExceptionAction, _merge_sql: Option<&str>) -> String {
        String::new()
    }

    /// Closes an exception-guarded block
    fn on_exception_end(&self) -> String {
        String::new()
    }

    /// Whether the handler precedes the guarded statement
    fn on_exception_handler_first(&self) -> bool {
        false
    }

    /// Marker opening a row block in statement-by-statement scripts
    fn block_begin_marker(&self, destination: &str, row: usize) -> String {
        format!("{} {} {}", BLOCK_BEGIN_MARKER, destination, row)
    }

    /// Marker closing a row block in statement-by-statement scripts
    fn block_end_marker(&self, destination: &str, row: usize) -> String {
        format!("{} {} {}", BLOCK_END_MARKER, destination, row)
    }

    /// Script units can run as one callable statement
    fn supports_callable_statement(&self) -> bool;

    /// Procedural blocks run without creating a procedure
    fn supports_anonymous_blocks(&self) -> bool;

    /// Dialect default for binary values inside procedures
    fn default_binary_in_proc(&self) -> bool {
        false
    }

    /// Binary values may be inlined in procedural blocks
    fn supports_binary_in_proc(&self) -> bool {
        self.options()
            .supports_binary_in_proc
            .unwrap_or_else(|| self.default_binary_in_proc())
    }

    /// A failed statement aborts the transaction until rolled back
    fn requires_rollback_after_sql_error(&self) -> bool {
        false
    }

    /// Variables can be declared and assigned inside blocks
    fn supports_params_in_anonymous_blocks(&self) -> bool;

    /// Server-side cursors are available
    fn supports_cursors(&self) -> bool {
        false
    }

    /// Maximum number of lines in one script unit
    fn lines_limit(&self) -> usize {
        self.options().lines_limit.max(1)
    }

    /// Statement terminator
    fn statement_delimiter(&self) -> &'static str {
        ";"
    }

    /// Positional parameter placeholder (1-based)
    fn parameter_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    /// Pattern extracting a line number from an error message
    fn error_line_pattern(&self) -> Option<&Regex> {
        None
    }

    /// Best-effort line number from an error message
    fn error_line(&self, message: &str) -> Option<usize> {
        self.error_line_pattern()?
            .captures(message)?
            .get(1)?
            .as_str()
            .parse()
            .ok()
    }

    /// Bind a binary value at a 1-based parameter position
    fn set_blob(&self, params: &mut Vec<Value>, position: usize, data: &[u8]) {
        bind_at(params, position, Value::Bytes(data.to_vec()));
    }

    /// Bind a character value at a 1-based parameter position
    fn set_clob(&self, params: &mut Vec<Value>, position: usize, data: &str) {
        bind_at(params, position, Value::String(data.to_string()));
    }
}

/// Marker prefix opening a row block
pub const BLOCK_BEGIN_MARKER: &str = "-- etl:begin";

/// Marker prefix closing a row block
pub const BLOCK_END_MARKER: &str = "-- etl:end";

fn bind_at(params: &mut Vec<Value>, position: usize, value: Value) {
    let idx = position.saturating_sub(1);
    if idx >= params.len() {
        params.resize(idx + 1, Value::Null);
    }
    params[idx] = value;
}

/// Quote a string literal, doubling single quotes
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect()
}

/// Replace characters that are not valid in an unquoted identifier
pub fn sanitize_identifier(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/// Build a sea-query table reference from `table` or `schema.table`
pub(crate) fn sea_table_ref(table: &str) -> TableRef {
    match table.split_once('.') {
        Some((schema, name)) => {
            TableRef::SchemaTable(Alias::new(schema).into_iden(), Alias::new(name).into_iden())
        }
        None => TableRef::Table(Alias::new(table).into_iden()),
    }
}

/// Raw value expressions for sea-query
pub(crate) fn value_exprs(values: &[String]) -> Vec<SimpleExpr> {
    values.iter().map(|v| Expr::cust(v.as_str())).collect()
}

/// Shared sea-query rendering of the four statement templates
pub(crate) mod templates {
    use sea_query::{Alias, Expr, OnConflict, Query, QueryBuilder, SimpleExpr};

    use super::{sea_table_ref, value_exprs, StatementParts};
    use crate::error::{Error, Result};

    pub(crate) fn insert<B: QueryBuilder>(parts: &StatementParts<'_>, builder: B) -> Result<String> {
        parts.check()?;
        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(parts.table))
            .columns(parts.columns.iter().map(|c| Alias::new(c.as_str())))
            .values(value_exprs(parts.values))
            .map_err(|e| Error::internal(format!("insert for '{}': {:?}", parts.table, e)))?;
        Ok(stmt.to_string(builder))
    }

    pub(crate) fn update<B: QueryBuilder>(
        parts: &StatementParts<'_>,
        builder: B,
        quote: impl Fn(&str) -> String,
    ) -> Result<String> {
        parts.check()?;
        require_keys(parts, "update")?;
        let mut stmt = Query::update();
        stmt.table(sea_table_ref(parts.table));
        let mut assigned = 0;
        for (col, val) in parts.columns.iter().zip(parts.values) {
            if !parts.is_key(col) {
                stmt.value(Alias::new(col.as_str()), Expr::cust(val.as_str()));
                assigned += 1;
            }
        }
        if assigned == 0 {
            return Err(Error::validation(format!(
                "update of '{}' has no non-key columns",
                parts.table
            )));
        }
        stmt.and_where(key_predicate(parts, &quote)?);
        Ok(stmt.to_string(builder))
    }

    pub(crate) fn delete<B: QueryBuilder>(
        parts: &StatementParts<'_>,
        builder: B,
        quote: impl Fn(&str) -> String,
    ) -> Result<String> {
        parts.check()?;
        require_keys(parts, "delete")?;
        let mut stmt = Query::delete();
        stmt.from_table(sea_table_ref(parts.table));
        stmt.and_where(key_predicate(parts, &quote)?);
        Ok(stmt.to_string(builder))
    }

    /// `k1 = v1 AND k2 = v2` as one raw expression
    ///
    /// Binary operators in sea-query parenthesize raw operands, which would
    /// render `"id" = (1)`.
    fn key_predicate(parts: &StatementParts<'_>, quote: &dyn Fn(&str) -> String) -> Result<SimpleExpr> {
        let terms = parts
            .keys
            .iter()
            .map(|key| Ok(format!("{} = {}", quote(key), parts.key_value(key)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Expr::cust(terms.join(" AND ")))
    }

    /// Upsert; `repeat_values` renders the update side with the row values
    /// instead of referring back to the inserted row.
    pub(crate) fn upsert<B: QueryBuilder>(
        parts: &StatementParts<'_>,
        builder: B,
        conflict_target: bool,
        repeat_values: bool,
    ) -> Result<String> {
        parts.check()?;
        require_keys(parts, "merge")?;
        for key in parts.keys {
            parts.key_value(key)?;
        }

        let mut on_conflict = if conflict_target {
            OnConflict::columns(parts.keys.iter().map(|k| Alias::new(k.as_str())))
        } else {
            OnConflict::new()
        };

        let non_keys: Vec<_> = parts
            .columns
            .iter()
            .zip(parts.values)
            .filter(|(col, _)| !parts.is_key(col))
            .collect();

        if non_keys.is_empty() {
            on_conflict.do_nothing();
        } else if repeat_values {
            for (col, val) in &non_keys {
                on_conflict.value(Alias::new(col.as_str()), Expr::cust(val.as_str()));
            }
        } else {
            on_conflict.update_columns(non_keys.iter().map(|(col, _)| Alias::new(col.as_str())));
        }

        let mut stmt = Query::insert();
        stmt.into_table(sea_table_ref(parts.table))
            .columns(parts.columns.iter().map(|c| Alias::new(c.as_str())))
            .values(value_exprs(parts.values))
            .map_err(|e| Error::internal(format!("merge for '{}': {:?}", parts.table, e)))?;
        stmt.on_conflict(on_conflict.to_owned());
        Ok(stmt.to_string(builder))
    }

    fn require_keys(parts: &StatementParts<'_>, action: &str) -> Result<()> {
        if parts.keys.is_empty() {
            return Err(Error::validation(format!(
                "{} of '{}' requires key fields",
                action, parts.table
            )));
        }
        Ok(())
    }
}

/// Create a built-in driver by dialect key
pub fn driver_for(name: &str, options: DriverOptions) -> Result<Arc<dyn Driver>> {
    match name.trim().to_lowercase().as_str() {
        "sqlite" | "sqlite3" => Ok(Arc::new(SqliteDriver::new(options))),
        "postgres" | "postgresql" | "pg" => Ok(Arc::new(PostgresDriver::new(options))),
        "mysql" | "mariadb" => Ok(Arc::new(MySqlDriver::new(options))),
        other => Err(Error::config(format!("unknown driver '{}'", other))),
    }
}

/// Drivers selected by dialect key
#[derive(Debug, Default, Clone)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in dialects
    pub fn with_builtins(options: DriverOptions) -> Self {
        let mut registry = Self::new();
        registry.register("sqlite", Arc::new(SqliteDriver::new(options.clone())));
        registry.register("postgres", Arc::new(PostgresDriver::new(options.clone())));
        registry.register("postgresql", Arc::new(PostgresDriver::new(options.clone())));
        registry.register("mysql", Arc::new(MySqlDriver::new(options)));
        registry
    }

    /// Register a driver under a key
    pub fn register(&mut self, key: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(key.into().to_lowercase(), driver);
    }

    /// Driver by key
    pub fn get(&self, key: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(&key.to_lowercase())
            .cloned()
            .ok_or_else(|| Error::config(format!("no driver registered for '{}'", key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(columns: &'a [String], values: &'a [String], keys: &'a [String]) -> StatementParts<'a> {
        StatementParts {
            table: "t",
            columns,
            values,
            keys,
        }
    }

    #[test]
    fn test_driver_for() {
        assert_eq!(driver_for("SQLite", DriverOptions::default()).unwrap().name(), "sqlite");
        assert_eq!(driver_for("postgresql", DriverOptions::default()).unwrap().name(), "postgres");
        assert_eq!(driver_for("mariadb", DriverOptions::default()).unwrap().name(), "mysql");
        assert!(driver_for("oracle", DriverOptions::default()).is_err());
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let registry = DriverRegistry::with_builtins(DriverOptions::default());
        assert!(registry.get("MySQL").is_ok());
        assert!(registry.get("db2").is_err());
    }

    #[test]
    fn test_format_value() {
        let driver = SqliteDriver::default();
        assert_eq!(driver.format_value(&Value::Null, SqlType::Varchar), "NULL");
        assert_eq!(driver.format_value(&Value::from("O'Brien"), SqlType::Varchar), "'O''Brien'");
        assert_eq!(driver.format_value(&Value::from("42"), SqlType::Integer), "42");
        assert_eq!(driver.format_value(&Value::from("4x"), SqlType::Integer), "'4x'");
        assert_eq!(driver.format_value(&Value::Bytes(vec![0xab, 1]), SqlType::Blob), "X'AB01'");
    }

    #[test]
    fn test_update_requires_keys() {
        let driver = SqliteDriver::default();
        let cols = vec!["id".to_string(), "v".to_string()];
        let vals = vec!["1".to_string(), "'a'".to_string()];
        let err = driver.update_sql(&parts(&cols, &vals, &[])).unwrap_err();
        assert!(err.to_string().contains("requires key fields"));

        let keys = vec!["missing".to_string()];
        assert!(driver.delete_sql(&parts(&cols, &vals, &keys)).is_err());
    }

    #[test]
    fn test_set_blob_positions() {
        let driver = SqliteDriver::default();
        let mut params = Vec::new();
        driver.set_blob(&mut params, 2, &[1, 2]);
        driver.set_clob(&mut params, 1, "text");
        assert_eq!(params, vec![Value::from("text"), Value::Bytes(vec![1, 2])]);
    }

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("load t2-copy"), "load_t2_copy");
    }
}
