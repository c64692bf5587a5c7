//! SQLite dialect
//!
//! SQLite has no procedural blocks, so every script unit runs statement by
//! statement and failures are recovered through savepoints and row markers.

use sea_query::SqliteQueryBuilder;

use super::{templates, Driver, DriverOptions, StatementParts};
use crate::error::Result;
use crate::types::SqlType;

/// SQLite driver
#[derive(Debug, Clone, Default)]
pub struct SqliteDriver {
    options: DriverOptions,
}

impl SqliteDriver {
    /// Create a driver with the given options
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }
}

impl Driver for SqliteDriver {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn native_type(&self, sql_type: SqlType) -> String {
        match sql_type {
            SqlType::SmallInt | SqlType::Integer | SqlType::BigInt | SqlType::Boolean => "INTEGER",
            SqlType::Real | SqlType::Double => "REAL",
            SqlType::Numeric => "NUMERIC",
            SqlType::Binary | SqlType::Blob => "BLOB",
            _ => "TEXT",
        }
        .to_string()
    }

    fn insert_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::insert(parts, SqliteQueryBuilder)
    }

    fn update_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::update(parts, SqliteQueryBuilder, |c| self.quote_identifier(c))
    }

    // The update side repeats the row values so large objects bind twice.
    fn merge_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::upsert(parts, SqliteQueryBuilder, true, true)
    }

    fn delete_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::delete(parts, SqliteQueryBuilder, |c| self.quote_identifier(c))
    }

    fn supports_callable_statement(&self) -> bool {
        false
    }

    fn supports_anonymous_blocks(&self) -> bool {
        false
    }

    fn supports_params_in_anonymous_blocks(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cols() -> Vec<String> {
        vec!["id".into(), "name".into()]
    }

    #[test]
    fn test_insert_sql() {
        let driver = SqliteDriver::default();
        let values = vec!["1".to_string(), "'Ann'".to_string()];
        let sql = driver
            .insert_sql(&StatementParts {
                table: "t2",
                columns: &cols(),
                values: &values,
                keys: &[],
            })
            .unwrap();
        assert_eq!(sql, r#"INSERT INTO "t2" ("id", "name") VALUES (1, 'Ann')"#);
    }

    #[test]
    fn test_update_and_delete_sql() {
        let driver = SqliteDriver::default();
        let values = vec!["1".to_string(), "'Ann'".to_string()];
        let keys = vec!["id".to_string()];
        let parts = StatementParts {
            table: "t2",
            columns: &cols(),
            values: &values,
            keys: &keys,
        };

        assert_eq!(
            driver.update_sql(&parts).unwrap(),
            r#"UPDATE "t2" SET "name" = 'Ann' WHERE "id" = 1"#
        );
        assert_eq!(driver.delete_sql(&parts).unwrap(), r#"DELETE FROM "t2" WHERE "id" = 1"#);
    }

    #[test]
    fn test_composite_key_predicate() {
        let driver = SqliteDriver::default();
        let values = vec!["1".to_string(), "'Ann'".to_string()];
        let keys = vec!["id".to_string(), "name".to_string()];
        let parts = StatementParts {
            table: "t2",
            columns: &cols(),
            values: &values,
            keys: &keys,
        };
        assert_eq!(
            driver.delete_sql(&parts).unwrap(),
            r#"DELETE FROM "t2" WHERE "id" = 1 AND "name" = 'Ann'"#
        );
        assert!(driver.update_sql(&parts).is_err());
    }

    #[test]
    fn test_merge_repeats_values() {
        let driver = SqliteDriver::default();
        let values = vec!["?".to_string(), "?".to_string()];
        let keys = vec!["id".to_string()];
        let sql = driver
            .merge_sql(&StatementParts {
                table: "t2",
                columns: &cols(),
                values: &values,
                keys: &keys,
            })
            .unwrap();

        assert!(sql.starts_with(r#"INSERT INTO "t2" ("id", "name") VALUES (?, ?) ON CONFLICT"#));
        assert_eq!(sql.matches('?').count(), 3);
    }

    #[test]
    fn test_feature_flags() {
        let driver = SqliteDriver::default();
        assert!(!driver.supports_callable_statement());
        assert!(!driver.supports_cursors());
        assert!(driver.conditional("a = 1", "SELECT 1", None).is_none());
        assert_eq!(driver.parameter_placeholder(3), "?");
    }
}
