//! PostgreSQL dialect
//!
//! Script units run as anonymous `DO $$ ... $$` blocks. Row statements are
//! guarded with nested `BEGIN ... EXCEPTION ... END` blocks and server-side
//! cursors are declared in the block's declare section.

use std::sync::LazyLock;

use regex::Regex;
use sea_query::PostgresQueryBuilder;

use super::{hex, templates, Driver, DriverOptions, StatementParts};
use crate::error::Result;
use crate::model::OnExceptionAction;
use crate::types::SqlType;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)line (\d+)").expect("error line regex pattern is invalid - this is a bug")
});

/// PostgreSQL driver
#[derive(Debug, Clone, Default)]
pub struct PostgresDriver {
    options: DriverOptions,
}

impl PostgresDriver {
    /// Create a driver with the given options
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }
}

impl Driver for PostgresDriver {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("\"{}\"", name.replace('"', "\"\""))
    }

    fn native_type(&self, sql_type: SqlType) -> String {
        match sql_type {
            SqlType::Varchar | SqlType::Clob | SqlType::Other => "TEXT",
            SqlType::Char => "CHAR",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Numeric => "NUMERIC",
            SqlType::Real => "REAL",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Boolean => "BOOLEAN",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Binary | SqlType::Blob => "BYTEA",
        }
        .to_string()
    }

    fn binary_literal(&self, bytes: &[u8]) -> String {
        format!("'\\x{}'::bytea", hex(bytes))
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn insert_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::insert(parts, PostgresQueryBuilder)
    }

    fn update_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::update(parts, PostgresQueryBuilder, |c| self.quote_identifier(c))
    }

    fn merge_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::upsert(parts, PostgresQueryBuilder, true, false)
    }

    fn delete_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::delete(parts, PostgresQueryBuilder, |c| self.quote_identifier(c))
    }

    fn declare_section_start(&self) -> String {
        "DO $$\nDECLARE".to_string()
    }

    fn declare_cursor_variable(&self, name: &str) -> Option<String> {
        Some(format!("{} RECORD;", name))
    }

    fn declare_cursor(&self, name: &str, sql: &str) -> Option<String> {
        Some(format!("{} CURSOR FOR {};", name, sql.trim().trim_end_matches(';')))
    }

    fn cursor_loop_start(&self, variable: &str, cursor: &str) -> Option<String> {
        Some(format!("FOR {} IN {} LOOP", variable, cursor))
    }

    fn cursor_loop_end(&self) -> String {
        "END LOOP;".to_string()
    }

    fn conditional(&self, condition: &str, then: &str, otherwise: Option<&str>) -> Option<String> {
        let mut sql = format!("IF {} THEN\n{}\n", condition, then);
        if let Some(otherwise) = otherwise {
            sql.push_str(&format!("ELSE\n{}\n", otherwise));
        }
        sql.push_str("END IF;");
        Some(sql)
    }

    fn begin(&self) -> String {
        "BEGIN".to_string()
    }

    fn end(&self) -> String {
        "END $$;".to_string()
    }

    fn on_exception_begin(&self) -> String {
        "BEGIN".to_string()
    }

    fn on_exception_body(&self, action: OnExceptionAction, merge_sql: Option<&str>) -> String {
        match (action, merge_sql) {
            (OnExceptionAction::Merge, Some(update)) => {
                format!("EXCEPTION WHEN unique_violation THEN\n{};", update.trim_end_matches(';'))
            }
            (OnExceptionAction::Raise, _) => "EXCEPTION WHEN OTHERS THEN RAISE;".to_string(),
            _ => "EXCEPTION WHEN OTHERS THEN NULL;".to_string(),
        }
    }

    fn on_exception_end(&self) -> String {
        "END;".to_string()
    }

    fn supports_callable_statement(&self) -> bool {
        true
    }

    fn supports_anonymous_blocks(&self) -> bool {
        true
    }

    fn requires_rollback_after_sql_error(&self) -> bool {
        true
    }

    fn supports_params_in_anonymous_blocks(&self) -> bool {
        true
    }

    fn supports_cursors(&self) -> bool {
        true
    }

    fn parameter_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn error_line_pattern(&self) -> Option<&Regex> {
        Some(&ERROR_LINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_uses_on_conflict() {
        let driver = PostgresDriver::default();
        let cols = vec!["id".to_string(), "name".to_string()];
        let vals = vec!["1".to_string(), "'Ann'".to_string()];
        let keys = vec!["id".to_string()];
        let sql = driver
            .merge_sql(&StatementParts {
                table: "public.t2",
                columns: &cols,
                values: &vals,
                keys: &keys,
            })
            .unwrap();

        assert!(sql.starts_with(r#"INSERT INTO "public"."t2" ("id", "name") VALUES (1, 'Ann')"#));
        assert!(sql.contains(r#"ON CONFLICT ("id") DO UPDATE SET"#));
        assert!(sql.contains(r#""name" = "excluded"."name""#));
    }

    #[test]
    fn test_delete_by_key() {
        let driver = PostgresDriver::default();
        let cols = vec!["id".to_string()];
        let vals = vec!["$1".to_string()];
        let keys = vec!["id".to_string()];
        let sql = driver
            .delete_sql(&StatementParts {
                table: "public.t2",
                columns: &cols,
                values: &vals,
                keys: &keys,
            })
            .unwrap();
        assert_eq!(sql, r#"DELETE FROM "public"."t2" WHERE "id" = $1"#);
    }

    #[test]
    fn test_exception_bodies() {
        let driver = PostgresDriver::default();
        assert_eq!(
            driver.on_exception_body(OnExceptionAction::Continue, None),
            "EXCEPTION WHEN OTHERS THEN NULL;"
        );
        let merge = driver.on_exception_body(
            OnExceptionAction::Merge,
            Some(r#"UPDATE "t" SET "v" = 1 WHERE "k" = 2"#),
        );
        assert!(merge.starts_with("EXCEPTION WHEN unique_violation THEN"));
        assert!(merge.ends_with(r#""k" = 2;"#));
    }

    #[test]
    fn test_conditional_and_cursor_fragments() {
        let driver = PostgresDriver::default();
        let sql = driver
            .conditional("v_total > 0", "INSERT INTO t VALUES (1);", Some("NULL;"))
            .unwrap();
        assert_eq!(sql, "IF v_total > 0 THEN\nINSERT INTO t VALUES (1);\nELSE\nNULL;\nEND IF;");

        assert_eq!(
            driver.declare_cursor("c_rows", "SELECT * FROM staging;").unwrap(),
            "c_rows CURSOR FOR SELECT * FROM staging;"
        );
        assert_eq!(driver.cursor_field("r", "id"), r#"r."id""#);
    }

    #[test]
    fn test_error_line() {
        let driver = PostgresDriver::default();
        assert_eq!(
            driver.error_line("PL/pgSQL function inline_code_block line 12 at SQL statement"),
            Some(12)
        );
        assert_eq!(driver.error_line("permission denied"), None);
        assert_eq!(driver.format_value(&crate::types::Value::Bytes(vec![1]), SqlType::Blob), "'\\x01'::bytea");
    }
}
