//! MySQL dialect
//!
//! MySQL cannot run anonymous procedural blocks, so each script unit becomes
//! a stored procedure that is created, called and dropped. Exception
//! handlers must be declared before the statements they guard.

use std::sync::LazyLock;

use regex::Regex;
use sea_query::MysqlQueryBuilder;

use super::{templates, Driver, DriverOptions, StatementParts};
use crate::error::Result;
use crate::model::OnExceptionAction;
use crate::types::SqlType;

static ERROR_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)at line (\d+)").expect("error line regex pattern is invalid - this is a bug")
});

/// MySQL / MariaDB driver
#[derive(Debug, Clone, Default)]
pub struct MySqlDriver {
    options: DriverOptions,
}

impl MySqlDriver {
    /// Create a driver with the given options
    pub fn new(options: DriverOptions) -> Self {
        Self { options }
    }
}

impl Driver for MySqlDriver {
    fn name(&self) -> &'static str {
        "mysql"
    }

    fn options(&self) -> &DriverOptions {
        &self.options
    }

    fn quote_identifier(&self, name: &str) -> String {
        format!("`{}`", name.replace('`', "``"))
    }

    fn native_type(&self, sql_type: SqlType) -> String {
        match sql_type {
            SqlType::Varchar | SqlType::Other => "VARCHAR(4000)",
            SqlType::Char => "CHAR(1)",
            SqlType::SmallInt => "SMALLINT",
            SqlType::Integer => "INT",
            SqlType::BigInt => "BIGINT",
            SqlType::Numeric => "DECIMAL(65,30)",
            SqlType::Real => "FLOAT",
            SqlType::Double => "DOUBLE",
            SqlType::Boolean => "TINYINT(1)",
            SqlType::Date => "DATE",
            SqlType::Time => "TIME",
            SqlType::Timestamp => "DATETIME",
            SqlType::Binary | SqlType::Blob => "LONGBLOB",
            SqlType::Clob => "LONGTEXT",
        }
        .to_string()
    }

    fn insert_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::insert(parts, MysqlQueryBuilder)
    }

    fn update_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::update(parts, MysqlQueryBuilder, |c| self.quote_identifier(c))
    }

    fn merge_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::upsert(parts, MysqlQueryBuilder, false, false)
    }

    fn delete_sql(&self, parts: &StatementParts<'_>) -> Result<String> {
        templates::delete(parts, MysqlQueryBuilder, |c| self.quote_identifier(c))
    }

    // Declarations are only legal right after BEGIN.
    fn declare_section_start(&self) -> String {
        "BEGIN".to_string()
    }

    fn declare_variable(&self, name: &str, sql_type: SqlType) -> String {
        format!("DECLARE {} {};", name, self.native_type(sql_type))
    }

    fn assign_variable(&self, name: &str, expr: &str) -> String {
        format!("SET {} = {};", name, expr)
    }

    fn conditional(&self, condition: &str, then: &str, otherwise: Option<&str>) -> Option<String> {
        let mut sql = format!("IF {} THEN\n{}\n", condition, then);
        if let Some(otherwise) = otherwise {
            sql.push_str(&format!("ELSE\n{}\n", otherwise));
        }
        sql.push_str("END IF;");
        Some(sql)
    }

    fn end(&self) -> String {
        "END".to_string()
    }

    fn create_procedure_sql(&self, name: &str, body: &str) -> Result<String> {
        Ok(format!("CREATE PROCEDURE {}()\n{}", name, body))
    }

    fn on_exception_begin(&self) -> String {
        "BEGIN".to_string()
    }

    fn on_exception_body(&self, action: OnExceptionAction, merge_sql: Option<&str>) -> String {
        match (action, merge_sql) {
            (OnExceptionAction::Merge, Some(update)) => format!(
                "DECLARE CONTINUE HANDLER FOR 1062 {};",
                update.trim_end_matches(';')
            ),
            (OnExceptionAction::Raise, _) => {
                "DECLARE EXIT HANDLER FOR SQLEXCEPTION RESIGNAL;".to_string()
            }
            _ => "DECLARE CONTINUE HANDLER FOR SQLEXCEPTION BEGIN END;".to_string(),
        }
    }

    fn on_exception_end(&self) -> String {
        "END;".to_string()
    }

    fn on_exception_handler_first(&self) -> bool {
        true
    }

    fn supports_callable_statement(&self) -> bool {
        true
    }

    fn supports_anonymous_blocks(&self) -> bool {
        false
    }

    fn default_binary_in_proc(&self) -> bool {
        true
    }

    fn supports_params_in_anonymous_blocks(&self) -> bool {
        true
    }

    fn error_line_pattern(&self) -> Option<&Regex> {
        Some(&ERROR_LINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_uses_on_duplicate_key() {
        let driver = MySqlDriver::default();
        let cols = vec!["id".to_string(), "name".to_string()];
        let vals = vec!["1".to_string(), "'Ann'".to_string()];
        let keys = vec!["id".to_string()];
        let sql = driver
            .merge_sql(&StatementParts {
                table: "t2",
                columns: &cols,
                values: &vals,
                keys: &keys,
            })
            .unwrap();

        assert!(sql.starts_with("INSERT INTO `t2` (`id`, `name`) VALUES (1, 'Ann')"));
        assert!(sql.contains("ON DUPLICATE KEY UPDATE"));
    }

    #[test]
    fn test_update_by_key() {
        let driver = MySqlDriver::default();
        let cols = vec!["id".to_string(), "name".to_string()];
        let vals = vec!["1".to_string(), "'Ann'".to_string()];
        let keys = vec!["id".to_string()];
        let sql = driver
            .update_sql(&StatementParts {
                table: "t2",
                columns: &cols,
                values: &vals,
                keys: &keys,
            })
            .unwrap();
        assert_eq!(sql, "UPDATE `t2` SET `name` = 'Ann' WHERE `id` = 1");
    }

    #[test]
    fn test_procedure_lifecycle() {
        let driver = MySqlDriver::default();
        let name = driver.procedure_name("nightly load", "orders", 2);
        assert_eq!(name, "etl_nightly_load_orders_2");

        let create = driver.create_procedure_sql(&name, "BEGIN\nEND").unwrap();
        assert!(create.starts_with("CREATE PROCEDURE etl_nightly_load_orders_2()"));
        assert_eq!(driver.call_procedure_sql(&name), "CALL etl_nightly_load_orders_2()");
        assert_eq!(
            driver.drop_procedure_sql(&name),
            "DROP PROCEDURE IF EXISTS etl_nightly_load_orders_2"
        );
    }

    #[test]
    fn test_handler_precedes_statement() {
        let driver = MySqlDriver::default();
        assert!(driver.on_exception_handler_first());
        assert!(driver.supports_binary_in_proc());
        assert_eq!(driver.declare_variable("v_id", SqlType::Integer), "DECLARE v_id INT;");
        assert_eq!(driver.assign_variable("v_id", "7"), "SET v_id = 7;");
        assert_eq!(driver.error_line("You have an error ... at line 3"), Some(3));
    }
}
