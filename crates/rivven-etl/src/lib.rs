//! # rivven-etl
//!
//! Scenario-driven ETL engine: extract rows from SQL sources or connectors,
//! generate dialect-specific SQL for each destination, and execute it with
//! per-destination exception policies.
//!
//! ## Features
//!
//! - **Code Generation**: insert/update/merge/delete statements, variables,
//!   conditions and cursor loops rendered per dialect (SQLite, PostgreSQL, MySQL)
//! - **Two Execution Modes**: whole callable blocks where the dialect has
//!   procedural SQL, statement by statement with row markers elsewhere
//! - **Exception Policies**: continue, ignore, merge (retry as update) or raise,
//!   optionally inside savepoints
//! - **Extraction**: streaming or retained data sets, row caps, inline tasks
//! - **Side-Effect Journal**: files created during a scenario are deleted on rollback
//! - **Connectors**: pluggable populate/persist for non-SQL formats
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rivven_etl::prelude::*;
//!
//! let config = EtlConfig::from_file("etl.yaml")?;
//! let scenario = Scenario::new("copy", "sqlite")
//!     .with_source(Source::sql("src", "SELECT * FROM t"))
//!     .with_destination(Destination::load("t2", LoadAction::Insert, "t2").from_source("src"));
//!
//! let runner = ScenarioRunner::from_config(&config);
//! let report = runner.run(&config, &scenario).await?;
//! assert!(report.is_ok());
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlite` (default) - SQLite connections via rusqlite

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod codegen;
pub mod config;
pub mod connection;
pub mod connector;
pub mod driver;
pub mod error;
pub mod extract;
pub mod function;
pub mod logging;
pub mod model;
pub mod monitor;
pub mod result;
pub mod runner;
pub mod task;
pub mod testing;
pub mod types;

#[cfg(feature = "sqlite")]
pub mod sqlite;

/// Prelude module for convenient imports
pub mod prelude {
    // Error and result types
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::result::{EtlResult, ReturnCode};

    // Values
    pub use crate::types::{ColumnMetadata, Row, SqlType, Value};

    // Configuration
    pub use crate::config::EtlConfig;

    // Scenario model
    pub use crate::model::{
        ConnectorRef, DataSet, DataSetRecord, Destination, FieldDef, InlineTask, LoadAction,
        OnException, OnExceptionAction, PersistAction, Scenario, Source, Variable,
        VariableFunction, VariableScope,
    };

    // Connections
    pub use crate::connection::{
        Connection, ConnectionConfig, ConnectionFactory, ConnectionRegistry, RowStream,
    };

    // Dialects
    pub use crate::driver::{driver_for, Driver, DriverOptions, DriverRegistry};

    // Engine
    pub use crate::codegen::{CodeGen, ExecutionMode, ExecutionSummary, GenerationContext};
    pub use crate::connector::{ConnectorParams, ConnectorRegistry, DataSetConnector, DataSetListener};
    pub use crate::extract::{ExtractOutcome, Extractor};
    pub use crate::function::FunctionRegistry;
    pub use crate::monitor::TransactionMonitor;
    pub use crate::runner::{ScenarioReport, ScenarioRunner};
    pub use crate::task::{TaskExecutor, TaskResult, TaskTarget};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;

#[cfg(test)]
mod tests {
    use super::prelude::*;

    #[test]
    fn test_prelude_imports() {
        let _value = Value::Int64(42);
        let _config = ConnectionConfig::new("sqlite::memory:");
        let _action = OnExceptionAction::default();
        assert_eq!(ReturnCode::ValidationFailed.code(), 2);
    }

    #[test]
    fn test_driver_selection() {
        let registry = DriverRegistry::with_builtins(DriverOptions::default());
        assert_eq!(registry.get("SQLite").unwrap().name(), driver_for("sqlite3", DriverOptions::default()).unwrap().name());
        assert!(registry.get("oracle").is_err());
    }
}
