//! Error types for rivven-etl
//!
//! Errors are classified so the engine can tell recoverable statement
//! failures (handled by a destination's exception policy) from fatal ones:
//! - Statement errors (query, constraint) are offered to the policy
//! - Merge rewrite errors are always fatal
//! - `MaxRowsExceeded` is the typed "stopped as designed" signal from connectors

use std::fmt;
use thiserror::Error;

/// Result type for rivven-etl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors
    Connection,
    /// Statement execution errors
    Query,
    /// Transaction and savepoint errors
    Transaction,
    /// Constraint violation (PK, FK, unique, check)
    Constraint,
    /// Configuration error
    Configuration,
    /// Validation error (missing data set, fields, keys)
    Validation,
    /// Dialect or mode not supported
    Unsupported,
    /// Merge rewrite failure
    Merge,
    /// Connector failure
    Connector,
    /// Inline task failure
    Task,
    /// Row cap reached
    MaxRows,
    /// File system errors
    Io,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether a statement error of this category may be absorbed by an
    /// exception policy.
    #[inline]
    pub const fn is_statement_error(self) -> bool {
        matches!(self, Self::Query | Self::Constraint)
    }
}

/// Main error type for rivven-etl
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transaction or savepoint error
    #[error("transaction error: {message}")]
    Transaction { message: String },

    /// Constraint violation
    #[error("constraint violation: {message}")]
    Constraint { message: String, sql: Option<String> },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Validation error
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Unsupported operation for this dialect
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// A merge retry could not produce or execute an update statement
    #[error("merge failed: {message}")]
    Merge { message: String },

    /// Connector failure
    #[error("connector '{connector}' error: {message}")]
    Connector { connector: String, message: String },

    /// Inline task failure
    #[error("task error: {message}")]
    Task { message: String },

    /// A connector hit its configured row cap
    #[error("max rows exceeded: {limit}")]
    MaxRowsExceeded { limit: usize },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Query { .. } => ErrorCategory::Query,
            Self::Transaction { .. } => ErrorCategory::Transaction,
            Self::Constraint { .. } => ErrorCategory::Constraint,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::Validation { .. } => ErrorCategory::Validation,
            Self::Unsupported { .. } => ErrorCategory::Unsupported,
            Self::Merge { .. } => ErrorCategory::Merge,
            Self::Connector { .. } => ErrorCategory::Connector,
            Self::Task { .. } => ErrorCategory::Task,
            Self::MaxRowsExceeded { .. } => ErrorCategory::MaxRows,
            Self::Io(_) => ErrorCategory::Io,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error came from executing a statement
    #[inline]
    pub fn is_statement_error(&self) -> bool {
        self.category().is_statement_error()
    }

    /// SQL text attached to the error, if any
    pub fn sql(&self) -> Option<&str> {
        match self {
            Self::Query { sql, .. } | Self::Constraint { sql, .. } => sql.as_deref(),
            _ => None,
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a constraint violation error
    pub fn constraint(message: impl Into<String>, sql: Option<String>) -> Self {
        Self::Constraint {
            message: message.into(),
            sql,
        }
    }

    /// Create a transaction error
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create a merge error
    pub fn merge(message: impl Into<String>) -> Self {
        Self::Merge {
            message: message.into(),
        }
    }

    /// Create a connector error
    pub fn connector(connector: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connector {
            connector: connector.into(),
            message: message.into(),
        }
    }

    /// Create a task error
    pub fn task(message: impl Into<String>) -> Self {
        Self::Task {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection => write!(f, "connection"),
            Self::Query => write!(f, "query"),
            Self::Transaction => write!(f, "transaction"),
            Self::Constraint => write!(f, "constraint"),
            Self::Configuration => write!(f, "configuration"),
            Self::Validation => write!(f, "validation"),
            Self::Unsupported => write!(f, "unsupported"),
            Self::Merge => write!(f, "merge"),
            Self::Connector => write!(f, "connector"),
            Self::Task => write!(f, "task"),
            Self::MaxRows => write!(f, "max_rows"),
            Self::Io => write!(f, "io"),
            Self::Other => write!(f, "other"),
        }
    }
}
