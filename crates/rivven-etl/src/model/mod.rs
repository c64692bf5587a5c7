//! Scenario data model
//!
//! Passive structures built by a loader (or by hand in tests) and read by the
//! extractor and code generator.

mod dataset;
mod destination;
mod on_exception;
mod scenario;
mod source;
mod variable;

use std::collections::BTreeMap;

pub use dataset::{DataSet, DataSetRecord, FieldDef};
pub use destination::{Destination, LoadAction, PhaseScripts, DEFAULT_DEST_CONNECTION};
pub use on_exception::{ExceptionHandler, OnException, OnExceptionAction, StatementFailure};
pub use scenario::{PersistAction, Scenario};
pub use source::{Source, DEFAULT_SOURCE_CONNECTION};
pub use variable::{ScriptLang, Variable, VariableFunction, VariableScope};

/// Reference to a connector by format key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorRef {
    /// Registry key (e.g. `csv`, `memory`)
    pub key: String,
    /// Connector properties
    pub properties: BTreeMap<String, String>,
}

impl ConnectorRef {
    /// Reference with no properties
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Add a property
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// An inline task declared on a source or destination
///
/// Opaque to the engine; interpreted by the task executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineTask {
    /// Task name
    pub name: String,
    /// Task properties
    pub properties: BTreeMap<String, String>,
}

impl InlineTask {
    /// Task with no properties
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }
}
