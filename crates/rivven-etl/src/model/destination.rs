//! Scenario destinations

use std::sync::Arc;

use super::dataset::DataSet;
use super::on_exception::{OnException, OnExceptionAction};
use super::variable::Variable;
use super::{ConnectorRef, InlineTask};

/// Default logical connection name for destinations
pub const DEFAULT_DEST_CONNECTION: &str = "dest";

/// Auto-generated statement kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadAction {
    /// INSERT every row
    Insert,
    /// UPDATE by key
    Update,
    /// Dialect upsert by key
    Merge,
    /// DELETE by key
    Delete,
}

impl LoadAction {
    /// Parse a load action name
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "insert" => Some(Self::Insert),
            "update" => Some(Self::Update),
            "merge" => Some(Self::Merge),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Whether the action needs key fields
    pub fn requires_key(self) -> bool {
        !matches!(self, Self::Insert)
    }
}

/// Scripts run around the row statements of a destination
#[derive(Debug, Clone, Default)]
pub struct PhaseScripts {
    /// Run first; failures are fatal
    pub init: Option<String>,
    /// Recreate the target table from the data set fields
    pub create_table: bool,
    /// Run after the row statements, always; failures are ignored
    pub cleanup_after: Option<String>,
    /// Run when the destination fails; failures are ignored
    pub cleanup_on_exception: Option<String>,
}

/// A named data sink
#[derive(Debug, Clone)]
pub struct Destination {
    /// Destination name
    pub name: String,
    /// Hand-written SQL template with `{name}` placeholders
    pub sql: Option<String>,
    /// Auto-generated statement kind, used when `sql` is absent
    pub load_action: Option<LoadAction>,
    /// Target table
    pub object_name: Option<String>,
    /// Key fields for update/merge/delete
    pub key_fields: Vec<String>,
    /// Boolean SQL expression guarding the row statement
    pub condition: Option<String>,
    /// Statement run when the condition holds (defaults to the row statement)
    pub then_sql: Option<String>,
    /// Statement run when the condition does not hold
    pub else_sql: Option<String>,
    /// Per-field variables
    pub variables: Vec<Variable>,
    /// Failure policy
    pub on_exception: OnException,
    /// Server-side cursor table
    pub cursor_table: Option<String>,
    /// Query the cursor iterates; defaults to selecting the cursor table
    pub cursor_sql: Option<String>,
    /// Drop the cursor table after loading
    pub drop_cursor_table: bool,
    /// Logical connection name
    pub connection: String,
    /// Target column list; fields outside it are skipped
    pub metadata: Option<Vec<String>>,
    /// Inline tasks run once per row
    pub tasks: Vec<InlineTask>,
    /// Init, create and cleanup scripts
    pub scripts: PhaseScripts,
    /// Connector that persists the data set instead of SQL
    pub connector: Option<ConnectorRef>,
    /// Name of the source whose data set is loaded
    pub source: Option<String>,
    /// The loaded data set, attached before preparation
    pub data_set: Option<Arc<DataSet>>,
}

impl Destination {
    /// Create an empty destination
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: None,
            load_action: None,
            object_name: None,
            key_fields: Vec::new(),
            condition: None,
            then_sql: None,
            else_sql: None,
            variables: Vec::new(),
            on_exception: OnException::default(),
            cursor_table: None,
            cursor_sql: None,
            drop_cursor_table: false,
            connection: DEFAULT_DEST_CONNECTION.to_string(),
            metadata: None,
            tasks: Vec::new(),
            scripts: PhaseScripts::default(),
            connector: None,
            source: None,
            data_set: None,
        }
    }

    /// Auto-generated load into a table
    pub fn load(name: impl Into<String>, action: LoadAction, table: impl Into<String>) -> Self {
        let mut dest = Self::new(name);
        dest.load_action = Some(action);
        dest.object_name = Some(table.into());
        dest
    }

    /// Hand-written template
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Load from the named source
    pub fn from_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set key fields
    pub fn with_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.key_fields = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Add a variable
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }

    /// Set the failure policy
    pub fn with_on_exception(mut self, on_exception: OnException) -> Self {
        self.on_exception = on_exception;
        self
    }

    /// Guard rows with a condition
    pub fn with_condition(
        mut self,
        condition: impl Into<String>,
        then_sql: Option<String>,
        else_sql: Option<String>,
    ) -> Self {
        self.condition = Some(condition.into());
        self.then_sql = then_sql;
        self.else_sql = else_sql;
        self
    }

    /// Iterate a cursor table instead of data set rows
    pub fn with_cursor(mut self, table: impl Into<String>, drop_after: bool) -> Self {
        self.cursor_table = Some(table.into());
        self.drop_cursor_table = drop_after;
        self
    }

    /// Restrict generated statements to these columns
    pub fn with_metadata<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Use a different logical connection
    pub fn with_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = connection.into();
        self
    }

    /// Add an inline task
    pub fn with_task(mut self, task: InlineTask) -> Self {
        self.tasks.push(task);
        self
    }

    /// Persist through a connector
    pub fn with_connector(mut self, connector: ConnectorRef) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set phase scripts
    pub fn with_scripts(mut self, scripts: PhaseScripts) -> Self {
        self.scripts = scripts;
        self
    }

    /// Attach the data set to load
    pub fn with_data_set(mut self, data_set: Arc<DataSet>) -> Self {
        self.data_set = Some(data_set);
        self
    }

    /// Whether rows come from a server-side cursor
    pub fn uses_cursor(&self) -> bool {
        self.cursor_table.is_some() || self.cursor_sql.is_some()
    }

    /// Variable overriding a field, if any
    pub fn variable_for_field(&self, field: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.binds(field))
    }

    /// Variable by name
    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables
            .iter()
            .find(|v| v.name.eq_ignore_ascii_case(name))
    }

    /// Whether a field is part of generated statements
    pub fn includes_field(&self, field: &str) -> bool {
        if let Some(var) = self.variable_for_field(field) {
            if !var.include {
                return false;
            }
        }
        match &self.metadata {
            Some(columns) => columns.iter().any(|c| c.eq_ignore_ascii_case(field)),
            None => true,
        }
    }

    /// Whether a column is one of the key fields
    pub fn is_key(&self, field: &str) -> bool {
        self.key_fields.iter().any(|k| k.eq_ignore_ascii_case(field))
    }

    /// Shorthand for the configured exception action
    pub fn on_exception_action(&self) -> OnExceptionAction {
        self.on_exception.action
    }
}
