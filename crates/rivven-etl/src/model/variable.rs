//! Scenario and destination variables

use crate::types::SqlType;

/// When a variable is evaluated relative to the row statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VariableScope {
    /// Resolved before the statement (declaration + assignment prefix)
    Before,
    /// Resolved inline while the statement is built
    #[default]
    Runtime,
    /// Resolved after the statement
    After,
}

/// Language of an inline variable script
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLang {
    /// A raw SQL expression emitted into the statement
    Sql,
    /// Any other language; only usable through a registered function
    Other(String),
}

impl ScriptLang {
    /// Parse a language name
    pub fn parse(name: &str) -> Self {
        if name.eq_ignore_ascii_case("sql") {
            Self::Sql
        } else {
            Self::Other(name.to_string())
        }
    }
}

/// How a variable computes its value
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum VariableFunction {
    /// Literal value or bound field value
    #[default]
    None,
    /// A function from the registry, addressed by owner and name
    Named {
        /// Owning namespace (e.g. `builtin`)
        owner: String,
        /// Function name
        name: String,
    },
    /// Inline script
    Script {
        /// Script language
        lang: ScriptLang,
        /// Script source
        code: String,
    },
}

/// A named, typed value bound to a destination or scenario
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Variable name, also the `{name}` placeholder in SQL templates
    pub name: String,
    /// Data set field the variable is bound to (defaults to `name`)
    pub field: Option<String>,
    /// Literal value
    pub value: Option<String>,
    /// Declared SQL type; inferred from the bound field when absent
    pub sql_type: Option<SqlType>,
    /// Evaluation scope
    pub scope: VariableScope,
    /// Value function
    pub function: VariableFunction,
    /// Whether the bound field is included in generated statements
    pub include: bool,
    /// Scenario-wide visibility
    pub global: bool,
}

impl Variable {
    /// Create a runtime variable with no value
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field: None,
            value: None,
            sql_type: None,
            scope: VariableScope::Runtime,
            function: VariableFunction::None,
            include: true,
            global: false,
        }
    }

    /// Set a literal value
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Bind to a data set field
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Declare the SQL type
    pub fn with_type(mut self, sql_type: SqlType) -> Self {
        self.sql_type = Some(sql_type);
        self
    }

    /// Set the evaluation scope
    pub fn with_scope(mut self, scope: VariableScope) -> Self {
        self.scope = scope;
        self
    }

    /// Use a registry function
    pub fn with_function(mut self, owner: impl Into<String>, name: impl Into<String>) -> Self {
        self.function = VariableFunction::Named {
            owner: owner.into(),
            name: name.into(),
        };
        self
    }

    /// Use an inline script
    pub fn with_script(mut self, lang: &str, code: impl Into<String>) -> Self {
        self.function = VariableFunction::Script {
            lang: ScriptLang::parse(lang),
            code: code.into(),
        };
        self
    }

    /// Exclude the bound field from generated statements
    pub fn excluded(mut self) -> Self {
        self.include = false;
        self
    }

    /// Make the variable scenario-wide
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Field this variable reads from and overrides
    pub fn bound_field(&self) -> &str {
        self.field.as_deref().unwrap_or(&self.name)
    }

    /// Whether this variable overrides the given field (case-insensitive)
    pub fn binds(&self, field: &str) -> bool {
        self.bound_field().eq_ignore_ascii_case(field)
    }
}
