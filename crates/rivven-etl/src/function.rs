//! Runtime variable evaluation
//!
//! Variables compute their value in one of three ways (see
//! [`VariableFunction`]): a literal or bound field value, a function looked up
//! in the [`FunctionRegistry`] by `(owner, name)`, or an inline SQL
//! expression. The [`VariableEvaluator`] turns a variable and the current row
//! into either a [`Value`] or raw SQL text.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use chrono::Local;
use uuid::Uuid;

use crate::driver::Driver;
use crate::error::{Error, Result};
use crate::model::{DataSet, ScriptLang, Variable, VariableFunction};
use crate::types::{SqlType, Value};

/// Owner key of the built-in functions
pub const BUILTIN_OWNER: &str = "builtin";

/// Pre-compiled regex for `{name}` placeholders in SQL templates
static PLACEHOLDER_REGEX: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}")
        .expect("placeholder regex pattern is invalid - this is a bug")
});

/// Replace `{name}` placeholders; unresolved placeholders are left as is
pub fn substitute_placeholders<F>(template: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<Option<String>>,
{
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in PLACEHOLDER_REGEX.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);
        match resolve(name.as_str())? {
            Some(replacement) => out.push_str(&replacement),
            None => out.push_str(whole.as_str()),
        }
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Names of all `{name}` placeholders in order of appearance
pub fn placeholder_names(template: &str) -> Vec<String> {
    PLACEHOLDER_REGEX
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Inputs available to a function call
#[derive(Debug, Clone, Copy)]
pub struct FunctionContext<'a> {
    /// Variable being evaluated
    pub variable: &'a Variable,
    /// Data set of the destination, if any
    pub data_set: Option<&'a DataSet>,
    /// Current row index, if any
    pub row: Option<usize>,
}

impl FunctionContext<'_> {
    /// Value of the variable's bound field in the current row
    pub fn field_value(&self) -> Value {
        match (self.data_set, self.row) {
            (Some(ds), Some(row)) => ds
                .value(row, self.variable.bound_field())
                .cloned()
                .unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// The variable's literal value, typed
    pub fn literal(&self) -> Value {
        match &self.variable.value {
            Some(text) => Value::parse_as(text, self.variable.sql_type.unwrap_or_default()),
            None => Value::Null,
        }
    }
}

/// A function usable as a variable value
pub trait EtlFunction: Send + Sync {
    /// Compute the value
    fn call(&self, ctx: &FunctionContext<'_>) -> Result<Value>;
}

impl<F> EtlFunction for F
where
    F: Fn(&FunctionContext<'_>) -> Result<Value> + Send + Sync,
{
    fn call(&self, ctx: &FunctionContext<'_>) -> Result<Value> {
        self(ctx)
    }
}

fn map_text(value: Value, f: impl Fn(&str) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(&s)),
        other => other,
    }
}

fn field_or_literal(ctx: &FunctionContext<'_>) -> Value {
    match ctx.field_value() {
        Value::Null => ctx.literal(),
        value => value,
    }
}

/// Functions addressed by `(owner, name)`
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<(String, String), Arc<dyn EtlFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<String> = self
            .functions
            .keys()
            .map(|(owner, name)| format!("{}.{}", owner, name))
            .collect();
        keys.sort();
        f.debug_struct("FunctionRegistry").field("functions", &keys).finish()
    }
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the `builtin` functions
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(BUILTIN_OWNER, "field", |ctx: &FunctionContext<'_>| Ok(ctx.field_value()));
        registry.register(BUILTIN_OWNER, "rownum", |ctx: &FunctionContext<'_>| {
            Ok(ctx
                .row
                .map(|r| Value::Int64(r as i64 + 1))
                .unwrap_or(Value::Null))
        });
        registry.register(BUILTIN_OWNER, "constant", |ctx: &FunctionContext<'_>| Ok(ctx.literal()));
        registry.register(BUILTIN_OWNER, "upper", |ctx: &FunctionContext<'_>| {
            Ok(map_text(field_or_literal(ctx), str::to_uppercase))
        });
        registry.register(BUILTIN_OWNER, "lower", |ctx: &FunctionContext<'_>| {
            Ok(map_text(field_or_literal(ctx), str::to_lowercase))
        });
        registry.register(BUILTIN_OWNER, "trim", |ctx: &FunctionContext<'_>| {
            Ok(map_text(field_or_literal(ctx), |s| s.trim().to_string()))
        });
        registry.register(BUILTIN_OWNER, "coalesce", |ctx: &FunctionContext<'_>| {
            Ok(field_or_literal(ctx))
        });
        registry.register(BUILTIN_OWNER, "now", |_: &FunctionContext<'_>| {
            Ok(Value::DateTime(Local::now().naive_local()))
        });
        registry.register(BUILTIN_OWNER, "uuid", |_: &FunctionContext<'_>| {
            Ok(Value::Uuid(Uuid::new_v4()))
        });
        registry
    }

    /// Register a closure
    pub fn register<F>(&mut self, owner: impl Into<String>, name: impl Into<String>, function: F)
    where
        F: Fn(&FunctionContext<'_>) -> Result<Value> + Send + Sync + 'static,
    {
        self.insert(owner, name, Arc::new(function));
    }

    /// Register a function object
    pub fn insert(
        &mut self,
        owner: impl Into<String>,
        name: impl Into<String>,
        function: Arc<dyn EtlFunction>,
    ) {
        self.functions.insert(
            (owner.into().to_lowercase(), name.into().to_lowercase()),
            function,
        );
    }

    /// Look up a function
    pub fn get(&self, owner: &str, name: &str) -> Result<Arc<dyn EtlFunction>> {
        self.functions
            .get(&(owner.to_lowercase(), name.to_lowercase()))
            .cloned()
            .ok_or_else(|| Error::config(format!("unknown function '{}.{}'", owner, name)))
    }

    /// Whether a function is registered
    pub fn contains(&self, owner: &str, name: &str) -> bool {
        self.functions
            .contains_key(&(owner.to_lowercase(), name.to_lowercase()))
    }
}

/// Result of evaluating a variable
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluated {
    /// A value, rendered with the driver where it lands in SQL
    Literal(Value),
    /// Raw SQL text emitted verbatim
    Expression(String),
}

impl Evaluated {
    /// Render as SQL text
    pub fn to_sql(&self, driver: &dyn Driver, sql_type: SqlType) -> String {
        match self {
            Self::Literal(value) => driver.format_value(value, sql_type),
            Self::Expression(expr) => expr.clone(),
        }
    }
}

/// Evaluates variables against the current row
#[derive(Debug, Clone)]
pub struct VariableEvaluator<'a> {
    functions: &'a FunctionRegistry,
    driver: &'a dyn Driver,
}

impl<'a> VariableEvaluator<'a> {
    /// Create an evaluator
    pub fn new(functions: &'a FunctionRegistry, driver: &'a dyn Driver) -> Self {
        Self { functions, driver }
    }

    /// SQL type a variable resolves to
    pub fn resolve_type(variable: &Variable, data_set: Option<&DataSet>) -> SqlType {
        variable
            .sql_type
            .or_else(|| {
                data_set
                    .and_then(|ds| ds.field(variable.bound_field()))
                    .map(|f| f.sql_type)
            })
            .unwrap_or(SqlType::Varchar)
    }

    /// Evaluate a variable for a row
    pub fn evaluate(
        &self,
        variable: &Variable,
        data_set: Option<&DataSet>,
        row: Option<usize>,
    ) -> Result<Evaluated> {
        let ctx = FunctionContext {
            variable,
            data_set,
            row,
        };

        match &variable.function {
            VariableFunction::None if variable.value.is_some() => {
                let sql_type = Self::resolve_type(variable, data_set);
                let text = variable.value.as_deref().unwrap_or_default();
                Ok(Evaluated::Literal(Value::parse_as(text, sql_type)))
            }
            VariableFunction::None => Ok(Evaluated::Literal(ctx.field_value())),
            VariableFunction::Named { owner, name } => {
                let function = self.functions.get(owner, name)?;
                Ok(Evaluated::Literal(function.call(&ctx)?))
            }
            VariableFunction::Script {
                lang: ScriptLang::Sql,
                code,
            } => {
                let expr = substitute_placeholders(code, |name| {
                    let Some(ds) = data_set else {
                        return Ok(None);
                    };
                    let (Some(field), Some(row)) = (ds.field(name), row) else {
                        return Ok(None);
                    };
                    let value = ds.value(row, name).cloned().unwrap_or(Value::Null);
                    Ok(Some(self.driver.format_value(&value, field.sql_type)))
                })?;
                Ok(Evaluated::Expression(expr))
            }
            VariableFunction::Script {
                lang: ScriptLang::Other(lang),
                ..
            } => Err(Error::config(format!(
                "variable '{}': script language '{}' is not supported",
                variable.name, lang
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::SqliteDriver;

    fn data() -> DataSet {
        DataSet::new("src")
            .with_field("id", SqlType::Integer)
            .with_field("name", SqlType::Varchar)
            .with_record(vec![Value::Int32(7), Value::from("  Ann ")])
            .unwrap()
    }

    #[test]
    fn test_substitute_placeholders() {
        let sql = substitute_placeholders("UPDATE t SET a = {a} WHERE b = {b}", |name| {
            Ok((name == "a").then(|| "1".to_string()))
        })
        .unwrap();
        assert_eq!(sql, "UPDATE t SET a = 1 WHERE b = {b}");
        assert_eq!(placeholder_names("{x} + {y_1}"), vec!["x", "y_1"]);
    }

    #[test]
    fn test_literal_and_field_values() {
        let registry = FunctionRegistry::with_builtins();
        let driver = SqliteDriver::default();
        let eval = VariableEvaluator::new(&registry, &driver);
        let ds = data();

        let literal = Variable::new("batch").with_value("42").with_type(SqlType::Integer);
        assert_eq!(
            eval.evaluate(&literal, Some(&ds), Some(0)).unwrap(),
            Evaluated::Literal(Value::Int32(42))
        );

        let bound = Variable::new("v_id").with_field("id");
        assert_eq!(
            eval.evaluate(&bound, Some(&ds), Some(0)).unwrap(),
            Evaluated::Literal(Value::Int32(7))
        );
    }

    #[test]
    fn test_builtin_functions() {
        let registry = FunctionRegistry::with_builtins();
        let driver = SqliteDriver::default();
        let eval = VariableEvaluator::new(&registry, &driver);
        let ds = data();

        let trim = Variable::new("name").with_function(BUILTIN_OWNER, "trim");
        assert_eq!(
            eval.evaluate(&trim, Some(&ds), Some(0)).unwrap(),
            Evaluated::Literal(Value::from("Ann"))
        );

        let rownum = Variable::new("n").with_function("BUILTIN", "rownum");
        assert_eq!(
            eval.evaluate(&rownum, Some(&ds), Some(0)).unwrap(),
            Evaluated::Literal(Value::Int64(1))
        );

        let unknown = Variable::new("x").with_function("acme", "magic");
        assert!(eval.evaluate(&unknown, Some(&ds), Some(0)).is_err());
    }

    #[test]
    fn test_sql_script_expression() {
        let registry = FunctionRegistry::with_builtins();
        let driver = SqliteDriver::default();
        let eval = VariableEvaluator::new(&registry, &driver);
        let ds = data();

        let script = Variable::new("label").with_script("sql", "upper({name}) || '-' || {id}");
        assert_eq!(
            eval.evaluate(&script, Some(&ds), Some(0)).unwrap(),
            Evaluated::Expression("upper('  Ann ') || '-' || 7".into())
        );

        let js = Variable::new("label").with_script("javascript", "1 + 1");
        let err = eval.evaluate(&js, Some(&ds), Some(0)).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_custom_function() {
        let mut registry = FunctionRegistry::new();
        registry.register("acme", "answer", |_: &FunctionContext<'_>| Ok(Value::Int32(42)));
        assert!(registry.contains("ACME", "answer"));
        assert!(registry.get("acme", "missing").is_err());
    }
}
