//! Per-row statement generation

use crate::driver::{Driver, StatementParts};
use crate::error::{Error, Result};
use crate::function::{substitute_placeholders, VariableEvaluator};
use crate::model::{DataSet, Destination, FieldDef, LoadAction, Scenario, Variable, VariableScope};
use crate::types::Value;

use super::merge::rewrite_insert_as_update;
use super::{wants_merge_fallback, ExecutionMode, GenerationContext};

/// Names of the record variable and cursor of a cursor loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CursorNames {
    pub variable: String,
    pub cursor: String,
}

/// Lines generated for one row plus its large-object values
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RowScript {
    pub lines: Vec<String>,
    /// Values bound positionally when the row runs statement by statement
    pub lobs: Vec<Value>,
}

impl RowScript {
    /// Physical line count of the row's SQL
    pub fn line_count(&self) -> usize {
        self.lines.iter().map(|l| l.matches('\n').count() + 1).sum()
    }
}

pub(crate) struct RowBuilder<'a> {
    pub driver: &'a dyn Driver,
    pub evaluator: VariableEvaluator<'a>,
    pub scenario: &'a Scenario,
    pub destination: &'a Destination,
    pub data_set: Option<&'a DataSet>,
    pub fields: &'a [FieldDef],
    pub mode: ExecutionMode,
    pub binds_variables: bool,
    pub cursor: Option<&'a CursorNames>,
}

impl RowBuilder<'_> {
    /// Generate the lines of one row; `row` is `None` for the cursor loop
    pub fn build(&self, ctx: &mut GenerationContext, row: Option<usize>) -> Result<RowScript> {
        let mut script = RowScript::default();
        let delimiter = self.driver.statement_delimiter();

        self.scoped_assignments(ctx, row, VariableScope::Before, &mut script.lines)?;

        let statement = match &self.destination.sql {
            Some(template) => terminate(&self.substitute(ctx, template, row, &mut script.lobs)?, delimiter),
            None => terminate(&self.generated(ctx, row, &mut script.lobs)?, delimiter),
        };

        let guarded = match &self.destination.condition {
            Some(condition) => {
                let condition = self.substitute(ctx, condition, row, &mut script.lobs)?;
                let then = match &self.destination.then_sql {
                    Some(sql) => terminate(&self.substitute(ctx, sql, row, &mut script.lobs)?, delimiter),
                    None => statement.clone(),
                };
                let otherwise = match &self.destination.else_sql {
                    Some(sql) => Some(terminate(&self.substitute(ctx, sql, row, &mut script.lobs)?, delimiter)),
                    None => None,
                };
                self.driver
                    .conditional(&condition, &then, otherwise.as_deref())
                    .ok_or_else(|| {
                        Error::unsupported(format!("{} has no conditional statements", self.driver.name()))
                    })?
            }
            None => statement.clone(),
        };

        let policy = &self.destination.on_exception;
        if self.mode == ExecutionMode::Callable && !policy.is_raise() {
            let update = match wants_merge_fallback(self.destination) {
                true => Some(rewrite_insert_as_update(&statement, &self.destination.key_fields)?.sql),
                false => None,
            };
            let handler = self.driver.on_exception_body(policy.action, update.as_deref());
            let handler_first = self.driver.on_exception_handler_first();

            push_nonempty(&mut script.lines, self.driver.on_exception_begin());
            if handler_first {
                push_nonempty(&mut script.lines, handler.clone());
            }
            script.lines.push(guarded);
            if !handler_first {
                push_nonempty(&mut script.lines, handler);
            }
            push_nonempty(&mut script.lines, self.driver.on_exception_end());
        } else {
            script.lines.push(guarded);
        }

        self.scoped_assignments(ctx, row, VariableScope::After, &mut script.lines)?;

        if let Some(cursor) = self.cursor {
            let start = self
                .driver
                .cursor_loop_start(&cursor.variable, &cursor.cursor)
                .ok_or_else(|| Error::unsupported(format!("{} has no cursor loops", self.driver.name())))?;
            script.lines.insert(0, start);
            script.lines.push(self.driver.cursor_loop_end());
        } else if let (ExecutionMode::PerStatement, Some(row)) = (self.mode, row) {
            let name = &self.destination.name;
            script.lines.insert(0, self.driver.block_begin_marker(name, row));
            script.lines.push(self.driver.block_end_marker(name, row));
        }
        Ok(script)
    }

    /// Declare and assign the destination's variables of one scope
    fn scoped_assignments(
        &self,
        ctx: &mut GenerationContext,
        row: Option<usize>,
        scope: VariableScope,
        lines: &mut Vec<String>,
    ) -> Result<()> {
        if !self.binds_variables {
            return Ok(());
        }
        for variable in self.destination.variables.iter().filter(|v| v.scope == scope) {
            let sql_type = ctx.resolve_type(variable, self.data_set);
            ctx.declare(&variable.name, self.driver.declare_variable(&variable.name, sql_type));
            let value = self.evaluate(ctx, variable, row)?;
            lines.push(self.driver.assign_variable(&variable.name, &value));
        }
        Ok(())
    }

    fn evaluate(&self, ctx: &mut GenerationContext, variable: &Variable, row: Option<usize>) -> Result<String> {
        let sql_type = ctx.resolve_type(variable, self.data_set);
        Ok(self
            .evaluator
            .evaluate(variable, self.data_set, row)?
            .to_sql(self.driver, sql_type))
    }

    /// SQL text of a variable where it is referenced
    fn variable_expr(&self, ctx: &mut GenerationContext, variable: &Variable, row: Option<usize>) -> Result<String> {
        if self.binds_variables && (variable.global || variable.scope != VariableScope::Runtime) {
            return Ok(variable.name.clone());
        }
        let row = if variable.global { None } else { row };
        self.evaluate(ctx, variable, row)
    }

    /// SQL text of a field of the current row
    fn field_expr(&self, field: &str, row: Option<usize>, lobs: &mut Vec<Value>) -> Option<String> {
        if let Some(cursor) = self.cursor {
            return Some(self.driver.cursor_field(&cursor.variable, field));
        }
        let data_set = self.data_set?;
        let def = data_set.field(field)?;
        let value = row
            .and_then(|row| data_set.value(row, field))
            .cloned()
            .unwrap_or(Value::Null);

        if self.mode == ExecutionMode::PerStatement && def.is_lob() && !value.is_null() {
            lobs.push(value);
            return Some(self.driver.parameter_placeholder(lobs.len()));
        }
        Some(self.driver.format_value(&value, def.sql_type))
    }

    fn substitute(
        &self,
        ctx: &mut GenerationContext,
        template: &str,
        row: Option<usize>,
        lobs: &mut Vec<Value>,
    ) -> Result<String> {
        substitute_placeholders(template, |name| {
            if let Some(variable) = self.destination.variable(name) {
                return self.variable_expr(ctx, variable, row).map(Some);
            }
            if let Some(variable) = self.scenario.variable(name) {
                return self.variable_expr(ctx, variable, row).map(Some);
            }
            if self.cursor.is_some() && !self.fields.iter().any(|f| f.name.eq_ignore_ascii_case(name)) {
                return Ok(None);
            }
            Ok(self.field_expr(name, row, lobs))
        })
    }

    /// Statement built from the load action and the included fields
    fn generated(&self, ctx: &mut GenerationContext, row: Option<usize>, lobs: &mut Vec<Value>) -> Result<String> {
        let destination = self.destination;
        let table = destination
            .object_name
            .as_deref()
            .ok_or_else(|| Error::validation(format!("destination '{}': no object name", destination.name)))?;

        let mut columns = Vec::with_capacity(self.fields.len());
        let mut values = Vec::with_capacity(self.fields.len());
        for field in self.fields {
            let value = match destination.variable_for_field(&field.name) {
                Some(variable) => self.variable_expr(ctx, variable, row)?,
                None => self
                    .field_expr(&field.name, row, lobs)
                    .unwrap_or_else(|| "NULL".to_string()),
            };
            columns.push(field.name.clone());
            values.push(value);
        }

        // Runtime variables that bind no data set field become extra columns.
        for variable in &destination.variables {
            let bound = self.fields.iter().any(|f| variable.binds(&f.name))
                || self.data_set.is_some_and(|ds| ds.field(variable.bound_field()).is_some());
            if bound || !variable.include || variable.scope != VariableScope::Runtime {
                continue;
            }
            columns.push(variable.name.clone());
            values.push(self.variable_expr(ctx, variable, row)?);
        }

        let parts = StatementParts {
            table,
            columns: &columns,
            values: &values,
            keys: &destination.key_fields,
        };
        match destination.load_action.unwrap_or(LoadAction::Insert) {
            LoadAction::Insert => self.driver.insert_sql(&parts),
            LoadAction::Update => self.driver.update_sql(&parts),
            LoadAction::Merge => self.driver.merge_sql(&parts),
            LoadAction::Delete => self.driver.delete_sql(&parts),
        }
    }
}

fn terminate(statement: &str, delimiter: &str) -> String {
    let body = statement.trim_end();
    let body = body.strip_suffix(delimiter).unwrap_or(body).trim_end();
    format!("{}{}", body, delimiter)
}

fn push_nonempty(lines: &mut Vec<String>, line: String) {
    if !line.is_empty() {
        lines.push(line);
    }
}
