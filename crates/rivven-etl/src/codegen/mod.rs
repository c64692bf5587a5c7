//! Code generation and execution engine
//!
//! A destination goes through three steps on an explicit
//! [`GenerationContext`]:
//!
//! 1. [`CodeGen::prepare`] turns every data set row into SQL lines and packs
//!    them into [`ScriptUnit`]s bounded by the driver's line limit
//! 2. [`CodeGen::assemble_code`] wraps each unit with the dialect's declare,
//!    begin and end fragments (and saves it when the scenario asks to)
//! 3. [`CodeGen::execute`] runs the init, cleanup-before, create, unit and
//!    cleanup-after phases against a connection
//!
//! Connector-backed destinations skip SQL entirely and go through
//! [`CodeGen::persist`].
//!
//! # Execution modes
//!
//! | Mode | When | Units run as |
//! |------|------|--------------|
//! | [`ExecutionMode::Callable`] | callable statements, and no LOB fields or binary-in-proc support | one anonymous block, or a create/call/drop procedure cycle |
//! | [`ExecutionMode::PerStatement`] | otherwise | individual statements with savepoint recovery |

mod execute;
mod merge;
mod script;
mod splitter;
mod statement;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::EtlConfig;
use crate::connector::ConnectorRegistry;
use crate::driver::{sanitize_identifier, Driver};
use crate::error::{Error, Result};
use crate::function::{FunctionRegistry, VariableEvaluator};
use crate::model::{DataSet, Destination, FieldDef, LoadAction, Scenario, Variable};
use crate::monitor::TransactionMonitor;
use crate::result::{EtlResult, ReturnCode};
use crate::task::{NoopTaskExecutor, TaskExecutor, TaskResult, TaskTarget};
use crate::types::SqlType;

pub use execute::ExecutionSummary;
pub use merge::{bind_lob_params, rewrite_insert_as_update, MergeRewrite};
pub use script::{AssembledScript, ScriptUnit};
pub use splitter::{
    count_placeholders, parse_marker, split_blocks, split_statements, Marker, SqlStatement,
    StatementBlock,
};

use script::UnitBuilder;
use statement::{CursorNames, RowBuilder};

/// How script units reach the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionMode {
    /// Each unit is one callable block
    Callable,
    /// Units are split and run statement by statement
    PerStatement,
}

impl ExecutionMode {
    /// Mode for a destination with or without large-object fields
    pub fn decide(driver: &dyn Driver, has_lobs: bool) -> Self {
        if driver.supports_callable_statement() && (!has_lobs || driver.supports_binary_in_proc()) {
            Self::Callable
        } else {
            Self::PerStatement
        }
    }
}

/// Lifecycle of a generation context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GenerationState {
    /// Fresh or reset
    #[default]
    Created,
    /// Rows converted into script units
    Prepared,
    /// Execution attempted
    Executed,
}

/// Where a destination failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureDiagnostics {
    /// Name of the failing script unit
    pub script_name: String,
    /// Full text of the failing script unit
    pub sql: String,
    /// The failing statement, when run statement by statement
    pub statement: Option<String>,
    /// Best-effort 1-based line of the failure within the unit
    pub line: Option<usize>,
    /// Error message
    pub message: String,
    /// Where the failing unit was saved
    pub saved_to: Option<PathBuf>,
}

/// Scripts of the non-row execution phases
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseQueue {
    /// Phase 1, fatal
    pub init: Vec<String>,
    /// Phase 2, errors ignored
    pub cleanup_before: Vec<String>,
    /// Phase 3, fatal
    pub create: Vec<String>,
    /// Phase 5, always attempted, errors ignored
    pub cleanup_after: Vec<String>,
    /// Run when the destination fails, errors ignored
    pub cleanup_on_exception: Vec<String>,
}

/// Mutable state of one destination's generation and execution
///
/// Never shared between destinations running concurrently; use a fresh
/// context (or [`reset`](Self::reset)) for each destination.
#[derive(Debug, Default)]
pub struct GenerationContext {
    state: GenerationState,
    load_index: usize,
    monitor: Option<Arc<TransactionMonitor>>,
    mode: Option<ExecutionMode>,
    declarations: Vec<String>,
    declared: HashSet<String>,
    resolved: HashMap<String, SqlType>,
    cursor_variables: Vec<String>,
    cursor_declarations: Vec<String>,
    globals: Vec<String>,
    units: Vec<ScriptUnit>,
    assembled: Vec<AssembledScript>,
    phases: PhaseQueue,
    diagnostics: Option<FailureDiagnostics>,
    rows_prepared: usize,
    rows_rejected: usize,
    stopped: bool,
}

impl GenerationContext {
    /// Fresh context for the first destination of a scenario
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh context for the destination at `load_index`
    ///
    /// Only unit 0 of load index 0 opens with the dialect's `begin`; every
    /// other unit uses `begin_split`.
    pub fn for_load(load_index: usize) -> Self {
        Self {
            load_index,
            ..Self::default()
        }
    }

    /// Attach the scenario's transaction monitor
    pub fn with_monitor(mut self, monitor: Arc<TransactionMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Clear everything accumulated and return to `Created`
    ///
    /// The load index and monitor are kept.
    pub fn reset(&mut self) {
        *self = Self {
            load_index: self.load_index,
            monitor: self.monitor.take(),
            ..Self::default()
        };
    }

    /// Current lifecycle state
    pub fn state(&self) -> GenerationState {
        self.state
    }

    /// Load index of the destination
    pub fn load_index(&self) -> usize {
        self.load_index
    }

    /// Execution mode decided at prepare
    pub fn mode(&self) -> Option<ExecutionMode> {
        self.mode
    }

    /// Script units built by prepare
    pub fn units(&self) -> &[ScriptUnit] {
        &self.units
    }

    /// Units wrapped by the last assembly
    pub fn assembled(&self) -> &[AssembledScript] {
        &self.assembled
    }

    /// Scripts of the non-row phases
    pub fn phases(&self) -> &PhaseQueue {
        &self.phases
    }

    /// Variable declarations collected so far
    pub fn declarations(&self) -> &[String] {
        &self.declarations
    }

    /// Failure details of the last execution
    pub fn diagnostics(&self) -> Option<&FailureDiagnostics> {
        self.diagnostics.as_ref()
    }

    /// Rows converted into SQL
    pub fn rows_prepared(&self) -> usize {
        self.rows_prepared
    }

    /// Rows skipped by an inline task
    pub fn rows_rejected(&self) -> usize {
        self.rows_rejected
    }

    /// Whether an inline task stopped row processing
    pub fn stopped(&self) -> bool {
        self.stopped
    }

    /// Resolved SQL type of a variable, assigned once per pass
    pub(crate) fn resolve_type(&mut self, variable: &Variable, data_set: Option<&DataSet>) -> SqlType {
        *self
            .resolved
            .entry(variable.name.to_lowercase())
            .or_insert_with(|| VariableEvaluator::resolve_type(variable, data_set))
    }

    /// Record a declaration once per variable name
    pub(crate) fn declare(&mut self, name: &str, declaration: String) {
        if self.declared.insert(name.to_lowercase()) {
            self.declarations.push(declaration);
        }
    }

    fn require(&self, state: GenerationState, operation: &str) -> Result<()> {
        if self.state != state {
            return Err(Error::internal(format!(
                "cannot {} a generation context in state {:?}",
                operation, self.state
            )));
        }
        Ok(())
    }
}

/// SQL code generator and executor for destinations
#[derive(Clone)]
pub struct CodeGen {
    driver: Arc<dyn Driver>,
    functions: Arc<FunctionRegistry>,
    tasks: Arc<dyn TaskExecutor>,
    connectors: Arc<ConnectorRegistry>,
}

impl std::fmt::Debug for CodeGen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeGen")
            .field("driver", &self.driver.name())
            .field("functions", &self.functions)
            .field("connectors", &self.connectors)
            .finish()
    }
}

impl CodeGen {
    /// Generator with the built-in functions, no inline tasks and no connectors
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self {
            driver,
            functions: Arc::new(FunctionRegistry::with_builtins()),
            tasks: Arc::new(NoopTaskExecutor),
            connectors: Arc::new(ConnectorRegistry::new()),
        }
    }

    /// Use a function registry
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Use a task executor
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskExecutor>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Use a connector registry
    pub fn with_connectors(mut self, connectors: Arc<ConnectorRegistry>) -> Self {
        self.connectors = connectors;
        self
    }

    /// The dialect
    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.driver
    }

    fn validate(&self, destination: &Destination, fields: &[FieldDef]) -> EtlResult {
        let mut result = EtlResult::ok();
        let mut fail = |message: String| result.fail(ReturnCode::ValidationFailed, message);
        let name = &destination.name;

        if destination.connector.is_some() {
            if destination.data_set.is_none() {
                fail(format!("destination '{}': no data set to persist", name));
            }
            return result;
        }

        if destination.uses_cursor() {
            if !self.driver.supports_cursors() {
                fail(format!(
                    "destination '{}': driver {} does not support cursors",
                    name,
                    self.driver.name()
                ));
            }
        } else {
            match destination.data_set.as_deref() {
                None => fail(format!("destination '{}': no data set attached", name)),
                Some(ds) if ds.record_count() > ds.records().len() => fail(format!(
                    "destination '{}': data set '{}' was streamed; {} records were counted but not retained",
                    name,
                    ds.name,
                    ds.record_count()
                )),
                Some(_) => {}
            }
        }

        if destination.sql.is_none() {
            match destination.load_action {
                None => fail(format!("destination '{}': neither SQL nor load action", name)),
                Some(action) => {
                    if action.requires_key() && destination.key_fields.is_empty() {
                        fail(format!("destination '{}': {:?} needs key fields", name, action));
                    }
                }
            }
            if destination.object_name.as_deref().map_or(true, str::is_empty) {
                fail(format!("destination '{}': no object name", name));
            }
            if fields.is_empty() && destination.data_set.is_some() {
                fail(format!("destination '{}': no fields to load", name));
            }
        }

        if destination.scripts.create_table
            && (destination.object_name.is_none() || fields.is_empty())
        {
            fail(format!(
                "destination '{}': create table needs an object name and fields",
                name
            ));
        }
        result
    }

    /// Fields of the destination's statements
    fn fields(destination: &Destination) -> Vec<FieldDef> {
        let data_set = destination.data_set.as_deref();
        match (&destination.metadata, data_set, destination.uses_cursor()) {
            (Some(columns), _, true) => columns
                .iter()
                .enumerate()
                .filter(|(_, c)| destination.includes_field(c))
                .map(|(index, column)| {
                    let sql_type = data_set
                        .and_then(|ds| ds.field(column))
                        .map(|f| f.sql_type)
                        .unwrap_or_default();
                    FieldDef {
                        index,
                        ..FieldDef::new(column.clone(), sql_type)
                    }
                })
                .collect(),
            (_, Some(ds), _) => ds
                .fields()
                .iter()
                .filter(|f| destination.includes_field(&f.name))
                .cloned()
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Convert the destination's rows into script units
    ///
    /// Missing inputs yield a `ValidationFailed` result and leave the context
    /// in `Created`. Unsupported combinations (a condition or cursor on a
    /// dialect without procedural blocks) and evaluation failures are errors.
    pub async fn prepare(
        &self,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
    ) -> Result<EtlResult> {
        ctx.require(GenerationState::Created, "prepare")?;

        let fields = Self::fields(destination);
        let validation = self.validate(destination, &fields);
        if !validation.is_ok() {
            info!(destination = %destination.name, result = %validation, "Destination failed validation");
            return Ok(validation);
        }

        if destination.connector.is_some() {
            ctx.state = GenerationState::Prepared;
            return Ok(EtlResult::ok());
        }

        let driver = self.driver.as_ref();
        let mode = ExecutionMode::decide(driver, fields.iter().any(FieldDef::is_lob));
        if mode == ExecutionMode::PerStatement {
            if destination.condition.is_some() {
                return Err(Error::unsupported(format!(
                    "destination '{}': conditions need procedural blocks, which {} cannot run here",
                    destination.name,
                    driver.name()
                )));
            }
            if destination.uses_cursor() {
                return Err(Error::unsupported(format!(
                    "destination '{}': cursor loading needs procedural blocks",
                    destination.name
                )));
            }
        }
        ctx.mode = Some(mode);
        let binds_variables =
            mode == ExecutionMode::Callable && driver.supports_params_in_anonymous_blocks();

        self.queue_phase_scripts(ctx, destination, &fields);

        let data_set = destination.data_set.as_deref();
        let evaluator = VariableEvaluator::new(&self.functions, driver);

        if binds_variables {
            for variable in &scenario.variables {
                let sql_type = ctx.resolve_type(variable, data_set);
                ctx.declare(&variable.name, driver.declare_variable(&variable.name, sql_type));
                let value = evaluator
                    .evaluate(variable, data_set, None)?
                    .to_sql(driver, sql_type);
                ctx.globals.push(driver.assign_variable(&variable.name, &value));
            }
        }

        let cursor = match destination.uses_cursor() {
            true => Some(self.declare_cursor(ctx, destination)?),
            false => None,
        };

        let builder = RowBuilder {
            driver,
            evaluator,
            scenario,
            destination,
            data_set,
            fields: &fields,
            mode,
            binds_variables,
            cursor: cursor.as_ref(),
        };
        let mut units = UnitBuilder::new(driver.lines_limit());

        if cursor.is_some() {
            units.push(None, builder.build(ctx, None)?);
            ctx.rows_prepared = 1;
        } else if let Some(ds) = data_set {
            for row in 0..ds.records().len() {
                if !destination.tasks.is_empty() {
                    let target = TaskTarget::Destination(destination);
                    match self
                        .tasks
                        .execute_inline_tasks(config, target, scenario, Some(row))
                        .await?
                    {
                        TaskResult::Proceed => {}
                        TaskResult::Reject => {
                            ctx.rows_rejected += 1;
                            continue;
                        }
                        TaskResult::Stop => {
                            debug!(destination = %destination.name, row, "Inline task stopped row processing");
                            ctx.stopped = true;
                            break;
                        }
                    }
                }
                units.push(Some(row), builder.build(ctx, Some(row))?);
                ctx.rows_prepared += 1;
            }
        }

        ctx.units = units.finish();
        ctx.state = GenerationState::Prepared;
        info!(
            destination = %destination.name,
            mode = ?mode,
            rows = ctx.rows_prepared,
            rejected = ctx.rows_rejected,
            units = ctx.units.len(),
            "Prepared destination"
        );
        Ok(EtlResult::ok())
    }

    fn queue_phase_scripts(&self, ctx: &mut GenerationContext, destination: &Destination, fields: &[FieldDef]) {
        let scripts = &destination.scripts;
        ctx.phases.init.extend(scripts.init.clone());
        if scripts.create_table {
            if let Some(table) = &destination.object_name {
                ctx.phases.cleanup_before.push(self.driver.drop_table_sql(table));
                ctx.phases.create.push(self.driver.create_table_sql(table, fields));
            }
        }
        ctx.phases.cleanup_after.extend(scripts.cleanup_after.clone());
        ctx.phases
            .cleanup_on_exception
            .extend(scripts.cleanup_on_exception.clone());
    }

    fn declare_cursor(&self, ctx: &mut GenerationContext, destination: &Destination) -> Result<CursorNames> {
        let driver = self.driver.as_ref();
        let base = sanitize_identifier(&destination.name).to_lowercase();
        let names = CursorNames {
            variable: format!("{}_rec", base),
            cursor: format!("{}_cur", base),
        };
        let query = match (&destination.cursor_sql, &destination.cursor_table) {
            (Some(sql), _) => sql.clone(),
            (None, Some(table)) => format!("SELECT * FROM {}", driver.quote_table(table)),
            (None, None) => return Err(Error::validation("cursor without table or query")),
        };
        let unsupported = || Error::unsupported(format!("{} has no cursors", driver.name()));

        ctx.cursor_variables
            .push(driver.declare_cursor_variable(&names.variable).ok_or_else(unsupported)?);
        ctx.cursor_declarations
            .push(driver.declare_cursor(&names.cursor, &query).ok_or_else(unsupported)?);

        if destination.drop_cursor_table {
            if let Some(table) = &destination.cursor_table {
                ctx.phases.cleanup_after.push(driver.drop_table_sql(table));
            }
        }
        Ok(names)
    }

    /// Wrap the prepared units with dialect headers and footers
    ///
    /// Saves every unit to `{script_dir}/{name}.sql` when the scenario saves
    /// scripts. Assembly is deterministic: the same destination prepared on
    /// a fresh context yields identical text.
    pub async fn assemble_code<'a>(
        &self,
        ctx: &'a mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
    ) -> Result<&'a [AssembledScript]> {
        ctx.require(GenerationState::Prepared, "assemble")?;
        let mode = ctx.mode.unwrap_or(ExecutionMode::PerStatement);
        let mut assembled = script::assemble(self.driver.as_ref(), ctx, mode, scenario, destination);

        if scenario.save_scripts {
            let dir = config.scripts.script_dir();
            for script in &mut assembled {
                script.path = Some(script::save(&dir, &script.name, &script.sql).await?);
            }
        }
        debug!(destination = %destination.name, units = assembled.len(), "Assembled script units");
        ctx.assembled = assembled;
        Ok(&ctx.assembled)
    }
}

/// Whether the destination needs an update fallback for merges
pub(crate) fn wants_merge_fallback(destination: &Destination) -> bool {
    destination.on_exception.action == crate::model::OnExceptionAction::Merge
        && destination.load_action.unwrap_or(LoadAction::Insert) == LoadAction::Insert
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverOptions, MySqlDriver, PostgresDriver, SqliteDriver};
    use crate::model::{OnException, OnExceptionAction, PhaseScripts, VariableScope};
    use crate::types::Value;

    fn data() -> Arc<DataSet> {
        Arc::new(
            DataSet::new("src")
                .with_field("id", SqlType::Integer)
                .with_field("name", SqlType::Varchar)
                .with_record(vec![Value::Int32(1), Value::from("a")])
                .unwrap()
                .with_record(vec![Value::Int32(2), Value::from("b'c")])
                .unwrap()
                .with_record(vec![Value::Int32(3), Value::Null])
                .unwrap(),
        )
    }

    fn insert_dest() -> Destination {
        Destination::load("load", LoadAction::Insert, "t2").with_data_set(data())
    }

    async fn prepared(codegen: &CodeGen, destination: &Destination) -> GenerationContext {
        let mut ctx = GenerationContext::new();
        let scenario = Scenario::new("s", codegen.driver().name());
        let result = codegen
            .prepare(&mut ctx, &EtlConfig::default(), &scenario, destination)
            .await
            .unwrap();
        assert!(result.is_ok(), "{}", result);
        ctx
    }

    #[test]
    fn test_execution_mode() {
        let sqlite = SqliteDriver::default();
        let postgres = PostgresDriver::default();
        let mysql = MySqlDriver::default();
        assert_eq!(ExecutionMode::decide(&sqlite, false), ExecutionMode::PerStatement);
        assert_eq!(ExecutionMode::decide(&postgres, false), ExecutionMode::Callable);
        assert_eq!(ExecutionMode::decide(&postgres, true), ExecutionMode::PerStatement);
        assert_eq!(ExecutionMode::decide(&mysql, true), ExecutionMode::Callable);

        let postgres_bin = PostgresDriver::new(DriverOptions {
            supports_binary_in_proc: Some(true),
            ..DriverOptions::default()
        });
        assert_eq!(ExecutionMode::decide(&postgres_bin, true), ExecutionMode::Callable);
    }

    #[tokio::test]
    async fn test_prepare_validation_failures() {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        let scenario = Scenario::new("s", "sqlite");
        let config = EtlConfig::default();

        let mut ctx = GenerationContext::new();
        let no_data = Destination::load("d", LoadAction::Insert, "t2");
        let result = codegen.prepare(&mut ctx, &config, &scenario, &no_data).await.unwrap();
        assert_eq!(result.code, ReturnCode::ValidationFailed);
        assert_eq!(ctx.state(), GenerationState::Created);

        let no_key = Destination::load("d", LoadAction::Update, "t2").with_data_set(data());
        let result = codegen.prepare(&mut ctx, &config, &scenario, &no_key).await.unwrap();
        assert!(result.message().contains("key fields"));

        let cursor = insert_dest().with_cursor("stage", true);
        let result = codegen.prepare(&mut ctx, &config, &scenario, &cursor).await.unwrap();
        assert!(result.message().contains("cursors"));
    }

    #[tokio::test]
    async fn test_streamed_data_set_is_not_loaded() {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        let mut streamed = DataSet::new("src").with_field("id", SqlType::Integer);
        streamed.count_streamed_record();
        streamed.count_streamed_record();
        let dest = Destination::load("d", LoadAction::Insert, "t2").with_data_set(Arc::new(streamed));

        let mut ctx = GenerationContext::new();
        let result = codegen
            .prepare(&mut ctx, &EtlConfig::default(), &Scenario::new("s", "sqlite"), &dest)
            .await
            .unwrap();
        assert_eq!(result.code, ReturnCode::ValidationFailed);
        assert!(result.message().contains("streamed"));
        assert_eq!(ctx.rows_prepared(), 0);
    }

    #[tokio::test]
    async fn test_prepare_is_monotonic() {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        let scenario = Scenario::new("s", "sqlite");
        let dest = insert_dest();
        let mut ctx = prepared(&codegen, &dest).await;

        let err = codegen
            .prepare(&mut ctx, &EtlConfig::default(), &scenario, &dest)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Prepared"));

        ctx.reset();
        assert_eq!(ctx.state(), GenerationState::Created);
        assert!(ctx.units().is_empty());
    }

    #[tokio::test]
    async fn test_sqlite_rows_are_marked_blocks() {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        let ctx = prepared(&codegen, &insert_dest()).await;
        assert_eq!(ctx.mode(), Some(ExecutionMode::PerStatement));
        assert_eq!(ctx.rows_prepared(), 3);

        let body = ctx.units()[0].body();
        let blocks = split_blocks(&body, ";");
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].row, Some(1));
        assert!(blocks[1].statements[0].sql.contains("'b''c'"));
        assert!(blocks[2].statements[0].sql.contains("NULL"));
    }

    #[tokio::test]
    async fn test_lines_limit_splits_units() {
        let driver = SqliteDriver::new(DriverOptions::default().with_lines_limit(3));
        let codegen = CodeGen::new(Arc::new(driver));
        let ctx = prepared(&codegen, &insert_dest()).await;

        // each row is a marker, a statement and a marker
        assert_eq!(ctx.units().len(), 3);
        assert!(ctx.units().iter().all(|u| u.line_count <= 3));
        assert_eq!(ctx.units()[2].rows, vec![2]);
    }

    #[tokio::test]
    async fn test_condition_unsupported_without_blocks() {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        let dest = insert_dest().with_condition("{id} > 1", None, None);
        let mut ctx = GenerationContext::new();
        let err = codegen
            .prepare(&mut ctx, &EtlConfig::default(), &Scenario::new("s", "sqlite"), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
    }

    #[tokio::test]
    async fn test_postgres_before_variables_are_declared_once() {
        let codegen = CodeGen::new(Arc::new(PostgresDriver::default()));
        let dest = Destination::new("load")
            .with_sql("INSERT INTO audit (id, who) VALUES ({id}, {who});")
            .with_variable(
                Variable::new("who")
                    .with_field("name")
                    .with_scope(VariableScope::Before),
            )
            .with_data_set(data());
        let mut ctx = prepared(&codegen, &dest).await;
        assert_eq!(ctx.declarations(), ["who TEXT;"]);

        let scripts = codegen
            .assemble_code(&mut ctx, &EtlConfig::default(), &Scenario::new("s", "postgres"), &dest)
            .await
            .unwrap();
        assert_eq!(scripts.len(), 1);
        let sql = &scripts[0].sql;
        assert!(sql.starts_with("DO $$\nDECLARE\nwho TEXT;\nBEGIN"));
        assert!(sql.contains("who := 'a';\nINSERT INTO audit (id, who) VALUES (1, who);"));
        assert!(sql.ends_with("END $$;"));
    }

    #[tokio::test]
    async fn test_phase_scripts_and_cursor_drop() {
        let codegen = CodeGen::new(Arc::new(PostgresDriver::default()));
        let dest = insert_dest()
            .with_metadata(["id", "name"])
            .with_cursor("stage", true)
            .with_scripts(PhaseScripts {
                init: Some("SELECT 1".into()),
                create_table: true,
                cleanup_after: None,
                cleanup_on_exception: Some("DELETE FROM t2".into()),
            });
        let ctx = prepared(&codegen, &dest).await;

        let phases = ctx.phases();
        assert_eq!(phases.init, vec!["SELECT 1".to_string()]);
        assert_eq!(phases.cleanup_before, vec!["DROP TABLE IF EXISTS \"t2\"".to_string()]);
        assert!(phases.create[0].starts_with("CREATE TABLE \"t2\""));
        assert_eq!(phases.cleanup_after, vec!["DROP TABLE IF EXISTS \"stage\"".to_string()]);
        assert_eq!(ctx.rows_prepared(), 1);

        let body = ctx.units()[0].body();
        assert!(body.starts_with("FOR load_rec IN load_cur LOOP"));
        assert!(body.contains("load_rec.\"id\""));
        assert!(body.ends_with("END LOOP;"));
    }

    #[tokio::test]
    async fn test_callable_exception_wrapping() {
        let codegen = CodeGen::new(Arc::new(PostgresDriver::default()));
        let dest = insert_dest()
            .with_keys(["id"])
            .with_on_exception(OnException::new(OnExceptionAction::Merge));
        let ctx = prepared(&codegen, &dest).await;
        let body = ctx.units()[0].body();
        assert!(body.contains("EXCEPTION WHEN unique_violation THEN\nUPDATE \"t2\" SET \"name\" = 'a' WHERE \"id\" = 1;"));

        let raise = prepared(&codegen, &insert_dest()).await;
        assert!(!raise.units()[0].body().contains("EXCEPTION"));
    }
}
