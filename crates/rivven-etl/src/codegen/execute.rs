//! Running assembled scripts against a connection

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::EtlConfig;
use crate::connection::{execute_guarded, Connection};
use crate::connector::ConnectorParams;
use crate::error::{Error, Result};
use crate::model::{Destination, OnExceptionAction, Scenario, StatementFailure};
use crate::result::EtlResult;
use crate::types::Value;

use super::merge::{bind_lob_params, rewrite_insert_as_update};
use super::script::{self, AssembledScript};
use super::splitter::{split_blocks, SqlStatement};
use super::{CodeGen, ExecutionMode, FailureDiagnostics, GenerationContext, GenerationState};

/// Counters of one destination's execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Script units run
    pub units: usize,
    /// Statements (or callable blocks) run
    pub statements: usize,
    /// Statements that failed and were handled by the policy
    pub failed: usize,
    /// Failed inserts retried as updates
    pub merged: usize,
    /// Row blocks abandoned by `Ignore`
    pub ignored_blocks: usize,
    /// Intermediate commits
    pub commits: usize,
}

/// A fatal failure and where it happened
struct Failure {
    error: Error,
    unit: Option<usize>,
    statement: Option<SqlStatement>,
}

impl From<Error> for Failure {
    fn from(error: Error) -> Self {
        Self {
            error,
            unit: None,
            statement: None,
        }
    }
}

impl CodeGen {
    /// Run the destination's phases against `conn`
    ///
    /// The caller owns the transaction; with `commit_per_block` the engine
    /// commits and begins again after every unit. On a fatal failure the
    /// cleanup-on-exception scripts run, the context records
    /// [`FailureDiagnostics`], and the error is returned.
    pub async fn execute(
        &self,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
        conn: &dyn Connection,
    ) -> Result<ExecutionSummary> {
        ctx.require(GenerationState::Prepared, "execute")?;
        if destination.connector.is_some() {
            return Err(Error::internal(format!(
                "destination '{}' is connector backed; use persist",
                destination.name
            )));
        }
        if ctx.assembled.len() != ctx.units.len() {
            self.assemble_code(ctx, config, scenario, destination).await?;
        }

        let mut summary = ExecutionSummary::default();
        let outcome = self
            .run_phases(ctx, scenario, destination, conn, &mut summary)
            .await;
        run_ignoring_errors(conn, &ctx.phases.cleanup_after, "cleanup-after").await;
        ctx.state = GenerationState::Executed;

        match outcome {
            Ok(()) => {
                info!(
                    destination = %destination.name,
                    units = summary.units,
                    statements = summary.statements,
                    failed = summary.failed,
                    merged = summary.merged,
                    "Executed destination"
                );
                Ok(summary)
            }
            Err(failure) => {
                self.record_failure(ctx, config, scenario, &failure).await;
                run_ignoring_errors(conn, &ctx.phases.cleanup_on_exception, "cleanup-on-exception").await;
                Err(failure.error)
            }
        }
    }

    async fn run_phases(
        &self,
        ctx: &GenerationContext,
        scenario: &Scenario,
        destination: &Destination,
        conn: &dyn Connection,
        summary: &mut ExecutionSummary,
    ) -> std::result::Result<(), Failure> {
        for sql in &ctx.phases.init {
            conn.execute_script(sql).await?;
        }
        run_ignoring_errors(conn, &ctx.phases.cleanup_before, "cleanup-before").await;
        for sql in &ctx.phases.create {
            conn.execute_script(sql).await?;
        }

        let mode = ctx.mode.unwrap_or(ExecutionMode::PerStatement);
        for unit in &ctx.assembled {
            debug!(script = %unit.name, mode = ?mode, "Running script unit");
            let run = match mode {
                ExecutionMode::Callable => self.run_callable(scenario, destination, unit, conn).await,
                ExecutionMode::PerStatement => self.run_statements(destination, unit, conn, summary).await,
            };
            run.map_err(|mut failure| {
                failure.unit = Some(unit.index);
                failure
            })?;
            if mode == ExecutionMode::Callable {
                summary.statements += 1;
            }
            summary.units += 1;

            if scenario.commit_per_block {
                conn.commit().await?;
                conn.begin().await?;
                summary.commits += 1;
            }
        }
        Ok(())
    }

    async fn run_callable(
        &self,
        scenario: &Scenario,
        destination: &Destination,
        unit: &AssembledScript,
        conn: &dyn Connection,
    ) -> std::result::Result<(), Failure> {
        let driver = self.driver.as_ref();
        if driver.supports_anonymous_blocks() {
            conn.execute_script(&unit.sql).await?;
            return Ok(());
        }

        let name = driver.procedure_name(scenario.script_name(), &destination.name, unit.index);
        conn.execute_script(&driver.create_procedure_sql(&name, &unit.sql)?)
            .await?;
        let called = conn.execute_script(&driver.call_procedure_sql(&name)).await;
        if let Err(e) = conn.execute_script(&driver.drop_procedure_sql(&name)).await {
            warn!(procedure = %name, error = %e, "Failed to drop procedure");
        }
        called.map_err(Failure::from)
    }

    async fn run_statements(
        &self,
        destination: &Destination,
        unit: &AssembledScript,
        conn: &dyn Connection,
        summary: &mut ExecutionSummary,
    ) -> std::result::Result<(), Failure> {
        let driver = self.driver.as_ref();
        let policy = &destination.on_exception;

        for block in split_blocks(&unit.sql, driver.statement_delimiter()) {
            let lobs = block
                .row
                .and_then(|row| unit.lobs.get(&row))
                .map(Vec::as_slice)
                .unwrap_or_default();

            for statement in &block.statements {
                let params = bind_lob_params(driver, &statement.sql, lobs);
                summary.statements += 1;
                let savepoint = policy
                    .use_savepoint
                    .then(|| format!("etl_sp_{}", summary.statements));

                let error = match execute_guarded(conn, savepoint.as_deref(), &statement.sql, &params).await {
                    Ok(_) => continue,
                    Err(e) => e,
                };
                summary.failed += 1;

                let failed_at = |error: Error| Failure {
                    error,
                    unit: None,
                    statement: Some(statement.clone()),
                };

                let mut action = match error.is_statement_error() {
                    true => policy.classify(&StatementFailure {
                        destination: &destination.name,
                        row: block.row,
                        sql: &statement.sql,
                        error: &error,
                    }),
                    false => OnExceptionAction::Raise,
                };
                if action != OnExceptionAction::Raise
                    && savepoint.is_none()
                    && driver.requires_rollback_after_sql_error()
                {
                    warn!(
                        destination = %destination.name,
                        "{} cannot continue after a failed statement without savepoints",
                        driver.name()
                    );
                    action = OnExceptionAction::Raise;
                }

                match action {
                    OnExceptionAction::Continue => {
                        warn!(destination = %destination.name, row = ?block.row, error = %error, "Statement failed, continuing");
                    }
                    OnExceptionAction::Ignore => {
                        warn!(destination = %destination.name, row = ?block.row, error = %error, "Statement failed, skipping row");
                        summary.ignored_blocks += 1;
                        break;
                    }
                    OnExceptionAction::Merge => {
                        self.merge_retry(conn, destination, block.row, statement, &params, savepoint.as_deref())
                            .await
                            .map_err(failed_at)?;
                        summary.merged += 1;
                    }
                    OnExceptionAction::Raise => return Err(failed_at(error)),
                }
            }
        }
        Ok(())
    }

    async fn merge_retry(
        &self,
        conn: &dyn Connection,
        destination: &Destination,
        row: Option<usize>,
        statement: &SqlStatement,
        params: &[Value],
        savepoint: Option<&str>,
    ) -> Result<()> {
        let row = row.ok_or_else(|| {
            Error::merge(format!(
                "statement at line {} of '{}' belongs to no row",
                statement.line, destination.name
            ))
        })?;
        let rewrite = rewrite_insert_as_update(&statement.sql, &destination.key_fields)?;
        let params = rewrite.reorder(params)?;
        debug!(destination = %destination.name, row, sql = %rewrite.sql, "Retrying insert as update");

        execute_guarded(conn, savepoint, &rewrite.sql, &params)
            .await
            .map_err(|e| Error::merge(format!("update of row {} failed: {}", row, e)))?;
        Ok(())
    }

    async fn record_failure(
        &self,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        failure: &Failure,
    ) {
        let message = failure.error.to_string();
        let Some(unit) = failure.unit.and_then(|idx| ctx.assembled.get(idx)) else {
            warn!(error = %message, "Destination failed outside script units");
            return;
        };

        let line = self
            .driver
            .error_line(&message)
            .or_else(|| failure.statement.as_ref().map(|s| s.line));
        let mut saved_to: Option<PathBuf> = None;
        if scenario.save_scripts {
            let dir = config.scripts.error_script_dir();
            match script::save(&dir, &format!("{}_error", unit.name), &unit.sql).await {
                Ok(path) => saved_to = Some(path),
                Err(e) => warn!(script = %unit.name, error = %e, "Failed to save error script"),
            }
        }

        warn!(script = %unit.name, line = ?line, error = %message, "Script unit failed");
        ctx.diagnostics = Some(FailureDiagnostics {
            script_name: unit.name.clone(),
            sql: unit.sql.clone(),
            statement: failure.statement.as_ref().map(|s| s.sql.clone()),
            line,
            message,
            saved_to,
        });
    }

    /// Write a connector-backed destination through its connector
    ///
    /// Runs `pre_persist`, `persist` and `post_persist`, stopping at the
    /// first non-OK result; `cleanup` always runs.
    pub async fn persist(
        &self,
        ctx: &mut GenerationContext,
        scenario: &Scenario,
        destination: &Destination,
    ) -> Result<EtlResult> {
        ctx.require(GenerationState::Prepared, "persist")?;
        let Some(connector_ref) = destination.connector.as_ref() else {
            return Err(Error::internal(format!(
                "destination '{}' has no connector",
                destination.name
            )));
        };
        let Some(data_set) = destination.data_set.as_deref() else {
            return Ok(EtlResult::validation_failed(format!(
                "destination '{}': no data set to persist",
                destination.name
            )));
        };
        let connector = self.connectors.get(&connector_ref.key)?;

        let mut params = ConnectorParams::new(&connector_ref.properties);
        params.monitor = ctx.monitor.as_deref();
        let driver = Some(self.driver.as_ref());

        let outcome: Result<EtlResult> = async {
            let result = connector.pre_persist(&params).await?;
            if !result.is_ok() {
                return Ok(result);
            }
            let result = connector.persist(&params, data_set, driver).await?;
            if !result.is_ok() {
                return Ok(result);
            }
            connector.post_persist(&params).await
        }
        .await;

        if let Err(e) = connector.cleanup().await {
            warn!(connector = %connector.name(), error = %e, "Connector cleanup failed");
        }
        ctx.state = GenerationState::Executed;
        info!(
            scenario = %scenario.name,
            destination = %destination.name,
            connector = %connector.name(),
            records = data_set.record_count(),
            "Persisted data set"
        );
        outcome
    }
}

async fn run_ignoring_errors(conn: &dyn Connection, scripts: &[String], phase: &str) {
    for sql in scripts {
        if let Err(e) = conn.execute_script(sql).await {
            warn!(phase, error = %e, "Ignoring failed script");
        }
    }
}
