//! Scenario runner
//!
//! Drives one scenario end to end:
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌─────────┐   ┌──────────┐   ┌─────────┐
//! │ sources  │──▶│ Extractor │──▶│ prepare │──▶│ assemble │──▶│ execute │
//! └──────────┘   └───────────┘   └─────────┘   └──────────┘   └─────────┘
//!                      │                                           │
//!                      └── streaming rows ──▶ connector inline_persist
//! ```
//!
//! Every destination gets a fresh [`GenerationContext`] and its own
//! transaction on a connection opened for it. A failure rolls back that
//! transaction and the scenario's [`TransactionMonitor`], then ends the
//! scenario.
//! [`ScenarioRunner::run_all`] is the only place scenarios run concurrently.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::codegen::{AssembledScript, CodeGen, ExecutionSummary, FailureDiagnostics, GenerationContext};
use crate::config::EtlConfig;
use crate::connection::{Connection, ConnectionRegistry};
use crate::connector::{ConnectorParams, ConnectorRegistry, DataSetConnector, DataSetListener};
use crate::driver::{Driver, DriverRegistry};
use crate::error::{Error, Result};
use crate::extract::{ExtractOutcome, Extractor};
use crate::function::FunctionRegistry;
use crate::model::{DataSet, DataSetRecord, Destination, PersistAction, Scenario, Source};
use crate::monitor::TransactionMonitor;
use crate::result::{EtlResult, ReturnCode};
use crate::task::{NoopTaskExecutor, TaskExecutor, TaskResult};

// ============================================================================
// Reports
// ============================================================================

/// What happened to one source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceStatus {
    /// Nothing to extract
    Skipped,
    /// Rejected by an inline task before the fetch
    Rejected,
    /// Stopped, before the fetch or part way through it
    Stopped,
    /// Fully extracted
    Extracted,
    /// Failed, and the failure was ignored
    Ignored(String),
    /// The connector reported a non-OK result
    Failed,
}

/// Per-source line of a [`ScenarioReport`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceReport {
    /// Source name
    pub name: String,
    /// Outcome
    pub status: SourceStatus,
    /// Records retained or, for streaming sources, counted
    pub records: usize,
}

/// Per-destination line of a [`ScenarioReport`]
#[derive(Debug, Clone, Default)]
pub struct DestinationReport {
    /// Destination name
    pub name: String,
    /// Outcome of the destination
    pub result: EtlResult,
    /// Rows turned into statements
    pub rows_prepared: usize,
    /// Rows rejected by inline tasks
    pub rows_rejected: usize,
    /// Execution counters, when scripts ran
    pub summary: Option<ExecutionSummary>,
    /// Generated scripts
    pub scripts: Vec<AssembledScript>,
    /// Where and why execution failed
    pub diagnostics: Option<FailureDiagnostics>,
}

/// Outcome of one scenario run
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    /// Scenario name
    pub scenario: String,
    /// Overall outcome; the first failure wins
    pub result: EtlResult,
    /// Sources in declaration order
    pub sources: Vec<SourceReport>,
    /// Destinations that were processed, in declaration order
    pub destinations: Vec<DestinationReport>,
}

impl ScenarioReport {
    /// Whether the scenario completed without failure
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Report line of a destination
    pub fn destination(&self, name: &str) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| d.name == name)
    }
}

// ============================================================================
// Streaming persist
// ============================================================================

struct StreamTarget<'a> {
    destination: &'a str,
    connector: Arc<dyn DataSetConnector>,
    params: ConnectorParams<'a>,
}

/// Forwards records of a streaming source to connector destinations
///
/// `before` maps to `pre_persist`, each record to `inline_persist` and
/// `after` to `post_persist`. The first non-OK result stops the source and
/// is kept for the report.
pub struct StreamingPersistListener<'a> {
    targets: Vec<StreamTarget<'a>>,
    driver: Option<&'a dyn Driver>,
    failure: Mutex<Option<EtlResult>>,
}

impl<'a> StreamingPersistListener<'a> {
    fn new(driver: Option<&'a dyn Driver>) -> Self {
        Self {
            targets: Vec::new(),
            driver,
            failure: Mutex::new(None),
        }
    }

    fn add_target(&mut self, destination: &'a Destination, connector: Arc<dyn DataSetConnector>, params: ConnectorParams<'a>) {
        self.targets.push(StreamTarget {
            destination: &destination.name,
            connector,
            params,
        });
    }

    /// Names of the destinations fed by this listener
    pub fn destinations(&self) -> impl Iterator<Item = &str> + '_ {
        self.targets.iter().map(|t| t.destination)
    }

    /// First non-OK connector result, if any
    pub fn failure(&self) -> Option<EtlResult> {
        self.failure.lock().clone()
    }

    fn record(&self, destination: &str, result: EtlResult) -> bool {
        if result.is_ok() {
            return true;
        }
        warn!(destination, result = %result, "Streaming persist failed");
        self.failure.lock().get_or_insert(result);
        false
    }

    async fn cleanup(&self) {
        for target in &self.targets {
            if let Err(e) = target.connector.cleanup().await {
                warn!(destination = target.destination, error = %e, "Connector cleanup failed");
            }
        }
    }
}

#[async_trait]
impl DataSetListener for StreamingPersistListener<'_> {
    async fn before(&self, _data_set: &DataSet) -> Result<()> {
        for target in &self.targets {
            let result = target.connector.pre_persist(&target.params).await?;
            self.record(target.destination, result);
        }
        Ok(())
    }

    async fn after(&self, _data_set: &DataSet) -> Result<()> {
        for target in &self.targets {
            let result = target.connector.post_persist(&target.params).await?;
            self.record(target.destination, result);
        }
        Ok(())
    }

    async fn add_record(&self, data_set: &DataSet, record: &DataSetRecord, row: usize) -> Result<TaskResult> {
        if self.failure.lock().is_some() {
            return Ok(TaskResult::Stop);
        }
        for target in &self.targets {
            let result = target
                .connector
                .inline_persist(&target.params, data_set, self.driver, record, row, row + 1)
                .await?;
            if !self.record(target.destination, result) {
                return Ok(TaskResult::Stop);
            }
        }
        Ok(TaskResult::Proceed)
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Runs scenarios against shared registries
#[derive(Clone)]
pub struct ScenarioRunner {
    connections: Arc<ConnectionRegistry>,
    drivers: Arc<DriverRegistry>,
    functions: Arc<FunctionRegistry>,
    tasks: Arc<dyn TaskExecutor>,
    connectors: Arc<ConnectorRegistry>,
}

impl std::fmt::Debug for ScenarioRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScenarioRunner")
            .field("connections", &self.connections)
            .field("drivers", &self.drivers)
            .field("connectors", &self.connectors)
            .finish()
    }
}

impl ScenarioRunner {
    /// Runner with the configured connections, the built-in drivers and
    /// functions, no inline tasks and no connectors
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            connections: Arc::new(config.connection_registry()),
            drivers: Arc::new(DriverRegistry::with_builtins(config.driver_options())),
            functions: Arc::new(FunctionRegistry::with_builtins()),
            tasks: Arc::new(NoopTaskExecutor),
            connectors: Arc::new(ConnectorRegistry::new()),
        }
    }

    /// Replace the connection registry
    pub fn with_connections(mut self, connections: Arc<ConnectionRegistry>) -> Self {
        self.connections = connections;
        self
    }

    /// Replace the driver registry
    pub fn with_drivers(mut self, drivers: Arc<DriverRegistry>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Replace the function registry
    pub fn with_functions(mut self, functions: Arc<FunctionRegistry>) -> Self {
        self.functions = functions;
        self
    }

    /// Replace the inline task executor
    pub fn with_tasks(mut self, tasks: Arc<dyn TaskExecutor>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Replace the connector registry
    pub fn with_connectors(mut self, connectors: Arc<ConnectorRegistry>) -> Self {
        self.connectors = connectors;
        self
    }

    /// Shared connection registry
    pub fn connections(&self) -> &Arc<ConnectionRegistry> {
        &self.connections
    }

    /// Run one scenario
    ///
    /// Setup problems (an unknown driver) are errors. Anything that goes
    /// wrong once extraction starts is rolled back and reported in the
    /// returned [`ScenarioReport`].
    pub async fn run(&self, config: &EtlConfig, scenario: &Scenario) -> Result<ScenarioReport> {
        let driver = self.drivers.get(&scenario.driver)?;
        let monitor = Arc::new(TransactionMonitor::new());
        let mut scenario = scenario.clone();
        let mut report = ScenarioReport {
            scenario: scenario.name.clone(),
            ..Default::default()
        };

        info!(scenario = %scenario.name, driver = %driver.name(), transaction = %monitor.id(), "Running scenario");
        let outcome = self
            .run_steps(config, &mut scenario, &driver, &monitor, &mut report)
            .await;

        match outcome {
            Ok(()) if report.is_ok() => {
                monitor.commit();
                info!(
                    scenario = %scenario.name,
                    destinations = report.destinations.len(),
                    "Scenario completed"
                );
            }
            Ok(()) => {
                self.roll_back_monitor(&monitor).await;
                warn!(scenario = %scenario.name, result = %report.result, "Scenario failed");
            }
            Err(e) => {
                self.roll_back_monitor(&monitor).await;
                error!(scenario = %scenario.name, error = %e, "Scenario failed");
                report.result.fail(ReturnCode::Error, e.to_string());
            }
        }
        Ok(report)
    }

    async fn roll_back_monitor(&self, monitor: &TransactionMonitor) {
        if let Err(e) = monitor.rollback().await {
            warn!(transaction = %monitor.id(), error = %e, "Failed to roll back side effects");
        }
    }

    async fn run_steps(
        &self,
        config: &EtlConfig,
        scenario: &mut Scenario,
        driver: &Arc<dyn Driver>,
        monitor: &Arc<TransactionMonitor>,
        report: &mut ScenarioReport,
    ) -> Result<()> {
        let streamed = self.extract_sources(config, scenario, driver, monitor, report).await?;
        if !report.is_ok() {
            return Ok(());
        }
        attach_data_sets(scenario);

        let codegen = CodeGen::new(Arc::clone(driver))
            .with_functions(Arc::clone(&self.functions))
            .with_tasks(Arc::clone(&self.tasks))
            .with_connectors(Arc::clone(&self.connectors));

        for (index, destination) in scenario.destinations.iter().enumerate() {
            if streamed.contains(&destination.name) {
                debug!(destination = %destination.name, "Destination persisted while streaming");
                report.destinations.push(DestinationReport {
                    name: destination.name.clone(),
                    ..Default::default()
                });
                continue;
            }

            let mut ctx = GenerationContext::for_load(index).with_monitor(Arc::clone(monitor));
            let line = self
                .run_destination(&codegen, &mut ctx, config, scenario, destination)
                .await;
            let failed = !line.result.is_ok();
            if failed {
                report.result.fail(line.result.code, line.result.message());
            }
            report.destinations.push(line);
            if failed {
                break;
            }
        }
        Ok(())
    }

    async fn extract_sources(
        &self,
        config: &EtlConfig,
        scenario: &mut Scenario,
        driver: &Arc<dyn Driver>,
        monitor: &Arc<TransactionMonitor>,
        report: &mut ScenarioReport,
    ) -> Result<HashSet<String>> {
        let extractor = Extractor::new(Arc::clone(&self.connections), Arc::clone(&self.connectors))
            .with_driver(Arc::clone(driver));
        let mut streamed = HashSet::new();
        let mut extracted = Vec::with_capacity(scenario.sources.len());

        let first = scenario.sources.first().map(|s| s.name.clone());
        for source in &scenario.sources {
            // SQL destinations load from retained records, so a source they
            // read is never streamed
            let materialized;
            let source = if source.stream
                && feeds_sql_destination(scenario, &source.name, first.as_deref())
            {
                warn!(source = %source.name, "Streaming disabled; a SQL destination reads this source");
                materialized = Source {
                    stream: false,
                    ..source.clone()
                };
                &materialized
            } else {
                source
            };

            let mut listener = StreamingPersistListener::new(Some(driver.as_ref()));
            if source.stream {
                for destination in scenario.destinations.iter().filter(|d| d.source.as_deref() == Some(&source.name)) {
                    let Some(connector_ref) = destination.connector.as_ref() else {
                        continue;
                    };
                    let mut params = ConnectorParams::new(&connector_ref.properties);
                    params.monitor = Some(monitor.as_ref());
                    listener.add_target(destination, self.connectors.get(&connector_ref.key)?, params);
                }
            }
            let streaming = !listener.targets.is_empty();

            let outcome = extractor
                .extract(
                    config,
                    scenario,
                    source,
                    Some(monitor.as_ref()),
                    self.tasks.as_ref(),
                    streaming.then_some(&listener as &dyn DataSetListener),
                )
                .await;
            if streaming {
                listener.cleanup().await;
            }
            let outcome = outcome?;

            let (status, data_set) = match outcome {
                ExtractOutcome::Skipped => (SourceStatus::Skipped, None),
                ExtractOutcome::Rejected => (SourceStatus::Rejected, None),
                ExtractOutcome::Extracted { data_set, stopped } => {
                    let status = if stopped { SourceStatus::Stopped } else { SourceStatus::Extracted };
                    (status, Some(data_set))
                }
                ExtractOutcome::Ignored { error } => (SourceStatus::Ignored(error.to_string()), None),
                ExtractOutcome::ConnectorFailed(result) => {
                    report.result.fail(result.code, result.message());
                    (SourceStatus::Failed, None)
                }
            };
            report.sources.push(SourceReport {
                name: source.name.clone(),
                status: status.clone(),
                records: data_set.as_ref().map(DataSet::record_count).unwrap_or_default(),
            });

            if let Some(failure) = listener.failure() {
                report.result.fail(failure.code, failure.message());
            }
            if status == SourceStatus::Failed || !report.is_ok() {
                return Ok(streamed);
            }
            if streaming {
                streamed.extend(listener.destinations().map(str::to_string));
            }
            extracted.push(data_set);
        }

        for (source, data_set) in scenario.sources.iter_mut().zip(extracted) {
            source.data_set = data_set.map(Arc::new);
        }
        Ok(streamed)
    }

    async fn run_destination(
        &self,
        codegen: &CodeGen,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
    ) -> DestinationReport {
        let mut line = DestinationReport {
            name: destination.name.clone(),
            ..Default::default()
        };

        let outcome = self
            .process_destination(codegen, ctx, config, scenario, destination, &mut line)
            .await;
        line.rows_prepared = ctx.rows_prepared();
        line.rows_rejected = ctx.rows_rejected();
        line.diagnostics = ctx.diagnostics().cloned();
        match outcome {
            Ok(result) => line.result = result,
            Err(e) => {
                error!(destination = %destination.name, error = %e, "Destination failed");
                line.result = EtlResult::with_code(ReturnCode::Error, e.to_string());
            }
        }
        line
    }

    async fn process_destination(
        &self,
        codegen: &CodeGen,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
        line: &mut DestinationReport,
    ) -> Result<EtlResult> {
        let prepared = codegen.prepare(ctx, config, scenario, destination).await?;
        if !prepared.is_ok() {
            return Ok(prepared);
        }

        if destination.connector.is_some() {
            if scenario.on_persist == PersistAction::Skip {
                return Ok(EtlResult::ok());
            }
            return codegen.persist(ctx, scenario, destination).await;
        }

        line.scripts = codegen
            .assemble_code(ctx, config, scenario, destination)
            .await?
            .to_vec();
        if scenario.on_persist == PersistAction::Skip {
            debug!(destination = %destination.name, scripts = line.scripts.len(), "Generated without executing");
            return Ok(EtlResult::ok());
        }

        // each destination transaction gets its own connection so concurrent
        // scenarios never share one
        let conn = self.connections.open(&destination.connection).await?;
        let outcome = self
            .load_in_transaction(codegen, ctx, config, scenario, destination, conn.as_ref())
            .await;
        self.connections.release(&destination.connection, conn).await;
        line.summary = Some(outcome?);
        Ok(EtlResult::ok())
    }

    async fn load_in_transaction(
        &self,
        codegen: &CodeGen,
        ctx: &mut GenerationContext,
        config: &EtlConfig,
        scenario: &Scenario,
        destination: &Destination,
        conn: &dyn Connection,
    ) -> Result<ExecutionSummary> {
        conn.begin().await?;
        match codegen.execute(ctx, config, scenario, destination, conn).await {
            Ok(summary) => {
                conn.commit().await?;
                Ok(summary)
            }
            Err(e) => {
                if let Err(rollback) = conn.rollback().await {
                    warn!(destination = %destination.name, error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run scenarios concurrently, at most `config.parallel_scenarios` at a time
    ///
    /// Results come back in input order.
    pub async fn run_all(self: &Arc<Self>, config: Arc<EtlConfig>, scenarios: Vec<Scenario>) -> Vec<Result<ScenarioReport>> {
        let semaphore = Arc::new(Semaphore::new(config.parallel_scenarios.max(1)));
        let total = scenarios.len();
        let mut tasks = JoinSet::new();

        for (index, scenario) in scenarios.into_iter().enumerate() {
            let runner = Arc::clone(self);
            let config = Arc::clone(&config);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                (index, runner.run(&config, &scenario).await)
            });
        }

        let mut results: Vec<Option<Result<ScenarioReport>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => error!(error = %e, "Scenario task failed to complete"),
            }
        }
        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::internal("scenario task did not complete"))))
            .collect()
    }
}

/// Whether a destination without a connector loads the named source
fn feeds_sql_destination(scenario: &Scenario, source: &str, first: Option<&str>) -> bool {
    scenario.destinations.iter().any(|d| {
        d.connector.is_none() && d.source.as_deref().or(first) == Some(source)
    })
}

/// Give every destination the data set of its source
///
/// A destination without a source name reads the first source.
fn attach_data_sets(scenario: &mut Scenario) {
    let sources = &scenario.sources;
    for destination in &mut scenario.destinations {
        if destination.data_set.is_some() {
            continue;
        }
        let source = match destination.source.as_deref() {
            Some(name) => sources.iter().find(|s| s.name == name),
            None => sources.first(),
        };
        destination.data_set = source.and_then(|s| s.data_set.clone());
    }
}
