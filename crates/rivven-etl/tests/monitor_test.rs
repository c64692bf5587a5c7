//! Tests for the side-effect journal

use rivven_etl::monitor::SideEffect;
use rivven_etl::prelude::*;
use rivven_etl::testing::{MemoryConnector, SPOOL_DIR_PROPERTY};
use std::sync::Arc;

// ==================== TransactionMonitor Tests ====================

#[tokio::test]
async fn test_rollback_deletes_registered_files() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("a.csv");
    let second = dir.path().join("b.csv");
    std::fs::write(&first, "1").unwrap();
    std::fs::write(&second, "2").unwrap();

    let monitor = TransactionMonitor::new();
    monitor.register_file(&first);
    monitor.register_statement("dest", "INSERT INTO t2 VALUES (1)");
    monitor.register_file(&second);
    assert_eq!(monitor.files(), vec![first.clone(), second.clone()]);

    monitor.rollback().await.unwrap();
    assert!(!first.exists());
    assert!(!second.exists());
    assert!(monitor.effects().is_empty());
}

#[tokio::test]
async fn test_commit_preserves_files() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("out.csv");
    std::fs::write(&file, "1").unwrap();

    let monitor = TransactionMonitor::new();
    monitor.register_file(&file);
    monitor.commit();
    monitor.rollback().await.unwrap();
    assert!(file.exists());
}

#[tokio::test]
async fn test_rollback_skips_missing_files() {
    let dir = tempfile::tempdir().unwrap();
    let monitor = TransactionMonitor::new();
    monitor.register_file(dir.path().join("never-written.csv"));
    assert!(monitor.rollback().await.is_ok());
}

#[test]
fn test_statements_are_journaled_in_order() {
    let monitor = TransactionMonitor::new();
    monitor.register_statement("source", "SELECT 1");
    monitor.register_statement("source", "SELECT 2");
    let sql: Vec<_> = monitor
        .effects()
        .into_iter()
        .filter_map(|e| match e {
            SideEffect::Statement { sql, .. } => Some(sql),
            SideEffect::FileCreated(_) => None,
        })
        .collect();
    assert_eq!(sql, vec!["SELECT 1", "SELECT 2"]);
}

// ==================== Scenario Rollback Tests ====================

fn input() -> DataSet {
    DataSet::new("rows")
        .with_field("id", SqlType::Integer)
        .with_record(vec![Value::Int64(1)])
        .unwrap()
        .with_record(vec![Value::Int64(2)])
        .unwrap()
}

fn scenario(spool: &std::path::Path, then: Option<Destination>) -> Scenario {
    let mut scenario = Scenario::new("spool", "sqlite")
        .with_source(Source::new("src").with_connector(ConnectorRef::new("memory-in")))
        .with_destination(
            Destination::new("spool").from_source("src").with_connector(
                ConnectorRef::new("memory").with_property(SPOOL_DIR_PROPERTY, spool.display().to_string()),
            ),
        );
    if let Some(dest) = then {
        scenario = scenario.with_destination(dest);
    }
    scenario
}

fn runner(config: &EtlConfig, output: &MemoryConnector) -> ScenarioRunner {
    let connectors = ConnectorRegistry::new()
        .with(Arc::new(MemoryConnector::new().named("memory-in").with_input(input())))
        .with(Arc::new(output.clone()));
    ScenarioRunner::from_config(config).with_connectors(Arc::new(connectors))
}

#[tokio::test]
async fn test_successful_scenario_keeps_spooled_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = EtlConfig::default();
    let output = MemoryConnector::new();

    let report = runner(&config, &output)
        .run(&config, &scenario(dir.path(), None))
        .await
        .unwrap();
    assert!(report.is_ok(), "{}", report.result);
    assert!(dir.path().join("src.tsv").exists());
    assert_eq!(output.persisted()[0].rows.len(), 2);
    assert_eq!(output.events(), vec!["pre_persist", "persist", "post_persist", "cleanup"]);
}

#[tokio::test]
async fn test_failed_scenario_removes_spooled_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = EtlConfig::default().with_connection("dest", ConnectionConfig::new("sqlite::memory:"));
    let output = MemoryConnector::new();
    let broken = Destination::load("copy", LoadAction::Insert, "no_such_table").from_source("src");

    let report = runner(&config, &output)
        .run(&config, &scenario(dir.path(), Some(broken)))
        .await
        .unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.destinations.len(), 2);
    assert!(report.destination("spool").unwrap().result.is_ok());
    assert!(report.destination("copy").unwrap().diagnostics.is_some());
    assert!(!dir.path().join("src.tsv").exists());
}
