//! End-to-end scenarios against SQLite files

use rivven_etl::logging::init_test_tracing;
use rivven_etl::model::PhaseScripts;
use rivven_etl::prelude::*;
use rivven_etl::runner::SourceStatus;
use rivven_etl::sqlite::SqliteConnection;
use std::path::Path;
use std::sync::Arc;

async fn database(path: &Path) -> SqliteConnection {
    let conn = SqliteConnection::open(path.to_str().unwrap()).unwrap();
    conn.execute_script(
        "CREATE TABLE t (id INTEGER, name TEXT);
         INSERT INTO t VALUES (3, 'gamma');
         INSERT INTO t VALUES (1, 'alpha');
         INSERT INTO t VALUES (2, 'o''brien');
         CREATE TABLE t2 (id INTEGER, name TEXT);",
    )
    .await
    .unwrap();
    conn
}

fn config(path: &Path) -> EtlConfig {
    let url = format!("sqlite:{}", path.display());
    EtlConfig::default()
        .with_connection("source", ConnectionConfig::new(url.clone()))
        .with_connection("dest", ConnectionConfig::new(url))
}

async fn table(conn: &SqliteConnection, name: &str) -> Vec<Vec<Value>> {
    conn.query(&format!("SELECT id, name FROM {} ORDER BY rowid", name), &[])
        .await
        .unwrap()
        .into_iter()
        .map(Row::into_values)
        .collect()
}

fn source_rows() -> Vec<Vec<Value>> {
    vec![
        vec![Value::Int64(3), Value::from("gamma")],
        vec![Value::Int64(1), Value::from("alpha")],
        vec![Value::Int64(2), Value::from("o'brien")],
    ]
}

#[tokio::test]
async fn test_copy_table_with_insert() {
    init_test_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.db");
    let check = database(&path).await;
    let config = config(&path);

    let scenario = Scenario::new("copy", "sqlite")
        .with_source(Source::sql("src", "SELECT * FROM t"))
        .with_destination(Destination::load("t2", LoadAction::Insert, "t2").from_source("src"));
    let runner = ScenarioRunner::from_config(&config);

    let report = runner.run(&config, &scenario).await.unwrap();
    assert!(report.is_ok(), "{}", report.result);
    assert_eq!(report.sources[0].status, SourceStatus::Extracted);
    assert_eq!(report.sources[0].records, 3);

    let dest = report.destination("t2").unwrap();
    assert_eq!(dest.rows_prepared, 3);
    let summary = dest.summary.unwrap();
    assert_eq!(summary.statements, 3);
    assert_eq!(summary.failed, 0);

    assert_eq!(table(&check, "t2").await, source_rows());
    runner.connections().close_all().await.unwrap();
}

#[tokio::test]
async fn test_create_table_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.db");
    let check = database(&path).await;
    let config = config(&path);

    let scenario = Scenario::new("create", "sqlite")
        .with_source(Source::sql("src", "SELECT * FROM t"))
        .with_destination(
            Destination::load("t3", LoadAction::Insert, "t3")
                .from_source("src")
                .with_scripts(PhaseScripts {
                    create_table: true,
                    ..Default::default()
                }),
        );
    let runner = ScenarioRunner::from_config(&config);

    let report = runner.run(&config, &scenario).await.unwrap();
    assert!(report.is_ok(), "{}", report.result);
    assert_eq!(table(&check, "t3").await, source_rows());
}

#[tokio::test]
async fn test_failed_destination_is_rolled_back() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.db");
    let check = database(&path).await;
    check
        .execute_script("CREATE UNIQUE INDEX t2_id ON t2 (id); INSERT INTO t2 VALUES (2, 'existing');")
        .await
        .unwrap();
    let config = config(&path);

    let scenario = Scenario::new("copy", "sqlite")
        .with_source(Source::sql("src", "SELECT * FROM t"))
        .with_destination(Destination::load("t2", LoadAction::Insert, "t2").from_source("src"));
    let runner = ScenarioRunner::from_config(&config);

    let report = runner.run(&config, &scenario).await.unwrap();
    assert!(!report.is_ok());
    assert_eq!(report.result.code, ReturnCode::Error);

    // rows 3 and 1 were inserted before the failure and rolled back with it
    assert_eq!(
        table(&check, "t2").await,
        vec![vec![Value::Int64(2), Value::from("existing")]]
    );
}

#[tokio::test]
async fn test_run_all_against_one_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.db");
    let check = database(&path).await;
    // a single SQLite file allows one writer at a time
    let config = Arc::new(EtlConfig {
        parallel_scenarios: 1,
        ..config(&path)
    });

    let scenarios = vec![
        Scenario::new("first", "sqlite")
            .with_source(Source::sql("src", "SELECT * FROM t WHERE id = 1"))
            .with_destination(Destination::load("t2", LoadAction::Insert, "t2").from_source("src")),
        Scenario::new("second", "sqlite")
            .with_source(Source::sql("src", "SELECT * FROM t WHERE id = 2"))
            .with_destination(Destination::load("t2", LoadAction::Insert, "t2").from_source("src")),
    ];
    let runner = Arc::new(ScenarioRunner::from_config(&config));

    let reports = runner.run_all(config, scenarios).await;
    let names: Vec<_> = reports
        .into_iter()
        .map(|r| {
            let report = r.unwrap();
            assert!(report.is_ok(), "{}", report.result);
            report.scenario
        })
        .collect();
    assert_eq!(names, vec!["first", "second"]);
    assert_eq!(table(&check, "t2").await.len(), 2);
}
