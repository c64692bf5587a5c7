//! Tests for configuration loading

use rivven_etl::prelude::*;

const CONFIG: &str = r#"
parallel_scenarios: 3
connections:
  source:
    url: "sqlite::memory:"
  dest:
    url: "sqlite:${RIVVEN_ETL_TEST_UNSET_DIR:-/tmp}/warehouse.db"
    properties:
      journal_mode: wal
driver:
  lines_limit: 40
properties:
  owner: ${RIVVEN_ETL_TEST_OWNER:-nobody}
"#;

#[test]
fn test_from_file_expands_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etl.yaml");
    std::fs::write(&path, CONFIG).unwrap();

    let config = EtlConfig::from_file(&path).unwrap();
    assert_eq!(config.parallel_scenarios, 3);
    assert_eq!(config.connections["dest"].url, "sqlite:/tmp/warehouse.db");
    assert_eq!(config.connections["dest"].properties["journal_mode"], "wal");
    assert_eq!(config.driver_options().lines_limit, 40);
}

#[test]
fn test_env_var_overrides_default() {
    std::env::set_var("RIVVEN_ETL_TEST_OWNER", "etl-team");
    let config = EtlConfig::from_yaml_str(CONFIG).unwrap();
    assert_eq!(config.properties["owner"], "etl-team");
}

#[test]
fn test_missing_file_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = EtlConfig::from_file(dir.path().join("absent.yaml")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_out_of_range_values_rejected() {
    let err = EtlConfig::from_yaml_str("parallel_scenarios: 0\n").unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);

    let err = EtlConfig::from_yaml_str("connections:\n  dest:\n    url: \"  \"\n").unwrap_err();
    assert!(err.to_string().contains("dest"));
}

#[tokio::test]
async fn test_declared_connections_open_through_registry() {
    let config = EtlConfig::from_yaml_str(CONFIG).unwrap();
    let registry = config.connection_registry();

    let conn = registry.get("source").await.unwrap();
    let rows = conn.query("SELECT 1 + 1", &[]).await.unwrap();
    assert_eq!(rows[0].values(), &[Value::Int64(2)]);

    let err = registry.get("nowhere").await.err().unwrap();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}
