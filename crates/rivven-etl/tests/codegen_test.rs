//! Tests for rivven-etl code generation

use rivven_etl::codegen::split_blocks;
use rivven_etl::config::ScriptSettings;
use rivven_etl::driver::{PostgresDriver, SqliteDriver};
use rivven_etl::prelude::*;
use std::sync::Arc;

fn people(n: i64) -> Arc<DataSet> {
    let mut ds = DataSet::new("people")
        .with_field("id", SqlType::Integer)
        .with_field("name", SqlType::Varchar);
    for i in 1..=n {
        ds.add_record(DataSetRecord::new(vec![Value::Int64(i), Value::from(format!("p{}", i))]))
            .unwrap();
    }
    Arc::new(ds)
}

async fn assemble(codegen: &CodeGen, config: &EtlConfig, scenario: &Scenario, dest: &Destination) -> Vec<String> {
    let mut ctx = GenerationContext::new();
    let result = codegen.prepare(&mut ctx, config, scenario, dest).await.unwrap();
    assert!(result.is_ok(), "{}", result);
    codegen
        .assemble_code(&mut ctx, config, scenario, dest)
        .await
        .unwrap()
        .iter()
        .map(|s| s.sql.clone())
        .collect()
}

// ==================== Assembly Tests ====================

#[tokio::test]
async fn test_assembly_is_idempotent_across_contexts() {
    let codegen = CodeGen::new(Arc::new(PostgresDriver::default()));
    let config = EtlConfig::default();
    let scenario = Scenario::new("nightly", "postgres");
    let dest = Destination::load("people", LoadAction::Merge, "people_copy")
        .with_keys(["id"])
        .with_data_set(people(5));

    let first = assemble(&codegen, &config, &scenario, &dest).await;
    let second = assemble(&codegen, &config, &scenario, &dest).await;
    assert_eq!(first, second);
    assert_eq!(first.len(), 1);
}

#[tokio::test]
async fn test_reset_context_reproduces_scripts() {
    let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
    let config = EtlConfig::default();
    let scenario = Scenario::new("s", "sqlite");
    let dest = Destination::load("people", LoadAction::Insert, "people_copy").with_data_set(people(3));

    let mut ctx = GenerationContext::new();
    codegen.prepare(&mut ctx, &config, &scenario, &dest).await.unwrap();
    let before: Vec<_> = codegen
        .assemble_code(&mut ctx, &config, &scenario, &dest)
        .await
        .unwrap()
        .to_vec();

    ctx.reset();
    codegen.prepare(&mut ctx, &config, &scenario, &dest).await.unwrap();
    let after = codegen
        .assemble_code(&mut ctx, &config, &scenario, &dest)
        .await
        .unwrap();
    assert_eq!(before.as_slice(), after);
}

#[tokio::test]
async fn test_assembled_scripts_borrow_from_context() {
    let config = EtlConfig::default();
    let scenario = Scenario::new("s", "sqlite");
    let dest = Destination::load("people", LoadAction::Insert, "people_copy").with_data_set(people(2));
    let mut ctx = GenerationContext::new();

    let scripts = {
        let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
        codegen.prepare(&mut ctx, &config, &scenario, &dest).await.unwrap();
        codegen
            .assemble_code(&mut ctx, &config, &scenario, &dest)
            .await
            .unwrap()
    };
    assert_eq!(scripts.len(), 1);
    assert!(scripts[0].sql.contains("'p2'"));
}

// ==================== Split Tests ====================

#[tokio::test]
async fn test_split_respects_lines_limit() {
    let driver = SqliteDriver::new(DriverOptions::default().with_lines_limit(7));
    let codegen = CodeGen::new(Arc::new(driver));
    let config = EtlConfig::default();
    let scenario = Scenario::new("s", "sqlite");
    let dest = Destination::load("people", LoadAction::Insert, "people_copy").with_data_set(people(7));

    let mut ctx = GenerationContext::new();
    codegen.prepare(&mut ctx, &config, &scenario, &dest).await.unwrap();

    // two rows of three lines each fit under seven
    assert_eq!(ctx.units().len(), 4);
    assert!(ctx.units().iter().all(|u| u.line_count <= 7));

    let rows: Vec<usize> = ctx.units().iter().flat_map(|u| u.rows.clone()).collect();
    assert_eq!(rows, (0..7).collect::<Vec<_>>());

    let blocks: Vec<_> = ctx
        .units()
        .iter()
        .flat_map(|u| split_blocks(&u.body(), ";"))
        .collect();
    assert_eq!(blocks.len(), 7);
    for (row, block) in blocks.iter().enumerate() {
        assert_eq!(block.row, Some(row));
        assert_eq!(block.statements.len(), 1);
        assert!(block.statements[0].sql.contains(&format!("'p{}'", row + 1)));
    }
}

#[tokio::test]
async fn test_single_unit_when_under_limit() {
    let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
    let mut ctx = GenerationContext::new();
    let dest = Destination::load("people", LoadAction::Insert, "people_copy").with_data_set(people(2));
    codegen
        .prepare(&mut ctx, &EtlConfig::default(), &Scenario::new("s", "sqlite"), &dest)
        .await
        .unwrap();
    assert_eq!(ctx.units().len(), 1);
    assert_eq!(ctx.units()[0].rows, vec![0, 1]);
}

// ==================== Script File Tests ====================

#[tokio::test]
async fn test_saved_scripts_land_in_script_dir() {
    let dir = tempfile::tempdir().unwrap();
    let config = EtlConfig {
        scripts: ScriptSettings {
            script_dir: Some(dir.path().to_path_buf()),
            error_script_dir: None,
        },
        ..EtlConfig::default()
    };
    let codegen = CodeGen::new(Arc::new(SqliteDriver::default()));
    let scenario = Scenario::new("s", "sqlite").saving_scripts();
    let dest = Destination::load("people", LoadAction::Insert, "people_copy").with_data_set(people(1));

    let mut ctx = GenerationContext::new();
    codegen.prepare(&mut ctx, &config, &scenario, &dest).await.unwrap();
    let scripts = codegen
        .assemble_code(&mut ctx, &config, &scenario, &dest)
        .await
        .unwrap();

    let expected = dir.path().join("s_people_0.sql");
    assert_eq!(scripts[0].path.as_deref(), Some(expected.as_path()));
    let saved = std::fs::read_to_string(&expected).unwrap();
    assert_eq!(saved, scripts[0].sql);
}
