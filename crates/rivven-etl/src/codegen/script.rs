//! Script units and their assembly

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::driver::{sanitize_identifier, Driver};
use crate::error::{Error, Result};
use crate::model::{Destination, Scenario};
use crate::types::Value;

use super::statement::RowScript;
use super::{ExecutionMode, GenerationContext};

/// A bounded chunk of generated row SQL
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScriptUnit {
    /// Position within the destination (0-based)
    pub index: usize,
    /// Row lines in order
    pub lines: Vec<String>,
    /// Physical line count of `lines`
    pub line_count: usize,
    /// Rows whose statements are in this unit
    pub rows: Vec<usize>,
    /// Large-object values by row, bound when running statement by statement
    pub lobs: BTreeMap<usize, Vec<Value>>,
}

impl ScriptUnit {
    /// Row lines joined by newlines
    pub fn body(&self) -> String {
        self.lines.join("\n")
    }
}

/// Packs row scripts into units of at most `limit` lines
///
/// A row larger than the limit gets a unit of its own.
#[derive(Debug)]
pub(crate) struct UnitBuilder {
    limit: usize,
    current: ScriptUnit,
    units: Vec<ScriptUnit>,
}

impl UnitBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            current: ScriptUnit::default(),
            units: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Option<usize>, script: RowScript) {
        let count = script.line_count();
        if !self.current.lines.is_empty() && self.current.line_count + count > self.limit {
            self.flush();
        }
        self.current.lines.extend(script.lines);
        self.current.line_count += count;
        if let Some(row) = row {
            self.current.rows.push(row);
            if !script.lobs.is_empty() {
                self.current.lobs.insert(row, script.lobs);
            }
        }
    }

    fn flush(&mut self) {
        let mut unit = std::mem::take(&mut self.current);
        unit.index = self.units.len();
        self.units.push(unit);
    }

    pub fn finish(mut self) -> Vec<ScriptUnit> {
        if !self.current.lines.is_empty() {
            self.flush();
        }
        self.units
    }
}

/// A script unit ready to run
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledScript {
    /// `{scenario}_{destination}_{index}`
    pub name: String,
    /// Unit index
    pub index: usize,
    /// Full script text
    pub sql: String,
    /// Large-object values by row
    pub lobs: BTreeMap<usize, Vec<Value>>,
    /// Where the script was saved
    pub path: Option<PathBuf>,
}

pub(crate) fn script_name(scenario: &Scenario, destination: &Destination, index: usize) -> String {
    format!(
        "{}_{}_{}",
        sanitize_identifier(scenario.script_name()),
        sanitize_identifier(&destination.name),
        index
    )
}

pub(crate) fn assemble(
    driver: &dyn Driver,
    ctx: &GenerationContext,
    mode: ExecutionMode,
    scenario: &Scenario,
    destination: &Destination,
) -> Vec<AssembledScript> {
    let total = ctx.units.len();
    ctx.units
        .iter()
        .map(|unit| {
            let sql = match mode {
                ExecutionMode::Callable => {
                    let first = unit.index == 0 && ctx.load_index == 0;
                    let mut parts = vec![driver.declare_section_start()];
                    parts.extend(ctx.declarations.iter().cloned());
                    parts.push(driver.declare());
                    parts.extend(ctx.cursor_variables.iter().cloned());
                    parts.extend(ctx.cursor_declarations.iter().cloned());
                    parts.push(driver.declare_cursor_end());
                    parts.push(if first { driver.begin() } else { driver.begin_split() });
                    parts.extend(ctx.globals.iter().cloned());
                    parts.extend(unit.lines.iter().cloned());
                    parts.push(if total == 1 { driver.end() } else { driver.end_split() });
                    parts.retain(|p| !p.is_empty());
                    parts.join("\n")
                }
                ExecutionMode::PerStatement => unit.body(),
            };
            AssembledScript {
                name: script_name(scenario, destination, unit.index),
                index: unit.index,
                sql,
                lobs: unit.lobs.clone(),
                path: None,
            }
        })
        .collect()
}

/// Write `{dir}/{name}.sql`, creating the directory when missing
pub(crate) async fn save(dir: &Path, name: &str, sql: &str) -> Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await.map_err(|e| {
        Error::config(format!("cannot create script directory {}: {}", dir.display(), e))
    })?;
    let path = dir.join(format!("{}.sql", name));
    tokio::fs::write(&path, sql).await?;
    debug!(path = %path.display(), "Saved script");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(lines: &[&str]) -> RowScript {
        RowScript {
            lines: lines.iter().map(|s| s.to_string()).collect(),
            lobs: Vec::new(),
        }
    }

    #[test]
    fn test_units_respect_limit() {
        let mut builder = UnitBuilder::new(4);
        builder.push(Some(0), row(&["a;", "b;"]));
        builder.push(Some(1), row(&["c;\nd;"]));
        builder.push(Some(2), row(&["e;"]));
        let units = builder.finish();

        assert_eq!(units.len(), 2);
        assert_eq!(units[0].rows, vec![0, 1]);
        assert_eq!(units[0].line_count, 4);
        assert_eq!(units[1].index, 1);
        assert_eq!(units[1].body(), "e;");
    }

    #[test]
    fn test_oversized_row_gets_own_unit() {
        let mut builder = UnitBuilder::new(1);
        builder.push(Some(0), row(&["a;", "b;", "c;"]));
        builder.push(Some(1), row(&["d;"]));
        let units = builder.finish();
        assert_eq!(units.len(), 2);
        assert_eq!(units[0].line_count, 3);
    }

    #[test]
    fn test_script_name() {
        let scenario = Scenario::new("nightly load", "sqlite");
        let destination = Destination::new("t2-copy");
        assert_eq!(script_name(&scenario, &destination, 3), "nightly_load_t2_copy_3");
    }

    #[tokio::test]
    async fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("scripts");
        let path = save(&nested, "s_d_0", "SELECT 1;").await.unwrap();
        assert_eq!(path, nested.join("s_d_0.sql"));
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "SELECT 1;");
    }
}
