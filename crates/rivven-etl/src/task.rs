//! Inline task hook
//!
//! Sources and destinations may declare inline tasks. The engine does not
//! interpret them; it asks a [`TaskExecutor`] once before extraction and once
//! per row, and obeys the tri-state answer.

use async_trait::async_trait;

use crate::config::EtlConfig;
use crate::error::Result;
use crate::model::{Destination, Scenario, Source};

/// Answer of an inline task run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TaskResult {
    /// Continue normally
    #[default]
    Proceed,
    /// Skip this row (or the whole fetch when asked before it)
    Reject,
    /// Stop processing; work done so far stays valid
    Stop,
}

/// Which side of the scenario the tasks belong to
#[derive(Debug, Clone, Copy)]
pub enum TaskTarget<'a> {
    /// A source being extracted
    Source(&'a Source),
    /// A destination being prepared
    Destination(&'a Destination),
}

impl TaskTarget<'_> {
    /// Name of the source or destination
    pub fn name(&self) -> &str {
        match self {
            Self::Source(s) => &s.name,
            Self::Destination(d) => &d.name,
        }
    }

    /// Whether any inline task is declared
    pub fn has_tasks(&self) -> bool {
        match self {
            Self::Source(s) => !s.tasks.is_empty(),
            Self::Destination(d) => !d.tasks.is_empty(),
        }
    }
}

/// Runs inline tasks
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Run the target's inline tasks; `row` is `None` before a fetch
    async fn execute_inline_tasks(
        &self,
        config: &EtlConfig,
        target: TaskTarget<'_>,
        scenario: &Scenario,
        row: Option<usize>,
    ) -> Result<TaskResult>;
}

/// Executor that always proceeds
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTaskExecutor;

#[async_trait]
impl TaskExecutor for NoopTaskExecutor {
    async fn execute_inline_tasks(
        &self,
        _config: &EtlConfig,
        _target: TaskTarget<'_>,
        _scenario: &Scenario,
        _row: Option<usize>,
    ) -> Result<TaskResult> {
        Ok(TaskResult::Proceed)
    }
}
