//! Tracking of non-transactional side effects
//!
//! A [`TransactionMonitor`] lives for one scenario run. Extraction and
//! connectors record the files they create and the statements they run;
//! when the run fails the database transaction is rolled back and
//! [`TransactionMonitor::rollback`] deletes the recorded files.

use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;

/// One recorded side effect
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// A file was created
    FileCreated(PathBuf),
    /// A statement ran against a logical connection
    Statement {
        /// Logical connection name
        connection: String,
        /// Statement text
        sql: String,
    },
}

/// Side-effect journal for one logical transaction
#[derive(Debug)]
pub struct TransactionMonitor {
    id: Uuid,
    effects: Mutex<Vec<SideEffect>>,
}

impl Default for TransactionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionMonitor {
    /// Start a new logical transaction
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            effects: Mutex::new(Vec::new()),
        }
    }

    /// Logical transaction id
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Record a created file
    pub fn register_file(&self, path: impl AsRef<Path>) {
        let path = path.as_ref().to_path_buf();
        debug!(transaction = %self.id, path = %path.display(), "Registered file");
        self.effects.lock().push(SideEffect::FileCreated(path));
    }

    /// Record an executed statement
    pub fn register_statement(&self, connection: impl Into<String>, sql: impl Into<String>) {
        self.effects.lock().push(SideEffect::Statement {
            connection: connection.into(),
            sql: sql.into(),
        });
    }

    /// Recorded side effects in order
    pub fn effects(&self) -> Vec<SideEffect> {
        self.effects.lock().clone()
    }

    /// Files recorded so far
    pub fn files(&self) -> Vec<PathBuf> {
        self.effects
            .lock()
            .iter()
            .filter_map(|e| match e {
                SideEffect::FileCreated(path) => Some(path.clone()),
                SideEffect::Statement { .. } => None,
            })
            .collect()
    }

    /// Keep all side effects and forget them
    pub fn commit(&self) {
        let count = std::mem::take(&mut *self.effects.lock()).len();
        debug!(transaction = %self.id, effects = count, "Committed");
    }

    /// Undo recorded side effects: created files are deleted, newest first
    ///
    /// Files that no longer exist are skipped; the first other I/O error is
    /// returned after every file has been attempted.
    pub async fn rollback(&self) -> Result<()> {
        let effects = std::mem::take(&mut *self.effects.lock());
        let mut first_error = None;

        for effect in effects.into_iter().rev() {
            let SideEffect::FileCreated(path) = effect else {
                continue;
            };
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(transaction = %self.id, path = %path.display(), "Removed file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(transaction = %self.id, path = %path.display(), error = %e, "Failed to remove file");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
