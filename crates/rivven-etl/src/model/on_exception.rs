//! Statement failure policy for destinations

use regex::Regex;
use std::fmt;
use std::sync::Arc;

use crate::error::Error;

/// What the engine does after a statement fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OnExceptionAction {
    /// Skip to the next statement of the same block
    Continue,
    /// Skip the rest of the block without raising
    Ignore,
    /// Retry the failed insert as an update keyed on the destination key
    Merge,
    /// Propagate the error
    #[default]
    Raise,
}

impl OnExceptionAction {
    /// Parse an action name; unknown names mean `Raise`
    pub fn parse(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "continue" => Self::Continue,
            "ignore" => Self::Ignore,
            "merge" => Self::Merge,
            _ => Self::Raise,
        }
    }
}

impl fmt::Display for OnExceptionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continue => write!(f, "continue"),
            Self::Ignore => write!(f, "ignore"),
            Self::Merge => write!(f, "merge"),
            Self::Raise => write!(f, "raise"),
        }
    }
}

/// Context handed to an exception handler
#[derive(Debug)]
pub struct StatementFailure<'a> {
    /// Destination name
    pub destination: &'a str,
    /// Row index the statement belongs to, if known
    pub row: Option<usize>,
    /// Statement text
    pub sql: &'a str,
    /// The failure
    pub error: &'a Error,
}

/// Callback consulted after every failed statement
pub trait ExceptionHandler: Send + Sync {
    /// Decide how the engine proceeds
    fn on_exception(&self, failure: &StatementFailure<'_>) -> OnExceptionAction;
}

impl<F> ExceptionHandler for F
where
    F: Fn(&StatementFailure<'_>) -> OnExceptionAction + Send + Sync,
{
    fn on_exception(&self, failure: &StatementFailure<'_>) -> OnExceptionAction {
        self(failure)
    }
}

/// Per-destination exception policy
#[derive(Clone, Default)]
pub struct OnException {
    /// Configured action
    pub action: OnExceptionAction,
    /// Wrap each statement in a savepoint
    pub use_savepoint: bool,
    /// Only failures whose message matches are handled by `action`
    pub exception_mask: Option<Regex>,
    /// Overrides the configured action when present
    pub handler: Option<Arc<dyn ExceptionHandler>>,
}

impl fmt::Debug for OnException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnException")
            .field("action", &self.action)
            .field("use_savepoint", &self.use_savepoint)
            .field("exception_mask", &self.exception_mask.as_ref().map(Regex::as_str))
            .field("handler", &self.handler.is_some())
            .finish()
    }
}

impl OnException {
    /// Policy with the given action and no savepoints
    pub fn new(action: OnExceptionAction) -> Self {
        Self {
            action,
            ..Default::default()
        }
    }

    /// Enable savepoints around each statement
    pub fn with_savepoint(mut self) -> Self {
        self.use_savepoint = true;
        self
    }

    /// Restrict the action to matching failures
    pub fn with_mask(mut self, mask: Regex) -> Self {
        self.exception_mask = Some(mask);
        self
    }

    /// Install a handler callback
    pub fn with_handler(mut self, handler: Arc<dyn ExceptionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Whether failures are always raised
    pub fn is_raise(&self) -> bool {
        self.handler.is_none() && self.action == OnExceptionAction::Raise
    }

    /// Classify a statement failure
    pub fn classify(&self, failure: &StatementFailure<'_>) -> OnExceptionAction {
        if let Some(handler) = &self.handler {
            return handler.on_exception(failure);
        }

        match &self.exception_mask {
            Some(mask) if !mask.is_match(&failure.error.to_string()) => OnExceptionAction::Raise,
            _ => self.action,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(error: &Error) -> StatementFailure<'_> {
        StatementFailure {
            destination: "d",
            row: Some(0),
            sql: "INSERT INTO t VALUES (1)",
            error,
        }
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(OnExceptionAction::parse("Continue"), OnExceptionAction::Continue);
        assert_eq!(OnExceptionAction::parse("merge"), OnExceptionAction::Merge);
        assert_eq!(OnExceptionAction::parse("whatever"), OnExceptionAction::Raise);
    }

    #[test]
    fn test_mask_filters_failures() {
        let policy = OnException::new(OnExceptionAction::Ignore)
            .with_mask(Regex::new("(?i)unique").unwrap());

        let dup = Error::constraint("UNIQUE constraint failed: t.id", None);
        let other = Error::query("no such table: t");

        assert_eq!(policy.classify(&failure(&dup)), OnExceptionAction::Ignore);
        assert_eq!(policy.classify(&failure(&other)), OnExceptionAction::Raise);
    }

    #[test]
    fn test_handler_overrides_action() {
        let policy = OnException::new(OnExceptionAction::Raise).with_handler(Arc::new(
            |f: &StatementFailure<'_>| {
                if f.row == Some(0) {
                    OnExceptionAction::Continue
                } else {
                    OnExceptionAction::Raise
                }
            },
        ));

        let err = Error::query("boom");
        assert!(!policy.is_raise());
        assert_eq!(policy.classify(&failure(&err)), OnExceptionAction::Continue);
    }
}
