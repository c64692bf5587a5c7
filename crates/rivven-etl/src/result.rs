//! Structured results surfaced to the orchestration layer

use std::fmt;

/// Outcome code of a prepare, connector or scenario step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReturnCode {
    /// Success
    #[default]
    Ok,
    /// Generic failure
    Error,
    /// Inputs were missing or inconsistent; nothing ran
    ValidationFailed,
    /// A connector action failed
    ActionFailed,
}

impl ReturnCode {
    /// Numeric exit code
    pub const fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::Error => 1,
            Self::ValidationFailed => 2,
            Self::ActionFailed => 3,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
            Self::ValidationFailed => write!(f, "VALIDATION_FAILED"),
            Self::ActionFailed => write!(f, "ACTION_FAILED"),
        }
    }
}

/// Return code plus accumulated messages
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EtlResult {
    /// Outcome
    pub code: ReturnCode,
    /// Free-text messages in the order they were added
    pub messages: Vec<String>,
}

impl EtlResult {
    /// Successful result
    pub fn ok() -> Self {
        Self::default()
    }

    /// Result with a code and one message
    pub fn with_code(code: ReturnCode, message: impl Into<String>) -> Self {
        Self {
            code,
            messages: vec![message.into()],
        }
    }

    /// Validation failure
    pub fn validation_failed(message: impl Into<String>) -> Self {
        Self::with_code(ReturnCode::ValidationFailed, message)
    }

    /// Connector action failure
    pub fn action_failed(message: impl Into<String>) -> Self {
        Self::with_code(ReturnCode::ActionFailed, message)
    }

    /// Whether the code is `Ok`
    pub fn is_ok(&self) -> bool {
        self.code == ReturnCode::Ok
    }

    /// Append a message
    pub fn add_message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    /// Set the code, keeping the first failure code once one is recorded
    pub fn fail(&mut self, code: ReturnCode, message: impl Into<String>) {
        if self.code == ReturnCode::Ok {
            self.code = code;
        }
        self.add_message(message);
    }

    /// All messages joined by newlines
    pub fn message(&self) -> String {
        self.messages.join("\n")
    }
}

impl fmt::Display for EtlResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.messages.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.messages.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_return_codes() {
        assert_eq!(ReturnCode::Ok.code(), 0);
        assert_eq!(ReturnCode::Error.code(), 1);
        assert_eq!(ReturnCode::ValidationFailed.code(), 2);
        assert_eq!(ReturnCode::ActionFailed.code(), 3);
    }

    #[test]
    fn test_first_failure_wins() {
        let mut result = EtlResult::ok();
        result.fail(ReturnCode::ValidationFailed, "missing data set");
        result.fail(ReturnCode::ActionFailed, "write failed");

        assert_eq!(result.code, ReturnCode::ValidationFailed);
        assert_eq!(result.message(), "missing data set\nwrite failed");
        assert_eq!(
            result.to_string(),
            "VALIDATION_FAILED: missing data set; write failed"
        );
    }
}
