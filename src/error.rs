//! Failure taxonomy for sandbox invocations.
//!
//! Every invocation either yields a value or exactly one [`SandboxError`].
//! The display strings of [`SandboxError::Timeout`] and
//! [`SandboxError::MemoryLimitExceeded`] are matched on by callers and must
//! stay verbatim.

use crate::marshal::HostValue;
use thiserror::Error;

/// Message reported when an invocation exceeds its deadline.
pub const TIMEOUT_MESSAGE: &str = "Script execution timed out.";

/// Message reported when the isolate is torn down for exceeding its heap ceiling.
pub const MEMORY_LIMIT_MESSAGE: &str = "Isolate was disposed during execution due to memory limit";

/// Message reported when an invocation targets a sandbox that is gone.
pub const DISPOSED_MESSAGE: &str = "sandbox already disposed";

/// Classification of a failed invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Timeout,
    MemoryLimitExceeded,
    ScriptError,
    HostBridgeError,
    Bootstrap,
}

/// Errors produced by the sandbox.
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    /// The invocation ran past `timeout_millis` and was interrupted.
    #[error("{}", TIMEOUT_MESSAGE)]
    Timeout,

    /// The isolate hit its memory ceiling and was disposed.
    #[error("{}", MEMORY_LIMIT_MESSAGE)]
    MemoryLimitExceeded,

    /// Sandboxed code threw, or a returned promise rejected.
    #[error("{message}")]
    Script {
        /// Error class name (`TypeError`, `InvalidStateTransitionError`, ...).
        name: Option<String>,
        /// The `message` property of the thrown value, or its string form.
        message: String,
        /// Own enumerable properties of the thrown value, marshaled per
        /// the invocation's result transfer mode.
        payload: Option<HostValue>,
    },

    /// The invocation API was misused: disposed sandbox, bad argument,
    /// value that cannot cross the boundary.
    #[error("{0}")]
    HostBridge(String),

    /// Building a snapshot or creating a sandbox failed.
    #[error("failed to bootstrap sandbox: {0}")]
    Bootstrap(String),
}

impl SandboxError {
    pub(crate) fn host_bridge(message: impl Into<String>) -> Self {
        SandboxError::HostBridge(message.into())
    }

    pub(crate) fn disposed() -> Self {
        SandboxError::HostBridge(DISPOSED_MESSAGE.to_string())
    }

    pub(crate) fn script(name: Option<String>, message: impl Into<String>) -> Self {
        SandboxError::Script {
            name,
            message: message.into(),
            payload: None,
        }
    }

    pub(crate) fn bootstrap(err: impl std::fmt::Display) -> Self {
        SandboxError::Bootstrap(err.to_string())
    }

    /// The failure classification.
    pub fn kind(&self) -> FailureKind {
        match self {
            SandboxError::Timeout => FailureKind::Timeout,
            SandboxError::MemoryLimitExceeded => FailureKind::MemoryLimitExceeded,
            SandboxError::Script { .. } => FailureKind::ScriptError,
            SandboxError::HostBridge(_) => FailureKind::HostBridgeError,
            SandboxError::Bootstrap(_) => FailureKind::Bootstrap,
        }
    }

    /// Check if this error represents a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, SandboxError::Timeout)
    }

    /// Check if this error represents a memory limit violation.
    pub fn is_memory_limit(&self) -> bool {
        matches!(self, SandboxError::MemoryLimitExceeded)
    }

    /// Whether the sandbox that produced this error can no longer be used.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SandboxError::Timeout | SandboxError::MemoryLimitExceeded)
    }

    /// Structured payload of a script error, if any.
    pub fn payload(&self) -> Option<&HostValue> {
        match self {
            SandboxError::Script { payload, .. } => payload.as_ref(),
            _ => None,
        }
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_messages_are_verbatim() {
        assert_eq!(SandboxError::Timeout.to_string(), "Script execution timed out.");
        assert_eq!(
            SandboxError::MemoryLimitExceeded.to_string(),
            "Isolate was disposed during execution due to memory limit"
        );
        assert_eq!(SandboxError::disposed().to_string(), "sandbox already disposed");
    }

    #[test]
    fn test_kinds() {
        assert_eq!(SandboxError::Timeout.kind(), FailureKind::Timeout);
        assert_eq!(
            SandboxError::MemoryLimitExceeded.kind(),
            FailureKind::MemoryLimitExceeded
        );
        assert_eq!(
            SandboxError::script(None, "boom").kind(),
            FailureKind::ScriptError
        );
        assert_eq!(
            SandboxError::host_bridge("bad").kind(),
            FailureKind::HostBridgeError
        );
    }

    #[test]
    fn test_error_helpers() {
        assert!(SandboxError::Timeout.is_timeout());
        assert!(SandboxError::Timeout.is_terminal());
        assert!(SandboxError::MemoryLimitExceeded.is_memory_limit());
        assert!(!SandboxError::script(None, "x").is_terminal());

        let err = SandboxError::Script {
            name: Some("TypeError".into()),
            message: "x is not a function".into(),
            payload: Some(HostValue::Data(serde_json::json!({ "code": 1 }))),
        };
        assert_eq!(err.to_string(), "x is not a function");
        assert_eq!(
            err.payload().and_then(HostValue::as_data),
            Some(&serde_json::json!({ "code": 1 }))
        );
    }
}
