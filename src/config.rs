//! Resource limits and per-invocation options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How a value crosses the host/sandbox boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Structural deep copy. Neither side can observe the other's mutations.
    #[default]
    Copy,
    /// Restricted handle that only supports invocation with copied arguments.
    Reference,
}

/// Limits fixed for the lifetime of a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// V8 heap ceiling in MiB.
    pub memory_limit_mebibytes: usize,
}

impl ResourceLimits {
    pub fn new(memory_limit_mebibytes: usize) -> Self {
        Self {
            memory_limit_mebibytes,
        }
    }

    pub fn memory_limit_bytes(&self) -> usize {
        self.memory_limit_mebibytes.saturating_mul(1024 * 1024)
    }
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mebibytes: 128,
        }
    }
}

/// Options recognized by [`Sandbox::invoke`](crate::Sandbox::invoke).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InvocationOptions {
    /// Wall-clock budget in milliseconds (0 = unbounded).
    pub timeout_millis: u64,
    pub argument_transfer: TransferMode,
    pub result_transfer: TransferMode,
    /// The callee returns a promise that must settle inside the sandbox
    /// before its value crosses back.
    pub result_is_async: bool,
}

impl InvocationOptions {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_millis > 0).then(|| Duration::from_millis(self.timeout_millis))
    }

    pub fn with_timeout_millis(mut self, timeout_millis: u64) -> Self {
        self.timeout_millis = timeout_millis;
        self
    }

    pub fn with_arguments(mut self, mode: TransferMode) -> Self {
        self.argument_transfer = mode;
        self
    }

    pub fn with_result(mut self, mode: TransferMode) -> Self {
        self.result_transfer = mode;
        self
    }

    pub fn with_async_result(mut self) -> Self {
        self.result_is_async = true;
        self
    }
}
