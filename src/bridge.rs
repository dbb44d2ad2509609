//! Host operations reachable from sandboxed code.
//!
//! Each binding becomes a frozen async global function inside the sandbox.
//! Its arguments are always copied out of the isolate and its result copied
//! back in; the sandbox has no way to reach anything that was not bound.

use crate::error::SandboxError;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// A host-side async operation exposed to the sandbox.
#[async_trait]
pub trait BridgeOperation: Send + Sync {
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value>;
}

struct FnOperation<F>(F);

#[async_trait]
impl<F, Fut> BridgeOperation for FnOperation<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    async fn call(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Name to operation map, fixed once a sandbox is created.
#[derive(Clone, Default)]
pub struct BridgeBindings {
    operations: BTreeMap<String, Arc<dyn BridgeOperation>>,
}

impl BridgeBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_operation(
        mut self,
        name: impl Into<String>,
        operation: impl BridgeOperation + 'static,
    ) -> Self {
        self.operations.insert(name.into(), Arc::new(operation));
        self
    }

    pub fn with_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.with_operation(name, FnOperation(f))
    }

    /// Merge another set of bindings into this one. Later names win.
    pub fn merge(mut self, other: BridgeBindings) -> Self {
        self.operations.extend(other.operations);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BridgeOperation>> {
        self.operations.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.operations.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Every name must be usable as a JavaScript global identifier.
    pub(crate) fn validate(&self) -> Result<(), SandboxError> {
        match self.operations.keys().find(|name| !is_identifier(name)) {
            Some(name) => Err(SandboxError::bootstrap(format!(
                "bridge binding name '{}' is not a valid identifier",
                name
            ))),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for BridgeBindings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.operations.keys()).finish()
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first.is_ascii_alphabetic() || first == '_' || first == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}
