//! Shared helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use validator_sandbox::{BuildMode, RemoteClient, RpcResponse, SnapshotBuilder};

/// Builds snapshots in a child process: the test process itself runs
/// sandboxes, which rules out in-process snapshotting.
pub fn snapshot_builder() -> SnapshotBuilder {
    SnapshotBuilder::new(BuildMode::ChildProcess(PathBuf::from(env!(
        "CARGO_BIN_EXE_validator-sandbox"
    ))))
}

/// Remote client answering from a fixed table keyed by method and id.
#[derive(Default)]
pub struct StubClient {
    responses: Mutex<HashMap<(String, String), RpcResponse>>,
    calls: Mutex<Vec<(String, Value)>>,
}

impl StubClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, method: &str, id: &str, response: RpcResponse) {
        self.responses
            .lock()
            .unwrap()
            .insert((method.to_string(), id.to_string()), response);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteClient for StubClient {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<RpcResponse> {
        self.calls
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));

        let id = params
            .as_object()
            .and_then(|params| params.values().next())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        self.responses
            .lock()
            .unwrap()
            .get(&(method.to_string(), id))
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no stubbed response for {}", method))
    }
}
