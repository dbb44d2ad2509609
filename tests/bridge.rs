//! Data-fetch bridge bound into live sandboxes.

mod common;

use common::StubClient;
use serde_json::{json, Value};
use std::sync::Arc;
use validator_sandbox::*;

const BUNDLE: &str = r#"
async function loadContract(id) {
  return await fetchDataContract(id);
}

async function loadIdentity(id) {
  return await fetchIdentity(id);
}

function overwriteBridge() {
  try {
    fetchDataContract = () => 'hijacked';
  } catch (e) {
    // strict-mode assignment would throw; sloppy mode silently ignores
  }
  delete globalThis.fetchDataContract;
  return typeof fetchDataContract;
}

async function loadCyclicIdentity() {
  const query = { id: 'identity-1' };
  query.self = query;
  return await fetchIdentity(query);
}

function bridgeNames() {
  return Object.keys(globalThis).filter((key) => key.startsWith('fetch')).sort();
}
"#;

fn async_options() -> InvocationOptions {
    InvocationOptions::default()
        .with_async_result()
        .with_timeout_millis(2000)
}

async fn sandbox_with(client: Arc<StubClient>) -> (Sandbox, Arc<MemoryCache>) {
    let contracts = Arc::new(MemoryCache::new());
    let provider = DataProvider::new(client, contracts.clone(), Arc::new(MemoryCache::new()));
    let sandbox = create_sandbox_cold(BUNDLE, ResourceLimits::default(), provider.bindings())
        .await
        .unwrap();
    (sandbox, contracts)
}

#[tokio::test]
async fn test_fetch_contract_hits_remote_once() {
    let client = StubClient::new();
    client.respond(
        "fetchContract",
        "contract-1",
        RpcResponse::result(json!({"$id": "contract-1", "documents": {}})),
    );
    let (sandbox, contracts) = sandbox_with(client.clone()).await;

    for _ in 0..2 {
        let contract = sandbox
            .invoke(
                "",
                "loadContract",
                vec![json!("contract-1").into()],
                async_options(),
            )
            .await
            .unwrap();
        assert_eq!(
            contract.into_data().unwrap(),
            json!({"$id": "contract-1", "documents": {}})
        );
    }

    assert_eq!(client.calls().len(), 1);
    assert_eq!(
        client.calls()[0],
        ("fetchContract".to_string(), json!({"contractId": "contract-1"}))
    );
    assert_eq!(contracts.len(), 1);
}

#[tokio::test]
async fn test_missing_entity_resolves_to_null() {
    let client = StubClient::new();
    client.respond(
        "fetchIdentity",
        "ghost",
        RpcResponse::error(INVALID_ARGUMENT, "identity not found"),
    );
    let (sandbox, _) = sandbox_with(client.clone()).await;

    let identity = sandbox
        .invoke("", "loadIdentity", vec![json!("ghost").into()], async_options())
        .await
        .unwrap();
    assert_eq!(identity.into_data().unwrap(), Value::Null);

    // Absence is not cached.
    sandbox
        .invoke("", "loadIdentity", vec![json!("ghost").into()], async_options())
        .await
        .unwrap();
    assert_eq!(client.calls().len(), 2);
}

#[tokio::test]
async fn test_remote_failure_rejects_inside_sandbox() {
    let client = StubClient::new();
    client.respond(
        "fetchContract",
        "broken",
        RpcResponse::error(-32603, "internal error"),
    );
    let (sandbox, contracts) = sandbox_with(client).await;

    let err = sandbox
        .invoke("", "loadContract", vec![json!("broken").into()], async_options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ScriptError);
    assert!(
        err.to_string().contains("Can't fetch contract: internal error"),
        "unexpected message: {}",
        err
    );
    assert!(contracts.is_empty());
    assert!(!sandbox.is_disposed());
}

#[tokio::test]
async fn test_bridge_globals_cannot_be_replaced() {
    let (sandbox, _) = sandbox_with(StubClient::new()).await;

    let kind = sandbox
        .invoke("", "overwriteBridge", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(kind.into_data().unwrap(), json!("function"));

    let names = sandbox
        .invoke("", "bridgeNames", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(
        names.into_data().unwrap(),
        json!(["fetchDataContract", "fetchIdentity"])
    );
}

#[tokio::test]
async fn test_custom_bridge_operation() {
    let bindings = BridgeBindings::new().with_fn("fetchDataContract", |args| async move {
        Ok(json!({ "echo": args }))
    });
    let sandbox = create_sandbox_cold(BUNDLE, ResourceLimits::default(), bindings)
        .await
        .unwrap();

    let value = sandbox
        .invoke("", "loadContract", vec![json!(42).into()], async_options())
        .await
        .unwrap();
    assert_eq!(value.into_data().unwrap(), json!({"echo": [42]}));

    // Unbound operations do not exist.
    let err = sandbox
        .invoke("", "loadIdentity", vec![json!("x").into()], async_options())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::ScriptError);
    assert!(err.to_string().contains("fetchIdentity"));
}

#[tokio::test]
async fn test_cyclic_bridge_argument_rejects() {
    let client = StubClient::new();
    let (sandbox, _) = sandbox_with(client.clone()).await;

    let err = sandbox
        .invoke("", "loadCyclicIdentity", vec![], async_options())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), FailureKind::ScriptError);
    assert!(err.to_string().contains("cyclic"), "{}", err);
    assert!(client.calls().is_empty());
    assert!(!sandbox.is_disposed());

    let names = sandbox
        .invoke("", "bridgeNames", vec![], InvocationOptions::default())
        .await
        .unwrap();
    assert_eq!(
        names.into_data().unwrap(),
        json!(["fetchDataContract", "fetchIdentity"])
    );
}
