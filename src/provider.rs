//! Cached entity lookups for the data-fetch bridge.
//!
//! Lookup flow for both entity kinds:
//! - cache hit: return the cached entity, no remote call
//! - cache miss: JSON-RPC request, populate the cache, return the entity
//! - `-32602` (invalid argument) or a `null` result: `None`, never cached
//! - anything else: [`FetchError`] carrying the upstream message

use crate::bridge::BridgeBindings;
use anyhow::anyhow;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use url::Url;

/// JSON-RPC error code for an invalid argument.
pub const INVALID_ARGUMENT: i64 = -32602;

/// Error object of a JSON-RPC response.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RpcResponse {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn result(value: Value) -> Self {
        Self {
            result: Some(value),
            error: None,
        }
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(RpcErrorObject {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// Remote side of the bridge. `Err` means the request never produced a
/// response (transport or protocol failure).
#[async_trait]
pub trait RemoteClient: Send + Sync {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<RpcResponse>;
}

/// Cache consulted before every remote lookup.
pub trait EntityCache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
}

/// Process-wide in-memory cache. Last write wins; eviction is left to the
/// owner, who can [`clear`](MemoryCache::clear) it.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EntityCache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        self.entries.read().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(key.to_string(), value);
        }
    }
}

/// Failed lookup. Display strings carry the upstream description.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Can't fetch contract: {0}")]
    Contract(String),

    #[error("Can't fetch identity: {0}")]
    Identity(String),

    #[error("{0} id must be a string or number")]
    InvalidKey(&'static str),
}

#[derive(Debug, Clone, Copy)]
enum Entity {
    Contract,
    Identity,
}

impl Entity {
    fn method(self) -> &'static str {
        match self {
            Entity::Contract => "fetchContract",
            Entity::Identity => "fetchIdentity",
        }
    }

    fn params(self, id: &str) -> Value {
        match self {
            Entity::Contract => json!({ "contractId": id }),
            Entity::Identity => json!({ "identityId": id }),
        }
    }

    fn label(self) -> &'static str {
        match self {
            Entity::Contract => "contract",
            Entity::Identity => "identity",
        }
    }

    fn error(self, message: String) -> FetchError {
        match self {
            Entity::Contract => FetchError::Contract(message),
            Entity::Identity => FetchError::Identity(message),
        }
    }
}

/// Cached contract and identity lookups.
#[derive(Clone)]
pub struct DataProvider {
    client: Arc<dyn RemoteClient>,
    contracts: Arc<dyn EntityCache>,
    identities: Arc<dyn EntityCache>,
}

impl DataProvider {
    pub fn new(
        client: Arc<dyn RemoteClient>,
        contracts: Arc<dyn EntityCache>,
        identities: Arc<dyn EntityCache>,
    ) -> Self {
        Self {
            client,
            contracts,
            identities,
        }
    }

    pub async fn fetch_data_contract(&self, id: &str) -> Result<Option<Value>, FetchError> {
        self.fetch(Entity::Contract, id).await
    }

    pub async fn fetch_identity(&self, id: &str) -> Result<Option<Value>, FetchError> {
        self.fetch(Entity::Identity, id).await
    }

    /// Bridge bindings `fetchDataContract(id)` and `fetchIdentity(id)`.
    /// Both resolve to `null` when the entity does not exist.
    pub fn bindings(&self) -> BridgeBindings {
        let contracts = self.clone();
        let identities = self.clone();
        BridgeBindings::new()
            .with_fn("fetchDataContract", move |args| {
                let provider = contracts.clone();
                async move { provider.call(Entity::Contract, args).await }
            })
            .with_fn("fetchIdentity", move |args| {
                let provider = identities.clone();
                async move { provider.call(Entity::Identity, args).await }
            })
    }

    async fn call(&self, entity: Entity, args: Vec<Value>) -> anyhow::Result<Value> {
        let id = match args.first() {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => return Err(FetchError::InvalidKey(entity.label()).into()),
        };
        Ok(self.fetch(entity, &id).await?.unwrap_or(Value::Null))
    }

    async fn fetch(&self, entity: Entity, id: &str) -> Result<Option<Value>, FetchError> {
        let cache = match entity {
            Entity::Contract => &self.contracts,
            Entity::Identity => &self.identities,
        };

        if let Some(cached) = cache.get(id) {
            tracing::trace!(entity = entity.label(), id, "cache hit");
            return Ok(Some(cached));
        }

        tracing::debug!(entity = entity.label(), id, "fetching from remote");
        let response = self
            .client
            .request(entity.method(), entity.params(id))
            .await
            .map_err(|e| entity.error(e.to_string()))?;

        if let Some(error) = response.error {
            if error.code == INVALID_ARGUMENT {
                return Ok(None);
            }
            return Err(entity.error(error.message));
        }

        match response.result {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                cache.set(id, value.clone());
                Ok(Some(value))
            }
        }
    }
}

/// JSON-RPC 2.0 client over HTTP POST.
pub struct JsonRpcClient {
    client: Client,
    endpoint: Url,
    next_id: AtomicU64,
}

impl JsonRpcClient {
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let endpoint = Url::parse(endpoint)
            .map_err(|e| anyhow!("Invalid URL '{}': {}", endpoint, e))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(anyhow!(
                "Unsupported scheme '{}' for JSON-RPC endpoint",
                endpoint.scheme()
            ));
        }

        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        Ok(Self {
            client,
            endpoint,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl RemoteClient for JsonRpcClient {
    async fn request(&self, method: &str, params: Value) -> anyhow::Result<RpcResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!(
                "unexpected HTTP status {} from {}",
                status,
                self.endpoint
            ));
        }

        response
            .json::<RpcResponse>()
            .await
            .map_err(|e| anyhow!("invalid JSON-RPC response: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct MockClient {
        response: Mutex<Option<anyhow::Result<RpcResponse>>>,
        calls: Mutex<Vec<(String, Value)>>,
    }

    impl MockClient {
        fn responding(response: anyhow::Result<RpcResponse>) -> Arc<Self> {
            Arc::new(Self {
                response: Mutex::new(Some(response)),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RemoteClient for MockClient {
        async fn request(&self, method: &str, params: Value) -> anyhow::Result<RpcResponse> {
            self.calls.lock().unwrap().push((method.to_string(), params));
            self.response
                .lock()
                .unwrap()
                .take()
                .unwrap_or_else(|| Ok(RpcResponse::default()))
        }
    }

    fn provider(client: Arc<MockClient>) -> (DataProvider, Arc<MemoryCache>, Arc<MemoryCache>) {
        let contracts = Arc::new(MemoryCache::new());
        let identities = Arc::new(MemoryCache::new());
        let provider = DataProvider::new(client, contracts.clone(), identities.clone());
        (provider, contracts, identities)
    }

    #[tokio::test]
    async fn test_fetch_contract_from_cache() {
        let client = MockClient::responding(Ok(RpcResponse::default()));
        let (provider, contracts, _) = provider(client.clone());
        contracts.set("123", json!({"version": 1}));

        let contract = provider.fetch_data_contract("123").await.unwrap();

        assert_eq!(contract, Some(json!({"version": 1})));
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn test_fetch_contract_populates_cache() {
        let contract = json!({"version": 1, "documents": {"note": {}}});
        let client = MockClient::responding(Ok(RpcResponse::result(contract.clone())));
        let (provider, contracts, identities) = provider(client.clone());

        let fetched = provider.fetch_data_contract("123").await.unwrap();

        assert_eq!(fetched, Some(contract.clone()));
        assert_eq!(
            client.calls(),
            vec![("fetchContract".to_string(), json!({"contractId": "123"}))]
        );
        assert_eq!(contracts.get("123"), Some(contract.clone()));
        assert!(identities.is_empty());

        // Second lookup is served from the cache.
        assert_eq!(provider.fetch_data_contract("123").await.unwrap(), Some(contract));
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_upstream_error_is_reported() {
        let client = MockClient::responding(Ok(RpcResponse::error(
            42,
            "not the message you are looking for",
        )));
        let (provider, _, _) = provider(client);

        let err = provider.fetch_data_contract("123").await.unwrap_err();

        assert_eq!(
            err.to_string(),
            "Can't fetch contract: not the message you are looking for"
        );
    }

    #[tokio::test]
    async fn test_invalid_argument_is_absence() {
        let client = MockClient::responding(Ok(RpcResponse::error(INVALID_ARGUMENT, "")));
        let (provider, contracts, _) = provider(client);

        assert_eq!(provider.fetch_data_contract("123").await.unwrap(), None);
        assert!(contracts.is_empty());
    }

    #[tokio::test]
    async fn test_null_identity_is_absence() {
        let client = MockClient::responding(Ok(RpcResponse::result(Value::Null)));
        let (provider, _, identities) = provider(client.clone());

        assert_eq!(provider.fetch_identity("abc").await.unwrap(), None);
        assert_eq!(
            client.calls(),
            vec![("fetchIdentity".to_string(), json!({"identityId": "abc"}))]
        );
        assert!(identities.is_empty());
    }

    #[tokio::test]
    async fn test_transport_failure() {
        let client = MockClient::responding(Err(anyhow!("connection refused")));
        let (provider, _, _) = provider(client);

        let err = provider.fetch_identity("abc").await.unwrap_err();
        assert_eq!(err.to_string(), "Can't fetch identity: connection refused");
    }

    #[tokio::test]
    async fn test_bindings_resolve_null_for_missing() {
        let client = MockClient::responding(Ok(RpcResponse::result(Value::Null)));
        let (provider, _, _) = provider(client);
        let bindings = provider.bindings();

        assert_eq!(
            bindings.names(),
            vec!["fetchDataContract".to_string(), "fetchIdentity".to_string()]
        );

        let fetch = bindings.get("fetchDataContract").unwrap();
        assert_eq!(fetch.call(vec![json!(7)]).await.unwrap(), Value::Null);

        let err = fetch.call(vec![json!({"id": 1})]).await.unwrap_err();
        assert_eq!(err.to_string(), "contract id must be a string or number");
    }

    #[test]
    fn test_memory_cache_last_write_wins() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1));
        cache.set("k", json!(2));
        assert_eq!(cache.get("k"), Some(json!(2)));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.get("k").is_none());
    }

    #[test]
    fn test_rpc_client_rejects_bad_endpoints() {
        assert!(JsonRpcClient::new("not a url").is_err());
        assert!(JsonRpcClient::new("ftp://example.com").is_err());

        let client = JsonRpcClient::new("http://localhost:3000/rpc").unwrap();
        assert_eq!(client.endpoint().path(), "/rpc");
    }

    #[test]
    fn test_rpc_response_parsing() {
        let response: RpcResponse =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32602}}"#).unwrap();
        assert!(response.result.is_none());
        assert_eq!(response.error.map(|e| e.code), Some(INVALID_ARGUMENT));
    }
}
