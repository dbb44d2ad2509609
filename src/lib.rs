//! # Validator Sandbox
//!
//! A preemptible runtime for untrusted state-transition validation code,
//! built on deno_core.
//!
//! ## Security Guarantees
//!
//! - **Bounded time**: every invocation can carry a deadline that also stops
//!   synchronous busy loops, not just pending promises
//! - **Bounded memory**: each sandbox has its own V8 heap ceiling; hitting it
//!   disposes the sandbox instead of the process
//! - **No ambient authority**: no filesystem, network, timers, environment or
//!   `Deno` namespace; only the bridge operations bound at creation
//! - **No shared object graphs**: values are deep-copied across the boundary,
//!   or passed as restricted handles that can only be invoked or copied
//!
//! ## Usage
//!
//! ```rust,ignore
//! use validator_sandbox::{
//!     create_sandbox, BridgeBindings, InvocationOptions, ResourceLimits, SnapshotBuilder,
//! };
//!
//! #[tokio::main]
//! async fn main() {
//!     let bundle = std::fs::read_to_string("./dist/validator.js").unwrap();
//!     let snapshot = SnapshotBuilder::current_exe().unwrap().build(&bundle).await.unwrap();
//!
//!     let sandbox = create_sandbox(&snapshot, ResourceLimits::default(), BridgeBindings::new())
//!         .await
//!         .unwrap();
//!     let result = sandbox
//!         .invoke(
//!             "stateTransition",
//!             "validate",
//!             vec![serde_json::json!({ "type": 1 }).into()],
//!             InvocationOptions::default().with_timeout_millis(500),
//!         )
//!         .await;
//!
//!     println!("{:?}", result);
//! }
//! ```

mod bridge;
mod config;
mod error;
mod invoke;
mod marshal;
mod ops;
mod preempt;
mod provider;
mod sandbox;
mod snapshot;

pub use bridge::{BridgeBindings, BridgeOperation};
pub use config::{InvocationOptions, ResourceLimits, TransferMode};
pub use error::{
    FailureKind, Result, SandboxError, DISPOSED_MESSAGE, MEMORY_LIMIT_MESSAGE, TIMEOUT_MESSAGE,
};
pub use marshal::{sanitize_data, HostFunction, HostValue, SandboxReference};
pub use ops::ConsoleOutput;
pub use provider::{
    DataProvider, EntityCache, FetchError, JsonRpcClient, MemoryCache, RemoteClient,
    RpcErrorObject, RpcResponse, INVALID_ARGUMENT,
};
pub use sandbox::{create_sandbox, create_sandbox_cold, Sandbox};
pub use snapshot::{build_snapshot, BuildMode, Snapshot, SnapshotBuilder, SnapshotCache};
