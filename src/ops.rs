//! Sandbox runtime extension: every op sandboxed code can reach.
//!
//! The same extension is registered when a snapshot is built and when a
//! sandbox is restored from it, so the op tables always line up.

use crate::bridge::BridgeBindings;
use crate::marshal::{copy_out, HostRegistry};
use anyhow::{anyhow, Error};
use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;
use deno_core::{op2, v8, OpState};
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

// ============================================================================
// Console Output Capture
// ============================================================================

/// Captured console output from the sandboxed runtime
#[derive(Debug, Default, Clone)]
pub struct ConsoleOutput {
    pub logs: Vec<String>,
    pub warns: Vec<String>,
    pub errors: Vec<String>,
}

#[op2(fast)]
pub fn op_sandbox_log(state: &mut OpState, #[string] level: &str, #[string] msg: &str) {
    match level {
        "error" => tracing::error!(target: "validator_sandbox::console", "{}", msg),
        "warn" => tracing::warn!(target: "validator_sandbox::console", "{}", msg),
        "debug" => tracing::debug!(target: "validator_sandbox::console", "{}", msg),
        _ => tracing::info!(target: "validator_sandbox::console", "{}", msg),
    }

    if let Some(output) = state.try_borrow_mut::<ConsoleOutput>() {
        match level {
            "error" => output.errors.push(msg.to_string()),
            "warn" => output.warns.push(msg.to_string()),
            _ => output.logs.push(msg.to_string()),
        }
    }
}

// ============================================================================
// Encoding and Hashing
// ============================================================================

/// Base64 as `atob` accepts it: padding optional.
const FORGIVING_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// `btoa`: the input is a binary string, one byte per UTF-16 code unit.
#[op2]
#[string]
pub fn op_base64_encode(#[string] data: &str) -> Result<String, Error> {
    let bytes = latin1_bytes(data)?;
    Ok(FORGIVING_BASE64.encode(bytes))
}

/// `atob`: returns a binary string, one code unit per decoded byte.
#[op2]
#[string]
pub fn op_base64_decode(#[string] data: &str) -> Result<String, Error> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = FORGIVING_BASE64
        .decode(compact)
        .map_err(|e| anyhow!("The string to be decoded is not correctly encoded: {}", e))?;
    Ok(bytes.into_iter().map(char::from).collect())
}

fn latin1_bytes(data: &str) -> Result<Vec<u8>, Error> {
    data.chars()
        .map(|c| {
            u8::try_from(u32::from(c))
                .map_err(|_| anyhow!("The string to be encoded contains characters outside of the Latin1 range"))
        })
        .collect()
}

/// `crypto.subtle.digest`, used by bundles to derive identifiers.
#[op2]
#[buffer]
pub fn op_digest(#[string] algorithm: &str, #[buffer] data: &[u8]) -> Result<Vec<u8>, Error> {
    digest(algorithm, data)
}

fn digest(algorithm: &str, data: &[u8]) -> Result<Vec<u8>, Error> {
    use sha2::{Digest, Sha256, Sha384, Sha512};

    match algorithm.to_ascii_uppercase().as_str() {
        "SHA-256" | "SHA256" => Ok(Sha256::digest(data).to_vec()),
        "SHA-384" | "SHA384" => Ok(Sha384::digest(data).to_vec()),
        "SHA-512" | "SHA512" => Ok(Sha512::digest(data).to_vec()),
        _ => Err(anyhow!(
            "Unsupported algorithm: {}. Supported: SHA-256, SHA-384, SHA-512",
            algorithm
        )),
    }
}

// ============================================================================
// Bridge Ops
// ============================================================================

/// Copy call arguments out of the sandbox as JSON text. Runs before every
/// bridge and host call so the async ops only ever see bounded, acyclic
/// data.
#[op2(reentrant)]
#[string]
pub fn op_copy_arguments<'s>(
    scope: &mut v8::HandleScope<'s>,
    args: v8::Local<'s, v8::Value>,
) -> Result<String, Error> {
    let args = copy_out(scope, args).map_err(|e| anyhow!("{}", e))?;
    Ok(args.to_string())
}

fn parse_arguments(args: &str) -> Result<Vec<Value>, Error> {
    serde_json::from_str(args).map_err(|e| anyhow!("invalid call arguments: {}", e))
}

/// Dispatch a call from a bridge-bound global to its host operation.
#[op2(async)]
#[serde]
pub async fn op_bridge_call(
    state: Rc<RefCell<OpState>>,
    #[string] name: String,
    #[string] args: String,
) -> Result<serde_json::Value, deno_core::error::AnyError> {
    let args = parse_arguments(&args)?;
    let operation = {
        let state_ref = state.borrow();
        state_ref
            .try_borrow::<BridgeBindings>()
            .and_then(|bindings| bindings.get(&name))
    }
    .ok_or_else(|| anyhow!("bridge operation '{}' is not available", name))?;

    operation.call(args).await
}

/// Invoke a host function passed by reference in the current invocation.
#[op2(async)]
#[serde]
pub async fn op_host_call(
    state: Rc<RefCell<OpState>>,
    id: u32,
    #[string] args: String,
) -> Result<serde_json::Value, deno_core::error::AnyError> {
    let args = parse_arguments(&args)?;
    let function = {
        let state_ref = state.borrow();
        state_ref
            .try_borrow::<HostRegistry>()
            .and_then(|registry| registry.function(id))
    }
    .ok_or_else(|| anyhow!("host reference is no longer available"))?;

    function.call(args).await
}

/// Copy host data passed by reference in the current invocation.
#[op2]
#[serde]
pub fn op_host_data_copy(state: &mut OpState, id: u32) -> Result<serde_json::Value, Error> {
    state
        .try_borrow::<HostRegistry>()
        .and_then(|registry| registry.data(id))
        .ok_or_else(|| anyhow!("host reference is no longer available"))
}

// ============================================================================
// Extension Definition
// ============================================================================

deno_core::extension!(
    validator_runtime,
    ops = [
        op_sandbox_log,
        op_base64_encode,
        op_base64_decode,
        op_digest,
        op_copy_arguments,
        op_bridge_call,
        op_host_call,
        op_host_data_copy,
    ],
    esm_entry_point = "ext:validator_runtime/bootstrap.js",
    esm = ["ext:validator_runtime/bootstrap.js" = "src/bootstrap.js"],
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_algorithms() {
        assert_eq!(digest("SHA-256", b"abc").unwrap().len(), 32);
        assert_eq!(digest("sha-384", b"abc").unwrap().len(), 48);
        assert_eq!(digest("SHA512", b"abc").unwrap().len(), 64);
        assert_eq!(
            digest("SHA-256", b"abc").unwrap()[..4],
            [0xba, 0x78, 0x16, 0xbf]
        );
    }

    #[test]
    fn test_unsupported_digest() {
        let err = digest("MD5", b"abc").unwrap_err();
        assert!(err.to_string().contains("Unsupported algorithm: MD5"));
    }

    #[test]
    fn test_base64_keeps_binary_bytes() {
        // 0xff and 0x80 are not valid UTF-8 on their own.
        let binary: String = [0x02u8, 0xff, 0x80, 0x00].iter().map(|&b| char::from(b)).collect();
        let encoded = FORGIVING_BASE64.encode(latin1_bytes(&binary).unwrap());
        assert_eq!(encoded, "Av+AAA==");

        let decoded = FORGIVING_BASE64.decode("Av+AAA").unwrap();
        assert_eq!(decoded, vec![0x02, 0xff, 0x80, 0x00]);
    }

    #[test]
    fn test_base64_rejects_wide_characters() {
        let err = latin1_bytes("snow ☃").unwrap_err();
        assert!(err.to_string().contains("Latin1"));
    }

    #[test]
    fn test_arguments_must_be_an_array() {
        assert_eq!(parse_arguments("[1,\"a\"]").unwrap().len(), 2);
        assert!(parse_arguments("{\"a\":1}").is_err());
    }
}
