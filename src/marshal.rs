//! Values crossing the host/sandbox boundary.
//!
//! Copy mode deep-copies, so nothing the sandbox receives aliases host memory
//! and vice versa. Host data goes in through `serde_v8`; sandbox values come
//! out through a bounded walker that never trusts their shape.
//!
//! Reference mode never hands out object graphs: the sandbox gets frozen
//! proxies that forward invocations (with copied arguments) to
//! pre-registered host capabilities, and the host gets opaque
//! [`SandboxReference`] slots that can only be invoked, copied or released
//! through the owning [`Sandbox`](crate::Sandbox).

use crate::config::TransferMode;
use crate::error::SandboxError;
use deno_core::{serde_v8, v8, OpState};
use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use uuid::Uuid;

/// Maximum nesting depth for copied values. Deeper graphs (and cycles) are
/// rejected instead of recursing without bound.
const MAX_DEPTH: usize = 64;

/// Keys that would rewrite an object's prototype when materialized in V8.
const DANGEROUS_KEYS: &[&str] = &["__proto__"];

type BoxedHostFn = dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync;

/// A host-side async function that sandboxed code may call through a
/// reference-mode proxy. Arguments and the result are always copied.
#[derive(Clone)]
pub struct HostFunction(Arc<BoxedHostFn>);

impl HostFunction {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self(Arc::new(move |args| f(args).boxed()))
    }

    pub(crate) fn call(&self, args: Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> {
        (self.0)(args)
    }
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostFunction(..)")
    }
}

/// Handle to a value that stays inside one sandbox's heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SandboxReference {
    pub(crate) sandbox: Uuid,
    pub(crate) slot: u32,
}

impl SandboxReference {
    /// Id of the sandbox that owns the referenced value.
    pub fn sandbox_id(&self) -> Uuid {
        self.sandbox
    }
}

/// A value on the host side of the boundary.
#[derive(Debug, Clone)]
pub enum HostValue {
    Data(Value),
    Function(HostFunction),
    Reference(SandboxReference),
}

impl HostValue {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            HostValue::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_data(self) -> Option<Value> {
        match self {
            HostValue::Data(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<SandboxReference> {
        match self {
            HostValue::Reference(reference) => Some(*reference),
            _ => None,
        }
    }
}

impl From<Value> for HostValue {
    fn from(value: Value) -> Self {
        HostValue::Data(value)
    }
}

impl From<HostFunction> for HostValue {
    fn from(function: HostFunction) -> Self {
        HostValue::Function(function)
    }
}

impl From<SandboxReference> for HostValue {
    fn from(reference: SandboxReference) -> Self {
        HostValue::Reference(reference)
    }
}

/// Reject host data that cannot be materialized safely in the sandbox.
pub fn sanitize_data(value: &Value) -> Result<(), SandboxError> {
    sanitize_recursive(value, 0)
}

fn sanitize_recursive(value: &Value, depth: usize) -> Result<(), SandboxError> {
    if depth > MAX_DEPTH {
        return Err(SandboxError::host_bridge(format!(
            "argument nesting too deep (max {} levels)",
            MAX_DEPTH
        )));
    }

    match value {
        Value::Object(map) => {
            for (key, val) in map {
                if DANGEROUS_KEYS.contains(&key.as_str()) {
                    return Err(SandboxError::host_bridge(format!(
                        "'{}' key is forbidden in copied arguments",
                        key
                    )));
                }
                sanitize_recursive(val, depth + 1)?;
            }
            Ok(())
        }
        Value::Array(items) => items
            .iter()
            .try_for_each(|item| sanitize_recursive(item, depth + 1)),
        _ => Ok(()),
    }
}

/// Host capabilities handed to the sandbox during the current invocation.
/// Lives in `OpState` so the host-call ops can reach it; cleared when the
/// invocation ends.
#[derive(Default)]
pub(crate) struct HostRegistry {
    next_id: u32,
    entries: HashMap<u32, HostCapability>,
}

pub(crate) enum HostCapability {
    Function(HostFunction),
    Data(Value),
}

impl HostRegistry {
    fn register(&mut self, capability: HostCapability) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.entries.insert(id, capability);
        id
    }

    pub(crate) fn function(&self, id: u32) -> Option<HostFunction> {
        match self.entries.get(&id) {
            Some(HostCapability::Function(function)) => Some(function.clone()),
            _ => None,
        }
    }

    pub(crate) fn data(&self, id: u32) -> Option<Value> {
        match self.entries.get(&id) {
            Some(HostCapability::Data(value)) => Some(value.clone()),
            _ => None,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Sandbox values the host holds references to.
#[derive(Default)]
pub(crate) struct ReferenceTable {
    next_slot: u32,
    values: HashMap<u32, v8::Global<v8::Value>>,
}

impl ReferenceTable {
    fn insert(&mut self, value: v8::Global<v8::Value>) -> u32 {
        let slot = self.next_slot;
        self.next_slot = self.next_slot.wrapping_add(1);
        self.values.insert(slot, value);
        slot
    }

    pub(crate) fn get<'s>(
        &self,
        scope: &mut v8::HandleScope<'s>,
        sandbox: Uuid,
        reference: &SandboxReference,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        if reference.sandbox != sandbox {
            return Err(SandboxError::host_bridge(
                "reference belongs to a different sandbox",
            ));
        }
        self.values
            .get(&reference.slot)
            .map(|global| v8::Local::new(scope, global))
            .ok_or_else(|| SandboxError::host_bridge("reference has been released"))
    }

    pub(crate) fn remove(&mut self, reference: &SandboxReference) -> bool {
        self.values.remove(&reference.slot).is_some()
    }
}

/// JS factories (from `bootstrap.js`) that build the sandbox-side proxies.
pub(crate) struct ProxyFactory {
    pub(crate) host_function: v8::Global<v8::Function>,
    pub(crate) host_data: v8::Global<v8::Function>,
}

/// Converts values for one invocation of one sandbox.
pub(crate) struct Marshaller<'a> {
    pub(crate) sandbox: Uuid,
    pub(crate) proxies: &'a ProxyFactory,
    pub(crate) op_state: Rc<RefCell<OpState>>,
    pub(crate) references: &'a mut ReferenceTable,
}

impl Marshaller<'_> {
    pub(crate) fn to_sandbox<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: &HostValue,
        mode: TransferMode,
    ) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
        match (value, mode) {
            (HostValue::Data(data), TransferMode::Copy) => {
                sanitize_data(data)?;
                serde_v8::to_v8(scope, data).map_err(copy_error)
            }
            (HostValue::Data(data), TransferMode::Reference) => {
                let id = self.register(HostCapability::Data(data.clone()));
                make_proxy(scope, &self.proxies.host_data, id)
            }
            (HostValue::Function(_), TransferMode::Copy) => Err(SandboxError::host_bridge(
                "host functions cannot be copied into the sandbox; pass them by reference",
            )),
            (HostValue::Function(function), TransferMode::Reference) => {
                let id = self.register(HostCapability::Function(function.clone()));
                make_proxy(scope, &self.proxies.host_function, id)
            }
            (HostValue::Reference(_), TransferMode::Copy) => Err(SandboxError::host_bridge(
                "sandbox references cannot be copied; pass them by reference",
            )),
            (HostValue::Reference(reference), TransferMode::Reference) => {
                self.references.get(scope, self.sandbox, reference)
            }
        }
    }

    pub(crate) fn from_sandbox<'s>(
        &mut self,
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
        mode: TransferMode,
    ) -> Result<HostValue, SandboxError> {
        match mode {
            TransferMode::Copy => copy_out(scope, value).map(HostValue::Data),
            TransferMode::Reference => {
                let slot = self.references.insert(v8::Global::new(scope, value));
                Ok(HostValue::Reference(SandboxReference {
                    sandbox: self.sandbox,
                    slot,
                }))
            }
        }
    }

    fn register(&self, capability: HostCapability) -> u32 {
        self.op_state
            .borrow_mut()
            .borrow_mut::<HostRegistry>()
            .register(capability)
    }
}

/// Upper bound on values (elements, properties and leaves) copied out of a
/// sandbox in one transfer.
const MAX_COPY_NODES: usize = 1_000_000;
/// Upper bound on string and binary bytes copied out in one transfer.
const MAX_COPY_BYTES: usize = 64 * 1024 * 1024;

/// Deep-copy a sandbox value into host data.
///
/// Cycles, graphs beyond the node or byte budget and nesting deeper than
/// [`MAX_DEPTH`] are rejected before anything large is allocated on the
/// host. Getters run as sandbox code, so callers keep the watchdog armed
/// around the copy; a getter that throws fails the copy as a script error.
pub(crate) fn copy_out<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
) -> Result<Value, SandboxError> {
    let tc = &mut v8::TryCatch::new(scope);
    Copier::default().copy(tc, value, &mut Vec::new())
}

/// Budget of one copy.
#[derive(Default)]
struct Copier {
    nodes: usize,
    bytes: usize,
}

impl Copier {
    fn copy<'s>(
        &mut self,
        scope: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
        value: v8::Local<'s, v8::Value>,
        ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    ) -> Result<Value, SandboxError> {
        self.take_nodes(1)?;

        if value.is_null_or_undefined() {
            return Ok(Value::Null);
        }
        if value.is_boolean() {
            return Ok(Value::Bool(value.is_true()));
        }
        if value.is_number() {
            let number = value.number_value(scope).unwrap_or(f64::NAN);
            return Ok(json_number(number));
        }
        if let Ok(string) = v8::Local::<v8::String>::try_from(value) {
            self.take_bytes(string.utf8_length(scope))?;
            return Ok(Value::String(string.to_rust_string_lossy(scope)));
        }
        if let Some(what) = unsupported(value) {
            return Err(SandboxError::host_bridge(format!(
                "{} cannot be copied across the sandbox boundary",
                what
            )));
        }
        if let Ok(view) = v8::Local::<v8::ArrayBufferView>::try_from(value) {
            return self.copy_bytes(&view);
        }
        if let Ok(buffer) = v8::Local::<v8::ArrayBuffer>::try_from(value) {
            let length = buffer.byte_length();
            let view = v8::Uint8Array::new(scope, buffer, 0, length)
                .ok_or_else(|| SandboxError::host_bridge("failed to read an ArrayBuffer"))?;
            return self.copy_bytes(&view);
        }

        let object = v8::Local::<v8::Object>::try_from(value).map_err(|_| {
            SandboxError::host_bridge("value cannot be copied across the sandbox boundary")
        })?;
        if ancestors.iter().any(|ancestor| ancestor.strict_equals(value)) {
            return Err(SandboxError::host_bridge(
                "cyclic values cannot be copied across the sandbox boundary",
            ));
        }
        if ancestors.len() >= MAX_DEPTH {
            return Err(SandboxError::host_bridge(format!(
                "value nesting too deep (max {} levels); it cannot be copied",
                MAX_DEPTH
            )));
        }

        ancestors.push(object);
        let copied = match v8::Local::<v8::Array>::try_from(value) {
            Ok(array) => self.copy_array(scope, array, ancestors),
            Err(_) => self.copy_object(scope, object, ancestors),
        };
        ancestors.pop();
        copied
    }

    fn copy_array<'s>(
        &mut self,
        scope: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
        array: v8::Local<'s, v8::Array>,
        ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    ) -> Result<Value, SandboxError> {
        let length = array.length();
        self.reserve_nodes(length as usize)?;

        let mut items = Vec::with_capacity(length as usize);
        for index in 0..length {
            let Some(item) = array.get_index(scope, index) else {
                return Err(read_failure(scope));
            };
            items.push(self.copy(scope, item, ancestors)?);
        }
        Ok(Value::Array(items))
    }

    fn copy_object<'s>(
        &mut self,
        scope: &mut v8::TryCatch<'_, v8::HandleScope<'s>>,
        object: v8::Local<'s, v8::Object>,
        ancestors: &mut Vec<v8::Local<'s, v8::Object>>,
    ) -> Result<Value, SandboxError> {
        let Some(keys) = object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
        else {
            return Err(read_failure(scope));
        };
        self.reserve_nodes(keys.length() as usize)?;

        let mut map = serde_json::Map::new();
        for index in 0..keys.length() {
            let Some(key) = keys.get_index(scope, index) else {
                return Err(read_failure(scope));
            };
            let Some(item) = object.get(scope, key) else {
                return Err(read_failure(scope));
            };
            let key = key.to_rust_string_lossy(scope);
            self.take_bytes(key.len())?;
            let item = self.copy(scope, item, ancestors)?;
            map.insert(key, item);
        }
        Ok(Value::Object(map))
    }

    /// Binary data crosses as an array of byte values.
    fn copy_bytes(&mut self, view: &v8::ArrayBufferView) -> Result<Value, SandboxError> {
        let length = view.byte_length();
        self.take_bytes(length)?;
        self.take_nodes(length)?;
        let mut bytes = vec![0u8; length];
        let copied = view.copy_contents(&mut bytes);
        bytes.truncate(copied);
        Ok(Value::Array(bytes.into_iter().map(Value::from).collect()))
    }

    /// Fail early when `count` more values could not fit the budget.
    fn reserve_nodes(&self, count: usize) -> Result<(), SandboxError> {
        if count > MAX_COPY_NODES.saturating_sub(self.nodes) {
            return Err(too_large());
        }
        Ok(())
    }

    fn take_nodes(&mut self, count: usize) -> Result<(), SandboxError> {
        self.reserve_nodes(count)?;
        self.nodes += count;
        Ok(())
    }

    fn take_bytes(&mut self, count: usize) -> Result<(), SandboxError> {
        if count > MAX_COPY_BYTES.saturating_sub(self.bytes) {
            return Err(too_large());
        }
        self.bytes += count;
        Ok(())
    }
}

fn unsupported(value: v8::Local<'_, v8::Value>) -> Option<&'static str> {
    if value.is_function() {
        Some("functions")
    } else if value.is_symbol() {
        Some("symbols")
    } else if value.is_promise() {
        Some("promises")
    } else if value.is_proxy() {
        Some("proxies")
    } else if value.is_big_int() {
        Some("BigInt values")
    } else if value.is_external() {
        Some("host handles")
    } else {
        None
    }
}

/// Integral numbers within the safe integer range stay integers; NaN and
/// infinities become `null` as in JSON.
fn json_number(number: f64) -> Value {
    const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;
    if number.fract() == 0.0 && number.abs() <= MAX_SAFE_INTEGER {
        Value::from(number as i64)
    } else {
        serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn too_large() -> SandboxError {
    SandboxError::host_bridge(format!(
        "value too large to copy across the sandbox boundary (limit {} values, {} bytes)",
        MAX_COPY_NODES, MAX_COPY_BYTES
    ))
}

/// Error for a property read that returned nothing: terminated execution
/// or a throwing getter.
fn read_failure<'s>(scope: &mut v8::TryCatch<'_, v8::HandleScope<'s>>) -> SandboxError {
    if scope.has_terminated() {
        return SandboxError::host_bridge("execution was terminated while copying a value");
    }
    match scope.exception() {
        Some(exception) => {
            let (name, message) = describe_thrown(scope, exception);
            SandboxError::script(name, message)
        }
        None => SandboxError::host_bridge("value could not be read while copying"),
    }
}

/// Name and message of a thrown value. The name is the error's own `name`
/// unless it is the generic `Error`, then its constructor's name.
pub(crate) fn describe_thrown<'s>(
    scope: &mut v8::HandleScope<'s>,
    exception: v8::Local<'s, v8::Value>,
) -> (Option<String>, String) {
    let Ok(object) = v8::Local::<v8::Object>::try_from(exception) else {
        return (None, exception.to_rust_string_lossy(scope));
    };

    let declared = read_string(scope, object, "name");
    let constructor = object.get_constructor_name().to_rust_string_lossy(scope);
    let name = match declared {
        Some(name) if name != "Error" => Some(name),
        _ if !constructor.is_empty() && constructor != "Object" => Some(constructor),
        declared => declared,
    };
    let message =
        read_string(scope, object, "message").unwrap_or_else(|| exception.to_rust_string_lossy(scope));
    (name, message)
}

fn read_string<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    key: &str,
) -> Option<String> {
    let key = v8::String::new(scope, key)?;
    let value = object.get(scope, key.into())?;
    value
        .is_string()
        .then(|| value.to_rust_string_lossy(scope))
}

fn make_proxy<'s>(
    scope: &mut v8::HandleScope<'s>,
    factory: &v8::Global<v8::Function>,
    id: u32,
) -> Result<v8::Local<'s, v8::Value>, SandboxError> {
    let factory = v8::Local::new(scope, factory);
    let recv = v8::undefined(scope).into();
    let id = v8::Integer::new_from_unsigned(scope, id).into();
    factory
        .call(scope, recv, &[id])
        .ok_or_else(|| SandboxError::host_bridge("failed to create host proxy"))
}

fn copy_error(err: serde_v8::Error) -> SandboxError {
    SandboxError::host_bridge(format!(
        "value cannot be copied into the sandbox: {}",
        err
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_plain_data_passes() {
        let value = json!({
            "type": 1,
            "ownerId": "abc",
            "documents": [{"$type": "note", "message": "hi"}, 2, null],
        });
        assert!(sanitize_data(&value).is_ok());
    }

    #[test]
    fn test_blocks_nested_proto() {
        let value = json!({"safe": {"nested": [{"__proto__": {"polluted": true}}]}});
        let err = sanitize_data(&value).unwrap_err();
        assert!(err.to_string().contains("__proto__"));
    }

    #[test]
    fn test_depth_limit() {
        let mut value = json!({"leaf": true});
        for _ in 0..70 {
            value = json!([value]);
        }
        let err = sanitize_data(&value).unwrap_err();
        assert!(err.to_string().contains("too deep"));
    }

    #[test]
    fn test_numbers_copy_like_json() {
        assert_eq!(json_number(1.0), json!(1));
        assert_eq!(json_number(-0.0), json!(0));
        assert_eq!(json_number(2.5), json!(2.5));
        assert_eq!(json_number(1e300), json!(1e300));
        assert_eq!(json_number(f64::NAN), Value::Null);
        assert_eq!(json_number(f64::INFINITY), Value::Null);
    }

    #[test]
    fn test_copy_budget() {
        let mut copier = Copier::default();
        assert!(copier.reserve_nodes(MAX_COPY_NODES).is_ok());
        assert!(copier.reserve_nodes(u32::MAX as usize).is_err());

        copier.take_nodes(MAX_COPY_NODES - 1).unwrap();
        assert!(copier.take_nodes(2).is_err());
        assert!(copier.take_nodes(1).is_ok());

        assert!(copier.take_bytes(MAX_COPY_BYTES).is_ok());
        let err = copier.take_bytes(1).unwrap_err();
        assert!(err.to_string().contains("too large"));
    }

    #[test]
    fn test_registry_revokes_on_clear() {
        let mut registry = HostRegistry::default();
        let data = registry.register(HostCapability::Data(json!([1, 2])));
        let function = registry.register(HostCapability::Function(HostFunction::new(
            |_| async { Ok(Value::Null) },
        )));

        assert_eq!(registry.data(data), Some(json!([1, 2])));
        assert!(registry.function(function).is_some());
        assert!(registry.function(data).is_none());

        registry.clear();
        assert!(registry.data(data).is_none());
        assert!(registry.function(function).is_none());
    }

    #[tokio::test]
    async fn test_host_function_call() {
        let double = HostFunction::new(|args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or_default();
            Ok(json!(n * 2))
        });
        assert_eq!(double.call(vec![json!(21)]).await.unwrap(), json!(42));
    }

    #[test]
    fn test_host_value_conversions() {
        let value: HostValue = json!({"a": 1}).into();
        assert_eq!(value.as_data(), Some(&json!({"a": 1})));
        assert!(value.as_reference().is_none());

        let reference = SandboxReference {
            sandbox: Uuid::new_v4(),
            slot: 3,
        };
        let value: HostValue = reference.into();
        assert_eq!(value.as_reference(), Some(reference));
        assert!(value.into_data().is_none());
    }
}
