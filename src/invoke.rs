//! Function invoker: one call into a live isolate, start to settlement.
//!
//! An [`Invoker`] owns the isolate for the whole life of a sandbox and lives
//! on the sandbox's worker thread. Each invocation marshals its arguments,
//! resolves the target, runs the call under a [`Watchdog`], drives the event
//! loop when the result is a promise, and classifies whatever comes out.

use crate::bridge::BridgeBindings;
use crate::config::{InvocationOptions, TransferMode};
use crate::error::{Result, SandboxError};
use crate::marshal::{
    copy_out, describe_thrown, HostRegistry, HostValue, Marshaller, ProxyFactory, ReferenceTable,
    SandboxReference,
};
use crate::ops::ConsoleOutput;
use crate::preempt::{HeapGuard, Interruptions, Watchdog};
use deno_core::{v8, JsRuntime, PollEventLoopOptions};
use serde_json::Value;
use std::future::poll_fn;
use std::task::Poll;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// Global installed by `bootstrap.js`, removed again by its `lockdown`.
const INTERNALS: &str = "__sandbox_internals__";

/// What an invocation calls.
#[derive(Debug, Clone)]
pub(crate) enum Target {
    /// A function reached from the global object through a dotted path.
    Path { path: String, function: String },
    /// A function the host holds a reference to.
    Reference(SandboxReference),
}

/// How a call ended before classification.
enum Outcome {
    Value(HostValue),
    Failed(SandboxError),
    /// Execution was stopped from outside (watchdog, heap guard, disposal).
    Interrupted,
}

/// Result of the synchronous part of a call.
enum Step {
    Done(Outcome),
    Pending(v8::Global<v8::Promise>),
}

/// Result of driving the event loop for a pending promise.
enum Wait {
    Settled,
    Stalled,
    EventLoop(String),
    Deadline,
    Disposed,
}

pub(crate) struct Invoker {
    runtime: JsRuntime,
    sandbox: Uuid,
    proxies: ProxyFactory,
    references: ReferenceTable,
    heap: HeapGuard,
    poisoned: bool,
}

impl Invoker {
    /// Take ownership of a bootstrapped runtime: wire the op state, bind the
    /// bridge globals and lock the global scope down.
    pub(crate) fn new(
        mut runtime: JsRuntime,
        sandbox: Uuid,
        heap: HeapGuard,
        bindings: BridgeBindings,
    ) -> Result<Self> {
        let names = bindings.names();
        {
            let op_state = runtime.op_state();
            let mut state = op_state.borrow_mut();
            state.put(ConsoleOutput::default());
            state.put(HostRegistry::default());
            state.put(bindings);
        }

        let proxies = lockdown(&mut runtime, &names)?;
        tracing::debug!(sandbox = %sandbox, bindings = ?names, "sandbox locked down");

        Ok(Self {
            runtime,
            sandbox,
            proxies,
            references: ReferenceTable::default(),
            heap,
            poisoned: false,
        })
    }

    pub(crate) fn isolate_handle(&mut self) -> v8::IsolateHandle {
        self.runtime.v8_isolate().thread_safe_handle()
    }

    /// The isolate was interrupted and must not run anything else.
    pub(crate) fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub(crate) async fn invoke(
        &mut self,
        target: Target,
        args: Vec<HostValue>,
        options: &InvocationOptions,
        dispose: &mut watch::Receiver<bool>,
    ) -> Result<HostValue> {
        if self.poisoned || *dispose.borrow() {
            return Err(SandboxError::disposed());
        }

        let timeout = options.timeout();
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let watchdog = Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), timeout);

        let outcome = match self.call(&target, &args, options) {
            Step::Done(outcome) => outcome,
            Step::Pending(promise) => self.settle(promise, options, deadline, dispose).await,
        };

        let fired = watchdog.disarm();
        self.runtime
            .op_state()
            .borrow_mut()
            .borrow_mut::<HostRegistry>()
            .clear();

        self.conclude(outcome, fired, deadline, dispose)
    }

    /// Deep-copy a referenced sandbox value to the host. Getters on the value
    /// run as sandbox code, so the copy is preempted like an invocation.
    pub(crate) fn copy_reference(
        &mut self,
        reference: &SandboxReference,
        timeout: Option<Duration>,
        dispose: &watch::Receiver<bool>,
    ) -> Result<Value> {
        if self.poisoned || *dispose.borrow() {
            return Err(SandboxError::disposed());
        }

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let watchdog = Watchdog::arm(self.runtime.v8_isolate().thread_safe_handle(), timeout);

        let outcome = {
            let scope = &mut self.runtime.handle_scope();
            match self
                .references
                .get(scope, self.sandbox, reference)
                .and_then(|value| copy_out(scope, value))
            {
                Ok(value) => Outcome::Value(HostValue::Data(value)),
                Err(err) => Outcome::Failed(err),
            }
        };

        let fired = watchdog.disarm();
        self.conclude(outcome, fired, deadline, dispose)
            .map(|value| value.into_data().unwrap_or_default())
    }

    /// Classify an outcome against whatever interrupted it. Any interruption
    /// poisons the isolate.
    fn conclude(
        &mut self,
        outcome: Outcome,
        fired: bool,
        deadline: Option<Instant>,
        dispose: &watch::Receiver<bool>,
    ) -> Result<HostValue> {
        let interrupted = matches!(outcome, Outcome::Interrupted);
        let interruptions = Interruptions {
            memory: self.heap.exceeded(),
            timed_out: fired
                || (interrupted && deadline.is_some_and(|deadline| Instant::now() >= deadline)),
            disposed: *dispose.borrow(),
        };

        match outcome {
            Outcome::Value(value) if !interruptions.memory && !interruptions.disposed => {
                if fired {
                    // Finished just as the deadline hit; the value stands.
                    self.runtime.v8_isolate().cancel_terminate_execution();
                }
                Ok(value)
            }
            outcome => match interruptions.classify() {
                Some(err) => {
                    self.poisoned = true;
                    tracing::warn!(
                        sandbox = %self.sandbox,
                        kind = ?err.kind(),
                        "invocation interrupted"
                    );
                    Err(err)
                }
                None => match outcome {
                    Outcome::Failed(err) => Err(err),
                    Outcome::Value(value) => Ok(value),
                    Outcome::Interrupted => {
                        self.poisoned = true;
                        Err(SandboxError::host_bridge("execution was terminated"))
                    }
                },
            },
        }
    }

    /// Drop a reference so the sandbox value can be collected.
    pub(crate) fn release_reference(&mut self, reference: &SandboxReference) -> Result<()> {
        if reference.sandbox != self.sandbox {
            return Err(SandboxError::host_bridge(
                "reference belongs to a different sandbox",
            ));
        }
        if !self.references.remove(reference) {
            return Err(SandboxError::host_bridge("reference has been released"));
        }
        Ok(())
    }

    /// Drain console output captured since the last call.
    pub(crate) fn take_console(&mut self) -> ConsoleOutput {
        std::mem::take(self.runtime.op_state().borrow_mut().borrow_mut::<ConsoleOutput>())
    }

    fn call(&mut self, target: &Target, args: &[HostValue], options: &InvocationOptions) -> Step {
        let Self {
            runtime,
            sandbox,
            proxies,
            references,
            ..
        } = self;
        let op_state = runtime.op_state();
        let scope = &mut runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);

        let resolved = match target {
            Target::Path { path, function } => resolve_path(tc, path, function),
            Target::Reference(reference) => references
                .get(tc, *sandbox, reference)
                .and_then(|value| {
                    let receiver = v8::undefined(tc).into();
                    v8::Local::<v8::Function>::try_from(value)
                        .map(|function| (receiver, function))
                        .map_err(|_| not_a_function("reference"))
                }),
        };
        if tc.has_terminated() {
            return Step::Done(Outcome::Interrupted);
        }
        let (receiver, function) = match resolved {
            Ok(resolved) => resolved,
            Err(err) => return Step::Done(Outcome::Failed(err)),
        };

        let mut marshaller = Marshaller {
            sandbox: *sandbox,
            proxies,
            op_state,
            references,
        };

        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            match marshaller.to_sandbox(tc, arg, options.argument_transfer) {
                Ok(value) => argv.push(value),
                Err(err) => return Step::Done(Outcome::Failed(err)),
            }
        }

        let result = function.call(tc, receiver, &argv);

        if tc.has_terminated() {
            return Step::Done(Outcome::Interrupted);
        }
        let Some(value) = result else {
            return Step::Done(match tc.exception() {
                Some(exception) => Outcome::Failed(script_error(
                    tc,
                    &mut marshaller,
                    exception,
                    options.result_transfer,
                )),
                None => Outcome::Interrupted,
            });
        };

        if options.result_is_async {
            if let Ok(promise) = v8::Local::<v8::Promise>::try_from(value) {
                // A handler keeps the rejection from surfacing as an
                // uncaught error on the event loop.
                let handled = v8::Function::new(
                    tc,
                    |_: &mut v8::HandleScope, _: v8::FunctionCallbackArguments, _: v8::ReturnValue| {},
                );
                if let Some(handled) = handled {
                    promise.catch(tc, handled);
                }
                return Step::Pending(v8::Global::new(tc, promise));
            }
        }

        Step::Done(
            match marshaller.from_sandbox(tc, value, options.result_transfer) {
                Ok(value) => Outcome::Value(value),
                Err(err) => Outcome::Failed(err),
            },
        )
    }

    async fn settle(
        &mut self,
        promise: v8::Global<v8::Promise>,
        options: &InvocationOptions,
        deadline: Option<Instant>,
        dispose: &mut watch::Receiver<bool>,
    ) -> Outcome {
        let wait = tokio::select! {
            biased;
            _ = dispose.wait_for(|disposed| *disposed) => Wait::Disposed,
            _ = expire(deadline) => Wait::Deadline,
            wait = self.drive(&promise) => wait,
        };

        let wait = match wait {
            // Nothing left that could settle the promise: with a deadline
            // this is indistinguishable from a call that never returns.
            Wait::Stalled if deadline.is_some() => tokio::select! {
                biased;
                _ = dispose.wait_for(|disposed| *disposed) => Wait::Disposed,
                _ = expire(deadline) => Wait::Deadline,
            },
            wait => wait,
        };

        match wait {
            Wait::Settled => self.finish(&promise, options.result_transfer),
            Wait::Stalled => Outcome::Failed(SandboxError::script(None, "Promise never settled")),
            Wait::EventLoop(message) => Outcome::Failed(SandboxError::script(None, message)),
            Wait::Deadline | Wait::Disposed => Outcome::Interrupted,
        }
    }

    /// Poll the event loop until `promise` leaves the pending state or no
    /// work is left.
    async fn drive(&mut self, promise: &v8::Global<v8::Promise>) -> Wait {
        poll_fn(|cx| {
            let polled = self
                .runtime
                .poll_event_loop(cx, PollEventLoopOptions::default());

            let pending = {
                let scope = &mut self.runtime.handle_scope();
                matches!(
                    v8::Local::new(scope, promise).state(),
                    v8::PromiseState::Pending
                )
            };
            if !pending {
                return Poll::Ready(Wait::Settled);
            }

            match polled {
                Poll::Ready(Ok(())) => Poll::Ready(Wait::Stalled),
                Poll::Ready(Err(err)) => Poll::Ready(Wait::EventLoop(err.to_string())),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    fn finish(&mut self, promise: &v8::Global<v8::Promise>, mode: TransferMode) -> Outcome {
        let Self {
            runtime,
            sandbox,
            proxies,
            references,
            ..
        } = self;
        let op_state = runtime.op_state();
        let scope = &mut runtime.handle_scope();
        let tc = &mut v8::TryCatch::new(scope);
        let promise = v8::Local::new(tc, promise);

        let mut marshaller = Marshaller {
            sandbox: *sandbox,
            proxies,
            op_state,
            references,
        };

        match promise.state() {
            v8::PromiseState::Fulfilled => {
                let value = promise.result(tc);
                match marshaller.from_sandbox(tc, value, mode) {
                    Ok(value) => Outcome::Value(value),
                    Err(_) if tc.has_terminated() => Outcome::Interrupted,
                    Err(err) => Outcome::Failed(err),
                }
            }
            v8::PromiseState::Rejected => {
                let reason = promise.result(tc);
                Outcome::Failed(script_error(tc, &mut marshaller, reason, mode))
            }
            v8::PromiseState::Pending => {
                Outcome::Failed(SandboxError::script(None, "Promise never settled"))
            }
        }
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Bind the bridge globals and strip the runtime internals from the global
/// scope. Returns the proxy factories captured beforehand.
fn lockdown(runtime: &mut JsRuntime, bridge_names: &[String]) -> Result<ProxyFactory> {
    let scope = &mut runtime.handle_scope();
    let tc = &mut v8::TryCatch::new(scope);
    let context = tc.get_current_context();
    let global = context.global(tc);

    let internals = get_property(tc, global, INTERNALS)
        .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
        .ok_or_else(|| SandboxError::bootstrap("sandbox runtime internals are missing"))?;
    let host_function = get_function(tc, internals, "hostFunction")?;
    let host_data = get_function(tc, internals, "hostData")?;
    let lockdown = get_function(tc, internals, "lockdown")?;

    let mut names: Vec<v8::Local<v8::Value>> = Vec::with_capacity(bridge_names.len());
    for name in bridge_names {
        let name = v8::String::new(tc, name)
            .ok_or_else(|| SandboxError::bootstrap("failed to allocate bridge name"))?;
        names.push(name.into());
    }
    let names = v8::Array::new_with_elements(tc, &names);

    let recv = v8::undefined(tc).into();
    if lockdown.call(tc, recv, &[names.into()]).is_none() {
        let message = tc
            .exception()
            .map(|exception| exception.to_rust_string_lossy(tc))
            .unwrap_or_else(|| "lockdown was interrupted".to_string());
        return Err(SandboxError::bootstrap(message));
    }

    Ok(ProxyFactory {
        host_function: v8::Global::new(tc, host_function),
        host_data: v8::Global::new(tc, host_data),
    })
}

fn resolve_path<'s>(
    scope: &mut v8::HandleScope<'s>,
    path: &str,
    function: &str,
) -> Result<(v8::Local<'s, v8::Value>, v8::Local<'s, v8::Function>)> {
    let qualified = if path.is_empty() {
        function.to_string()
    } else {
        format!("{}.{}", path, function)
    };

    let context = scope.get_current_context();
    let mut container = context.global(scope);
    for segment in path.split('.').filter(|segment| !segment.is_empty()) {
        container = get_property(scope, container, segment)
            .and_then(|value| v8::Local::<v8::Object>::try_from(value).ok())
            .ok_or_else(|| not_a_function(&qualified))?;
    }

    let target = get_property(scope, container, function)
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| not_a_function(&qualified))?;

    Ok((container.into(), target))
}

fn not_a_function(what: &str) -> SandboxError {
    SandboxError::script(Some("TypeError".into()), format!("{} is not a function", what))
}

fn get_property<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    key: &str,
) -> Option<v8::Local<'s, v8::Value>> {
    let key = v8::String::new(scope, key)?;
    object.get(scope, key.into())
}

fn get_function<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
    key: &str,
) -> Result<v8::Local<'s, v8::Function>> {
    get_property(scope, object, key)
        .and_then(|value| v8::Local::<v8::Function>::try_from(value).ok())
        .ok_or_else(|| SandboxError::bootstrap(format!("sandbox runtime is missing '{}'", key)))
}

/// Build a script error from a thrown value or rejection reason, keeping
/// its own enumerable properties as the payload.
fn script_error<'s>(
    scope: &mut v8::HandleScope<'s>,
    marshaller: &mut Marshaller<'_>,
    exception: v8::Local<'s, v8::Value>,
    mode: TransferMode,
) -> SandboxError {
    let Ok(object) = v8::Local::<v8::Object>::try_from(exception) else {
        return SandboxError::script(None, exception.to_rust_string_lossy(scope));
    };

    let (name, message) = describe_thrown(scope, exception);

    let payload = error_properties(scope, object)
        .and_then(|properties| marshaller.from_sandbox(scope, properties, mode).ok());

    SandboxError::Script {
        name,
        message,
        payload,
    }
}

fn error_properties<'s>(
    scope: &mut v8::HandleScope<'s>,
    object: v8::Local<'s, v8::Object>,
) -> Option<v8::Local<'s, v8::Value>> {
    let keys = object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())?;
    if keys.length() == 0 {
        return None;
    }

    let properties = v8::Object::new(scope);
    for index in 0..keys.length() {
        let key = keys.get_index(scope, index)?;
        let value = object.get(scope, key)?;
        properties.set(scope, key, value)?;
    }
    Some(properties.into())
}
