//! Sandbox factory and the handle to a running sandbox.
//!
//! V8 isolates are `!Send`, so every sandbox lives on a dedicated OS thread
//! with its own single-threaded tokio runtime. The [`Sandbox`] handle is
//! `Send + Sync` and talks to that thread through a command queue; commands
//! run one at a time and each reply is delivered exactly once.

use crate::bridge::BridgeBindings;
use crate::config::{InvocationOptions, ResourceLimits};
use crate::error::{Result, SandboxError};
use crate::invoke::{Invoker, Target};
use crate::marshal::{HostValue, SandboxReference};
use crate::ops::{validator_runtime, ConsoleOutput};
use crate::preempt::HeapGuard;
use crate::snapshot::{Snapshot, BOOTSTRAP_SPECIFIER};
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

/// Create a sandbox from a snapshot. Cheap compared to building the
/// snapshot: the bundle is deserialized, not re-run.
pub async fn create_sandbox(
    snapshot: &Snapshot,
    limits: ResourceLimits,
    bindings: BridgeBindings,
) -> Result<Sandbox> {
    Sandbox::spawn(Source::Snapshot(snapshot.clone()), limits, bindings).await
}

/// Create a sandbox by running the bundle in a fresh isolate.
pub async fn create_sandbox_cold(
    bootstrap_source: impl Into<String>,
    limits: ResourceLimits,
    bindings: BridgeBindings,
) -> Result<Sandbox> {
    Sandbox::spawn(Source::Cold(bootstrap_source.into()), limits, bindings).await
}

enum Source {
    Snapshot(Snapshot),
    Cold(String),
}

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Invoke {
        target: Target,
        args: Vec<HostValue>,
        options: InvocationOptions,
        reply: Reply<HostValue>,
    },
    CopyReference {
        reference: SandboxReference,
        timeout: Option<Duration>,
        reply: Reply<Value>,
    },
    ReleaseReference {
        reference: SandboxReference,
        reply: Reply<()>,
    },
    TakeConsole {
        reply: Reply<ConsoleOutput>,
    },
}

impl Command {
    /// Answer a command that will never run. A dropped receiver just means
    /// nobody is waiting any more.
    fn reject(self) {
        let err = SandboxError::disposed;
        match self {
            Command::Invoke { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Command::CopyReference { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Command::ReleaseReference { reply, .. } => {
                let _ = reply.send(Err(err()));
            }
            Command::TakeConsole { reply } => {
                let _ = reply.send(Err(err()));
            }
        }
    }
}

/// Handle to one isolated execution context.
///
/// Dropping the handle disposes the sandbox.
pub struct Sandbox {
    id: Uuid,
    commands: mpsc::UnboundedSender<Command>,
    dispose: watch::Sender<bool>,
    disposed: Arc<AtomicBool>,
    isolate: v8::IsolateHandle,
}

impl Sandbox {
    async fn spawn(source: Source, limits: ResourceLimits, bindings: BridgeBindings) -> Result<Self> {
        bindings.validate()?;
        if limits.memory_limit_mebibytes == 0 {
            return Err(SandboxError::bootstrap("memory limit must be at least 1 MiB"));
        }

        let id = Uuid::new_v4();
        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (dispose_tx, dispose_rx) = watch::channel(false);
        let disposed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            id,
            commands: command_rx,
            dispose: dispose_rx,
            disposed: disposed.clone(),
        };

        std::thread::Builder::new()
            .name(format!("sandbox-{}", id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        if ready_tx.send(Err(SandboxError::bootstrap(e))).is_err() {
                            tracing::warn!("sandbox creator dropped");
                        }
                        return;
                    }
                };
                rt.block_on(worker.run(source, limits, bindings, ready_tx));
            })
            .map_err(SandboxError::bootstrap)?;

        let isolate = ready_rx
            .await
            .map_err(|_| SandboxError::bootstrap("sandbox thread exited during startup"))??;

        Ok(Self {
            id,
            commands: command_tx,
            dispose: dispose_tx,
            disposed,
            isolate,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || *self.dispose.borrow()
    }

    /// Call `path.function(...args)` inside the sandbox. An empty path
    /// addresses a global function.
    pub async fn invoke(
        &self,
        path: &str,
        function: &str,
        args: Vec<HostValue>,
        options: InvocationOptions,
    ) -> Result<HostValue> {
        let target = Target::Path {
            path: path.to_string(),
            function: function.to_string(),
        };
        self.request(|reply| Command::Invoke {
            target,
            args,
            options,
            reply,
        })
        .await
    }

    /// Call a sandbox function the host holds a reference to. Runs under
    /// the same preemption as [`Sandbox::invoke`].
    pub async fn invoke_reference(
        &self,
        reference: &SandboxReference,
        args: Vec<HostValue>,
        options: InvocationOptions,
    ) -> Result<HostValue> {
        self.check_owner(reference)?;
        let target = Target::Reference(*reference);
        self.request(|reply| Command::Invoke {
            target,
            args,
            options,
            reply,
        })
        .await
    }

    /// Deep-copy a referenced value out of the sandbox.
    ///
    /// Getters on the value run sandbox code, so the copy is bounded by
    /// `timeout_millis` like an invocation (`0` means no deadline). A copy
    /// that times out disposes the sandbox.
    pub async fn copy_reference(
        &self,
        reference: &SandboxReference,
        timeout_millis: u64,
    ) -> Result<Value> {
        self.check_owner(reference)?;
        let reference = *reference;
        let timeout = (timeout_millis > 0).then(|| Duration::from_millis(timeout_millis));
        self.request(|reply| Command::CopyReference {
            reference,
            timeout,
            reply,
        })
        .await
    }

    /// Release a reference. Further use of it fails.
    pub async fn release_reference(&self, reference: &SandboxReference) -> Result<()> {
        self.check_owner(reference)?;
        let reference = *reference;
        self.request(|reply| Command::ReleaseReference { reference, reply })
            .await
    }

    /// Console output captured since the last call.
    pub async fn take_console(&self) -> Result<ConsoleOutput> {
        self.request(|reply| Command::TakeConsole { reply }).await
    }

    /// Tear the sandbox down. Idempotent. An invocation in flight is
    /// interrupted and fails.
    pub fn dispose(&self) {
        if self.dispose.send_replace(true) {
            return;
        }
        self.disposed.store(true, Ordering::SeqCst);
        self.isolate.terminate_execution();
        tracing::debug!(sandbox = %self.id, "sandbox disposal requested");
    }

    fn check_owner(&self, reference: &SandboxReference) -> Result<()> {
        if reference.sandbox_id() != self.id {
            return Err(SandboxError::host_bridge(
                "reference belongs to a different sandbox",
            ));
        }
        Ok(())
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        if self.is_disposed() {
            return Err(SandboxError::disposed());
        }
        let (reply, result) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| SandboxError::disposed())?;
        result.await.map_err(|_| SandboxError::disposed())?
    }
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Marks the sandbox disposed when the worker exits, however it exits.
struct DisposedOnExit(Arc<AtomicBool>);

impl Drop for DisposedOnExit {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// State owned by the sandbox thread.
struct Worker {
    id: Uuid,
    commands: mpsc::UnboundedReceiver<Command>,
    dispose: watch::Receiver<bool>,
    disposed: Arc<AtomicBool>,
}

impl Worker {
    async fn run(
        mut self,
        source: Source,
        limits: ResourceLimits,
        bindings: BridgeBindings,
        ready: oneshot::Sender<Result<v8::IsolateHandle>>,
    ) {
        let _exit = DisposedOnExit(self.disposed.clone());

        let mut invoker = match start(self.id, source, &limits, bindings) {
            Ok(invoker) => invoker,
            Err(e) => {
                tracing::warn!(sandbox = %self.id, error = %e, "sandbox failed to start");
                if ready.send(Err(e)).is_err() {
                    tracing::warn!("sandbox creator dropped");
                }
                return;
            }
        };

        if ready.send(Ok(invoker.isolate_handle())).is_err() {
            tracing::debug!(sandbox = %self.id, "sandbox creator dropped before ready");
            return;
        }
        tracing::debug!(
            sandbox = %self.id,
            memory_limit_mib = limits.memory_limit_mebibytes,
            "sandbox ready"
        );

        loop {
            let command = tokio::select! {
                biased;
                _ = self.dispose.wait_for(|disposed| *disposed) => break,
                command = self.commands.recv() => match command {
                    Some(command) => command,
                    None => break,
                },
            };

            match command {
                Command::Invoke {
                    target,
                    args,
                    options,
                    reply,
                } => {
                    let result = invoker
                        .invoke(target, args, &options, &mut self.dispose)
                        .await;
                    if invoker.is_poisoned() {
                        self.disposed.store(true, Ordering::SeqCst);
                    }
                    if reply.send(result).is_err() {
                        tracing::debug!(sandbox = %self.id, "invocation result dropped");
                    }
                }
                Command::CopyReference {
                    reference,
                    timeout,
                    reply,
                } => {
                    let result = invoker.copy_reference(&reference, timeout, &self.dispose);
                    if invoker.is_poisoned() {
                        self.disposed.store(true, Ordering::SeqCst);
                    }
                    if reply.send(result).is_err() {
                        tracing::debug!(sandbox = %self.id, "copy result dropped");
                    }
                }
                Command::ReleaseReference { reference, reply } => {
                    let _ = reply.send(invoker.release_reference(&reference));
                }
                Command::TakeConsole { reply } => {
                    let _ = reply.send(Ok(invoker.take_console()));
                }
            }

            if invoker.is_poisoned() {
                break;
            }
        }

        self.disposed.store(true, Ordering::SeqCst);
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject();
        }
        tracing::debug!(sandbox = %self.id, "sandbox disposed");
    }
}

/// Create the isolate, load the bundle and hand it to an [`Invoker`].
fn start(
    id: Uuid,
    source: Source,
    limits: &ResourceLimits,
    bindings: BridgeBindings,
) -> Result<Invoker> {
    let create_params =
        v8::CreateParams::default().heap_limits(0, limits.memory_limit_bytes());

    let (startup_snapshot, extension, bundle) = match source {
        Source::Snapshot(snapshot) => {
            (Some(snapshot.payload()), validator_runtime::init_ops(), None)
        }
        Source::Cold(bundle) => (None, validator_runtime::init_ops_and_esm(), Some(bundle)),
    };

    let mut runtime = JsRuntime::new(RuntimeOptions {
        startup_snapshot,
        extensions: vec![extension],
        create_params: Some(create_params),
        ..Default::default()
    });
    let heap = HeapGuard::install(&mut runtime);

    if let Some(bundle) = bundle {
        if let Err(e) = runtime.execute_script(BOOTSTRAP_SPECIFIER, bundle) {
            if heap.exceeded() {
                return Err(SandboxError::bootstrap(
                    "bundle exceeded the memory limit during bootstrap",
                ));
            }
            return Err(SandboxError::bootstrap(e));
        }
    }

    Invoker::new(runtime, id, heap, bindings)
}
