//! Preemption: deadline and heap-ceiling enforcement.
//!
//! V8 only stops a running call stack when `terminate_execution` is issued
//! from outside the isolate's thread, so the deadline is owned by a
//! dedicated watchdog thread rather than a task on the sandbox's own
//! runtime (which a busy loop would starve).

use crate::error::SandboxError;
use deno_core::{v8, JsRuntime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Out-of-band interrupt for a running isolate.
pub(crate) trait Interrupt: Send + 'static {
    fn interrupt(&self);
}

impl Interrupt for v8::IsolateHandle {
    fn interrupt(&self) {
        self.terminate_execution();
    }
}

/// Deadline timer for one invocation.
pub(crate) struct Watchdog {
    cancel: Option<mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    fired: Arc<AtomicBool>,
}

impl Watchdog {
    /// Start the timer. With no timeout nothing is spawned and the watchdog
    /// never fires.
    pub(crate) fn arm<I: Interrupt>(interrupt: I, timeout: Option<Duration>) -> Self {
        let fired = Arc::new(AtomicBool::new(false));
        let Some(timeout) = timeout else {
            return Self {
                cancel: None,
                thread: None,
                fired,
            };
        };

        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let watchdog_fired = fired.clone();
        let thread = std::thread::Builder::new()
            .name("sandbox-watchdog".into())
            .spawn(move || {
                if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(timeout) {
                    watchdog_fired.store(true, Ordering::SeqCst);
                    interrupt.interrupt();
                }
            });

        match thread {
            Ok(thread) => Self {
                cancel: Some(cancel_tx),
                thread: Some(thread),
                fired,
            },
            Err(e) => {
                // Without a watchdog a busy loop could never be stopped.
                tracing::error!(error = %e, "failed to spawn watchdog thread");
                fired.store(true, Ordering::SeqCst);
                Self {
                    cancel: None,
                    thread: None,
                    fired,
                }
            }
        }
    }

    pub(crate) fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Stop the timer and report whether it fired. Joins the thread, so no
    /// interrupt can be issued after this returns.
    pub(crate) fn disarm(mut self) -> bool {
        self.stop();
        self.fired()
    }

    fn stop(&mut self) {
        drop(self.cancel.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!("watchdog thread panicked");
            }
        }
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Records that the isolate reached its heap ceiling.
#[derive(Clone, Default)]
pub(crate) struct HeapGuard {
    exceeded: Arc<AtomicBool>,
}

impl HeapGuard {
    /// Register the near-heap-limit callback on `runtime`. The callback
    /// terminates execution once and doubles the limit so the termination
    /// can unwind instead of V8 aborting the whole process.
    pub(crate) fn install(runtime: &mut JsRuntime) -> Self {
        let guard = Self::default();
        let exceeded = guard.exceeded.clone();
        let handle = runtime.v8_isolate().thread_safe_handle();

        runtime.add_near_heap_limit_callback(move |current, initial| {
            if !exceeded.swap(true, Ordering::SeqCst) {
                tracing::warn!(
                    current_mib = current / (1024 * 1024),
                    initial_mib = initial / (1024 * 1024),
                    "sandbox reached its heap limit, terminating"
                );
                handle.interrupt();
            }
            current * 2
        });

        guard
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.exceeded.load(Ordering::SeqCst)
    }
}

/// Interrupt sources observed for one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Interruptions {
    pub(crate) memory: bool,
    pub(crate) timed_out: bool,
    pub(crate) disposed: bool,
}

impl Interruptions {
    pub(crate) fn any(&self) -> bool {
        self.memory || self.timed_out || self.disposed
    }

    /// Map the observed interrupts to a failure. The memory ceiling wins
    /// over the deadline: both look like a call that never returned, and the
    /// heap callback is only ever the proximate cause.
    pub(crate) fn classify(&self) -> Option<SandboxError> {
        if self.memory {
            Some(SandboxError::MemoryLimitExceeded)
        } else if self.timed_out {
            Some(SandboxError::Timeout)
        } else if self.disposed {
            Some(SandboxError::host_bridge(
                "sandbox was disposed during execution",
            ))
        } else {
            None
        }
    }
}
