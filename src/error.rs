//! Error taxonomy (spec §6) and the panic-vs-result boundary (spec §7) that
//! keeps a faulting task from ever unwinding into the loop thread itself.
//!
//! # Policy
//!
//! - **Panics** from user-supplied task/timer/FD/reaction callbacks are
//!   caught at the boundary and reported through
//!   [`Loop::on_panic`](crate::loop_core::Loop::on_panic) as a [`TaskFault`];
//!   they never terminate the loop (spec §7.2).
//! - **[`LoopError`]** values are returned directly to callers of the
//!   embedder API for recoverable operation failures (spec §7.1); they never
//!   affect loop liveness.
//! - **Fatal invariant violations** (an invalid state transition in
//!   strict/safety builds, a non-retriable poller error) are reported as
//!   [`LoopError::InvalidStateTransition`] / [`LoopError::Fatal`] and drive
//!   the loop into `Terminating` (spec §7.3).

use crate::task::TaskId;
use std::any::Any;
use std::fmt;

// ---------------------------------------------------------------------------
// PanicError / catch_panic
// ---------------------------------------------------------------------------

/// A caught panic, converted to a value.
///
/// The original panic payload is inspected and, where possible, its message
/// is extracted as a `String`.
#[derive(Debug, Clone)]
pub struct PanicError {
    message: String,
}

impl PanicError {
    /// Build a `PanicError` from a raw panic payload (`Box<dyn Any + Send>`).
    pub fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let message = extract_panic_message(&payload);
        Self { message }
    }

    /// Build a `PanicError` with an explicit message (used for caught
    /// thrown/rejected values that aren't native Rust panics, e.g. when an
    /// embedder's scripting runtime reports a JS-level throw).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The extracted panic message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PanicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "panic: {}", self.message)
    }
}

impl std::error::Error for PanicError {}

fn extract_panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Catch a panic unwinding out of `f` and convert it into `Result`.
///
/// Every task, timer callback, FD callback, and promise reaction invocation
/// goes through this boundary (spec §7.2: "the loop wraps every task
/// invocation in a fault barrier").
pub fn catch_panic<T>(f: impl FnOnce() -> T + std::panic::UnwindSafe) -> Result<T, PanicError> {
    match std::panic::catch_unwind(f) {
        Ok(value) => Ok(value),
        Err(payload) => Err(PanicError::from_payload(payload)),
    }
}

/// A fault captured from one task invocation: which task faulted and why.
///
/// Delivered to the embedder's `on_panic` hook (spec §6); the loop continues
/// after delivery (spec §7.2: "Faults never terminate the loop").
#[derive(Debug, Clone)]
pub struct TaskFault {
    pub task_id: TaskId,
    pub reason: PanicError,
}

impl fmt::Display for TaskFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {} faulted: {}", self.task_id, self.reason)
    }
}

impl std::error::Error for TaskFault {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.reason)
    }
}

// ---------------------------------------------------------------------------
// LoopError — the §6 taxonomy
// ---------------------------------------------------------------------------

/// Every fallible operation exposed by [`crate::loop_core::Loop`] returns
/// this error type. Variants mirror spec §6's taxonomy exactly.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LoopError {
    /// `run()` called from a thread other than the loop thread while the
    /// loop is already `Running`/`Sleeping`.
    #[error("loop is already running")]
    LoopAlreadyRunning,

    /// Any operation attempted after the ingress queue has been closed
    /// (`Terminating`/`Terminated`).
    #[error("loop has been terminated")]
    LoopTerminated,

    /// `shutdown`/`close` called before `run()` has ever put the loop past
    /// `Awake` — there is nothing driving for them to stop.
    #[error("loop is not running")]
    LoopNotRunning,

    /// `schedule_timer` would mint a `TimerId` past the embedder's integer
    /// domain (spec §3: must be raised *before* scheduling, leaving no
    /// orphan timer).
    #[error("timer id space exhausted")]
    TimerIdExhausted,

    /// `register_fd` called for a descriptor already present in the FD
    /// registry.
    #[error("fd {0} is already registered")]
    FdAlreadyRegistered(i32),

    /// `modify_fd`/`unregister_fd` called for a descriptor not present in
    /// the FD registry.
    #[error("fd {0} is not registered")]
    FdNotRegistered(i32),

    /// Descriptor value rejected by a bounded-domain poller backend: negative,
    /// or past the range `register_fd`'s token mapping can represent.
    #[error("fd {0} is out of the supported range")]
    FdOutOfRange(i32),

    /// A state-machine transition was attempted that spec §4.5's table does
    /// not permit. Fatal: the loop moves to `Terminating`.
    #[error("invalid loop state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: crate::state::LoopState,
        to: crate::state::LoopState,
    },

    /// The I/O poller reported a non-retriable error (anything other than
    /// `EINTR`); per spec §4.3 this is fatal, continuing would spin the CPU
    /// against an inconsistent descriptor set.
    #[error("poller is closed or failed fatally: {0}")]
    PollerClosed(String),

    /// `run()` called again from inside a task that is itself executing on
    /// the loop thread. Scheduling calls (`submit`, `schedule_timer`, ...)
    /// are explicitly re-entrant-safe and never raise this; only nesting
    /// the drive loop itself is rejected.
    #[error("reentrant call into the loop from its own thread")]
    ReentrantRunOnLoopThread,

    /// The `ctx` passed to `shutdown`/`run` was cancelled before the
    /// graceful shutdown reached its point of no return (spec §4.8 phase
    /// 8). The shutdown still runs to completion; this only reports that
    /// the cancellation preceded it.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Catch-all for an invariant violation the loop detected internally
    /// (poisoned lock, corrupted heap ordering, etc.) — always fatal.
    #[error("fatal loop error: {0}")]
    Fatal(String),
}
