//! A single-threaded event-loop engine: tasks, timers, I/O readiness, and
//! promise scheduling for an embedding host.
//!
//! The loop itself is driven by one thread calling [`Loop::run`]; every
//! other entry point (`submit`, `schedule_timer`, `register_fd`, the
//! promise API, `shutdown`) is safe to call from any thread, including
//! re-entrantly from inside a running task.

pub mod error;
pub mod loop_core;
pub mod poller;
pub mod promise;
pub mod queue;
pub mod state;
pub mod task;
pub mod timer;
pub mod wake;

pub use error::{LoopError, PanicError, TaskFault};
pub use loop_core::{Ctx, Loop, LoopBuilder, LoopConfig, ShutdownMode};
pub use poller::{IoCallback, IoPoller, Readiness};
pub use promise::{Promise, PromiseId, PromiseRegistry, UnhandledRejection, Value as PromiseValue};
pub use queue::{IngressQueue, Lane};
pub use state::LoopState;
pub use task::{Task, TaskContext, TaskId};
pub use timer::{TimerHeap, TimerId};
pub use wake::WakeHandle;
