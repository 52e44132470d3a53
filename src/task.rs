//! Schedulable work units.
//!
//! A [`Task`] is an opaque, one-shot callable plus a monotonic [`TaskId`].
//! The loop owns a task from the moment it is pushed onto a lane until it has
//! executed (or is dropped unexecuted during shutdown); callables are
//! treated as black boxes and always run inside a panic boundary (see
//! [`crate::error`]) so a faulting task never takes the loop thread down
//! with it.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

// ---------------------------------------------------------------------------
// TaskId
// ---------------------------------------------------------------------------

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// A unique, opaque identifier for a scheduled [`Task`].
///
/// Minted sequentially from a process-wide atomic counter; unique for the
/// lifetime of the process, not just the owning loop.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    /// Allocate the next unique task id.
    pub fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, useful for tracing/logging.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// TaskContext
// ---------------------------------------------------------------------------

/// Context handed to every running task, carrying the one piece of state the
/// core must expose so an embedder can implement HTML5-style nested-timer
/// clamping without re-parenting its own timer tree (spec §4.2): the current
/// causal nesting depth.
///
/// Nesting depth is 0 for a task that did not originate from a timer
/// callback, and `parent_depth + 1` for a timer installed from within
/// another timer's callback.
#[derive(Debug, Clone, Copy)]
pub struct TaskContext {
    task_id: TaskId,
    nesting_depth: u32,
}

impl TaskContext {
    pub(crate) fn new(task_id: TaskId, nesting_depth: u32) -> Self {
        Self {
            task_id,
            nesting_depth,
        }
    }

    /// The id of the task currently executing.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// How many timer-callback-scheduled-timer-callback hops deep this task
    /// is. A plain `submit`/`submit_internal`/`schedule_microtask` task
    /// always has depth 0; [`crate::timer`] propagates depth across a timer
    /// chain.
    pub fn nesting_depth(&self) -> u32 {
        self.nesting_depth
    }
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// A schedulable unit of work: a boxed closure plus its [`TaskId`].
///
/// `work` is `Option` so it can be `.take()`n and run exactly once even if
/// the `Task` itself outlives the call (e.g. a cancelled timer whose
/// callable has already been replaced with a no-op).
pub struct Task {
    id: TaskId,
    nesting_depth: u32,
    work: Option<Box<dyn FnOnce(&TaskContext) + Send + 'static>>,
}

impl Task {
    /// Wrap a closure as a fresh, depth-0 task.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        Self {
            id: TaskId::next(),
            nesting_depth: 0,
            work: Some(Box::new(f)),
        }
    }

    /// Wrap a closure as a task descending from an existing nesting chain
    /// (used by timer installers — see [`crate::timer`]).
    pub fn with_nesting<F>(f: F, nesting_depth: u32) -> Self
    where
        F: FnOnce(&TaskContext) + Send + 'static,
    {
        Self {
            id: TaskId::next(),
            nesting_depth,
            work: Some(Box::new(f)),
        }
    }

    /// This task's id.
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// The causal nesting depth this task will observe via [`TaskContext`].
    pub fn nesting_depth(&self) -> u32 {
        self.nesting_depth
    }

    /// Run the task's closure exactly once, consuming it.
    ///
    /// Returns `true` if work was present and invoked, `false` if the task
    /// had already been consumed. A cancelled task (work replaced with a
    /// no-op) still reports `true` on its first run.
    pub fn run(&mut self) -> bool {
        if let Some(f) = self.work.take() {
            let ctx = TaskContext::new(self.id, self.nesting_depth);
            f(&ctx);
            true
        } else {
            false
        }
    }

    /// Replace this task's work with a no-op, used by timer cancellation
    /// (spec §3: "Cancellation replaces the callable with a no-op; the heap
    /// entry is removed the next time it surfaces").
    pub fn cancel(&mut self) {
        self.work = Some(Box::new(|_ctx| {}));
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("nesting_depth", &self.nesting_depth)
            .field("has_work", &self.work.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn task_ids_are_unique_and_increasing() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert_ne!(a, b);
        assert!(a.as_u64() < b.as_u64());
    }

    #[test]
    fn task_id_display_and_debug() {
        let id = TaskId::next();
        assert!(format!("{id}").starts_with("task:"));
        assert!(format!("{id:?}").starts_with("TaskId("));
    }

    #[test]
    fn task_run_consumes_work_exactly_once() {
        let flag = Arc::new(AtomicBool::new(false));
        let flag2 = Arc::clone(&flag);
        let mut task = Task::new(move |_ctx| flag2.store(true, Ordering::Relaxed));
        assert!(task.run());
        assert!(flag.load(Ordering::Relaxed));
        assert!(!task.run());
    }

    #[test]
    fn task_context_exposes_id_and_depth() {
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let mut task = Task::with_nesting(
            move |ctx| *seen2.lock().unwrap() = Some((ctx.task_id(), ctx.nesting_depth())),
            3,
        );
        let id = task.id();
        task.run();
        let (seen_id, seen_depth) = seen.lock().unwrap().unwrap();
        assert_eq!(seen_id, id);
        assert_eq!(seen_depth, 3);
    }

    #[test]
    fn cancel_replaces_work_with_noop_but_run_still_reports_true() {
        let mut task = Task::new(|_ctx| panic!("should never run"));
        task.cancel();
        assert!(task.run());
    }

    #[test]
    fn task_debug_format() {
        let task = Task::new(|_ctx| {});
        let dbg = format!("{task:?}");
        assert!(dbg.contains("Task"));
        assert!(dbg.contains("has_work: true"));
    }
}
