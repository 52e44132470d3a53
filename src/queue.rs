//! The ingress queue (spec §4.1): a 3-lane, coarse-mutex-guarded FIFO pool
//! that every external thread, internal subsystem, and microtask producer
//! pushes into.
//!
//! Lanes, in priority order when draining "any":
//!
//! 1. `Microtask` — promise reactions, `queueMicrotask`-equivalent work.
//!    Always fully drained before the loop looks at the other two lanes.
//! 2. `Internal` — timer fires, I/O readiness callbacks: work the loop
//!    itself generated mid-tick.
//! 3. `External` — work submitted by threads outside the loop (the
//!    embedder's own worker threads, FFI callers).
//!
//! This is the coarse-mutex family of the two valid concurrency designs
//! spec.md leaves open (see `SPEC_FULL.md` §5.1): a single `Mutex` behind all
//! three lanes, matching the teacher's `ProcessInner` interior-mutability
//! idiom. This also gives the check-then-sleep protocol (spec §4.7) the
//! single lock it needs to make "push" and "observe queue state" mutually
//! exclusive.

use crate::error::LoopError;
use crate::task::Task;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Which of the three ingress lanes a task belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    Microtask,
    Internal,
    External,
}

struct Lanes {
    microtask: VecDeque<Task>,
    internal: VecDeque<Task>,
    external: VecDeque<Task>,
}

impl Lanes {
    fn new() -> Self {
        Self {
            microtask: VecDeque::new(),
            internal: VecDeque::new(),
            external: VecDeque::new(),
        }
    }

    fn queue_for(&mut self, lane: Lane) -> &mut VecDeque<Task> {
        match lane {
            Lane::Microtask => &mut self.microtask,
            Lane::Internal => &mut self.internal,
            Lane::External => &mut self.external,
        }
    }

    fn queue_for_ref(&self, lane: Lane) -> &VecDeque<Task> {
        match lane {
            Lane::Microtask => &self.microtask,
            Lane::Internal => &self.internal,
            Lane::External => &self.external,
        }
    }

    fn total_len(&self) -> usize {
        self.microtask.len() + self.internal.len() + self.external.len()
    }
}

/// The shared ingress queue. Cheap to construct, intended to live behind an
/// `Arc` shared between the loop thread and any external producer threads.
pub struct IngressQueue {
    lanes: Mutex<Lanes>,
    closed: AtomicBool,
}

impl IngressQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(Lanes::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Push a task onto `lane`. Fails with [`LoopError::LoopTerminated`] once
    /// [`close`](Self::close) has been called — no push can slip past a
    /// hold-then-close shutdown (spec.md §9 Open Question resolution).
    pub fn push(&self, task: Task, lane: Lane) -> Result<(), LoopError> {
        let mut guard = self.lanes.lock().expect("ingress queue mutex poisoned");
        if self.closed.load(Ordering::Acquire) {
            return Err(LoopError::LoopTerminated);
        }
        guard.queue_for(lane).push_back(task);
        Ok(())
    }

    /// Pop the next task in priority order: all of `Microtask`, then all of
    /// `Internal`, then all of `External`.
    pub fn pop_any(&self) -> Option<Task> {
        let mut guard = self.lanes.lock().expect("ingress queue mutex poisoned");
        guard
            .microtask
            .pop_front()
            .or_else(|| guard.internal.pop_front())
            .or_else(|| guard.external.pop_front())
    }

    /// Pop the next task from a specific lane only.
    pub fn pop_lane(&self, lane: Lane) -> Option<Task> {
        let mut guard = self.lanes.lock().expect("ingress queue mutex poisoned");
        guard.queue_for(lane).pop_front()
    }

    /// Number of tasks across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.lock().expect("ingress queue mutex poisoned").total_len()
    }

    /// Number of tasks in a single lane.
    pub fn len_lane(&self, lane: Lane) -> usize {
        self.lanes
            .lock()
            .expect("ingress queue mutex poisoned")
            .queue_for_ref(lane)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the microtask lane specifically has pending work — used by
    /// the tick cycle's strict-microtask toggle (spec §4.6).
    pub fn has_microtasks(&self) -> bool {
        self.len_lane(Lane::Microtask) > 0
    }

    /// Close the queue to further pushes. Returns the lock guard's view is
    /// not exposed; callers that need a hold-then-close drain should use
    /// [`drain_and_close`](Self::drain_and_close) instead, which performs
    /// the close and the final external-lane drain atomically under one
    /// lock acquisition.
    pub fn close(&self) {
        let _guard = self.lanes.lock().expect("ingress queue mutex poisoned");
        self.closed.store(true, Ordering::Release);
    }

    /// Atomically mark the queue closed and drain every remaining task from
    /// every lane in priority order, in one critical section. This is the
    /// "hold" half of hold-then-close (spec.md §9): no producer can observe
    /// the queue as open and push after this returns, and no task is lost —
    /// whatever was pending is returned for a final processing pass.
    pub fn drain_and_close(&self) -> Vec<Task> {
        let mut guard = self.lanes.lock().expect("ingress queue mutex poisoned");
        self.closed.store(true, Ordering::Release);
        let mut drained = Vec::with_capacity(guard.total_len());
        drained.extend(guard.microtask.drain(..));
        drained.extend(guard.internal.drain(..));
        drained.extend(guard.external.drain(..));
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Default for IngressQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IngressQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressQueue")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
