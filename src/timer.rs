//! Timer heap (spec §4.2): a min-heap of deadlines, dispatched in deadline
//! order with FIFO tie-breaking, implementing the HTML5 nested-timer
//! clamping policy.
//!
//! Grounded on the teacher's atomic-counter-newtype idiom
//! (`lumen-runtime/src/process.rs`'s `ProcessId`) for [`TimerId`], and on
//! `JonasKruckenberg-k23/libs/async-exec/src/time/sleep.rs`'s deadline-entry
//! shape for the heap entry itself.

use crate::error::LoopError;
use crate::task::Task;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Depth beyond which the HTML5 clamping policy applies (spec §4.2).
const CLAMP_DEPTH_THRESHOLD: u32 = 5;
/// Minimum delay enforced once `nesting_depth > CLAMP_DEPTH_THRESHOLD`.
const CLAMPED_MIN_DELAY: Duration = Duration::from_millis(4);

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a scheduled timer, returned by
/// [`TimerHeap::schedule`] and consumed by [`TimerHeap::cancel`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Mint a fresh id without installing anything. Exposed `pub(crate)` so
    /// `loop_core.rs` can hand a caller a `TimerId` synchronously while the
    /// actual heap insertion happens later, on the loop thread, via an
    /// internal-lane installer task (spec §4.2).
    pub(crate) fn next() -> Result<Self, LoopError> {
        let v = NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed);
        if v == u64::MAX {
            return Err(LoopError::TimerIdExhausted);
        }
        Ok(Self(v))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerId({})", self.0)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer:{}", self.0)
    }
}

/// Apply the HTML5 nested-timer clamp: once a timer chain is more than
/// [`CLAMP_DEPTH_THRESHOLD`] deep, the minimum effective delay is
/// [`CLAMPED_MIN_DELAY`] regardless of the requested delay.
fn clamp_delay(requested: Duration, nesting_depth: u32) -> Duration {
    if nesting_depth > CLAMP_DEPTH_THRESHOLD && requested < CLAMPED_MIN_DELAY {
        CLAMPED_MIN_DELAY
    } else {
        requested
    }
}

/// One entry in the heap: a deadline, an insertion sequence for FIFO
/// tie-breaking, the id, and the task itself (`None` once cancelled — the
/// entry is left in the heap and skipped lazily when it surfaces, per spec
/// §4.2's "lazy heap cleanup").
struct Entry {
    deadline: Instant,
    sequence: u64,
    id: TimerId,
    task: Option<Task>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.sequence == other.sequence
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // BinaryHeap is a max-heap; reverse deadline (and sequence, for ties)
    // so the earliest-deadline, earliest-inserted entry sorts greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// The timer subsystem: a min-heap keyed by deadline, min-deadline-first
/// with FIFO tie-breaking among equal deadlines.
pub struct TimerHeap {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
    live_count: usize,
}

impl TimerHeap {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_sequence: 0,
            live_count: 0,
        }
    }

    /// Schedule `task` to run after `delay`, measured from `now`.
    /// `nesting_depth` is the causal depth this timer installs at (spec
    /// §4.2); pass 0 for a top-level `setTimeout`-equivalent call and
    /// `parent_depth + 1` when installing from inside a running timer's
    /// callback.
    pub fn schedule(
        &mut self,
        now: Instant,
        delay: Duration,
        nesting_depth: u32,
        task: Task,
    ) -> Result<TimerId, LoopError> {
        let id = TimerId::next()?;
        self.insert(id, now, delay, nesting_depth, task);
        Ok(id)
    }

    /// Insert `task` under a caller-supplied `id` (already minted via
    /// [`TimerId::next`]). Used by `loop_core.rs`'s installer task, which
    /// mints the id synchronously to hand back to the caller of
    /// `schedule_timer` but defers the actual heap insertion to the loop
    /// thread (spec §4.2: "installation must happen on the loop thread").
    pub(crate) fn insert(&mut self, id: TimerId, now: Instant, delay: Duration, nesting_depth: u32, task: Task) {
        let effective_delay = clamp_delay(delay, nesting_depth);
        let deadline = now
            .checked_add(effective_delay)
            .unwrap_or_else(|| now + Duration::from_secs(0));
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Entry {
            deadline,
            sequence,
            id,
            task: Some(task),
        });
        self.live_count += 1;
    }

    /// Drop every scheduled timer unconditionally (spec §4.8 graceful
    /// shutdown phase 4: "Clear the timer heap — cancelled by definition
    /// after shutdown").
    pub fn clear(&mut self) {
        self.heap.clear();
        self.live_count = 0;
    }

    /// Cancel a pending timer. Lazily marks the heap entry dead; it is
    /// dropped without running the next time it would otherwise surface.
    /// Returns `Err(LoopError::Fatal)`-free `Ok(false)` if `id` is unknown
    /// or has already fired/been cancelled — cancellation of a non-existent
    /// timer is not itself an error (spec §4.2: idempotent cancel).
    pub fn cancel(&mut self, id: TimerId) -> bool {
        // `BinaryHeap` only exposes `iter()` (shared refs) on stable, so
        // cancellation rebuilds the heap with the matching entry's task
        // cleared rather than mutating in place.
        let mut found = false;
        let drained: Vec<Entry> = self.heap.drain().collect();
        for mut entry in drained {
            if entry.id == id && entry.task.is_some() {
                entry.task = None;
                found = true;
            }
            self.heap.push(entry);
        }
        if found {
            self.live_count = self.live_count.saturating_sub(1);
        }
        found
    }

    /// The deadline of the earliest still-live timer, if any. Used by the
    /// check-then-sleep protocol (spec §4.7) to bound the poller's timeout.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap
            .iter()
            .filter(|e| e.task.is_some())
            .map(|e| e.deadline)
            .min()
    }

    /// Pop and return every timer whose deadline is `<= now`, in
    /// deadline/FIFO order, skipping cancelled entries. The loop is
    /// responsible for running the returned tasks (through the panic
    /// boundary) and scheduling them onto the internal ingress lane.
    pub fn drain_expired(&mut self, now: Instant) -> Vec<(TimerId, Task)> {
        let mut expired = Vec::new();
        while let Some(top) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let entry = self.heap.pop().expect("peeked entry must be poppable");
            if let Some(task) = entry.task {
                expired.push((entry.id, task));
                self.live_count = self.live_count.saturating_sub(1);
            }
        }
        expired
    }

    /// Number of timers still live (scheduled and not yet fired/cancelled).
    pub fn len(&self) -> usize {
        self.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.live_count == 0
    }
}

impl Default for TimerHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TimerHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHeap")
            .field("live_count", &self.live_count)
            .field("total_entries", &self.heap.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let o1 = Arc::clone(&order);
        heap.schedule(now, Duration::from_millis(30), 0, Task::new(move |_| o1.lock().unwrap().push(30)))
            .unwrap();
        let o2 = Arc::clone(&order);
        heap.schedule(now, Duration::from_millis(10), 0, Task::new(move |_| o2.lock().unwrap().push(10)))
            .unwrap();
        let o3 = Arc::clone(&order);
        heap.schedule(now, Duration::from_millis(20), 0, Task::new(move |_| o3.lock().unwrap().push(20)))
            .unwrap();

        let later = now + Duration::from_millis(100);
        for (_, mut task) in heap.drain_expired(later) {
            task.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    }

    #[test]
    fn ties_break_fifo() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..5 {
            let o = Arc::clone(&order);
            heap.schedule(now, Duration::from_millis(10), 0, Task::new(move |_| o.lock().unwrap().push(i)))
                .unwrap();
        }
        let later = now + Duration::from_millis(50);
        for (_, mut task) in heap.drain_expired(later) {
            task.run();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn drain_expired_leaves_future_timers_in_place() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.schedule(now, Duration::from_millis(10), 0, Task::new(|_| {})).unwrap();
        heap.schedule(now, Duration::from_millis(1000), 0, Task::new(|_| {})).unwrap();

        let expired = heap.drain_expired(now + Duration::from_millis(50));
        assert_eq!(expired.len(), 1);
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn cancel_prevents_future_dispatch() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = Arc::clone(&ran);
        let id = heap
            .schedule(now, Duration::from_millis(10), 0, Task::new(move |_| {
                ran2.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        assert!(heap.cancel(id));
        assert_eq!(heap.len(), 0);

        let expired = heap.drain_expired(now + Duration::from_millis(50));
        assert!(expired.is_empty());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_unknown_id_is_not_an_error() {
        let mut heap = TimerHeap::new();
        let bogus = TimerId::next().unwrap();
        assert!(!heap.cancel(bogus));
    }

    #[test]
    fn nested_timers_past_depth_five_are_clamped_to_4ms() {
        let now = Instant::now();
        // depth 6 with a 0ms request clamps up to 4ms.
        let clamped = clamp_delay(Duration::from_millis(0), 6);
        assert_eq!(clamped, CLAMPED_MIN_DELAY);
        // depth 5 (not yet over threshold) is unaffected.
        let unclamped = clamp_delay(Duration::from_millis(0), 5);
        assert_eq!(unclamped, Duration::from_millis(0));
        let _ = now;
    }

    #[test]
    fn clamp_never_reduces_a_longer_requested_delay() {
        let clamped = clamp_delay(Duration::from_millis(100), 10);
        assert_eq!(clamped, Duration::from_millis(100));
    }

    #[test]
    fn next_deadline_reports_earliest_live_timer() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.schedule(now, Duration::from_millis(50), 0, Task::new(|_| {})).unwrap();
        let id = heap
            .schedule(now, Duration::from_millis(10), 0, Task::new(|_| {}))
            .unwrap();
        assert_eq!(heap.next_deadline(), Some(now + Duration::from_millis(10)));
        heap.cancel(id);
        assert_eq!(heap.next_deadline(), Some(now + Duration::from_millis(50)));
    }

    #[test]
    fn empty_heap_has_no_next_deadline() {
        let heap = TimerHeap::new();
        assert_eq!(heap.next_deadline(), None);
        assert!(heap.is_empty());
    }

    #[test]
    fn clear_drops_every_timer() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        heap.schedule(now, Duration::from_millis(10), 0, Task::new(|_| {})).unwrap();
        heap.schedule(now, Duration::from_millis(20), 0, Task::new(|_| {})).unwrap();
        heap.clear();
        assert!(heap.is_empty());
        assert_eq!(heap.next_deadline(), None);
        assert!(heap.drain_expired(now + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn insert_with_preallocated_id_is_later_cancellable() {
        let mut heap = TimerHeap::new();
        let now = Instant::now();
        let id = TimerId::next().unwrap();
        heap.insert(id, now, Duration::from_millis(10), 0, Task::new(|_| {}));
        assert_eq!(heap.len(), 1);
        assert!(heap.cancel(id));
    }
}
