//! The promise registry (spec §4.4): Promise/A+-shaped settlement, reaction
//! dispatch, combinators, and unhandled-rejection tracking.
//!
//! Grounded on `lumen-runtime/src/process.rs`'s `ProcessControlBlock`
//! (`Mutex`-guarded inner state behind an id, accessed through a registry)
//! for the entry shape, and on the resolution-procedure/then-chaining shape
//! of `other_examples/39a1e940_skelpo-perry__...-promise.rs.rs` and
//! `other_examples/8cdb28c2_neon-bindings-neon__...-promise.rs.rs` — rewritten
//! as safe, `Mutex`-guarded state rather than those files' raw-pointer/FFI
//! style.
//!
//! # The unhandled-rejection invariant
//!
//! A rejection is reported as unhandled only if *no rejection handler was
//! ever attached by the time the check runs* — not by the time the
//! rejection happened (spec §4.4). Concretely: attaching a `.catch`/`.then`
//! with a rejection handler *after* rejection still suppresses the report,
//! as long as it happens before the next unhandled-rejection sweep. The
//! registry tracks this by deleting an entry's handler-presence record at
//! *check time*, via [`PromiseRegistry::sweep_unhandled_rejections`], not at
//! rejection time.

use crate::queue::{IngressQueue, Lane};
use crate::task::{Task, TaskContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

static NEXT_PROMISE_ID: AtomicU64 = AtomicU64::new(1);

/// A unique identifier for a promise.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(u64);

impl PromiseId {
    fn next() -> Self {
        Self(NEXT_PROMISE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromiseId({})", self.0)
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "promise:{}", self.0)
    }
}

/// An opaque settlement value. The core never interprets a value beyond
/// identity, downcasting, and `Clone`; the embedder's own type carries the
/// real payload.
pub type Value = Arc<dyn std::any::Any + Send + Sync>;

#[derive(Clone)]
enum Settlement {
    Pending,
    Fulfilled(Value),
    Rejected(Value),
}

type Reactor = Box<dyn FnOnce(Value) + Send + 'static>;

struct Reaction {
    on_fulfilled: Option<Reactor>,
    on_rejected: Option<Reactor>,
}

struct Inner {
    settlement: Settlement,
    reactions: Vec<Reaction>,
    has_rejection_handler: bool,
    is_rejected: bool,
    reported_unhandled: bool,
}

impl Inner {
    fn new() -> Self {
        Self {
            settlement: Settlement::Pending,
            reactions: Vec::new(),
            has_rejection_handler: false,
            is_rejected: false,
            reported_unhandled: false,
        }
    }
}

/// A handle to one promise's shared state. Cloning a `Promise` is cheap and
/// aliases the same underlying settlement — mirroring JS promise-object
/// identity.
#[derive(Clone)]
pub struct Promise {
    id: PromiseId,
    inner: Arc<Mutex<Inner>>,
}

impl Promise {
    pub fn id(&self) -> PromiseId {
        self.id
    }

    /// Synchronous inspection of current settlement (spec.md §5.4
    /// supplemental addition — adds no scheduling behavior, purely a
    /// read). Returns `None` while pending.
    pub fn settled(&self) -> Option<Result<Value, Value>> {
        let guard = self.inner.lock().expect("promise mutex poisoned");
        match &guard.settlement {
            Settlement::Pending => None,
            Settlement::Fulfilled(v) => Some(Ok(Arc::clone(v))),
            Settlement::Rejected(v) => Some(Err(Arc::clone(v))),
        }
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock().expect("promise mutex poisoned");
        let state = match &guard.settlement {
            Settlement::Pending => "pending",
            Settlement::Fulfilled(_) => "fulfilled",
            Settlement::Rejected(_) => "rejected",
        };
        f.debug_struct("Promise").field("id", &self.id).field("state", &state).finish()
    }
}

/// A record of one still-unhandled rejection, surfaced to the embedder via
/// [`crate::loop_core::Loop::on_unhandled_rejection`].
#[derive(Debug, Clone)]
pub struct UnhandledRejection {
    pub promise_id: PromiseId,
    pub reason: Value,
}

/// Owns every live promise and drives settlement/reaction dispatch onto the
/// ingress queue's microtask lane. Lives behind an `Arc` in `loop_core.rs`
/// so combinator reactions can settle a derived promise without needing a
/// borrowed `queue`/`registry` parameter threaded through every callback.
pub struct PromiseRegistry {
    queue: Arc<IngressQueue>,
    promises: Mutex<HashMap<PromiseId, Weak<Mutex<Inner>>>>,
    gc_threshold: usize,
}

impl PromiseRegistry {
    pub fn new(queue: Arc<IngressQueue>) -> Arc<Self> {
        Arc::new(Self {
            queue,
            promises: Mutex::new(HashMap::new()),
            gc_threshold: 256,
        })
    }

    /// Create a new pending promise.
    pub fn create(&self) -> Promise {
        let id = PromiseId::next();
        let inner = Arc::new(Mutex::new(Inner::new()));
        self.promises
            .lock()
            .expect("promise registry mutex poisoned")
            .insert(id, Arc::downgrade(&inner));
        self.maybe_compact();
        Promise { id, inner }
    }

    fn maybe_compact(&self) {
        let mut guard = self.promises.lock().expect("promise registry mutex poisoned");
        if guard.len() < self.gc_threshold {
            return;
        }
        guard.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Settle `promise` as fulfilled with `value`. If `value` is itself a
    /// [`Promise`], `promise` adopts its eventual settlement instead of
    /// settling immediately (thenable adoption, spec §4.4).
    pub fn resolve(self: &Arc<Self>, promise: &Promise, value: Value) {
        self.resolve_with_depth(promise, value, 0);
    }

    /// Caps adoption-chain depth so a promise that (directly or through a
    /// chain) adopts itself settles as rejected instead of hanging forever,
    /// mirroring a JS engine's `TypeError` for a cyclic thenable chain.
    const MAX_ADOPTION_DEPTH: u32 = 1000;

    fn resolve_with_depth(self: &Arc<Self>, promise: &Promise, value: Value, depth: u32) {
        if let Some(adoptee) = value.downcast_ref::<Promise>().cloned() {
            if adoptee.id() == promise.id() {
                // A promise resolved with itself can never settle through
                // the normal adoption path — it would attach a forwarding
                // reaction to its own still-pending reaction list and hang
                // forever. Reject it instead, mirroring a JS engine's
                // `TypeError` for a self-referential thenable.
                self.settle(
                    promise,
                    Settlement::Rejected(Arc::new("chaining cycle detected: promise resolved with itself".to_string())),
                );
                return;
            }
            if depth >= Self::MAX_ADOPTION_DEPTH {
                self.settle(
                    promise,
                    Settlement::Rejected(Arc::new("thenable adoption cycle detected".to_string())),
                );
                return;
            }
            let registry = Arc::clone(self);
            let target = promise.clone();
            self.attach(
                &adoptee,
                Some(Box::new(move |value| registry.resolve_with_depth(&target, value, depth + 1))),
                Some({
                    let registry = Arc::clone(self);
                    let target = promise.clone();
                    Box::new(move |reason| registry.settle(&target, Settlement::Rejected(reason)))
                }),
            );
            return;
        }
        self.settle(promise, Settlement::Fulfilled(value));
    }

    /// Settle `promise` as rejected with `reason`.
    pub fn reject(self: &Arc<Self>, promise: &Promise, reason: Value) {
        self.settle(promise, Settlement::Rejected(reason));
    }

    fn settle(self: &Arc<Self>, promise: &Promise, settlement: Settlement) {
        let reactions = {
            let mut guard = promise.inner.lock().expect("promise mutex poisoned");
            if !matches!(guard.settlement, Settlement::Pending) {
                return; // settle-exactly-once
            }
            if matches!(settlement, Settlement::Rejected(_)) {
                guard.is_rejected = true;
            }
            guard.settlement = settlement.clone();
            std::mem::take(&mut guard.reactions)
        };
        for reaction in reactions {
            self.dispatch_reaction(reaction, settlement.clone());
        }
    }

    fn dispatch_reaction(&self, reaction: Reaction, settlement: Settlement) {
        let task = match settlement {
            Settlement::Fulfilled(value) => reaction
                .on_fulfilled
                .map(|f| Task::new(move |_ctx: &TaskContext| f(value))),
            Settlement::Rejected(reason) => reaction
                .on_rejected
                .map(|f| Task::new(move |_ctx: &TaskContext| f(reason))),
            Settlement::Pending => None,
        };
        if let Some(task) = task {
            let _ = self.queue.push(task, Lane::Microtask);
        }
    }

    /// Attach a reaction pair. If `promise` is already settled, the
    /// matching reaction is scheduled onto the microtask lane immediately
    /// rather than stored (spec §4.4: reactions to an already-settled
    /// promise still run as a microtask, never synchronously).
    pub fn attach(&self, promise: &Promise, on_fulfilled: Option<Reactor>, on_rejected: Option<Reactor>) {
        let has_rejection_handler = on_rejected.is_some();
        let mut guard = promise.inner.lock().expect("promise mutex poisoned");
        if has_rejection_handler {
            guard.has_rejection_handler = true;
        }
        match &guard.settlement {
            Settlement::Pending => {
                guard.reactions.push(Reaction { on_fulfilled, on_rejected });
            }
            Settlement::Fulfilled(value) => {
                let value = Arc::clone(value);
                drop(guard);
                if let Some(f) = on_fulfilled {
                    let _ = self.queue.push(Task::new(move |_ctx| f(value)), Lane::Microtask);
                }
            }
            Settlement::Rejected(reason) => {
                let reason = Arc::clone(reason);
                drop(guard);
                if let Some(f) = on_rejected {
                    let _ = self.queue.push(Task::new(move |_ctx| f(reason)), Lane::Microtask);
                }
            }
        }
    }

    /// `promise.then(on_fulfilled)`, embedder-facing convenience over
    /// [`attach`](Self::attach).
    pub fn then(&self, promise: &Promise, on_fulfilled: Reactor) {
        self.attach(promise, Some(on_fulfilled), None);
    }

    /// `promise.catch(on_rejected)`.
    pub fn catch(&self, promise: &Promise, on_rejected: Reactor) {
        self.attach(promise, None, Some(on_rejected));
    }

    /// `promise.finally(on_settled)`: runs on either outcome, value
    /// discarded, and re-settles a derived promise with the original
    /// outcome so the chain can continue.
    pub fn finally(
        self: &Arc<Self>,
        promise: &Promise,
        on_settled: impl Fn() + Send + Sync + 'static,
    ) -> Promise {
        let derived = self.create();
        let on_settled = Arc::new(on_settled);
        let registry_f = Arc::clone(self);
        let registry_r = Arc::clone(self);
        let derived_f = derived.clone();
        let derived_r = derived.clone();
        let on_settled_f = Arc::clone(&on_settled);
        let on_settled_r = Arc::clone(&on_settled);
        self.attach(
            promise,
            Some(Box::new(move |value| {
                on_settled_f();
                registry_f.resolve(&derived_f, value);
            })),
            Some(Box::new(move |reason| {
                on_settled_r();
                registry_r.reject(&derived_r, reason);
            })),
        );
        derived
    }

    /// Combinator: resolves once every input fulfills, with an array of
    /// results in input order; rejects with the first rejection observed.
    pub fn all(self: &Arc<Self>, promises: Vec<Promise>) -> Promise {
        let combined = self.create();
        if promises.is_empty() {
            self.resolve(&combined, Arc::new(Vec::<Value>::new()) as Value);
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(promises.len()));
        let results: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(vec![None; promises.len()]));
        for (idx, p) in promises.iter().enumerate() {
            let registry = Arc::clone(self);
            let combined_f = combined.clone();
            let remaining_f = Arc::clone(&remaining);
            let results_f = Arc::clone(&results);
            let registry_r = Arc::clone(self);
            let combined_r = combined.clone();
            self.attach(
                p,
                Some(Box::new(move |value| {
                    results_f.lock().expect("results mutex poisoned")[idx] = Some(value);
                    if remaining_f.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let values: Vec<Value> = results_f
                            .lock()
                            .expect("results mutex poisoned")
                            .iter()
                            .map(|v| v.clone().expect("all results present at zero remaining"))
                            .collect();
                        registry.resolve(&combined_f, Arc::new(values) as Value);
                    }
                })),
                Some(Box::new(move |reason| registry_r.reject(&combined_r, reason))),
            );
        }
        combined
    }

    /// Combinator: settles with the first input to settle, by either
    /// outcome.
    pub fn race(self: &Arc<Self>, promises: Vec<Promise>) -> Promise {
        let combined = self.create();
        for p in &promises {
            let registry_f = Arc::clone(self);
            let combined_f = combined.clone();
            let registry_r = Arc::clone(self);
            let combined_r = combined.clone();
            self.attach(
                p,
                Some(Box::new(move |value| registry_f.resolve(&combined_f, value))),
                Some(Box::new(move |reason| registry_r.reject(&combined_r, reason))),
            );
        }
        combined
    }

    /// Combinator: always fulfills once every input has settled, with a
    /// `Value` of `Vec<Result<Value, Value>>` in input order.
    pub fn all_settled(self: &Arc<Self>, promises: Vec<Promise>) -> Promise {
        let combined = self.create();
        if promises.is_empty() {
            self.resolve(&combined, Arc::new(Vec::<Result<Value, Value>>::new()) as Value);
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(promises.len()));
        let results: Arc<Mutex<Vec<Option<Result<Value, Value>>>>> =
            Arc::new(Mutex::new(vec![None; promises.len()]));
        for (idx, p) in promises.iter().enumerate() {
            let finish: Arc<dyn Fn() + Send + Sync> = {
                let registry = Arc::clone(self);
                let combined = combined.clone();
                let remaining = Arc::clone(&remaining);
                let results = Arc::clone(&results);
                Arc::new(move || {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let values: Vec<Result<Value, Value>> = results
                            .lock()
                            .expect("results mutex poisoned")
                            .iter()
                            .map(|v| v.clone().expect("all_settled results present at zero remaining"))
                            .collect();
                        registry.resolve(&combined, Arc::new(values) as Value);
                    }
                })
            };
            let results_f = Arc::clone(&results);
            let finish_f = Arc::clone(&finish);
            let results_r = Arc::clone(&results);
            let finish_r = Arc::clone(&finish);
            self.attach(
                p,
                Some(Box::new(move |value| {
                    results_f.lock().expect("results mutex poisoned")[idx] = Some(Ok(value));
                    finish_f();
                })),
                Some(Box::new(move |reason| {
                    results_r.lock().expect("results mutex poisoned")[idx] = Some(Err(reason));
                    finish_r();
                })),
            );
        }
        combined
    }

    /// Combinator: fulfills with the first input to fulfill; rejects (with
    /// an aggregate of all reasons) only if every input rejects.
    pub fn any(self: &Arc<Self>, promises: Vec<Promise>) -> Promise {
        let combined = self.create();
        if promises.is_empty() {
            self.reject(&combined, Arc::new("any() called with no promises".to_string()) as Value);
            return combined;
        }
        let remaining = Arc::new(AtomicUsize::new(promises.len()));
        let reasons: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(vec![None; promises.len()]));
        for (idx, p) in promises.iter().enumerate() {
            let registry_f = Arc::clone(self);
            let combined_f = combined.clone();
            let registry_r = Arc::clone(self);
            let combined_r = combined.clone();
            let reasons_r = Arc::clone(&reasons);
            let remaining_r = Arc::clone(&remaining);
            self.attach(
                p,
                Some(Box::new(move |value| registry_f.resolve(&combined_f, value))),
                Some(Box::new(move |reason| {
                    reasons_r.lock().expect("reasons mutex poisoned")[idx] = Some(reason);
                    if remaining_r.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let collected: Vec<Value> = reasons_r
                            .lock()
                            .expect("reasons mutex poisoned")
                            .iter()
                            .map(|r| r.clone().expect("any reasons present at zero remaining"))
                            .collect();
                        registry_r.reject(&combined_r, Arc::new(collected) as Value);
                    }
                })),
            );
        }
        combined
    }

    /// Sweep every still-live promise for an unhandled rejection: rejected,
    /// no handler ever attached, not yet reported. Deletes the
    /// handler-presence bookkeeping at check time (this call), per the
    /// module-level invariant — a handler attached between rejection and
    /// this sweep still suppresses the report. Also drops registry entries
    /// whose promise has been dropped (GC-assisted cleanup, spec §4.4).
    pub fn sweep_unhandled_rejections(&self) -> Vec<UnhandledRejection> {
        let mut reported = Vec::new();
        let mut guard = self.promises.lock().expect("promise registry mutex poisoned");
        guard.retain(|id, weak| match weak.upgrade() {
            None => false,
            Some(inner) => {
                let mut inner_guard = inner.lock().expect("promise mutex poisoned");
                if inner_guard.is_rejected
                    && !inner_guard.has_rejection_handler
                    && !inner_guard.reported_unhandled
                {
                    if let Settlement::Rejected(reason) = &inner_guard.settlement {
                        reported.push(UnhandledRejection {
                            promise_id: *id,
                            reason: Arc::clone(reason),
                        });
                    }
                    inner_guard.reported_unhandled = true;
                }
                true
            }
        });
        reported
    }

    /// Reject every still-pending promise with `reason` (spec §4.8 graceful
    /// shutdown phase 5: "Reject all pending registered promises with a
    /// loop-terminated error, so awaiters unblock"). Already-settled
    /// promises are untouched (settle-exactly-once).
    pub fn reject_all_pending(self: &Arc<Self>, reason: Value) {
        let handles: Vec<Promise> = {
            let guard = self.promises.lock().expect("promise registry mutex poisoned");
            guard
                .iter()
                .filter_map(|(id, weak)| weak.upgrade().map(|inner| Promise { id: *id, inner }))
                .collect()
        };
        for promise in handles {
            self.reject(&promise, Arc::clone(&reason));
        }
    }

    pub fn len(&self) -> usize {
        self.promises.lock().expect("promise registry mutex poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::IngressQueue;

    fn val(n: i32) -> Value {
        Arc::new(n)
    }

    fn registry() -> (Arc<PromiseRegistry>, Arc<IngressQueue>) {
        let queue = Arc::new(IngressQueue::new());
        (PromiseRegistry::new(Arc::clone(&queue)), queue)
    }

    fn run_microtasks(queue: &IngressQueue) {
        while let Some(mut t) = queue.pop_lane(Lane::Microtask) {
            t.run();
        }
    }

    #[test]
    fn resolve_then_dispatches_on_microtask_lane() {
        let (registry, queue) = registry();
        let promise = registry.create();

        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        registry.then(
            &promise,
            Box::new(move |v: Value| *seen2.lock().unwrap() = v.downcast_ref::<i32>().copied()),
        );

        registry.resolve(&promise, val(42));
        assert!(queue.has_microtasks());
        run_microtasks(&queue);
        assert_eq!(*seen.lock().unwrap(), Some(42));
    }

    #[test]
    fn then_after_settlement_still_dispatches() {
        let (registry, queue) = registry();
        let promise = registry.create();
        registry.resolve(&promise, val(7));
        run_microtasks(&queue);

        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        registry.then(
            &promise,
            Box::new(move |v: Value| *seen2.lock().unwrap() = v.downcast_ref::<i32>().copied()),
        );
        run_microtasks(&queue);
        assert_eq!(*seen.lock().unwrap(), Some(7));
    }

    #[test]
    fn settle_exactly_once() {
        let (registry, _queue) = registry();
        let promise = registry.create();
        registry.resolve(&promise, val(1));
        registry.resolve(&promise, val(2));
        let settled = promise.settled().unwrap().unwrap();
        assert_eq!(*settled.downcast_ref::<i32>().unwrap(), 1);
    }

    #[test]
    fn settled_reports_none_while_pending() {
        let (registry, _queue) = registry();
        let promise = registry.create();
        assert!(promise.settled().is_none());
    }

    #[test]
    fn reject_settles_as_rejected() {
        let (registry, _queue) = registry();
        let promise = registry.create();
        registry.reject(&promise, val(99));
        assert!(promise.settled().unwrap().is_err());
    }

    #[test]
    fn promise_ids_are_unique() {
        let (registry, _queue) = registry();
        let a = registry.create();
        let b = registry.create();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn all_with_empty_vec_resolves_immediately() {
        let (registry, _queue) = registry();
        let combined = registry.all(Vec::new());
        assert!(combined.settled().unwrap().is_ok());
    }

    #[test]
    fn all_resolves_with_results_in_order_once_every_input_settles() {
        let (registry, queue) = registry();
        let a = registry.create();
        let b = registry.create();
        let combined = registry.all(vec![a.clone(), b.clone()]);

        registry.resolve(&b, val(2));
        run_microtasks(&queue);
        assert!(combined.settled().is_none());

        registry.resolve(&a, val(1));
        run_microtasks(&queue);
        let values = combined.settled().unwrap().unwrap();
        let values = values.downcast_ref::<Vec<Value>>().unwrap();
        assert_eq!(*values[0].downcast_ref::<i32>().unwrap(), 1);
        assert_eq!(*values[1].downcast_ref::<i32>().unwrap(), 2);
    }

    #[test]
    fn all_rejects_as_soon_as_any_input_rejects() {
        let (registry, queue) = registry();
        let a = registry.create();
        let b = registry.create();
        let combined = registry.all(vec![a.clone(), b.clone()]);

        registry.reject(&a, val(-1));
        run_microtasks(&queue);
        assert!(combined.settled().unwrap().is_err());
    }

    #[test]
    fn race_settles_with_first_to_settle() {
        let (registry, queue) = registry();
        let a = registry.create();
        let b = registry.create();
        let combined = registry.race(vec![a.clone(), b.clone()]);

        registry.resolve(&b, val(2));
        run_microtasks(&queue);
        let settled = combined.settled().unwrap().unwrap();
        assert_eq!(*settled.downcast_ref::<i32>().unwrap(), 2);

        // `a` settling afterward has no further effect (settle-exactly-once).
        registry.resolve(&a, val(1));
        run_microtasks(&queue);
        let settled = combined.settled().unwrap().unwrap();
        assert_eq!(*settled.downcast_ref::<i32>().unwrap(), 2);
    }

    #[test]
    fn any_fulfills_with_first_fulfillment_even_after_a_rejection() {
        let (registry, queue) = registry();
        let a = registry.create();
        let b = registry.create();
        let combined = registry.any(vec![a.clone(), b.clone()]);

        registry.reject(&a, val(-1));
        run_microtasks(&queue);
        assert!(combined.settled().is_none());

        registry.resolve(&b, val(5));
        run_microtasks(&queue);
        let settled = combined.settled().unwrap().unwrap();
        assert_eq!(*settled.downcast_ref::<i32>().unwrap(), 5);
    }

    #[test]
    fn any_rejects_only_once_every_input_has_rejected() {
        let (registry, queue) = registry();
        let a = registry.create();
        let b = registry.create();
        let combined = registry.any(vec![a.clone(), b.clone()]);

        registry.reject(&a, val(-1));
        run_microtasks(&queue);
        assert!(combined.settled().is_none());

        registry.reject(&b, val(-2));
        run_microtasks(&queue);
        assert!(combined.settled().unwrap().is_err());
    }

    #[test]
    fn thenable_adoption_propagates_inner_promise_settlement() {
        let (registry, queue) = registry();
        let outer = registry.create();
        let inner = registry.create();

        registry.resolve(&outer, Arc::new(inner.clone()) as Value);
        run_microtasks(&queue);
        assert!(outer.settled().is_none()); // still pending: adopting `inner`

        registry.resolve(&inner, val(10));
        run_microtasks(&queue);
        let settled = outer.settled().unwrap().unwrap();
        assert_eq!(*settled.downcast_ref::<i32>().unwrap(), 10);
    }

    #[test]
    fn resolving_a_promise_with_itself_rejects_with_a_cycle_error() {
        let (registry, queue) = registry();
        let p = registry.create();
        registry.resolve(&p, Arc::new(p.clone()) as Value);
        run_microtasks(&queue);
        let settled = p.settled().unwrap();
        assert!(settled.is_err());
    }

    #[test]
    fn reject_all_pending_settles_every_still_pending_promise() {
        let (registry, _queue) = registry();
        let pending = registry.create();
        let already_fulfilled = registry.create();
        registry.resolve(&already_fulfilled, val(1));

        registry.reject_all_pending(Arc::new("loop terminated".to_string()));

        assert!(pending.settled().unwrap().is_err());
        // Already-settled promises keep their original outcome.
        assert_eq!(*already_fulfilled.settled().unwrap().unwrap().downcast_ref::<i32>().unwrap(), 1);
    }

    #[test]
    fn unhandled_rejection_reported_when_no_handler_ever_attached() {
        let (registry, _queue) = registry();
        let promise = registry.create();
        registry.reject(&promise, val(-1));
        let reported = registry.sweep_unhandled_rejections();
        assert_eq!(reported.len(), 1);
        assert_eq!(reported[0].promise_id, promise.id());
    }

    #[test]
    fn rejection_is_suppressed_by_a_handler_attached_before_the_sweep() {
        let (registry, queue) = registry();
        let promise = registry.create();
        registry.reject(&promise, val(-1));
        registry.catch(&promise, Box::new(|_reason| {}));
        run_microtasks(&queue);
        let reported = registry.sweep_unhandled_rejections();
        assert!(reported.is_empty());
    }

    #[test]
    fn sweep_does_not_report_the_same_rejection_twice() {
        let (registry, _queue) = registry();
        let promise = registry.create();
        registry.reject(&promise, val(-1));
        let first = registry.sweep_unhandled_rejections();
        assert_eq!(first.len(), 1);
        let second = registry.sweep_unhandled_rejections();
        assert!(second.is_empty());
    }
}
