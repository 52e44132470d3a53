//! The loop core and embedder façade (spec §4.6–4.8): ties the ingress
//! queue, timer heap, I/O poller, wake handle, promise registry, and state
//! machine into the tick cycle a host drives by calling [`Loop::run`].
//!
//! Grounded on `lumen-runtime/src/scheduler.rs`'s `Scheduler`: an
//! `AtomicBool`-guarded shutdown flag, an idempotent `shutdown()` backed by
//! a `Drop` impl, and a `crossbeam_channel` rendezvous used here for the
//! shutdown-done signal rather than that file's task-completion channel.

use crate::error::LoopError;
use crate::poller::{IoCallback, IoPoller, MioPoller, Readiness, WAKE_TOKEN};
use crate::promise::{Promise, PromiseRegistry, Reactor as PromiseReactor, UnhandledRejection, Value as PromiseValue};
use crate::queue::{IngressQueue, Lane};
use crate::state::{LoopState, StateMachine};
use crate::task::{Task, TaskContext, TaskId};
use crate::timer::{TimerHeap, TimerId};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

/// A cooperative cancellation signal threaded through [`Loop::run`] and
/// [`Loop::shutdown`] (spec §4.8/§6: "Shutdown cancellation is cooperative
/// via the context signal passed to `shutdown`"). Cloning a `Ctx` shares
/// the same underlying flag, so every clone observes the same
/// cancellation — the loop and the caller that triggered it see the same
/// state without a callback registry.
#[derive(Clone, Default)]
pub struct Ctx {
    cancelled: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl Ctx {
    /// A context that never cancels on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this context. Idempotent — the first reason given wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut guard = self.reason.lock().expect("ctx reason mutex poisoned");
        if guard.is_none() {
            *guard = Some(reason.into());
        }
        drop(guard);
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn reason(&self) -> String {
        self.reason
            .lock()
            .expect("ctx reason mutex poisoned")
            .clone()
            .unwrap_or_else(|| "context cancelled".to_string())
    }
}

impl std::fmt::Debug for Ctx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ctx").field("cancelled", &self.is_cancelled()).finish()
    }
}

/// Tuning knobs for one [`Loop`] instance (ambient configuration, spec.md
/// §3/`SPEC_FULL.md` §3 — no file/env layer, purely in-process).
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Maximum external-lane tasks drained in a single tick before yielding
    /// back to timers/I/O, preventing external submitters from starving the
    /// rest of the loop.
    pub external_budget: usize,
    /// When `true`, microtasks are drained strictly after each individual
    /// task/callback invocation (closest to the HTML spec's "microtask
    /// checkpoint" placement). When `false` (default), microtasks are
    /// drained once per phase, which is cheaper and still spec-conformant
    /// since ordering *within* the microtask lane is unaffected.
    pub strict_microtasks: bool,
    /// Upper bound on how long a single `poll()` call may block, regardless
    /// of the nearest timer deadline — bounds staleness if a platform wake
    /// primitive is ever missed.
    pub poll_cap: Duration,
    /// Name given to tracing spans for this loop instance.
    pub thread_name: String,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            external_budget: 1024,
            strict_microtasks: false,
            poll_cap: Duration::from_millis(1000),
            thread_name: "event-loop".to_string(),
        }
    }
}

/// Builder for [`LoopConfig`], matching the teacher's builder-free-but-
/// chainable style used elsewhere in the pack.
#[derive(Debug, Clone, Default)]
pub struct LoopBuilder {
    config: LoopConfig,
}

impl LoopBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn external_budget(mut self, n: usize) -> Self {
        self.config.external_budget = n;
        self
    }

    pub fn strict_microtasks(mut self, strict: bool) -> Self {
        self.config.strict_microtasks = strict;
        self
    }

    pub fn poll_cap(mut self, cap: Duration) -> Self {
        self.config.poll_cap = cap;
        self
    }

    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    pub fn build(self) -> Result<Loop, LoopError> {
        Loop::with_config(self.config)
    }
}

/// Shutdown mode requested by the embedder (spec.md §4.8 / §9 Open
/// Question: this crate implements "hold-then-close").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Hold the ingress queue closed against new external pushes, drain
    /// whatever was already in flight, then stop. No new external work is
    /// accepted once shutdown begins, but nothing queued before it is lost.
    Graceful,
    /// Stop immediately: pending tasks, timers, and FD registrations are
    /// dropped unexecuted.
    Immediate,
}

type PanicHook = Box<dyn Fn(crate::error::TaskFault) + Send + Sync>;
type RejectionHook = Box<dyn Fn(UnhandledRejection) + Send + Sync>;

/// The event-loop engine. One `Loop` is driven by exactly one thread calling
/// [`run`](Self::run); every other method is safe to call from any thread
/// (including from inside a running task, for re-entrant scheduling calls
/// like `submit`/`schedule_timer`).
pub struct Loop {
    queue: Arc<IngressQueue>,
    /// Behind its own `Arc` (rather than bare `Mutex<TimerHeap>`) so
    /// `schedule_timer`'s installer task can capture a handle to the heap
    /// without capturing `&Loop` (spec §4.2: installation happens on the
    /// loop thread via an internal-lane task, not from the calling thread).
    timers: Arc<Mutex<TimerHeap>>,
    poller: Mutex<MioPoller>,
    wake: Arc<dyn crate::wake::WakeHandle>,
    promises: Arc<PromiseRegistry>,
    state: StateMachine,
    config: LoopConfig,
    tick_time: Mutex<Instant>,
    /// `(fd, Readiness)` pairs collected by the most recent `poll()`, not
    /// yet dispatched — the collect-then-execute hand-off (spec §4.3).
    pending_io: Mutex<Vec<(i32, Readiness)>>,
    loop_thread: Mutex<Option<ThreadId>>,
    on_panic: Mutex<Option<PanicHook>>,
    on_unhandled_rejection: Mutex<Option<RejectionHook>>,
    shutdown_requested: AtomicBool,
    shutdown_mode: Mutex<ShutdownMode>,
    /// The `Ctx` in effect for whichever `shutdown`/`close` call actually
    /// wins the one-shot guard below — read by `drive_shutdown` rather
    /// than threaded through as a parameter, since the thread that
    /// ultimately executes `drive_shutdown` (the loop thread, via `run`'s
    /// own loop or an inline re-entrant call) isn't necessarily the thread
    /// that called `shutdown`.
    shutdown_ctx: Mutex<Ctx>,
    /// Guards `drive_shutdown` itself to exactly one execution — distinct
    /// from `shutdown_requested`, which only gates the *request*.
    shutdown_driven: AtomicBool,
    shutdown_result: Mutex<Option<LoopError>>,
    shutdown_done: (Sender<()>, Receiver<()>),
}

impl Loop {
    /// Construct with default [`LoopConfig`]. Use [`LoopBuilder`] to
    /// customize.
    pub fn new() -> Result<Self, LoopError> {
        Self::with_config(LoopConfig::default())
    }

    fn with_config(config: LoopConfig) -> Result<Self, LoopError> {
        let queue = Arc::new(IngressQueue::new());
        let mut poller = MioPoller::new(256)?;
        let wake = Arc::new(crate::wake::MioWakeHandle::create(poller.raw(), WAKE_TOKEN)?);
        let promises = PromiseRegistry::new(Arc::clone(&queue));
        let _ = &mut poller; // registrations happen lazily via register_fd
        Ok(Self {
            queue,
            timers: Arc::new(Mutex::new(TimerHeap::new())),
            poller: Mutex::new(poller),
            wake,
            promises,
            state: StateMachine::new(true),
            config,
            tick_time: Mutex::new(Instant::now()),
            pending_io: Mutex::new(Vec::new()),
            loop_thread: Mutex::new(None),
            on_panic: Mutex::new(None),
            on_unhandled_rejection: Mutex::new(None),
            shutdown_requested: AtomicBool::new(false),
            shutdown_mode: Mutex::new(ShutdownMode::Graceful),
            shutdown_ctx: Mutex::new(Ctx::new()),
            shutdown_driven: AtomicBool::new(false),
            shutdown_result: Mutex::new(None),
            shutdown_done: bounded(1),
        })
    }

    // -- embedder hooks -----------------------------------------------------

    pub fn on_panic(&self, hook: impl Fn(crate::error::TaskFault) + Send + Sync + 'static) {
        *self.on_panic.lock().expect("on_panic mutex poisoned") = Some(Box::new(hook));
    }

    pub fn on_unhandled_rejection(&self, hook: impl Fn(UnhandledRejection) + Send + Sync + 'static) {
        *self.on_unhandled_rejection.lock().expect("on_unhandled_rejection mutex poisoned") = Some(Box::new(hook));
    }

    /// The `Instant` captured at the start of the current tick; stable for
    /// the whole tick so every timer/callback invoked within it observes
    /// the same "now" (spec §3: "Tick time is cached once per tick").
    pub fn current_tick_time(&self) -> Instant {
        *self.tick_time.lock().expect("tick_time mutex poisoned")
    }

    // -- submission surface ---------------------------------------------------

    /// Submit external work (spec §6): callable from any thread, including
    /// re-entrantly from inside a task already running on the loop thread —
    /// such a call lands in the external lane by normal FIFO and runs
    /// within a later tick, same as any other external submission (spec §5:
    /// "Re-entrant submission from a task is safe").
    pub fn submit(&self, f: impl FnOnce(&TaskContext) + Send + 'static) -> Result<TaskId, LoopError> {
        let task = Task::new(f);
        let id = task.id();
        self.queue.push(task, Lane::External)?;
        let _ = self.wake.signal();
        Ok(id)
    }

    /// Submit internally generated work (timer fires, I/O callbacks route
    /// through this too, but most callers want [`submit`](Self::submit) or
    /// [`schedule_timer`](Self::schedule_timer) instead).
    pub fn submit_internal(&self, f: impl FnOnce(&TaskContext) + Send + 'static) -> Result<TaskId, LoopError> {
        let task = Task::new(f);
        let id = task.id();
        self.queue.push(task, Lane::Internal)?;
        Ok(id)
    }

    /// Schedule a microtask (promise reactions go through this path inside
    /// `promise.rs`; exposed directly for embedder-level
    /// `queueMicrotask`-equivalent calls).
    pub fn schedule_microtask(&self, f: impl FnOnce(&TaskContext) + Send + 'static) -> Result<TaskId, LoopError> {
        let task = Task::new(f);
        let id = task.id();
        self.queue.push(task, Lane::Microtask)?;
        Ok(id)
    }

    /// Schedule `f` to run after `delay`, honoring HTML5 nested-timer
    /// clamping if called from within a running task (pass the calling
    /// task's [`TaskContext::nesting_depth`] plus one; top-level callers
    /// pass 0).
    ///
    /// The `TimerId` is minted synchronously so the caller can cancel it
    /// right away, but the actual heap insertion is deferred to an
    /// internal-lane installer task — spec §4.2: "Installation must happen
    /// on the loop thread; external callers schedule timer installation by
    /// pushing a tiny installer task into the internal lane." This keeps
    /// timer installation ordered relative to other loop-thread events the
    /// same way any other internal-lane task is.
    pub fn schedule_timer(
        &self,
        delay: Duration,
        nesting_depth: u32,
        f: impl FnOnce(&TaskContext) + Send + 'static,
    ) -> Result<TimerId, LoopError> {
        let id = TimerId::next()?;
        let timers = Arc::clone(&self.timers);
        let task = Task::with_nesting(f, nesting_depth);
        self.submit_internal(move |_ctx| {
            let now = Instant::now();
            timers.lock().expect("timer heap mutex poisoned").insert(id, now, delay, nesting_depth, task);
        })?;
        let _ = self.wake.signal();
        Ok(id)
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.lock().expect("timer heap mutex poisoned").cancel(id)
    }

    pub fn register_fd(&self, fd: i32, interest: Readiness, callback: IoCallback) -> Result<(), LoopError> {
        self.poller.lock().expect("poller mutex poisoned").register(fd, interest, callback)
    }

    pub fn modify_fd(&self, fd: i32, interest: Readiness) -> Result<(), LoopError> {
        self.poller.lock().expect("poller mutex poisoned").modify(fd, interest)
    }

    pub fn unregister_fd(&self, fd: i32) -> Result<(), LoopError> {
        self.poller.lock().expect("poller mutex poisoned").unregister(fd)
    }

    // -- promise surface ------------------------------------------------------

    pub fn promise_create(&self) -> Promise {
        self.promises.create()
    }

    pub fn promise_resolve(&self, promise: &Promise, value: PromiseValue) {
        self.promises.resolve(promise, value);
    }

    pub fn promise_reject(&self, promise: &Promise, reason: PromiseValue) {
        self.promises.reject(promise, reason);
    }

    pub fn promise_then(&self, promise: &Promise, on_fulfilled: PromiseReactor) {
        self.promises.then(promise, on_fulfilled);
    }

    pub fn promise_catch(&self, promise: &Promise, on_rejected: PromiseReactor) {
        self.promises.catch(promise, on_rejected);
    }

    pub fn promises(&self) -> &Arc<PromiseRegistry> {
        &self.promises
    }

    // -- lifecycle --------------------------------------------------------

    fn is_loop_thread(&self) -> bool {
        self.loop_thread.lock().expect("loop_thread mutex poisoned").as_ref() == Some(&std::thread::current().id())
    }

    /// Drive the loop until [`shutdown`](Self::shutdown)/[`close`](Self::close)
    /// is called and fully processed, or `ctx` cancels. Must be called from
    /// the thread that is to become the loop thread; calling it again from
    /// a task running on that same thread is rejected with
    /// [`LoopError::ReentrantRunOnLoopThread`] rather than deadlocking, and
    /// calling it again from any other thread while already running is
    /// rejected with [`LoopError::LoopAlreadyRunning`].
    pub fn run(&self, ctx: &Ctx) -> Result<(), LoopError> {
        self.state
            .try_transition(LoopState::Awake, LoopState::Running)
            .map_err(|_actual| {
                if self.is_loop_thread() {
                    LoopError::ReentrantRunOnLoopThread
                } else {
                    LoopError::LoopAlreadyRunning
                }
            })?;
        *self.loop_thread.lock().expect("loop_thread mutex poisoned") = Some(std::thread::current().id());
        let span = tracing::info_span!("event_loop", name = %self.config.thread_name);
        let _enter = span.enter();

        loop {
            if !self.shutdown_requested.load(Ordering::Acquire) && ctx.is_cancelled() {
                if !self.shutdown_requested.swap(true, Ordering::AcqRel) {
                    *self.shutdown_mode.lock().expect("shutdown_mode mutex poisoned") = ShutdownMode::Immediate;
                    *self.shutdown_ctx.lock().expect("shutdown_ctx mutex poisoned") = ctx.clone();
                }
            }
            if self.shutdown_requested.load(Ordering::Acquire) {
                if !self.shutdown_driven.swap(true, Ordering::AcqRel) {
                    return self.drive_shutdown();
                }
                return Ok(());
            }
            self.tick()?;
        }
    }

    /// The 8-step tick cycle (spec §4.6).
    fn tick(&self) -> Result<(), LoopError> {
        let _span = tracing::trace_span!("tick").entered();

        // 1. Stamp this tick's cached "now".
        let now = Instant::now();
        *self.tick_time.lock().expect("tick_time mutex poisoned") = now;

        // 2. Drain expired timers onto the internal lane.
        let expired = self.timers.lock().expect("timer heap mutex poisoned").drain_expired(now);
        for (_id, task) in expired {
            let _ = self.queue.push(task, Lane::Internal);
        }

        // 3. Run every internal-lane task (timer fires, prior I/O
        //    callbacks), draining microtasks after each when strict.
        while let Some(task) = self.queue.pop_lane(Lane::Internal) {
            self.run_task(task);
            if self.config.strict_microtasks {
                self.drain_microtasks();
            }
        }

        // 4. Run up to `external_budget` external-lane tasks.
        let mut processed = 0;
        while processed < self.config.external_budget {
            match self.queue.pop_lane(Lane::External) {
                Some(task) => {
                    self.run_task(task);
                    processed += 1;
                    if self.config.strict_microtasks {
                        self.drain_microtasks();
                    }
                }
                None => break,
            }
        }

        // 5. End-of-phase microtask flush (always happens regardless of the
        //    strict toggle, which only controls *extra* mid-phase flushes).
        self.drain_microtasks();

        // 6. Sweep unhandled rejections accumulated this tick.
        for rejection in self.promises.sweep_unhandled_rejections() {
            if let Some(hook) = self.on_unhandled_rejection.lock().expect("hook mutex poisoned").as_ref() {
                hook(rejection);
            }
        }

        // 7. Check-then-sleep: only block in the poller if there is truly
        //    nothing left to do (the critical correctness kernel, spec
        //    §4.7) — see `check_then_sleep` for the handshake itself.
        if self.queue.is_empty() {
            self.check_then_sleep()?;
        }

        // 8. Dispatch whatever I/O readiness the poll (blocking or
        //    non-blocking) just collected.
        self.dispatch_ready_io()?;

        Ok(())
    }

    fn run_task(&self, mut task: Task) {
        let task_id = task.id();
        let result = crate::error::catch_panic(std::panic::AssertUnwindSafe(|| {
            task.run();
        }));
        if let Err(panic_error) = result {
            let fault = crate::error::TaskFault { task_id, reason: panic_error };
            tracing::warn!(%fault, "task faulted");
            if let Some(hook) = self.on_panic.lock().expect("hook mutex poisoned").as_ref() {
                hook(fault);
            }
        }
    }

    fn drain_microtasks(&self) {
        while let Some(task) = self.queue.pop_lane(Lane::Microtask) {
            self.run_task(task);
        }
    }

    /// The check-then-sleep protocol: transition `Running -> Sleeping`,
    /// then re-check the queue. If a concurrent `submit` landed a task
    /// between our last observation and the transition, the transition
    /// itself (or the immediate re-check after it) catches it, so no
    /// wakeup is ever lost to a race between "producer decides the loop is
    /// asleep" and "loop decides there's nothing to do."
    fn check_then_sleep(&self) -> Result<(), LoopError> {
        if self
            .state
            .try_transition(LoopState::Running, LoopState::Sleeping)
            .is_err()
        {
            // Shutdown raced us into Terminating; nothing to sleep for.
            return Ok(());
        }

        // Re-check after publishing Sleeping: a push that landed concurrently
        // with our transition is now guaranteed visible (the ingress queue's
        // mutex gives us the necessary acquire/release pairing with the
        // producer's push), so if the queue is non-empty we must not block.
        let timeout = if !self.queue.is_empty() {
            Some(Duration::from_millis(0))
        } else {
            let next_deadline = self.timers.lock().expect("timer heap mutex poisoned").next_deadline();
            Some(match next_deadline {
                Some(deadline) => deadline
                    .saturating_duration_since(Instant::now())
                    .min(self.config.poll_cap),
                None => self.config.poll_cap,
            })
        };

        let outcome = self.poller.lock().expect("poller mutex poisoned").poll(timeout);

        self.state
            .try_transition(LoopState::Sleeping, LoopState::Running)
            .map_err(|actual| LoopError::InvalidStateTransition { from: actual, to: LoopState::Running })?;

        self.pending_io.lock().expect("pending_io mutex poisoned").extend(outcome?.ready);
        Ok(())
    }

    fn dispatch_ready_io(&self) -> Result<(), LoopError> {
        let ready: Vec<(i32, Readiness)> = self.pending_io.lock().expect("pending_io mutex poisoned").drain(..).collect();
        if ready.is_empty() {
            return Ok(());
        }
        let mut poller = self.poller.lock().expect("poller mutex poisoned");
        for (fd, readiness) in ready {
            poller.invoke_callback(fd, readiness);
        }
        Ok(())
    }

    /// Begin graceful shutdown (spec §4.8/§6: `shutdown(ctx)`). `Graceful`
    /// holds the ingress mutex across the final external-lane drain so no
    /// in-flight push slips past the close (spec.md §9's "hold-then-close"
    /// resolution), then clears the timer heap and rejects every pending
    /// promise before closing the poller.
    ///
    /// Idempotent: a second call observes the first's completion rather
    /// than erroring (spec §4.8: "multiple callers of shutdown or close
    /// must be safe"). If `ctx` cancels before the shutdown reaches its
    /// point of no return, this call returns [`LoopError::Cancelled`] —
    /// the shutdown itself still runs to completion regardless (spec:
    /// "the loop continues draining in the background").
    pub fn shutdown(&self, ctx: &Ctx) -> Result<(), LoopError> {
        self.shutdown_with(ctx, ShutdownMode::Graceful, false)
    }

    /// Immediate shutdown: mark `Terminating`/`Terminated`, close
    /// descriptors, do not drain (spec §4.8/§6: `close()`, no `ctx` —
    /// nothing here is interruptible since nothing is drained).
    ///
    /// Unlike [`shutdown`](Self::shutdown), a second call to `close()`
    /// returns `Err(`[`LoopError::LoopTerminated`]`)` rather than waiting
    /// idempotently (spec.md §9's distinct contract for the two entry
    /// points).
    pub fn close(&self) -> Result<(), LoopError> {
        self.shutdown_with(&Ctx::new(), ShutdownMode::Immediate, true)
    }

    fn shutdown_with(&self, ctx: &Ctx, mode: ShutdownMode, is_close: bool) -> Result<(), LoopError> {
        if self.state.load() == LoopState::Awake {
            return Err(LoopError::LoopNotRunning);
        }

        if self.shutdown_requested.swap(true, Ordering::AcqRel) {
            if is_close {
                return Err(LoopError::LoopTerminated);
            }
            return self.wait_for_shutdown();
        }

        *self.shutdown_mode.lock().expect("shutdown_mode mutex poisoned") = mode;
        *self.shutdown_ctx.lock().expect("shutdown_ctx mutex poisoned") = ctx.clone();
        let _ = self.wake.signal();

        if self.is_loop_thread() {
            // A task running on the loop thread triggered its own shutdown.
            // `run`'s own loop can't get back here until this task returns,
            // so drive the shutdown inline instead of blocking on the
            // completion signal we'd otherwise be waiting on forever.
            if !self.shutdown_driven.swap(true, Ordering::AcqRel) {
                return self.drive_shutdown();
            }
            return Ok(());
        }

        self.wait_for_shutdown()
    }

    fn wait_for_shutdown(&self) -> Result<(), LoopError> {
        self.shutdown_done.1.recv().ok();
        match self.shutdown_result.lock().expect("shutdown_result mutex poisoned").clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Runs the 8-phase graceful (or short-circuited immediate) shutdown
    /// exactly once — callers must go through the `shutdown_driven`
    /// one-shot guard before calling this.
    fn drive_shutdown(&self) -> Result<(), LoopError> {
        let result = self.drive_shutdown_inner();
        if let Err(ref err) = result {
            *self.shutdown_result.lock().expect("shutdown_result mutex poisoned") = Some(err.clone());
        }
        result
    }

    fn drive_shutdown_inner(&self) -> Result<(), LoopError> {
        self.state
            .transition_or_fatal(self.state.load(), LoopState::Terminating)?;
        let mode = *self.shutdown_mode.lock().expect("shutdown_mode mutex poisoned");
        match mode {
            ShutdownMode::Graceful => {
                // Hold-then-close: one critical section closes the queue and
                // drains every remaining lane atomically (phases 1-3).
                let remaining = self.queue.drain_and_close();
                for task in remaining {
                    self.run_task(task);
                }
                self.drain_microtasks();
            }
            ShutdownMode::Immediate => {
                self.queue.close();
            }
        }

        // Phase 4: clear the timer heap — cancelled by definition after
        // shutdown.
        self.timers.lock().expect("timer heap mutex poisoned").clear();

        // Phase 5: reject every still-pending promise so awaiters unblock.
        self.promises
            .reject_all_pending(Arc::new("event loop terminated".to_string()) as PromiseValue);

        // Phase 6 (wait for in-flight promise-completion helpers): this
        // crate has no off-thread `promisify` helper threads of its own to
        // join — every settlement path runs through `PromiseRegistry`,
        // already drained by phase 5 above.

        // Phase 7: close the poller and all owned descriptors.
        let _ = self.poller.lock().expect("poller mutex poisoned").close();

        let ctx_cancelled = self.shutdown_ctx.lock().expect("shutdown_ctx mutex poisoned").is_cancelled();
        let cancel_reason = ctx_cancelled.then(|| self.shutdown_ctx.lock().expect("shutdown_ctx mutex poisoned").reason());

        // Phase 8: terminal transition and completion signal. This always
        // runs, even if `ctx` cancelled above — cancellation only changes
        // what this call returns, not whether shutdown actually finishes.
        self.state
            .transition_or_fatal(LoopState::Terminating, LoopState::Terminated)?;
        let _ = self.shutdown_done.0.send(());

        match cancel_reason {
            Some(reason) => Err(LoopError::Cancelled(reason)),
            None => Ok(()),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state.load()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if !matches!(self.state.load(), LoopState::Terminated) {
            self.shutdown_requested.store(true, Ordering::Release);
        }
    }
}
