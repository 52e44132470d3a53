//! Atomic loop lifecycle state machine (spec §4.5).
//!
//! ```text
//!  Awake       -> Running, Terminating
//!  Running     -> Sleeping, Terminating
//!  Sleeping    -> Running,  Terminating
//!  Terminating -> Terminated
//!  Terminated  -> (none)
//! ```
//!
//! All transitions are compare-and-swap. In strict mode ([`StateMachine::new`]
//! with `strict: true`) an illegal `(from, to)` pair is rejected and the
//! caller gets [`crate::error::LoopError::InvalidStateTransition`]; callers
//! that want the performance-oriented variant (spec §4.5: "trusts callers")
//! construct with `strict: false` and the table is not consulted.

use crate::error::LoopError;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// One of the five lifecycle states a [`crate::loop_core::Loop`] can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    /// Constructed, `run()` never called.
    Awake = 0,
    /// Executing tasks/timers/microtasks on the loop thread.
    Running = 1,
    /// Blocked in the I/O poller (check-then-sleep, spec §4.7).
    Sleeping = 2,
    /// Shutdown in progress; no more user work will run.
    Terminating = 3,
    /// Shutdown complete. Terminal.
    Terminated = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Awake,
            1 => LoopState::Running,
            2 => LoopState::Sleeping,
            3 => LoopState::Terminating,
            4 => LoopState::Terminated,
            _ => unreachable!("invalid encoded LoopState"),
        }
    }

    fn is_valid_transition(from: LoopState, to: LoopState) -> bool {
        use LoopState::*;
        matches!(
            (from, to),
            (Awake, Running)
                | (Awake, Terminating)
                | (Running, Sleeping)
                | (Running, Terminating)
                | (Sleeping, Running)
                | (Sleeping, Terminating)
                | (Terminating, Terminated)
        )
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LoopState::Awake => "Awake",
            LoopState::Running => "Running",
            LoopState::Sleeping => "Sleeping",
            LoopState::Terminating => "Terminating",
            LoopState::Terminated => "Terminated",
        };
        write!(f, "{s}")
    }
}

/// An observer notified on every successful transition, for tracing.
pub trait TransitionObserver: Send + Sync {
    fn on_transition(&self, from: LoopState, to: LoopState);
}

/// The loop's atomic lifecycle state, with validated or trusted transitions.
pub struct StateMachine {
    state: AtomicU8,
    strict: bool,
    observer: Option<Arc<dyn TransitionObserver>>,
}

impl StateMachine {
    /// Construct in [`LoopState::Awake`]. `strict` selects the
    /// safety-oriented (validated, fatal on violation) or
    /// performance-oriented (trusting) variant from spec §4.5.
    pub fn new(strict: bool) -> Self {
        Self {
            state: AtomicU8::new(LoopState::Awake as u8),
            strict,
            observer: None,
        }
    }

    /// Install a transition observer (e.g. a tracing span writer).
    pub fn set_observer(&mut self, observer: Arc<dyn TransitionObserver>) {
        self.observer = Some(observer);
    }

    /// Read the current state (acquire).
    pub fn load(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Attempt `from -> to`. On success, notifies the observer and returns
    /// `Ok(())`. On a stale `from` (another thread already moved state),
    /// returns `Ok(())` is *not* returned — the caller gets back the actual
    /// current state via `Err` so it can decide whether to retry; this
    /// mirrors `compare_exchange`'s own contract rather than hiding it.
    pub fn try_transition(&self, from: LoopState, to: LoopState) -> Result<(), LoopState> {
        if self.strict && !LoopState::is_valid_transition(from, to) {
            // An invalid pair is a programmer error, not a race: fail loudly
            // regardless of current state.
            return Err(self.load());
        }
        match self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                if let Some(obs) = &self.observer {
                    obs.on_transition(from, to);
                }
                tracing::trace!(?from, ?to, "loop state transition");
                Ok(())
            }
            Err(actual) => Err(LoopState::from_u8(actual)),
        }
    }

    /// Like [`try_transition`](Self::try_transition) but returns a
    /// [`LoopError::InvalidStateTransition`] for a strict-mode violation
    /// instead of silently refusing, for call sites that must surface the
    /// fatal error to the caller (spec §7.3).
    pub fn transition_or_fatal(&self, from: LoopState, to: LoopState) -> Result<(), LoopError> {
        if self.strict && !LoopState::is_valid_transition(from, to) {
            return Err(LoopError::InvalidStateTransition { from, to });
        }
        self.try_transition(from, to).map_err(|actual| {
            LoopError::InvalidStateTransition { from: actual, to }
        })
    }
}

impl fmt::Debug for StateMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateMachine")
            .field("state", &self.load())
            .field("strict", &self.strict)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn awake_to_running_succeeds() {
        let sm = StateMachine::new(true);
        assert!(sm.try_transition(LoopState::Awake, LoopState::Running).is_ok());
        assert_eq!(sm.load(), LoopState::Running);
    }

    #[test]
    fn awake_to_terminating_is_shutdown_before_start() {
        let sm = StateMachine::new(true);
        assert!(sm
            .try_transition(LoopState::Awake, LoopState::Terminating)
            .is_ok());
        assert_eq!(sm.load(), LoopState::Terminating);
        // Run can no longer succeed its own Awake -> Running.
        assert!(sm
            .try_transition(LoopState::Awake, LoopState::Running)
            .is_err());
    }

    #[test]
    fn strict_mode_rejects_invalid_pair() {
        let sm = StateMachine::new(true);
        // Awake -> Sleeping is not in the table.
        let err = sm
            .transition_or_fatal(LoopState::Awake, LoopState::Sleeping)
            .unwrap_err();
        assert!(matches!(err, LoopError::InvalidStateTransition { .. }));
        // State is unchanged.
        assert_eq!(sm.load(), LoopState::Awake);
    }

    #[test]
    fn non_strict_mode_trusts_caller() {
        let sm = StateMachine::new(false);
        // Still goes through CAS, so the *actual* current value must match
        // `from`, but the table is not consulted.
        assert!(sm
            .try_transition(LoopState::Awake, LoopState::Sleeping)
            .is_ok());
        assert_eq!(sm.load(), LoopState::Sleeping);
    }

    #[test]
    fn terminal_state_has_no_outgoing_transitions() {
        let sm = StateMachine::new(true);
        sm.try_transition(LoopState::Awake, LoopState::Terminating)
            .unwrap();
        sm.try_transition(LoopState::Terminating, LoopState::Terminated)
            .unwrap();
        assert_eq!(sm.load(), LoopState::Terminated);
        assert!(sm
            .transition_or_fatal(LoopState::Terminated, LoopState::Running)
            .is_err());
    }

    #[test]
    fn stale_from_reports_actual_state() {
        let sm = StateMachine::new(true);
        sm.try_transition(LoopState::Awake, LoopState::Running)
            .unwrap();
        let err = sm
            .try_transition(LoopState::Awake, LoopState::Running)
            .unwrap_err();
        assert_eq!(err, LoopState::Running);
    }

    #[test]
    fn observer_is_notified_on_success_only() {
        struct Counter(AtomicUsize);
        impl TransitionObserver for Counter {
            fn on_transition(&self, _from: LoopState, _to: LoopState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
        let counter = Arc::new(Counter(AtomicUsize::new(0)));
        let mut sm = StateMachine::new(true);
        sm.set_observer(counter.clone());

        sm.try_transition(LoopState::Awake, LoopState::Running)
            .unwrap();
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // Failed transition does not notify.
        let _ = sm.try_transition(LoopState::Awake, LoopState::Running);
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_lifecycle_running_to_sleeping_to_running_to_terminating() {
        let sm = StateMachine::new(true);
        sm.try_transition(LoopState::Awake, LoopState::Running).unwrap();
        sm.try_transition(LoopState::Running, LoopState::Sleeping).unwrap();
        sm.try_transition(LoopState::Sleeping, LoopState::Running).unwrap();
        sm.try_transition(LoopState::Running, LoopState::Terminating).unwrap();
        sm.try_transition(LoopState::Terminating, LoopState::Terminated).unwrap();
        assert_eq!(sm.load(), LoopState::Terminated);
    }

    #[test]
    fn display_names() {
        assert_eq!(LoopState::Awake.to_string(), "Awake");
        assert_eq!(LoopState::Terminated.to_string(), "Terminated");
    }
}
