//! The wake primitive (spec §4.3, Design Notes): a 3-method trait abstracting
//! the platform wake descriptor (eventfd on Linux, kqueue `EVFILT_USER` on
//! BSD/macOS, IOCP completion packet on Windows) an external producer uses to
//! interrupt the loop thread while it's blocked in the poller.
//!
//! The core never touches a raw fd/handle directly; it only ever calls
//! through [`WakeHandle`]. The concrete implementation here wraps
//! [`mio::Waker`], the cross-platform primitive the pack's own manifests
//! (`asterism-labs-hadron`, `chainflip-io-chainflip-backend`,
//! `wasmerio-wasmer`) already depend on for exactly this purpose.

use crate::error::LoopError;
use mio::{Poll, Token, Waker};
use std::sync::Arc;

/// A handle an external thread (or the loop itself, to wake its own poll
/// from a just-armed timer) uses to interrupt a blocked [`crate::poller`].
///
/// Implementations must be cheap to clone (typically an `Arc` internally)
/// and safe to call from any thread, including the loop thread itself.
pub trait WakeHandle: Send + Sync {
    /// Construct a new handle registered against `poll` under `token`. The
    /// poller must have been created with the matching registry before this
    /// is called.
    fn create(poll: &Poll, token: Token) -> Result<Self, LoopError>
    where
        Self: Sized;

    /// Signal the handle: wakes a blocked `poll()` exactly once. Signalling
    /// an already-signalled-but-undrained handle is a no-op, not an error —
    /// the wake is a level, not an edge (spec §4.3).
    fn signal(&self) -> Result<(), LoopError>;

    /// Acknowledge a delivered wake. For `mio::Waker` there is nothing to
    /// drain (the wake arrives as a normal readiness event the poller already
    /// consumes), so this is a no-op for the provided implementation — the
    /// method exists so self-pipe-style backends have somewhere to read the
    /// single byte without special-casing the call site.
    fn drain(&self);
}

/// The production [`WakeHandle`], backed by `mio::Waker`.
pub struct MioWakeHandle {
    waker: Arc<Waker>,
}

impl MioWakeHandle {
    /// Construct directly from an existing `Arc<Waker>`, for call sites that
    /// already share one waker across multiple handles (e.g. the loop handing
    /// out clones to several embedder worker threads).
    pub fn from_waker(waker: Arc<Waker>) -> Self {
        Self { waker }
    }
}

impl WakeHandle for MioWakeHandle {
    fn create(poll: &Poll, token: Token) -> Result<Self, LoopError> {
        let waker = Waker::new(poll.registry(), token)
            .map_err(|e| LoopError::Fatal(format!("failed to create wake handle: {e}")))?;
        Ok(Self {
            waker: Arc::new(waker),
        })
    }

    fn signal(&self) -> Result<(), LoopError> {
        self.waker
            .wake()
            .map_err(|e| LoopError::Fatal(format!("wake signal failed: {e}")))
    }

    fn drain(&self) {}
}

impl Clone for MioWakeHandle {
    fn clone(&self) -> Self {
        Self {
            waker: Arc::clone(&self.waker),
        }
    }
}

impl std::fmt::Debug for MioWakeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioWakeHandle").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Events;
    use std::time::Duration;

    #[test]
    fn signal_wakes_a_blocked_poll() {
        let poll = Poll::new().expect("poll");
        let handle = MioWakeHandle::create(&poll, Token(0)).expect("create wake handle");

        let mut poll = poll;
        handle.signal().unwrap();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(5)))
            .expect("poll should return promptly after signal");
        assert!(events.iter().count() >= 1);
    }

    #[test]
    fn clone_shares_the_same_underlying_waker() {
        let poll = Poll::new().expect("poll");
        let handle = MioWakeHandle::create(&poll, Token(0)).expect("create wake handle");
        let cloned = handle.clone();

        let mut poll = poll;
        cloned.signal().unwrap();

        let mut events = Events::with_capacity(8);
        poll.poll(&mut events, Some(Duration::from_secs(5))).unwrap();
        assert!(events.iter().count() >= 1);
    }

    #[test]
    fn drain_is_a_harmless_noop() {
        let poll = Poll::new().expect("poll");
        let handle = MioWakeHandle::create(&poll, Token(0)).expect("create wake handle");
        handle.drain();
        handle.drain();
    }
}
