//! The I/O poller (spec §4.3): multiplexes readiness across registered file
//! descriptors and the wake descriptor, behind a trait so the core never
//! names epoll/kqueue/IOCP directly.
//!
//! Two dispatch disciplines are available to an embedder per spec §4.3:
//! *collect-then-execute* (gather every ready callback, then run them all
//! outside the registry lock — required when a callback is allowed to
//! register/unregister FDs of its own) and *execute-under-lock* (run each
//! callback as its readiness is observed — cheaper, but forbids
//! re-entrant registry mutation). [`Poller::poll`] always collects first;
//! running the returned callbacks is the caller's job in `loop_core.rs`,
//! which is what makes collect-then-execute the discipline this crate
//! actually uses.

use crate::error::LoopError;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::time::Duration;

/// Which readiness conditions a registration cares about, and which were
/// observed. A plain bool-field struct rather than the `bitflags` crate —
/// the teacher (`lumen-runtime`) doesn't pull in `bitflags` for its own
/// small enums, and four named fields read at least as clearly as a mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !(self.readable || self.writable || self.error || self.hangup)
    }

    fn from_mio(event: &mio::event::Event) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_hup(),
        }
    }

    fn to_interest(self) -> Interest {
        match (self.readable, self.writable) {
            (true, true) => Interest::READABLE.add(Interest::WRITABLE),
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }
}

/// The callback invoked when a registered FD reports readiness. Handed the
/// observed [`Readiness`].
pub type IoCallback = Box<dyn FnMut(Readiness) + Send + 'static>;

struct Registration {
    interest: Readiness,
    callback: IoCallback,
}

/// Reserved token for the wake descriptor; FD tokens start at 1.
pub(crate) const WAKE_TOKEN: Token = Token(0);

/// Upper bound a descriptor value must stay under to be registrable.
/// `token_for_fd` maps `fd` to `Token(fd as usize + 1)`, so a negative or
/// absurdly large `fd` would either wrap or blow past any realistic
/// `RLIMIT_NOFILE` — reject it up front rather than handing `mio` garbage.
const MAX_FD: i32 = 1 << 20;

/// The trait the loop core drives. The only implementation shipped is
/// [`MioPoller`]; the trait exists so `loop_core.rs` depends on a seam, not
/// a concrete backend (spec Design Notes: "dynamic dispatch via tagged
/// function objects/trait objects" at every platform boundary).
pub trait IoPoller {
    fn register(&mut self, fd: i32, interest: Readiness, callback: IoCallback) -> Result<(), LoopError>;
    fn modify(&mut self, fd: i32, interest: Readiness) -> Result<(), LoopError>;
    fn unregister(&mut self, fd: i32) -> Result<(), LoopError>;
    /// Block for up to `timeout`, then collect every ready callback as
    /// `(fd, readiness)` pairs without invoking them. Returns `true` if the
    /// wake descriptor itself fired (a plain interrupt, not an FD event).
    fn poll(&mut self, timeout: Option<Duration>) -> Result<PollOutcome, LoopError>;
    fn close(&mut self) -> Result<(), LoopError>;
}

impl MioPoller {
    /// Invoke the callback registered for `fd` with the given readiness, if
    /// still registered. Used by the tick cycle's collect-then-execute
    /// dispatch (spec §4.3): `poll()` only collects `(fd, Readiness)`
    /// pairs; running the callbacks outside the poll call is what lets a
    /// callback register/unregister other FDs without re-entering `mio`
    /// mid-poll.
    pub fn invoke_callback(&mut self, fd: i32, readiness: Readiness) {
        if let Some(reg) = self.registrations.get_mut(&fd) {
            (reg.callback)(readiness);
        }
    }
}

/// What one [`IoPoller::poll`] call observed.
pub struct PollOutcome {
    /// FDs that became ready, in no particular order (the caller — the tick
    /// cycle — is responsible for any ordering guarantees it needs).
    pub ready: Vec<(i32, Readiness)>,
    pub woken: bool,
}

/// The production poller, backed by `mio::Poll`/`mio::Events`.
pub struct MioPoller {
    poll: Poll,
    events: Events,
    registrations: HashMap<i32, Registration>,
    closed: bool,
}

impl MioPoller {
    pub fn new(capacity: usize) -> Result<Self, LoopError> {
        let poll = Poll::new().map_err(|e| LoopError::Fatal(format!("failed to create poller: {e}")))?;
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            registrations: HashMap::new(),
            closed: false,
        })
    }

    /// Access to the underlying `Poll`, needed once at construction time to
    /// register the wake descriptor (see [`crate::wake::MioWakeHandle::create`]).
    pub fn raw(&self) -> &Poll {
        &self.poll
    }

    fn token_for_fd(fd: i32) -> Token {
        // Token 0 is reserved for the wake descriptor; shift every FD token
        // up by one so an fd of 0 (stdin) doesn't collide with it.
        Token(fd as usize + 1)
    }

    fn fd_for_token(token: Token) -> i32 {
        (token.0 - 1) as i32
    }
}

impl IoPoller for MioPoller {
    fn register(&mut self, fd: i32, interest: Readiness, callback: IoCallback) -> Result<(), LoopError> {
        if self.closed {
            return Err(LoopError::PollerClosed("poller already closed".into()));
        }
        if fd < 0 || fd > MAX_FD {
            return Err(LoopError::FdOutOfRange(fd));
        }
        if self.registrations.contains_key(&fd) {
            return Err(LoopError::FdAlreadyRegistered(fd));
        }
        let mut source = mio::unix::SourceFd(&fd);
        self.poll
            .registry()
            .register(&mut source, Self::token_for_fd(fd), interest.to_interest())
            .map_err(|e| LoopError::Fatal(format!("register fd {fd} failed: {e}")))?;
        self.registrations.insert(fd, Registration { interest, callback });
        Ok(())
    }

    fn modify(&mut self, fd: i32, interest: Readiness) -> Result<(), LoopError> {
        if fd < 0 || fd > MAX_FD {
            return Err(LoopError::FdOutOfRange(fd));
        }
        if !self.registrations.contains_key(&fd) {
            return Err(LoopError::FdNotRegistered(fd));
        }
        let mut source = mio::unix::SourceFd(&fd);
        self.poll
            .registry()
            .reregister(&mut source, Self::token_for_fd(fd), interest.to_interest())
            .map_err(|e| LoopError::Fatal(format!("modify fd {fd} failed: {e}")))?;
        if let Some(reg) = self.registrations.get_mut(&fd) {
            reg.interest = interest;
        }
        Ok(())
    }

    fn unregister(&mut self, fd: i32) -> Result<(), LoopError> {
        if self.registrations.remove(&fd).is_none() {
            return Err(LoopError::FdNotRegistered(fd));
        }
        let mut source = mio::unix::SourceFd(&fd);
        self.poll
            .registry()
            .deregister(&mut source)
            .map_err(|e| LoopError::Fatal(format!("unregister fd {fd} failed: {e}")))?;
        Ok(())
    }

    fn poll(&mut self, timeout: Option<Duration>) -> Result<PollOutcome, LoopError> {
        if self.closed {
            return Err(LoopError::PollerClosed("poller already closed".into()));
        }
        loop {
            match self.poll.poll(&mut self.events, timeout) {
                Ok(()) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(LoopError::PollerClosed(e.to_string())),
            }
        }

        let mut ready = Vec::new();
        let mut woken = false;
        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                woken = true;
                continue;
            }
            let fd = Self::fd_for_token(event.token());
            ready.push((fd, Readiness::from_mio(event)));
        }
        Ok(PollOutcome { ready, woken })
    }

    fn close(&mut self) -> Result<(), LoopError> {
        self.registrations.clear();
        self.closed = true;
        Ok(())
    }
}

impl std::fmt::Debug for MioPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MioPoller")
            .field("registered", &self.registrations.len())
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_duplicate_fd_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        // Use a real fd (stdin) so mio's registration path is exercised;
        // duplicate detection happens before mio ever sees the second call.
        poller.register(0, Readiness { readable: true, ..Default::default() }, Box::new(|_| {})).ok();
        let second = poller.register(0, Readiness { readable: true, ..Default::default() }, Box::new(|_| {}));
        assert!(matches!(second, Err(LoopError::FdAlreadyRegistered(0))));
    }

    #[test]
    fn modify_unknown_fd_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        let err = poller.modify(99, Readiness::default()).unwrap_err();
        assert!(matches!(err, LoopError::FdNotRegistered(99)));
    }

    #[test]
    fn register_negative_fd_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        let err = poller.register(-1, Readiness::default(), Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, LoopError::FdOutOfRange(-1)));
    }

    #[test]
    fn register_fd_past_the_bound_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        let err = poller
            .register(MAX_FD + 1, Readiness::default(), Box::new(|_| {}))
            .unwrap_err();
        assert!(matches!(err, LoopError::FdOutOfRange(_)));
    }

    #[test]
    fn unregister_unknown_fd_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        let err = poller.unregister(99).unwrap_err();
        assert!(matches!(err, LoopError::FdNotRegistered(99)));
    }

    #[test]
    fn poll_after_close_is_rejected() {
        let mut poller = MioPoller::new(16).unwrap();
        poller.close().unwrap();
        let err = poller.poll(Some(Duration::from_millis(1))).unwrap_err();
        assert!(matches!(err, LoopError::PollerClosed(_)));
    }

    #[test]
    fn readiness_empty_check() {
        assert!(Readiness::default().is_empty());
        assert!(!Readiness { readable: true, ..Default::default() }.is_empty());
    }

    #[test]
    fn poll_with_short_timeout_and_no_registrations_returns_quickly() {
        let mut poller = MioPoller::new(16).unwrap();
        let outcome = poller.poll(Some(Duration::from_millis(5))).unwrap();
        assert!(outcome.ready.is_empty());
        assert!(!outcome.woken);
    }
}
