//! Production readiness backend on top of the `polling` crate.
//!
//! [`PollReactor`] wraps a [`polling::Poller`] (epoll on Linux, kqueue on
//! the BSDs and macOS) and adapts it to the [`Reactor`] contract:
//!
//! - the loop's absolute wake deadline becomes a relative `wait` timeout,
//!   re-derived every round (the `changed` hint is not needed here);
//! - the poller's built-in `notify()` serves as the cross-thread waker;
//! - `polling` registrations are oneshot, so delivered descriptors are
//!   re-armed with their current interest before the events are handed
//!   back, restoring persistent level-triggered watching.
//!
//! Registered descriptors must be in non-blocking mode, per the `polling`
//! crate's requirements.

use super::{Event, Events, FdEvents, Reactor, ReactorWaker, WaitTimeout};
use polling::{Event as PollEvent, Poller};
use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Instant;

/// Registration state for one watched descriptor, keyed by token.
#[derive(Debug, Clone, Copy)]
struct FdRegistration {
    fd: RawFd,
    events: FdEvents,
}

/// Readiness backend multiplexing via `polling::Poller`.
pub struct PollReactor {
    poller: Arc<Poller>,
    /// Token → registration, used for oneshot re-arming.
    registered: HashMap<usize, FdRegistration>,
    /// Scratch buffer for raw poller events.
    buf: Vec<PollEvent>,
}

impl PollReactor {
    /// Creates a reactor with a fresh poller instance.
    ///
    /// # Errors
    ///
    /// Fails if the OS multiplexer cannot be created (e.g. the process is
    /// out of file descriptors).
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poller: Arc::new(Poller::new()?),
            registered: HashMap::new(),
            buf: Vec::new(),
        })
    }

    /// Returns the number of watched descriptors.
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.registered.len()
    }

    fn poll_event(token: usize, events: FdEvents) -> PollEvent {
        match (events.is_readable(), events.is_writable()) {
            (true, true) => PollEvent::all(token),
            (true, false) => PollEvent::readable(token),
            (false, true) => PollEvent::writable(token),
            (false, false) => PollEvent::none(token),
        }
    }

    fn ready_events(event: &PollEvent) -> FdEvents {
        let mut ready = FdEvents::NONE;
        if event.readable {
            ready |= FdEvents::READABLE;
        }
        if event.writable {
            ready |= FdEvents::WRITABLE;
        }
        ready
    }
}

struct PollWaker(Arc<Poller>);

impl ReactorWaker for PollWaker {
    fn wake(&self) -> io::Result<()> {
        self.0.notify()
    }
}

impl Reactor for PollReactor {
    fn waker(&self) -> Arc<dyn ReactorWaker> {
        Arc::new(PollWaker(Arc::clone(&self.poller)))
    }

    fn wait(&mut self, timeout: WaitTimeout, events: &mut Events) -> io::Result<usize> {
        let relative = timeout.duration_from(Instant::now());

        self.buf.clear();
        match self.poller.wait(&mut self.buf, relative) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(err) => return Err(err),
        }

        let mut count = 0;
        for raw in &self.buf {
            let Some(reg) = self.registered.get(&raw.key).copied() else {
                // Deregistered between readiness and delivery.
                continue;
            };
            // Oneshot registration has been consumed; re-arm it.
            self.poller
                .modify(reg.fd, Self::poll_event(raw.key, reg.events))?;

            let ready = Self::ready_events(raw);
            if ready.is_empty() {
                continue;
            }
            events.push(Event::new(raw.key, ready));
            count += 1;
        }

        Ok(count)
    }

    fn add(&mut self, fd: RawFd, token: usize, fd_events: FdEvents) -> io::Result<()> {
        if self.registered.contains_key(&token) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "token already registered",
            ));
        }
        self.poller.add(fd, Self::poll_event(token, fd_events))?;
        self.registered.insert(token, FdRegistration { fd, events: fd_events });
        Ok(())
    }

    fn modify(&mut self, fd: RawFd, token: usize, fd_events: FdEvents) -> io::Result<()> {
        let reg = self.registered.get_mut(&token).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "token not registered")
        })?;
        debug_assert_eq!(reg.fd, fd);
        self.poller.modify(fd, Self::poll_event(token, fd_events))?;
        reg.events = fd_events;
        Ok(())
    }

    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let token = self
            .registered
            .iter()
            .find(|(_, reg)| reg.fd == fd)
            .map(|(token, _)| *token)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "fd not registered"))?;
        self.registered.remove(&token);
        self.poller.delete(fd)?;
        Ok(())
    }
}

impl std::fmt::Debug for PollReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PollReactor")
            .field("registered", &self.registered.len())
            .finish_non_exhaustive()
    }
}
