//! Deterministic reactor for testing.
//!
//! [`LabReactor`] implements the [`Reactor`] contract without touching the
//! OS. Readiness events are injected by the test through a [`LabHandle`],
//! waits block on a condvar honoring the real-time deadline, and the
//! backend records exactly what the loop asked of it:
//!
//! - every `(deadline, changed)` pair handed to `wait` ([`LabHandle::waits`]);
//! - every cross-thread wakeup ([`LabHandle::wake_count`]), which is how
//!   tests pin down the edge-triggered wakeup contract.

use super::{Event, Events, FdEvents, Reactor, ReactorWaker, WaitTimeout};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
#[cfg(unix)]
use std::collections::HashMap;
use std::io;
#[cfg(unix)]
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// One recorded call to [`Reactor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitRecord {
    /// The absolute deadline the loop asked to sleep until.
    pub deadline: Option<Instant>,
    /// The reprogramming hint that accompanied it.
    pub changed: bool,
}

#[derive(Debug, Default)]
struct LabState {
    ready: VecDeque<Event>,
    notified: bool,
    waits: Vec<WaitRecord>,
    #[cfg(unix)]
    registered: HashMap<RawFd, (usize, FdEvents)>,
}

#[derive(Debug)]
struct LabShared {
    state: Mutex<LabState>,
    cond: Condvar,
    wakes: AtomicU64,
}

/// Test reactor with injected readiness and instrumented waits.
#[derive(Debug)]
pub struct LabReactor {
    shared: Arc<LabShared>,
}

/// Cloneable test-side handle to a [`LabReactor`].
#[derive(Debug, Clone)]
pub struct LabHandle {
    shared: Arc<LabShared>,
}

impl LabReactor {
    /// Creates a lab reactor with no registrations and no pending events.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(LabShared {
                state: Mutex::new(LabState::default()),
                cond: Condvar::new(),
                wakes: AtomicU64::new(0),
            }),
        }
    }

    /// Returns a handle for injecting events and inspecting the reactor.
    #[must_use]
    pub fn handle(&self) -> LabHandle {
        LabHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for LabReactor {
    fn default() -> Self {
        Self::new()
    }
}

impl LabHandle {
    /// Queues a readiness event for delivery by the next wait and unblocks
    /// a wait already in progress.
    pub fn inject_ready(&self, token: usize, ready: FdEvents) {
        let mut state = self.shared.state.lock();
        state.ready.push_back(Event::new(token, ready));
        self.shared.cond.notify_all();
    }

    /// Returns how many times the reactor waker has fired.
    #[must_use]
    pub fn wake_count(&self) -> u64 {
        self.shared.wakes.load(Ordering::SeqCst)
    }

    /// Returns the recorded wait calls, oldest first.
    #[must_use]
    pub fn waits(&self) -> Vec<WaitRecord> {
        self.shared.state.lock().waits.clone()
    }

    /// Returns the number of registered descriptors.
    #[cfg(unix)]
    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.shared.state.lock().registered.len()
    }

    /// Returns the interest currently registered for `fd`, if any.
    #[cfg(unix)]
    #[must_use]
    pub fn registered_events(&self, fd: RawFd) -> Option<FdEvents> {
        self.shared
            .state
            .lock()
            .registered
            .get(&fd)
            .map(|(_, events)| *events)
    }

    /// Returns the token registered for `fd`, if any. This is the token to
    /// pass to [`inject_ready`](Self::inject_ready).
    #[cfg(unix)]
    #[must_use]
    pub fn registered_token(&self, fd: RawFd) -> Option<usize> {
        self.shared
            .state
            .lock()
            .registered
            .get(&fd)
            .map(|(token, _)| *token)
    }
}

struct LabWaker(Arc<LabShared>);

impl ReactorWaker for LabWaker {
    fn wake(&self) -> io::Result<()> {
        self.0.wakes.fetch_add(1, Ordering::SeqCst);
        let mut state = self.0.state.lock();
        state.notified = true;
        self.0.cond.notify_all();
        Ok(())
    }
}

impl Reactor for LabReactor {
    fn waker(&self) -> Arc<dyn ReactorWaker> {
        Arc::new(LabWaker(Arc::clone(&self.shared)))
    }

    fn wait(&mut self, timeout: WaitTimeout, events: &mut Events) -> io::Result<usize> {
        let mut state = self.shared.state.lock();
        state.waits.push(WaitRecord {
            deadline: timeout.deadline,
            changed: timeout.changed,
        });

        loop {
            if !state.ready.is_empty() {
                let mut count = 0;
                while events.len() < events.capacity() {
                    let Some(event) = state.ready.pop_front() else {
                        break;
                    };
                    events.push(event);
                    count += 1;
                }
                return Ok(count);
            }
            if state.notified {
                state.notified = false;
                return Ok(0);
            }
            match timeout.deadline {
                Some(deadline) => {
                    if Instant::now() >= deadline {
                        return Ok(0);
                    }
                    if self.shared.cond.wait_until(&mut state, deadline).timed_out() {
                        return Ok(0);
                    }
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    #[cfg(unix)]
    fn add(&mut self, fd: RawFd, token: usize, events: FdEvents) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.registered.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered",
            ));
        }
        state.registered.insert(fd, (token, events));
        Ok(())
    }

    #[cfg(unix)]
    fn modify(&mut self, fd: RawFd, token: usize, events: FdEvents) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        match state.registered.get_mut(&fd) {
            Some(entry) => {
                *entry = (token, events);
                Ok(())
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered",
            )),
        }
    }

    #[cfg(unix)]
    fn remove(&mut self, fd: RawFd) -> io::Result<()> {
        let mut state = self.shared.state.lock();
        if state.registered.remove(&fd).is_none() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn wait_returns_on_deadline() {
        let mut reactor = LabReactor::new();
        let mut events = Events::with_capacity(8);

        let start = Instant::now();
        let n = reactor
            .wait(
                WaitTimeout {
                    deadline: Some(start + Duration::from_millis(30)),
                    changed: true,
                },
                &mut events,
            )
            .expect("wait failed");
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn injected_event_delivered() {
        let mut reactor = LabReactor::new();
        let handle = reactor.handle();
        handle.inject_ready(5, FdEvents::READABLE);

        let mut events = Events::with_capacity(8);
        let n = reactor
            .wait(
                WaitTimeout {
                    deadline: Some(Instant::now() + Duration::from_secs(1)),
                    changed: true,
                },
                &mut events,
            )
            .expect("wait failed");
        assert_eq!(n, 1);
        let ev = events.iter().next().expect("one event");
        assert_eq!(ev.token, 5);
        assert!(ev.ready.is_readable());
    }

    #[test]
    fn wake_interrupts_and_counts() {
        let mut reactor = LabReactor::new();
        let handle = reactor.handle();
        let waker = reactor.waker();

        std::thread::scope(|s| {
            s.spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                waker.wake().expect("wake failed");
            });

            let mut events = Events::with_capacity(8);
            let start = Instant::now();
            let n = reactor
                .wait(
                    WaitTimeout {
                        deadline: Some(start + Duration::from_secs(5)),
                        changed: true,
                    },
                    &mut events,
                )
                .expect("wait failed");
            assert_eq!(n, 0);
            assert!(start.elapsed() < Duration::from_secs(1));
        });

        assert_eq!(handle.wake_count(), 1);
    }

    #[test]
    fn wake_before_wait_consumed_once() {
        let mut reactor = LabReactor::new();
        let waker = reactor.waker();
        waker.wake().expect("wake failed");

        let mut events = Events::with_capacity(8);
        // First wait consumes the notification without blocking.
        let start = Instant::now();
        reactor
            .wait(
                WaitTimeout {
                    deadline: Some(start + Duration::from_secs(5)),
                    changed: true,
                },
                &mut events,
            )
            .expect("wait failed");
        assert!(start.elapsed() < Duration::from_millis(100));

        // Second wait blocks until its deadline again.
        let start = Instant::now();
        reactor
            .wait(
                WaitTimeout {
                    deadline: Some(start + Duration::from_millis(20)),
                    changed: false,
                },
                &mut events,
            )
            .expect("wait failed");
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn records_wait_deadlines() {
        let mut reactor = LabReactor::new();
        let handle = reactor.handle();
        let mut events = Events::with_capacity(8);

        let d1 = Instant::now() + Duration::from_millis(5);
        reactor
            .wait(WaitTimeout { deadline: Some(d1), changed: true }, &mut events)
            .expect("wait failed");
        reactor
            .wait(WaitTimeout { deadline: Some(d1), changed: false }, &mut events)
            .expect("wait failed");

        let waits = handle.waits();
        assert_eq!(waits.len(), 2);
        assert_eq!(waits[0], WaitRecord { deadline: Some(d1), changed: true });
        assert_eq!(waits[1], WaitRecord { deadline: Some(d1), changed: false });
    }

    #[cfg(unix)]
    #[test]
    fn registration_bookkeeping() {
        let mut reactor = LabReactor::new();
        let handle = reactor.handle();

        reactor.add(10, 1, FdEvents::READABLE).expect("add failed");
        assert_eq!(handle.registered_count(), 1);
        assert_eq!(handle.registered_events(10), Some(FdEvents::READABLE));

        reactor
            .modify(10, 1, FdEvents::both())
            .expect("modify failed");
        assert_eq!(handle.registered_events(10), Some(FdEvents::both()));

        assert!(reactor.add(10, 2, FdEvents::READABLE).is_err());
        reactor.remove(10).expect("remove failed");
        assert!(reactor.remove(10).is_err());
        assert_eq!(handle.registered_count(), 0);
    }
}
