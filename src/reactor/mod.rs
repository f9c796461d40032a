//! Reactor abstraction for OS readiness multiplexing.
//!
//! The event loop core is backend-agnostic: everything platform-specific
//! sits behind the [`Reactor`] trait. A reactor watches file descriptors,
//! blocks until the earliest of (i) a wait deadline, (ii) fd readiness,
//! (iii) a cross-thread wakeup, and hands buffered [`Event`]s back to the
//! loop for dispatch on the owner thread.
//!
//! # Key Types
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`Reactor`] | Trait for readiness backends |
//! | [`ReactorWaker`] | Any-thread, edge-triggered wait interruption |
//! | [`FdEvents`] | Readiness/interest flags |
//! | [`Event`] | Single readiness notification |
//! | [`Events`] | Reusable container for wait results |
//! | [`WaitTimeout`] | Wake deadline plus reprogramming hint |
//!
//! # Shipped Backends
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | [`PollReactor`] | `poll.rs` | Production (epoll/kqueue via `polling`) |
//! | [`LabReactor`] | `lab.rs` | Tests (injected events, wake counting) |
//!
//! # Waker Contract
//!
//! [`ReactorWaker::wake`] must be callable from any thread and must
//! interrupt a concurrent [`Reactor::wait`]. Wakeups are edge-triggered:
//! the loop invokes the waker at most once per quiescent→signaled
//! transition of its async-signal queue, so implementations need not
//! coalesce, but spurious `wait` returns are always permitted.

pub mod lab;
#[cfg(unix)]
pub mod poll;

pub use lab::{LabHandle, LabReactor};
#[cfg(unix)]
pub use poll::PollReactor;

use std::io;
use std::ops::{BitOr, BitOrAssign};
#[cfg(unix)]
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Readiness and interest flags for a watched file descriptor.
///
/// The same type expresses what a watcher wants to observe and what a
/// reactor reports as ready. `ERROR` and `HUP` are delivered regardless of
/// the requested interest when the backend can distinguish them; backends
/// that cannot (the `polling`-based one) fold them into readable/writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdEvents(u8);

impl FdEvents {
    /// No events.
    pub const NONE: FdEvents = FdEvents(0);
    /// The descriptor is (or should be watched for becoming) readable.
    pub const READABLE: FdEvents = FdEvents(0b0001);
    /// The descriptor is (or should be watched for becoming) writable.
    pub const WRITABLE: FdEvents = FdEvents(0b0010);
    /// An error condition was reported.
    pub const ERROR: FdEvents = FdEvents(0b0100);
    /// The peer hung up.
    pub const HUP: FdEvents = FdEvents(0b1000);

    /// Returns readable-and-writable interest.
    #[must_use]
    pub const fn both() -> Self {
        FdEvents(0b0011)
    }

    /// Returns true if no flag is set.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns true if the readable flag is set.
    #[must_use]
    pub const fn is_readable(&self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    /// Returns true if the writable flag is set.
    #[must_use]
    pub const fn is_writable(&self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// Returns true if the error flag is set.
    #[must_use]
    pub const fn is_error(&self) -> bool {
        self.0 & Self::ERROR.0 != 0
    }

    /// Returns true if the hangup flag is set.
    #[must_use]
    pub const fn is_hup(&self) -> bool {
        self.0 & Self::HUP.0 != 0
    }

    /// Combines flag sets.
    #[must_use]
    pub const fn add(self, other: FdEvents) -> Self {
        FdEvents(self.0 | other.0)
    }

    /// Removes flags.
    #[must_use]
    pub const fn remove(self, other: FdEvents) -> Self {
        FdEvents(self.0 & !other.0)
    }

    /// Returns true if every flag in `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: FdEvents) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FdEvents {
    type Output = FdEvents;

    fn bitor(self, rhs: FdEvents) -> FdEvents {
        self.add(rhs)
    }
}

impl BitOrAssign for FdEvents {
    fn bitor_assign(&mut self, rhs: FdEvents) {
        *self = self.add(rhs);
    }
}

/// A single readiness notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    /// Token identifying the registration that became ready.
    pub token: usize,
    /// The readiness flags that triggered.
    pub ready: FdEvents,
}

impl Event {
    /// Creates an event with the given token and readiness flags.
    #[must_use]
    pub const fn new(token: usize, ready: FdEvents) -> Self {
        Self { token, ready }
    }

    /// Creates a readable event.
    #[must_use]
    pub const fn readable(token: usize) -> Self {
        Self::new(token, FdEvents::READABLE)
    }

    /// Creates a writable event.
    #[must_use]
    pub const fn writable(token: usize) -> Self {
        Self::new(token, FdEvents::WRITABLE)
    }
}

/// Reusable container for the readiness events of one wait.
///
/// The capacity bounds how many events a single wait can buffer; events
/// pushed beyond it are dropped (level-triggered backends re-deliver on the
/// next wait, so nothing is permanently lost). Reuse across waits avoids
/// allocation in steady state.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
    capacity: usize,
}

impl Events {
    /// Creates an events buffer with the given capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an event, dropping it silently once the buffer is full.
    pub fn push(&mut self, event: Event) {
        if self.inner.len() < self.capacity {
            self.inner.push(event);
        }
    }

    /// Removes all events, keeping the allocation.
    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Returns the number of buffered events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if no events are buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns the buffer capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterates over the buffered events.
    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.inner.iter()
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Wake deadline handed to [`Reactor::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitTimeout {
    /// Absolute wake deadline; `None` means wait indefinitely.
    pub deadline: Option<Instant>,
    /// True if `deadline` differs from the previous wait's deadline.
    ///
    /// Backends that program a timer object (a timerfd, say) can skip the
    /// reprogramming syscall when this is false; poll-style backends may
    /// ignore it.
    pub changed: bool,
}

impl WaitTimeout {
    /// Converts the deadline to a relative timeout as seen from `now`.
    ///
    /// A deadline already in the past yields `Some(Duration::ZERO)`, i.e. a
    /// non-blocking wait.
    #[must_use]
    pub fn duration_from(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }
}

/// Any-thread handle that interrupts a blocking [`Reactor::wait`].
pub trait ReactorWaker: Send + Sync {
    /// Wakes the reactor. Idempotent; must not block.
    fn wake(&self) -> io::Result<()>;
}

/// Readiness backend driven by the event loop.
///
/// The loop owns its reactor and calls it only from the owner thread; the
/// sole cross-thread entry point is the [`ReactorWaker`] obtained from
/// [`waker()`](Reactor::waker). Implementations are free to deliver
/// spurious empty waits.
pub trait Reactor {
    /// Returns the cross-thread waker paired with this reactor.
    fn waker(&self) -> Arc<dyn ReactorWaker>;

    /// Blocks until the deadline passes, a watched fd becomes ready, or the
    /// waker fires, then buffers any ready events.
    ///
    /// Returns the number of events pushed into `events`. Waking with zero
    /// events is normal (deadline expiry, wakeup, or spurious return).
    fn wait(&mut self, timeout: WaitTimeout, events: &mut Events) -> io::Result<usize>;

    /// Starts watching `fd`, reporting readiness under `token`.
    #[cfg(unix)]
    fn add(&mut self, fd: RawFd, token: usize, events: FdEvents) -> io::Result<()>;

    /// Replaces the interest set of a watched fd.
    #[cfg(unix)]
    fn modify(&mut self, fd: RawFd, token: usize, events: FdEvents) -> io::Result<()>;

    /// Stops watching `fd`.
    #[cfg(unix)]
    fn remove(&mut self, fd: RawFd) -> io::Result<()>;
}
