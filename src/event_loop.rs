//! The event loop: dispatch rounds over timers, async signals and fd
//! readiness, and the blocking wait between them.
//!
//! # Round Structure
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ run()                                                      │
//! │   event_time = now()                                       │
//! │   mark due timers          (Pending → Dispatch)            │
//! │   dispatch timers          (handlers, stop honored)        │
//! │   dispatch events:                                         │
//! │     drain async signals    (batched, FIFO, mutex dropped)  │
//! │     deliver fd readiness   (buffered by the last wait)     │
//! │   next deadline            (retire TempUnset/TempSet)      │
//! │   reactor.wait(deadline)   (blocks; any event wakes)       │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every handler runs on the owner thread with no loop state borrowed, so
//! it may freely arm, cancel or destroy any handle, including the one
//! being dispatched. `stop()` is checked after each individual handler.

use crate::reactor::{Events, Reactor, WaitTimeout};
use crate::signal::{SignalCx, SignalQueue, SignalSlots};
use crate::timer::TimerCx;
use crate::timer_heap::{TimerState, TimerTable};
#[cfg(unix)]
use crate::fd::{FdCx, FdTable};
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

/// Default capacity of the readiness buffer handed to the reactor.
const DEFAULT_EVENTS_CAPACITY: usize = 1024;

/// Monotonic counters describing what a loop has dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Dispatch rounds started.
    pub rounds: u64,
    /// Timer expiry handlers invoked.
    pub timers_fired: u64,
    /// Async-signal callbacks invoked.
    pub signals_fired: u64,
    /// Non-empty async-signal drain batches.
    pub signal_batches: u64,
    /// Fd readiness handlers invoked.
    pub fd_events: u64,
}

/// Mutable loop state. Borrowed only between handler invocations; never
/// across one.
pub(crate) struct LoopCore {
    pub(crate) timers: TimerTable,
    pub(crate) signals: SignalSlots,
    #[cfg(unix)]
    pub(crate) fds: FdTable,
    pub(crate) reactor: Box<dyn Reactor>,
    pub(crate) ready: Events,
    pub(crate) stop: bool,
    pub(crate) event_time: Instant,
    pub(crate) last_wait: Option<Instant>,
    pub(crate) stats: LoopStats,
}

/// Configuration for an [`EventLoop`].
pub struct LoopBuilder {
    reactor: Option<Box<dyn Reactor>>,
    events_capacity: usize,
}

impl LoopBuilder {
    fn new() -> Self {
        Self {
            reactor: None,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
        }
    }

    /// Selects the readiness backend. Defaults to [`PollReactor`] on unix.
    ///
    /// [`PollReactor`]: crate::reactor::PollReactor
    #[must_use]
    pub fn reactor(mut self, reactor: impl Reactor + 'static) -> Self {
        self.reactor = Some(Box::new(reactor));
        self
    }

    /// Caps how many readiness events one wait may buffer.
    #[must_use]
    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = capacity;
        self
    }

    /// Builds the loop.
    ///
    /// # Errors
    ///
    /// Fails if the default reactor cannot be created, or on platforms
    /// without a default reactor when none was configured.
    pub fn build(self) -> io::Result<EventLoop> {
        let reactor = match self.reactor {
            Some(reactor) => reactor,
            None => default_reactor()?,
        };
        let waker = reactor.waker();
        let now = Instant::now();
        debug!(events_capacity = self.events_capacity, "event loop created");
        Ok(EventLoop {
            core: Rc::new(RefCell::new(LoopCore {
                timers: TimerTable::new(),
                signals: SignalSlots::new(),
                #[cfg(unix)]
                fds: FdTable::new(),
                reactor,
                ready: Events::with_capacity(self.events_capacity),
                stop: false,
                event_time: now,
                last_wait: None,
                stats: LoopStats::default(),
            })),
            queue: Arc::new(SignalQueue::new(waker)),
        })
    }
}

impl Default for LoopBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
fn default_reactor() -> io::Result<Box<dyn Reactor>> {
    Ok(Box::new(crate::reactor::PollReactor::new()?))
}

#[cfg(not(unix))]
fn default_reactor() -> io::Result<Box<dyn Reactor>> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "no default reactor for this platform; configure one on the builder",
    ))
}

/// A single-threaded event loop over timers, async signals and fd
/// readiness.
///
/// The loop and every handle bound to it belong to one owner thread; the
/// types are `!Send`, so the compiler enforces this. The only operation
/// reaching the loop from other threads is [`SignalSender::signal`].
///
/// The loop must outlive its handles: drop every [`Timer`], [`AsyncSignal`]
/// and [`FdWatcher`] before the loop. Teardown asserts (in debug builds)
/// that no timer is armed and no signal is queued.
///
/// [`Timer`]: crate::Timer
/// [`AsyncSignal`]: crate::AsyncSignal
/// [`FdWatcher`]: crate::FdWatcher
/// [`SignalSender::signal`]: crate::SignalSender::signal
pub struct EventLoop {
    core: Rc<RefCell<LoopCore>>,
    queue: Arc<SignalQueue>,
}

impl EventLoop {
    /// Creates a loop with the platform default reactor.
    ///
    /// # Errors
    ///
    /// Fails if the OS multiplexer cannot be created.
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        Self::builder().build()
    }

    /// Returns a configuration builder.
    #[must_use]
    pub fn builder() -> LoopBuilder {
        LoopBuilder::new()
    }

    /// Reads the monotonic clock.
    #[must_use]
    pub fn now() -> Instant {
        Instant::now()
    }

    /// The time sampled at the start of the current (or last) dispatch
    /// round. Timer deadlines armed with `set_after` are relative to this.
    #[must_use]
    pub fn event_time(&self) -> Instant {
        self.core.borrow().event_time
    }

    /// Requests termination: `run()` returns once the currently running
    /// handler (if any) completes. Level-triggered and permanent.
    pub fn stop(&self) {
        debug!("event loop stop requested");
        self.core.borrow_mut().stop = true;
    }

    /// Returns true once [`stop`](Self::stop) has been requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.core.borrow().stop
    }

    /// Dispatch counters.
    #[must_use]
    pub fn stats(&self) -> LoopStats {
        self.core.borrow().stats
    }

    /// Number of currently armed timers.
    #[must_use]
    pub fn armed_timers(&self) -> usize {
        self.core.borrow().timers.armed()
    }

    /// Runs dispatch rounds until [`stop`](Self::stop) is requested.
    ///
    /// Returns immediately if the loop is already stopped. Handlers run on
    /// the calling thread; the call blocks in the reactor between rounds.
    ///
    /// # Errors
    ///
    /// Propagates reactor failures. The loop state stays consistent and
    /// `run()` may be called again.
    pub fn run(&mut self) -> io::Result<()> {
        if self.core.borrow().stop {
            return Ok(());
        }
        loop {
            {
                let mut core = self.core.borrow_mut();
                let now = Instant::now();
                core.event_time = now;
                core.stats.rounds += 1;
                let marked = core.timers.mark_expired(now);
                if marked > 0 {
                    trace!(marked, "timers selected for dispatch");
                }
            }

            if !dispatch_timers(&self.core) {
                return Ok(());
            }
            if !dispatch_events(&self.core, &self.queue) {
                return Ok(());
            }

            let mut core = self.core.borrow_mut();
            let deadline = core.timers.next_wake();
            let changed = deadline != core.last_wait;
            core.last_wait = deadline;
            let LoopCore { reactor, ready, .. } = &mut *core;
            ready.clear();
            reactor.wait(WaitTimeout { deadline, changed }, ready)?;
        }
    }

    pub(crate) fn core_rc(&self) -> Rc<RefCell<LoopCore>> {
        Rc::clone(&self.core)
    }

    pub(crate) fn queue_arc(&self) -> Arc<SignalQueue> {
        Arc::clone(&self.queue)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if cfg!(debug_assertions) {
            let core = self.core.borrow();
            assert!(
                core.timers.heap_is_empty(),
                "timers still armed at loop teardown"
            );
            assert!(
                self.queue.is_quiescent(),
                "async signals still queued at loop teardown"
            );
        }
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.core.borrow();
        let mut out = f.debug_struct("EventLoop");
        out.field("armed_timers", &core.timers.armed())
            .field("timer_handles", &core.timers.allocated())
            .field("stopped", &core.stop)
            .field("stats", &core.stats);
        #[cfg(unix)]
        out.field("fd_watchers", &core.fds.allocated());
        out.finish_non_exhaustive()
    }
}

/// Fires every timer marked for this round, honoring `stop` after each
/// handler. Returns false iff `stop` was observed.
fn dispatch_timers(core: &Rc<RefCell<LoopCore>>) -> bool {
    loop {
        let id = {
            let core_ref = core.borrow();
            match core_ref.timers.first() {
                Some(id) if core_ref.timers.state(id) == TimerState::Dispatch => id,
                _ => return true,
            }
        };

        let mut handler = core.borrow_mut().timers.begin_dispatch(id);
        let mut cx = TimerCx::new(core, id);
        handler(&mut cx);
        drop(cx);

        // A handler dropped from inside its own invocation is disposed of
        // here, outside the loop borrow.
        let retired = core.borrow_mut().timers.finish_dispatch(id, handler);
        drop(retired);

        let stop = {
            let mut core_ref = core.borrow_mut();
            core_ref.stats.timers_fired += 1;
            core_ref.stop
        };
        if stop {
            return false;
        }
    }
}

/// Drains one batch of async signals, then delivers buffered fd readiness.
/// Returns false iff `stop` was observed.
fn dispatch_events(core: &Rc<RefCell<LoopCore>>, queue: &Arc<SignalQueue>) -> bool {
    if !dispatch_async_signals(core, queue) {
        return false;
    }
    #[cfg(unix)]
    if !dispatch_fd_events(core) {
        return false;
    }
    true
}

fn dispatch_async_signals(core: &Rc<RefCell<LoopCore>>, queue: &Arc<SignalQueue>) -> bool {
    if !queue.begin_drain() {
        return true;
    }
    core.borrow_mut().stats.signal_batches += 1;

    while let Some((id, gen)) = queue.pop_dispatch() {
        let Some(mut handler) = core.borrow_mut().signals.checkout(id) else {
            continue;
        };
        let mut cx = SignalCx::new(core, queue, id, gen);
        handler(&mut cx);
        drop(cx);

        let retired = core.borrow_mut().signals.finish(id, handler);
        if let Some(handler) = retired {
            // The registration was dropped inside its own callback; finish
            // the reclamation its drop deferred.
            queue.release(id, gen);
            drop(handler);
        }

        let stop = {
            let mut core_ref = core.borrow_mut();
            core_ref.stats.signals_fired += 1;
            core_ref.stop
        };
        if stop {
            return false;
        }
    }
    true
}

#[cfg(unix)]
fn dispatch_fd_events(core: &Rc<RefCell<LoopCore>>) -> bool {
    // The buffer is moved out so handlers can borrow the core freely.
    let batch = {
        let mut core_ref = core.borrow_mut();
        std::mem::replace(&mut core_ref.ready, Events::with_capacity(0))
    };

    let mut stopped = false;
    for event in batch.iter() {
        let event = *event;
        let id = core.borrow().fds.resolve(event.token);
        let Some(id) = id else {
            // Stale: the watcher was reset or destroyed earlier this batch.
            continue;
        };
        let Some(mut handler) = core.borrow_mut().fds.checkout(id) else {
            continue;
        };
        let mut cx = FdCx::new(core, id);
        handler(&mut cx, event.ready);
        drop(cx);

        let retired = core.borrow_mut().fds.finish(id, handler);
        drop(retired);

        let stop = {
            let mut core_ref = core.borrow_mut();
            core_ref.stats.fd_events += 1;
            core_ref.stop
        };
        if stop {
            stopped = true;
            break;
        }
    }

    let mut batch = batch;
    batch.clear();
    core.borrow_mut().ready = batch;
    !stopped
}
