//! User-owned timer handle and the expiry handler context.

use crate::event_loop::{EventLoop, LoopCore};
use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// A one-shot timer bound to an [`EventLoop`].
///
/// The handle owns the registration: dropping it cancels the timer and
/// releases its slot, from anywhere, including from inside its own expiry
/// handler. All methods must be called on the loop's owner thread; the
/// handle is `!Send` by construction.
///
/// The expiry handler runs on the owner thread and receives a [`TimerCx`]
/// for rescheduling the firing timer and controlling the loop. A timer
/// re-armed from its own handler never fires twice in one dispatch round.
pub struct Timer {
    core: Rc<RefCell<LoopCore>>,
    slot: usize,
}

impl Timer {
    /// Creates an unset timer whose handler will run on `event_loop`'s
    /// owner thread when the timer expires.
    pub fn new<F>(event_loop: &EventLoop, handler: F) -> Self
    where
        F: FnMut(&mut TimerCx<'_>) + 'static,
    {
        let core = event_loop.core_rc();
        let slot = {
            let mut core_ref = core.borrow_mut();
            let origin = core_ref.event_time;
            core_ref.timers.alloc(Box::new(handler), origin)
        };
        Self { core, slot }
    }

    /// Arms the timer to expire at an absolute monotonic time.
    ///
    /// A deadline already in the past is legal; the timer fires on the next
    /// dispatch round. Re-arming an armed timer replaces its deadline.
    pub fn set_at(&mut self, deadline: Instant) {
        self.core.borrow_mut().timers.set_at(self.slot, deadline);
    }

    /// Arms the timer relative to the loop's current event time.
    pub fn set_after(&mut self, after: Duration) {
        let mut core = self.core.borrow_mut();
        let deadline = core.event_time + after;
        core.timers.set_at(self.slot, deadline);
    }

    /// Disarms the timer. No-op if it is not armed.
    pub fn unset(&mut self) {
        self.core.borrow_mut().timers.unset(self.slot);
    }

    /// Returns true while the timer is armed.
    pub fn is_set(&self) -> bool {
        self.core.borrow().timers.is_set(self.slot)
    }

    /// Returns the armed deadline, or `None` while unset.
    pub fn deadline(&self) -> Option<Instant> {
        self.core.borrow().timers.deadline(self.slot)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        // Drop a retired handler outside the loop borrow: its captures may
        // own further handles.
        let retired = self.core.borrow_mut().timers.release(self.slot);
        drop(retired);
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("slot", &self.slot)
            .field("is_set", &self.is_set())
            .finish()
    }
}

/// Context handed to a timer's expiry handler.
///
/// Scheduling methods act on the firing timer itself; other timers are
/// reached through whatever handles the closure captured.
pub struct TimerCx<'a> {
    core: &'a Rc<RefCell<LoopCore>>,
    slot: usize,
}

impl<'a> TimerCx<'a> {
    pub(crate) fn new(core: &'a Rc<RefCell<LoopCore>>, slot: usize) -> Self {
        Self { core, slot }
    }

    /// The time sampled at the start of the current dispatch round.
    pub fn event_time(&self) -> Instant {
        self.core.borrow().event_time
    }

    /// Re-arms the firing timer at an absolute deadline.
    pub fn set_at(&mut self, deadline: Instant) {
        self.core.borrow_mut().timers.set_at(self.slot, deadline);
    }

    /// Re-arms the firing timer relative to the current event time.
    pub fn set_after(&mut self, after: Duration) {
        let mut core = self.core.borrow_mut();
        let deadline = core.event_time + after;
        core.timers.set_at(self.slot, deadline);
    }

    /// Disarms the firing timer (it already is, unless re-armed).
    pub fn unset(&mut self) {
        self.core.borrow_mut().timers.unset(self.slot);
    }

    /// Returns true if the firing timer has been re-armed.
    pub fn is_set(&self) -> bool {
        self.core.borrow().timers.is_set(self.slot)
    }

    /// Requests loop termination after the current handler returns.
    pub fn stop(&mut self) {
        self.core.borrow_mut().stop = true;
    }
}
