//! File-descriptor readiness watchers (unix).

use crate::event_loop::{EventLoop, LoopCore};
use crate::reactor::FdEvents;
use std::cell::RefCell;
use std::io;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::Instant;

/// Boxed readiness handler.
pub(crate) type FdHandler = Box<dyn FnMut(&mut FdCx<'_>, FdEvents)>;

struct FdSlot {
    gen: u32,
    fd: Option<RawFd>,
    events: FdEvents,
    /// `None` while checked out for invocation.
    handler: Option<FdHandler>,
    live: bool,
}

/// Watcher slot table. Readiness tokens carry the slot generation so events
/// buffered for a watcher that was reset, destroyed, or whose slot was
/// reused inside the same dispatch batch are discarded on delivery.
pub(crate) struct FdTable {
    slots: Vec<FdSlot>,
    free: Vec<usize>,
}

impl FdTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    pub(crate) fn alloc(&mut self, handler: FdHandler) -> usize {
        match self.free.pop() {
            Some(id) => {
                let slot = &mut self.slots[id];
                debug_assert!(!slot.live);
                slot.handler = Some(handler);
                slot.live = true;
                id
            }
            None => {
                self.slots.push(FdSlot {
                    gen: 0,
                    fd: None,
                    events: FdEvents::NONE,
                    handler: Some(handler),
                    live: true,
                });
                self.slots.len() - 1
            }
        }
    }

    /// The readiness token for a slot: generation in the high bits, index
    /// in the low.
    pub(crate) fn token(&self, id: usize) -> usize {
        ((u64::from(self.slots[id].gen) << 32) | id as u64) as usize
    }

    /// Maps a delivered token back to a slot, rejecting stale generations
    /// and watchers that are no longer bound.
    pub(crate) fn resolve(&self, token: usize) -> Option<usize> {
        let id = (token as u64 & 0xffff_ffff) as usize;
        let gen = (token as u64 >> 32) as u32;
        let slot = self.slots.get(id)?;
        (slot.live && slot.gen == gen && slot.fd.is_some()).then_some(id)
    }

    pub(crate) fn fd(&self, id: usize) -> Option<RawFd> {
        self.slots[id].fd
    }

    pub(crate) fn events(&self, id: usize) -> FdEvents {
        self.slots[id].events
    }

    pub(crate) fn bind(&mut self, id: usize, fd: RawFd, events: FdEvents) {
        let slot = &mut self.slots[id];
        slot.fd = Some(fd);
        slot.events = events;
    }

    pub(crate) fn set_events(&mut self, id: usize, events: FdEvents) {
        self.slots[id].events = events;
    }

    pub(crate) fn clear_bound(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        slot.fd = None;
        slot.events = FdEvents::NONE;
    }

    pub(crate) fn checkout(&mut self, id: usize) -> Option<FdHandler> {
        let slot = &mut self.slots[id];
        if slot.live {
            slot.handler.take()
        } else {
            None
        }
    }

    /// Returns a checked-out handler; yields it back when the watcher was
    /// dropped during its own invocation.
    #[must_use]
    pub(crate) fn finish(&mut self, id: usize, handler: FdHandler) -> Option<FdHandler> {
        if self.slots[id].live {
            self.slots[id].handler = Some(handler);
            None
        } else {
            self.free_slot(id);
            Some(handler)
        }
    }

    /// Handle-drop path, mirroring the timer table's deferred reclaim.
    #[must_use]
    pub(crate) fn release(&mut self, id: usize) -> Option<FdHandler> {
        debug_assert!(self.slots[id].fd.is_none(), "release before reset");
        match self.slots[id].handler.take() {
            Some(handler) => {
                self.slots[id].live = false;
                self.free_slot(id);
                Some(handler)
            }
            None => {
                self.slots[id].live = false;
                None
            }
        }
    }

    pub(crate) fn allocated(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    fn free_slot(&mut self, id: usize) {
        let slot = &mut self.slots[id];
        debug_assert!(!slot.live);
        slot.handler = None;
        slot.fd = None;
        slot.events = FdEvents::NONE;
        slot.gen = slot.gen.wrapping_add(1);
        self.free.push(id);
    }
}

impl LoopCore {
    pub(crate) fn fd_init(&mut self, id: usize, fd: RawFd, events: FdEvents) -> io::Result<()> {
        assert!(
            self.fds.fd(id).is_none(),
            "fd watcher is already initialized"
        );
        let token = self.fds.token(id);
        self.reactor.add(fd, token, events)?;
        self.fds.bind(id, fd, events);
        Ok(())
    }

    pub(crate) fn fd_update(&mut self, id: usize, events: FdEvents) -> io::Result<()> {
        let fd = self.fds.fd(id).expect("fd watcher is not initialized");
        if events == self.fds.events(id) {
            return Ok(());
        }
        let token = self.fds.token(id);
        self.reactor.modify(fd, token, events)?;
        self.fds.set_events(id, events);
        Ok(())
    }

    pub(crate) fn fd_reset(&mut self, id: usize) {
        if let Some(fd) = self.fds.fd(id) {
            if let Err(err) = self.reactor.remove(fd) {
                tracing::warn!(fd, error = %err, "failed to deregister fd from reactor");
            }
            self.fds.clear_bound(id);
        }
    }
}

/// A file-descriptor readiness watcher bound to an [`EventLoop`].
///
/// An unset watcher is bound to a descriptor with [`init`](Self::init);
/// from then on the readiness handler runs on the owner thread whenever the
/// reactor reports the watched events. The watcher does not own the
/// descriptor; the caller keeps it open for the lifetime of the watch.
pub struct FdWatcher {
    core: Rc<RefCell<LoopCore>>,
    slot: usize,
}

impl FdWatcher {
    /// Creates an unset watcher whose handler runs on `event_loop`'s owner
    /// thread.
    pub fn new<F>(event_loop: &EventLoop, handler: F) -> Self
    where
        F: FnMut(&mut FdCx<'_>, FdEvents) + 'static,
    {
        let core = event_loop.core_rc();
        let slot = core.borrow_mut().fds.alloc(Box::new(handler));
        Self { core, slot }
    }

    /// Binds the watcher to `fd` with an initial interest set.
    ///
    /// The descriptor must be in non-blocking mode. Panics if the watcher
    /// is already bound.
    ///
    /// # Errors
    ///
    /// Propagates the reactor's registration failure.
    pub fn init(&mut self, fd: RawFd, events: FdEvents) -> io::Result<()> {
        assert!(fd >= 0, "invalid fd");
        self.core.borrow_mut().fd_init(self.slot, fd, events)
    }

    /// Replaces the interest set; a no-op if the set is unchanged.
    ///
    /// Panics if the watcher is unbound.
    ///
    /// # Errors
    ///
    /// Propagates the reactor's modification failure.
    pub fn update_events(&mut self, events: FdEvents) -> io::Result<()> {
        self.core.borrow_mut().fd_update(self.slot, events)
    }

    /// Releases the descriptor from the reactor and returns the watcher to
    /// the unset state. Idempotent; deregistration errors are logged.
    pub fn reset(&mut self) {
        self.core.borrow_mut().fd_reset(self.slot);
    }

    /// The watched descriptor, if bound.
    pub fn fd(&self) -> Option<RawFd> {
        self.core.borrow().fds.fd(self.slot)
    }

    /// The current interest set.
    pub fn events(&self) -> FdEvents {
        self.core.borrow().fds.events(self.slot)
    }

    /// Returns true while the watcher is bound to a descriptor.
    pub fn is_watching(&self) -> bool {
        self.fd().is_some()
    }
}

impl Drop for FdWatcher {
    fn drop(&mut self) {
        self.core.borrow_mut().fd_reset(self.slot);
        let retired = self.core.borrow_mut().fds.release(self.slot);
        drop(retired);
    }
}

impl std::fmt::Debug for FdWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FdWatcher")
            .field("fd", &self.fd())
            .field("events", &self.events())
            .finish()
    }
}

/// Context handed to a readiness handler.
pub struct FdCx<'a> {
    core: &'a Rc<RefCell<LoopCore>>,
    slot: usize,
}

impl<'a> FdCx<'a> {
    pub(crate) fn new(core: &'a Rc<RefCell<LoopCore>>, slot: usize) -> Self {
        Self { core, slot }
    }

    /// The time sampled at the start of the current dispatch round.
    pub fn event_time(&self) -> Instant {
        self.core.borrow().event_time
    }

    /// The watched descriptor.
    pub fn fd(&self) -> Option<RawFd> {
        self.core.borrow().fds.fd(self.slot)
    }

    /// Replaces the interest set of the watcher being dispatched.
    ///
    /// # Errors
    ///
    /// Propagates the reactor's modification failure.
    pub fn update_events(&mut self, events: FdEvents) -> io::Result<()> {
        self.core.borrow_mut().fd_update(self.slot, events)
    }

    /// Unbinds the watcher being dispatched.
    pub fn reset(&mut self) {
        self.core.borrow_mut().fd_reset(self.slot);
    }

    /// Requests loop termination after the current handler returns.
    pub fn stop(&mut self) {
        self.core.borrow_mut().stop = true;
    }
}
