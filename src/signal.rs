//! Cross-thread async signals.
//!
//! An [`AsyncSignal`] lets any thread wake the loop and have a callback run
//! on the owner thread. The queue is two index-linked lists over a slot
//! table behind one `parking_lot::Mutex`: signaled registrations collect on
//! the *pending* list; at drain time the loop splices the whole pending
//! list onto the *dispatch* list in O(1) and unlinks entries one at a time,
//! releasing the mutex around every callback. Signals raised during a drain
//! therefore land on the (now empty) pending list and are served in a later
//! batch.
//!
//! The mutex protects linkage only. Callbacks live on the loop side in
//! [`SignalSlots`], outside the lock, so they need not be `Send` and a
//! callback may freely signal or reset any registration without deadlock.
//!
//! Waking is edge-triggered: only the `signal()` call that turns the
//! pending list non-empty invokes the reactor waker, keeping bursts of
//! signals at one syscall.

use crate::event_loop::{EventLoop, LoopCore};
use crate::reactor::ReactorWaker;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

/// Boxed signal callback.
pub(crate) type SignalHandler = Box<dyn FnMut(&mut SignalCx<'_>)>;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Membership {
    Detached,
    Queued,
}

#[derive(Debug, Clone, Copy)]
struct LinkSlot {
    gen: u32,
    membership: Membership,
    prev: u32,
    next: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ListHead {
    head: u32,
    tail: u32,
}

impl ListHead {
    const EMPTY: ListHead = ListHead { head: NIL, tail: NIL };

    fn is_empty(self) -> bool {
        self.head == NIL
    }
}

#[derive(Debug)]
struct QueueInner {
    slots: Vec<LinkSlot>,
    free: Vec<u32>,
    pending: ListHead,
    dispatch: ListHead,
}

impl QueueInner {
    fn push_pending(&mut self, id: u32) {
        let tail = self.pending.tail;
        {
            let slot = &mut self.slots[id as usize];
            slot.membership = Membership::Queued;
            slot.prev = tail;
            slot.next = NIL;
        }
        if tail == NIL {
            self.pending.head = id;
        } else {
            self.slots[tail as usize].next = id;
        }
        self.pending.tail = id;
    }

    fn unlink(&mut self, id: u32) {
        let slot = self.slots[id as usize];
        debug_assert_eq!(slot.membership, Membership::Queued);

        if slot.prev == NIL {
            if self.pending.head == id {
                self.pending.head = slot.next;
            } else {
                debug_assert_eq!(self.dispatch.head, id);
                self.dispatch.head = slot.next;
            }
        } else {
            self.slots[slot.prev as usize].next = slot.next;
        }
        if slot.next == NIL {
            if self.pending.tail == id {
                self.pending.tail = slot.prev;
            } else {
                debug_assert_eq!(self.dispatch.tail, id);
                self.dispatch.tail = slot.prev;
            }
        } else {
            self.slots[slot.next as usize].prev = slot.prev;
        }

        let slot = &mut self.slots[id as usize];
        slot.membership = Membership::Detached;
        slot.prev = NIL;
        slot.next = NIL;
    }
}

/// Linkage side of the async-signal machinery, shared across threads.
pub(crate) struct SignalQueue {
    inner: Mutex<QueueInner>,
    waker: Arc<dyn ReactorWaker>,
}

impl SignalQueue {
    pub(crate) fn new(waker: Arc<dyn ReactorWaker>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                slots: Vec::new(),
                free: Vec::new(),
                pending: ListHead::EMPTY,
                dispatch: ListHead::EMPTY,
            }),
            waker,
        }
    }

    pub(crate) fn alloc(&self) -> (u32, u32) {
        let mut inner = self.inner.lock();
        match inner.free.pop() {
            Some(id) => (id, inner.slots[id as usize].gen),
            None => {
                inner.slots.push(LinkSlot {
                    gen: 0,
                    membership: Membership::Detached,
                    prev: NIL,
                    next: NIL,
                });
                ((inner.slots.len() - 1) as u32, 0)
            }
        }
    }

    /// Frees a registration. The slot generation is bumped so stale senders
    /// become no-ops.
    pub(crate) fn release(&self, id: u32, gen: u32) {
        let mut inner = self.inner.lock();
        let slot = inner.slots[id as usize];
        debug_assert_eq!(slot.gen, gen);
        if slot.membership == Membership::Queued {
            inner.unlink(id);
        }
        inner.slots[id as usize].gen = gen.wrapping_add(1);
        inner.free.push(id);
    }

    /// Enqueues the registration unless it already is queued, waking the
    /// reactor exactly on the pending list's empty→non-empty transition.
    pub(crate) fn signal(&self, id: u32, gen: u32) -> io::Result<()> {
        let wake = {
            let mut inner = self.inner.lock();
            let slot = inner.slots[id as usize];
            if slot.gen != gen || slot.membership == Membership::Queued {
                return Ok(());
            }
            let was_empty = inner.pending.is_empty();
            inner.push_pending(id);
            was_empty
        };
        if wake {
            self.waker.wake()?;
        }
        Ok(())
    }

    /// Unlinks the registration from whichever list holds it. Idempotent.
    pub(crate) fn detach(&self, id: u32, gen: u32) {
        let mut inner = self.inner.lock();
        let slot = inner.slots[id as usize];
        if slot.gen == gen && slot.membership == Membership::Queued {
            inner.unlink(id);
        }
    }

    /// Splices the pending list onto the (empty) dispatch list.
    ///
    /// Returns false when there is nothing to drain.
    pub(crate) fn begin_drain(&self) -> bool {
        let mut inner = self.inner.lock();
        debug_assert!(inner.dispatch.is_empty());
        if inner.pending.is_empty() {
            return false;
        }
        inner.dispatch = inner.pending;
        inner.pending = ListHead::EMPTY;
        true
    }

    /// Unlinks and detaches the dispatch-list head for callback delivery.
    pub(crate) fn pop_dispatch(&self) -> Option<(u32, u32)> {
        let mut inner = self.inner.lock();
        let id = inner.dispatch.head;
        if id == NIL {
            return None;
        }
        inner.unlink(id);
        Some((id, inner.slots[id as usize].gen))
    }

    /// True when both lists are lonely (no registration queued).
    pub(crate) fn is_quiescent(&self) -> bool {
        let inner = self.inner.lock();
        inner.pending.is_empty() && inner.dispatch.is_empty()
    }

    #[cfg(test)]
    fn pending_order(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut order = Vec::new();
        let mut id = inner.pending.head;
        while id != NIL {
            order.push(id);
            id = inner.slots[id as usize].next;
        }
        order
    }
}

impl std::fmt::Debug for SignalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("SignalQueue")
            .field("slots", &inner.slots.len())
            .field("pending", &!inner.pending.is_empty())
            .finish_non_exhaustive()
    }
}

/// Owner-thread callback storage, indexed by queue slot id.
pub(crate) struct SignalSlots {
    slots: Vec<SigSlot>,
}

struct SigSlot {
    /// `None` while checked out for invocation (or after release).
    handler: Option<SignalHandler>,
    live: bool,
}

impl SignalSlots {
    pub(crate) fn new() -> Self {
        Self { slots: Vec::new() }
    }

    pub(crate) fn install(&mut self, id: u32, handler: SignalHandler) {
        let idx = id as usize;
        while self.slots.len() <= idx {
            self.slots.push(SigSlot {
                handler: None,
                live: false,
            });
        }
        debug_assert!(!self.slots[idx].live);
        self.slots[idx] = SigSlot {
            handler: Some(handler),
            live: true,
        };
    }

    pub(crate) fn checkout(&mut self, id: u32) -> Option<SignalHandler> {
        let slot = &mut self.slots[id as usize];
        if slot.live {
            slot.handler.take()
        } else {
            None
        }
    }

    /// Returns a checked-out handler; yields it back when the registration
    /// was dropped during its own callback.
    #[must_use]
    pub(crate) fn finish(&mut self, id: u32, handler: SignalHandler) -> Option<SignalHandler> {
        let slot = &mut self.slots[id as usize];
        if slot.live {
            slot.handler = Some(handler);
            None
        } else {
            Some(handler)
        }
    }

    /// Handle-drop path. Returns the handler box unless it is currently
    /// checked out, in which case the drain loop reclaims the slot.
    #[must_use]
    pub(crate) fn release(&mut self, id: u32) -> Option<SignalHandler> {
        let slot = &mut self.slots[id as usize];
        slot.live = false;
        slot.handler.take()
    }
}

/// A cross-thread signal bound to an [`EventLoop`].
///
/// `signal()` marks the registration pending and wakes the loop; the
/// callback runs on the owner thread during the loop's next signal drain.
/// Repeated signals before the drain coalesce into one callback. Use
/// [`sender()`](AsyncSignal::sender) to signal from other threads.
///
/// The handle owns the registration and must be dropped on the owner
/// thread, and not from inside its own callback.
pub struct AsyncSignal {
    core: Rc<RefCell<LoopCore>>,
    queue: Arc<SignalQueue>,
    id: u32,
    gen: u32,
}

impl AsyncSignal {
    /// Creates a signal whose callback runs on `event_loop`'s owner thread.
    pub fn new<F>(event_loop: &EventLoop, handler: F) -> Self
    where
        F: FnMut(&mut SignalCx<'_>) + 'static,
    {
        let core = event_loop.core_rc();
        let queue = event_loop.queue_arc();
        let (id, gen) = queue.alloc();
        core.borrow_mut().signals.install(id, Box::new(handler));
        Self {
            core,
            queue,
            id,
            gen,
        }
    }

    /// Requests a callback invocation. Callable from the owner thread; for
    /// other threads, use a [`SignalSender`].
    ///
    /// # Errors
    ///
    /// Propagates a reactor waker failure from the edge-triggered wakeup.
    pub fn signal(&self) -> io::Result<()> {
        self.queue.signal(self.id, self.gen)
    }

    /// Withdraws a not-yet-delivered signal. Idempotent.
    pub fn reset(&mut self) {
        self.queue.detach(self.id, self.gen);
    }

    /// Returns a cloneable, `Send + Sync` signaling handle.
    #[must_use]
    pub fn sender(&self) -> SignalSender {
        SignalSender {
            queue: Arc::clone(&self.queue),
            id: self.id,
            gen: self.gen,
        }
    }
}

impl Drop for AsyncSignal {
    fn drop(&mut self) {
        let retired = self.core.borrow_mut().signals.release(self.id);
        match retired {
            Some(handler) => {
                self.queue.release(self.id, self.gen);
                drop(handler);
            }
            // Checked out: the drain loop frees queue slot and handler.
            None => self.queue.detach(self.id, self.gen),
        }
    }
}

impl std::fmt::Debug for AsyncSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSignal").field("id", &self.id).finish()
    }
}

/// Any-thread signaling facet of an [`AsyncSignal`].
///
/// Senders outliving their signal are harmless: signaling a released
/// registration is a no-op.
#[derive(Clone)]
pub struct SignalSender {
    queue: Arc<SignalQueue>,
    id: u32,
    gen: u32,
}

impl SignalSender {
    /// Requests a callback invocation on the loop's owner thread.
    ///
    /// # Errors
    ///
    /// Propagates a reactor waker failure from the edge-triggered wakeup.
    pub fn signal(&self) -> io::Result<()> {
        self.queue.signal(self.id, self.gen)
    }
}

impl std::fmt::Debug for SignalSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalSender").field("id", &self.id).finish()
    }
}

/// Context handed to a signal callback.
pub struct SignalCx<'a> {
    core: &'a Rc<RefCell<LoopCore>>,
    queue: &'a Arc<SignalQueue>,
    id: u32,
    gen: u32,
}

impl<'a> SignalCx<'a> {
    pub(crate) fn new(
        core: &'a Rc<RefCell<LoopCore>>,
        queue: &'a Arc<SignalQueue>,
        id: u32,
        gen: u32,
    ) -> Self {
        Self {
            core,
            queue,
            id,
            gen,
        }
    }

    /// The time sampled at the start of the current dispatch round.
    pub fn event_time(&self) -> Instant {
        self.core.borrow().event_time
    }

    /// Re-signals the callback's own registration; it will fire again in a
    /// later drain batch, never the current one.
    ///
    /// # Errors
    ///
    /// Propagates a reactor waker failure from the edge-triggered wakeup.
    pub fn signal(&mut self) -> io::Result<()> {
        self.queue.signal(self.id, self.gen)
    }

    /// Withdraws a pending re-signal of the callback's own registration.
    pub fn reset(&mut self) {
        self.queue.detach(self.id, self.gen);
    }

    /// Requests loop termination after the current callback returns.
    pub fn stop(&mut self) {
        self.core.borrow_mut().stop = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingWaker(AtomicU64);

    impl ReactorWaker for CountingWaker {
        fn wake(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn queue() -> (SignalQueue, Arc<CountingWaker>) {
        let waker = Arc::new(CountingWaker(AtomicU64::new(0)));
        (SignalQueue::new(waker.clone()), waker)
    }

    #[test]
    fn fifo_order_and_coalescing() {
        let (queue, _waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();
        let (c, gc) = queue.alloc();

        queue.signal(b, gb).expect("signal");
        queue.signal(a, ga).expect("signal");
        queue.signal(c, gc).expect("signal");
        // Signaling an already-queued registration is a no-op.
        queue.signal(a, ga).expect("signal");

        assert_eq!(queue.pending_order(), vec![b, a, c]);

        assert!(queue.begin_drain());
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(b));
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(a));
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(c));
        assert_eq!(queue.pop_dispatch(), None);
        assert!(queue.is_quiescent());
    }

    #[test]
    fn wake_fires_once_per_batch() {
        let (queue, waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();

        queue.signal(a, ga).expect("signal");
        queue.signal(b, gb).expect("signal");
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);

        assert!(queue.begin_drain());
        while queue.pop_dispatch().is_some() {}

        // The pending list went empty again; the next signal re-arms the wake.
        queue.signal(a, ga).expect("signal");
        assert_eq!(waker.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn signals_during_drain_defer_to_next_batch() {
        let (queue, _waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();

        queue.signal(a, ga).expect("signal");
        assert!(queue.begin_drain());
        let popped = queue.pop_dispatch().expect("a queued");
        assert_eq!(popped.0, a);

        // Mid-drain signals land on the pending list, not the batch.
        queue.signal(b, gb).expect("signal");
        queue.signal(a, ga).expect("signal");
        assert_eq!(queue.pop_dispatch(), None);

        assert_eq!(queue.pending_order(), vec![b, a]);
        assert!(queue.begin_drain());
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(b));
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(a));
    }

    #[test]
    fn detach_withdraws_pending_signal() {
        let (queue, _waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();

        queue.signal(a, ga).expect("signal");
        queue.signal(b, gb).expect("signal");
        queue.detach(a, ga);
        // Idempotent.
        queue.detach(a, ga);

        assert_eq!(queue.pending_order(), vec![b]);
        assert!(queue.begin_drain());
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(b));
        assert_eq!(queue.pop_dispatch(), None);
    }

    #[test]
    fn detach_removes_from_dispatch_batch() {
        let (queue, _waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();

        queue.signal(a, ga).expect("signal");
        queue.signal(b, gb).expect("signal");
        assert!(queue.begin_drain());

        // A callback dropping a sibling unlinks it from the batch.
        queue.detach(b, gb);
        assert_eq!(queue.pop_dispatch().map(|(id, _)| id), Some(a));
        assert_eq!(queue.pop_dispatch(), None);
    }

    #[test]
    fn stale_generation_is_inert() {
        let (queue, waker) = queue();
        let (a, ga) = queue.alloc();
        queue.release(a, ga);

        // The slot is reused with a bumped generation.
        let (b, gb) = queue.alloc();
        assert_eq!(a, b);
        assert_ne!(ga, gb);

        queue.signal(a, ga).expect("signal");
        assert_eq!(waker.0.load(Ordering::SeqCst), 0);
        assert!(queue.is_quiescent());

        queue.signal(b, gb).expect("signal");
        assert_eq!(waker.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn release_unlinks_queued_entry() {
        let (queue, _waker) = queue();
        let (a, ga) = queue.alloc();
        let (b, gb) = queue.alloc();
        queue.signal(a, ga).expect("signal");
        queue.signal(b, gb).expect("signal");

        queue.release(a, ga);
        assert_eq!(queue.pending_order(), vec![b]);
        queue.release(b, gb);
        assert!(queue.is_quiescent());
    }

    #[test]
    fn signal_slots_checkout_lifecycle() {
        let mut slots = SignalSlots::new();
        slots.install(0, Box::new(|_cx: &mut SignalCx<'_>| {}));

        let handler = slots.checkout(0).expect("installed");
        assert!(slots.checkout(0).is_none());
        assert!(slots.finish(0, handler).is_none());

        // Released mid-callback: finish hands the box back for disposal.
        let handler = slots.checkout(0).expect("restored");
        assert!(slots.release(0).is_none());
        assert!(slots.finish(0, handler).is_some());
        assert!(slots.checkout(0).is_none());
    }
}
