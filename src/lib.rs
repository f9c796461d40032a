//! Microloop: a single-threaded event loop core for user-space network
//! stacks and other latency-sensitive I/O programs.
//!
//! # Overview
//!
//! One owner thread drives three primitives behind a single run loop:
//!
//! - **Timers**: monotonic deadlines in an ordered structure with
//!   arm/cancel/re-arm in O(log n). Expiry handlers may freely reschedule,
//!   cancel or destroy any timer, including the one currently firing.
//! - **Fd watchers** (unix): readiness callbacks multiplexed through the
//!   OS facility behind a pluggable [`reactor::Reactor`] backend.
//! - **Async signals**: the one cross-thread entry point; any thread may
//!   [`signal()`](SignalSender::signal) to wake the loop and enqueue a
//!   callback, with a single edge-triggered wakeup per burst.
//!
//! Each round of [`EventLoop::run`] dispatches due timers, drains one batch
//! of async signals, delivers buffered fd readiness, then blocks in the
//! reactor until the next deadline or event. [`EventLoop::stop`] ends the
//! loop cooperatively after the current handler.
//!
//! # Example
//!
//! ```no_run
//! use microloop::{EventLoop, Timer};
//! use std::time::Duration;
//!
//! let mut event_loop = EventLoop::new()?;
//! let mut tick = Timer::new(&event_loop, |cx| {
//!     println!("tick");
//!     cx.stop();
//! });
//! tick.set_after(Duration::from_millis(100));
//! event_loop.run()?;
//! # Ok::<(), std::io::Error>(())
//! ```
//!
//! # Threading
//!
//! `EventLoop` and its handles are `!Send`; everything happens on the owner
//! thread except [`SignalSender`], which is `Send + Sync`. The loop must
//! outlive every handle bound to it.
//!
//! # Module Structure
//!
//! - [`reactor`]: backend seam plus the shipped `PollReactor`/`LabReactor`
//! - `event_loop`: the run loop and dispatch phases
//! - `timer` / `timer_heap`: timer handles and the deadline heap
//! - `signal`: the cross-thread async-signal queue
//! - `fd` (unix): fd readiness watchers

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod event_loop;
#[cfg(unix)]
mod fd;
pub mod reactor;
mod signal;
mod timer;
mod timer_heap;

pub use event_loop::{EventLoop, LoopBuilder, LoopStats};
#[cfg(unix)]
pub use fd::{FdCx, FdWatcher};
pub use reactor::{Event, Events, FdEvents, Reactor, ReactorWaker, WaitTimeout};
pub use signal::{AsyncSignal, SignalCx, SignalSender};
pub use timer::{Timer, TimerCx};
