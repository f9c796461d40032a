//! Fd readiness scenarios: an end-to-end watch over the OS backend and
//! lab-backed delivery, interest updates and stale-event suppression.

#![cfg(unix)]

mod common;

use microloop::reactor::{FdEvents, LabReactor};
use microloop::{EventLoop, FdWatcher, Timer};
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

fn stream_pair() -> (UnixStream, UnixStream) {
    let (a, b) = UnixStream::pair().expect("failed to create unix stream pair");
    a.set_nonblocking(true).expect("nonblocking");
    b.set_nonblocking(true).expect("nonblocking");
    (a, b)
}

#[test]
fn readiness_dispatch_end_to_end() {
    common::init_test_logging();
    let mut event_loop = EventLoop::new().expect("failed to build loop");
    let (reader, writer) = stream_pair();

    let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let mut watcher = FdWatcher::new(&event_loop, {
        let received = Rc::clone(&received);
        let reader = reader.try_clone().expect("clone reader");
        move |cx, events| {
            assert!(events.is_readable());
            let mut buf = [0u8; 16];
            let n = (&reader).read(&mut buf).expect("read");
            received.borrow_mut().extend_from_slice(&buf[..n]);
            cx.stop();
        }
    });
    watcher
        .init(reader.as_raw_fd(), FdEvents::READABLE)
        .expect("init watcher");
    assert!(watcher.is_watching());

    // Produce readiness from a timer a few milliseconds in.
    let mut sender = Timer::new(&event_loop, {
        let writer = writer.try_clone().expect("clone writer");
        move |_cx| (&writer).write_all(b"ping").expect("write")
    });
    sender.set_after(Duration::from_millis(10));

    event_loop.run().expect("run failed");

    assert_eq!(received.borrow().as_slice(), b"ping");
    assert_eq!(event_loop.stats().fd_events, 1);
    assert_eq!(watcher.events(), FdEvents::READABLE);
}

#[test]
fn injected_readiness_reaches_watcher() {
    common::init_test_logging();
    let reactor = LabReactor::new();
    let lab = reactor.handle();
    let mut event_loop = EventLoop::builder()
        .reactor(reactor)
        .build()
        .expect("failed to build loop");

    let fired = Rc::new(Cell::new(false));
    let mut watcher = FdWatcher::new(&event_loop, {
        let fired = Rc::clone(&fired);
        move |cx, events| {
            assert!(events.is_readable());
            fired.set(true);
            cx.stop();
        }
    });
    watcher.init(42, FdEvents::READABLE).expect("init watcher");

    let token = lab.registered_token(42).expect("registered");
    lab.inject_ready(token, FdEvents::READABLE);

    event_loop.run().expect("run failed");
    assert!(fired.get());
    assert_eq!(event_loop.stats().fd_events, 1);
}

#[test]
fn update_events_propagates_to_reactor() {
    common::init_test_logging();
    let reactor = LabReactor::new();
    let lab = reactor.handle();
    let event_loop = EventLoop::builder()
        .reactor(reactor)
        .build()
        .expect("failed to build loop");

    let mut watcher = FdWatcher::new(&event_loop, |_cx, _events| {});
    watcher.init(7, FdEvents::READABLE).expect("init watcher");
    assert_eq!(lab.registered_events(7), Some(FdEvents::READABLE));

    watcher.update_events(FdEvents::both()).expect("update");
    assert_eq!(lab.registered_events(7), Some(FdEvents::both()));
    assert_eq!(watcher.events(), FdEvents::both());

    // Unchanged interest never reaches the reactor.
    watcher.update_events(FdEvents::both()).expect("update");
    assert_eq!(lab.registered_events(7), Some(FdEvents::both()));

    watcher.reset();
    assert!(!watcher.is_watching());
    assert_eq!(lab.registered_count(), 0);

    // A reset watcher can be bound again.
    watcher.init(8, FdEvents::WRITABLE).expect("re-init watcher");
    assert_eq!(lab.registered_events(8), Some(FdEvents::WRITABLE));
    watcher.reset();
}

#[test]
fn reset_suppresses_buffered_events() {
    common::init_test_logging();
    let reactor = LabReactor::new();
    let lab = reactor.handle();
    let mut event_loop = EventLoop::builder()
        .reactor(reactor)
        .build()
        .expect("failed to build loop");

    let fired = Rc::new(Cell::new(false));
    let mut watcher = FdWatcher::new(&event_loop, {
        let fired = Rc::clone(&fired);
        move |_cx, _events| fired.set(true)
    });
    watcher.init(9, FdEvents::READABLE).expect("init watcher");

    // An event is buffered for the watcher, which is then unbound before
    // the loop can deliver it.
    let token = lab.registered_token(9).expect("registered");
    lab.inject_ready(token, FdEvents::READABLE);
    watcher.reset();

    let mut stopper = Timer::new(&event_loop, |cx| cx.stop());
    stopper.set_after(Duration::from_millis(20));

    event_loop.run().expect("run failed");
    assert!(!fired.get());
    assert_eq!(event_loop.stats().fd_events, 0);
}

#[test]
fn watcher_destroyed_in_own_handler() {
    common::init_test_logging();
    let reactor = LabReactor::new();
    let lab = reactor.handle();
    let mut event_loop = EventLoop::builder()
        .reactor(reactor)
        .build()
        .expect("failed to build loop");

    let fired = Rc::new(Cell::new(0u32));
    let holder: Rc<RefCell<Option<FdWatcher>>> = Rc::new(RefCell::new(None));

    let watcher = FdWatcher::new(&event_loop, {
        let fired = Rc::clone(&fired);
        let holder = Rc::clone(&holder);
        move |cx, _events| {
            fired.set(fired.get() + 1);
            drop(holder.borrow_mut().take());
            cx.stop();
        }
    });
    *holder.borrow_mut() = Some(watcher);
    holder
        .borrow_mut()
        .as_mut()
        .expect("watcher present")
        .init(11, FdEvents::READABLE)
        .expect("init watcher");

    let token = lab.registered_token(11).expect("registered");
    lab.inject_ready(token, FdEvents::READABLE);

    event_loop.run().expect("run failed");
    assert_eq!(fired.get(), 1);
    assert!(holder.borrow().is_none());
    assert_eq!(lab.registered_count(), 0);
}
