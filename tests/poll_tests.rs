//! Readiness polling and timing tests.

use ringloop::{Config, EventLoop, PollEvents};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Once;
use std::time::{Duration, Instant};

static TRACING: Once = Once::new();
fn setup_tracing() {
    TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .init();
    });
}

fn pipe() -> (RawFd, RawFd) {
    let mut fds = [0 as RawFd; 2];
    let rv = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rv, 0, "pipe(2) failed");
    (fds[0], fds[1])
}

fn write_byte(fd: RawFd) {
    let byte = [0x2au8];
    let n = unsafe { libc::write(fd, byte.as_ptr() as *const libc::c_void, 1) };
    assert_eq!(n, 1, "pipe write failed");
}

fn close_fd(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// A readable watcher fires once per arming and is rearmed for the next
/// event unless declared oneshot.
#[test]
fn test_readiness_rearm() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let hits = Rc::new(RefCell::new(Vec::new()));
    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            false,
            Box::new(move |_, fd, events| {
                hits_clone.borrow_mut().push((fd, events));
            }),
        )
        .unwrap();

    write_byte(write_fd);
    event_loop.poll(None).unwrap();
    assert_eq!(hits.borrow().len(), 1);
    let (fd, events) = hits.borrow()[0];
    assert_eq!(fd, read_fd);
    assert!(events.contains(PollEvents::READABLE));

    // A second write must produce a second callback without manual rearm.
    write_byte(write_fd);
    event_loop.poll(None).unwrap();
    assert_eq!(hits.borrow().len(), 2);

    close_fd(read_fd);
    close_fd(write_fd);
}

/// A oneshot watcher stays disarmed after its first event.
#[test]
fn test_oneshot_does_not_rearm() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let hits = Rc::new(RefCell::new(0u32));
    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            true,
            Box::new(move |_, _, _| {
                *hits_clone.borrow_mut() += 1;
            }),
        )
        .unwrap();

    write_byte(write_fd);
    event_loop.poll(None).unwrap();
    assert_eq!(*hits.borrow(), 1);

    write_byte(write_fd);
    event_loop.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(*hits.borrow(), 1, "oneshot watcher must not fire again");

    close_fd(read_fd);
    close_fd(write_fd);
}

/// A positive timeout is honored when nothing becomes ready.
#[test]
fn test_timeout_drift() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let hits = Rc::new(RefCell::new(0u32));
    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, _| {
                *hits_clone.borrow_mut() += 1;
            }),
        )
        .unwrap();

    let start = Instant::now();
    event_loop.poll(Some(Duration::from_millis(100))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(*hits.borrow(), 0);
    assert!(elapsed >= Duration::from_millis(100), "returned early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(500), "overslept: {elapsed:?}");

    close_fd(read_fd);
    close_fd(write_fd);
}

/// A zero timeout returns within one drain regardless of CQ contents.
#[test]
fn test_zero_timeout_is_nonblocking() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    event_loop
        .io_start(read_fd, PollEvents::READABLE, false, Box::new(|_, _, _| {}))
        .unwrap();

    let start = Instant::now();
    event_loop.poll(Some(Duration::ZERO)).unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));

    close_fd(read_fd);
    close_fd(write_fd);
}

/// Closing an fd before its completion arrives produces no callback.
#[test]
fn test_fd_invalidation_race() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let hits = Rc::new(RefCell::new(0u32));
    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, _| {
                *hits_clone.borrow_mut() += 1;
            }),
        )
        .unwrap();

    // Arm and submit without blocking, then close under the in-flight op.
    event_loop.poll(Some(Duration::ZERO)).unwrap();
    event_loop.invalidate_fd(read_fd);
    event_loop.io_stop(read_fd, PollEvents::READABLE);
    close_fd(read_fd);
    close_fd(write_fd);

    event_loop.poll(Some(Duration::from_millis(50))).unwrap();
    assert_eq!(*hits.borrow(), 0, "no callback may fire for a closed fd");
}

/// The signal multiplexer's callback runs last in a drain, and the tick
/// returns right after it even with an unexpired timeout.
#[test]
fn test_signal_watcher_runs_last() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (regular_read, regular_write) = pipe();
    let (signal_read, signal_write) = pipe();

    let order = Rc::new(RefCell::new(Vec::new()));

    let order_clone = Rc::clone(&order);
    event_loop
        .io_start(
            regular_read,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, _| {
                order_clone.borrow_mut().push("regular");
            }),
        )
        .unwrap();

    let order_clone = Rc::clone(&order);
    event_loop
        .io_start(
            signal_read,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, _| {
                order_clone.borrow_mut().push("signal");
            }),
        )
        .unwrap();
    event_loop.set_signal_watcher(signal_read);

    // Both fds are ready before the tick, so both completions land in the
    // same drain.
    write_byte(regular_write);
    write_byte(signal_write);

    let start = Instant::now();
    event_loop.poll(Some(Duration::from_secs(5))).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(*order.borrow(), vec!["regular", "signal"]);
    assert!(
        elapsed < Duration::from_secs(1),
        "tick must return right after the signal callback: {elapsed:?}"
    );

    close_fd(regular_read);
    close_fd(regular_write);
    close_fd(signal_read);
    close_fd(signal_write);
}

/// Callbacks only see events inside the subscribed mask (plus error and
/// hangup, which are always reported).
#[test]
fn test_events_masked_to_interest() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    let seen = Rc::new(RefCell::new(Vec::new()));
    let seen_clone = Rc::clone(&seen);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, events| {
                seen_clone.borrow_mut().push(events);
            }),
        )
        .unwrap();

    write_byte(write_fd);
    event_loop.poll(None).unwrap();

    let allowed = PollEvents::READABLE | PollEvents::ERROR | PollEvents::HANGUP;
    for events in seen.borrow().iter() {
        assert!(allowed.contains(*events), "unexpected events: {events:?}");
    }

    close_fd(read_fd);
    close_fd(write_fd);
}

/// A callback may re-register and queue work mid-drain.
#[test]
fn test_callback_reentry() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();
    let (second_read, second_write) = pipe();

    let hits = Rc::new(RefCell::new(Vec::new()));

    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            true,
            Box::new(move |el, _, _| {
                hits_clone.borrow_mut().push("first");
                let hits_inner = Rc::clone(&hits_clone);
                el.io_start(
                    second_read,
                    PollEvents::READABLE,
                    true,
                    Box::new(move |_, _, _| {
                        hits_inner.borrow_mut().push("second");
                    }),
                )
                .unwrap();
            }),
        )
        .unwrap();

    write_byte(write_fd);
    write_byte(second_write);

    event_loop.poll(None).unwrap();
    // The watcher registered mid-drain arms at the next tick.
    event_loop.poll(None).unwrap();

    assert_eq!(*hits.borrow(), vec!["first", "second"]);

    close_fd(read_fd);
    close_fd(write_fd);
    close_fd(second_read);
    close_fd(second_write);
}

/// check_fd distinguishes open pollable fds from closed ones.
#[test]
fn test_check_fd() {
    setup_tracing();
    let event_loop = EventLoop::new().unwrap();
    let (read_fd, write_fd) = pipe();

    assert!(event_loop.check_fd(read_fd).is_ok());

    close_fd(read_fd);
    close_fd(write_fd);

    let err = event_loop.check_fd(read_fd).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}

/// With idle-time tracking enabled, time spent blocked in the wait is
/// accounted before the callback runs.
#[test]
fn test_idle_time_metrics() {
    setup_tracing();
    let config = Config {
        idle_time: true,
        ..Config::default()
    };
    let mut event_loop = EventLoop::with_config(&config).unwrap();
    let (read_fd, write_fd) = pipe();

    let hits = Rc::new(RefCell::new(0u32));
    let hits_clone = Rc::clone(&hits);
    event_loop
        .io_start(
            read_fd,
            PollEvents::READABLE,
            false,
            Box::new(move |_, _, _| {
                *hits_clone.borrow_mut() += 1;
            }),
        )
        .unwrap();

    let writer = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(40));
        write_byte(write_fd);
    });

    event_loop.poll(None).unwrap();
    writer.join().unwrap();

    assert_eq!(*hits.borrow(), 1);
    assert!(
        event_loop.idle_time() >= Duration::from_millis(20),
        "blocked time must show up as idle: {:?}",
        event_loop.idle_time()
    );

    close_fd(read_fd);
}

/// An empty loop returns without blocking.
#[test]
fn test_empty_loop_returns_immediately() {
    setup_tracing();
    let mut event_loop = EventLoop::new().unwrap();
    let start = Instant::now();
    event_loop.poll(Some(Duration::from_secs(5))).unwrap();
    assert!(start.elapsed() < Duration::from_millis(50));
}
