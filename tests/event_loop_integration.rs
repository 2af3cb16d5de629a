// Event loop integration tests for Vellum
//
// Drives Display::run against the headless server: deferred task ordering,
// timers, watched descriptors, socket back-pressure and disconnects.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::UnixStream;
use std::rc::Rc;
use std::time::Duration;

use vellum::buffer::DrawTarget;
use vellum::protocol::headless::{HeadlessHandle, HeadlessTransport, Injection};
use vellum::{
    Display, Frame, Interest, TaskId, TimerFd, ToolkitError, TransportError, VellumConfig,
    WindowHandler,
};

struct Plain;

impl WindowHandler for Plain {
    fn draw(&mut self, frame: &mut Frame<'_>) {
        if let DrawTarget::Shm(target) = frame.target() {
            target.fill(0xff10_1010);
        }
    }
}

fn connect() -> (Display, HeadlessHandle) {
    let transport = HeadlessTransport::new().unwrap();
    let server = transport.handle();
    let mut config = VellumConfig::default();
    config.gpu.enabled = false;
    (Display::connect(Box::new(transport), config).unwrap(), server)
}

/// Stops the loop once `done` holds, or after two seconds so a broken
/// loop fails the test instead of hanging it.
fn stop_when(display: &mut Display, done: impl Fn(&Display) -> bool + 'static) -> TimerFd {
    let timer = TimerFd::new().unwrap();
    timer
        .arm(Duration::from_millis(1), Some(Duration::from_millis(1)))
        .unwrap();
    let mut ticks = 0u64;
    display
        .add_timer(&timer, move |display, expirations| {
            ticks += expirations;
            if done(&*display) || ticks > 2000 {
                display.exit_loop();
            }
        })
        .unwrap();
    timer
}

#[test]
fn tasks_queued_by_tasks_run_before_the_loop_blocks() {
    let (mut display, _server) = connect();
    let order = Rc::new(RefCell::new(Vec::new()));

    let log = order.clone();
    display.defer(move |display| {
        log.borrow_mut().push("first");
        let log = log.clone();
        display.defer(move |display| {
            log.borrow_mut().push("second");
            display.exit_loop();
        });
    });

    // Nothing else would wake the loop: both tasks must run before it blocks.
    display.run().unwrap();
    assert_eq!(*order.borrow(), vec!["first", "second"]);
    assert_eq!(display.pending_tasks(), 0);
    display.shutdown().unwrap();
}

#[test]
fn the_loop_can_be_run_again_after_exiting() {
    let (mut display, _server) = connect();
    let runs = Rc::new(Cell::new(0));

    for _ in 0..2 {
        let runs = runs.clone();
        display.defer(move |display| {
            runs.set(runs.get() + 1);
            display.exit_loop();
        });
        display.run().unwrap();
        assert!(!display.is_running());
    }
    assert_eq!(runs.get(), 2);
    display.shutdown().unwrap();
}

#[test]
fn running_the_loop_from_a_task_is_rejected() {
    let (mut display, _server) = connect();
    let nested = Rc::new(RefCell::new(None));

    let result = nested.clone();
    display.defer(move |display| {
        *result.borrow_mut() = Some(matches!(display.run(), Err(ToolkitError::LoopReentered)));
        display.exit_loop();
    });
    display.run().unwrap();

    assert_eq!(*nested.borrow(), Some(true));
    display.shutdown().unwrap();
}

#[test]
fn keyed_tasks_are_deduplicated_and_cancellable() {
    let (mut display, _server) = connect();
    let hits = Rc::new(Cell::new(0));

    for _ in 0..3 {
        let hits = hits.clone();
        display.defer_keyed(7, move |_| hits.set(hits.get() + 1));
    }
    let cancelled = display.defer(|_| panic!("cancelled task ran"));
    assert_eq!(display.pending_tasks(), 2);
    assert!(display.cancel_deferred(cancelled));
    assert!(!display.cancel_deferred(TaskId::Keyed(99)));

    display.defer(|display| display.exit_loop());
    display.run().unwrap();
    assert_eq!(hits.get(), 1);
    display.shutdown().unwrap();
}

#[test]
fn timers_deliver_their_expirations() {
    let (mut display, _server) = connect();
    let fired = Rc::new(Cell::new(0u64));

    let timer = TimerFd::new().unwrap();
    timer
        .arm(Duration::from_millis(2), Some(Duration::from_millis(2)))
        .unwrap();
    let count = fired.clone();
    let key = display
        .add_timer(&timer, move |display, expirations| {
            count.set(count.get() + expirations);
            if count.get() >= 3 {
                display.exit_loop();
            }
        })
        .unwrap();
    assert_eq!(display.watched_descriptors(), 1);

    display.run().unwrap();
    assert!(fired.get() >= 3);

    assert!(display.unwatch_descriptor(key));
    assert!(!display.unwatch_descriptor(key));
    assert_eq!(display.watched_descriptors(), 0);
    display.shutdown().unwrap();
}

#[test]
fn watched_descriptor_can_unwatch_itself() {
    let (mut display, _server) = connect();
    let (ours, mut peer) = UnixStream::pair().unwrap();
    ours.set_nonblocking(true).unwrap();
    let key = ours.as_raw_fd();

    let received = Rc::new(RefCell::new(Vec::new()));
    let mut reader = ours.try_clone().unwrap();
    let sink = received.clone();
    display
        .watch_descriptor(ours.as_fd(), Interest::READ, move |display, readiness| {
            assert!(readiness.readable);
            let mut buf = [0u8; 16];
            if let Ok(n) = reader.read(&mut buf) {
                sink.borrow_mut().extend_from_slice(&buf[..n]);
            }
            display.unwatch_descriptor(key);
            display.exit_loop();
        })
        .unwrap();

    assert!(matches!(
        display.watch_descriptor(ours.as_fd(), Interest::READ, |_, _| {}),
        Err(ToolkitError::AlreadyWatched(fd)) if fd == key
    ));

    peer.write_all(b"ping").unwrap();
    display.run().unwrap();

    assert_eq!(*received.borrow(), b"ping");
    assert_eq!(display.watched_descriptors(), 0);
    display.shutdown().unwrap();
}

#[test]
fn unwatched_sources_stop_within_the_same_dispatch() {
    let (mut display, _server) = connect();
    let fired = Rc::new(Cell::new(0));
    let timers = [TimerFd::new().unwrap(), TimerFd::new().unwrap()];
    let keys = [timers[0].as_raw_fd(), timers[1].as_raw_fd()];

    for timer in &timers {
        timer.arm(Duration::from_millis(1), None).unwrap();
        let fired = fired.clone();
        display
            .add_timer(timer, move |display, _| {
                fired.set(fired.get() + 1);
                for key in keys {
                    display.unwatch_descriptor(key);
                }
                display.exit_loop();
            })
            .unwrap();
    }

    // Both timers have expired before the loop polls.
    std::thread::sleep(Duration::from_millis(10));
    display.run().unwrap();

    assert_eq!(fired.get(), 1);
    assert_eq!(display.watched_descriptors(), 0);
    display.shutdown().unwrap();
}

#[test]
fn window_destroyed_from_a_callback_loses_its_ready_timer() {
    let (mut display, server) = connect();
    let window = display.create_window(300, 300, Plain).unwrap();
    let destroyed = Rc::new(Cell::new(false));
    let late = Rc::new(Cell::new(0));

    // Armed first, so it is reported ahead of the window's timer.
    let closer = TimerFd::new().unwrap();
    closer.arm(Duration::from_millis(1), None).unwrap();
    let key = closer.as_raw_fd();
    let gone = destroyed.clone();
    display
        .add_timer(&closer, move |display, _| {
            display.destroy_window(window).unwrap();
            display.unwatch_descriptor(key);
            gone.set(true);
            display.exit_loop();
        })
        .unwrap();

    let window_timer = TimerFd::new().unwrap();
    window_timer
        .arm(Duration::from_millis(1), Some(Duration::from_millis(1)))
        .unwrap();
    let (gone, count) = (destroyed.clone(), late.clone());
    display
        .add_window_timer(window, &window_timer, move |_, _| {
            if gone.get() {
                count.set(count.get() + 1);
            }
        })
        .unwrap();

    std::thread::sleep(Duration::from_millis(10));
    display.run().unwrap();

    assert!(destroyed.get());
    assert_eq!(late.get(), 0);
    assert_eq!(display.watched_descriptors(), 0);
    assert_eq!(server.live_surfaces(), 0);
    display.shutdown().unwrap();
}

#[test]
fn full_socket_is_flushed_once_writable() {
    let (mut display, server) = connect();
    server.inject(Injection::FlushWouldBlock(2));

    let probe = server.clone();
    let _timer = stop_when(&mut display, move |_| probe.flushes() >= 4);
    display.run().unwrap();

    // Two refused flushes, then the retries that drained the queue.
    assert!(server.flushes() >= 4);
    assert_eq!(server.protocol_errors(), 0);
    display.shutdown().unwrap();
}

#[test]
fn disconnect_ends_the_loop_with_an_error() {
    let (mut display, server) = connect();
    let window = display.create_window(300, 300, Plain).unwrap();
    server.inject(Injection::Disconnect);

    let result = display.run();
    assert!(matches!(
        result,
        Err(ToolkitError::Transport(TransportError::Hangup))
    ));
    assert!(!display.is_running());

    display.destroy_window(window).unwrap();
    display.shutdown().unwrap();
}

#[test]
fn destroying_a_window_drops_its_redraw_and_timers() {
    let (mut display, server) = connect();
    let window = display.create_window(300, 300, Plain).unwrap();
    let surface = display.main_surface(window).unwrap().surface;

    let timer = TimerFd::new().unwrap();
    timer.arm(Duration::from_secs(60), None).unwrap();
    display
        .add_window_timer(window, &timer, |_, _| panic!("timer of a destroyed window fired"))
        .unwrap();
    assert_eq!(display.pending_tasks(), 1);
    assert_eq!(display.watched_descriptors(), 1);

    display.destroy_window(window).unwrap();
    assert_eq!(display.pending_tasks(), 0);
    assert_eq!(display.watched_descriptors(), 0);
    assert_eq!(server.commits(surface), 0);
    assert_eq!(server.live_surfaces(), 0);

    assert!(matches!(
        display.add_window_timer(window, &timer, |_, _| {}),
        Err(ToolkitError::UnknownWindow(_))
    ));
    display.shutdown().unwrap();
}

#[test]
fn windows_left_alive_are_reported_at_shutdown() {
    let (mut display, _server) = connect();
    display.create_window(0, 0, Plain).unwrap();
    display.create_window(320, 240, Plain).unwrap();

    assert!(matches!(
        display.shutdown(),
        Err(ToolkitError::LeakedWindows { count: 2 })
    ));
}
