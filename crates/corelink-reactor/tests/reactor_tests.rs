//! End-to-end reactor tests driving a real `EventManager`.
//!
//! The primary election and OS signal hooks are process-global, so every
//! test takes `TEST_LOCK` and builds its manager while no other test's
//! manager is alive.

use std::cell::{Cell, RefCell};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::rc::{Rc, Weak};
use std::sync::Mutex;
use std::time::Duration;

use corelink_reactor::{
    ChildHandler, EventManager, FdEventHandler, FdEvents, LoopEndHandler, LoopEndMarker,
    ReactorError, ShutdownHandler, SignalHandler, Timer, TimerOwner,
};

static TEST_LOCK: Mutex<()> = Mutex::new(());

fn lock() -> std::sync::MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

fn fd_is_open(fd: RawFd) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) >= 0 }
}

// ----------------------------------------------------------------------------
// Loop-End Semantics
// ----------------------------------------------------------------------------

struct Resubscriber {
    manager: Rc<EventManager>,
    weak_self: RefCell<Weak<Resubscriber>>,
    marker: LoopEndMarker,
    calls: Cell<u32>,
    resubscribes_left: Cell<u32>,
}

impl Resubscriber {
    fn new(manager: Rc<EventManager>, resubscribes: u32) -> Rc<Self> {
        let probe = Rc::new(Self {
            manager,
            weak_self: RefCell::new(Weak::new()),
            marker: LoopEndMarker::new(),
            calls: Cell::new(0),
            resubscribes_left: Cell::new(resubscribes),
        });
        *probe.weak_self.borrow_mut() = Rc::downgrade(&probe);
        probe
    }
}

impl LoopEndHandler for Resubscriber {
    fn loop_end_marker(&self) -> &LoopEndMarker {
        &self.marker
    }

    fn receive_loop_end_event(&self) {
        self.calls.set(self.calls.get() + 1);
        if self.resubscribes_left.get() > 0 {
            self.resubscribes_left.set(self.resubscribes_left.get() - 1);
            if let Some(this) = self.weak_self.borrow().upgrade() {
                let as_dyn: Rc<dyn LoopEndHandler> = this;
                self.manager.loop_end_subscribe(&as_dyn);
            }
        }
    }
}

#[test]
fn test_loop_end_dedup_within_one_iteration() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let probe = Resubscriber::new(manager.clone(), 0);
    let as_dyn: Rc<dyn LoopEndHandler> = probe.clone();
    manager.loop_end_subscribe(&as_dyn);
    manager.loop_end_subscribe(&as_dyn);
    manager.loop_end_subscribe(&as_dyn);

    manager.iteration().unwrap();
    assert_eq!(probe.calls.get(), 1);

    // Nothing carried over: an iteration bounded by a short timer does not
    // invoke the handler again.
    let ticker = Ticker::new(manager.clone());
    let timer = ticker.make_timer("wake");
    manager.start_timer(&timer, Duration::from_millis(5));
    manager.iteration().unwrap();
    assert_eq!(probe.calls.get(), 1);

    manager.shutdown(false).unwrap();
}

#[test]
fn test_loop_end_resubscribe_lands_in_next_iteration() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let probe = Resubscriber::new(manager.clone(), 1);
    let as_dyn: Rc<dyn LoopEndHandler> = probe.clone();
    manager.loop_end_subscribe(&as_dyn);

    // The re-subscription from inside the callback is not drained in the
    // same pass.
    manager.iteration().unwrap();
    assert_eq!(probe.calls.get(), 1);

    manager.iteration().unwrap();
    assert_eq!(probe.calls.get(), 2);

    manager.shutdown(false).unwrap();
}

// ----------------------------------------------------------------------------
// Timers
// ----------------------------------------------------------------------------

struct Ticker {
    manager: Rc<EventManager>,
    timers: RefCell<Vec<(&'static str, Timer)>>,
    fired: RefCell<Vec<&'static str>>,
    stop_after: Cell<usize>,
}

impl Ticker {
    fn new(manager: Rc<EventManager>) -> Rc<Self> {
        Rc::new(Self {
            manager,
            timers: RefCell::new(Vec::new()),
            fired: RefCell::new(Vec::new()),
            stop_after: Cell::new(usize::MAX),
        })
    }

    fn make_timer(self: &Rc<Self>, name: &'static str) -> Timer {
        let weak: Weak<dyn TimerOwner> = Rc::<Self>::downgrade(self);
        let timer = Timer::new(weak);
        self.timers.borrow_mut().push((name, timer.clone()));
        timer
    }
}

impl TimerOwner for Ticker {
    fn timer_expired(&self, timer: &Timer) {
        let name = self
            .timers
            .borrow()
            .iter()
            .find(|(_, t)| t == timer)
            .map(|(name, _)| *name)
            .unwrap_or("?");
        self.fired.borrow_mut().push(name);
        if self.fired.borrow().len() >= self.stop_after.get() {
            self.manager.stop();
        }
    }
}

#[test]
fn test_timer_firing_order_through_run() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let ticker = Ticker::new(manager.clone());
    ticker.stop_after.set(3);
    let t1 = ticker.make_timer("t1");
    let t2 = ticker.make_timer("t2");
    let t3 = ticker.make_timer("t3");

    manager.start_timer(&t1, Duration::from_millis(100));
    manager.start_timer(&t2, Duration::from_millis(50));
    manager.start_timer(&t3, Duration::from_millis(50));

    manager.run().unwrap();

    assert_eq!(*ticker.fired.borrow(), vec!["t2", "t3", "t1"]);
    manager.shutdown(false).unwrap();
}

struct ArmOnRead {
    manager: Rc<EventManager>,
    timer: Timer,
}

impl FdEventHandler for ArmOnRead {
    fn receive_fd_event(&self, fd: RawFd, _events: FdEvents) {
        self.manager.start_timer(&self.timer, Duration::ZERO);
        self.manager.remove_fd_handler(fd);
    }
}

#[test]
fn test_timer_armed_in_fd_callback_waits_for_next_iteration() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let ticker = Ticker::new(manager.clone());
    let timer = ticker.make_timer("armed-in-callback");

    let (local, peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();

    let handler = Rc::new(ArmOnRead {
        manager: manager.clone(),
        timer,
    });
    let as_dyn: Rc<dyn FdEventHandler> = handler.clone();
    manager.set_fd_handler(fd, &as_dyn, FdEvents::READ).unwrap();

    use std::io::Write;
    let mut peer = peer;
    peer.write_all(b"x").unwrap();

    // A zero-duration timer armed from inside the fd callback belongs to the
    // next iteration, not the batch being dispatched.
    manager.iteration().unwrap();
    assert!(ticker.fired.borrow().is_empty());

    manager.iteration().unwrap();
    assert_eq!(*ticker.fired.borrow(), vec!["armed-in-callback"]);

    manager.close_fd(fd);
    manager.shutdown(false).unwrap();
}

// ----------------------------------------------------------------------------
// Fd Table
// ----------------------------------------------------------------------------

struct ReadProbe {
    manager: Rc<EventManager>,
    events_seen: RefCell<Vec<(RawFd, FdEvents)>>,
}

impl FdEventHandler for ReadProbe {
    fn receive_fd_event(&self, fd: RawFd, events: FdEvents) {
        self.events_seen.borrow_mut().push((fd, events));
        self.manager.stop();
    }
}

#[test]
fn test_fd_readiness_dispatch_and_close() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let (local, peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();

    let probe = Rc::new(ReadProbe {
        manager: manager.clone(),
        events_seen: RefCell::new(Vec::new()),
    });
    let as_dyn: Rc<dyn FdEventHandler> = probe.clone();
    manager.set_fd_handler(fd, &as_dyn, FdEvents::READ).unwrap();

    // Removing a handler from an unrelated fd is a no-op and leaves this
    // registration intact.
    manager.remove_fd_handler(fd + 100);
    assert!(manager.has_fd_handler(fd));

    use std::io::Write;
    let mut peer = peer;
    peer.write_all(b"x").unwrap();

    manager.run().unwrap();

    let seen = probe.events_seen.borrow();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].0, fd);
    assert!(seen[0].1.readable());
    drop(seen);

    manager.close_fd(fd);
    assert!(!manager.has_fd_handler(fd));
    assert!(!fd_is_open(fd));

    // Idempotent on an fd with nothing registered.
    manager.remove_fd_handler(fd);
    manager.shutdown(false).unwrap();
}

#[test]
fn test_interest_mask_toggling() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let (local, _peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();

    let probe = Rc::new(ReadProbe {
        manager: manager.clone(),
        events_seen: RefCell::new(Vec::new()),
    });
    let as_dyn: Rc<dyn FdEventHandler> = probe.clone();
    manager.set_fd_handler(fd, &as_dyn, FdEvents::NONE).unwrap();

    manager.enable_read_events(fd).unwrap();
    manager.enable_write_events(fd).unwrap();
    assert_eq!(manager.fd_events(fd), FdEvents::READ.with(FdEvents::WRITE));

    manager.disable_read_events(fd).unwrap();
    assert_eq!(manager.fd_events(fd), FdEvents::WRITE);

    // Redundant change is accepted without effect.
    manager.disable_read_events(fd).unwrap();
    assert_eq!(manager.fd_events(fd), FdEvents::WRITE);

    // Unregistered fd refuses interest changes.
    assert!(matches!(
        manager.set_fd_events(fd + 100, FdEvents::READ),
        Err(ReactorError::WrongState)
    ));

    manager.close_fd(fd);
    manager.shutdown(false).unwrap();
}

// ----------------------------------------------------------------------------
// Shutdown
// ----------------------------------------------------------------------------

#[test]
fn test_graceful_shutdown_refused_while_fd_registered() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let (local, _peer) = UnixStream::pair().unwrap();
    let fd = local.into_raw_fd();

    let probe = Rc::new(ReadProbe {
        manager: manager.clone(),
        events_seen: RefCell::new(Vec::new()),
    });
    let as_dyn: Rc<dyn FdEventHandler> = probe.clone();
    manager.set_fd_handler(fd, &as_dyn, FdEvents::READ).unwrap();

    // Refused, and the registration is left intact.
    assert!(matches!(
        manager.shutdown(false),
        Err(ReactorError::WrongState)
    ));
    assert!(manager.has_fd_handler(fd));
    assert!(fd_is_open(fd));

    // Forced shutdown closes the leaked descriptor and empties the table.
    manager.shutdown(true).unwrap();
    assert!(!manager.has_fd_handler(fd));
    assert!(!fd_is_open(fd));
}

struct ShutdownProbe {
    manager: Rc<EventManager>,
    weak_self: RefCell<Weak<ShutdownProbe>>,
    calls: Cell<u32>,
    unsubscribes_itself: bool,
}

impl ShutdownProbe {
    fn new(manager: Rc<EventManager>, unsubscribes_itself: bool) -> Rc<Self> {
        let probe = Rc::new(Self {
            manager,
            weak_self: RefCell::new(Weak::new()),
            calls: Cell::new(0),
            unsubscribes_itself,
        });
        *probe.weak_self.borrow_mut() = Rc::downgrade(&probe);
        probe
    }
}

impl ShutdownHandler for ShutdownProbe {
    fn receive_shutdown_event(&self) {
        self.calls.set(self.calls.get() + 1);
        if self.unsubscribes_itself {
            if let Some(this) = self.weak_self.borrow().upgrade() {
                let as_dyn: Rc<dyn ShutdownHandler> = this;
                self.manager.shutdown_unsubscribe(&as_dyn);
            }
        }
    }
}

#[test]
fn test_shutdown_drain_tolerates_handlers_that_stay_subscribed() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let polite = ShutdownProbe::new(manager.clone(), true);
    let stubborn = ShutdownProbe::new(manager.clone(), false);
    let polite_dyn: Rc<dyn ShutdownHandler> = polite.clone();
    let stubborn_dyn: Rc<dyn ShutdownHandler> = stubborn.clone();

    manager.shutdown_subscribe(&polite_dyn);
    manager.shutdown_subscribe(&stubborn_dyn);
    // Duplicate subscription collapses.
    manager.shutdown_subscribe(&stubborn_dyn);

    manager.shutdown(false).unwrap();

    // Each handler ran exactly once; the one that never unsubscribed was
    // dropped forcibly instead of looping forever.
    assert_eq!(polite.calls.get(), 1);
    assert_eq!(stubborn.calls.get(), 1);
}

// ----------------------------------------------------------------------------
// Signals and Children
// ----------------------------------------------------------------------------

struct SignalProbe {
    manager: Rc<EventManager>,
    received: RefCell<Vec<i32>>,
}

impl SignalHandler for SignalProbe {
    fn receive_signal_event(&self, signal: i32) {
        self.received.borrow_mut().push(signal);
        self.manager.stop();
    }
}

#[test]
fn test_signal_delivery_to_subscriber() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();
    assert!(manager.is_primary());

    let probe = Rc::new(SignalProbe {
        manager: manager.clone(),
        received: RefCell::new(Vec::new()),
    });
    let as_dyn: Rc<dyn SignalHandler> = probe.clone();
    manager.signal_subscribe(&as_dyn).unwrap();

    unsafe {
        libc::raise(libc::SIGUSR1);
    }

    manager.run().unwrap();

    assert_eq!(*probe.received.borrow(), vec![libc::SIGUSR1]);

    manager.signal_unsubscribe(&as_dyn);
    manager.shutdown(false).unwrap();
}

struct ChildProbe {
    manager: Rc<EventManager>,
    exits: RefCell<Vec<(i32, i32)>>,
}

impl ChildHandler for ChildProbe {
    fn child_exited(&self, pid: i32, status: i32) {
        self.exits.borrow_mut().push((pid, status));
        self.manager.stop();
    }
}

#[test]
fn test_child_exit_reported_and_reaped() {
    let _guard = lock();
    let manager = EventManager::new().unwrap();

    let child = std::process::Command::new("true").spawn().unwrap();
    let pid = child.id() as i32;

    let probe = Rc::new(ChildProbe {
        manager: manager.clone(),
        exits: RefCell::new(Vec::new()),
    });
    let as_dyn: Rc<dyn ChildHandler> = probe.clone();
    manager.set_child_handler(pid, &as_dyn).unwrap();

    manager.run().unwrap();

    let exits = probe.exits.borrow();
    assert_eq!(exits.len(), 1);
    assert_eq!(exits[0].0, pid);
    assert!(libc::WIFEXITED(exits[0].1));
    assert_eq!(libc::WEXITSTATUS(exits[0].1), 0);
    drop(exits);

    // The exited child was removed from the registry, so graceful shutdown
    // passes the emptiness check.
    manager.shutdown(false).unwrap();
}
