//! The event manager: a single-threaded reactor.
//!
//! One `EventManager` per thread owns the fd table, the timer manager, the
//! loop-end queue and the signal/child registries, and runs the blocking
//! wait/dispatch loop. Handlers are registered as `Rc` trait objects and the
//! manager keeps only weak references; a handler that is dropped simply stops
//! receiving events.
//!
//! Instances are created explicitly and shared as `Rc<EventManager>`. A small
//! process-wide registry elects the first live instance as the primary; only
//! the primary installs OS-level signal hooks.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::errors::{ReactorError, Result};
use crate::events::{FdEventHandler, FdEvents};
use crate::loop_end::{LoopEndHandler, LoopEndQueue};
use crate::poller::Poller;
use crate::signals::{ChildHandler, SignalHandler, SignalRegistry};
use crate::timer::{Timer, TimerManager};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Upper bound on one wait-primitive block while signal or child handlers
/// are registered. Signal flags and child exits arrive outside descriptor
/// readiness, so the loop must wake periodically to observe them.
const CHECK_INTERVAL: Duration = Duration::from_millis(250);

// ----------------------------------------------------------------------------
// Process-Wide Registry
// ----------------------------------------------------------------------------

struct ManagerRegistry {
    managers: usize,
    primary_exists: bool,
}

static REGISTRY: Mutex<ManagerRegistry> = Mutex::new(ManagerRegistry {
    managers: 0,
    primary_exists: false,
});

fn claim_registry_slot() -> bool {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry.managers += 1;
    let primary = !registry.primary_exists;
    if primary {
        registry.primary_exists = true;
    }
    primary
}

fn release_registry_slot(primary: bool) {
    let mut registry = REGISTRY.lock().unwrap_or_else(|e| e.into_inner());
    registry.managers = registry.managers.saturating_sub(1);
    if primary {
        registry.primary_exists = false;
    }
}

// ----------------------------------------------------------------------------
// Shutdown Handler
// ----------------------------------------------------------------------------

/// Receiver of the one-shot shutdown notification.
pub trait ShutdownHandler {
    /// The manager is shutting down. The handler should release whatever it
    /// registered and unsubscribe itself.
    fn receive_shutdown_event(&self);
}

// ----------------------------------------------------------------------------
// Fd Table
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FdEntry {
    handler: Option<Weak<dyn FdEventHandler>>,
    mask: FdEvents,
}

/// Dense table indexed by descriptor number.
struct FdTable {
    entries: Vec<FdEntry>,
}

impl FdTable {
    fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    fn entry_mut(&mut self, fd: RawFd) -> &mut FdEntry {
        let index = fd as usize;
        if index >= self.entries.len() {
            self.entries.resize_with(index + 1, FdEntry::default);
        }
        &mut self.entries[index]
    }

    fn is_registered(&self, fd: RawFd) -> bool {
        self.entries
            .get(fd as usize)
            .is_some_and(|e| e.handler.is_some())
    }

    fn handler_for(&self, fd: RawFd) -> Option<Rc<dyn FdEventHandler>> {
        self.entries
            .get(fd as usize)
            .and_then(|e| e.handler.as_ref())
            .and_then(Weak::upgrade)
    }

    fn mask_for(&self, fd: RawFd) -> FdEvents {
        self.entries
            .get(fd as usize)
            .map(|e| e.mask)
            .unwrap_or(FdEvents::NONE)
    }

    fn set(&mut self, fd: RawFd, handler: Weak<dyn FdEventHandler>, mask: FdEvents) {
        let entry = self.entry_mut(fd);
        entry.handler = Some(handler);
        entry.mask = mask;
    }

    fn set_mask(&mut self, fd: RawFd, mask: FdEvents) {
        self.entry_mut(fd).mask = mask;
    }

    /// No handler implies the mask must be zero.
    fn clear(&mut self, fd: RawFd) {
        if let Some(entry) = self.entries.get_mut(fd as usize) {
            entry.handler = None;
            entry.mask = FdEvents::NONE;
        }
    }

    fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.handler.is_none())
    }

    fn registered_fds(&self) -> Vec<RawFd> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.handler.is_some())
            .map(|(fd, _)| fd as RawFd)
            .collect()
    }
}

// ----------------------------------------------------------------------------
// Event Manager
// ----------------------------------------------------------------------------

pub struct EventManager {
    poller: RefCell<Poller>,
    fd_table: RefCell<FdTable>,
    timers: RefCell<TimerManager>,
    loop_end: RefCell<LoopEndQueue>,
    signals: RefCell<SignalRegistry>,
    shutdown_handlers: RefCell<VecDeque<Weak<dyn ShutdownHandler>>>,
    working: Cell<bool>,
    shut_down: Cell<bool>,
    primary: bool,
}

impl EventManager {
    /// Create a reactor for the current thread. The first live instance
    /// process-wide becomes the primary and owns OS signal registration.
    pub fn new() -> Result<Rc<Self>> {
        let primary = claim_registry_slot();
        let poller = match Poller::new() {
            Ok(poller) => poller,
            Err(err) => {
                release_registry_slot(primary);
                return Err(err.into());
            }
        };
        debug!(primary, "event manager created");
        Ok(Rc::new(Self {
            poller: RefCell::new(poller),
            fd_table: RefCell::new(FdTable::new()),
            timers: RefCell::new(TimerManager::new()),
            loop_end: RefCell::new(LoopEndQueue::new()),
            signals: RefCell::new(SignalRegistry::new(primary)),
            shutdown_handlers: RefCell::new(VecDeque::new()),
            working: Cell::new(false),
            shut_down: Cell::new(false),
            primary,
        }))
    }

    /// Whether this instance won the process-wide primary election.
    pub fn is_primary(&self) -> bool {
        self.primary
    }

    // ------------------------------------------------------------------------
    // Fd Table API
    // ------------------------------------------------------------------------

    /// Register `handler` with an initial interest mask for `fd`, replacing
    /// any previous registration.
    pub fn set_fd_handler(
        &self,
        fd: RawFd,
        handler: &Rc<dyn FdEventHandler>,
        events: FdEvents,
    ) -> Result<()> {
        if fd < 0 {
            return Err(ReactorError::InvalidArgument("negative fd"));
        }
        let was_registered = self.fd_table.borrow().is_registered(fd);
        if was_registered {
            self.poller.borrow().reregister(fd, events)?;
        } else {
            self.poller.borrow().register(fd, events)?;
        }
        self.fd_table
            .borrow_mut()
            .set(fd, Rc::downgrade(handler), events);
        trace!(fd, mask = events.as_u8(), "fd handler set");
        Ok(())
    }

    /// Change the interest mask of an already registered descriptor.
    pub fn set_fd_events(&self, fd: RawFd, events: FdEvents) -> Result<()> {
        if !self.fd_table.borrow().is_registered(fd) {
            return Err(ReactorError::WrongState);
        }
        if self.fd_table.borrow().mask_for(fd) == events {
            return Ok(());
        }
        self.poller.borrow().reregister(fd, events)?;
        self.fd_table.borrow_mut().set_mask(fd, events);
        Ok(())
    }

    pub fn enable_read_events(&self, fd: RawFd) -> Result<()> {
        // The table borrow must end before set_fd_events re-borrows it.
        let mask = self.fd_table.borrow().mask_for(fd).with(FdEvents::READ);
        self.set_fd_events(fd, mask)
    }

    pub fn disable_read_events(&self, fd: RawFd) -> Result<()> {
        let mask = self.fd_table.borrow().mask_for(fd).without(FdEvents::READ);
        self.set_fd_events(fd, mask)
    }

    pub fn enable_write_events(&self, fd: RawFd) -> Result<()> {
        let mask = self.fd_table.borrow().mask_for(fd).with(FdEvents::WRITE);
        self.set_fd_events(fd, mask)
    }

    pub fn disable_write_events(&self, fd: RawFd) -> Result<()> {
        let mask = self.fd_table.borrow().mask_for(fd).without(FdEvents::WRITE);
        self.set_fd_events(fd, mask)
    }

    /// Drop the handler and interest for `fd`. A no-op when nothing is
    /// registered there.
    pub fn remove_fd_handler(&self, fd: RawFd) {
        if fd < 0 || !self.fd_table.borrow().is_registered(fd) {
            return;
        }
        self.poller.borrow().deregister(fd);
        self.fd_table.borrow_mut().clear(fd);
        trace!(fd, "fd handler removed");
    }

    /// The sanctioned way to close a descriptor that is or might be
    /// registered: the table entry is cleared first, so it never points at a
    /// closed fd.
    pub fn close_fd(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        self.remove_fd_handler(fd);
        unsafe {
            libc::close(fd);
        }
    }

    /// Current interest mask for `fd` (`NONE` when unregistered).
    pub fn fd_events(&self, fd: RawFd) -> FdEvents {
        self.fd_table.borrow().mask_for(fd)
    }

    /// Whether a handler is registered for `fd`.
    pub fn has_fd_handler(&self, fd: RawFd) -> bool {
        self.fd_table.borrow().is_registered(fd)
    }

    // ------------------------------------------------------------------------
    // Timer API
    // ------------------------------------------------------------------------

    /// Arm (or re-arm) `timer` to fire `delay` from now.
    pub fn start_timer(&self, timer: &Timer, delay: Duration) {
        self.timers.borrow_mut().start(timer, delay);
    }

    /// Disarm `timer`. Safe on an inactive timer.
    pub fn stop_timer(&self, timer: &Timer) {
        self.timers.borrow_mut().stop(timer);
    }

    // ------------------------------------------------------------------------
    // Loop-End API
    // ------------------------------------------------------------------------

    /// Run `handler` once at the end of the current iteration. Idempotent
    /// within one iteration.
    pub fn loop_end_subscribe(&self, handler: &Rc<dyn LoopEndHandler>) {
        self.loop_end.borrow_mut().subscribe(handler);
    }

    pub fn loop_end_unsubscribe(&self, handler: &Rc<dyn LoopEndHandler>) {
        self.loop_end.borrow_mut().unsubscribe(handler);
    }

    // ------------------------------------------------------------------------
    // Signal / Child / Shutdown API
    // ------------------------------------------------------------------------

    /// Subscribe to the watched OS signals. Every subscriber sees every
    /// delivered signal.
    pub fn signal_subscribe(&self, handler: &Rc<dyn SignalHandler>) -> Result<()> {
        self.signals.borrow_mut().subscribe(handler)?;
        Ok(())
    }

    pub fn signal_unsubscribe(&self, handler: &Rc<dyn SignalHandler>) {
        self.signals.borrow_mut().unsubscribe(handler);
    }

    /// Watch one child pid for exit, replacing any previous handler for it.
    pub fn set_child_handler(&self, pid: i32, handler: &Rc<dyn ChildHandler>) -> Result<()> {
        if pid <= 0 {
            return Err(ReactorError::InvalidArgument("non-positive pid"));
        }
        self.signals.borrow_mut().set_child_handler(pid, handler)?;
        Ok(())
    }

    pub fn remove_child_handler(&self, pid: i32) {
        self.signals.borrow_mut().remove_child_handler(pid);
    }

    /// Subscribe to the shutdown notification. Deduplicated on insert.
    pub fn shutdown_subscribe(&self, handler: &Rc<dyn ShutdownHandler>) {
        let target = Rc::downgrade(handler);
        let mut handlers = self.shutdown_handlers.borrow_mut();
        if !handlers.iter().any(|h| h.ptr_eq(&target)) {
            handlers.push_back(target);
        }
    }

    pub fn shutdown_unsubscribe(&self, handler: &Rc<dyn ShutdownHandler>) {
        let target = Rc::downgrade(handler);
        self.shutdown_handlers
            .borrow_mut()
            .retain(|h| !h.ptr_eq(&target));
    }

    // ------------------------------------------------------------------------
    // Loop Control
    // ------------------------------------------------------------------------

    /// Run the dispatch loop until [`stop`](Self::stop) is called.
    pub fn run(&self) -> Result<()> {
        if self.working.get() || self.shut_down.get() {
            return Err(ReactorError::WrongState);
        }
        self.working.set(true);
        debug!("event loop entered");
        let result = loop {
            if let Err(err) = self.iteration() {
                break Err(err);
            }
            if !self.working.get() {
                break Ok(());
            }
        };
        self.working.set(false);
        debug!("event loop exited");
        result
    }

    /// Request loop exit. The current iteration completes its dispatch
    /// phases first.
    pub fn stop(&self) {
        self.working.set(false);
    }

    /// Whether the loop is currently inside [`run`](Self::run).
    pub fn is_working(&self) -> bool {
        self.working.get()
    }

    /// One wait/dispatch pass. Exposed so tests and embedders can step the
    /// reactor without entering the blocking loop.
    pub fn iteration(&self) -> Result<()> {
        let timeout = self.poll_timeout();
        let ready = self.poller.borrow_mut().wait(timeout)?;
        // Due-ness is judged against the wakeup instant, not a later clock
        // sample, so a timer armed inside an fd callback waits for the next
        // iteration.
        let now = Instant::now();

        // Phase 1: fd readiness. Interest is re-checked per descriptor since
        // an earlier handler in the same batch may have changed or removed
        // the registration.
        for (fd, events) in ready {
            let handler = self.fd_table.borrow().handler_for(fd);
            let Some(handler) = handler else { continue };
            let mask = self.fd_table.borrow().mask_for(fd);
            let delivered = FdEvents::new(events.as_u8() & mask.as_u8());
            if delivered.is_empty() {
                continue;
            }
            handler.receive_fd_event(fd, delivered);
        }

        // Phase 2: due timers. Timers armed from inside a callback carry a
        // deadline past the wakeup instant and are never part of this batch.
        let due = self.timers.borrow_mut().take_due(now);
        for (owner, timer) in due {
            owner.timer_expired(&timer);
        }

        // Phase 3: loop-end drain.
        if self.loop_end.borrow_mut().begin_drain() {
            loop {
                let next = self.loop_end.borrow_mut().next_draining();
                match next {
                    Some(handler) => handler.receive_loop_end_event(),
                    None => break,
                }
            }
        }

        // Phase 4: signal delivery.
        let pending = self.signals.borrow_mut().take_pending();
        if !pending.is_empty() {
            let handlers = self.signals.borrow().handler_snapshot();
            for signal in pending {
                trace!(signal, "dispatching signal");
                for handler in &handlers {
                    handler.receive_signal_event(signal);
                }
            }
        }

        // Phase 5: child exits.
        let exited = self.signals.borrow_mut().reap();
        for (pid, status, handler) in exited {
            debug!(pid, status, "child exited");
            handler.child_exited(pid, status);
        }

        Ok(())
    }

    /// How long the wait primitive may block this iteration.
    fn poll_timeout(&self) -> Option<Duration> {
        // Pending loop-end work must run before the loop blocks again.
        if self.loop_end.borrow().has_pending() {
            return Some(Duration::ZERO);
        }
        let deadline = self.timers.borrow_mut().next_deadline();
        let mut timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        if self.signals.borrow().wants_periodic_check() {
            timeout = Some(timeout.map_or(CHECK_INTERVAL, |t| t.min(CHECK_INTERVAL)));
        }
        timeout
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Tear the reactor down.
    ///
    /// With `force` false this is a correctness check: it fails with
    /// [`ReactorError::WrongState`] while any timer, loop-end subscription,
    /// signal/child handler or fd registration is outstanding, leaving all
    /// state intact so the caller can detect the leak. With `force` true all
    /// timers are cleared and every still-registered descriptor is closed.
    pub fn shutdown(&self, force: bool) -> Result<()> {
        if self.shut_down.get() {
            return Err(ReactorError::WrongState);
        }
        if !force {
            let outstanding = !self.timers.borrow_mut().is_empty()
                || !self.loop_end.borrow().is_empty()
                || !self.signals.borrow().is_registry_empty()
                || !self.fd_table.borrow().is_empty();
            if outstanding {
                return Err(ReactorError::WrongState);
            }
        } else {
            self.timers.borrow_mut().remove_all();
            self.loop_end.borrow_mut().clear();
            let fds = self.fd_table.borrow().registered_fds();
            for fd in fds {
                warn!(fd, "closing fd still registered at forced shutdown");
                self.close_fd(fd);
            }
        }
        self.signals.borrow_mut().clear();
        self.working.set(false);
        self.shut_down.set(true);
        self.run_shutdown_handlers();
        debug!(force, "event manager shut down");
        Ok(())
    }

    /// Destructive front-of-queue drain. A handler that fails to unsubscribe
    /// itself from inside its callback is dropped forcibly so the drain
    /// always terminates.
    fn run_shutdown_handlers(&self) {
        loop {
            let front = self.shutdown_handlers.borrow().front().cloned();
            let Some(front) = front else { break };
            if let Some(handler) = front.upgrade() {
                handler.receive_shutdown_event();
            }
            let mut handlers = self.shutdown_handlers.borrow_mut();
            if handlers.front().is_some_and(|h| h.ptr_eq(&front)) {
                handlers.pop_front();
            }
        }
    }
}

impl Drop for EventManager {
    fn drop(&mut self) {
        release_registry_slot(self.primary);
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
