//! Control-link connector: connect, retry and keepalive around a link.
//!
//! The connector drives one [`CtrlLink`] through
//! idle → connecting → connected → closed/retry. Exactly one of "a connect
//! is pending" (`pending_fd >= 0`), "the link is connected" and "idle" holds
//! at any time.
//!
//! One timer serves three roles, disambiguated by state: while a connect is
//! pending it is the connect timeout, while idle it is the retry delay, and
//! while connected it is the ping interval. A second timer supervises the
//! pong answer.
//!
//! Owner notifications about connection establishment are always delivered
//! at loop-end: a caller of `connect` never observes `ctrl_link_connected`
//! or `ctrl_link_connect_failed` inside its own call stack, even when the
//! OS completes or refuses the connect synchronously.

use std::cell::{Cell, RefCell};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tracing::{debug, trace, warn};

use corelink_reactor::{
    EventManager, FdEventHandler, FdEvents, LoopEndHandler, LoopEndMarker, Timer, TimerOwner,
};

use crate::errors::{LinkError, Result};
use crate::frame::{Frame, MsgKind};
use crate::link::{CtrlLink, CtrlLinkOwner, LinkActivity, LinkId, PongListener};
use crate::socket::{self, ConnectOutcome, ConnectTarget, DialError};

/// Reconnect delay after an established session drops. A session that
/// reached connected state is retried near-immediately; only attempts that
/// never succeeded back off the full restart delay.
const RECONNECT_DELAY: Duration = Duration::from_millis(1);

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------

/// Connector timing parameters. A zero duration disables the corresponding
/// behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ConnectConfig {
    /// Delay before retrying a failed connect attempt. Zero disables
    /// retries entirely.
    pub restart_delay: Duration,
    /// How long one connect attempt may stay pending. Zero means no
    /// timeout.
    pub connect_timeout: Duration,
    /// Interval between keepalive pings on an established link. Zero
    /// disables keepalive.
    pub ping_interval: Duration,
    /// How long to wait for a pong after a ping. Zero disables pong
    /// supervision. Clamped up to at least `ping_interval`.
    pub pong_timeout: Duration,
}

impl ConnectConfig {
    pub fn new(
        restart_delay: Duration,
        connect_timeout: Duration,
        ping_interval: Duration,
        pong_timeout: Duration,
    ) -> Self {
        Self {
            restart_delay,
            connect_timeout,
            ping_interval,
            pong_timeout,
        }
    }

    /// A pong timeout shorter than the ping interval would expire before
    /// the next ping is even due; clamp it up, never down.
    fn clamped(mut self) -> Self {
        if self.pong_timeout > Duration::ZERO && self.pong_timeout < self.ping_interval {
            self.pong_timeout = self.ping_interval;
        }
        self
    }
}

// ----------------------------------------------------------------------------
// Owner Interface
// ----------------------------------------------------------------------------

/// Receiver of connector lifecycle and message notifications.
pub trait CtrlLinkConnectorOwner {
    /// The link reached connected state. Delivered at loop-end, never from
    /// inside `connect`.
    fn ctrl_link_connected(&self, link_id: LinkId);

    /// A connect attempt failed. Fires on every failed (re)attempt, not
    /// just the first.
    fn ctrl_link_connect_failed(&self, link_id: LinkId);

    /// An established link went down (peer close, read error, missed pong).
    fn ctrl_link_closed(&self, link_id: LinkId);

    /// A direct command or reply frame arrived.
    fn ctrl_msg_received(&self, link_id: LinkId, kind: MsgKind, payload: Vec<u8>) {
        let _ = (link_id, kind, payload);
    }

    /// A standing-subscription update arrived.
    fn ctrl_subscription_msg_received(&self, link_id: LinkId, payload: Vec<u8>) {
        let _ = (link_id, payload);
    }
}

/// Owner notification deferred to loop-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deferred {
    None,
    Connected,
    ConnectFailed,
}

// ----------------------------------------------------------------------------
// Connector
// ----------------------------------------------------------------------------

pub struct CtrlLinkConnector {
    manager: Rc<EventManager>,
    weak_self: Weak<CtrlLinkConnector>,
    owner: Weak<dyn CtrlLinkConnectorOwner>,
    link: CtrlLink,
    target: RefCell<Option<ConnectTarget>>,
    config: Cell<ConnectConfig>,
    /// Descriptor of the in-flight connect attempt, -1 otherwise. This is
    /// the discriminator between connecting and connected/idle.
    pending_fd: Cell<RawFd>,
    timer: Timer,
    pong_timer: Timer,
    marker: LoopEndMarker,
    deferred: Cell<Deferred>,
}

impl CtrlLinkConnector {
    pub fn new(
        manager: Rc<EventManager>,
        owner: Weak<dyn CtrlLinkConnectorOwner>,
        link_id: LinkId,
    ) -> Rc<Self> {
        let connector = Rc::new_cyclic(|weak: &Weak<CtrlLinkConnector>| {
            let link_owner: Weak<dyn CtrlLinkOwner> = weak.clone();
            let timer_owner: Weak<dyn TimerOwner> = weak.clone();
            let link = CtrlLink::new(manager.clone(), link_owner);
            link.set_link_id(link_id);
            Self {
                manager,
                weak_self: weak.clone(),
                owner,
                link,
                target: RefCell::new(None),
                config: Cell::new(ConnectConfig::default()),
                pending_fd: Cell::new(-1),
                timer: Timer::new(timer_owner.clone()),
                pong_timer: Timer::new(timer_owner),
                marker: LoopEndMarker::new(),
                deferred: Cell::new(Deferred::None),
            }
        });
        let pong_listener: Weak<dyn PongListener> = connector.weak_self.clone();
        connector.link.set_pong_listener(pong_listener);
        connector
    }

    // ------------------------------------------------------------------------
    // Public API
    // ------------------------------------------------------------------------

    /// Connect to a target string (`ip:port`, a socket path, or `@name` for
    /// the abstract namespace). Any previous attempt or session is torn
    /// down first.
    pub fn connect(&self, target: &str, config: ConnectConfig) -> Result<()> {
        self.connect_target(ConnectTarget::parse(target)?, config)
    }

    /// Connect to a TCP address.
    pub fn connect_addr(&self, addr: SocketAddr, config: ConnectConfig) -> Result<()> {
        self.connect_target(ConnectTarget::Tcp(addr), config)
    }

    /// Connect to a local socket by name, bypassing address parsing.
    pub fn connect_local(&self, name: &str, config: ConnectConfig) -> Result<()> {
        let target = match name.strip_prefix('@') {
            Some("") => return Err(LinkError::InvalidTarget(name.to_string())),
            Some(abstract_name) => ConnectTarget::Abstract(abstract_name.to_string()),
            None if name.is_empty() => return Err(LinkError::InvalidTarget(name.to_string())),
            None => ConnectTarget::Local(name.to_string()),
        };
        self.connect_target(target, config)
    }

    /// Connect to an already parsed target.
    pub fn connect_target(&self, target: ConnectTarget, config: ConnectConfig) -> Result<()> {
        self.close();
        self.config.set(config.clamped());
        *self.target.borrow_mut() = Some(target);
        self.try_connect()
    }

    /// Tear down any pending attempt, session and scheduled retry. Emits no
    /// owner notification.
    pub fn close(&self) {
        self.manager.stop_timer(&self.timer);
        self.manager.stop_timer(&self.pong_timer);
        self.deferred.set(Deferred::None);
        if let Some(this) = self.weak_self.upgrade() {
            let as_dyn: Rc<dyn LoopEndHandler> = this;
            self.manager.loop_end_unsubscribe(&as_dyn);
        }
        let pending = self.pending_fd.replace(-1);
        if pending >= 0 {
            self.manager.close_fd(pending);
        }
        self.link.close();
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    /// Whether a connect attempt is currently in flight.
    pub fn is_connecting(&self) -> bool {
        self.pending_fd.get() >= 0
    }

    pub fn link_id(&self) -> LinkId {
        self.link.link_id()
    }

    /// Effective configuration (after clamping) of the current session.
    pub fn config(&self) -> ConnectConfig {
        self.config.get()
    }

    /// Send a frame over the established link.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.link.send(frame)
    }

    /// Send a typed message under `kind`.
    pub fn send_msg<T: serde::Serialize>(&self, kind: MsgKind, msg: &T) -> Result<()> {
        self.link.send_msg(kind, msg)
    }

    // ------------------------------------------------------------------------
    // State Machine
    // ------------------------------------------------------------------------

    fn rc_self(&self) -> Option<Rc<CtrlLinkConnector>> {
        self.weak_self.upgrade()
    }

    fn defer(&self, event: Deferred) {
        self.deferred.set(event);
        if let Some(this) = self.rc_self() {
            let as_dyn: Rc<dyn LoopEndHandler> = this;
            self.manager.loop_end_subscribe(&as_dyn);
        }
    }

    fn try_connect(&self) -> Result<()> {
        let target = self.target.borrow().clone();
        let Some(target) = target else {
            return Err(LinkError::NotConnected);
        };
        let config = self.config.get();
        debug!(%target, link_id = self.link.link_id(), "connecting");

        match socket::connect_nonblocking(&target) {
            Ok(ConnectOutcome::Connected(fd)) => {
                let Some(this) = self.rc_self() else {
                    unsafe { libc::close(fd) };
                    return Err(LinkError::NotConnected);
                };
                let handler: Rc<dyn FdEventHandler> = this;
                if let Err(err) = self.manager.set_fd_handler(fd, &handler, FdEvents::READ) {
                    unsafe { libc::close(fd) };
                    return Err(err.into());
                }
                self.establish(fd);
                Ok(())
            }
            Ok(ConnectOutcome::InProgress(fd)) => {
                let Some(this) = self.rc_self() else {
                    unsafe { libc::close(fd) };
                    return Err(LinkError::NotConnected);
                };
                let handler: Rc<dyn FdEventHandler> = this;
                // Write readiness (or a readable error condition) signals
                // connect completion.
                let interest = FdEvents::READ.with(FdEvents::WRITE);
                if let Err(err) = self.manager.set_fd_handler(fd, &handler, interest) {
                    unsafe { libc::close(fd) };
                    return Err(err.into());
                }
                self.pending_fd.set(fd);
                if config.connect_timeout > Duration::ZERO {
                    self.manager.start_timer(&self.timer, config.connect_timeout);
                }
                Ok(())
            }
            Err(DialError::Fatal(err)) => Err(err.into()),
            Err(DialError::Refused(err)) => {
                if config.restart_delay > Duration::ZERO {
                    debug!(%err, delay = ?config.restart_delay, "connect refused, retry scheduled");
                    self.manager.start_timer(&self.timer, config.restart_delay);
                    self.defer(Deferred::ConnectFailed);
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Connect-completion readiness arrived; decide success or failure from
    /// the socket's pending error.
    fn finish_connect(&self) {
        let fd = self.pending_fd.replace(-1);
        self.manager.stop_timer(&self.timer);
        match socket::take_socket_error(fd) {
            Ok(None) => {
                if let Err(err) = self.manager.set_fd_events(fd, FdEvents::READ) {
                    warn!(%err, "failed to adjust interest on connected fd");
                    self.manager.close_fd(fd);
                    self.attempt_failed();
                    return;
                }
                self.establish(fd);
            }
            Ok(Some(err)) => {
                debug!(%err, "connect attempt failed");
                self.manager.close_fd(fd);
                self.attempt_failed();
            }
            Err(err) => {
                warn!(%err, "failed to read socket error status");
                self.manager.close_fd(fd);
                self.attempt_failed();
            }
        }
    }

    /// Enter connected state. The fd is already registered for read
    /// interest; the owner is notified at loop-end.
    fn establish(&self, fd: RawFd) {
        self.link.adopt_fd(fd);
        let config = self.config.get();
        if config.ping_interval > Duration::ZERO {
            self.manager.start_timer(&self.timer, config.ping_interval);
        }
        debug!(
            link_id = self.link.link_id(),
            local = %socket::local_addr_string(fd),
            "link established"
        );
        self.defer(Deferred::Connected);
    }

    /// A connect attempt failed; the descriptor is already released. Arm
    /// the retry backoff and notify the owner at loop-end.
    fn attempt_failed(&self) {
        let config = self.config.get();
        if config.restart_delay > Duration::ZERO {
            self.manager.start_timer(&self.timer, config.restart_delay);
        }
        self.defer(Deferred::ConnectFailed);
    }

    /// Keepalive tick on an established link.
    fn ping_due(&self) {
        if self.pong_timer.is_active() {
            // The previous ping was never answered.
            debug!(link_id = self.link.link_id(), "pong overdue at next ping");
            self.link_closed();
            return;
        }
        if let Err(err) = self.link.send(&Frame::ping()) {
            warn!(link_id = self.link.link_id(), %err, "ping send failed");
            self.link_closed();
            return;
        }
        let config = self.config.get();
        if config.pong_timeout > Duration::ZERO {
            self.manager.start_timer(&self.pong_timer, config.pong_timeout);
        }
        self.manager.start_timer(&self.timer, config.ping_interval);
    }

    /// An established session went down. Stops all timers, releases the
    /// descriptor, schedules the near-immediate reconnect and notifies the
    /// owner.
    fn link_closed(&self) {
        self.manager.stop_timer(&self.timer);
        self.manager.stop_timer(&self.pong_timer);
        let link_id = self.link.link_id();
        self.link.close();
        if self.config.get().restart_delay > Duration::ZERO {
            self.manager.start_timer(&self.timer, RECONNECT_DELAY);
        }
        debug!(link_id, "link closed");
        // A connected notification still parked for loop-end belongs to the
        // session that just ended; deliver it before the close so the owner
        // never observes them in the reverse order.
        let parked = self.deferred.replace(Deferred::None);
        if let Some(owner) = self.owner.upgrade() {
            if parked == Deferred::Connected {
                owner.ctrl_link_connected(link_id);
            }
            owner.ctrl_link_closed(link_id);
        }
    }
}

// ----------------------------------------------------------------------------
// Reactor Callbacks
// ----------------------------------------------------------------------------

impl FdEventHandler for CtrlLinkConnector {
    fn receive_fd_event(&self, _fd: RawFd, events: FdEvents) {
        if self.pending_fd.get() >= 0 {
            self.finish_connect();
            return;
        }
        if self.link.handle_fd_event(events) == LinkActivity::Closed {
            self.link_closed();
        }
    }
}

impl TimerOwner for CtrlLinkConnector {
    fn timer_expired(&self, timer: &Timer) {
        if *timer == self.pong_timer {
            debug!(link_id = self.link.link_id(), "pong timeout");
            self.link_closed();
            return;
        }
        if self.pending_fd.get() >= 0 {
            let fd = self.pending_fd.replace(-1);
            debug!(link_id = self.link.link_id(), "connect attempt timed out");
            self.manager.close_fd(fd);
            self.attempt_failed();
        } else if self.link.is_connected() {
            self.ping_due();
        } else if let Err(err) = self.try_connect() {
            // A fatal error during an async retry has no caller to return
            // to; report it through the failure callback.
            warn!(%err, "reconnect attempt failed");
            self.defer(Deferred::ConnectFailed);
        }
    }
}

impl LoopEndHandler for CtrlLinkConnector {
    fn loop_end_marker(&self) -> &LoopEndMarker {
        &self.marker
    }

    fn receive_loop_end_event(&self) {
        let event = self.deferred.replace(Deferred::None);
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        match event {
            Deferred::Connected => owner.ctrl_link_connected(self.link.link_id()),
            Deferred::ConnectFailed => owner.ctrl_link_connect_failed(self.link.link_id()),
            Deferred::None => {}
        }
    }
}

impl CtrlLinkOwner for CtrlLinkConnector {
    fn ctrl_msg_received(&self, link_id: LinkId, kind: MsgKind, payload: Vec<u8>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.ctrl_msg_received(link_id, kind, payload);
        }
    }

    fn ctrl_subscription_msg_received(&self, link_id: LinkId, payload: Vec<u8>) {
        if let Some(owner) = self.owner.upgrade() {
            owner.ctrl_subscription_msg_received(link_id, payload);
        }
    }
}

impl PongListener for CtrlLinkConnector {
    fn pong_received(&self, link_id: LinkId) {
        trace!(link_id, "pong received");
        self.manager.stop_timer(&self.pong_timer);
    }
}

impl Drop for CtrlLinkConnector {
    fn drop(&mut self) {
        self.manager.stop_timer(&self.timer);
        self.manager.stop_timer(&self.pong_timer);
        let pending = self.pending_fd.replace(-1);
        if pending >= 0 {
            self.manager.close_fd(pending);
        }
        // The link's own Drop releases its descriptor.
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pong_timeout_clamps_up_to_ping_interval() {
        let config = ConnectConfig {
            restart_delay: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            ping_interval: Duration::from_millis(1000),
            pong_timeout: Duration::from_millis(200),
        }
        .clamped();
        assert_eq!(config.pong_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_clamp_never_lowers_pong_timeout() {
        let config = ConnectConfig {
            restart_delay: Duration::ZERO,
            connect_timeout: Duration::ZERO,
            ping_interval: Duration::from_millis(100),
            pong_timeout: Duration::from_millis(500),
        }
        .clamped();
        assert_eq!(config.pong_timeout, Duration::from_millis(500));
    }

    #[test]
    fn test_zero_pong_timeout_stays_disabled() {
        let config = ConnectConfig {
            ping_interval: Duration::from_millis(100),
            ..ConnectConfig::default()
        }
        .clamped();
        assert_eq!(config.pong_timeout, Duration::ZERO);
    }
}
