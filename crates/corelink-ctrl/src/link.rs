//! Control link: framed message session over one connected descriptor.
//!
//! The link turns a byte stream into typed frames and back. Reads go
//! through a growable buffer; complete frames are dispatched by kind, with
//! liveness frames intercepted here (an incoming ping is answered
//! immediately, an incoming pong goes to the pong listener, neither reaches
//! the application). Writes are queued and flushed opportunistically, with
//! write-readiness interest enabled only while bytes are pending.
//!
//! The link does not register itself with the reactor; whoever drives it
//! (the connector, or a server-side acceptor) owns the fd registration and
//! forwards readiness into [`CtrlLink::handle_fd_event`].

use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};

use tracing::{debug, trace, warn};

use corelink_reactor::{EventManager, FdEvents};

use crate::errors::{LinkError, Result};
use crate::frame::{Frame, MsgKind};

/// Bytes read per readiness wakeup. Level-triggered readiness re-reports
/// the fd if more is buffered in the kernel.
const READ_CHUNK: usize = 4096;

/// Caller-assigned opaque link identifier, echoed in owner callbacks.
pub type LinkId = u64;

// ----------------------------------------------------------------------------
// Callback Traits
// ----------------------------------------------------------------------------

/// Receiver of application frames extracted by a link.
pub trait CtrlLinkOwner {
    /// A direct command or reply frame arrived.
    fn ctrl_msg_received(&self, link_id: LinkId, kind: MsgKind, payload: Vec<u8>);

    /// A standing-subscription update arrived. Dispatched separately from
    /// direct replies.
    fn ctrl_subscription_msg_received(&self, link_id: LinkId, payload: Vec<u8>);
}

/// Receiver of intercepted pong frames.
pub trait PongListener {
    fn pong_received(&self, link_id: LinkId);
}

/// Outcome of one readiness dispatch into the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkActivity {
    /// The link is still up.
    Continue,
    /// The peer closed or the stream broke. The caller decides what happens
    /// next (the connector schedules a reconnect); the descriptor is already
    /// released.
    Closed,
}

// ----------------------------------------------------------------------------
// Control Link
// ----------------------------------------------------------------------------

pub struct CtrlLink {
    manager: Rc<EventManager>,
    fd: Cell<RawFd>,
    link_id: Cell<LinkId>,
    read_buf: RefCell<Vec<u8>>,
    write_buf: RefCell<Vec<u8>>,
    owner: RefCell<Weak<dyn CtrlLinkOwner>>,
    pong_listener: RefCell<Weak<dyn PongListener>>,
}

impl CtrlLink {
    pub fn new(manager: Rc<EventManager>, owner: Weak<dyn CtrlLinkOwner>) -> Self {
        Self {
            manager,
            fd: Cell::new(-1),
            link_id: Cell::new(0),
            read_buf: RefCell::new(Vec::new()),
            write_buf: RefCell::new(Vec::new()),
            owner: RefCell::new(owner),
            pong_listener: RefCell::new(Weak::<NoPongListener>::new()),
        }
    }

    /// Direct intercepted pongs at `listener` instead of dropping them.
    pub fn set_pong_listener(&self, listener: Weak<dyn PongListener>) {
        *self.pong_listener.borrow_mut() = listener;
    }

    /// Take ownership of a connected descriptor, resetting session state.
    pub fn adopt_fd(&self, fd: RawFd) {
        debug_assert!(self.fd.get() < 0);
        self.fd.set(fd);
        self.read_buf.borrow_mut().clear();
        self.write_buf.borrow_mut().clear();
    }

    pub fn is_connected(&self) -> bool {
        self.fd.get() >= 0
    }

    pub fn fd(&self) -> RawFd {
        self.fd.get()
    }

    pub fn link_id(&self) -> LinkId {
        self.link_id.get()
    }

    pub fn set_link_id(&self, link_id: LinkId) {
        self.link_id.set(link_id);
    }

    // ------------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------------

    /// Queue a frame and flush as much as the socket accepts. Remaining
    /// bytes drain on write readiness.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let fd = self.fd.get();
        if fd < 0 {
            return Err(LinkError::NotConnected);
        }
        frame.encode_into(&mut self.write_buf.borrow_mut());
        self.flush()
    }

    /// Queue a typed message under `kind`.
    pub fn send_msg<T: serde::Serialize>(&self, kind: MsgKind, msg: &T) -> Result<()> {
        self.send(&Frame::encode_msg(kind, msg)?)
    }

    fn flush(&self) -> Result<()> {
        let fd = self.fd.get();
        let mut buf = self.write_buf.borrow_mut();
        while !buf.is_empty() {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(err.into()),
                }
            }
            buf.drain(..n as usize);
        }
        let pending = !buf.is_empty();
        drop(buf);
        if pending {
            self.manager.enable_write_events(fd)?;
        } else {
            self.manager.disable_write_events(fd)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Receiving
    // ------------------------------------------------------------------------

    /// Dispatch one readiness report. On [`LinkActivity::Closed`] the
    /// descriptor has already been released.
    pub fn handle_fd_event(&self, events: FdEvents) -> LinkActivity {
        if events.readable() {
            match self.read_ready() {
                Ok(LinkActivity::Continue) => {}
                Ok(LinkActivity::Closed) => {
                    self.close();
                    return LinkActivity::Closed;
                }
                Err(err) => {
                    warn!(link_id = self.link_id.get(), %err, "read failed, closing link");
                    self.close();
                    return LinkActivity::Closed;
                }
            }
        }
        if events.writable() && self.fd.get() >= 0 {
            if let Err(err) = self.flush() {
                warn!(link_id = self.link_id.get(), %err, "flush failed, closing link");
                self.close();
                return LinkActivity::Closed;
            }
        }
        LinkActivity::Continue
    }

    fn read_ready(&self) -> Result<LinkActivity> {
        let fd = self.fd.get();
        let mut chunk = [0u8; READ_CHUNK];
        let n = loop {
            let n = unsafe { libc::read(fd, chunk.as_mut_ptr() as *mut libc::c_void, READ_CHUNK) };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => return Ok(LinkActivity::Continue),
                io::ErrorKind::Interrupted => continue,
                _ => return Err(err.into()),
            }
        };
        if n == 0 {
            debug!(link_id = self.link_id.get(), "peer closed the link");
            return Ok(LinkActivity::Closed);
        }
        self.read_buf.borrow_mut().extend_from_slice(&chunk[..n]);
        self.dispatch_frames()
    }

    /// Extract and dispatch every complete frame in the read buffer.
    fn dispatch_frames(&self) -> Result<LinkActivity> {
        loop {
            // The buffer is not borrowed across the dispatch call; a handler
            // may send (and thereby flush) from inside its callback.
            let extracted = Frame::extract(&self.read_buf.borrow())?;
            let Some((frame, consumed)) = extracted else {
                return Ok(LinkActivity::Continue);
            };
            self.read_buf.borrow_mut().drain(..consumed);
            trace!(link_id = self.link_id.get(), kind = ?frame.kind, len = frame.payload.len(), "frame received");
            match frame.kind {
                MsgKind::Ping => {
                    // Liveness probes are answered here, never surfaced.
                    self.send(&Frame::pong())?;
                }
                MsgKind::Pong => {
                    if let Some(listener) = self.pong_listener.borrow().upgrade() {
                        listener.pong_received(self.link_id.get());
                    }
                }
                MsgKind::SubscriptionReply => {
                    if let Some(owner) = self.owner.borrow().upgrade() {
                        owner.ctrl_subscription_msg_received(self.link_id.get(), frame.payload);
                    }
                }
                MsgKind::Command | MsgKind::Reply => {
                    if let Some(owner) = self.owner.borrow().upgrade() {
                        owner.ctrl_msg_received(self.link_id.get(), frame.kind, frame.payload);
                    }
                }
            }
            if self.fd.get() < 0 {
                // A callback closed the link; drop whatever remains.
                return Ok(LinkActivity::Closed);
            }
        }
    }

    /// Release the descriptor and session buffers. Idempotent.
    pub fn close(&self) {
        let fd = self.fd.replace(-1);
        if fd >= 0 {
            self.manager.close_fd(fd);
        }
        self.read_buf.borrow_mut().clear();
        self.write_buf.borrow_mut().clear();
    }
}

impl Drop for CtrlLink {
    fn drop(&mut self) {
        self.close();
    }
}

/// Standalone registration support for server-side (accepted-fd) links
/// that are driven directly by the reactor rather than by a connector. A
/// broken stream has already released its descriptor by the time this
/// returns; observers learn of it through `is_connected`.
impl corelink_reactor::FdEventHandler for CtrlLink {
    fn receive_fd_event(&self, _fd: RawFd, events: FdEvents) {
        let _ = self.handle_fd_event(events);
    }
}

/// Placeholder type for the initial empty pong-listener weak reference.
struct NoPongListener;

impl PongListener for NoPongListener {
    fn pong_received(&self, _link_id: LinkId) {}
}
