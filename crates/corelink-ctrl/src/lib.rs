//! Control-link layer over the corelink reactor
//!
//! A [`CtrlLink`] turns one connected descriptor into a session of typed,
//! length-prefixed frames. A [`CtrlLinkConnector`] wraps a link with the
//! full client-side lifecycle: non-blocking connect with timeout, retry
//! with backoff, keepalive ping/pong liveness detection and automatic
//! reconnect after an established session drops.
//!
//! Everything here runs on the reactor thread; owner callbacks are plain
//! trait objects invoked synchronously, with connection-establishment
//! notifications deferred to loop-end so they never fire inside the caller's
//! own `connect` call stack.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod connector;
pub mod errors;
pub mod frame;
pub mod link;
mod socket;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use connector::{ConnectConfig, CtrlLinkConnector, CtrlLinkConnectorOwner};
pub use errors::{LinkError, Result};
pub use frame::{Frame, FrameError, MsgKind, HEADER_LEN, MAX_PAYLOAD};
pub use link::{CtrlLink, CtrlLinkOwner, LinkActivity, LinkId, PongListener};
pub use socket::ConnectTarget;
