//! Control-link error types.

use thiserror::Error;

use crate::frame::FrameError;

#[derive(Debug, Error)]
pub enum LinkError {
    /// The connect target string matched neither `ip:port` nor a usable
    /// local-socket name.
    #[error("invalid connect target: {0}")]
    InvalidTarget(String),

    /// Socket-level failure. When returned from `connect` this is fatal; no
    /// retry has been scheduled.
    #[error("socket operation failed: {0}")]
    Socket(#[from] std::io::Error),

    /// An operation that requires an established link was called without
    /// one.
    #[error("link is not connected")]
    NotConnected,

    /// The peer sent bytes that do not parse as a frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Message payload serialization or deserialization failed.
    #[error("payload codec error: {0}")]
    Payload(#[from] bincode::Error),

    /// The underlying reactor refused an operation.
    #[error("reactor error: {0}")]
    Reactor(#[from] corelink_reactor::ReactorError),
}

pub type Result<T> = std::result::Result<T, LinkError>;
