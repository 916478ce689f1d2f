//! Error types for the reactor core.

use std::io;

// ----------------------------------------------------------------------------
// Error Types
// ----------------------------------------------------------------------------

/// Errors surfaced by the event manager and its registries.
#[derive(Debug, thiserror::Error)]
pub enum ReactorError {
    /// Graceful shutdown was refused because timers, handlers or
    /// descriptors are still registered, or an operation was attempted on a
    /// manager that has already been torn down.
    #[error("event manager is in the wrong state for this operation")]
    WrongState,

    /// A caller violated an API precondition.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The platform wait primitive or a descriptor operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ReactorError>;
