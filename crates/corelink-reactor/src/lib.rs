//! Corelink reactor core
//!
//! A single-threaded, per-thread, non-blocking I/O dispatcher. One
//! [`EventManager`] multiplexes descriptor readiness, timers, deferred
//! loop-end callbacks, OS signals and child-process exits into a single
//! cooperative event loop. Every handler callback runs synchronously on the
//! thread that called [`EventManager::run`]; the only blocking point is the
//! wait primitive inside the loop body.
//!
//! Within one iteration the dispatch order is fixed: fd events, then due
//! timers, then the loop-end drain, then signal and child delivery. Code
//! scheduled during one phase is never visited again in the same iteration.

// ----------------------------------------------------------------------------
// Module Declarations
// ----------------------------------------------------------------------------

pub mod errors;
pub mod events;
pub mod loop_end;
pub mod manager;
mod poller;
pub mod signals;
pub mod timer;

// ----------------------------------------------------------------------------
// Public API
// ----------------------------------------------------------------------------

pub use errors::{ReactorError, Result};
pub use events::{FdEventHandler, FdEvents};
pub use loop_end::{LoopEndHandler, LoopEndMarker};
pub use manager::{EventManager, ShutdownHandler};
pub use signals::{ChildHandler, SignalHandler, WATCHED_SIGNALS};
pub use timer::{Timer, TimerOwner};
