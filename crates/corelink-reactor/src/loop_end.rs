//! Loop-end deferred-callback queue.
//!
//! A handler subscribed during an iteration runs exactly once, at the end of
//! that iteration, before the next one begins. Subscriptions are
//! deduplicated per generation, so a burst of redundant notifications
//! collapses into one callback. A handler that re-subscribes from inside its
//! own callback lands in the next generation and is not visited again in the
//! same drain pass.

use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

// ----------------------------------------------------------------------------
// Marker and Handler Trait
// ----------------------------------------------------------------------------

/// Generation tag embedded in every loop-end handler.
///
/// Records the queue generation the handler was last enqueued under; the
/// queue uses it to make `subscribe` idempotent within one generation.
#[derive(Debug, Default)]
pub struct LoopEndMarker {
    enqueued_in: Cell<u32>,
}

impl LoopEndMarker {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Receiver of loop-end notifications.
pub trait LoopEndHandler {
    /// Marker cell the queue uses to deduplicate subscriptions.
    fn loop_end_marker(&self) -> &LoopEndMarker;

    /// The iteration the handler subscribed in is ending.
    fn receive_loop_end_event(&self);
}

// ----------------------------------------------------------------------------
// Queue
// ----------------------------------------------------------------------------

/// Pending/draining queue pair with a rotating generation counter.
///
/// The generation counter wraps and skips 0; marker value 0 always means
/// "not enqueued".
pub(crate) struct LoopEndQueue {
    pending: VecDeque<Weak<dyn LoopEndHandler>>,
    draining: VecDeque<Weak<dyn LoopEndHandler>>,
    current_id: u32,
}

impl LoopEndQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            draining: VecDeque::new(),
            current_id: 1,
        }
    }

    /// Enqueue the handler for the end of the current iteration. A second
    /// subscription in the same generation is a no-op.
    pub(crate) fn subscribe(&mut self, handler: &Rc<dyn LoopEndHandler>) {
        let marker = handler.loop_end_marker();
        if marker.enqueued_in.get() == self.current_id {
            return;
        }
        marker.enqueued_in.set(self.current_id);
        self.pending.push_back(Rc::downgrade(handler));
    }

    /// Remove the handler from both the pending and the draining queue.
    pub(crate) fn unsubscribe(&mut self, handler: &Rc<dyn LoopEndHandler>) {
        handler.loop_end_marker().enqueued_in.set(0);
        let target = Rc::downgrade(handler);
        self.pending.retain(|h| !h.ptr_eq(&target));
        self.draining.retain(|h| !h.ptr_eq(&target));
    }

    /// Whether anything is queued for the current iteration. The reactor
    /// must not block indefinitely while this holds.
    pub(crate) fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Whether both queues are empty.
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty() && self.draining.is_empty()
    }

    /// Swap the pending subscriptions into the draining queue and advance
    /// the generation. Returns whether there is anything to run.
    pub(crate) fn begin_drain(&mut self) -> bool {
        debug_assert!(self.draining.is_empty());
        std::mem::swap(&mut self.pending, &mut self.draining);
        self.current_id = self.current_id.wrapping_add(1);
        if self.current_id == 0 {
            self.current_id = 1;
        }
        !self.draining.is_empty()
    }

    /// Pop the next handler of the current drain pass. Clears the marker so
    /// the handler may immediately re-subscribe into the new generation.
    pub(crate) fn next_draining(&mut self) -> Option<Rc<dyn LoopEndHandler>> {
        while let Some(weak) = self.draining.pop_front() {
            if let Some(handler) = weak.upgrade() {
                handler.loop_end_marker().enqueued_in.set(0);
                return Some(handler);
            }
        }
        None
    }

    /// Drop everything. Used only during forced shutdown.
    pub(crate) fn clear(&mut self) {
        for weak in self.pending.drain(..).chain(self.draining.drain(..)) {
            if let Some(handler) = weak.upgrade() {
                handler.loop_end_marker().enqueued_in.set(0);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
