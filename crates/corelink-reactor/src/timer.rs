//! Timer manager: an ordered collection of armed timers.
//!
//! Timers are owned by whichever component starts them; the manager owns
//! only the ordering structure. Expired timers fire in expiration order with
//! ties broken by start order, and a timer may be re-armed or stopped from
//! within its own expiry callback.

use std::cell::Cell;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Timer Handle
// ----------------------------------------------------------------------------

/// Receiver of timer expirations.
pub trait TimerOwner {
    /// The given timer reached its deadline and was disarmed.
    fn timer_expired(&self, timer: &Timer);
}

/// Handle to one armable timer.
///
/// Clones refer to the same underlying timer; equality is identity, so an
/// owner with several timers can tell which one fired.
#[derive(Clone)]
pub struct Timer {
    shared: Rc<TimerShared>,
}

struct TimerShared {
    owner: Weak<dyn TimerOwner>,
    /// Arm sequence the timer is currently scheduled under; 0 when idle.
    /// A heap entry whose recorded sequence no longer matches is stale.
    armed: Cell<u64>,
}

impl Timer {
    pub fn new(owner: Weak<dyn TimerOwner>) -> Self {
        Self {
            shared: Rc::new(TimerShared {
                owner,
                armed: Cell::new(0),
            }),
        }
    }

    /// Whether the timer is currently armed.
    pub fn is_active(&self) -> bool {
        self.shared.armed.get() != 0
    }
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Timer {}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("active", &self.is_active())
            .finish()
    }
}

// ----------------------------------------------------------------------------
// Timer Manager
// ----------------------------------------------------------------------------

struct Entry {
    deadline: Instant,
    seq: u64,
    shared: Weak<TimerShared>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.deadline
            .cmp(&other.deadline)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Ordered timer collection with lazy removal.
///
/// `stop` only invalidates the timer's arm sequence; the stale heap entry is
/// discarded when it reaches the front.
pub(crate) struct TimerManager {
    heap: BinaryHeap<Reverse<Entry>>,
    next_seq: u64,
}

impl TimerManager {
    pub(crate) fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            next_seq: 1,
        }
    }

    /// Arm (or re-arm) the timer to fire `delay` from now.
    pub(crate) fn start(&mut self, timer: &Timer, delay: Duration) {
        let seq = self.next_seq;
        self.next_seq += 1;
        timer.shared.armed.set(seq);
        self.heap.push(Reverse(Entry {
            deadline: Instant::now() + delay,
            seq,
            shared: Rc::downgrade(&timer.shared),
        }));
    }

    /// Disarm the timer. Safe on an inactive timer.
    pub(crate) fn stop(&mut self, timer: &Timer) {
        timer.shared.armed.set(0);
    }

    fn entry_is_live(entry: &Entry) -> bool {
        entry
            .shared
            .upgrade()
            .is_some_and(|shared| shared.armed.get() == entry.seq)
    }

    /// Earliest live deadline, or `None` when no timer is armed. Stale
    /// entries at the front are discarded as a side effect.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(entry)) = self.heap.peek() {
            if Self::entry_is_live(entry) {
                return Some(entry.deadline);
            }
            self.heap.pop();
        }
        None
    }

    /// Whether any timer is armed.
    pub(crate) fn is_empty(&mut self) -> bool {
        self.next_deadline().is_none()
    }

    /// Disarm and return every timer whose deadline has passed, in
    /// expiration order with ties broken by start order. Timers armed while
    /// the returned batch is being dispatched carry a later sequence and a
    /// future deadline, so they are never part of the same batch.
    pub(crate) fn take_due(&mut self, now: Instant) -> Vec<(Rc<dyn TimerOwner>, Timer)> {
        let mut due = Vec::new();
        while let Some(Reverse(entry)) = self.heap.peek() {
            if !Self::entry_is_live(entry) {
                self.heap.pop();
                continue;
            }
            if entry.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            if let Some(shared) = entry.shared.upgrade() {
                shared.armed.set(0);
                if let Some(owner) = shared.owner.upgrade() {
                    due.push((owner, Timer { shared }));
                }
            }
        }
        due
    }

    /// Force-clear all timer state. Used only during forced shutdown.
    pub(crate) fn remove_all(&mut self) {
        for Reverse(entry) in self.heap.drain() {
            if let Some(shared) = entry.shared.upgrade() {
                shared.armed.set(0);
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
