//! Signal and child-process registries.
//!
//! OS signals are delivered as atomic flags set from the real handler
//! context via `signal-hook`; the reactor drains those flags inside its own
//! check phase, so subscriber callbacks never run in signal-handler context.
//! Child exits are observed with per-pid non-blocking `waitpid` from the
//! same phase. Only the primary event manager installs OS-level hooks.

use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::SigId;
use tracing::warn;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Signals the primary manager installs OS-level hooks for once any handler
/// subscribes. Every subscriber sees every delivered signal.
pub const WATCHED_SIGNALS: &[i32] = &[
    signal_hook::consts::SIGHUP,
    signal_hook::consts::SIGINT,
    signal_hook::consts::SIGTERM,
    signal_hook::consts::SIGUSR1,
    signal_hook::consts::SIGUSR2,
];

// ----------------------------------------------------------------------------
// Handler Traits
// ----------------------------------------------------------------------------

/// Receiver of OS signal notifications.
///
/// Dispatch has no "handled, stop propagating" semantics; every subscriber
/// is invoked for every delivered signal.
pub trait SignalHandler {
    fn receive_signal_event(&self, signal: i32);
}

/// Receiver of child-process exit notifications.
pub trait ChildHandler {
    /// The registered child exited. `status` is the raw wait status;
    /// interpret it with `libc::WIFEXITED` and friends.
    fn child_exited(&self, pid: i32, status: i32);
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

struct WatchedFlag {
    signal: i32,
    flag: Arc<AtomicBool>,
    sig_id: SigId,
}

pub(crate) struct SignalRegistry {
    /// Whether this registry may install OS-level hooks (primary manager).
    install_hooks: bool,
    flags: Vec<WatchedFlag>,
    sigchld: Option<WatchedFlag>,
    handlers: Vec<Weak<dyn SignalHandler>>,
    children: HashMap<i32, Weak<dyn ChildHandler>>,
}

impl SignalRegistry {
    pub(crate) fn new(install_hooks: bool) -> Self {
        Self {
            install_hooks,
            flags: Vec::new(),
            sigchld: None,
            handlers: Vec::new(),
            children: HashMap::new(),
        }
    }

    fn register_flag(signal: i32) -> io::Result<WatchedFlag> {
        let flag = Arc::new(AtomicBool::new(false));
        let sig_id = signal_hook::flag::register(signal, flag.clone())?;
        Ok(WatchedFlag {
            signal,
            flag,
            sig_id,
        })
    }

    fn ensure_signal_hooks(&mut self) -> io::Result<()> {
        if !self.install_hooks || !self.flags.is_empty() {
            return Ok(());
        }
        for &signal in WATCHED_SIGNALS {
            self.flags.push(Self::register_flag(signal)?);
        }
        Ok(())
    }

    fn ensure_sigchld_hook(&mut self) -> io::Result<()> {
        if !self.install_hooks || self.sigchld.is_some() {
            return Ok(());
        }
        self.sigchld = Some(Self::register_flag(signal_hook::consts::SIGCHLD)?);
        Ok(())
    }

    /// Add a signal subscriber. Deduplicated on insert.
    pub(crate) fn subscribe(&mut self, handler: &Rc<dyn SignalHandler>) -> io::Result<()> {
        let target = Rc::downgrade(handler);
        if self.handlers.iter().any(|h| h.ptr_eq(&target)) {
            return Ok(());
        }
        self.ensure_signal_hooks()?;
        self.handlers.push(target);
        Ok(())
    }

    pub(crate) fn unsubscribe(&mut self, handler: &Rc<dyn SignalHandler>) {
        let target = Rc::downgrade(handler);
        self.handlers.retain(|h| !h.ptr_eq(&target));
    }

    /// Register a handler for one child pid, replacing any previous one.
    pub(crate) fn set_child_handler(
        &mut self,
        pid: i32,
        handler: &Rc<dyn ChildHandler>,
    ) -> io::Result<()> {
        self.ensure_sigchld_hook()?;
        self.children.insert(pid, Rc::downgrade(handler));
        Ok(())
    }

    pub(crate) fn remove_child_handler(&mut self, pid: i32) {
        self.children.remove(&pid);
    }

    /// Signals whose flag fired since the last check, in watched order.
    pub(crate) fn take_pending(&mut self) -> Vec<i32> {
        self.handlers.retain(|h| h.upgrade().is_some());
        let mut pending = Vec::new();
        for watched in &self.flags {
            if watched.flag.swap(false, Ordering::Relaxed) {
                pending.push(watched.signal);
            }
        }
        if let Some(sigchld) = &self.sigchld {
            // The flag only wakes the loop; reaping is driven by the
            // registered pids below.
            sigchld.flag.swap(false, Ordering::Relaxed);
        }
        pending
    }

    /// Snapshot of the live subscribers.
    pub(crate) fn handler_snapshot(&self) -> Vec<Rc<dyn SignalHandler>> {
        self.handlers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Non-blocking check of every registered child pid. Returns the exited
    /// children with their raw wait status and handler, already removed
    /// from the registry.
    pub(crate) fn reap(&mut self) -> Vec<(i32, i32, Rc<dyn ChildHandler>)> {
        if self.children.is_empty() {
            return Vec::new();
        }
        let mut exited = Vec::new();
        let pids: Vec<i32> = self.children.keys().copied().collect();
        for pid in pids {
            let mut status: libc::c_int = 0;
            let rc = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
            if rc == 0 {
                continue;
            }
            let handler = self.children.remove(&pid).and_then(|h| h.upgrade());
            if rc < 0 {
                warn!(pid, "waitpid failed for registered child; dropping entry");
                continue;
            }
            if let Some(handler) = handler {
                exited.push((pid, status, handler));
            }
        }
        exited
    }

    /// Whether the reactor should cap its wait timeout to observe signal or
    /// child state that arrives outside descriptor readiness.
    pub(crate) fn wants_periodic_check(&self) -> bool {
        !self.children.is_empty() || self.handlers.iter().any(|h| h.upgrade().is_some())
    }

    /// Whether nothing (live) is registered. Used by the graceful-shutdown
    /// emptiness check.
    pub(crate) fn is_registry_empty(&self) -> bool {
        self.children.is_empty() && !self.handlers.iter().any(|h| h.upgrade().is_some())
    }

    /// Drop all subscribers and uninstall OS-level hooks.
    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
        self.children.clear();
        for watched in self.flags.drain(..) {
            signal_hook::low_level::unregister(watched.sig_id);
        }
        if let Some(sigchld) = self.sigchld.take() {
            signal_hook::low_level::unregister(sigchld.sig_id);
        }
    }
}

impl Drop for SignalRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}
