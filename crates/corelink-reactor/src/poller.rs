//! Linux `epoll`-based wait primitive.
//!
//! Level-triggered, with the descriptor number itself used as the token.
//! The rest of the reactor only depends on the contract "given registered
//! (fd, interest) pairs and a timeout, block and report which fds are ready
//! for which of read/write"; any readiness-style multiplexer could stand in.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use libc::{
    epoll_create1, epoll_ctl, epoll_event, epoll_wait, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT,
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD,
};

use crate::events::FdEvents;

/// Reusable readiness buffer size per wait call.
const EVENT_CAPACITY: usize = 64;

pub(crate) struct Poller {
    epoll: RawFd,
    events: Vec<epoll_event>,
}

impl Poller {
    pub(crate) fn new() -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epoll,
            events: Vec::with_capacity(EVENT_CAPACITY),
        })
    }

    fn interest_flags(interest: FdEvents) -> u32 {
        let mut flags = 0;
        if interest.readable() {
            flags |= EPOLLIN;
        }
        if interest.writable() {
            flags |= EPOLLOUT;
        }
        flags as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: FdEvents) -> io::Result<()> {
        let mut event = epoll_event {
            events: Self::interest_flags(interest),
            u64: fd as u64,
        };
        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Register a descriptor with its initial interest mask.
    pub(crate) fn register(&self, fd: RawFd, interest: FdEvents) -> io::Result<()> {
        self.ctl(EPOLL_CTL_ADD, fd, interest)
    }

    /// Update interest for an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, interest: FdEvents) -> io::Result<()> {
        self.ctl(EPOLL_CTL_MOD, fd, interest)
    }

    /// Remove a descriptor. The descriptor may already be closed; there is
    /// nothing useful to report in that case.
    pub(crate) fn deregister(&self, fd: RawFd) {
        unsafe {
            epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut());
        }
    }

    /// Block until readiness, the timeout, or a signal. A signal interrupt
    /// reports an empty set so the loop proceeds to its check phases.
    pub(crate) fn wait(&mut self, timeout: Option<Duration>) -> io::Result<Vec<(RawFd, FdEvents)>> {
        // Round fractional milliseconds up so a near-due timer does not spin.
        let timeout_ms = match timeout {
            Some(t) => t
                .as_nanos()
                .div_ceil(1_000_000)
                .min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = unsafe {
            epoll_wait(
                self.epoll,
                self.events.as_mut_ptr(),
                self.events.capacity() as i32,
                timeout_ms,
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        unsafe {
            self.events.set_len(n as usize);
        }

        let mut ready = Vec::with_capacity(n as usize);
        for ev in &self.events {
            let fd = ev.u64 as RawFd;
            let mut mask = FdEvents::NONE;
            // Errors and hangups surface as readability; the read will
            // report the actual condition.
            if ev.events & ((EPOLLIN | EPOLLERR | EPOLLHUP) as u32) != 0 {
                mask = mask.with(FdEvents::READ);
            }
            if ev.events & (EPOLLOUT as u32) != 0 {
                mask = mask.with(FdEvents::WRITE);
            }
            ready.push((fd, mask));
        }
        Ok(ready)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll);
        }
    }
}
