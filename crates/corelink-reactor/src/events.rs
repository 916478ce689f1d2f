//! Descriptor interest masks and the fd readiness callback trait.

use std::os::unix::io::RawFd;

// ----------------------------------------------------------------------------
// Fd Event Mask
// ----------------------------------------------------------------------------

/// Readiness interest (and report) mask for one descriptor.
///
/// A registered descriptor may legitimately carry an empty mask; it stays in
/// the fd table but the wait primitive is not asked for readiness on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdEvents(u8);

impl FdEvents {
    /// No interest.
    pub const NONE: Self = Self(0x00);

    /// Readable interest.
    pub const READ: Self = Self(0x01);

    /// Writable interest.
    pub const WRITE: Self = Self(0x02);

    /// Create a mask from a raw byte.
    pub const fn new(value: u8) -> Self {
        Self(value & 0x03)
    }

    /// Get the raw byte value.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Check whether the read bit is set.
    pub const fn readable(self) -> bool {
        (self.0 & Self::READ.0) != 0
    }

    /// Check whether the write bit is set.
    pub const fn writable(self) -> bool {
        (self.0 & Self::WRITE.0) != 0
    }

    /// Mask with the given bits added.
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Mask with the given bits cleared.
    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Check whether no bit is set.
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl Default for FdEvents {
    fn default() -> Self {
        Self::NONE
    }
}

// ----------------------------------------------------------------------------
// Fd Event Handler
// ----------------------------------------------------------------------------

/// Receiver of descriptor readiness reports.
///
/// Implementors use interior mutability; the reactor invokes the callback
/// with a shared reference, synchronously on the loop thread. The handler is
/// free to call back into the event manager (change interest, close the fd,
/// start timers) from inside the callback.
pub trait FdEventHandler {
    /// One or more of the subscribed events became ready on `fd`.
    fn receive_fd_event(&self, fd: RawFd, events: FdEvents);
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_bits() {
        let mask = FdEvents::READ.with(FdEvents::WRITE);
        assert!(mask.readable());
        assert!(mask.writable());
        assert!(!mask.is_empty());

        let mask = mask.without(FdEvents::READ);
        assert!(!mask.readable());
        assert!(mask.writable());
        assert_eq!(mask, FdEvents::WRITE);
    }

    #[test]
    fn test_new_ignores_unknown_bits() {
        assert_eq!(FdEvents::new(0xFF), FdEvents::READ.with(FdEvents::WRITE));
        assert_eq!(FdEvents::new(0x00), FdEvents::NONE);
    }
}
