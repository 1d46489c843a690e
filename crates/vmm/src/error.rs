//! Error reporting for address-space and user-access operations.
//!
//! Every public operation returns a [`Result`]. Each error maps onto the negative errno value
//! the syscall layer hands back to user space.

use core::fmt;

use crate::page::AllocError;

/// Errors reported by the virtual memory manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// No usable virtual hole, no physical page, or duplication ran out of memory.
    NoMemory,
    /// A fixed-address request conflicts with an existing mapping.
    AddressInUse,
    /// Malformed request: zero length, misaligned address, unknown flag bits.
    InvalidArgument,
    /// The request is incompatible with the backing object (e.g. writing a read-only file).
    PermissionDenied,
    /// Unsupported combination of protection, backing and memory attribute.
    NotSupported,
    /// An interruptible wait was abandoned because a signal is pending.
    Interrupted,
    /// A user address is unmapped, inaccessible, or became invalid.
    Fault,
    /// A user string or array is not terminated within its bound.
    TooLong,
}

impl Error {
    /// Returns the negative errno value reported to user space.
    pub const fn errno(self) -> isize {
        match self {
            Self::NoMemory => -12,
            Self::AddressInUse => -17,
            Self::InvalidArgument => -22,
            Self::PermissionDenied => -13,
            Self::NotSupported => -95,
            Self::Interrupted => -4,
            Self::Fault => -14,
            Self::TooLong => -36,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::NoMemory => "out of memory",
            Self::AddressInUse => "address already in use",
            Self::InvalidArgument => "invalid argument",
            Self::PermissionDenied => "permission denied",
            Self::NotSupported => "unsupported backing or attribute combination",
            Self::Interrupted => "interrupted by signal",
            Self::Fault => "bad user address",
            Self::TooLong => "not terminated within bound",
        };
        f.write_str(text)
    }
}

impl From<AllocError> for Error {
    fn from(_: AllocError) -> Self {
        Self::NoMemory
    }
}

/// Result type used throughout the virtual memory manager.
pub type Result<T> = core::result::Result<T, Error>;
