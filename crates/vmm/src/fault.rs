//! Page-fault entry point for the architecture layer.
//!
//! A fault is first offered to the faulting address space, which may resolve it by breaking
//! copy-on-write sharing or populating a page from its backing. What happens to a fault that
//! cannot be resolved depends on who took it:
//!
//! - user code gets [`Resolution::Unhandled`] and the caller delivers a signal;
//! - kernel code inside a guarded user access gets [`Resolution::Recovered`], and the thread's
//!   sticky fault flag is set for the copy routine to report;
//! - any other kernel fault is a kernel bug and panics.

use core::fmt;

use crate::{AddressSpace, VirtualAddress, thread};

/// Kind of access that faulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    Read,
    Write,
    Execute,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Execute => "execute",
        })
    }
}

/// Privilege level the faulting access was made at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultMode {
    User,
    Kernel,
}

/// Outcome of [`handle_page_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// The page is now accessible; retry the access.
    Resolved,
    /// A guarded kernel access faulted; skip the access and continue at the recovery point.
    Recovered,
    /// A user access cannot be satisfied; the thread must be signalled.
    Unhandled,
}

/// Handles a page fault at `addr` taken while running in `space`.
///
/// # Panics
///
/// Panics if a kernel-mode fault cannot be resolved and no guarded user access is in progress.
pub fn handle_page_fault(
    space: &AddressSpace,
    addr: VirtualAddress,
    access: Access,
    mode: FaultMode,
) -> Resolution {
    #[cfg(feature = "detailed-logging")]
    log::trace!("{mode:?} {access} fault at {addr} in {:?}", space.pid());

    let error = match space.resolve_fault(addr, access) {
        Ok(()) => return Resolution::Resolved,
        Err(error) => error,
    };

    match mode {
        FaultMode::User => {
            log::warn!("unhandled user {access} fault at {addr} in {:?}: {error}", space.pid());
            Resolution::Unhandled
        }
        FaultMode::Kernel if fault_expected() => {
            log::warn!("guarded {access} of user address {addr} faulted: {error}");
            thread::with(|state| state.fault = true);
            Resolution::Recovered
        }
        FaultMode::Kernel => {
            panic!("unexpected kernel {access} fault at {addr}: {error}")
        }
    }
}

/// Returns true if the running thread is inside a guarded user access.
///
/// The architecture fault handler uses this to tell a recoverable fault on a user pointer from a
/// fault in kernel code.
pub fn fault_expected() -> bool {
    thread::with(|state| state.guarded > 0)
}

/// Marks the running thread as inside a guarded user access until dropped.
pub(crate) struct ExpectFault(());

impl ExpectFault {
    pub fn new() -> Self {
        thread::with(|state| state.guarded += 1);
        Self(())
    }
}

impl Drop for ExpectFault {
    fn drop(&mut self) {
        thread::with(|state| state.guarded -= 1);
    }
}
