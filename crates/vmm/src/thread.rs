//! Per-thread slot for address-space state.
//!
//! Every thread carries its active address space, the state of its user-access guard, the
//! "fault expected" marker consulted by the fault handler, and the sticky user fault flag.
//!
//! Kernel builds are single-CPU, so the running thread's slot is one static that the context
//! switch layer swaps with [`ThreadState::exchange`]. In test/software-emulation mode each host
//! thread has its own slot.

use alloc::sync::Arc;

use crate::AddressSpace;

/// Where a thread is in the user-access guard state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum AccessState {
    #[default]
    Idle,
    Locked,
    Suspended,
}

/// Address-space state owned by one thread.
#[derive(Default)]
pub struct ThreadState {
    pub(crate) space: Option<Arc<AddressSpace>>,
    pub(crate) access: AccessState,
    pub(crate) guarded: usize,
    pub(crate) fault: bool,
}

impl ThreadState {
    /// Creates the state of a thread that has not run yet.
    pub const fn new() -> Self {
        Self {
            space: None,
            access: AccessState::Idle,
            guarded: 0,
            fault: false,
        }
    }

    /// Returns the address space this thread runs in, if one has been switched to.
    pub fn space(&self) -> Option<&Arc<AddressSpace>> {
        self.space.as_ref()
    }

    /// Installs `next` as the running thread's state and returns the outgoing one.
    ///
    /// Called by the context switch layer around every switch. A thread that is inside a
    /// guarded access cannot be switched out.
    ///
    /// # Panics
    ///
    /// Panics if the outgoing thread is in the middle of a guarded access.
    pub fn exchange(next: ThreadState) -> ThreadState {
        let previous = with(|state| core::mem::replace(state, next));
        assert_eq!(previous.guarded, 0, "context switch during a guarded user access");
        previous
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static CURRENT: spin::Mutex<ThreadState> = spin::Mutex::new(ThreadState::new());

#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static CURRENT: core::cell::RefCell<ThreadState> =
        const { core::cell::RefCell::new(ThreadState::new()) };
}

/// Runs `f` with the running thread's state.
///
/// Calls must not nest, and `f` must not drop an address space.
pub(crate) fn with<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        f(&mut CURRENT.lock())
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        CURRENT.with(|state| f(&mut state.borrow_mut()))
    }
}

/// Returns the running thread's address space.
pub(crate) fn current_space() -> Option<Arc<AddressSpace>> {
    with(|state| state.space.clone())
}
