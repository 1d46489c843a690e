//! Scheduler interface used by the address-space locks.
//!
//! The locks need three things from the scheduler: the identity of the running thread, a way to
//! block and wake on a wait channel, and whether a signal is pending for the running thread so
//! interruptible acquisitions can give up instead of sleeping through it.

use core::{fmt, sync::atomic::AtomicU64};

/// Identifies a kernel thread.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    /// Creates a thread id from its raw value.
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw thread id.
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

/// Thread scheduler services consumed by this crate.
pub trait Scheduler: Sync {
    /// Returns the running thread.
    fn current_thread(&self) -> ThreadId;

    /// Returns true if a signal is pending for the running thread.
    fn signal_pending(&self) -> bool;

    /// Blocks the running thread on `channel` until a matching [`wakeup`](Self::wakeup), unless
    /// `word` no longer holds `expected`.
    ///
    /// The thread must be queued on `channel` before `word` is compared, so a waker that changes
    /// `word` and then calls [`wakeup`](Self::wakeup) either stops the sleep or ends it. Spurious
    /// returns are allowed, and a pending signal may end the wait early; callers re-check their
    /// condition.
    fn wait(&self, channel: usize, word: &AtomicU64, expected: u64);

    /// Wakes every thread waiting on `channel`.
    fn wakeup(&self, channel: usize);
}

static SCHEDULER: spin::Once<&'static dyn Scheduler> = spin::Once::new();

/// Installs the kernel scheduler.
///
/// This function must be called exactly once during initialization, before any address space
/// lock is taken.
///
/// # Panics
///
/// Panics if a scheduler has already been installed.
pub fn install_scheduler(scheduler: &'static dyn Scheduler) {
    if SCHEDULER.get().is_some() {
        panic!("scheduler already installed");
    }
    SCHEDULER.call_once(|| scheduler);
}

/// Returns the installed scheduler.
///
/// # Panics
///
/// Panics if no scheduler has been installed (kernel builds only; host builds fall back to the
/// thread-backed scheduler).
pub(crate) fn current() -> &'static dyn Scheduler {
    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        *SCHEDULER
            .get()
            .expect("scheduler not installed; call install_scheduler during initialization")
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        *SCHEDULER.call_once(|| &crate::arch::software::HOST_SCHEDULER)
    }
}
