//! Modify and transfer locks of an address space.
//!
//! An address space has one logical lock with two roles. The modify role is exclusive and is
//! taken by the owning task while it changes its own segment list. The transfer role is taken by
//! any context reading or writing the space's user mappings; transfer holders share the lock with
//! each other but never with a modifier. Blocked acquirers sleep on the lock's wait channel.
//!
//! Debug builds also record which threads hold the transfer role so misuse (recursive modify,
//! asking for one role while holding the other) panics at the call site instead of deadlocking.

#[cfg(debug_assertions)]
use alloc::vec::Vec;
use core::{
    marker::PhantomData,
    ops::Deref,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{AddressSpace, Error, Result, ThreadId, sched};

/// The role a lock holder plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Modify,
    Transfer,
}

#[derive(Default)]
struct Holders {
    modifier: Option<ThreadId>,
    transfers: usize,
    #[cfg(debug_assertions)]
    transfer_owners: Vec<ThreadId>,
}

impl Holders {
    #[cfg(debug_assertions)]
    fn check_reentry(&self, me: ThreadId, role: Role) {
        if self.modifier == Some(me) {
            match role {
                Role::Modify => panic!("recursive modify lock acquisition by {me:?}"),
                Role::Transfer => panic!("{me:?} requested the transfer lock while modifying"),
            }
        }
        if role == Role::Modify && self.transfer_owners.contains(&me) {
            panic!("{me:?} requested the modify lock while transferring");
        }
    }

    #[cfg(not(debug_assertions))]
    fn check_reentry(&self, _me: ThreadId, _role: Role) {}

    fn try_take(&mut self, me: ThreadId, role: Role) -> bool {
        match role {
            Role::Modify if self.modifier.is_none() && self.transfers == 0 => {
                self.modifier = Some(me);
                true
            }
            Role::Transfer if self.modifier.is_none() => {
                self.transfers += 1;
                #[cfg(debug_assertions)]
                self.transfer_owners.push(me);
                true
            }
            _ => false,
        }
    }

    fn give_back(&mut self, me: ThreadId, role: Role) {
        match role {
            Role::Modify => {
                assert_eq!(
                    self.modifier,
                    Some(me),
                    "modify lock released by a thread that does not hold it"
                );
                self.modifier = None;
            }
            Role::Transfer => {
                assert!(self.transfers > 0, "transfer lock released while not held");
                self.transfers -= 1;
                #[cfg(debug_assertions)]
                {
                    let slot = self.transfer_owners.iter().position(|owner| *owner == me);
                    match slot {
                        Some(slot) => {
                            self.transfer_owners.swap_remove(slot);
                        }
                        None => panic!("transfer lock released by {me:?}, which does not hold it"),
                    }
                }
            }
        }
    }
}

/// The lock embedded in every address space.
#[derive(Default)]
pub(crate) struct AsLock {
    holders: spin::Mutex<Holders>,
    /// Bumped by every release; sleepers pass the value they saw to the scheduler.
    releases: AtomicU64,
}

impl AsLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self) -> usize {
        self as *const Self as usize
    }

    /// Acquires `role`, sleeping while the opposing role (or another modifier) holds the lock.
    pub fn acquire(&self, role: Role) {
        let taken = self.take(role, false);
        debug_assert!(taken);
    }

    /// Like [`acquire`](Self::acquire), but gives up with [`Error::Interrupted`] instead of
    /// sleeping while a signal is pending for the running thread.
    pub fn acquire_interruptible(&self, role: Role) -> Result<()> {
        if self.take(role, true) {
            Ok(())
        } else {
            Err(Error::Interrupted)
        }
    }

    fn take(&self, role: Role, interruptible: bool) -> bool {
        let scheduler = sched::current();
        let me = scheduler.current_thread();
        loop {
            let seen = {
                let mut holders = self.holders.lock();
                holders.check_reentry(me, role);
                if holders.try_take(me, role) {
                    #[cfg(feature = "detailed-logging")]
                    log::trace!("{me:?} took the {role:?} lock at {:#x}", self.channel());
                    return true;
                }
                self.releases.load(Ordering::Acquire)
            };

            if interruptible && scheduler.signal_pending() {
                log::debug!("{me:?} interrupted waiting for the {role:?} lock");
                return false;
            }
            scheduler.wait(self.channel(), &self.releases, seen);
        }
    }

    pub fn release(&self, role: Role) {
        let scheduler = sched::current();
        let me = scheduler.current_thread();
        {
            let mut holders = self.holders.lock();
            holders.give_back(me, role);
            self.releases.fetch_add(1, Ordering::Release);
        }
        #[cfg(feature = "detailed-logging")]
        log::trace!("{me:?} released the {role:?} lock at {:#x}", self.channel());
        scheduler.wakeup(self.channel());
    }

    /// Returns true if `thread` holds the modify role.
    pub fn modified_by(&self, thread: ThreadId) -> bool {
        self.holders.lock().modifier == Some(thread)
    }

    /// Returns true if no role is held.
    pub fn is_free(&self) -> bool {
        let holders = self.holders.lock();
        holders.modifier.is_none() && holders.transfers == 0
    }
}

/// Proof that the running thread holds the modify lock of an address space.
///
/// Obtained from [`AddressSpace::begin_modify`]. The lock is released when the guard is dropped
/// or [`end`](Self::end)ed.
#[must_use = "the modify lock is released as soon as the guard is dropped"]
pub struct ModifyGuard<'a> {
    space: &'a AddressSpace,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> ModifyGuard<'a> {
    pub(crate) fn new(space: &'a AddressSpace) -> Self {
        Self {
            space,
            _thread_bound: PhantomData,
        }
    }

    /// Returns the locked address space.
    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    /// Releases the modify lock.
    pub fn end(self) {}
}

impl Deref for ModifyGuard<'_> {
    type Target = AddressSpace;

    fn deref(&self) -> &Self::Target {
        self.space
    }
}

impl Drop for ModifyGuard<'_> {
    fn drop(&mut self) {
        self.space.lock.release(Role::Modify);
    }
}

/// Proof that the running thread holds the transfer lock of an address space.
///
/// While the guard lives the space's segment list cannot change, so user addresses validated
/// through it stay valid.
#[must_use = "the transfer lock is released as soon as the guard is dropped"]
pub struct TransferGuard<'a> {
    space: &'a AddressSpace,
    _thread_bound: PhantomData<*const ()>,
}

impl<'a> TransferGuard<'a> {
    pub(crate) fn new(space: &'a AddressSpace) -> Self {
        Self {
            space,
            _thread_bound: PhantomData,
        }
    }

    /// Returns the locked address space.
    pub fn space(&self) -> &'a AddressSpace {
        self.space
    }

    /// Releases the transfer lock.
    pub fn end(self) {}
}

impl Deref for TransferGuard<'_> {
    type Target = AddressSpace;

    fn deref(&self) -> &Self::Target {
        self.space
    }
}

impl Drop for TransferGuard<'_> {
    fn drop(&mut self) {
        self.space.lock.release(Role::Transfer);
    }
}
