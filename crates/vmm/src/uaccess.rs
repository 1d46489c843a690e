//! Guarded access to user memory.
//!
//! Kernel code that dereferences a user-supplied pointer does so through a [`UserAccess`]
//! token. Taking the token locks the running thread's address space in the transfer role, so
//! the segment list cannot change underneath a validated pointer. A thread that has to block
//! while it still owns a user buffer [`suspend`](UserAccess::suspend)s the token, which drops
//! the lock, and [`resume`](SuspendedAccess::resume)s it afterwards, which re-takes the lock and
//! re-validates the buffer against whatever the space looks like now.
//!
//! Every access made through [`UserMemory`] is guarded: a fault on the user address sets the
//! thread's sticky fault flag instead of bringing the kernel down, and the copy routines turn a
//! set flag into [`Error::Fault`]. The flag stays set until [`clear_fault`] is called.

use alloc::{sync::Arc, vec::Vec};
use core::marker::PhantomData;

use crate::{
    AddressSpace, Error, PAGE_SIZE, Protection, Result, TransferGuard, VirtualAddress, WORD_SIZE,
    arch,
    fault::Access,
    layout,
    lock::Role,
    thread::{self, AccessState},
};

/// Returns the protection needed for `access`.
fn required(access: Access) -> Protection {
    match access {
        Access::Read => Protection::READ,
        Access::Write => Protection::WRITE,
        Access::Execute => Protection::EXEC,
    }
}

/// Returns true if `addr` lies in a registered kernel region.
pub fn kernel_address(addr: usize) -> bool {
    layout::kernel_region(addr).is_some()
}

/// Returns true if `[addr, addr + len)` lies in one kernel region that permits `access`.
pub fn kernel_access_ok(addr: usize, len: usize, access: Access) -> bool {
    layout::kernel_region(addr).is_some_and(|region| {
        region.contains_range(addr, len) && region.section().protection().contains(required(access))
    })
}

/// Returns true if `addr` is mapped in the running thread's address space.
pub fn user_address(addr: usize) -> bool {
    thread::current_space().is_some_and(|space| user_address_for(&space, addr))
}

/// Returns true if `addr` is mapped in `space`.
pub fn user_address_for(space: &AddressSpace, addr: usize) -> bool {
    arch::is_user_space(addr) && space.segment_at(VirtualAddress::new(addr)).is_some()
}

/// Returns true if `[addr, addr + len)` is mapped in the running thread's address space with
/// protection permitting `access`.
pub fn user_access_ok(addr: usize, len: usize, access: Access) -> bool {
    thread::current_space().is_some_and(|space| user_access_ok_for(&space, addr, len, access))
}

/// Returns true if `[addr, addr + len)` is mapped in `space` with protection permitting
/// `access`.
///
/// The answer only stays true while the caller holds one of the space's locks.
pub fn user_access_ok_for(space: &AddressSpace, addr: usize, len: usize, access: Access) -> bool {
    if !arch::is_user_range(addr, len) {
        return false;
    }
    if len == 0 {
        return true;
    }
    let begin = VirtualAddress::new(addr);
    space
        .state
        .lock()
        .segments
        .covers(begin, begin + len, required(access))
}

/// Returns true if a guarded access of the running thread has faulted since the flag was last
/// cleared.
pub fn fault() -> bool {
    thread::with(|state| state.fault)
}

/// Clears the running thread's fault flag.
pub fn clear_fault() {
    thread::with(|state| state.fault = false);
}

fn check_fault() -> Result<()> {
    if fault() { Err(Error::Fault) } else { Ok(()) }
}

/// Guarded copy routines over some address space's user memory.
///
/// Implemented by [`UserAccess`] for the running thread's own space and by [`TransferGuard`]
/// for another space. Every method reports a fault on the user address, or a fault flag left
/// set by an earlier access, as [`Error::Fault`].
pub trait UserMemory {
    /// Returns the address space accessed.
    fn space(&self) -> &AddressSpace;

    /// Copies user memory at `addr` into `buf`.
    fn read(&self, addr: VirtualAddress, buf: &mut [u8]) -> Result<()> {
        self.space().read_user(addr, buf);
        check_fault()
    }

    /// Copies `data` into user memory at `addr`.
    fn write(&self, addr: VirtualAddress, data: &[u8]) -> Result<()> {
        self.space().write_user(addr, data);
        check_fault()
    }

    /// Reads one machine word.
    fn read_word(&self, addr: VirtualAddress) -> Result<usize> {
        let mut word = [0; WORD_SIZE];
        self.read(addr, &mut word)?;
        Ok(usize::from_ne_bytes(word))
    }

    /// Writes one machine word.
    fn write_word(&self, addr: VirtualAddress, value: usize) -> Result<()> {
        self.write(addr, &value.to_ne_bytes())
    }

    /// Returns the length of the NUL-terminated string at `addr`.
    ///
    /// Fails with [`Error::TooLong`] if no terminator is found in the first `maxlen` bytes.
    /// Bytes past the terminator are never touched.
    fn strnlen(&self, addr: VirtualAddress, maxlen: usize) -> Result<usize> {
        let mut chunk = [0u8; PAGE_SIZE];
        let mut len = 0;
        while len < maxlen {
            let cursor = addr.checked_add(len).ok_or(Error::Fault)?;
            let n = (PAGE_SIZE - cursor.page_offset()).min(maxlen - len);
            self.read(cursor, &mut chunk[..n])?;
            if let Some(nul) = chunk[..n].iter().position(|byte| *byte == 0) {
                return Ok(len + nul);
            }
            len += n;
        }
        Err(Error::TooLong)
    }

    /// Checks that a NUL-terminated string of at most `maxlen` bytes is readable at `addr`.
    fn strcheck(&self, addr: VirtualAddress, maxlen: usize) -> Result<()> {
        self.strnlen(addr, maxlen).map(|_| ())
    }

    /// Returns the number of entries before the NULL terminating the pointer array at `addr`.
    ///
    /// Fails with [`Error::TooLong`] if no terminator is found in the first `maxlen` entries.
    fn arraylen(&self, addr: VirtualAddress, maxlen: usize) -> Result<usize> {
        for index in 0..maxlen {
            let slot = index
                .checked_mul(WORD_SIZE)
                .and_then(|offset| addr.checked_add(offset))
                .ok_or(Error::Fault)?;
            if self.read_word(slot)? == 0 {
                return Ok(index);
            }
        }
        Err(Error::TooLong)
    }

    /// Copies the NUL-terminated string at `addr`, without its terminator.
    fn read_string(&self, addr: VirtualAddress, maxlen: usize) -> Result<Vec<u8>> {
        let len = self.strnlen(addr, maxlen)?;
        let mut string = alloc::vec![0; len];
        self.read(addr, &mut string)?;
        Ok(string)
    }

    /// Copies a NULL-terminated array of string pointers, such as `argv`.
    fn read_string_array(
        &self,
        addr: VirtualAddress,
        max_entries: usize,
        max_len: usize,
    ) -> Result<Vec<Vec<u8>>> {
        let count = self.arraylen(addr, max_entries)?;
        (0..count)
            .map(|index| {
                let string = self.read_word(addr + index * WORD_SIZE)?;
                self.read_string(VirtualAddress::new(string), max_len)
            })
            .collect()
    }
}

impl UserMemory for TransferGuard<'_> {
    fn space(&self) -> &AddressSpace {
        TransferGuard::space(self)
    }
}

/// Permission for the running thread to access its own user memory.
///
/// While the token exists the thread's address space is locked in the transfer role. The token
/// is tied to the thread that took it.
#[must_use = "user access ends as soon as the token is dropped"]
pub struct UserAccess {
    space: Arc<AddressSpace>,
    held: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl UserAccess {
    /// Starts a user access, blocking until the transfer lock is available.
    ///
    /// # Panics
    ///
    /// Panics if the thread has no address space or already owns a token.
    pub fn begin() -> Self {
        let space = Self::enter();
        space.lock.acquire(Role::Transfer);
        Self::locked(space)
    }

    /// Starts a user access, giving up with [`Error::Interrupted`] if a signal is pending while
    /// it would block. The thread stays idle on failure.
    pub fn begin_interruptible() -> Result<Self> {
        let space = Self::enter();
        space.lock.acquire_interruptible(Role::Transfer)?;
        Ok(Self::locked(space))
    }

    fn enter() -> Arc<AddressSpace> {
        let space = thread::with(|state| {
            assert_eq!(
                state.access,
                AccessState::Idle,
                "user access started while another is in progress"
            );
            state.space.clone()
        });
        match space {
            Some(space) => space,
            None => panic!("user access started by a thread without an address space"),
        }
    }

    fn locked(space: Arc<AddressSpace>) -> Self {
        thread::with(|state| state.access = AccessState::Locked);
        Self {
            space,
            held: true,
            _thread_bound: PhantomData,
        }
    }

    /// Ends the user access.
    pub fn end(self) {}

    /// Re-checks that `[addr, addr + len)` still permits `access` without dropping the lock.
    ///
    /// Used between the steps of a multi-step copy.
    pub fn revalidate(&self, addr: VirtualAddress, len: usize, access: Access) -> Result<()> {
        if user_access_ok_for(&self.space, addr.as_usize(), len, access) {
            Ok(())
        } else {
            Err(Error::Fault)
        }
    }

    /// Drops the transfer lock before blocking.
    ///
    /// The returned token records nothing about the buffers in flight; the caller passes them to
    /// [`SuspendedAccess::resume`] to have them checked again.
    pub fn suspend(mut self) -> SuspendedAccess {
        self.space.lock.release(Role::Transfer);
        self.held = false;
        thread::with(|state| state.access = AccessState::Suspended);
        SuspendedAccess {
            space: Arc::clone(&self.space),
            active: true,
            _thread_bound: PhantomData,
        }
    }
}

impl UserMemory for UserAccess {
    fn space(&self) -> &AddressSpace {
        &self.space
    }
}

impl Drop for UserAccess {
    fn drop(&mut self) {
        if self.held {
            self.space.lock.release(Role::Transfer);
            thread::with(|state| state.access = AccessState::Idle);
        }
    }
}

/// A user access suspended across a blocking wait.
///
/// Dropping it abandons the access and returns the thread to idle.
#[must_use = "a suspended access should be resumed or explicitly dropped"]
pub struct SuspendedAccess {
    space: Arc<AddressSpace>,
    active: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl SuspendedAccess {
    /// Re-takes the transfer lock and checks that `[addr, addr + len)` still permits `access`.
    ///
    /// Fails with [`Error::Interrupted`] if a signal arrives while waiting for the lock and with
    /// [`Error::Fault`] if the buffer is no longer valid. Either way the access is over and the
    /// thread is idle.
    pub fn resume(
        mut self,
        addr: VirtualAddress,
        len: usize,
        access: Access,
    ) -> Result<UserAccess> {
        self.space.lock.acquire_interruptible(Role::Transfer)?;
        self.active = false;
        let resumed = UserAccess::locked(Arc::clone(&self.space));
        match resumed.revalidate(addr, len, access) {
            Ok(()) => Ok(resumed),
            Err(error) => {
                log::debug!("user buffer at {addr} became invalid while suspended");
                Err(error)
            }
        }
    }
}

impl Drop for SuspendedAccess {
    fn drop(&mut self) {
        if self.active {
            thread::with(|state| state.access = AccessState::Idle);
        }
    }
}
