//! Parent stack preservation across `vfork`.
//!
//! A vfork child runs in its parent's address space, on the parent's stack, until it execs or
//! exits. Anything the child pushes overwrites the parent's live frames, so the parent's stack
//! between its stack pointer and the top of the stack is saved when the child is created and
//! written back before the parent runs again.

use alloc::vec::Vec;

use crate::{AddressSpace, Error, Result, VirtualAddress, uaccess::UserMemory};

/// The saved live part of a parent's user stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VforkContext {
    sp: VirtualAddress,
    stack: Vec<u8>,
}

impl VforkContext {
    /// Saves `[sp, stack_top)` of `space`.
    pub fn save(
        space: &AddressSpace,
        sp: VirtualAddress,
        stack_top: VirtualAddress,
    ) -> Result<Self> {
        if sp > stack_top {
            return Err(Error::InvalidArgument);
        }
        let mut stack = alloc::vec![0; stack_top - sp];
        space.begin_transfer().read(sp, &mut stack)?;
        log::debug!(
            "saved {} bytes of parent stack at {sp} for vfork of pid {:?}",
            stack.len(),
            space.pid()
        );
        Ok(Self { sp, stack })
    }

    /// Returns the parent's stack pointer at the time of the save.
    pub fn sp(&self) -> VirtualAddress {
        self.sp
    }

    /// Returns the number of bytes saved.
    pub fn len(&self) -> usize {
        self.stack.len()
    }

    /// Returns true if nothing was saved.
    pub fn is_empty(&self) -> bool {
        self.stack.is_empty()
    }
}

/// Writes a saved parent stack back into `space` once the vfork child has let go of it.
pub fn context_restore_vfork(context: &VforkContext, space: &AddressSpace) -> Result<()> {
    space.begin_transfer().write(context.sp, &context.stack)?;
    log::debug!(
        "restored {} bytes of parent stack at {} for pid {:?}",
        context.stack.len(),
        context.sp,
        space.pid()
    );
    Ok(())
}
