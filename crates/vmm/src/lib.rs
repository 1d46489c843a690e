#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The Polaris Virtual Memory Manager tracks the user-visible half of memory management for
//! the Polaris kernel. It provides:
//!
//! - Per-process address spaces built from protected, optionally file-backed segments.
//! - Map, unmap, reprotect, advise and insert primitives, plus syscall-facing wrappers.
//! - Fork-style copy with copy-on-write sharing and exec-style stack construction.
//! - A guarded, interruptible protocol for copying between the kernel and untrusted user memory.
//! - Software emulation of physical memory and scheduling for testing on the host.
//!
//! Physical page allocation, scheduling and backing files are collaborators reached through the
//! [`PageAllocator`], [`Scheduler`] and [`Vnode`] traits.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod error;
mod exec;
mod fault;
mod frame;
mod layout;
mod lock;
mod mapping;
mod numbers;
mod page;
mod page_table;
mod sched;
mod segment;
mod thread;
mod uaccess;
mod vfork;
mod vnode;


pub use address::VirtualAddress;
pub use address_space::{AddressSpace, Pid};
pub use arch::{MAX_CPUS, PAGE_SIZE, USER_BASE, USER_END, WORD_SIZE};
pub use error::{Error, Result};
pub use exec::{AuxVector, build_args};
pub use fault::{Access, FaultMode, Resolution, fault_expected, handle_page_fault};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use layout::{KernelRegion, KernelSection, register_kernel_regions};
pub use lock::{ModifyGuard, TransferGuard};
pub use mapping::{MapRequest, madvisefor, mmapfor, mprotectfor, munmapfor};
pub use numbers::{FrameNumber, PageNumber};
pub use page::{AllocError, MemoryAttribute, PageAllocator};
pub use page_table::{PageEntry, PageFlags};
pub use sched::{Scheduler, ThreadId, install_scheduler};
pub use segment::{Advice, Backing, MapFlags, Protection, Segment};
pub use thread::ThreadState;
pub use uaccess::{
    SuspendedAccess, UserAccess, UserMemory, clear_fault, fault, kernel_access_ok, kernel_address,
    user_access_ok, user_access_ok_for, user_address, user_address_for,
};
pub use vfork::{VforkContext, context_restore_vfork};
pub use vnode::Vnode;

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::software::{EmulatedMemory, HostScheduler, SignalHandle};
