//! Software emulation of the platform for testing and development.
//!
//! This module provides the collaborators a kernel normally supplies so the address-space layer
//! can run on any host:
//!
//! - [`EmulatedMemory`]: a physical page allocator over a host buffer, with one pool per
//!   memory attribute and per-frame reference counts.
//! - [`HostScheduler`]: maps kernel threads onto host threads, with per-thread pending-signal
//!   flags that other threads can raise through a [`SignalHandle`].

mod memory;
mod scheduler;

pub use memory::EmulatedMemory;
pub use scheduler::{HOST_SCHEDULER, HostScheduler, SignalHandle};
