//! Kernel memory layout used to classify addresses.
//!
//! The kernel's permanently-mapped regions are registered once during boot. User-access checks
//! consult them to tell kernel pointers from user pointers; nothing mutates the table afterwards.

use alloc::vec::Vec;

use crate::{Protection, arch};

/// Represents a section of the kernel's own memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelSection {
    /// The `.text` section containing executable code.
    Text,
    /// The `.rodata` section containing read-only data.
    ReadOnlyData,
    /// The `.data` and `.bss` sections.
    Data,
    /// Kernel stacks.
    Stack,
    /// The kernel heap.
    Heap,
}

impl KernelSection {
    /// Returns the access the kernel has to this section.
    pub const fn protection(self) -> Protection {
        match self {
            Self::Text => Protection::READ.union(Protection::EXEC),
            Self::ReadOnlyData => Protection::READ,
            Self::Data | Self::Stack | Self::Heap => Protection::READ.union(Protection::WRITE),
        }
    }
}

/// A permanently-mapped kernel region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelRegion {
    section: KernelSection,
    start: usize,
    end: usize,
}

impl KernelRegion {
    /// Creates a region of `len` bytes starting at `start`.
    ///
    /// # Panics
    ///
    /// Panics if the region wraps around the address space.
    pub const fn new(section: KernelSection, start: usize, len: usize) -> Self {
        let end = match start.checked_add(len) {
            Some(end) => end,
            None => panic!("kernel region wraps around the address space"),
        };
        Self {
            section,
            start,
            end,
        }
    }

    /// Returns the section this region holds.
    pub const fn section(&self) -> KernelSection {
        self.section
    }

    /// Returns true if `addr` lies in this region.
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Returns true if `[addr, addr + len)` lies entirely in this region.
    pub const fn contains_range(&self, addr: usize, len: usize) -> bool {
        match addr.checked_add(len) {
            Some(end) => addr >= self.start && end <= self.end,
            None => false,
        }
    }

    /// Returns true if this region overlaps the user window.
    const fn overlaps_user(&self) -> bool {
        self.start < arch::USER_END && arch::USER_BASE < self.end
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static KERNEL_REGIONS: spin::Once<Vec<KernelRegion>> = spin::Once::new();

// In test/software-emulation mode the table is thread-local so each test can register its own.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static KERNEL_REGIONS: spin::Once<Vec<KernelRegion>> = const { spin::Once::new() };
}

/// Registers the kernel's permanently-mapped regions.
///
/// This function must be called exactly once during initialization.
///
/// # Panics
///
/// Panics if the regions have already been registered or if a region overlaps the user window.
pub fn register_kernel_regions(regions: &[KernelRegion]) {
    for region in regions {
        assert!(
            !region.overlaps_user(),
            "kernel region {region:?} overlaps the user window"
        );
    }

    let install = |table: &spin::Once<Vec<KernelRegion>>| {
        if table.get().is_some() {
            panic!("kernel regions already registered");
        }
        table.call_once(|| regions.to_vec());
    };

    #[cfg(not(any(test, feature = "software-emulation")))]
    install(&KERNEL_REGIONS);

    #[cfg(any(test, feature = "software-emulation"))]
    KERNEL_REGIONS.with(install);
}

/// Returns the registered kernel region containing `addr`.
pub(crate) fn kernel_region(addr: usize) -> Option<KernelRegion> {
    let find = |table: &spin::Once<Vec<KernelRegion>>| {
        table
            .get()
            .and_then(|regions| regions.iter().find(|region| region.contains(addr)).copied())
    };

    #[cfg(not(any(test, feature = "software-emulation")))]
    {
        find(&KERNEL_REGIONS)
    }

    #[cfg(any(test, feature = "software-emulation"))]
    {
        KERNEL_REGIONS.with(find)
    }
}
