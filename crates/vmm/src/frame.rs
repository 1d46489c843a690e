//! Physical frame metadata.
//!
//! Modeled after Linux's `struct page`, [`Frame`] holds the per-frame state an allocator needs
//! to hand frames to several address spaces at once: allocation flags, a reference count and the
//! memory pool the frame belongs to.

use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::MemoryAttribute;

/// Holds metadata for a physical memory frame.
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    /// Number of page-table entries (or other owners) referencing this frame.
    references: AtomicUsize,
    /// Pool the frame was carved from.
    attribute: MemoryAttribute,
}

impl Frame {
    /// Creates metadata for a free frame in the given pool.
    pub const fn new(attribute: MemoryAttribute) -> Self {
        Self {
            flags: FrameFlags::new(),
            references: AtomicUsize::new(0),
            attribute,
        }
    }

    /// Returns the pool this frame belongs to.
    pub fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    /// Returns the current reference count.
    pub fn references(&self) -> usize {
        self.references.load(Ordering::Acquire)
    }

    /// Adds a reference, returning the new count.
    pub fn get(&self) -> usize {
        self.references.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops a reference, returning the new count.
    ///
    /// # Panics
    ///
    /// Panics if the frame has no references.
    pub fn put(&self) -> usize {
        let previous = self.references.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "frame reference count underflow");
        previous - 1
    }
}

/// Flags describing a physical memory frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFlag {
    /// Frame is allocated.
    Allocated = 1 << 0,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU64);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Clears the given flag atomically.
    pub fn atomic_clear(&self, flag: FrameFlag) {
        self.0.fetch_and(!(flag as u64), Ordering::AcqRel);
    }

    /// Tests if the given flag is set, atomically.
    pub fn atomic_test(&self, flag: FrameFlag) -> bool {
        (self.0.load(Ordering::Acquire) & flag as u64) != 0
    }

    /// Tests the given flag and sets it atomically, returning the previous value.
    pub fn atomic_test_and_set(&self, flag: FrameFlag) -> bool {
        let mask = flag as u64;
        (self.0.fetch_or(mask, Ordering::AcqRel) & mask) != 0
    }
}
