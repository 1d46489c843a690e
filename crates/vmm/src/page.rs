//! Physical page allocator interface.
//!
//! The address-space layer never owns physical memory directly. It asks a [`PageAllocator`]
//! for single pages from a pool selected by [`MemoryAttribute`], keeps a reference for every
//! page-table entry that points at a frame, and drops that reference when the entry goes away.

use crate::{FrameNumber, arch};

/// Errors reported by a page allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The requested pool has no free frames.
    OutOfMemory,
}

/// Physical memory class a mapping draws its pages from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MemoryAttribute {
    /// Ordinary cached system memory.
    #[default]
    Normal,
    /// Fast on-chip memory (TCM/OCRAM).
    Fast,
    /// Uncached memory suitable for DMA.
    Dma,
}

impl MemoryAttribute {
    /// All memory classes.
    pub const ALL: [MemoryAttribute; 3] = [Self::Normal, Self::Fast, Self::Dma];

    /// Index of this class in per-pool tables.
    pub const fn index(self) -> usize {
        match self {
            Self::Normal => 0,
            Self::Fast => 1,
            Self::Dma => 2,
        }
    }
}

/// Source of physical pages.
///
/// Implementations must be safe to call from any thread; each call is treated as atomic.
/// Frames are reference counted: [`allocate`](Self::allocate) returns a frame with one
/// reference, [`share`](Self::share) adds one, [`release`](Self::release) drops one and frees
/// the frame when the count reaches zero.
pub trait PageAllocator: Send + Sync {
    /// Allocates one page from the pool for `attr`.
    fn allocate(&self, attr: MemoryAttribute) -> Result<FrameNumber, AllocError>;

    /// Adds a reference to an allocated frame.
    fn share(&self, frame: FrameNumber);

    /// Drops a reference to a frame, freeing it when no references remain.
    fn release(&self, frame: FrameNumber);

    /// Returns the number of references held on a frame.
    fn references(&self, frame: FrameNumber) -> usize;

    /// Reads bytes from a frame starting at `offset`.
    fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]);

    /// Writes bytes into a frame starting at `offset`.
    fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]);

    /// Fills a frame with zeroes.
    fn zero(&self, frame: FrameNumber) {
        self.write(frame, 0, &[0; arch::PAGE_SIZE]);
    }

    /// Copies the contents of `src` into `dst`.
    fn copy(&self, src: FrameNumber, dst: FrameNumber) {
        let mut buf = [0; arch::PAGE_SIZE];
        self.read(src, 0, &mut buf);
        self.write(dst, 0, &buf);
    }
}
