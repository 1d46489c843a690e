//! Emulated physical memory.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::{
    Frame, FrameFlag, FrameNumber, MemoryAttribute,
    arch::PAGE_SIZE,
    page::{AllocError, PageAllocator},
};

/// Emulated physical memory for software simulation.
///
/// Frames are laid out pool by pool (normal, then fast, then DMA) in a single buffer. Each pool
/// keeps its own free list so a mapping's memory attribute decides which frames back it.
pub struct EmulatedMemory {
    /// Per-frame metadata.
    frames: Vec<Frame>,
    /// Frame contents.
    memory: spin::Mutex<Vec<u8>>,
    /// Free frames for each memory attribute.
    free: [spin::Mutex<Vec<FrameNumber>>; 3],
    /// Allocations left before injected failure; `usize::MAX` disables injection.
    fail_after: AtomicUsize,
}

impl EmulatedMemory {
    /// Creates emulated memory with the given number of frames in each pool.
    pub fn new(normal: usize, fast: usize, dma: usize) -> Self {
        let total = normal + fast + dma;
        let mut frames = Vec::with_capacity(total);
        let mut free = [Vec::new(), Vec::new(), Vec::new()];

        for (attr, count) in [
            (MemoryAttribute::Normal, normal),
            (MemoryAttribute::Fast, fast),
            (MemoryAttribute::Dma, dma),
        ] {
            let first = frames.len();
            frames.extend((0..count).map(|_| Frame::new(attr)));
            // Pop order hands out the lowest frame of each pool first.
            free[attr.index()].extend((first..first + count).rev().map(FrameNumber::new));
        }

        let [normal_free, fast_free, dma_free] = free;
        Self {
            frames,
            memory: spin::Mutex::new(alloc::vec![0u8; total * PAGE_SIZE]),
            free: [
                spin::Mutex::new(normal_free),
                spin::Mutex::new(fast_free),
                spin::Mutex::new(dma_free),
            ],
            fail_after: AtomicUsize::new(usize::MAX),
        }
    }

    /// Returns the number of free frames in the pool for `attr`.
    pub fn free_frames(&self, attr: MemoryAttribute) -> usize {
        self.free[attr.index()].lock().len()
    }

    /// Returns the number of allocated frames across all pools.
    pub fn allocated_frames(&self) -> usize {
        self.frames
            .iter()
            .filter(|frame| frame.flags.atomic_test(FrameFlag::Allocated))
            .count()
    }

    /// Returns the metadata for an allocated frame.
    pub fn frame(&self, frame: FrameNumber) -> Option<&Frame> {
        self.frames
            .get(frame.as_usize())
            .filter(|meta| meta.flags.atomic_test(FrameFlag::Allocated))
    }

    /// Lets `successes` more allocations succeed, then fails every allocation after that.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn fail_after(&self, successes: usize) {
        self.fail_after.store(successes, Ordering::SeqCst);
    }

    /// Disables allocation failure injection.
    #[cfg(any(test, feature = "failpoints"))]
    pub fn clear_failpoint(&self) {
        self.fail_after.store(usize::MAX, Ordering::SeqCst);
    }

    /// Consumes one allocation from the failpoint budget, returning false if it is exhausted.
    fn take_budget(&self) -> bool {
        self.fail_after
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| match left {
                usize::MAX => Some(usize::MAX),
                0 => None,
                n => Some(n - 1),
            })
            .is_ok()
    }

    fn allocated(&self, frame: FrameNumber) -> &Frame {
        match self.frame(frame) {
            Some(meta) => meta,
            None => panic!("{frame:?} is not an allocated frame"),
        }
    }

    fn byte_range(frame: FrameNumber, offset: usize, len: usize) -> core::ops::Range<usize> {
        assert!(offset + len <= PAGE_SIZE, "access crosses a frame boundary");
        let start = frame.as_usize() * PAGE_SIZE + offset;
        start..start + len
    }
}

impl PageAllocator for EmulatedMemory {
    fn allocate(&self, attr: MemoryAttribute) -> Result<FrameNumber, AllocError> {
        if !self.take_budget() {
            return Err(AllocError::OutOfMemory);
        }

        let frame = self.free[attr.index()]
            .lock()
            .pop()
            .ok_or(AllocError::OutOfMemory)?;
        let meta = &self.frames[frame.as_usize()];
        let was_allocated = meta.flags.atomic_test_and_set(FrameFlag::Allocated);
        debug_assert!(!was_allocated, "free list held an allocated frame");
        meta.get();
        Ok(frame)
    }

    fn share(&self, frame: FrameNumber) {
        self.allocated(frame).get();
    }

    fn release(&self, frame: FrameNumber) {
        let meta = self.allocated(frame);
        if meta.put() == 0 {
            meta.flags.atomic_clear(FrameFlag::Allocated);
            self.free[meta.attribute().index()].lock().push(frame);
        }
    }

    fn references(&self, frame: FrameNumber) -> usize {
        self.frame(frame).map_or(0, Frame::references)
    }

    fn read(&self, frame: FrameNumber, offset: usize, buf: &mut [u8]) {
        self.allocated(frame);
        let range = Self::byte_range(frame, offset, buf.len());
        buf.copy_from_slice(&self.memory.lock()[range]);
    }

    fn write(&self, frame: FrameNumber, offset: usize, data: &[u8]) {
        self.allocated(frame);
        let range = Self::byte_range(frame, offset, data.len());
        self.memory.lock()[range].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_from_requested_pool() {
        let memory = EmulatedMemory::new(4, 2, 1);
        let normal = memory.allocate(MemoryAttribute::Normal).unwrap();
        let fast = memory.allocate(MemoryAttribute::Fast).unwrap();
        let dma = memory.allocate(MemoryAttribute::Dma).unwrap();

        assert_eq!(normal, FrameNumber::new(0));
        assert_eq!(fast, FrameNumber::new(4));
        assert_eq!(dma, FrameNumber::new(6));
        assert_eq!(memory.free_frames(MemoryAttribute::Dma), 0);
        assert_eq!(
            memory.allocate(MemoryAttribute::Dma),
            Err(AllocError::OutOfMemory)
        );
    }

    #[test]
    fn shared_frame_freed_on_last_release() {
        let memory = EmulatedMemory::new(2, 0, 0);
        let frame = memory.allocate(MemoryAttribute::Normal).unwrap();
        memory.share(frame);
        assert_eq!(memory.references(frame), 2);

        memory.release(frame);
        assert_eq!(memory.allocated_frames(), 1);
        memory.release(frame);
        assert_eq!(memory.allocated_frames(), 0);
        assert_eq!(memory.references(frame), 0);
        assert_eq!(memory.free_frames(MemoryAttribute::Normal), 2);
    }

    #[test]
    fn reads_back_written_bytes() {
        let memory = EmulatedMemory::new(2, 0, 0);
        let src = memory.allocate(MemoryAttribute::Normal).unwrap();
        let dst = memory.allocate(MemoryAttribute::Normal).unwrap();
        memory.write(src, 100, b"polaris");
        memory.copy(src, dst);

        let mut buf = [0u8; 7];
        memory.read(dst, 100, &mut buf);
        assert_eq!(&buf, b"polaris");

        memory.zero(dst);
        memory.read(dst, 100, &mut buf);
        assert_eq!(buf, [0; 7]);
    }

    #[test]
    fn failpoint_limits_allocations() {
        let memory = EmulatedMemory::new(8, 0, 0);
        memory.fail_after(2);
        assert!(memory.allocate(MemoryAttribute::Normal).is_ok());
        assert!(memory.allocate(MemoryAttribute::Normal).is_ok());
        assert_eq!(
            memory.allocate(MemoryAttribute::Normal),
            Err(AllocError::OutOfMemory)
        );
        memory.clear_failpoint();
        assert!(memory.allocate(MemoryAttribute::Normal).is_ok());
    }

    #[test]
    #[should_panic(expected = "not an allocated frame")]
    fn writing_free_frame_panics() {
        let memory = EmulatedMemory::new(1, 0, 0);
        memory.write(FrameNumber::new(0), 0, &[1]);
    }
}
