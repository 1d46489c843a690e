//! Per-process address spaces.
//!
//! An [`AddressSpace`] owns a segment list and the page table of its resident pages. It is
//! shared through `Arc`: the owning task holds one reference, and anything working on the space
//! from outside (a fork in progress, an exec loading a new image, an inspector) holds another.
//! The last reference to go away tears the space down and returns its pages to the allocator.
//!
//! Structural changes go through a [`ModifyGuard`] and reads or writes of user memory from
//! another context go through a [`TransferGuard`]; see the `lock` module for how the two roles
//! exclude each other.

use alloc::{sync::Arc, vec::Vec};
use core::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

use crate::{
    Error, MemoryAttribute, ModifyGuard, PAGE_SIZE, PageAllocator, PageEntry, PageNumber,
    Protection, Result, Segment, TransferGuard, VirtualAddress,
    fault::{Access, ExpectFault, FaultMode, Resolution},
    lock::{AsLock, Role},
    page_table::PageTable,
    sched,
    segment::SegmentMap,
    thread::{self, AccessState},
};

/// Identifies the process owning an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Segment list and page table, always changed together.
#[derive(Default)]
pub(crate) struct State {
    pub segments: SegmentMap,
    pub pages: PageTable,
}

/// The virtual memory of one process.
pub struct AddressSpace {
    pid: spin::Mutex<Option<Pid>>,
    allocator: Arc<dyn PageAllocator>,
    pub(crate) lock: AsLock,
    pub(crate) state: spin::Mutex<State>,
    generation: AtomicU64,
}

/// What a fault needs done once the space's state lock is dropped.
enum Repair {
    BreakCow(crate::FrameNumber),
    Populate,
}

impl AddressSpace {
    /// Creates an empty address space owned by `pid`, drawing pages from `allocator`.
    pub fn create(pid: Pid, allocator: Arc<dyn PageAllocator>) -> Arc<Self> {
        log::debug!("created address space for pid {pid}");
        Arc::new(Self {
            pid: spin::Mutex::new(Some(pid)),
            allocator,
            lock: AsLock::new(),
            state: spin::Mutex::new(State::default()),
            generation: AtomicU64::new(0),
        })
    }

    /// Duplicates this address space for a fork, tagging the copy with `pid`.
    ///
    /// Every segment is copied with the same bounds, protection and backing. DMA pages and pages
    /// of writable file mappings are duplicated immediately; every other resident page is
    /// shared copy-on-write between the two spaces. If duplication runs out of memory the
    /// partial copy is torn down, this space is left untouched and [`Error::NoMemory`] is
    /// returned.
    pub fn copy(&self, pid: Pid) -> Result<Arc<Self>> {
        let _transfer = self.begin_transfer();
        let child = Self::create(pid, Arc::clone(&self.allocator));

        let (duplicated, shared) = {
            let mut parent = self.state.lock();
            let mut copy = child.state.lock();
            let State { segments, pages } = &mut *parent;
            let mut duplicated = 0;

            for segment in segments.iter() {
                copy.segments.insert(segment.clone());
            }

            for (page, entry) in pages.iter() {
                let Some(segment) = segments.find(page.start()) else {
                    continue;
                };
                if !duplicate_eagerly(segment) {
                    continue;
                }
                let frame = self.allocator.allocate(segment.attribute())?;
                self.allocator.copy(entry.frame(), frame);
                let mut private = PageEntry::new(frame, segment.prot());
                if entry.is_dirty() {
                    private.mark_dirty();
                }
                copy.pages.insert(page, private);
                duplicated += 1;
            }

            // Nothing below can fail, so the parent is only changed once the copy is complete.
            let mut shared = 0;
            for (page, entry) in pages.iter_mut() {
                if copy.pages.get(page).is_some() {
                    continue;
                }
                entry.mark_cow();
                self.allocator.share(entry.frame());
                copy.pages.insert(page, *entry);
                shared += 1;
            }
            (duplicated, shared)
        };

        log::debug!(
            "copied address space of pid {:?} for pid {pid}: {duplicated} pages duplicated, \
             {shared} shared copy-on-write",
            self.pid()
        );
        Ok(child)
    }

    /// Takes another reference to the address space.
    pub fn reference(this: &Arc<Self>) -> Arc<Self> {
        Arc::clone(this)
    }

    /// Drops a reference, tearing the space down if it was the last one.
    ///
    /// Returns true if the space was destroyed.
    pub fn release(this: Arc<Self>) -> bool {
        match Arc::into_inner(this) {
            Some(space) => {
                drop(space);
                true
            }
            None => false,
        }
    }

    /// Returns the number of references held on the address space.
    pub fn references(this: &Arc<Self>) -> usize {
        Arc::strong_count(this)
    }

    /// Releases the owning task's reference on task exit.
    ///
    /// The space is disassociated from its process at once. Its pages are returned when the last
    /// outstanding reference is released, which is immediately if nothing else holds one.
    pub fn destroy(this: Arc<Self>) {
        let pid = this.pid.lock().take();
        let others = Self::references(&this) - 1;
        log::debug!("destroying address space of pid {pid:?} ({others} other references)");
        Self::release(this);
    }

    /// Returns the owning process, if the space is associated with one.
    pub fn pid(&self) -> Option<Pid> {
        *self.pid.lock()
    }

    /// Associates the space with `pid`, or disassociates it with `None`.
    pub fn set_pid(&self, pid: Option<Pid>) {
        *self.pid.lock() = pid;
    }

    /// Acquires the modify lock, blocking until it is available.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the running thread already holds either lock role on this
    /// space.
    pub fn begin_modify(&self) -> ModifyGuard<'_> {
        self.lock.acquire(Role::Modify);
        ModifyGuard::new(self)
    }

    /// Acquires the modify lock, giving up with [`Error::Interrupted`] if a signal is pending
    /// while it would block.
    pub fn begin_modify_interruptible(&self) -> Result<ModifyGuard<'_>> {
        self.lock.acquire_interruptible(Role::Modify)?;
        Ok(ModifyGuard::new(self))
    }

    /// Acquires the transfer lock, blocking until it is available.
    pub fn begin_transfer(&self) -> TransferGuard<'_> {
        self.lock.acquire(Role::Transfer);
        TransferGuard::new(self)
    }

    /// Acquires the transfer lock, giving up with [`Error::Interrupted`] if a signal is pending
    /// while it would block.
    pub fn begin_transfer_interruptible(&self) -> Result<TransferGuard<'_>> {
        self.lock.acquire_interruptible(Role::Transfer)?;
        Ok(TransferGuard::new(self))
    }

    /// Returns true if the running thread holds the modify lock.
    pub fn locked(&self) -> bool {
        self.lock.modified_by(sched::current().current_thread())
    }

    /// Makes `next` the address space of the running thread.
    ///
    /// Called by the context switch layer when a thread is scheduled in and by exec when it
    /// replaces a thread's image.
    ///
    /// # Panics
    ///
    /// Panics if the running thread holds a user-access token.
    pub fn switch(next: Option<&Arc<Self>>) {
        let previous = thread::with(|state| {
            assert_eq!(
                state.access,
                AccessState::Idle,
                "address space switched during a user access"
            );
            core::mem::replace(&mut state.space, next.cloned())
        });
        #[cfg(feature = "detailed-logging")]
        log::trace!(
            "switched from pid {:?} to pid {:?}",
            previous.as_ref().and_then(|space| space.pid()),
            next.and_then(|space| space.pid())
        );
        drop(previous);
    }

    /// Returns the structural generation, bumped by every change to the segment list.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    /// Returns a copy of the segment covering `addr`.
    ///
    /// Without the modify or transfer lock held the answer may be stale by the time it returns.
    pub fn segment_at(&self, addr: VirtualAddress) -> Option<Segment> {
        self.state.lock().segments.find(addr).cloned()
    }

    /// Returns a snapshot of the segment list in address order.
    pub fn segments(&self) -> Vec<Segment> {
        self.state.lock().segments.iter().cloned().collect()
    }

    /// Returns the number of resident pages.
    pub fn resident_pages(&self) -> usize {
        self.state.lock().pages.len()
    }

    /// Returns the page-table entry for the page containing `addr`, if it is resident.
    pub fn page_entry(&self, addr: VirtualAddress) -> Option<PageEntry> {
        self.state.lock().pages.get(addr.page()).copied()
    }

    /// Logs the segment list.
    pub fn dump(&self) {
        let state = self.state.lock();
        log::info!(
            "address space of pid {:?}: {} segments, {} resident pages, generation {}",
            self.pid(),
            state.segments.len(),
            state.pages.len(),
            self.generation()
        );
        for segment in state.segments.iter() {
            log::info!("  {segment}");
        }
    }

    pub(crate) fn allocator(&self) -> &dyn PageAllocator {
        &*self.allocator
    }

    /// Makes the page containing `addr` accessible for `access`, if the segment allows it.
    pub(crate) fn resolve_fault(&self, addr: VirtualAddress, access: Access) -> Result<()> {
        let page = addr.page();
        let repair = {
            let mut state = self.state.lock();
            let State { segments, pages } = &mut *state;
            let segment = segments.find(addr).ok_or(Error::Fault)?;
            if !segment.prot().permits(access) {
                return Err(Error::Fault);
            }
            match pages.get_mut(page) {
                Some(entry) if entry.permits(access) => return Ok(()),
                Some(entry) if access == Access::Write && entry.is_cow() => {
                    Repair::BreakCow(entry.frame())
                }
                // First store to a clean private page.
                Some(entry) if access == Access::Write => {
                    entry.mark_dirty();
                    return Ok(());
                }
                Some(_) => return Err(Error::Fault),
                None => Repair::Populate,
            }
        };

        match repair {
            Repair::BreakCow(frame) => self.break_cow(page, frame),
            Repair::Populate => {
                self.populate(addr)?;
                if access == Access::Write {
                    if let Some(entry) = self.state.lock().pages.get_mut(page) {
                        entry.mark_dirty();
                    }
                }
                Ok(())
            }
        }
    }

    /// Gives this space a private, writable copy of a copy-on-write page.
    fn break_cow(&self, page: PageNumber, shared: crate::FrameNumber) -> Result<()> {
        if self.unshare_if_sole_owner(page, shared) {
            return Ok(());
        }

        let attribute = self.attribute_at(page.start())?;
        let private = self.allocator.allocate(attribute)?;

        let mut state = self.state.lock();
        let State { segments, pages } = &mut *state;
        let prot = segments.find(page.start()).map(Segment::prot);
        match (pages.get_mut(page), prot) {
            (Some(entry), Some(prot)) if entry.is_cow() && entry.frame() == shared => {
                self.allocator.copy(shared, private);
                entry.break_cow(private, prot);
                entry.mark_dirty();
                self.allocator.release(shared);
                Ok(())
            }
            // Lost a race with another fault on the same page or with an unmap.
            (Some(_), Some(_)) => {
                self.allocator.release(private);
                Ok(())
            }
            _ => {
                self.allocator.release(private);
                Err(Error::Fault)
            }
        }
    }

    /// Clears copy-on-write on `page` if this space holds the only reference to its frame.
    fn unshare_if_sole_owner(&self, page: PageNumber, shared: crate::FrameNumber) -> bool {
        let mut state = self.state.lock();
        let State { segments, pages } = &mut *state;
        let Some(prot) = segments.find(page.start()).map(Segment::prot) else {
            return false;
        };
        match pages.get_mut(page) {
            Some(entry)
                if entry.is_cow()
                    && entry.frame() == shared
                    && self.allocator.references(shared) == 1 =>
            {
                entry.break_cow(shared, prot);
                entry.mark_dirty();
                true
            }
            _ => false,
        }
    }

    fn attribute_at(&self, addr: VirtualAddress) -> Result<MemoryAttribute> {
        self.state
            .lock()
            .segments
            .find(addr)
            .map(Segment::attribute)
            .ok_or(Error::Fault)
    }

    /// Makes the page containing `addr` resident, filling it from the segment's backing.
    ///
    /// Does nothing if the page is already resident. Fails with [`Error::Fault`] if no segment
    /// covers `addr`.
    pub(crate) fn populate(&self, addr: VirtualAddress) -> Result<()> {
        let page = addr.page();
        let (attribute, source) = {
            let state = self.state.lock();
            let segment = state.segments.find(addr).ok_or(Error::Fault)?;
            if state.pages.get(page).is_some() {
                return Ok(());
            }
            let source = match segment.vnode() {
                Some(vnode) => {
                    let offset = segment.file_offset(page.start()).ok_or(Error::Fault)?;
                    Some((Arc::clone(vnode), offset))
                }
                None => None,
            };
            (segment.attribute(), source)
        };

        let frame = self.allocator.allocate(attribute)?;
        let mut contents = [0u8; PAGE_SIZE];
        if let Some((vnode, offset)) = source {
            if let Err(error) = vnode.read_at(offset, &mut contents) {
                self.allocator.release(frame);
                return Err(error);
            }
        }
        self.allocator.write(frame, 0, &contents);

        let mut state = self.state.lock();
        let State { segments, pages } = &mut *state;
        let Some(segment) = segments.find(addr) else {
            self.allocator.release(frame);
            return Err(Error::Fault);
        };
        if pages.get(page).is_some() {
            self.allocator.release(frame);
        } else {
            pages.insert(page, PageEntry::new(frame, segment.prot()));
        }
        Ok(())
    }

    /// Runs `f` on the frame backing `addr`, faulting the page in on a miss.
    ///
    /// Returns `None` if the fault could not be resolved; the fault flag has been set by then.
    fn with_user_frame<R>(
        &self,
        addr: VirtualAddress,
        access: Access,
        f: impl FnOnce(&dyn PageAllocator, crate::FrameNumber) -> R,
    ) -> Option<R> {
        let mut f = Some(f);
        for _ in 0..2 {
            {
                let mut state = self.state.lock();
                if let Some(entry) = state.pages.get_mut(addr.page()) {
                    if entry.permits(access) {
                        if access == Access::Write {
                            entry.mark_dirty();
                        }
                        let frame = entry.frame();
                        return f.take().map(|f| f(&*self.allocator, frame));
                    }
                }
            }
            if crate::fault::handle_page_fault(self, addr, access, FaultMode::Kernel)
                != Resolution::Resolved
            {
                return None;
            }
        }
        // Resolved twice and still inaccessible: the page keeps changing under us.
        thread::with(|state| state.fault = true);
        None
    }

    /// Copies user memory at `addr` into `buf`, stopping at the first page that faults.
    ///
    /// Callers check the thread's fault flag afterwards.
    pub(crate) fn read_user(&self, addr: VirtualAddress, buf: &mut [u8]) {
        let _expect = ExpectFault::new();
        let mut cursor = addr;
        let mut done = 0;
        while done < buf.len() {
            let chunk = (PAGE_SIZE - cursor.page_offset()).min(buf.len() - done);
            let dst = &mut buf[done..done + chunk];
            let copied = self.with_user_frame(cursor, Access::Read, |allocator, frame| {
                allocator.read(frame, cursor.page_offset(), dst)
            });
            if copied.is_none() {
                return;
            }
            done += chunk;
            cursor = cursor + chunk;
        }
    }

    /// Copies `data` into user memory at `addr`, stopping at the first page that faults.
    ///
    /// Callers check the thread's fault flag afterwards.
    pub(crate) fn write_user(&self, addr: VirtualAddress, data: &[u8]) {
        let _expect = ExpectFault::new();
        let mut cursor = addr;
        let mut done = 0;
        while done < data.len() {
            let chunk = (PAGE_SIZE - cursor.page_offset()).min(data.len() - done);
            let src = &data[done..done + chunk];
            let copied = self.with_user_frame(cursor, Access::Write, |allocator, frame| {
                allocator.write(frame, cursor.page_offset(), src)
            });
            if copied.is_none() {
                return;
            }
            done += chunk;
            cursor = cursor + chunk;
        }
    }
}

/// Returns true if fork duplicates the segment's pages instead of sharing them.
fn duplicate_eagerly(segment: &Segment) -> bool {
    segment.attribute() == MemoryAttribute::Dma
        || (segment.vnode().is_some() && segment.prot().contains(Protection::WRITE))
}

impl fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AddressSpace")
            .field("pid", &self.pid())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        assert!(self.lock.is_free(), "address space destroyed while locked");
        let state = self.state.get_mut();
        let mut released = 0;
        for entry in state.pages.drain() {
            self.allocator.release(entry.frame());
            released += 1;
        }
        log::debug!(
            "tore down address space of pid {:?}: {} segments, {released} pages released",
            self.pid.get_mut(),
            state.segments.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMemory, MapRequest, USER_BASE, Vnode};

    fn memory(frames: usize) -> Arc<EmulatedMemory> {
        Arc::new(EmulatedMemory::new(frames, 0, 2))
    }

    fn rw() -> Protection {
        Protection::READ | Protection::WRITE
    }

    fn map(space: &AddressSpace, request: MapRequest) -> VirtualAddress {
        space.begin_modify().map(request).unwrap()
    }

    fn poke(space: &AddressSpace, addr: VirtualAddress, data: &[u8]) {
        let _transfer = space.begin_transfer();
        space.write_user(addr, data);
        assert!(!crate::fault());
    }

    fn peek(space: &AddressSpace, addr: VirtualAddress, len: usize) -> Vec<u8> {
        let _transfer = space.begin_transfer();
        let mut buf = alloc::vec![0; len];
        space.read_user(addr, &mut buf);
        assert!(!crate::fault());
        buf
    }

    #[derive(Debug)]
    struct Pattern;

    impl Vnode for Pattern {
        fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = ((offset as usize + i) / PAGE_SIZE) as u8 + 1;
            }
            Ok(buf.len())
        }

        fn writable(&self) -> bool {
            true
        }
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn reference_and_release_balance() {
            let memory = memory(4);
            let space = AddressSpace::create(Pid(7), memory.clone());
            let extra = AddressSpace::reference(&space);
            assert_eq!(AddressSpace::references(&space), 2);

            assert!(!AddressSpace::release(extra));
            assert_eq!(AddressSpace::references(&space), 1);
            assert_eq!(space.pid(), Some(Pid(7)));
        }

        #[test]
        fn last_release_returns_pages() {
            let memory = memory(4);
            let space = AddressSpace::create(Pid(1), memory.clone());
            let addr = map(&space, MapRequest::anonymous(2 * PAGE_SIZE, rw()));
            poke(&space, addr, &[1; 2 * PAGE_SIZE]);
            assert_eq!(memory.allocated_frames(), 2);

            let inspector = AddressSpace::reference(&space);
            AddressSpace::destroy(space);
            assert_eq!(inspector.pid(), None);
            assert_eq!(memory.allocated_frames(), 2);

            assert!(AddressSpace::release(inspector));
            assert_eq!(memory.allocated_frames(), 0);
        }

        #[test]
        fn reassociates_pid() {
            let space = AddressSpace::create(Pid(3), memory(1));
            space.set_pid(None);
            assert_eq!(space.pid(), None);
            space.set_pid(Some(Pid(4)));
            assert_eq!(space.pid(), Some(Pid(4)));
        }

        #[test]
        fn locked_reports_modify_holder() {
            let space = AddressSpace::create(Pid(1), memory(1));
            assert!(!space.locked());
            let guard = space.begin_modify();
            assert!(space.locked());
            guard.end();
            assert!(!space.locked());

            let _transfer = space.begin_transfer();
            assert!(!space.locked());
        }

        #[test]
        fn switch_installs_current_space() {
            let space = AddressSpace::create(Pid(1), memory(1));
            AddressSpace::switch(Some(&space));
            assert_eq!(AddressSpace::references(&space), 2);
            assert!(thread::current_space().is_some_and(|current| Arc::ptr_eq(&current, &space)));
            AddressSpace::switch(None);
            assert_eq!(AddressSpace::references(&space), 1);
        }
    }

    mod faults {
        use super::*;

        #[test]
        fn anonymous_pages_start_zeroed() {
            let space = AddressSpace::create(Pid(1), memory(4));
            let addr = map(&space, MapRequest::anonymous(PAGE_SIZE, rw()));
            assert_eq!(peek(&space, addr, 16), [0; 16]);
            assert!(!space.page_entry(addr).unwrap().is_dirty());
        }

        #[test]
        fn file_pages_come_from_backing_offset() {
            let space = AddressSpace::create(Pid(1), memory(4));
            let request = MapRequest::new(2 * PAGE_SIZE, Protection::READ, crate::MapFlags::PRIVATE)
                .backing(Arc::new(Pattern), 3 * PAGE_SIZE as u64);
            let addr = map(&space, request);
            assert_eq!(peek(&space, addr + PAGE_SIZE, 2), [5, 5]);
            assert_eq!(peek(&space, addr, 1), [4]);
        }

        #[test]
        fn writes_mark_pages_dirty() {
            let space = AddressSpace::create(Pid(1), memory(4));
            let addr = map(&space, MapRequest::anonymous(PAGE_SIZE, rw()));
            poke(&space, addr + 10, b"dirty");
            assert!(space.page_entry(addr).unwrap().is_dirty());
            assert_eq!(peek(&space, addr + 10, 5), b"dirty");
        }

        #[test]
        fn access_spans_pages() {
            let space = AddressSpace::create(Pid(1), memory(4));
            let addr = map(&space, MapRequest::anonymous(2 * PAGE_SIZE, rw()));
            let data: Vec<u8> = (0..64).collect();
            poke(&space, addr + PAGE_SIZE - 32, &data);
            assert_eq!(space.resident_pages(), 2);
            assert_eq!(peek(&space, addr + PAGE_SIZE - 32, 64), data);
        }

        #[test]
        fn write_to_read_only_segment_is_refused() {
            let space = AddressSpace::create(Pid(1), memory(4));
            let addr = map(&space, MapRequest::anonymous(PAGE_SIZE, Protection::READ));
            assert_eq!(space.resolve_fault(addr, Access::Write), Err(Error::Fault));
            assert_eq!(space.resolve_fault(addr, Access::Read), Ok(()));
            assert_eq!(
                space.resolve_fault(VirtualAddress::new(USER_BASE - PAGE_SIZE), Access::Read),
                Err(Error::Fault)
            );
        }
    }

    mod fork {
        use super::*;

        #[test]
        fn private_pages_are_shared_copy_on_write() {
            let memory = memory(8);
            let parent = AddressSpace::create(Pid(1), memory.clone());
            let addr = map(&parent, MapRequest::anonymous(PAGE_SIZE, rw()));
            poke(&parent, addr, b"before");

            let child = parent.copy(Pid(2)).unwrap();
            assert_eq!(memory.allocated_frames(), 1);
            assert!(parent.page_entry(addr).unwrap().is_cow());
            assert!(child.page_entry(addr).unwrap().is_cow());

            poke(&child, addr, b"child!");
            assert_eq!(memory.allocated_frames(), 2);
            assert_eq!(peek(&parent, addr, 6), b"before");
            assert_eq!(peek(&child, addr, 6), b"child!");

            // The parent is now the only user of the original frame.
            poke(&parent, addr, b"parent");
            assert_eq!(memory.allocated_frames(), 2);
            assert!(!parent.page_entry(addr).unwrap().is_cow());
        }

        #[test]
        fn dma_pages_are_duplicated() {
            let memory = memory(4);
            let parent = AddressSpace::create(Pid(1), memory.clone());
            let addr = map(
                &parent,
                MapRequest::anonymous(PAGE_SIZE, rw()).attribute(MemoryAttribute::Dma),
            );
            poke(&parent, addr, b"dma");

            let child = parent.copy(Pid(2)).unwrap();
            assert_eq!(memory.free_frames(MemoryAttribute::Dma), 0);
            assert!(!child.page_entry(addr).unwrap().is_cow());
            assert_ne!(
                child.page_entry(addr).unwrap().frame(),
                parent.page_entry(addr).unwrap().frame()
            );
            assert_eq!(peek(&child, addr, 3), b"dma");
        }

        #[test]
        fn failed_copy_leaves_parent_untouched() {
            let memory = memory(8);
            let parent = AddressSpace::create(Pid(1), memory.clone());
            let request = MapRequest::new(2 * PAGE_SIZE, rw(), crate::MapFlags::PRIVATE)
                .backing(Arc::new(Pattern), 0);
            let addr = map(&parent, request);
            poke(&parent, addr, b"x");
            poke(&parent, addr + PAGE_SIZE, b"y");
            let generation = parent.generation();

            memory.fail_after(1);
            assert_eq!(parent.copy(Pid(2)).err(), Some(Error::NoMemory));
            memory.clear_failpoint();

            assert_eq!(memory.allocated_frames(), 2);
            assert!(!parent.page_entry(addr).unwrap().is_cow());
            assert_eq!(parent.generation(), generation);
            assert_eq!(parent.segments().len(), 1);
            assert!(parent.lock.is_free());
        }
    }
}
