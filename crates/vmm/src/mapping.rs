//! Mapping primitives and their syscall-facing wrappers.
//!
//! The primitives are methods of [`ModifyGuard`], so they can only run while the modify lock of
//! the target space is held. The `*for` functions are what the syscall layer calls: they take
//! raw user arguments, validate them, take the modify lock interruptibly and delegate.

use alloc::{sync::Arc, vec::Vec};

use crate::{
    AddressSpace, Advice, Backing, Error, FrameNumber, MapFlags, MemoryAttribute, ModifyGuard,
    PAGE_SIZE, PageEntry, Protection, Result, Segment, VirtualAddress, Vnode, arch,
};

/// A request for a new mapping.
#[derive(Debug, Clone)]
pub struct MapRequest {
    hint: Option<VirtualAddress>,
    len: usize,
    prot: Protection,
    flags: MapFlags,
    backing: Option<Backing>,
    attribute: MemoryAttribute,
}

impl MapRequest {
    /// Creates a request for `len` bytes with the given protection and mapping flags.
    pub fn new(len: usize, prot: Protection, flags: MapFlags) -> Self {
        Self {
            hint: None,
            len,
            prot,
            flags,
            backing: None,
            attribute: MemoryAttribute::Normal,
        }
    }

    /// Creates a request for private, zero-filled memory.
    pub fn anonymous(len: usize, prot: Protection) -> Self {
        Self::new(len, prot, MapFlags::PRIVATE | MapFlags::ANONYMOUS)
    }

    /// Places the mapping at `addr` if that range is free.
    pub fn at(mut self, addr: VirtualAddress) -> Self {
        self.hint = Some(addr);
        self
    }

    /// Places the mapping exactly at `addr`, failing if the range is in use.
    pub fn fixed(mut self, addr: VirtualAddress) -> Self {
        self.hint = Some(addr);
        self.flags |= MapFlags::FIXED;
        self
    }

    /// Backs the mapping with `vnode` from file offset `offset`.
    pub fn backing(mut self, vnode: Arc<dyn Vnode>, offset: u64) -> Self {
        self.backing = Some(Backing::new(vnode, offset));
        self
    }

    /// Draws the mapping's pages from the pool for `attribute`.
    pub fn attribute(mut self, attribute: MemoryAttribute) -> Self {
        self.attribute = attribute;
        self
    }

    /// Returns the requested length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    fn validate(&self) -> Result<()> {
        if self.len == 0 || self.len % PAGE_SIZE != 0 {
            return Err(Error::InvalidArgument);
        }
        if self.flags.contains(MapFlags::SHARED) == self.flags.contains(MapFlags::PRIVATE) {
            return Err(Error::InvalidArgument);
        }
        if self.flags.contains(MapFlags::ANONYMOUS) == self.backing.is_some() {
            return Err(Error::InvalidArgument);
        }
        if let Some(backing) = &self.backing {
            if backing.offset() % PAGE_SIZE as u64 != 0
                || backing.offset().checked_add(self.len as u64).is_none()
            {
                return Err(Error::InvalidArgument);
            }
        }
        if self.attribute == MemoryAttribute::Dma
            && (self.backing.is_some() || self.prot.contains(Protection::EXEC))
        {
            return Err(Error::NotSupported);
        }
        if self.flags.contains(MapFlags::SHARED)
            && self.prot.contains(Protection::WRITE)
            && self.backing.as_ref().is_some_and(|b| !b.vnode().writable())
        {
            return Err(Error::PermissionDenied);
        }
        Ok(())
    }

    fn into_segment(self, begin: VirtualAddress) -> Segment {
        Segment::new(
            begin,
            self.len,
            self.prot,
            self.flags,
            self.backing,
            self.attribute,
        )
    }
}

/// Checks a primitive's `[addr, addr + len)` range and returns its end.
fn page_range(addr: VirtualAddress, len: usize) -> Result<VirtualAddress> {
    if len == 0 || len % PAGE_SIZE != 0 || !addr.is_page_aligned() {
        return Err(Error::InvalidArgument);
    }
    addr.checked_add(len).ok_or(Error::InvalidArgument)
}

impl ModifyGuard<'_> {
    /// Maps a new segment and returns its base address.
    ///
    /// Without [`MapFlags::FIXED`] the hint is used if it is free and otherwise the lowest hole
    /// that fits is taken. DMA mappings are populated before this returns; every other mapping is
    /// populated on first touch.
    pub fn map(&self, request: MapRequest) -> Result<VirtualAddress> {
        debug_assert!(self.locked());
        request.validate()?;

        let begin = self.place(&request)?;
        let populate = request.attribute == MemoryAttribute::Dma;
        let segment = request.into_segment(begin);
        let end = segment.end();
        log::debug!("pid {:?}: mapped {segment}", self.pid());
        self.state.lock().segments.insert(segment);
        self.bump_generation();

        if populate {
            let mut addr = begin;
            while addr < end {
                if let Err(error) = self.space().populate(addr) {
                    log::warn!("pid {:?}: populating DMA mapping at {begin} failed", self.pid());
                    self.remove(begin, end);
                    return Err(error);
                }
                addr = addr + PAGE_SIZE;
            }
        }
        Ok(begin)
    }

    /// Picks the base address for a validated request.
    fn place(&self, request: &MapRequest) -> Result<VirtualAddress> {
        let state = self.state.lock();
        if !request.flags.contains(MapFlags::FIXED) {
            return state
                .segments
                .find_hole(request.hint, request.len)
                .ok_or(Error::NoMemory);
        }

        let addr = request.hint.ok_or(Error::InvalidArgument)?;
        let end = page_range(addr, request.len)?;
        if !arch::is_user_range(addr.as_usize(), request.len) || !state.segments.is_free(addr, end)
        {
            log::warn!("pid {:?}: fixed mapping at {addr} is in use", self.pid());
            return Err(Error::AddressInUse);
        }
        Ok(addr)
    }

    /// Removes all mappings in `[addr, addr + len)` and releases their pages.
    ///
    /// Segments straddling either edge are split and keep the part outside the range. Unmapping
    /// a range with nothing mapped in it succeeds.
    pub fn unmap(&self, addr: VirtualAddress, len: usize) -> Result<()> {
        debug_assert!(self.locked());
        let end = page_range(addr, len)?;
        self.remove(addr, end);
        Ok(())
    }

    fn remove(&self, begin: VirtualAddress, end: VirtualAddress) {
        let (segments, pages) = {
            let mut state = self.state.lock();
            let segments = state.segments.carve(begin, end);
            if segments.is_empty() {
                return;
            }
            (segments, state.pages.remove_range(begin.page(), end.page()))
        };
        self.bump_generation();

        for entry in &pages {
            self.allocator().release(entry.frame());
        }
        log::debug!(
            "pid {:?}: unmapped {begin}-{end} ({} segments, {} pages released)",
            self.pid(),
            segments.len(),
            pages.len()
        );
    }

    /// Changes the protection of `[addr, addr + len)`.
    ///
    /// The whole range must be mapped ([`Error::NoMemory`] otherwise). Write access to a shared
    /// mapping of a file that was not opened for writing is refused with
    /// [`Error::PermissionDenied`], and executable DMA memory with [`Error::NotSupported`].
    pub fn protect(&self, addr: VirtualAddress, len: usize, prot: Protection) -> Result<()> {
        debug_assert!(self.locked());
        let end = page_range(addr, len)?;

        let mut state = self.state.lock();
        if !state.segments.covers(addr, end, Protection::empty()) {
            return Err(Error::NoMemory);
        }
        for segment in state.segments.overlapping(addr, end) {
            if segment.write_denied_by_backing(prot) {
                log::warn!("pid {:?}: {segment} cannot be made writable", self.pid());
                return Err(Error::PermissionDenied);
            }
            if segment.attribute() == MemoryAttribute::Dma && prot.contains(Protection::EXEC) {
                return Err(Error::NotSupported);
            }
        }

        state.segments.split_at(addr);
        state.segments.split_at(end);
        for segment in state.segments.overlapping_mut(addr, end) {
            segment.set_prot(prot);
        }
        for (_, entry) in state.pages.range_mut(addr.page(), end.page()) {
            entry.set_protection(prot);
        }
        drop(state);

        self.bump_generation();
        log::debug!("pid {:?}: protected {addr}-{end} as {prot:?}", self.pid());
        Ok(())
    }

    /// Applies residency advice to `[addr, addr + len)`.
    ///
    /// The advice is recorded on the covered segments, which are split at the range edges.
    /// [`Advice::WillNeed`] populates the range now, as far as memory allows.
    /// [`Advice::DontNeed`] releases the range's clean pages, which the fault path refills with
    /// identical contents; dirty pages and DMA memory stay resident.
    pub fn advise(&self, addr: VirtualAddress, len: usize, advice: Advice) -> Result<()> {
        debug_assert!(self.locked());
        let end = page_range(addr, len)?;

        let released = {
            let mut state = self.state.lock();
            if !state.segments.covers(addr, end, Protection::empty()) {
                return Err(Error::NoMemory);
            }
            state.segments.split_at(addr);
            state.segments.split_at(end);
            let mut releasable = Vec::new();
            for segment in state.segments.overlapping_mut(addr, end) {
                segment.set_advice(advice);
                if advice == Advice::DontNeed && segment.attribute() != MemoryAttribute::Dma {
                    releasable.push((segment.begin(), segment.end()));
                }
            }

            let mut released = Vec::new();
            for (begin, end) in releasable {
                let clean: Vec<_> = state
                    .pages
                    .range(begin.page(), end.page())
                    .filter(|(_, entry)| !entry.is_dirty())
                    .map(|(page, _)| page)
                    .collect();
                released.extend(clean.into_iter().filter_map(|page| state.pages.remove(page)));
            }
            released
        };
        self.bump_generation();

        for entry in &released {
            self.allocator().release(entry.frame());
        }

        if advice == Advice::WillNeed {
            let mut page = addr;
            while page < end {
                if self.space().populate(page) == Err(Error::NoMemory) {
                    log::debug!("pid {:?}: prefetch stopped at {page}, out of memory", self.pid());
                    break;
                }
                page = page + PAGE_SIZE;
            }
        }

        log::debug!(
            "pid {:?}: advised {addr}-{end} {advice:?} ({} pages released)",
            self.pid(),
            released.len()
        );
        Ok(())
    }

    /// Maps a new segment at the request's address and fills it with `frames`, one per page.
    ///
    /// The segment takes over the caller's reference on each frame. On failure nothing is
    /// mapped and the caller still owns its references. The request must carry an address;
    /// placement behaves as for a fixed mapping.
    pub fn insert(&self, request: MapRequest, frames: &[FrameNumber]) -> Result<VirtualAddress> {
        debug_assert!(self.locked());
        if request.hint.is_none() || frames.len().checked_mul(PAGE_SIZE) != Some(request.len) {
            return Err(Error::InvalidArgument);
        }
        request.validate()?;

        let request = MapRequest {
            flags: request.flags | MapFlags::FIXED,
            ..request
        };
        let begin = self.place(&request)?;
        let segment = request.into_segment(begin);
        let prot = segment.prot();
        log::debug!(
            "pid {:?}: inserted {} pages at {segment}",
            self.pid(),
            frames.len()
        );

        let mut state = self.state.lock();
        state.segments.insert(segment);
        for (i, frame) in frames.iter().enumerate() {
            let mut entry = PageEntry::new(*frame, prot);
            entry.mark_dirty();
            state.pages.insert((begin + i * PAGE_SIZE).page(), entry);
        }
        drop(state);
        self.bump_generation();
        Ok(begin)
    }
}

/// Rounds a user length up to whole pages.
fn page_len(len: usize) -> Result<usize> {
    if len == 0 {
        return Err(Error::InvalidArgument);
    }
    len.checked_next_multiple_of(PAGE_SIZE)
        .ok_or(Error::InvalidArgument)
}

/// Validates a user range for the unmap/protect/advise wrappers.
fn user_range(addr: usize, len: usize) -> Result<(VirtualAddress, usize)> {
    let addr = VirtualAddress::new(addr);
    let len = page_len(len)?;
    if !addr.is_page_aligned() || !arch::is_user_range(addr.as_usize(), len) {
        return Err(Error::InvalidArgument);
    }
    Ok((addr, len))
}

/// Implements `mmap` for `space`.
///
/// `addr` of zero means "anywhere"; otherwise it is a hint, or the exact address with
/// [`MapFlags::FIXED`]. `vnode` is the backing file for non-anonymous mappings.
#[allow(clippy::too_many_arguments)]
pub fn mmapfor(
    space: &AddressSpace,
    addr: usize,
    len: usize,
    prot: u32,
    flags: u32,
    vnode: Option<Arc<dyn Vnode>>,
    offset: u64,
    attribute: MemoryAttribute,
) -> Result<VirtualAddress> {
    let len = page_len(len)?;
    let prot = Protection::from_raw(prot)?;
    let flags = MapFlags::from_raw(flags)?;
    let addr = VirtualAddress::new(addr);
    if flags.contains(MapFlags::FIXED) && !addr.is_page_aligned() {
        return Err(Error::InvalidArgument);
    }

    let mut request = MapRequest::new(len, prot, flags).attribute(attribute);
    if !addr.is_null() {
        request.hint = Some(addr.align_down(PAGE_SIZE));
    }
    if let Some(vnode) = vnode {
        request = request.backing(vnode, offset);
    } else if offset != 0 {
        return Err(Error::InvalidArgument);
    }

    space.begin_modify_interruptible()?.map(request)
}

/// Implements `munmap` for `space`.
pub fn munmapfor(space: &AddressSpace, addr: usize, len: usize) -> Result<()> {
    let (addr, len) = user_range(addr, len)?;
    space.begin_modify_interruptible()?.unmap(addr, len)
}

/// Implements `mprotect` for `space`.
pub fn mprotectfor(space: &AddressSpace, addr: usize, len: usize, prot: u32) -> Result<()> {
    let (addr, len) = user_range(addr, len)?;
    let prot = Protection::from_raw(prot)?;
    space.begin_modify_interruptible()?.protect(addr, len, prot)
}

/// Implements `madvise` for `space`.
pub fn madvisefor(space: &AddressSpace, addr: usize, len: usize, advice: Advice) -> Result<()> {
    let (addr, len) = user_range(addr, len)?;
    space.begin_modify_interruptible()?.advise(addr, len, advice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EmulatedMemory, Pid, USER_BASE, USER_END};

    const PAGE: usize = PAGE_SIZE;

    fn rw() -> Protection {
        Protection::READ | Protection::WRITE
    }

    fn setup(frames: usize) -> (Arc<EmulatedMemory>, Arc<AddressSpace>) {
        let memory = Arc::new(EmulatedMemory::new(frames, 1, 2));
        let space = AddressSpace::create(Pid(1), memory.clone());
        (memory, space)
    }

    fn user(page: usize) -> VirtualAddress {
        VirtualAddress::new(USER_BASE + page * PAGE)
    }

    fn touch(space: &AddressSpace, addr: VirtualAddress) {
        let _transfer = space.begin_transfer();
        space.write_user(addr, &[0xaa]);
        assert!(!crate::fault());
    }

    #[derive(Debug)]
    struct ReadOnlyFile;

    impl Vnode for ReadOnlyFile {
        fn read_at(&self, _offset: u64, buf: &mut [u8]) -> Result<usize> {
            buf.fill(7);
            Ok(buf.len())
        }

        fn writable(&self) -> bool {
            false
        }
    }

    mod map {
        use super::*;

        #[test]
        fn first_fit_then_hint() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            let first = guard.map(MapRequest::anonymous(PAGE, rw())).unwrap();
            assert_eq!(first, user(0));

            let hinted = guard
                .map(MapRequest::anonymous(PAGE, rw()).at(user(10)))
                .unwrap();
            assert_eq!(hinted, user(10));

            let collided = guard
                .map(MapRequest::anonymous(PAGE, rw()).at(user(10)))
                .unwrap();
            assert_eq!(collided, user(1));
            assert_eq!(guard.segments().len(), 3);
        }

        #[test]
        fn fixed_conflict_is_address_in_use() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            guard
                .map(MapRequest::anonymous(2 * PAGE, rw()).fixed(user(4)))
                .unwrap();
            let generation = guard.generation();

            assert_eq!(
                guard.map(MapRequest::anonymous(PAGE, rw()).fixed(user(5))),
                Err(Error::AddressInUse)
            );
            assert_eq!(
                guard.map(MapRequest::anonymous(PAGE, rw()).fixed(VirtualAddress::new(USER_END))),
                Err(Error::AddressInUse)
            );
            assert_eq!(guard.segments().len(), 1);
            assert_eq!(guard.generation(), generation);
        }

        #[test]
        fn malformed_requests_are_rejected() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            let bad = [
                MapRequest::anonymous(0, rw()),
                MapRequest::anonymous(PAGE + 1, rw()),
                MapRequest::new(PAGE, rw(), MapFlags::ANONYMOUS),
                MapRequest::new(PAGE, rw(), MapFlags::SHARED | MapFlags::PRIVATE | MapFlags::ANONYMOUS),
                MapRequest::new(PAGE, rw(), MapFlags::PRIVATE),
                MapRequest::anonymous(PAGE, rw()).backing(Arc::new(ReadOnlyFile), 0),
                MapRequest::new(PAGE, rw(), MapFlags::PRIVATE).backing(Arc::new(ReadOnlyFile), 12),
            ];
            for request in bad {
                assert_eq!(guard.map(request.clone()), Err(Error::InvalidArgument), "{request:?}");
            }
            assert!(guard.segments().is_empty());
        }

        #[test]
        fn unsupported_dma_combinations() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            let exec = MapRequest::anonymous(PAGE, Protection::READ | Protection::EXEC)
                .attribute(MemoryAttribute::Dma);
            assert_eq!(guard.map(exec), Err(Error::NotSupported));

            let file = MapRequest::new(PAGE, Protection::READ, MapFlags::PRIVATE)
                .backing(Arc::new(ReadOnlyFile), 0)
                .attribute(MemoryAttribute::Dma);
            assert_eq!(guard.map(file), Err(Error::NotSupported));
        }

        #[test]
        fn shared_write_needs_writable_file() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            let shared = MapRequest::new(PAGE, rw(), MapFlags::SHARED)
                .backing(Arc::new(ReadOnlyFile), 0);
            assert_eq!(guard.map(shared), Err(Error::PermissionDenied));

            let private = MapRequest::new(PAGE, rw(), MapFlags::PRIVATE)
                .backing(Arc::new(ReadOnlyFile), 0);
            assert!(guard.map(private).is_ok());
        }

        #[test]
        fn dma_is_populated_eagerly_and_rolled_back() {
            let (memory, space) = setup(4);
            let guard = space.begin_modify();
            let addr = guard
                .map(MapRequest::anonymous(2 * PAGE, rw()).attribute(MemoryAttribute::Dma))
                .unwrap();
            assert_eq!(guard.resident_pages(), 2);
            assert_eq!(memory.free_frames(MemoryAttribute::Dma), 0);

            guard.unmap(addr, 2 * PAGE).unwrap();
            memory.fail_after(1);
            assert_eq!(
                guard.map(MapRequest::anonymous(2 * PAGE, rw()).attribute(MemoryAttribute::Dma)),
                Err(Error::NoMemory)
            );
            memory.clear_failpoint();
            assert!(guard.segments().is_empty());
            assert_eq!(memory.free_frames(MemoryAttribute::Dma), 2);
        }

        #[test]
        fn exhausted_window_is_no_memory() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            assert_eq!(
                guard.map(MapRequest::anonymous(USER_END - USER_BASE + PAGE, rw())),
                Err(Error::NoMemory)
            );
        }
    }

    mod unmap {
        use super::*;

        #[test]
        fn partial_unmap_splits_and_releases() {
            let (memory, space) = setup(8);
            let addr = space
                .begin_modify()
                .map(MapRequest::anonymous(4 * PAGE, rw()))
                .unwrap();
            for page in 0..4 {
                touch(&space, addr + page * PAGE);
            }
            assert_eq!(memory.allocated_frames(), 4);

            let guard = space.begin_modify();
            guard.unmap(addr + PAGE, 2 * PAGE).unwrap();
            let left: Vec<_> = guard.segments().iter().map(|s| (s.begin(), s.len())).collect();
            assert_eq!(left, [(addr, PAGE), (addr + 3 * PAGE, PAGE)]);
            assert_eq!(memory.allocated_frames(), 2);
        }

        #[test]
        fn empty_range_succeeds() {
            let (_, space) = setup(1);
            let guard = space.begin_modify();
            let generation = guard.generation();
            assert_eq!(guard.unmap(user(3), PAGE), Ok(()));
            assert_eq!(guard.generation(), generation);
            assert_eq!(guard.unmap(user(3) + 1, PAGE), Err(Error::InvalidArgument));
        }
    }

    mod protect {
        use super::*;
        use crate::fault::Access;

        #[test]
        fn splits_and_updates_resident_pages() {
            let (_, space) = setup(4);
            let addr = {
                let guard = space.begin_modify();
                guard.map(MapRequest::anonymous(3 * PAGE, rw())).unwrap()
            };
            touch(&space, addr + PAGE);

            let guard = space.begin_modify();
            guard.protect(addr + PAGE, PAGE, Protection::READ).unwrap();
            let prots: Vec<_> = guard.segments().iter().map(Segment::prot).collect();
            assert_eq!(prots, [rw(), Protection::READ, rw()]);
            assert!(!guard.page_entry(addr + PAGE).unwrap().permits(Access::Write));
            assert!(guard.page_entry(addr + PAGE).unwrap().is_dirty());
        }

        #[test]
        fn hole_is_no_memory() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            guard.map(MapRequest::anonymous(PAGE, rw()).fixed(user(0))).unwrap();
            guard.map(MapRequest::anonymous(PAGE, rw()).fixed(user(2))).unwrap();
            assert_eq!(guard.protect(user(0), 3 * PAGE, Protection::READ), Err(Error::NoMemory));
            assert!(guard.segments().iter().all(|s| s.prot() == rw()));
        }

        #[test]
        fn shared_read_only_file_cannot_become_writable() {
            let (_, space) = setup(4);
            let guard = space.begin_modify();
            let addr = guard
                .map(
                    MapRequest::new(2 * PAGE, Protection::READ, MapFlags::SHARED)
                        .backing(Arc::new(ReadOnlyFile), 0),
                )
                .unwrap();
            assert_eq!(guard.protect(addr, PAGE, rw()), Err(Error::PermissionDenied));
            assert_eq!(guard.segments().len(), 1);
        }
    }

    mod advise {
        use super::*;
        use crate::{
            fault::{Access, FaultMode, Resolution, handle_page_fault},
            page::PageAllocator,
            uaccess::UserMemory,
        };

        #[test]
        fn dont_need_releases_only_clean_pages() {
            let (memory, space) = setup(8);
            let addr = {
                let guard = space.begin_modify();
                guard
                    .map(
                        MapRequest::new(2 * PAGE, Protection::READ, MapFlags::PRIVATE)
                            .backing(Arc::new(ReadOnlyFile), 0),
                    )
                    .unwrap()
            };
            let anon = space.begin_modify().map(MapRequest::anonymous(PAGE, rw())).unwrap();
            {
                let _transfer = space.begin_transfer();
                let mut byte = [0];
                space.read_user(addr, &mut byte);
                space.read_user(addr + PAGE, &mut byte);
                assert_eq!(byte, [7]);
            }
            touch(&space, anon);
            assert_eq!(memory.allocated_frames(), 3);

            let guard = space.begin_modify();
            guard.advise(addr, 3 * PAGE, Advice::DontNeed).unwrap();
            assert_eq!(memory.allocated_frames(), 1);
            assert!(guard.page_entry(anon).is_some());
            assert!(guard.segments().iter().all(|s| s.advice() == Advice::DontNeed));
            drop(guard);

            let _transfer = space.begin_transfer();
            let mut byte = [0];
            space.read_user(addr + PAGE, &mut byte);
            assert_eq!(byte, [7]);
        }

        #[test]
        fn user_stores_survive_dont_need() {
            let (memory, space) = setup(4);
            let addr = space.begin_modify().map(MapRequest::anonymous(2 * PAGE, rw())).unwrap();
            space.begin_modify().advise(addr + PAGE, PAGE, Advice::WillNeed).unwrap();

            for page in [addr, addr + PAGE] {
                if space.page_entry(page).is_none() {
                    assert_eq!(
                        handle_page_fault(&space, page, Access::Read, FaultMode::User),
                        Resolution::Resolved
                    );
                }
                let entry = space.page_entry(page).unwrap();
                assert!(!entry.permits(Access::Write), "a clean page must fault on store");

                assert_eq!(
                    handle_page_fault(&space, page + 16, Access::Write, FaultMode::User),
                    Resolution::Resolved
                );
                let entry = space.page_entry(page).unwrap();
                assert!(entry.permits(Access::Write) && entry.is_dirty());
                // The store itself, as the hardware would perform it.
                memory.write(entry.frame(), 16, b"user data");
            }

            madvisefor(&space, addr.as_usize(), 2 * PAGE, Advice::DontNeed).unwrap();
            assert_eq!(space.resident_pages(), 2);

            let transfer = space.begin_transfer();
            for page in [addr, addr + PAGE] {
                let mut buf = [0; 9];
                transfer.read(page + 16, &mut buf).unwrap();
                assert_eq!(&buf, b"user data");
            }
        }

        #[test]
        fn will_need_populates_subrange() {
            let (_, space) = setup(8);
            let guard = space.begin_modify();
            let addr = guard.map(MapRequest::anonymous(4 * PAGE, rw())).unwrap();
            guard.advise(addr + PAGE, 2 * PAGE, Advice::WillNeed).unwrap();
            assert_eq!(guard.resident_pages(), 2);

            let advice: Vec<_> = guard.segments().iter().map(Segment::advice).collect();
            assert_eq!(advice, [Advice::Normal, Advice::WillNeed, Advice::Normal]);
        }
    }

    mod insert {
        use super::*;
        use crate::page::PageAllocator;

        #[test]
        fn places_caller_frames() {
            let (memory, space) = setup(4);
            let frames = [
                memory.allocate(MemoryAttribute::Normal).unwrap(),
                memory.allocate(MemoryAttribute::Normal).unwrap(),
            ];
            memory.write(frames[1], 0, b"elf");

            let guard = space.begin_modify();
            let request = MapRequest::anonymous(2 * PAGE, Protection::READ).at(user(8));
            assert_eq!(guard.insert(request, &frames), Ok(user(8)));
            assert_eq!(guard.page_entry(user(9)).unwrap().frame(), frames[1]);
            assert!(guard.page_entry(user(8)).unwrap().is_dirty());
            drop(guard);

            let _transfer = space.begin_transfer();
            let mut buf = [0; 3];
            space.read_user(user(9), &mut buf);
            assert_eq!(&buf, b"elf");
        }

        #[test]
        fn conflict_leaves_frames_with_caller() {
            let (memory, space) = setup(4);
            let frame = memory.allocate(MemoryAttribute::Normal).unwrap();
            let guard = space.begin_modify();
            guard.map(MapRequest::anonymous(PAGE, rw()).fixed(user(0))).unwrap();

            let request = MapRequest::anonymous(PAGE, rw()).at(user(0));
            assert_eq!(guard.insert(request, &[frame]), Err(Error::AddressInUse));
            assert_eq!(memory.references(frame), 1);

            let unplaced = MapRequest::anonymous(PAGE, rw());
            assert_eq!(guard.insert(unplaced, &[frame]), Err(Error::InvalidArgument));
            let short = MapRequest::anonymous(2 * PAGE, rw()).at(user(4));
            assert_eq!(guard.insert(short, &[frame]), Err(Error::InvalidArgument));
        }
    }

    mod syscalls {
        use super::*;
        use crate::{SignalHandle, uaccess::UserMemory};

        const READ: u32 = 1;
        const WRITE: u32 = 2;
        const PRIVATE: u32 = 0x02;
        const PRIVATE_ANONYMOUS: u32 = 0x22;

        #[test]
        fn rounds_length_up() {
            let (_, space) = setup(4);
            let addr = mmapfor(&space, 0, 100, READ | WRITE, PRIVATE_ANONYMOUS, None, 0, MemoryAttribute::Normal)
                .unwrap();
            assert_eq!(space.segment_at(addr).unwrap().len(), PAGE);

            mprotectfor(&space, addr.as_usize(), 1, READ).unwrap();
            assert_eq!(space.segment_at(addr).unwrap().prot(), Protection::READ);

            madvisefor(&space, addr.as_usize(), PAGE, Advice::Sequential).unwrap();
            munmapfor(&space, addr.as_usize(), 1).unwrap();
            assert!(space.segments().is_empty());
        }

        #[test]
        fn rejects_bad_arguments() {
            let (_, space) = setup(4);
            let normal = MemoryAttribute::Normal;
            assert_eq!(
                mmapfor(&space, 0, 0, READ, PRIVATE_ANONYMOUS, None, 0, normal),
                Err(Error::InvalidArgument)
            );
            assert_eq!(
                mmapfor(&space, 0, PAGE, 0x80, PRIVATE_ANONYMOUS, None, 0, normal),
                Err(Error::InvalidArgument)
            );
            assert_eq!(
                mmapfor(&space, 0, PAGE, READ, 0x4000, None, 0, normal),
                Err(Error::InvalidArgument)
            );
            assert_eq!(
                mmapfor(&space, USER_BASE + 1, PAGE, READ, PRIVATE_ANONYMOUS | 0x10, None, 0, normal),
                Err(Error::InvalidArgument)
            );
            assert_eq!(
                mmapfor(&space, 0, usize::MAX, READ, PRIVATE_ANONYMOUS, None, 0, normal),
                Err(Error::InvalidArgument)
            );
            assert_eq!(munmapfor(&space, USER_BASE + 1, PAGE), Err(Error::InvalidArgument));
            assert_eq!(munmapfor(&space, 0, PAGE), Err(Error::InvalidArgument));
            assert_eq!(munmapfor(&space, USER_END - PAGE, 2 * PAGE), Err(Error::InvalidArgument));
            assert_eq!(mprotectfor(&space, USER_BASE, PAGE, 8), Err(Error::InvalidArgument));
        }

        #[test]
        fn file_range_past_end_of_offsets_is_rejected() {
            let (_, space) = setup(4);
            let file = || Some(Arc::new(ReadOnlyFile) as Arc<dyn Vnode>);
            let normal = MemoryAttribute::Normal;
            let top = u64::MAX - PAGE as u64 + 1;
            for offset in [top, top - PAGE as u64] {
                assert_eq!(
                    mmapfor(&space, 0, 2 * PAGE, READ, PRIVATE, file(), offset, normal),
                    Err(Error::InvalidArgument)
                );
            }
            assert!(space.segments().is_empty());

            // A range ending just short of the wrap is fine.
            let last = top - PAGE as u64;
            let addr = mmapfor(&space, 0, PAGE, READ, PRIVATE, file(), last, normal).unwrap();
            let transfer = space.begin_transfer();
            let mut byte = [0];
            transfer.read(addr, &mut byte).unwrap();
            assert_eq!(byte, [7]);
        }

        #[test]
        fn pending_signal_interrupts_contended_mmap() {
            let (_, space) = setup(4);
            let _transfer = space.begin_transfer();

            let contender = Arc::clone(&space);
            let result = std::thread::spawn(move || {
                SignalHandle::current().raise();
                mmapfor(&contender, 0, PAGE, READ, PRIVATE_ANONYMOUS, None, 0, MemoryAttribute::Normal)
            })
            .join()
            .unwrap();
            assert_eq!(result, Err(Error::Interrupted));
            assert!(space.segments().is_empty());
        }
    }
}
