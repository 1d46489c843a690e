//! Segments: contiguous mapped regions of an address space.
//!
//! A [`Segment`] describes `[begin, end)` with uniform protection, backing and memory attribute.
//! An address space keeps its segments in a [`SegmentMap`], ordered by base address and never
//! overlapping, so a point lookup is a single ordered search.

use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::fmt;

use crate::{Error, MemoryAttribute, Result, VirtualAddress, Vnode, arch, fault::Access};

bitflags! {
    /// Access permitted to a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Protection {
    /// Parses protection bits supplied by user space.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::from_bits(raw).ok_or(Error::InvalidArgument)
    }

    /// Returns true if this protection allows `access`.
    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self.contains(Self::READ),
            Access::Write => self.contains(Self::WRITE),
            Access::Execute => self.contains(Self::EXEC),
        }
    }
}

bitflags! {
    /// Kind of mapping requested, mirroring `mmap` flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u32 {
        /// Changes are visible to every space sharing the mapping.
        const SHARED = 0x01;
        /// Changes are private to this space.
        const PRIVATE = 0x02;
        /// Place the mapping exactly at the requested address.
        const FIXED = 0x10;
        /// No backing object; pages start zeroed.
        const ANONYMOUS = 0x20;
    }
}

impl MapFlags {
    /// Parses mapping flags supplied by user space.
    pub fn from_raw(raw: u32) -> Result<Self> {
        Self::from_bits(raw).ok_or(Error::InvalidArgument)
    }
}

/// Physical-residency hint recorded on a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Advice {
    /// No special treatment.
    #[default]
    Normal,
    /// Pages will be accessed in random order.
    Random,
    /// Pages will be accessed sequentially.
    Sequential,
    /// Pages will be needed soon; populate them now.
    WillNeed,
    /// Pages will not be needed soon; clean pages may be released.
    DontNeed,
}

/// The file region backing a mapping.
#[derive(Clone)]
pub struct Backing {
    vnode: Arc<dyn Vnode>,
    offset: u64,
}

impl Backing {
    /// Backs a mapping with `vnode` starting at file offset `offset`.
    pub fn new(vnode: Arc<dyn Vnode>, offset: u64) -> Self {
        Self { vnode, offset }
    }

    /// Returns the backing vnode.
    pub fn vnode(&self) -> &Arc<dyn Vnode> {
        &self.vnode
    }

    /// Returns the file offset of the first byte of the mapping.
    pub fn offset(&self) -> u64 {
        self.offset
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backing")
            .field("vnode", &self.vnode)
            .field("offset", &format_args!("{:#x}", self.offset))
            .finish()
    }
}

/// One contiguous mapped virtual-address range.
#[derive(Debug, Clone)]
pub struct Segment {
    begin: VirtualAddress,
    end: VirtualAddress,
    prot: Protection,
    flags: MapFlags,
    backing: Option<Backing>,
    attribute: MemoryAttribute,
    advice: Advice,
}

impl Segment {
    pub(crate) fn new(
        begin: VirtualAddress,
        len: usize,
        prot: Protection,
        flags: MapFlags,
        backing: Option<Backing>,
        attribute: MemoryAttribute,
    ) -> Self {
        debug_assert!(begin.is_page_aligned() && len % arch::PAGE_SIZE == 0 && len > 0);
        Self {
            begin,
            end: begin + len,
            prot,
            flags: flags - MapFlags::FIXED,
            backing,
            attribute,
            advice: Advice::Normal,
        }
    }

    /// Returns the first address of the segment.
    pub fn begin(&self) -> VirtualAddress {
        self.begin
    }

    /// Returns one past the last address of the segment.
    pub fn end(&self) -> VirtualAddress {
        self.end
    }

    /// Returns the size of the segment in bytes.
    pub fn len(&self) -> usize {
        self.end - self.begin
    }

    /// Returns the segment's protection.
    pub fn prot(&self) -> Protection {
        self.prot
    }

    /// Returns the mapping flags the segment was created with.
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    /// Returns the backing file region, if the segment is file-backed.
    pub fn backing(&self) -> Option<&Backing> {
        self.backing.as_ref()
    }

    /// Returns the backing vnode, if the segment is file-backed.
    pub fn vnode(&self) -> Option<&Arc<dyn Vnode>> {
        self.backing.as_ref().map(Backing::vnode)
    }

    /// Returns the memory attribute selecting the physical pool.
    pub fn attribute(&self) -> MemoryAttribute {
        self.attribute
    }

    /// Returns the residency advice last applied to the segment.
    pub fn advice(&self) -> Advice {
        self.advice
    }

    /// Returns true if `addr` lies inside the segment.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.begin <= addr && addr < self.end
    }

    /// Returns true if the segment shares its pages with other mappers.
    pub fn is_shared(&self) -> bool {
        self.flags.contains(MapFlags::SHARED)
    }

    /// Returns the file offset backing `addr`, if the segment is file-backed and the offset is
    /// representable.
    pub fn file_offset(&self, addr: VirtualAddress) -> Option<u64> {
        debug_assert!(self.contains(addr));
        self.backing
            .as_ref()
            .and_then(|backing| backing.offset.checked_add((addr - self.begin) as u64))
    }

    /// Returns true if a write through this segment must be refused by the backing object.
    pub(crate) fn write_denied_by_backing(&self, prot: Protection) -> bool {
        prot.contains(Protection::WRITE)
            && self.is_shared()
            && self.vnode().is_some_and(|vnode| !vnode.writable())
    }

    pub(crate) fn set_prot(&mut self, prot: Protection) {
        self.prot = prot;
    }

    pub(crate) fn set_advice(&mut self, advice: Advice) {
        self.advice = advice;
    }

    /// Splits the segment at `at`, keeping `[begin, at)` and returning `[at, end)`.
    fn split_off(&mut self, at: VirtualAddress) -> Segment {
        debug_assert!(self.begin < at && at < self.end && at.is_page_aligned());
        let backing = self.backing.as_ref().map(|backing| Backing {
            vnode: Arc::clone(&backing.vnode),
            offset: backing.offset.saturating_add((at - self.begin) as u64),
        });
        let upper = Segment {
            begin: at,
            end: self.end,
            prot: self.prot,
            flags: self.flags,
            backing,
            attribute: self.attribute,
            advice: self.advice,
        };
        self.end = at;
        upper
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prot = |flag, c| if self.prot.contains(flag) { c } else { '-' };
        write!(
            f,
            "{}-{} {}{}{}{} {:?}",
            self.begin,
            self.end,
            prot(Protection::READ, 'r'),
            prot(Protection::WRITE, 'w'),
            prot(Protection::EXEC, 'x'),
            if self.is_shared() { 's' } else { 'p' },
            self.attribute,
        )?;
        if let Some(backing) = &self.backing {
            write!(f, " {:?}@{:#x}", backing.vnode, backing.offset)?;
        }
        Ok(())
    }
}

/// Ordered, non-overlapping collection of segments keyed by base address.
#[derive(Default)]
pub(crate) struct SegmentMap {
    segments: BTreeMap<VirtualAddress, Segment>,
}

impl SegmentMap {
    /// Returns the segment covering `addr`.
    pub fn find(&self, addr: VirtualAddress) -> Option<&Segment> {
        self.segments
            .range(..=addr)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| segment.contains(addr))
    }

    /// Returns the number of segments.
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    /// Iterates over the segments in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.segments.values()
    }

    /// Iterates over the segments overlapping `[begin, end)`.
    pub fn overlapping(
        &self,
        begin: VirtualAddress,
        end: VirtualAddress,
    ) -> impl Iterator<Item = &Segment> {
        let first = self.find(begin).map_or(begin, Segment::begin);
        self.segments.range(first..end).map(|(_, segment)| segment)
    }

    /// Mutable variant of [`overlapping`](Self::overlapping).
    pub fn overlapping_mut(
        &mut self,
        begin: VirtualAddress,
        end: VirtualAddress,
    ) -> impl Iterator<Item = &mut Segment> {
        let first = self.find(begin).map_or(begin, Segment::begin);
        self.segments.range_mut(first..end).map(|(_, segment)| segment)
    }

    /// Returns true if no segment overlaps `[begin, end)`.
    pub fn is_free(&self, begin: VirtualAddress, end: VirtualAddress) -> bool {
        self.overlapping(begin, end).next().is_none()
    }

    /// Returns true if `[begin, end)` is covered without gaps by segments permitting `prot`.
    pub fn covers(&self, begin: VirtualAddress, end: VirtualAddress, prot: Protection) -> bool {
        let mut cursor = begin;
        for segment in self.overlapping(begin, end) {
            if segment.begin() > cursor || !segment.prot().contains(prot) {
                return false;
            }
            cursor = segment.end();
            if cursor >= end {
                return true;
            }
        }
        cursor >= end
    }

    /// Finds a free, page-aligned range of `len` bytes in the user window.
    ///
    /// The hint is used when it is free; otherwise the lowest hole that fits wins.
    pub fn find_hole(&self, hint: Option<VirtualAddress>, len: usize) -> Option<VirtualAddress> {
        if let Some(hint) = hint {
            if hint.is_page_aligned()
                && arch::is_user_range(hint.as_usize(), len)
                && self.is_free(hint, hint + len)
            {
                return Some(hint);
            }
        }

        let mut cursor = VirtualAddress::new(arch::USER_BASE);
        for segment in self.iter() {
            if segment.begin() >= cursor && segment.begin() - cursor >= len {
                return Some(cursor);
            }
            cursor = cursor.max(segment.end());
        }
        (arch::USER_END - cursor.as_usize() >= len).then_some(cursor)
    }

    /// Inserts a segment into a free range.
    pub fn insert(&mut self, segment: Segment) {
        debug_assert!(self.is_free(segment.begin(), segment.end()));
        self.segments.insert(segment.begin(), segment);
    }

    /// Splits the segment strictly containing `at` so that a segment boundary falls on `at`.
    pub fn split_at(&mut self, at: VirtualAddress) {
        let Some(segment) = self
            .segments
            .range_mut(..at)
            .next_back()
            .map(|(_, segment)| segment)
            .filter(|segment| segment.contains(at))
        else {
            return;
        };
        let upper = segment.split_off(at);
        self.segments.insert(upper.begin(), upper);
    }

    /// Removes everything in `[begin, end)`, splitting segments at the edges, and returns the
    /// removed pieces.
    pub fn carve(&mut self, begin: VirtualAddress, end: VirtualAddress) -> Vec<Segment> {
        self.split_at(begin);
        self.split_at(end);
        let keys: Vec<VirtualAddress> = self.segments.range(begin..end).map(|(k, _)| *k).collect();
        keys.into_iter()
            .filter_map(|key| self.segments.remove(&key))
            .collect()
    }
}
