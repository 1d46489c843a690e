//! Per-address-space translation table.
//!
//! The table maps resident virtual pages to physical frames. Every entry holds one reference on
//! its frame; dropping the entry from the table is paired with a release by the owner.

use alloc::{collections::BTreeMap, vec::Vec};
use bitflags::bitflags;

use crate::{FrameNumber, PageNumber, Protection, fault::Access};

bitflags! {
    /// Hardware-visible and software bits of a page-table entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PageFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Shared with another space; the first write takes a private copy.
        const COW = 1 << 3;
        /// Written since it was populated from its backing.
        const DIRTY = 1 << 4;
        /// The mapping allows writes. WRITE is only set once the page is dirty and private,
        /// so the first store to a clean page always faults.
        const WRITABLE = 1 << 5;
    }
}

impl From<Protection> for PageFlags {
    fn from(prot: Protection) -> Self {
        let mut flags = PageFlags::empty();
        flags.set(PageFlags::READ, prot.contains(Protection::READ));
        flags.set(PageFlags::WRITABLE, prot.contains(Protection::WRITE));
        flags.set(PageFlags::EXEC, prot.contains(Protection::EXEC));
        flags
    }
}

/// A resident page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageEntry {
    frame: FrameNumber,
    flags: PageFlags,
}

impl PageEntry {
    /// Creates a clean entry mapping `frame` for `prot`.
    ///
    /// A clean entry is not hardware-writable even if `prot` allows writes.
    pub fn new(frame: FrameNumber, prot: Protection) -> Self {
        let mut entry = Self {
            frame,
            flags: prot.into(),
        };
        entry.sync_write();
        entry
    }

    /// Returns the frame this page maps.
    pub fn frame(&self) -> FrameNumber {
        self.frame
    }

    /// Returns the entry's flags.
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    /// Returns true if the hardware bits allow `access` without faulting.
    pub fn permits(&self, access: Access) -> bool {
        match access {
            Access::Read => self.flags.contains(PageFlags::READ),
            Access::Write => self.flags.contains(PageFlags::WRITE),
            Access::Execute => self.flags.contains(PageFlags::EXEC),
        }
    }

    /// Returns true if the page is shared copy-on-write.
    pub fn is_cow(&self) -> bool {
        self.flags.contains(PageFlags::COW)
    }

    /// Returns true if the page has been written since it was populated.
    pub fn is_dirty(&self) -> bool {
        self.flags.contains(PageFlags::DIRTY)
    }

    /// Replaces the hardware bits with those for `prot`.
    ///
    /// Copy-on-write and clean pages stay unwritable until a write fault.
    pub fn set_protection(&mut self, prot: Protection) {
        let software = self.flags & (PageFlags::COW | PageFlags::DIRTY);
        self.flags = PageFlags::from(prot) | software;
        self.sync_write();
    }

    fn sync_write(&mut self) {
        let writable =
            self.flags.contains(PageFlags::WRITABLE | PageFlags::DIRTY) && !self.is_cow();
        self.flags.set(PageFlags::WRITE, writable);
    }

    /// Marks the page copy-on-write and removes write access.
    pub(crate) fn mark_cow(&mut self) {
        self.flags.insert(PageFlags::COW);
        self.sync_write();
    }

    /// Ends copy-on-write sharing, pointing the entry at `frame` with the hardware bits for
    /// `prot`.
    pub(crate) fn break_cow(&mut self, frame: FrameNumber, prot: Protection) {
        self.frame = frame;
        self.flags.remove(PageFlags::COW);
        self.set_protection(prot);
    }

    /// Records a write, making the page hardware-writable if the mapping and sharing allow it.
    pub(crate) fn mark_dirty(&mut self) {
        self.flags.insert(PageFlags::DIRTY);
        self.sync_write();
    }
}

/// Sparse page table of one address space.
#[derive(Debug, Default)]
pub(crate) struct PageTable {
    entries: BTreeMap<PageNumber, PageEntry>,
}

impl PageTable {
    pub fn get(&self, page: PageNumber) -> Option<&PageEntry> {
        self.entries.get(&page)
    }

    pub fn get_mut(&mut self, page: PageNumber) -> Option<&mut PageEntry> {
        self.entries.get_mut(&page)
    }

    /// Installs an entry, returning the one it displaced.
    pub fn insert(&mut self, page: PageNumber, entry: PageEntry) -> Option<PageEntry> {
        self.entries.insert(page, entry)
    }

    pub fn remove(&mut self, page: PageNumber) -> Option<PageEntry> {
        self.entries.remove(&page)
    }

    /// Removes every entry for pages in `[first, end)` and returns them in address order.
    pub fn remove_range(&mut self, first: PageNumber, end: PageNumber) -> Vec<PageEntry> {
        let pages: Vec<PageNumber> = self.entries.range(first..end).map(|(p, _)| *p).collect();
        pages
            .into_iter()
            .filter_map(|page| self.entries.remove(&page))
            .collect()
    }

    /// Iterates over resident pages in `[first, end)`.
    pub fn range_mut(
        &mut self,
        first: PageNumber,
        end: PageNumber,
    ) -> impl Iterator<Item = (PageNumber, &mut PageEntry)> {
        self.entries
            .range_mut(first..end)
            .map(|(page, entry)| (*page, entry))
    }

    /// Iterates over resident pages in `[first, end)`.
    pub fn range(
        &self,
        first: PageNumber,
        end: PageNumber,
    ) -> impl Iterator<Item = (PageNumber, &PageEntry)> {
        self.entries.range(first..end).map(|(page, entry)| (*page, entry))
    }

    pub fn iter(&self) -> impl Iterator<Item = (PageNumber, &PageEntry)> {
        self.entries.iter().map(|(page, entry)| (*page, entry))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PageNumber, &mut PageEntry)> {
        self.entries.iter_mut().map(|(page, entry)| (*page, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Removes every entry.
    pub fn drain(&mut self) -> impl Iterator<Item = PageEntry> {
        core::mem::take(&mut self.entries).into_values()
    }
}
