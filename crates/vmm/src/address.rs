//! Virtual address type.
//!
//! User addresses arrive from untrusted code, so the arithmetic helpers that can overflow come
//! in checked form.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{PageNumber, arch};

/// A virtual address in some address space.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new virtual address.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    /// Creates an address from a pointer.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    /// Returns the raw address value.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns true if this is the null address.
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Checks if the address is aligned to the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        self.0 & (align - 1) == 0
    }

    /// Returns true if the address is aligned to a page boundary.
    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.is_aligned(arch::PAGE_SIZE)
    }

    /// Aligns the address down to the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn align_down(self, align: usize) -> Self {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        Self(self.0 & !(align - 1))
    }

    /// Aligns the address up to the given alignment, returning `None` on overflow.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        match self.0.checked_add(align - 1) {
            Some(raw) => Some(Self(raw & !(align - 1))),
            None => None,
        }
    }

    /// Adds a byte offset, returning `None` on overflow.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Returns the page containing this address.
    #[inline]
    pub fn page(self) -> PageNumber {
        PageNumber::from(self)
    }

    /// Returns the offset of this address within its page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }
}

impl fmt::Pointer for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualAddress({:#x})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for VirtualAddress {
    #[inline]
    fn from(addr: usize) -> Self {
        Self::new(addr)
    }
}

impl Add<usize> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for VirtualAddress {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<VirtualAddress> for VirtualAddress {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: VirtualAddress) -> Self::Output {
        self.0 - rhs.0
    }
}
