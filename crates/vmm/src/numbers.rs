//! Page and frame number types.
//!
//! Virtual pages are identified by [`PageNumber`], physical frames handed out by the page
//! allocator by [`FrameNumber`].

use core::fmt;

use crate::{address::VirtualAddress, arch};

/// Macro to define common page/frame number functionality.
macro_rules! impl_page_number_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new page/frame number.
            #[inline]
            pub const fn new(number: usize) -> Self {
                Self(number)
            }

            /// Returns the raw page/frame number.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

impl_page_number_common!(
    FrameNumber,
    "A physical memory frame number.\n\n\
     Frames are handed out one page at a time by a [`crate::PageAllocator`]; the number is\n\
     only meaningful to the allocator that produced it."
);

impl_page_number_common!(
    PageNumber,
    "A virtual memory page number.\n\n\
     Page numbers are zero-indexed and correspond to PAGE_SIZE-aligned virtual addresses."
);

impl PageNumber {
    /// Returns the virtual address at the start of this page.
    #[inline]
    pub const fn start(self) -> VirtualAddress {
        VirtualAddress::new(self.0 * arch::PAGE_SIZE)
    }

    /// Returns the virtual address at the end of this page (start of next page).
    #[inline]
    pub const fn end(self) -> VirtualAddress {
        VirtualAddress::new((self.0 + 1) * arch::PAGE_SIZE)
    }
}

impl From<VirtualAddress> for PageNumber {
    #[inline]
    fn from(addr: VirtualAddress) -> Self {
        Self::new(addr.as_usize() / arch::PAGE_SIZE)
    }
}
