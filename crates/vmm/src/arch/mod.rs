//! Platform constants and, for host builds, the software emulation of the platform.
//!
//! The supported targets (ARMv7-M, i.MXRT, PowerPC, RISC-V32) share a 32-bit layout: user
//! mappings live in a low window, the kernel's permanently-mapped regions are registered at
//! boot through [`crate::register_kernel_regions`].

use static_assertions::{const_assert, const_assert_eq};

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
pub mod software;

/// Mapping granularity in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Lowest address a user mapping may occupy. The first 64KiB stay unmapped to catch null
/// dereferences.
pub const USER_BASE: usize = 0x0001_0000;

/// One past the highest address a user mapping may occupy.
pub const USER_END: usize = 0x8000_0000;

/// Size of a user pointer-sized word.
pub const WORD_SIZE: usize = core::mem::size_of::<usize>();

/// Number of CPUs the address-space locks are built for.
pub const MAX_CPUS: usize = 1;

// The modify/transfer locks hand off ownership without cross-CPU fencing.
const_assert_eq!(MAX_CPUS, 1);
const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(USER_BASE % PAGE_SIZE == 0 && USER_END % PAGE_SIZE == 0);

/// Returns true if the given address is inside the user window.
pub const fn is_user_space(addr: usize) -> bool {
    addr >= USER_BASE && addr < USER_END
}

/// Returns true if `[addr, addr + len)` lies inside the user window without wrapping.
pub const fn is_user_range(addr: usize, len: usize) -> bool {
    match addr.checked_add(len) {
        Some(end) => addr >= USER_BASE && end <= USER_END,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_window() {
        assert!(!is_user_space(0));
        assert!(is_user_space(USER_BASE));
        assert!(!is_user_space(USER_END));
        assert!(is_user_range(USER_BASE, USER_END - USER_BASE));
        assert!(!is_user_range(USER_END - PAGE_SIZE, 2 * PAGE_SIZE));
        assert!(!is_user_range(USER_BASE, usize::MAX));
    }
}
