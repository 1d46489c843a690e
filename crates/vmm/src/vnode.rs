//! Backing object interface for file-backed mappings.

use core::fmt;

use crate::Result;

/// A file (or file-like object) whose content populates a mapping.
///
/// Segments hold vnodes as `Arc<dyn Vnode>`; splitting a segment clones the handle and the
/// last segment to drop it releases the reference.
pub trait Vnode: Send + Sync + fmt::Debug {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning the number of bytes read.
    ///
    /// Bytes past the end of the file are not touched; the caller zero-fills them.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Returns true if the vnode was opened for writing.
    fn writable(&self) -> bool;
}
