//! Initial user stack for a freshly loaded program.
//!
//! The program loader maps the image into a space that is not running yet, then calls
//! [`build_args`] through a [`TransferGuard`] to lay out the stack the program starts with:
//!
//! ```text
//! stack_top  -> program name, argument and environment strings
//!               (padding)
//! sp + ...   -> auxiliary vector, AT_NULL terminated
//!               envp[0..], NULL
//!               argv[0..], NULL
//! sp         -> argc
//! ```

use alloc::vec::Vec;

use crate::{
    Error, Result, Segment, TransferGuard, VirtualAddress, WORD_SIZE, uaccess::UserMemory,
};

const AT_NULL: usize = 0;
const AT_PHDR: usize = 3;
const AT_PHENT: usize = 4;
const AT_PHNUM: usize = 5;
const AT_PAGESZ: usize = 6;
const AT_BASE: usize = 7;
const AT_ENTRY: usize = 9;
const AT_HWCAP: usize = 16;
const AT_EXECFN: usize = 31;

/// Stack pointer alignment required at program entry.
const STACK_ALIGN: usize = 16;

/// Platform values the loader reports to the new program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxVector {
    /// Address of the program headers in the new image.
    pub phdr: usize,
    /// Size of one program header.
    pub phent: usize,
    /// Number of program headers.
    pub phnum: usize,
    /// Base address of the interpreter, or zero.
    pub base: usize,
    /// Entry point of the program.
    pub entry: usize,
    /// Hardware capability bits.
    pub hwcap: usize,
}

impl AuxVector {
    fn entries(&self, execfn: usize) -> [(usize, usize); 9] {
        [
            (AT_PHDR, self.phdr),
            (AT_PHENT, self.phent),
            (AT_PHNUM, self.phnum),
            (AT_PAGESZ, crate::PAGE_SIZE),
            (AT_BASE, self.base),
            (AT_ENTRY, self.entry),
            (AT_HWCAP, self.hwcap),
            (AT_EXECFN, execfn),
            (AT_NULL, 0),
        ]
    }
}

/// Writes the initial stack below `stack_top` and returns the program's stack pointer.
///
/// `stack_top` must be the end of a mapped, writable stack segment. Fails with
/// [`Error::TooLong`] if the arguments do not fit in that segment and with [`Error::Fault`] if
/// `stack_top` is not the end of a mapping.
pub fn build_args(
    transfer: &TransferGuard<'_>,
    stack_top: VirtualAddress,
    program: &[u8],
    argv: &[&[u8]],
    envp: &[&[u8]],
    auxv: &AuxVector,
) -> Result<VirtualAddress> {
    let floor = stack_top
        .as_usize()
        .checked_sub(1)
        .and_then(|last| transfer.segment_at(VirtualAddress::new(last)))
        .as_ref()
        .map(Segment::begin)
        .ok_or(Error::Fault)?;

    let mut strings = Vec::new();
    let mut offsets = Vec::with_capacity(1 + argv.len() + envp.len());
    for string in core::iter::once(&program).chain(argv).chain(envp) {
        offsets.push(strings.len());
        strings.extend_from_slice(string);
        strings.push(0);
    }

    let strings_at = stack_top
        .as_usize()
        .checked_sub(strings.len())
        .filter(|addr| *addr >= floor.as_usize())
        .ok_or(Error::TooLong)?;
    let string_addr = |index: usize| strings_at + offsets[index];

    let mut words = Vec::with_capacity(argv.len() + envp.len() + 21);
    words.push(argv.len());
    words.extend((1..=argv.len()).map(string_addr));
    words.push(0);
    words.extend((argv.len() + 1..=argv.len() + envp.len()).map(string_addr));
    words.push(0);
    for (tag, value) in auxv.entries(string_addr(0)) {
        words.push(tag);
        words.push(value);
    }

    let sp = (strings_at & !(WORD_SIZE - 1))
        .checked_sub(words.len() * WORD_SIZE)
        .map(|sp| sp & !(STACK_ALIGN - 1))
        .filter(|sp| *sp >= floor.as_usize())
        .ok_or(Error::TooLong)?;

    let table: Vec<u8> = words.iter().flat_map(|word| word.to_ne_bytes()).collect();
    transfer.write(VirtualAddress::new(strings_at), &strings)?;
    transfer.write(VirtualAddress::new(sp), &table)?;

    log::debug!(
        "built initial stack for pid {:?}: {} args, {} env, sp {sp:#x}",
        transfer.pid(),
        argv.len(),
        envp.len()
    );
    Ok(VirtualAddress::new(sp))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AddressSpace, EmulatedMemory, MapRequest, PAGE_SIZE, Pid, Protection};
    use alloc::sync::Arc;

    fn stack(pages: usize) -> (Arc<AddressSpace>, VirtualAddress) {
        let memory = Arc::new(EmulatedMemory::new(8, 0, 0));
        let space = AddressSpace::create(Pid(2), memory);
        let base = space
            .begin_modify()
            .map(MapRequest::anonymous(
                pages * PAGE_SIZE,
                Protection::READ | Protection::WRITE,
            ))
            .unwrap();
        (space, base + pages * PAGE_SIZE)
    }

    fn aux() -> AuxVector {
        AuxVector {
            phdr: 0x1_0040,
            phent: 56,
            phnum: 4,
            base: 0,
            entry: 0x1_1000,
            hwcap: 0,
        }
    }

    #[test]
    fn lays_out_argc_argv_envp_auxv() {
        let (space, top) = stack(1);
        let transfer = space.begin_transfer();
        let sp = build_args(
            &transfer,
            top,
            b"/bin/sh",
            &[b"sh", b"-c"],
            &[b"HOME=/"],
            &aux(),
        )
        .unwrap();

        assert_eq!(sp.as_usize() % STACK_ALIGN, 0);
        let word = |index: usize| transfer.read_word(sp + index * WORD_SIZE).unwrap();
        assert_eq!(word(0), 2);
        assert_eq!(
            transfer.read_string(VirtualAddress::new(word(1)), 16),
            Ok(b"sh".to_vec())
        );
        assert_eq!(
            transfer.read_string(VirtualAddress::new(word(2)), 16),
            Ok(b"-c".to_vec())
        );
        assert_eq!(word(3), 0);
        assert_eq!(
            transfer.read_string(VirtualAddress::new(word(4)), 16),
            Ok(b"HOME=/".to_vec())
        );
        assert_eq!(word(5), 0);

        let auxv: Vec<(usize, usize)> =
            (0..9).map(|i| (word(6 + 2 * i), word(7 + 2 * i))).collect();
        assert_eq!(auxv[0], (AT_PHDR, 0x1_0040));
        assert_eq!(auxv[3], (AT_PAGESZ, PAGE_SIZE));
        assert_eq!(auxv[8], (AT_NULL, 0));
        assert_eq!(auxv[7].0, AT_EXECFN);
        assert_eq!(
            transfer.read_string(VirtualAddress::new(auxv[7].1), 16),
            Ok(b"/bin/sh".to_vec())
        );
    }

    #[test]
    fn oversized_arguments_are_too_long() {
        let (space, top) = stack(1);
        let transfer = space.begin_transfer();
        let huge = [b'a'; PAGE_SIZE];
        assert_eq!(
            build_args(&transfer, top, b"x", &[&huge], &[], &aux()),
            Err(Error::TooLong)
        );
        let almost = [b'a'; PAGE_SIZE - 64];
        assert_eq!(
            build_args(&transfer, top, b"x", &[&almost], &[], &aux()),
            Err(Error::TooLong)
        );
        assert_eq!(space.resident_pages(), 0);
    }

    #[test]
    fn unmapped_top_is_fault() {
        let (space, top) = stack(1);
        let transfer = space.begin_transfer();
        assert_eq!(
            build_args(&transfer, top + PAGE_SIZE, b"x", &[], &[], &aux()),
            Err(Error::Fault)
        );
    }
}
