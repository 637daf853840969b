//! Executable memory management: allocate a region from the host OS, copy
//! the finished code buffer into it, flip the writable/executable toggle where the platform
//! demands it, and invalidate the instruction cache over the written range. Modeled on a
//! JIT allocator's reserve/commit split, adapted here to the `region` crate rather than
//! `memmap2` since this core targets a single fixed-size mapping per module rather than a
//! growable pooled allocator.

use region::{Allocation, Protection};

use crate::error::JitError;

/// One finalized executable mapping. The `region` crate's `Allocation` releases the mapping
/// on drop, so this is a thin wrapper giving callers a stable `*const u8`/len pair.
pub struct ExecutableMemory {
    alloc: Allocation,
    code_len: usize,
}

// SAFETY: the mapping is exclusively owned by this struct; no other code holds a pointer into
// it once transferred here, so it's safe to move across threads (the resulting function
// pointers, not this struct, are what later get called concurrently).
unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}

impl ExecutableMemory {
    pub fn as_ptr(&self) -> *const u8 {
        self.alloc.as_ptr::<u8>()
    }

    /// Length of the code actually written, not the page-rounded mapping size.
    pub fn len(&self) -> usize {
        self.code_len
    }

    pub fn is_empty(&self) -> bool {
        self.code_len == 0
    }
}

/// An RW mapping reserved ahead of relocation, so the caller can learn its base address (to
/// compute cross-function call deltas) and patch the about-to-be-copied bytes before the
/// mapping ever becomes executable. Patching after the RX toggle would fault under
/// `Flags::enforce_write_xor_execute`, so relocation must happen between `reserve` and
/// `commit`.
pub struct ReservedMemory {
    alloc: Allocation,
    page_len: usize,
}

impl ReservedMemory {
    pub fn base(&self) -> usize {
        self.alloc.as_ptr::<u8>() as usize
    }
}

/// Reserve RW memory sized to hold `len` bytes of code. `base()` is stable from this point
/// on; the mapping does not become executable until `commit`.
pub fn reserve(len: usize) -> Result<ReservedMemory, JitError> {
    let page_len = round_up_to_page(len.max(1));
    let alloc = region::alloc(page_len, Protection::READ_WRITE)
        .map_err(|_| JitError::ExecutableAllocFailed { size: page_len })?;
    Ok(ReservedMemory { alloc, page_len })
}

/// Copy `code` into a previously `reserve`d mapping, flip it to executable, and invalidate
/// the instruction cache over the written range. `enforce_write_xor_execute` controls whether
/// the mapping is dropped to RX (some embedders keep pages RWX throughout and skip the
/// toggle; Apple Silicon requires it).
pub fn commit(
    reserved: ReservedMemory,
    code: &[u8],
    enforce_write_xor_execute: bool,
    invalidate_icache: impl FnOnce(*const u8, usize),
) -> Result<ExecutableMemory, JitError> {
    let ptr = reserved.alloc.as_ptr::<u8>() as *mut u8;
    debug_assert!(code.len() <= reserved.page_len);

    // SAFETY: `ptr` is writable for `reserved.page_len` bytes and `code.len() <= page_len`.
    unsafe {
        std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
    }

    let exec_protection = if enforce_write_xor_execute {
        Protection::READ_EXECUTE
    } else {
        Protection::READ_WRITE_EXECUTE
    };
    // SAFETY: `ptr`/`page_len` describe the mapping `reserved.alloc` owns.
    unsafe {
        region::protect(ptr, reserved.page_len, exec_protection)
            .map_err(|_| JitError::ExecutableAllocFailed { size: reserved.page_len })?;
    }

    invalidate_icache(ptr, code.len());

    Ok(ExecutableMemory {
        alloc: reserved.alloc,
        code_len: code.len(),
    })
}

fn round_up_to_page(len: usize) -> usize {
    let page = region::page::size();
    (len + page - 1) / page * page
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finalize_copies_bytes_and_invalidates_written_range() {
        let code = [0xd5u8, 0x03, 0x20, 0x1f]; // NOP, for shape only
        let reserved = reserve(code.len()).unwrap();
        let base = reserved.base();
        let mut invalidated = None;
        let mem = commit(reserved, &code, true, |ptr, len| invalidated = Some((ptr as usize, len))).unwrap();
        assert_eq!(mem.len(), code.len());
        assert_eq!(mem.as_ptr() as usize, base);
        assert_eq!(invalidated, Some((mem.as_ptr() as usize, code.len())));
    }

    #[test]
    fn reserve_rounds_up_to_a_page_but_reports_true_code_length() {
        let reserved = reserve(1).unwrap();
        assert!(reserved.page_len >= region::page::size());
        let code = [0u8; 4];
        let mem = commit(reserved, &code, true, |_, _| {}).unwrap();
        assert_eq!(mem.len(), 4);
    }
}
