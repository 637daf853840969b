//! Errors a caller can legitimately hit, as opposed to internal invariant violations.
//!
//! Per the core's error taxonomy, encoder precondition violations and allocator invariant
//! breaks are implementation bugs and stay as `debug_assert!`/`panic!` at their call sites;
//! only conditions the embedding host can actually cause or must react to are modeled here.

use thiserror::Error;

/// An error surfaced from the public entry points of [`crate::JitContext`].
#[derive(Error, Debug)]
pub enum JitError {
    /// Growing the code buffer, or one of the per-function scratch arenas, failed.
    #[error("out of memory while growing the JIT code buffer")]
    OutOfMemory,

    /// A cross-function call's relocated offset exceeds AArch64's ±128 MiB `BL` range and
    /// veneer synthesis is disabled.
    #[error("relocation out of range: call site at offset {call_site:#x} to target at offset {target:#x} exceeds the +/-128MiB BL range")]
    RelocationOutOfRange {
        /// Byte offset of the call site within the finalized code buffer.
        call_site: usize,
        /// Byte offset of the call target within the finalized code buffer.
        target: usize,
    },

    /// A hot-reload call site referenced a function absent from both the new and the
    /// previous module.
    #[error("missing findex {findex} while resolving a hot-reload call site")]
    MissingFindex {
        /// The function index that could not be resolved.
        findex: usize,
    },

    /// The host runtime failed to hand back an executable-memory region.
    #[error("host failed to allocate {size} bytes of executable memory")]
    ExecutableAllocFailed {
        /// Requested size in bytes.
        size: usize,
    },
}
