//! The growable code buffer, its literal pool, and the deferred-patch bookkeeping that sits
//! above it.
//!
//! The buffer itself is pure: it knows nothing about vregs, opcodes, or the VM. Everything
//! above this module treats it as a flat byte array that grows on demand and can be patched
//! after the fact, which keeps it independently testable.

use crate::module::FunctionIndex;

/// Upper bound on the number of bytes any single opcode may emit:
/// guarantees the capacity check at the top of the per-opcode loop is sufficient and never
/// needs to be repeated mid-opcode.
pub const MAX_OP_SIZE: usize = 256;

/// A 32-bit-word-aligned, growable byte buffer holding emitted AArch64 instructions in
/// little-endian order.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new() -> CodeBuffer {
        CodeBuffer { bytes: Vec::new() }
    }

    /// Current write position, always a multiple of 4.
    pub fn position(&self) -> usize {
        self.bytes.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Ensure at least `extra` bytes of spare capacity, growing by ~1.33x past whatever is
    /// currently needed when the existing allocation is exhausted.
    pub fn reserve(&mut self, extra: usize) {
        if self.bytes.capacity() - self.bytes.len() < extra {
            let needed = self.bytes.len() + extra;
            let grown = needed + needed / 3;
            self.bytes.reserve(grown - self.bytes.len());
        }
    }

    /// Append one instruction word. Callers emitting a whole opcode should `reserve`
    /// `MAX_OP_SIZE` once up front rather than per word.
    pub fn push_u32(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    pub fn push_u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Read back a previously emitted word (used by the relocation pass).
    pub fn read_u32(&self, pos: usize) -> u32 {
        u32::from_le_bytes(self.bytes[pos..pos + 4].try_into().unwrap())
    }

    /// OR `bits` into the word at `pos`. Every patch in this core is additive: the
    /// placeholder bits at emission time are always zero.
    pub fn patch_or(&mut self, pos: usize, bits: u32) {
        let word = self.read_u32(pos) | bits;
        self.bytes[pos..pos + 4].copy_from_slice(&word.to_le_bytes());
    }

    pub fn align_to_16(&mut self) {
        while self.bytes.len() % 16 != 0 {
            // NOP.
            self.push_u32(0xD503_201F);
        }
    }
}

/// A forward or backward branch whose target opcode's byte offset is patched in once the
/// whole function has been emitted.
#[derive(Clone, Copy, Debug)]
pub struct DeferredJump {
    pub kind: BranchKind,
    /// Byte offset of the branch instruction itself.
    pub emit_offset: usize,
    /// Opcode index the branch targets.
    pub target_op: usize,
}

/// Which field width/shift a deferred branch patches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchKind {
    /// Unconditional `B`/`BL`: 26-bit signed, scaled by 4, no shift in the word.
    Unconditional26,
    /// `B.cond`: 19-bit signed, scaled by 4, shifted left 5 bits in the word.
    Conditional19,
}

impl BranchKind {
    pub fn encode_offset(self, delta_ops_bytes: i64) -> u32 {
        let words = delta_ops_bytes / 4;
        match self {
            BranchKind::Unconditional26 => (words as u32) & 0x03FF_FFFF,
            BranchKind::Conditional19 => ((words as u32) & 0x0007_FFFF) << 5,
        }
    }
}

/// A call site whose target function has not yet been compiled (cross-function, in the same
/// module) or is present in a `previous` module during hot reload.
#[derive(Clone, Copy, Debug)]
pub struct DeferredCall {
    pub emit_offset: usize,
    pub target: FunctionIndex,
}

/// Per-opcode index -> byte offset within the function, built as the opcode stream is
/// walked, used to resolve forward jumps.
#[derive(Default)]
pub struct OpcodePositions {
    positions: Vec<usize>,
}

impl OpcodePositions {
    pub fn with_capacity(n: usize) -> OpcodePositions {
        OpcodePositions {
            positions: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, byte_offset: usize) {
        self.positions.push(byte_offset);
    }

    pub fn get(&self, op_index: usize) -> usize {
        self.positions[op_index]
    }

    /// One past the last opcode, i.e. the function's total code length — the logical
    /// target of a jump to "just past the end" (used when validating invariant 1's
    /// `opsPos[i] <= opsPos[i+1]`).
    pub fn end(&self) -> usize {
        *self.positions.last().unwrap_or(&0)
    }
}

/// Per-opcode index -> byte offset within the *function's own* native code, emitted for
/// downstream debug-info packaging. Widens from 16-bit to 32-bit entries once a
/// function's code exceeds `0xFF00` bytes, since a 16-bit entry can no longer address it.
#[derive(Debug)]
pub enum DebugOffsets {
    Narrow(Vec<u16>),
    Wide(Vec<u32>),
}

/// Threshold past which [`DebugOffsets`] must widen to 32-bit entries.
pub const DEBUG_OFFSETS_WIDEN_THRESHOLD: usize = 0xFF00;

impl DebugOffsets {
    pub fn new() -> DebugOffsets {
        DebugOffsets::Narrow(Vec::new())
    }

    pub fn push(&mut self, byte_offset: usize) {
        match self {
            DebugOffsets::Narrow(v) if byte_offset <= DEBUG_OFFSETS_WIDEN_THRESHOLD => {
                v.push(byte_offset as u16);
            }
            DebugOffsets::Narrow(v) => {
                let mut widened: Vec<u32> = v.iter().map(|&x| x as u32).collect();
                widened.push(byte_offset as u32);
                *self = DebugOffsets::Wide(widened);
            }
            DebugOffsets::Wide(v) => v.push(byte_offset as u32),
        }
    }
}

impl Default for DebugOffsets {
    fn default() -> Self {
        DebugOffsets::new()
    }
}

/// The module-head literal pool holding `f64` constants, addressed PC-relative via
/// `ADR`/`ADRP`+`LDR`. Deduplicates by
/// bit pattern so the same constant used from multiple call sites is stored once.
#[derive(Default)]
pub struct LiteralPool {
    values: Vec<f64>,
    index_by_bits: rustc_hash::FxHashMap<u64, usize>,
    /// Byte offset of the pool's first entry within the code buffer; set once by
    /// `JitContext::init` after the pool is fully populated and emitted.
    base_offset: Option<usize>,
}

impl LiteralPool {
    pub fn new() -> LiteralPool {
        LiteralPool::default()
    }

    /// Record use of `value`, returning its slot index (stable, 0-based) within the pool.
    pub fn intern(&mut self, value: f64) -> usize {
        let bits = value.to_bits();
        if let Some(&idx) = self.index_by_bits.get(&bits) {
            return idx;
        }
        let idx = self.values.len();
        self.values.push(value);
        self.index_by_bits.insert(bits, idx);
        idx
    }

    pub fn set_base_offset(&mut self, offset: usize) {
        self.base_offset = Some(offset);
    }

    /// Byte offset of slot `idx` within the code buffer. Panics if the pool has not yet
    /// been emitted (i.e. before `JitContext::init` completes).
    pub fn byte_offset(&self, idx: usize) -> usize {
        self.base_offset.expect("literal pool not yet emitted") + idx * 8
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}
