//! The public compilation session: the five-call lifecycle a host embeds against: allocate a
//! context, bind it to a module, compile functions one at a time, finalize into executable
//! memory, and either tear the context down or reset it for the next module. Modeled on a
//! `Compiler`/`CompiledFunction` pairing, collapsed here to a single struct since this core
//! emits one contiguous buffer per module rather than per-object sections needing a linker
//! step.

use rustc_hash::FxHashMap;

use crate::buffer::{CodeBuffer, DebugOffsets, DeferredCall, LiteralPool};
use crate::codegen;
use crate::error::JitError;
use crate::exec_mem::{self, ExecutableMemory};
use crate::module::{Function, FunctionIndex, Module, Op};
use crate::runtime::Runtime;
use crate::settings::Flags;

/// Debug-info table for one finalized module: each function's opcode-index -> native-offset
/// mapping, keyed by the offset of the function's own code within the finalized buffer.
pub struct DebugInfo {
    pub findex: FunctionIndex,
    pub start_offset: usize,
    pub offsets: DebugOffsets,
}

/// The result of a successful finalization pass.
pub struct FinalizedCode {
    pub memory: ExecutableMemory,
    pub debug_info: Vec<DebugInfo>,
}

struct CompiledRecord {
    findex: FunctionIndex,
    start_offset: usize,
    end_offset: usize,
    deferred_calls: Vec<DeferredCall>,
    debug_offsets: DebugOffsets,
}

/// One compilation session, bound to a module from `init` until the next `reset`.
pub struct JitContext {
    buf: CodeBuffer,
    pool: LiteralPool,
    flags: Flags,
    compiled: Vec<CompiledRecord>,
    /// Buffer offset of each function compiled so far in this session, used to resolve
    /// same-session cross-function calls without waiting on `module.function_addrs` (which
    /// only carries already-finalized absolute addresses, e.g. natives or a prior session's
    /// output during hot reload).
    offset_by_findex: FxHashMap<u32, usize>,
}

impl JitContext {
    /// `jit_alloc` — construct a fresh, unbound context.
    pub fn new(flags: Flags) -> JitContext {
        JitContext {
            buf: CodeBuffer::new(),
            pool: LiteralPool::new(),
            flags,
            compiled: Vec::new(),
            offset_by_findex: FxHashMap::default(),
        }
    }

    /// `jit_init` — bind to `module`: pre-scan every function body for float constants so the
    /// literal pool can be fully populated and emitted up front, then pad to a 16-byte
    /// boundary before the first function's prologue.
    pub fn init(&mut self, module: &Module) {
        for func in &module.functions {
            for op in &func.ops {
                if let Op::Float { value, .. } = op {
                    self.pool.intern(module.floats[value.0 as usize]);
                }
            }
        }
        self.buf.reserve(self.pool.values().len() * 8 + 16);
        let base = self.buf.position();
        self.pool.set_base_offset(base);
        for &v in self.pool.values() {
            self.buf.push_u64(v.to_bits());
        }
        self.buf.align_to_16();
    }

    /// `jit_function` — compile one function body, appending its code to the buffer, and
    /// return its byte offset within it.
    pub fn compile_function(&mut self, module: &Module, func: &Function, runtime: &dyn Runtime) -> usize {
        let compiled = codegen::compile_function(&mut self.buf, module, func, runtime, &mut self.pool, &self.flags);
        self.offset_by_findex.insert(func.index.0, compiled.start_offset);
        let start_offset = compiled.start_offset;
        self.compiled.push(CompiledRecord {
            findex: func.index,
            start_offset: compiled.start_offset,
            end_offset: compiled.end_offset,
            deferred_calls: compiled.deferred_calls,
            debug_offsets: compiled.debug_offsets,
        });
        start_offset
    }

    /// `jit_code` — finalize: copy the buffer into executable memory, resolve every
    /// cross-function call recorded during `compile_function`, invalidate the instruction
    /// cache, and hand back the executable pointer plus per-function debug tables.
    ///
    /// `previous` is the prior module's state during hot reload: a call to a function absent
    /// from `module` (but present as a native, or compiled in an earlier session) resolves
    /// its address from `previous` instead.
    pub fn finalize(
        &mut self,
        module: &Module,
        runtime: &dyn Runtime,
        previous: Option<&Module>,
    ) -> Result<FinalizedCode, JitError> {
        // Relocation happens against the still-growable buffer, before the executable mapping
        // exists, so a veneer can simply be appended like any other emitted code. The mapping
        // is sized with enough slack for one veneer per deferred call (the worst case), since
        // the buffer must not grow again once copied into the fixed-size mapping.
        let deferred_count: usize = self.compiled.iter().map(|r| r.deferred_calls.len()).sum();
        let reserved = exec_mem::reserve(self.buf.bytes().len() + deferred_count * 24)?;
        let base = reserved.base();

        for i in 0..self.compiled.len() {
            let calls = std::mem::take(&mut self.compiled[i].deferred_calls);
            for call in &calls {
                let target_addr = self.resolve_call_target(module, previous, call.target, base)?;
                self.patch_call(call.emit_offset, target_addr, base)?;
            }
        }

        let memory = exec_mem::commit(reserved, self.buf.bytes(), self.flags.enforce_write_xor_execute, |ptr, len| {
            runtime.invalidate_icache(ptr, len);
        })?;

        let debug_info = self
            .compiled
            .drain(..)
            .map(|r| DebugInfo {
                findex: r.findex,
                start_offset: r.start_offset,
                offsets: r.debug_offsets,
            })
            .collect();

        Ok(FinalizedCode { memory, debug_info })
    }

    /// Patch one deferred call's `BL` with the offset to `target_addr`, synthesizing a
    /// trampoline past the end of the buffer when the direct offset exceeds the `BL` range
    /// and `Flags::synthesize_veneers` is set.
    fn patch_call(&mut self, emit_offset: usize, target_addr: usize, base: usize) -> Result<(), JitError> {
        let call_site = base + emit_offset;
        let delta = target_addr as i64 - call_site as i64;
        if in_bl_range(delta) {
            let bits = crate::buffer::BranchKind::Unconditional26.encode_offset(delta);
            self.buf.patch_or(emit_offset, bits);
            return Ok(());
        }
        if !self.flags.synthesize_veneers {
            return Err(JitError::RelocationOutOfRange {
                call_site: emit_offset,
                target: target_addr,
            });
        }
        let veneer_offset = self.emit_veneer(target_addr);
        let veneer_delta = (base + veneer_offset) as i64 - call_site as i64;
        if !in_bl_range(veneer_delta) {
            return Err(JitError::RelocationOutOfRange {
                call_site: emit_offset,
                target: target_addr,
            });
        }
        let bits = crate::buffer::BranchKind::Unconditional26.encode_offset(veneer_delta);
        self.buf.patch_or(emit_offset, bits);
        Ok(())
    }

    /// `MOVZ+MOVK×4` loading `target_addr` into the intra-call scratch register, then `BR`.
    fn emit_veneer(&mut self, target_addr: usize) -> usize {
        self.buf.align_to_16();
        let offset = self.buf.position();
        self.buf.reserve(24);
        for w in crate::encoder::load_constant_cascade(crate::regs::tmp2_reg(), true, target_addr as u64) {
            self.buf.push_u32(w);
        }
        self.buf
            .push_u32(crate::encoder::branch_reg(crate::encoder::BranchRegOp::Br, crate::regs::tmp2_reg()));
        offset
    }

    fn resolve_call_target(
        &self,
        module: &Module,
        previous: Option<&Module>,
        target: FunctionIndex,
        base: usize,
    ) -> Result<usize, JitError> {
        if let Some(&offset) = self.offset_by_findex.get(&target.0) {
            return Ok(base + offset);
        }
        if let Some(addr) = module.function_addrs.get(target.0 as usize).copied().flatten() {
            return Ok(addr);
        }
        if let Some(prev) = previous {
            if let Some(addr) = prev.function_addrs.get(target.0 as usize).copied().flatten() {
                return Ok(addr);
            }
        }
        Err(JitError::MissingFindex { findex: target.0 as usize })
    }

    /// `jit_reset` — reinitialize for a new module without reallocating the context shell.
    pub fn reset(&mut self, module: &Module) {
        self.buf = CodeBuffer::new();
        self.pool = LiteralPool::new();
        self.compiled.clear();
        self.offset_by_findex.clear();
        self.init(module);
    }
}

/// `BL`'s 26-bit signed, ×4-scaled immediate covers ±128 MiB.
fn in_bl_range(delta_bytes: i64) -> bool {
    (-(1i64 << 27)..(1i64 << 27)).contains(&delta_bytes)
}
