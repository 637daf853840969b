//! The per-opcode code generator: walks one function's opcode stream, consults
//! the allocator to place operands, and emits instruction sequences via the encoder.
//! In-function jumps are patched as soon as the function's own code is fully emitted;
//! cross-function calls are recorded here and left for the finalization pass.

use log::trace;

use crate::abi::{self, ArgLocation, FrameLayout};
use crate::buffer::{
    BranchKind, CodeBuffer, DebugOffsets, DeferredCall, DeferredJump, LiteralPool, OpcodePositions, MAX_OP_SIZE,
};
use crate::encoder::args::{Cond, ShiftOp};
use crate::encoder::imms::{Imm12, SImm9, UImm12Scaled};
use crate::encoder::{self, AccessSize, ArithImmOp, BranchRegOp, LogicalOp, MulAccOp, TwoRegOp};
use crate::module::{Function, FunctionIndex, Module, Op, TypeKind, VRegIndex};
use crate::regalloc::RegAlloc;
use crate::regs::{self, fp_reg, spilltmp_reg, tmp2_reg, xreg, zero_or_sp_reg, PReg, RegClass};
use crate::runtime::{DynKind, Runtime};
use crate::settings::Flags;

/// Everything the finalization pass needs about one compiled function.
pub struct CompiledFunction {
    pub start_offset: usize,
    pub end_offset: usize,
    pub deferred_calls: Vec<DeferredCall>,
    pub debug_offsets: DebugOffsets,
    pub positions: OpcodePositions,
}

struct Codegen<'a> {
    buf: &'a mut CodeBuffer,
    module: &'a Module,
    func: &'a Function,
    runtime: &'a dyn Runtime,
    pool: &'a mut LiteralPool,
    flags: &'a Flags,
    ra: RegAlloc,
    start_offset: usize,
    positions: OpcodePositions,
    debug_offsets: DebugOffsets,
    deferred_jumps: Vec<DeferredJump>,
    deferred_calls: Vec<DeferredCall>,
}

/// Compile one function's body, appending its code to `buf`. Mirrors `jit_function` from
/// pub fn compile_function(
    buf: &mut CodeBuffer,
    module: &Module,
    func: &Function,
    runtime: &dyn Runtime,
    pool: &mut LiteralPool,
    flags: &Flags,
) -> CompiledFunction {
    let layout = abi::layout_function(module, func);
    let ra = RegAlloc::new(layout.slots.clone(), flags.debug_assert_allocator_invariants);
    let start_offset = buf.position();
    let mut cg = Codegen {
        buf,
        module,
        func,
        runtime,
        pool,
        flags,
        ra,
        start_offset,
        positions: OpcodePositions::with_capacity(func.ops.len()),
        debug_offsets: DebugOffsets::new(),
        deferred_jumps: Vec::new(),
        deferred_calls: Vec::new(),
    };

    trace!("compiling function {} ({} ops)", func.index.0, func.ops.len());
    cg.emit_prologue(&layout);
    for (i, op) in func.ops.iter().enumerate() {
        cg.ra.set_opcode_index(i);
        let pos = cg.buf.position();
        cg.positions.push(pos);
        cg.debug_offsets.push(pos - cg.start_offset);
        cg.buf.reserve(MAX_OP_SIZE);
        cg.emit_op(&layout, i, op);
        debug_assert!(
            cg.buf.position() - pos < MAX_OP_SIZE,
            "opcode {i} emitted more than MAX_OP_SIZE bytes"
        );
    }
    let end_of_ops = cg.buf.position();
    cg.patch_in_function_jumps(end_of_ops);
    let end_offset = cg.buf.position();

    CompiledFunction {
        start_offset,
        end_offset,
        deferred_calls: cg.deferred_calls,
        debug_offsets: cg.debug_offsets,
        positions: cg.positions,
    }
}

impl<'a> Codegen<'a> {
    fn ty_kind(&self, v: VRegIndex) -> TypeKind {
        self.module.ty(self.func.vregs[v.0 as usize].ty).kind
    }

    fn size64(&self, v: VRegIndex) -> bool {
        self.ty_kind(v).is_64()
    }

    fn is_float(&self, v: VRegIndex) -> bool {
        self.ty_kind(v).is_float()
    }

    fn class_of(&self, v: VRegIndex) -> RegClass {
        if self.is_float(v) {
            RegClass::Fpu
        } else {
            RegClass::Cpu
        }
    }

    fn access_size(&self, v: VRegIndex) -> AccessSize {
        AccessSize::for_byte_width(self.ty_kind(v).size().max(1).min(8))
    }

    fn fetch(&mut self, v: VRegIndex, load: bool) -> PReg {
        self.ra.fetch(self.buf, v, load)
    }

    fn alloc(&mut self, class: RegClass) -> PReg {
        self.ra.alloc(self.buf, class)
    }

    fn bind(&mut self, v: VRegIndex, p: PReg) {
        self.ra.bind(v, p);
    }

    fn this_vreg(&self) -> VRegIndex {
        VRegIndex(0)
    }

    // -- Prologue / epilogue -----------------------------------------------------------------

    fn emit_prologue(&mut self, layout: &FrameLayout) {
        abi::emit_prologue(self.buf, layout.frame_size);
        for (i, loc) in layout.arg_locations.iter().enumerate() {
            let v = abi::arg_vreg(i);
            match *loc {
                ArgLocation::Reg(p) => self.bind(v, p),
                ArgLocation::IncomingStack { frame_offset } => {
                    let is_vector = self.class_of(v) == RegClass::Fpu;
                    let size = self.access_size(v);
                    let scratch = if is_vector { regs::vreg_phys(0) } else { spilltmp_reg() };
                    self.buf.reserve(8);
                    let src_imm = UImm12Scaled::maybe_from_i64(frame_offset as i64, size.byte_size())
                        .expect("incoming stack argument offset out of range");
                    self.buf
                        .push_u32(encoder::ldst_unsigned_imm(true, size, is_vector, scratch, fp_reg(), src_imm));
                    let dst_offset = self.ra.frame_offset(v);
                    let dst_imm = UImm12Scaled::maybe_from_i64(dst_offset as i64, size.byte_size())
                        .expect("argument slot offset out of range");
                    self.buf
                        .push_u32(encoder::ldst_unsigned_imm(false, size, is_vector, scratch, fp_reg(), dst_imm));
                }
            }
        }
    }

    fn emit_epilogue(&mut self, layout: &FrameLayout) {
        abi::emit_epilogue(self.buf, layout.frame_size);
    }

    // -- Deferred jumps -----------------------------------------------------------------------

    fn target_op(&self, i: usize, offset: i32) -> usize {
        ((i as i32) + 1 + offset).max(0) as usize
    }

    fn record_jump(&mut self, kind: BranchKind, word: u32, target: usize) {
        let emit_offset = self.buf.position();
        self.buf.push_u32(word);
        self.deferred_jumps.push(DeferredJump {
            kind,
            emit_offset,
            target_op: target,
        });
    }

    fn jump_always(&mut self, i: usize, offset: i32) {
        let target = self.target_op(i, offset);
        let word = encoder::branch_imm(false, 0);
        self.record_jump(BranchKind::Unconditional26, word, target);
    }

    fn jump_cond(&mut self, i: usize, offset: i32, cond: Cond) {
        let target = self.target_op(i, offset);
        let word = encoder::cond_branch(cond, 0);
        self.record_jump(BranchKind::Conditional19, word, target);
    }

    fn patch_in_function_jumps(&mut self, end_of_ops: usize) {
        for j in &self.deferred_jumps {
            let target_byte = if j.target_op < self.func.ops.len() {
                self.positions.get(j.target_op)
            } else {
                end_of_ops
            };
            let delta = target_byte as i64 - j.emit_offset as i64;
            let bits = j.kind.encode_offset(delta);
            self.buf.patch_or(j.emit_offset, bits);
        }
    }

    // -- Comparisons --------------------------------------------------------------------------

    fn emit_cmp(&mut self, a: VRegIndex, b: VRegIndex) {
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let size64 = self.size64(a);
        self.buf.reserve(4);
        self.buf
            .push_u32(encoder::arith_shifted(ArithImmOp::Subs, size64, zero_or_sp_reg(), pa, pb, ShiftOp::Lsl(0)));
    }

    fn emit_cmp_zero(&mut self, a: VRegIndex) {
        let pa = self.fetch(a, true);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::arith_shifted(
            ArithImmOp::Subs,
            true,
            zero_or_sp_reg(),
            pa,
            zero_or_sp_reg(),
            ShiftOp::Lsl(0),
        ));
    }

    // -- Stack-pointer bookkeeping --------------------------------------------------------------

    fn adjust_sp(&mut self, op: ArithImmOp, bytes: i32) {
        abi::emit_sp_adjust(self.buf, op, bytes);
    }

    // -- Constant materialization ---------------------------------------------------------------

    fn materialize_u64(&mut self, rd: PReg, size64: bool, value: u64) {
        self.buf.reserve(16);
        for w in encoder::load_constant_cascade(rd, size64, value) {
            self.buf.push_u32(w);
        }
    }

    fn materialize_addr(&mut self, rd: PReg, addr: usize) {
        self.materialize_u64(rd, true, addr as u64);
    }

    fn resolve_function_addr(&self, findex: FunctionIndex) -> usize {
        self.module.function_addrs[findex.0 as usize].unwrap_or_else(|| {
            panic!(
                "function {} referenced as a data value before it was compiled; only forward \
                 branches are deferred, forward closure/value references are not",
                findex.0
            )
        })
    }

    // -- Calls ----------------------------------------------------------------------------------

    fn pass_args(&mut self, args: &[VRegIndex]) -> i32 {
        let mut cpu_n = 0u8;
        let mut fpu_n = 0u8;
        let mut stack_args = Vec::new();
        for &a in args {
            if self.class_of(a) == RegClass::Fpu {
                if fpu_n < abi::ARG_REGS_PER_CLASS as u8 {
                    let p = regs::vreg_phys(fpu_n);
                    self.ra.load(self.buf, a, p);
                    fpu_n += 1;
                } else {
                    stack_args.push(a);
                }
            } else if cpu_n < abi::ARG_REGS_PER_CLASS as u8 {
                let p = xreg(cpu_n);
                self.ra.load(self.buf, a, p);
                cpu_n += 1;
            } else {
                stack_args.push(a);
            }
        }
        if stack_args.is_empty() {
            return 0;
        }
        let bytes = stack_args.len() as i32 * 8;
        let aligned = (bytes + 15) / 16 * 16;
        self.adjust_sp(ArithImmOp::Sub, aligned);
        for (i, &a) in stack_args.iter().enumerate() {
            let p = self.fetch(a, true);
            self.buf.reserve(4);
            let imm = UImm12Scaled::maybe_from_i64((i as i64) * 8, 8).unwrap();
            let is_vector = self.class_of(a) == RegClass::Fpu;
            self.buf
                .push_u32(encoder::ldst_unsigned_imm(false, AccessSize::Dword, is_vector, p, zero_or_sp_reg(), imm));
        }
        aligned
    }

    fn bind_call_result(&mut self, dst: VRegIndex) {
        let ret_kind = self.ty_kind(dst);
        if matches!(ret_kind, TypeKind::Void) {
            return;
        }
        let p = if ret_kind.is_float() { regs::vreg_phys(0) } else { xreg(0) };
        self.bind(dst, p);
    }

    fn emit_call_native(&mut self, addr: usize) {
        self.materialize_addr(tmp2_reg(), addr);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::branch_reg(BranchRegOp::Blr, tmp2_reg()));
    }

    fn emit_call_compiled(&mut self, target: FunctionIndex) {
        if target.0 == self.func.index.0 {
            let emit_offset = self.buf.position();
            self.buf.push_u32(encoder::branch_imm(true, 0));
            let delta = self.start_offset as i64 - emit_offset as i64;
            let bits = BranchKind::Unconditional26.encode_offset(delta);
            self.buf.patch_or(emit_offset, bits);
            return;
        }
        let emit_offset = self.buf.position();
        self.buf.push_u32(encoder::branch_imm(true, 0));
        self.deferred_calls.push(DeferredCall { emit_offset, target });
    }

    fn emit_call(&mut self, dst: Option<VRegIndex>, findex: FunctionIndex, args: &[VRegIndex]) {
        self.ra.start_call(self.buf);
        let stack_bytes = self.pass_args(args);
        self.buf.reserve(32);
        if self.module.is_native(findex) {
            let addr = self.resolve_function_addr(findex);
            self.emit_call_native(addr);
        } else {
            self.emit_call_compiled(findex);
        }
        self.ra.end_call(self.buf, stack_bytes);
        if let Some(dst) = dst {
            self.bind_call_result(dst);
        }
    }

    fn emit_call_reg(&mut self, dst: Option<VRegIndex>, target: PReg, args: &[VRegIndex]) {
        self.ra.start_call(self.buf);
        // Move the target out of the way of argument-register loads before staging args:
        // `target` may itself be one of the registers `pass_args` is about to overwrite.
        self.buf.reserve(4);
        self.buf
            .push_u32(encoder::logical_shifted(LogicalOp::Orr, true, tmp2_reg(), zero_or_sp_reg(), target, ShiftOp::Lsl(0)));
        let stack_bytes = self.pass_args(args);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::branch_reg(BranchRegOp::Blr, tmp2_reg()));
        self.ra.end_call(self.buf, stack_bytes);
        if let Some(dst) = dst {
            self.bind_call_result(dst);
        }
    }

    /// Call a runtime helper with arguments staged directly into the integer argument
    /// registers by `load_args` (used for helpers whose arguments are addresses/constants
    /// rather than vregs, e.g. `hl_alloc_obj(type)`). Returns `x0`, unbound.
    fn call_runtime_raw(&mut self, addr: usize, load_args: impl FnOnce(&mut Self)) -> PReg {
        self.ra.start_call(self.buf);
        load_args(self);
        self.buf.reserve(32);
        self.emit_call_native(addr);
        self.ra.end_call(self.buf, 0);
        xreg(0)
    }

    // -- Field / object access ------------------------------------------------------------------

    fn ldst_field(&mut self, is_load: bool, reg: PReg, base: PReg, is_vector: bool, size: AccessSize, offset: i32) {
        self.buf.reserve(4);
        if let Some(imm) = UImm12Scaled::maybe_from_i64(offset as i64, size.byte_size()) {
            self.buf.push_u32(encoder::ldst_unsigned_imm(is_load, size, is_vector, reg, base, imm));
        } else {
            let imm = SImm9::maybe_from_i64(offset as i64).expect("field offset out of addressing range");
            self.buf.push_u32(encoder::ldst_unscaled_imm(is_load, size, is_vector, reg, base, imm));
        }
    }

    fn emit_field_load(&mut self, dst: VRegIndex, obj: VRegIndex, offset: u32) {
        let pobj = self.fetch(obj, true);
        let pdst = self.alloc(self.class_of(dst));
        let size = self.access_size(dst);
        self.ldst_field(true, pdst, pobj, self.class_of(dst) == RegClass::Fpu, size, offset as i32);
        self.bind(dst, pdst);
    }

    fn emit_field_store(&mut self, obj: VRegIndex, offset: u32, src: VRegIndex) {
        let pobj = self.fetch(obj, true);
        let psrc = self.fetch(src, true);
        let size = self.access_size(src);
        self.ldst_field(false, psrc, pobj, self.class_of(src) == RegClass::Fpu, size, offset as i32);
    }

    fn emit_field(&mut self, dst: VRegIndex, obj: VRegIndex, field: u32) {
        let ty = self.module.ty(self.func.vregs[obj.0 as usize].ty);
        if matches!(ty.kind, TypeKind::Virtual) {
            let slot_off = self.runtime.virtual_field_slot_offset(ty, field);
            self.emit_field_load(dst, obj, slot_off);
        } else {
            let off = self.runtime.obj_field_offset(ty, field);
            self.emit_field_load(dst, obj, off);
        }
    }

    fn emit_set_field(&mut self, obj: VRegIndex, field: u32, src: VRegIndex) {
        let ty = self.module.ty(self.func.vregs[obj.0 as usize].ty);
        if matches!(ty.kind, TypeKind::Virtual) {
            let slot_off = self.runtime.virtual_field_slot_offset(ty, field);
            self.emit_field_store(obj, slot_off, src);
        } else {
            let off = self.runtime.obj_field_offset(ty, field);
            self.emit_field_store(obj, off, src);
        }
    }

    fn emit_dyn_get(&mut self, dst: VRegIndex, obj: VRegIndex, hashed_name: u32) {
        let kind = DynKind::for_type(self.ty_kind(dst));
        let addr = self.runtime.dyn_get_addr(kind);
        let obj_p = self.fetch(obj, true);
        let p = self.call_runtime_raw(addr, |cg| {
            cg.buf.reserve(4);
            cg.buf.push_u32(encoder::logical_shifted(
                LogicalOp::Orr,
                true,
                xreg(0),
                zero_or_sp_reg(),
                obj_p,
                ShiftOp::Lsl(0),
            ));
            cg.materialize_u64(xreg(1), false, hashed_name as u64);
        });
        let dst_p = if self.is_float(dst) { regs::vreg_phys(0) } else { p };
        self.bind(dst, dst_p);
    }

    fn emit_dyn_set(&mut self, obj: VRegIndex, hashed_name: u32, src: VRegIndex) {
        let kind = DynKind::for_type(self.ty_kind(src));
        let addr = self.runtime.dyn_set_addr(kind);
        let obj_p = self.fetch(obj, true);
        let src_p = self.fetch(src, true);
        self.call_runtime_raw(addr, |cg| {
            cg.buf.reserve(8);
            cg.buf.push_u32(encoder::logical_shifted(
                LogicalOp::Orr,
                true,
                xreg(0),
                zero_or_sp_reg(),
                obj_p,
                ShiftOp::Lsl(0),
            ));
            cg.materialize_u64(xreg(1), false, hashed_name as u64);
            if cg.class_of(src) == RegClass::Fpu {
                cg.buf.push_u32(encoder::fmov_reg(true, regs::vreg_phys(0), src_p));
            } else {
                cg.buf.push_u32(encoder::logical_shifted(
                    LogicalOp::Orr,
                    true,
                    xreg(2),
                    zero_or_sp_reg(),
                    src_p,
                    ShiftOp::Lsl(0),
                ));
            }
        });
    }

    // -- Allocation -------------------------------------------------------------------------------

    fn emit_new(&mut self, dst: VRegIndex) {
        let ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let addr = match ty.kind {
            TypeKind::DynObj => self.runtime.alloc_dynobj_addr(),
            TypeKind::Virtual => self.runtime.alloc_virtual_addr(),
            _ => self.runtime.alloc_obj_addr(),
        };
        let type_addr = ty.addr;
        let p = self.call_runtime_raw(addr, |cg| cg.materialize_addr(xreg(0), type_addr));
        self.bind(dst, p);
    }

    fn emit_enum_alloc(&mut self, dst: VRegIndex, construct: u32) {
        let ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let addr = self.runtime.alloc_enum_addr();
        let type_addr = ty.addr;
        let p = self.call_runtime_raw(addr, |cg| {
            cg.materialize_addr(xreg(0), type_addr);
            cg.materialize_u64(xreg(1), false, construct as u64);
        });
        self.bind(dst, p);
    }

    fn emit_array_size(&mut self, dst: VRegIndex, array: VRegIndex) {
        let pobj = self.fetch(array, true);
        let pdst = self.alloc(RegClass::Cpu);
        let off = self.runtime.array_size_offset();
        self.ldst_field(true, pdst, pobj, false, AccessSize::Dword, off as i32);
        self.bind(dst, pdst);
    }

    fn emit_array_get(&mut self, dst: VRegIndex, array: VRegIndex, index: VRegIndex) {
        let elem_ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let elem_size = self.runtime.array_elem_size(elem_ty);
        let header = self.runtime.array_header_size();
        let pobj = self.fetch(array, true);
        let pidx = self.fetch(index, true);
        let paddr = self.alloc(RegClass::Cpu);
        self.buf.reserve(16);
        // paddr = pobj + header (base of payload)
        if let Some(imm) = Imm12::maybe_from_u64(header as u64) {
            self.buf.push_u32(encoder::arith_imm(ArithImmOp::Add, true, paddr, pobj, imm));
        } else {
            self.materialize_u64(paddr, true, header as u64);
            self.buf
                .push_u32(encoder::arith_shifted(ArithImmOp::Add, true, paddr, pobj, paddr, ShiftOp::Lsl(0)));
        }
        let pdst = self.alloc(self.class_of(dst));
        let log2 = elem_size.trailing_zeros();
        let use_shift = elem_size.is_power_of_two() && (1u32 << log2) == elem_size;
        if use_shift {
            self.buf.push_u32(encoder::ldst_reg_offset(
                true,
                AccessSize::for_byte_width(elem_size),
                self.class_of(dst) == RegClass::Fpu,
                pdst,
                paddr,
                pidx,
                crate::encoder::args::ExtendOp::Lsl,
            ));
        } else {
            let pscaled = self.alloc(RegClass::Cpu);
            self.materialize_u64(pscaled, true, elem_size as u64);
            self.buf
                .push_u32(encoder::mul_acc(MulAccOp::Madd, true, paddr, pidx, pscaled, paddr));
            self.ldst_field(true, pdst, paddr, self.class_of(dst) == RegClass::Fpu, AccessSize::for_byte_width(elem_size), 0);
        }
        self.bind(dst, pdst);
    }

    fn emit_array_set(&mut self, array: VRegIndex, index: VRegIndex, src: VRegIndex) {
        let elem_ty = self.module.ty(self.func.vregs[src.0 as usize].ty);
        let elem_size = self.runtime.array_elem_size(elem_ty);
        let header = self.runtime.array_header_size();
        let pobj = self.fetch(array, true);
        let pidx = self.fetch(index, true);
        let psrc = self.fetch(src, true);
        let paddr = self.alloc(RegClass::Cpu);
        self.buf.reserve(16);
        if let Some(imm) = Imm12::maybe_from_u64(header as u64) {
            self.buf.push_u32(encoder::arith_imm(ArithImmOp::Add, true, paddr, pobj, imm));
        } else {
            self.materialize_u64(paddr, true, header as u64);
            self.buf
                .push_u32(encoder::arith_shifted(ArithImmOp::Add, true, paddr, pobj, paddr, ShiftOp::Lsl(0)));
        }
        let pscaled = self.alloc(RegClass::Cpu);
        self.materialize_u64(pscaled, true, elem_size as u64);
        self.buf
            .push_u32(encoder::mul_acc(MulAccOp::Madd, true, paddr, pidx, pscaled, paddr));
        self.ldst_field(false, psrc, paddr, self.class_of(src) == RegClass::Fpu, AccessSize::for_byte_width(elem_size), 0);
    }

    // -- Raw memory --------------------------------------------------------------------------------

    fn emit_raw_load(&mut self, dst: VRegIndex, base: VRegIndex, offset: VRegIndex, size: AccessSize) {
        let pbase = self.fetch(base, true);
        let poff = self.fetch(offset, true);
        let pdst = self.alloc(RegClass::Cpu);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::ldst_reg_offset(
            true,
            size,
            false,
            pdst,
            pbase,
            poff,
            crate::encoder::args::ExtendOp::Sxtx,
        ));
        self.bind(dst, pdst);
    }

    fn emit_raw_store(&mut self, base: VRegIndex, offset: VRegIndex, src: VRegIndex, size: AccessSize) {
        let pbase = self.fetch(base, true);
        let poff = self.fetch(offset, true);
        let psrc = self.fetch(src, true);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::ldst_reg_offset(
            false,
            size,
            false,
            psrc,
            pbase,
            poff,
            crate::encoder::args::ExtendOp::Sxtx,
        ));
    }

    // -- References --------------------------------------------------------------------------------

    fn emit_ref(&mut self, dst: VRegIndex, src: VRegIndex) {
        if let Some(p) = self.ra.binding(src) {
            self.ra.scratch(self.buf, p, false);
        }
        let frame_offset = self.ra.frame_offset(src);
        let pdst = self.alloc(RegClass::Cpu);
        self.buf.reserve(4);
        let imm = Imm12::maybe_from_u64(frame_offset as u64).expect("stack slot offset out of ADD-immediate range");
        self.buf.push_u32(encoder::arith_imm(ArithImmOp::Add, true, pdst, fp_reg(), imm));
        self.bind(dst, pdst);
    }

    fn emit_unref(&mut self, dst: VRegIndex, src: VRegIndex) {
        let pref = self.fetch(src, true);
        let pdst = self.alloc(self.class_of(dst));
        let size = self.access_size(dst);
        self.ldst_field(true, pdst, pref, self.class_of(dst) == RegClass::Fpu, size, 0);
        self.bind(dst, pdst);
    }

    fn emit_setref(&mut self, dst: VRegIndex, src: VRegIndex) {
        let pref = self.fetch(dst, true);
        let psrc = self.fetch(src, true);
        let size = self.access_size(src);
        self.ldst_field(false, psrc, pref, self.class_of(src) == RegClass::Fpu, size, 0);
    }

    // -- Casts -------------------------------------------------------------------------------------

    fn emit_to_dyn(&mut self, dst: VRegIndex, src: VRegIndex) {
        let src_kind = self.ty_kind(src);
        if src_kind.is_gc_ptr() || matches!(src_kind, TypeKind::BytePtr | TypeKind::Ref) {
            // Pointer values pass through unboxed.
            let p = self.fetch(src, true);
            self.bind(dst, p);
            return;
        }
        let dst_ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let addr = self.runtime.alloc_dynamic_addr();
        let type_addr = dst_ty.addr;
        let src_p = self.fetch(src, true);
        let boxed = self.call_runtime_raw(addr, |cg| cg.materialize_addr(xreg(0), type_addr));
        let payload_off = self.runtime.dynamic_payload_offset();
        self.buf.reserve(4);
        let size = self.access_size(src);
        self.ldst_field(false, src_p, boxed, self.class_of(src) == RegClass::Fpu, size, payload_off as i32);
        self.bind(dst, boxed);
    }

    fn emit_to_sfloat(&mut self, dst: VRegIndex, src: VRegIndex) {
        let psrc = self.fetch(src, true);
        let pdst = self.alloc(RegClass::Fpu);
        let dst_double = self.size64(dst);
        let src64 = self.size64(src);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::int_to_float(true, src64, dst_double, pdst, psrc));
        self.bind(dst, pdst);
    }

    fn emit_to_ufloat(&mut self, dst: VRegIndex, src: VRegIndex) {
        let psrc = self.fetch(src, true);
        let pdst = self.alloc(RegClass::Fpu);
        let dst_double = self.size64(dst);
        let src64 = self.size64(src);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::int_to_float(false, src64, dst_double, pdst, psrc));
        self.bind(dst, pdst);
    }

    fn emit_to_int(&mut self, dst: VRegIndex, src: VRegIndex) {
        let psrc = self.fetch(src, true);
        let pdst = self.alloc(RegClass::Cpu);
        let dst64 = self.size64(dst);
        let src_double = self.size64(src);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::float_to_int(true, dst64, src_double, pdst, psrc));
        self.bind(dst, pdst);
    }

    fn emit_safe_cast(&mut self, dst: VRegIndex, src: VRegIndex) {
        let src_ty = self.module.ty(self.func.vregs[src.0 as usize].ty);
        let dst_ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let kind = DynKind::for_type(dst_ty.kind);
        let addr = self.runtime.dyn_cast_addr(kind);
        if let Some(p) = self.ra.binding(src) {
            self.ra.scratch(self.buf, p, false);
        }
        let src_frame = self.ra.frame_offset(src);
        let src_ty_addr = src_ty.addr;
        let dst_ty_addr = dst_ty.addr;
        let p = self.call_runtime_raw(addr, |cg| {
            cg.buf.reserve(4);
            let imm = Imm12::maybe_from_u64(src_frame as u64).expect("stack slot offset out of range");
            cg.buf.push_u32(encoder::arith_imm(ArithImmOp::Add, true, xreg(0), fp_reg(), imm));
            cg.materialize_addr(xreg(1), src_ty_addr);
            cg.materialize_addr(xreg(2), dst_ty_addr);
        });
        self.bind(dst, p);
    }

    fn emit_to_virtual(&mut self, dst: VRegIndex, src: VRegIndex) {
        let dst_ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let addr = self.runtime.to_virtual_addr();
        let src_p = self.fetch(src, true);
        let type_addr = dst_ty.addr;
        let p = self.call_runtime_raw(addr, |cg| {
            cg.materialize_addr(xreg(0), type_addr);
            cg.buf.reserve(4);
            cg.buf.push_u32(encoder::logical_shifted(
                LogicalOp::Orr,
                true,
                xreg(1),
                zero_or_sp_reg(),
                src_p,
                ShiftOp::Lsl(0),
            ));
        });
        self.bind(dst, p);
    }

    // -- Enums ---------------------------------------------------------------------------------------

    fn emit_make_enum(&mut self, dst: VRegIndex, construct: u32, args: &[VRegIndex]) {
        self.emit_enum_alloc(dst, construct);
        let p = self.ra.binding(dst).expect("enum allocation must bind dst");
        self.ra.scratch(self.buf, p, false);
        let ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        for (i, &a) in args.iter().enumerate() {
            let off = self.runtime.enum_field_offset(ty, construct, i as u32);
            self.emit_field_store(dst, off, a);
        }
    }

    fn emit_enum_index(&mut self, dst: VRegIndex, src: VRegIndex) {
        let off = self.runtime.enum_index_offset();
        self.emit_field_load(dst, src, off);
    }

    fn emit_enum_field(&mut self, dst: VRegIndex, src: VRegIndex, construct: u32, field: u32) {
        let ty = self.module.ty(self.func.vregs[src.0 as usize].ty);
        let off = self.runtime.enum_field_offset(ty, construct, field);
        self.emit_field_load(dst, src, off);
    }

    fn emit_set_enum_field(&mut self, dst: VRegIndex, construct: u32, field: u32, src: VRegIndex) {
        let ty = self.module.ty(self.func.vregs[dst.0 as usize].ty);
        let off = self.runtime.enum_field_offset(ty, construct, field);
        self.emit_field_store(dst, off, src);
    }

    // -- Type introspection ---------------------------------------------------------------------------

    fn emit_type_const(&mut self, dst: VRegIndex, ty_addr: usize) {
        let p = self.alloc(RegClass::Cpu);
        self.materialize_addr(p, ty_addr);
        self.bind(dst, p);
    }

    fn emit_get_type(&mut self, dst: VRegIndex, src: VRegIndex) {
        let ty = self.module.ty(self.func.vregs[src.0 as usize].ty);
        self.emit_type_const(dst, ty.addr);
    }

    fn emit_get_tid(&mut self, dst: VRegIndex, src: VRegIndex) {
        let off = self.runtime.type_kind_offset();
        let psrc = self.fetch(src, true);
        let pdst = self.alloc(RegClass::Cpu);
        self.ldst_field(true, pdst, psrc, false, AccessSize::Word, off as i32);
        self.bind(dst, pdst);
    }

    // -- Dispatch ------------------------------------------------------------------------------------

    fn emit_op(&mut self, layout: &FrameLayout, i: usize, op: &Op) {
        match op {
            // Constants
            Op::Mov { dst, src } => self.ra.mov(self.buf, *src, *dst),
            Op::Int { dst, value } => {
                let raw = self.module.ints[value.0 as usize];
                let size64 = self.size64(*dst);
                let bits = if size64 { raw as i64 as u64 } else { raw as u32 as u64 };
                let p = self.alloc(RegClass::Cpu);
                self.materialize_u64(p, size64, bits);
                self.bind(*dst, p);
            }
            Op::Float { dst, value } => {
                // The literal pool is fully populated and emitted at a fixed buffer offset by
                // `JitContext::init` before any function body is compiled, so `byte_offset`
                // is already resolvable; `intern` here is idempotent and only serves as a
                // lookup. Buffer offsets survive the later copy into executable memory as a
                // block translation, so a PC-relative `ADR` computed from two buffer offsets
                // stays correct post-relocation without needing the final absolute address.
                let v = self.module.floats[value.0 as usize];
                let idx = self.pool.intern(v);
                let pool_pos = self.pool.byte_offset(idx);
                let p = self.alloc(RegClass::Fpu);
                let base = self.alloc(RegClass::Cpu);
                self.buf.reserve(8);
                let adr_pos = self.buf.position();
                let delta = pool_pos as i64 - adr_pos as i64;
                self.buf.push_u32(encoder::adr(base, delta as i32));
                self.ldst_field(true, p, base, true, AccessSize::Dword, 0);
                self.bind(*dst, p);
            }
            Op::Bool { dst, value } => {
                let p = self.alloc(RegClass::Cpu);
                self.materialize_u64(p, false, *value as u64);
                self.bind(*dst, p);
            }
            Op::Bytes { dst, value } | Op::String { dst, value } => {
                let addr = self.module.strings.get(value.0 as usize).map(|s| s.as_ptr() as usize).unwrap_or(0);
                let p = self.alloc(RegClass::Cpu);
                self.materialize_addr(p, addr);
                self.bind(*dst, p);
            }
            Op::Null { dst } => {
                let p = self.alloc(RegClass::Cpu);
                self.buf.reserve(4);
                self.buf.push_u32(encoder::logical_shifted(
                    LogicalOp::Orr,
                    true,
                    p,
                    zero_or_sp_reg(),
                    zero_or_sp_reg(),
                    ShiftOp::Lsl(0),
                ));
                self.bind(*dst, p);
            }

            // Arithmetic and logic
            Op::Add { dst, a, b } => self.emit_binop_arith(*dst, *a, *b, ArithImmOp::Add, crate::encoder::FpBinOp::Fadd),
            Op::Sub { dst, a, b } => self.emit_binop_arith(*dst, *a, *b, ArithImmOp::Sub, crate::encoder::FpBinOp::Fsub),
            Op::Mul { dst, a, b } => self.emit_mul(*dst, *a, *b),
            Op::SDiv { dst, a, b } => self.emit_div(*dst, *a, *b, TwoRegOp::Sdiv),
            Op::UDiv { dst, a, b } => self.emit_div(*dst, *a, *b, TwoRegOp::Udiv),
            Op::SMod { dst, a, b } => self.emit_mod(*dst, *a, *b, TwoRegOp::Sdiv),
            Op::UMod { dst, a, b } => self.emit_mod(*dst, *a, *b, TwoRegOp::Udiv),
            Op::Shl { dst, a, b } => self.emit_shift(*dst, *a, *b, TwoRegOp::Lslv),
            Op::SShr { dst, a, b } => self.emit_shift(*dst, *a, *b, TwoRegOp::Asrv),
            Op::UShr { dst, a, b } => self.emit_shift(*dst, *a, *b, TwoRegOp::Lsrv),
            Op::And { dst, a, b } => self.emit_logical(*dst, *a, *b, LogicalOp::And),
            Op::Or { dst, a, b } => self.emit_logical(*dst, *a, *b, LogicalOp::Orr),
            Op::Xor { dst, a, b } => self.emit_logical(*dst, *a, *b, LogicalOp::Eor),
            Op::Neg { dst, src } => self.emit_neg(*dst, *src),
            Op::Not { dst, src } => {
                let psrc = self.fetch(*src, true);
                let pdst = self.alloc(RegClass::Cpu);
                let size64 = self.size64(*dst);
                self.buf.reserve(4);
                self.buf
                    .push_u32(encoder::logical_shifted(LogicalOp::Orn, size64, pdst, zero_or_sp_reg(), psrc, ShiftOp::Lsl(0)));
                self.bind(*dst, pdst);
            }
            Op::Incr { dst } => self.emit_incr_decr(*dst, ArithImmOp::Add),
            Op::Decr { dst } => self.emit_incr_decr(*dst, ArithImmOp::Sub),

            // Calls
            Op::Call0 { dst, findex } => self.emit_call(Some(*dst), *findex, &[]),
            Op::Call1 { dst, findex, arg0 } => self.emit_call(Some(*dst), *findex, &[*arg0]),
            Op::Call2 { dst, findex, args } => self.emit_call(Some(*dst), *findex, args),
            Op::Call3 { dst, findex, args } => self.emit_call(Some(*dst), *findex, args),
            Op::Call4 { dst, findex, args } => self.emit_call(Some(*dst), *findex, args),
            Op::CallN { dst, findex, args } => self.emit_call(Some(*dst), *findex, args),
            Op::CallMethod { dst, field, args } => self.emit_virtual_call(Some(*dst), args[0], *field, &args[1..]),
            Op::CallThis { dst, field, args } => {
                let this = self.this_vreg();
                self.emit_virtual_call(Some(*dst), this, *field, args);
            }
            Op::CallClosure { dst, closure, args } => self.emit_call_closure(*dst, *closure, args),
            Op::StaticClosure { dst, findex } => {
                let addr = self.resolve_function_addr(*findex);
                let helper = self.runtime.alloc_obj_addr(); // closure shape mirrors a plain object allocation
                let p = self.call_runtime_raw(helper, |cg| cg.materialize_addr(xreg(0), addr));
                self.bind(*dst, p);
            }
            Op::InstanceClosure { dst, findex, obj } => {
                let addr = self.resolve_function_addr(*findex);
                let obj_p = self.fetch(*obj, true);
                let helper = self.runtime.alloc_obj_addr();
                let p = self.call_runtime_raw(helper, |cg| {
                    cg.materialize_addr(xreg(0), addr);
                    cg.buf.reserve(4);
                    cg.buf.push_u32(encoder::logical_shifted(
                        LogicalOp::Orr,
                        true,
                        xreg(1),
                        zero_or_sp_reg(),
                        obj_p,
                        ShiftOp::Lsl(0),
                    ));
                });
                self.bind(*dst, p);
            }
            Op::VirtualClosure { dst, obj, field } => {
                let fn_p = self.load_vtable_slot(*obj, *field);
                let obj_p = self.fetch(*obj, true);
                let helper = self.runtime.alloc_obj_addr();
                let p = self.call_runtime_raw(helper, |cg| {
                    cg.buf.reserve(8);
                    cg.buf.push_u32(encoder::logical_shifted(
                        LogicalOp::Orr,
                        true,
                        xreg(0),
                        zero_or_sp_reg(),
                        fn_p,
                        ShiftOp::Lsl(0),
                    ));
                    cg.buf.push_u32(encoder::logical_shifted(
                        LogicalOp::Orr,
                        true,
                        xreg(1),
                        zero_or_sp_reg(),
                        obj_p,
                        ShiftOp::Lsl(0),
                    ));
                });
                self.bind(*dst, p);
            }

            // Globals
            Op::GetGlobal { dst, global } => {
                let g = self.module.globals[global.0 as usize];
                let base = self.alloc(RegClass::Cpu);
                self.materialize_addr(base, g.addr);
                let pdst = self.alloc(self.class_of(*dst));
                let size = self.access_size(*dst);
                self.ldst_field(true, pdst, base, self.class_of(*dst) == RegClass::Fpu, size, 0);
                self.bind(*dst, pdst);
            }
            Op::SetGlobal { global, src } => {
                let g = self.module.globals[global.0 as usize];
                let base = self.alloc(RegClass::Cpu);
                self.materialize_addr(base, g.addr);
                let psrc = self.fetch(*src, true);
                let size = self.access_size(*src);
                self.ldst_field(false, psrc, base, self.class_of(*src) == RegClass::Fpu, size, 0);
            }

            // Field / object access
            Op::Field { dst, obj, field } => self.emit_field(*dst, *obj, *field),
            Op::SetField { obj, field, src } => self.emit_set_field(*obj, *field, *src),
            Op::GetThis { dst, field } => {
                let this = self.this_vreg();
                self.emit_field(*dst, this, *field);
            }
            Op::SetThis { field, src } => {
                let this = self.this_vreg();
                self.emit_set_field(this, *field, *src);
            }
            Op::DynGet { dst, obj, hashed_name } => self.emit_dyn_get(*dst, *obj, *hashed_name),
            Op::DynSet { obj, hashed_name, src } => self.emit_dyn_set(*obj, *hashed_name, *src),

            // Control flow
            Op::JTrue { cond, offset } => {
                self.emit_cmp_zero(*cond);
                self.jump_cond(i, *offset, Cond::Ne);
            }
            Op::JFalse { cond, offset } => {
                self.emit_cmp_zero(*cond);
                self.jump_cond(i, *offset, Cond::Eq);
            }
            Op::JNull { src, offset } => {
                self.emit_cmp_zero(*src);
                self.jump_cond(i, *offset, Cond::Eq);
            }
            Op::JNotNull { src, offset } => {
                self.emit_cmp_zero(*src);
                self.jump_cond(i, *offset, Cond::Ne);
            }
            Op::JSLt { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Lt);
            }
            Op::JSGte { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Ge);
            }
            Op::JSGt { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Gt);
            }
            Op::JSLte { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Le);
            }
            Op::JULt { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Lo);
            }
            Op::JUGte { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Hs);
            }
            Op::JNotLt { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Ge);
            }
            Op::JNotGte { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Lt);
            }
            Op::JEq { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Eq);
            }
            Op::JNotEq { a, b, offset } => {
                self.emit_cmp(*a, *b);
                self.jump_cond(i, *offset, Cond::Ne);
            }
            Op::JAlways { offset } => self.jump_always(i, *offset),
            Op::Label => {}

            // Casts
            Op::ToDyn { dst, src } => self.emit_to_dyn(*dst, *src),
            Op::ToSFloat { dst, src } => self.emit_to_sfloat(*dst, *src),
            Op::ToUFloat { dst, src } => self.emit_to_ufloat(*dst, *src),
            Op::ToInt { dst, src } => self.emit_to_int(*dst, *src),
            Op::SafeCast { dst, src } => self.emit_safe_cast(*dst, *src),
            Op::UnsafeCast { dst, src } => self.ra.mov(self.buf, *src, *dst),
            Op::ToVirtual { dst, src } => self.emit_to_virtual(*dst, *src),

            // Return / exceptions
            Op::Ret { src } => {
                let kind = self.ty_kind(*src);
                if !matches!(kind, TypeKind::Void) {
                    let p = if kind.is_float() { regs::vreg_phys(0) } else { xreg(0) };
                    self.ra.load(self.buf, *src, p);
                }
                self.emit_epilogue(layout);
            }
            Op::Throw { src } => {
                let addr = self.runtime.throw_addr();
                let p = self.fetch(*src, true);
                self.call_runtime_raw(addr, |cg| {
                    cg.buf.reserve(4);
                    cg.buf.push_u32(encoder::logical_shifted(LogicalOp::Orr, true, xreg(0), zero_or_sp_reg(), p, ShiftOp::Lsl(0)));
                });
            }
            Op::Rethrow { src } => {
                let addr = self.runtime.rethrow_addr();
                let p = self.fetch(*src, true);
                self.call_runtime_raw(addr, |cg| {
                    cg.buf.reserve(4);
                    cg.buf.push_u32(encoder::logical_shifted(LogicalOp::Orr, true, xreg(0), zero_or_sp_reg(), p, ShiftOp::Lsl(0)));
                });
            }
            Op::Switch { src, offsets } => {
                let psrc = self.fetch(*src, true);
                for (case, &offset) in offsets.iter().enumerate() {
                    self.buf.reserve(8);
                    let imm = Imm12::maybe_from_u64(case as u64).expect("switch case count exceeds 12-bit range");
                    self.buf
                        .push_u32(encoder::arith_imm(ArithImmOp::Subs, true, zero_or_sp_reg(), psrc, imm));
                    self.jump_cond(i, offset, Cond::Eq);
                }
            }
            Op::NullCheck { src } => {
                self.emit_cmp_zero(*src);
                // Fast path: branch past the trap call when the value is non-null.
                let word = encoder::cond_branch(Cond::Ne, 0);
                let emit_offset = self.buf.position();
                self.buf.push_u32(word);
                let addr = self.runtime.null_access_addr();
                self.emit_call_native(addr);
                let target_byte = self.buf.position();
                let delta = target_byte as i64 - emit_offset as i64;
                self.buf.patch_or(emit_offset, BranchKind::Conditional19.encode_offset(delta));
            }
            Op::Trap { dst, offset } => {
                let addr = self.runtime.trap_push_addr();
                let p = self.call_runtime_raw(addr, |_| {});
                self.bind(*dst, p);
                // `dst` receives a sentinel indicating whether a thrown exception resumed
                // here; the jump target is the associated catch/recovery block.
                self.jump_always(i, *offset);
            }
            Op::EndTrap { exception_thrown } => {
                let addr = self.runtime.trap_pop_addr();
                let p = self.fetch(*exception_thrown, true);
                self.call_runtime_raw(addr, |cg| {
                    cg.buf.reserve(4);
                    cg.buf.push_u32(encoder::logical_shifted(LogicalOp::Orr, true, xreg(0), zero_or_sp_reg(), p, ShiftOp::Lsl(0)));
                });
            }

            // Raw memory and arrays
            Op::GetI8 { dst, base, offset } => self.emit_raw_load(*dst, *base, *offset, AccessSize::Byte),
            Op::GetI16 { dst, base, offset } => self.emit_raw_load(*dst, *base, *offset, AccessSize::Half),
            Op::GetMem { dst, base, offset } => {
                let size = self.access_size(*dst);
                self.emit_raw_load(*dst, *base, *offset, size);
            }
            Op::GetArray { dst, array, index } => self.emit_array_get(*dst, *array, *index),
            Op::SetI8 { base, offset, src } => self.emit_raw_store(*base, *offset, *src, AccessSize::Byte),
            Op::SetI16 { base, offset, src } => self.emit_raw_store(*base, *offset, *src, AccessSize::Half),
            Op::SetMem { base, offset, src } => {
                let size = self.access_size(*src);
                self.emit_raw_store(*base, *offset, *src, size);
            }
            Op::SetArray { array, index, src } => self.emit_array_set(*array, *index, *src),

            // Allocation
            Op::New { dst } => self.emit_new(*dst),
            Op::ArraySize { dst, array } => self.emit_array_size(*dst, *array),
            Op::Type { dst, ty } => {
                let addr = self.module.ty(*ty).addr;
                self.emit_type_const(*dst, addr);
            }
            Op::GetType { dst, src } => self.emit_get_type(*dst, *src),
            Op::GetTID { dst, src } => self.emit_get_tid(*dst, *src),

            // References
            Op::Ref { dst, src } => self.emit_ref(*dst, *src),
            Op::Unref { dst, src } => self.emit_unref(*dst, *src),
            Op::Setref { dst, src } => self.emit_setref(*dst, *src),

            // Enums
            Op::MakeEnum { dst, construct, args } => self.emit_make_enum(*dst, *construct, args),
            Op::EnumAlloc { dst, construct } => self.emit_enum_alloc(*dst, *construct),
            Op::EnumIndex { dst, src } => self.emit_enum_index(*dst, *src),
            Op::EnumField { dst, src, construct, field } => self.emit_enum_field(*dst, *src, *construct, *field),
            Op::SetEnumField { dst, construct, field, src } => self.emit_set_enum_field(*dst, *construct, *field, *src),

            // Misc
            Op::Assert => {
                let addr = self.runtime.assert_fail_addr();
                self.call_runtime_raw(addr, |_| {});
            }
            Op::RefData { dst, src } => self.emit_ref_offset(*dst, *src, 0),
            Op::RefOffset { dst, src, offset } => self.emit_ref_offset(*dst, *src, *offset),
            Op::Nop => {}

            Op::Unsupported { tag } => {
                self.buf.reserve(4);
                self.buf.push_u32(encoder::brk(*tag as u16));
            }
        }
    }

    // -- Shared arithmetic helpers ------------------------------------------------------------------

    fn emit_binop_arith(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex, iop: ArithImmOp, fop: crate::encoder::FpBinOp) {
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let is_float = self.is_float(dst);
        let class = if is_float { RegClass::Fpu } else { RegClass::Cpu };
        let pdst = self.alloc(class);
        self.buf.reserve(4);
        if is_float {
            let is_double = self.size64(dst);
            self.buf.push_u32(encoder::fp_binop(fop, is_double, pdst, pa, pb));
        } else {
            let size64 = self.size64(dst);
            self.buf.push_u32(encoder::arith_shifted(iop, size64, pdst, pa, pb, ShiftOp::Lsl(0)));
        }
        self.bind(dst, pdst);
    }

    fn emit_mul(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex) {
        if self.is_float(dst) {
            self.emit_binop_arith(dst, a, b, ArithImmOp::Add, crate::encoder::FpBinOp::Fmul);
            return;
        }
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let pdst = self.alloc(RegClass::Cpu);
        let size64 = self.size64(dst);
        self.buf.reserve(4);
        self.buf
            .push_u32(encoder::mul_acc(MulAccOp::Madd, size64, pdst, pa, pb, zero_or_sp_reg()));
        self.bind(dst, pdst);
    }

    fn emit_div(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex, op: TwoRegOp) {
        if self.is_float(dst) {
            let fop = crate::encoder::FpBinOp::Fdiv;
            self.emit_binop_arith(dst, a, b, ArithImmOp::Add, fop);
            return;
        }
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let pdst = self.alloc(RegClass::Cpu);
        let size64 = self.size64(dst);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::two_reg(op, size64, pdst, pa, pb));
        self.bind(dst, pdst);
    }

    fn emit_mod(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex, div_op: TwoRegOp) {
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let size64 = self.size64(dst);
        let pq = self.alloc(RegClass::Cpu);
        self.buf.reserve(8);
        self.buf.push_u32(encoder::two_reg(div_op, size64, pq, pa, pb));
        let pdst = self.alloc(RegClass::Cpu);
        self.buf.push_u32(encoder::mul_acc(MulAccOp::Msub, size64, pdst, pq, pb, pa));
        self.bind(dst, pdst);
    }

    fn emit_shift(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex, op: TwoRegOp) {
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let pdst = self.alloc(RegClass::Cpu);
        let size64 = self.size64(dst);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::two_reg(op, size64, pdst, pa, pb));
        self.bind(dst, pdst);
    }

    fn emit_logical(&mut self, dst: VRegIndex, a: VRegIndex, b: VRegIndex, op: LogicalOp) {
        let pa = self.fetch(a, true);
        let pb = self.fetch(b, true);
        let pdst = self.alloc(RegClass::Cpu);
        let size64 = self.size64(dst);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::logical_shifted(op, size64, pdst, pa, pb, ShiftOp::Lsl(0)));
        self.bind(dst, pdst);
    }

    fn emit_neg(&mut self, dst: VRegIndex, src: VRegIndex) {
        let psrc = self.fetch(src, true);
        if self.is_float(dst) {
            let pdst = self.alloc(RegClass::Fpu);
            let is_double = self.size64(dst);
            self.buf.reserve(4);
            self.buf.push_u32(encoder::fneg(is_double, pdst, psrc));
            self.bind(dst, pdst);
        } else {
            let pdst = self.alloc(RegClass::Cpu);
            let size64 = self.size64(dst);
            self.buf.reserve(4);
            self.buf
                .push_u32(encoder::arith_shifted(ArithImmOp::Sub, size64, pdst, zero_or_sp_reg(), psrc, ShiftOp::Lsl(0)));
            self.bind(dst, pdst);
        }
    }

    fn emit_incr_decr(&mut self, dst: VRegIndex, op: ArithImmOp) {
        let p = self.fetch(dst, true);
        let size64 = self.size64(dst);
        self.buf.reserve(4);
        let one = Imm12::maybe_from_u64(1).unwrap();
        self.buf.push_u32(encoder::arith_imm(op, size64, p, p, one));
    }

    fn emit_ref_offset(&mut self, dst: VRegIndex, src: VRegIndex, offset: i32) {
        if let Some(p) = self.ra.binding(src) {
            self.ra.scratch(self.buf, p, false);
        }
        let base = self.ra.frame_offset(src) + offset;
        let pdst = self.alloc(RegClass::Cpu);
        self.buf.reserve(4);
        let imm = Imm12::maybe_from_u64(base as u64).expect("reference offset out of ADD-immediate range");
        self.buf.push_u32(encoder::arith_imm(ArithImmOp::Add, true, pdst, fp_reg(), imm));
        self.bind(dst, pdst);
    }

    // -- Virtual dispatch (CallMethod/CallThis/VirtualClosure) ---------------------------------------

    /// Load the function pointer at vtable slot `field` for `obj`'s runtime type. Every
    /// object's header starts with its type pointer, so that word is read at a fixed offset
    /// of zero — no `Runtime` call needed, unlike `emit_field`'s use of `obj_field_offset`
    /// for ordinary fields — and `field` then indexes into that type's method table.
    fn load_vtable_slot(&mut self, obj: VRegIndex, field: u32) -> PReg {
        let pobj = self.fetch(obj, true);
        let ptype = self.alloc(RegClass::Cpu);
        self.ldst_field(true, ptype, pobj, false, AccessSize::Dword, 0);
        let pfn = self.alloc(RegClass::Cpu);
        let slot_offset = (field as i32) * 8;
        self.ldst_field(true, pfn, ptype, false, AccessSize::Dword, slot_offset);
        pfn
    }

    fn emit_virtual_call(&mut self, dst: Option<VRegIndex>, obj: VRegIndex, field: u32, rest_args: &[VRegIndex]) {
        let fn_p = self.load_vtable_slot(obj, field);
        let mut args = Vec::with_capacity(rest_args.len() + 1);
        args.push(obj);
        args.extend_from_slice(rest_args);
        self.emit_call_reg(dst, fn_p, &args);
    }

    fn emit_call_closure(&mut self, dst: VRegIndex, closure: VRegIndex, args: &[VRegIndex]) {
        let has_value_off = self.runtime.closure_has_value_offset();
        let fn_off = self.runtime.closure_fn_ptr_offset();
        let value_off = self.runtime.closure_value_offset();

        let pclosure = self.fetch(closure, true);
        let pflag = self.alloc(RegClass::Cpu);
        self.ldst_field(true, pflag, pclosure, false, AccessSize::Byte, has_value_off as i32);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::arith_shifted(
            ArithImmOp::Subs,
            false,
            zero_or_sp_reg(),
            pflag,
            zero_or_sp_reg(),
            ShiftOp::Lsl(0),
        ));
        let word = encoder::cond_branch(Cond::Eq, 0);
        let branch_to_free_arm = self.buf.position();
        self.buf.push_u32(word);

        // Self-bound arm: prepend the bound receiver to the argument list. `pfn`/`pself` are
        // read into the reserved intra-procedure scratch registers (not allocator-visible)
        // so `pass_args_with_leading_reg`'s argument-register loads below can't clobber them.
        let saved = self.ra.save_regs();
        let pfn = tmp2_reg();
        self.ldst_field(true, pfn, pclosure, false, AccessSize::Dword, fn_off as i32);
        let pself = spilltmp_reg();
        self.ldst_field(true, pself, pclosure, false, AccessSize::Dword, value_off as i32);
        self.ra.start_call(self.buf);
        let stack_bytes = self.pass_args_with_leading_reg(pself, args);
        self.buf.reserve(4);
        self.buf.push_u32(encoder::branch_reg(BranchRegOp::Blr, pfn));
        self.ra.end_call(self.buf, stack_bytes);
        self.bind_call_result(dst);
        let join = self.jump_always_raw();

        // Free-function arm.
        let free_arm_pos = self.buf.position();
        let delta = free_arm_pos as i64 - branch_to_free_arm as i64;
        self.buf.patch_or(branch_to_free_arm, BranchKind::Conditional19.encode_offset(delta));
        self.ra.restore_regs(saved);
        let pfn2 = self.alloc(RegClass::Cpu);
        self.ldst_field(true, pfn2, pclosure, false, AccessSize::Dword, fn_off as i32);
        self.emit_call_reg(Some(dst), pfn2, args);

        let end_pos = self.buf.position();
        let delta2 = end_pos as i64 - join as i64;
        self.buf.patch_or(join, BranchKind::Unconditional26.encode_offset(delta2));
    }

    fn jump_always_raw(&mut self) -> usize {
        let pos = self.buf.position();
        self.buf.reserve(4);
        self.buf.push_u32(encoder::branch_imm(false, 0));
        pos
    }

    fn pass_args_with_leading_reg(&mut self, leading: PReg, rest: &[VRegIndex]) -> i32 {
        self.buf.reserve(4);
        self.buf.push_u32(encoder::logical_shifted(
            LogicalOp::Orr,
            true,
            xreg(0),
            zero_or_sp_reg(),
            leading,
            ShiftOp::Lsl(0),
        ));
        let mut cpu_n = 1u8;
        let mut fpu_n = 0u8;
        let mut stack_args = Vec::new();
        for &a in rest {
            if self.class_of(a) == RegClass::Fpu {
                if fpu_n < abi::ARG_REGS_PER_CLASS as u8 {
                    let p = regs::vreg_phys(fpu_n);
                    self.ra.load(self.buf, a, p);
                    fpu_n += 1;
                } else {
                    stack_args.push(a);
                }
            } else if cpu_n < abi::ARG_REGS_PER_CLASS as u8 {
                let p = xreg(cpu_n);
                self.ra.load(self.buf, a, p);
                cpu_n += 1;
            } else {
                stack_args.push(a);
            }
        }
        if stack_args.is_empty() {
            return 0;
        }
        let bytes = stack_args.len() as i32 * 8;
        let aligned = (bytes + 15) / 16 * 16;
        self.adjust_sp(ArithImmOp::Sub, aligned);
        for (i, &a) in stack_args.iter().enumerate() {
            let p = self.fetch(a, true);
            self.buf.reserve(4);
            let imm = UImm12Scaled::maybe_from_i64((i as i64) * 8, 8).unwrap();
            let is_vector = self.class_of(a) == RegClass::Fpu;
            self.buf
                .push_u32(encoder::ldst_unsigned_imm(false, AccessSize::Dword, is_vector, p, zero_or_sp_reg(), imm));
        }
        aligned
    }
}
