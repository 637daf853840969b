//! Function frame layout, prologue/epilogue sequences, and AAPCS64 parameter passing,
//! modeled on a Cranelift-style `isa/aarch64/abi.rs` frame-size accounting but reduced to
//! this core's single fixed-shape frame (no spill-weight allocation, no callee-saved
//! clobber tracking beyond `x29`/`x30`).
//!
//! Frame shape, low to high address:
//! ```text
//! [x29] ------------------- frame pointer after prologue
//!   local vreg slots (every vreg gets one, including all arguments: the prologue copies
//!   stack-passed arguments in from the caller's frame once, up front)
//! [sp at entry to body] ---- frameSize below x29
//! [x29, #0]  saved x29
//! [x29, #8]  saved x30
//! [x29, #16] caller's outgoing-argument area (where stack-passed arguments are read from
//!            during the prologue's one-time copy, at a fixed positive offset past the
//!            callee's own frame)
//! ```

use crate::buffer::CodeBuffer;
use crate::encoder::{self, imms::SImm9, AccessSize};
use crate::module::{Function, Module, TypeKind, VRegIndex};
use crate::regalloc::VRegSlot;
use crate::regs::{self, fp_reg, link_reg, xreg, zero_or_sp_reg, RegClass};

/// Number of argument registers per class before AAPCS64 spills to the stack.
pub const ARG_REGS_PER_CLASS: usize = 8;

/// Where a function argument at a given index is read from at entry, once past the eight
/// register-passed slots. Either way the value ends up in the argument's own local vreg
/// slot before the function body runs; this only describes the one-time source.
#[derive(Clone, Copy, Debug)]
pub enum ArgLocation {
    Reg(regs::PReg),
    /// Byte offset, positive, from `x29` into the caller's outgoing-argument area — i.e. past
    /// this function's own frame, at `x29 + 16 + stack_index * 8`. The prologue copies this
    /// into the argument's local slot; nothing past the prologue reads this offset again.
    IncomingStack { frame_offset: i32 },
}

/// The computed layout for one function: per-vreg stack slots, the total frame size, and
/// each argument's location.
pub struct FrameLayout {
    pub slots: Vec<VRegSlot>,
    pub frame_size: i32,
    pub arg_locations: Vec<ArgLocation>,
}

fn access_size_for(kind: TypeKind) -> AccessSize {
    AccessSize::for_byte_width(kind.size().max(1).min(8))
}

/// Lay out a function's stack frame. Every vreg — including every argument, register- or
/// stack-passed alike — gets its own local slot, assigned contiguously with
/// alignment-respecting padding; the running total is rounded up to 16 bytes.
/// `arg_locations` records where the prologue should copy each argument's initial value in
/// from: a register for the first eight per class, or a fixed offset into the caller's
/// outgoing-argument area past that.
pub fn layout_function(module: &Module, func: &Function) -> FrameLayout {
    let mut cpu_arg_count = 0u32;
    let mut fpu_arg_count = 0u32;
    let mut stack_arg_count = 0u32;
    let mut arg_locations = Vec::with_capacity(func.ty.args.len());

    for &arg_ty in &func.ty.args {
        let kind = module.ty(arg_ty).kind;
        if kind.is_float() {
            if fpu_arg_count < ARG_REGS_PER_CLASS as u32 {
                arg_locations.push(ArgLocation::Reg(regs::vreg_phys(fpu_arg_count as u8)));
                fpu_arg_count += 1;
            } else {
                arg_locations.push(ArgLocation::IncomingStack {
                    frame_offset: 16 + (stack_arg_count as i32) * 8,
                });
                stack_arg_count += 1;
            }
        } else if cpu_arg_count < ARG_REGS_PER_CLASS as u32 {
            arg_locations.push(ArgLocation::Reg(xreg(cpu_arg_count as u8)));
            cpu_arg_count += 1;
        } else {
            arg_locations.push(ArgLocation::IncomingStack {
                frame_offset: 16 + (stack_arg_count as i32) * 8,
            });
            stack_arg_count += 1;
        }
    }

    let mut offset: i32 = 0;
    let mut slots = Vec::with_capacity(func.vregs.len());
    for (i, vreg) in func.vregs.iter().enumerate() {
        let kind = module.ty(vreg.ty).kind;
        let size = access_size_for(kind);
        let class = if kind.is_float() { RegClass::Fpu } else { RegClass::Cpu };
        let width = size.byte_size() as i32;
        offset += width;
        // Round the running offset up to the value's own width so alignment is respected
        // for every slot, not just the frame total.
        let align = width;
        offset = (offset + align - 1) / align * align;
        slots.push(VRegSlot {
            class,
            size,
            frame_offset: offset,
        });
        debug_assert_eq!(slots.len(), i + 1);
    }
    let frame_size = (offset + 15) / 16 * 16;

    FrameLayout {
        slots,
        frame_size,
        arg_locations,
    }
}

/// `SUB sp, sp, #16; STUR x30,[sp,#8]; STUR x29,[sp,#0]; MOV x29, sp; SUB sp, sp, #frameSize`
///.
pub fn emit_prologue(buf: &mut CodeBuffer, frame_size: i32) {
    buf.reserve(encoder::AccessSize::Dword.byte_size() as usize * 8);
    let sixteen = crate::encoder::imms::Imm12::maybe_from_u64(16).unwrap();
    buf.push_u32(encoder::arith_imm(
        encoder::ArithImmOp::Sub,
        true,
        zero_or_sp_reg(),
        zero_or_sp_reg(),
        sixteen,
    ));
    buf.push_u32(encoder::ldst_unscaled_imm(
        false,
        AccessSize::Dword,
        false,
        link_reg(),
        zero_or_sp_reg(),
        SImm9::maybe_from_i64(8).unwrap(),
    ));
    buf.push_u32(encoder::ldst_unscaled_imm(
        false,
        AccessSize::Dword,
        false,
        fp_reg(),
        zero_or_sp_reg(),
        SImm9::maybe_from_i64(0).unwrap(),
    ));
    // MOV x29, sp == ADD x29, sp, #0
    let zero = crate::encoder::imms::Imm12::maybe_from_u64(0).unwrap();
    buf.push_u32(encoder::arith_imm(
        encoder::ArithImmOp::Add,
        true,
        fp_reg(),
        zero_or_sp_reg(),
        zero,
    ));
    if frame_size > 0 {
        emit_sp_adjust(buf, encoder::ArithImmOp::Sub, frame_size);
    }
}

/// `ADD sp, sp, #frameSize; LDUR x29,[sp,#0]; LDUR x30,[sp,#8]; ADD sp, sp, #16; RET x30`
///, emitted once per `ORet`.
pub fn emit_epilogue(buf: &mut CodeBuffer, frame_size: i32) {
    buf.reserve(encoder::AccessSize::Dword.byte_size() as usize * 8);
    if frame_size > 0 {
        emit_sp_adjust(buf, encoder::ArithImmOp::Add, frame_size);
    }
    buf.push_u32(encoder::ldst_unscaled_imm(
        true,
        AccessSize::Dword,
        false,
        fp_reg(),
        zero_or_sp_reg(),
        SImm9::maybe_from_i64(0).unwrap(),
    ));
    buf.push_u32(encoder::ldst_unscaled_imm(
        true,
        AccessSize::Dword,
        false,
        link_reg(),
        zero_or_sp_reg(),
        SImm9::maybe_from_i64(8).unwrap(),
    ));
    let sixteen = crate::encoder::imms::Imm12::maybe_from_u64(16).unwrap();
    buf.push_u32(encoder::arith_imm(
        encoder::ArithImmOp::Add,
        true,
        zero_or_sp_reg(),
        zero_or_sp_reg(),
        sixteen,
    ));
    buf.push_u32(encoder::branch_reg(encoder::BranchRegOp::Ret, link_reg()));
}

/// Adjust `sp` by an arbitrary (non-negative) byte count, splitting across the `LSL #12`
/// immediate form when it exceeds the plain 12-bit range — frame sizes are bounded by the
/// function's own vreg count, but a pathological function can still exceed 4095 bytes.
pub(crate) fn emit_sp_adjust(buf: &mut CodeBuffer, op: encoder::ArithImmOp, bytes: i32) {
    let bytes = bytes as u64;
    if let Some(imm) = crate::encoder::imms::Imm12::maybe_from_u64(bytes) {
        buf.push_u32(encoder::arith_imm(op, true, zero_or_sp_reg(), zero_or_sp_reg(), imm));
        return;
    }
    // Decompose into a `LSL #12` chunk plus a plain low chunk; frame sizes are always
    // 16-byte-aligned and far below the 24-bit range this combination covers.
    let hi = bytes & !0xFFF;
    let lo = bytes & 0xFFF;
    let hi_imm = crate::encoder::imms::Imm12::maybe_from_u64(hi).expect("frame size out of range");
    buf.push_u32(encoder::arith_imm(op, true, zero_or_sp_reg(), zero_or_sp_reg(), hi_imm));
    if lo != 0 {
        let lo_imm = crate::encoder::imms::Imm12::maybe_from_u64(lo).unwrap();
        buf.push_u32(encoder::arith_imm(op, true, zero_or_sp_reg(), zero_or_sp_reg(), lo_imm));
    }
}

/// The vreg index each function argument binds to: arguments are always the first
/// `func.ty.args.len()` vregs in `func.vregs`, matching the VM's own convention that
/// parameters occupy the lowest-numbered registers.
pub fn arg_vreg(index: usize) -> VRegIndex {
    VRegIndex(index as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::{FunctionType, Type, VReg};

    fn make_module(arg_kinds: &[TypeKind], local_kinds: &[TypeKind]) -> (Module, Function) {
        let mut types = Vec::new();
        for &k in arg_kinds.iter().chain(local_kinds.iter()) {
            types.push(Type { kind: k, addr: 0 });
        }
        let args: Vec<_> = (0..arg_kinds.len()).map(|i| crate::module::TypeIndex(i as u32)).collect();
        let ret = crate::module::TypeIndex(0);
        let vregs: Vec<_> = (0..types.len())
            .map(|i| VReg {
                ty: crate::module::TypeIndex(i as u32),
            })
            .collect();
        let module = Module {
            functions: Vec::new(),
            function_addrs: Vec::new(),
            types,
            ints: Vec::new(),
            floats: Vec::new(),
            strings: Vec::new(),
            globals: Vec::new(),
        };
        let func = Function {
            index: crate::module::FunctionIndex(0),
            ty: FunctionType { args, ret },
            vregs,
            ops: Vec::new(),
        };
        (module, func)
    }

    #[test]
    fn frame_size_is_sixteen_byte_aligned() {
        let (module, func) = make_module(&[TypeKind::I32, TypeKind::F64], &[TypeKind::I64]);
        let layout = layout_function(&module, &func);
        assert_eq!(layout.frame_size % 16, 0);
    }

    #[test]
    fn ninth_integer_argument_is_read_from_incoming_stack() {
        let args: Vec<TypeKind> = (0..9).map(|_| TypeKind::I32).collect();
        let (module, func) = make_module(&args, &[]);
        let layout = layout_function(&module, &func);
        match layout.arg_locations[8] {
            ArgLocation::IncomingStack { frame_offset } => assert_eq!(frame_offset, 16),
            ArgLocation::Reg(_) => panic!("9th integer argument must be stack-passed"),
        }
    }
}
