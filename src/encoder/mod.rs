//! The AArch64 instruction encoder: one narrow function per instruction family, each
//! writing exactly one 32-bit word.
//!
//! Modeled on the `enc_arith_rrr`/`enc_arith_rr_imm12`/`enc_arith_rr_imml`
//! bit-packing style (`isa/aarch64/inst/emit.rs`): every emitter here is a pure function
//! from typed operand descriptors to a `u32`, with out-of-range operands caught by
//! `assert!` rather than returned as an error: a range violation here is an implementation
//! bug in the code generator, not a condition the embedding host should recover from.
//!
//! Operand *materialization* (deciding whether a value fits an immediate form or must be
//! loaded into a scratch register first) is the code generator's job, not the encoder's;
//! these functions only ever encode what they are handed.

pub mod args;
pub mod imms;

use crate::regs::PReg;
use args::{Cond, ExtendOp, ShiftOp};
use imms::{Imm12, MoveWideConst, SImm9, UImm12Scaled};

fn r(p: PReg) -> u32 {
    p.hw_enc()
}

/// `ADR Xd, label` — PC-relative byte address, ±1 MiB.
pub fn adr(rd: PReg, byte_offset: i32) -> u32 {
    assert!((-(1 << 20)..(1 << 20)).contains(&byte_offset), "ADR offset out of range");
    let imm = byte_offset as u32 & 0x1F_FFFF;
    let immlo = imm & 0b11;
    let immhi = imm >> 2;
    (0b0 << 31) | (immlo << 29) | (0b10000 << 24) | (immhi << 5) | r(rd)
}

/// `ADRP Xd, label` — PC-relative *page* address, ±4 GiB granularity of 4 KiB pages.
pub fn adrp(rd: PReg, page_offset: i32) -> u32 {
    assert!(
        (-(1 << 20)..(1 << 20)).contains(&page_offset),
        "ADRP page offset out of range"
    );
    let imm = page_offset as u32 & 0x1F_FFFF;
    let immlo = imm & 0b11;
    let immhi = imm >> 2;
    (0b1 << 31) | (immlo << 29) | (0b10000 << 24) | (immhi << 5) | r(rd)
}

/// `ADD`/`SUB`(`S`) with a 12-bit (optionally `LSL #12`) immediate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithImmOp {
    Add,
    Adds,
    Sub,
    Subs,
}

pub fn arith_imm(op: ArithImmOp, size64: bool, rd: PReg, rn: PReg, imm12: Imm12) -> u32 {
    let (is_sub, set_flags) = match op {
        ArithImmOp::Add => (0, 0),
        ArithImmOp::Adds => (0, 1),
        ArithImmOp::Sub => (1, 0),
        ArithImmOp::Subs => (1, 1),
    };
    ((size64 as u32) << 31)
        | (is_sub << 30)
        | (set_flags << 29)
        | (0b100010 << 23)
        | (imm12.shift_bit() << 22)
        | (imm12.imm_bits() << 10)
        | (r(rn) << 5)
        | r(rd)
}

/// `MOVZ`/`MOVK`/`MOVN` of one 16-bit lane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveWideOp {
    Movn,
    Movz,
    Movk,
}

pub fn move_wide(op: MoveWideOp, size64: bool, rd: PReg, lane: MoveWideConst) -> u32 {
    let opc = match op {
        MoveWideOp::Movn => 0b00,
        MoveWideOp::Movz => 0b10,
        MoveWideOp::Movk => 0b11,
    };
    ((size64 as u32) << 31)
        | (opc << 29)
        | (0b100101 << 23)
        | ((lane.shift as u32) << 21)
        | ((lane.bits as u32) << 5)
        | r(rd)
}

/// Emit the `MOVZ` + up to three `MOVK` cascade that materializes an arbitrary 64-bit (or,
/// with `size64 = false`, 32-bit) constant into `rd`.
pub fn load_constant_cascade(rd: PReg, size64: bool, value: u64) -> Vec<u32> {
    let lanes = if size64 {
        MoveWideConst::cascade(value)
    } else {
        MoveWideConst::cascade32(value as u32)
    };
    let mut words = Vec::with_capacity(lanes.len());
    for (i, lane) in lanes.into_iter().enumerate() {
        let op = if i == 0 {
            MoveWideOp::Movz
        } else {
            MoveWideOp::Movk
        };
        words.push(move_wide(op, size64, rd, lane));
    }
    words
}

/// Logical shifted-register family: `AND`/`ORR`/`EOR`/`ANDS` and their N-bit-set
/// (bit-clear/negated) variants `BIC`/`ORN`/`EON`/`BICS`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Bic,
    Orr,
    Orn,
    Eor,
    Eon,
    Ands,
    Bics,
}

pub fn logical_shifted(op: LogicalOp, size64: bool, rd: PReg, rn: PReg, rm: PReg, shift: ShiftOp) -> u32 {
    let (opc, n) = match op {
        LogicalOp::And => (0b00, 0),
        LogicalOp::Bic => (0b00, 1),
        LogicalOp::Orr => (0b01, 0),
        LogicalOp::Orn => (0b01, 1),
        LogicalOp::Eor => (0b10, 0),
        LogicalOp::Eon => (0b10, 1),
        LogicalOp::Ands => (0b11, 0),
        LogicalOp::Bics => (0b11, 1),
    };
    let (shift_kind, amount) = shift.bits();
    ((size64 as u32) << 31)
        | (opc << 29)
        | (0b01010 << 24)
        | (shift_kind << 22)
        | (n << 21)
        | (r(rm) << 16)
        | (amount << 10)
        | (r(rn) << 5)
        | r(rd)
}

/// Arithmetic shifted-register family: `ADD`/`ADDS`/`SUB`/`SUBS` with a register operand.
pub fn arith_shifted(op: ArithImmOp, size64: bool, rd: PReg, rn: PReg, rm: PReg, shift: ShiftOp) -> u32 {
    let (is_sub, set_flags) = match op {
        ArithImmOp::Add => (0, 0),
        ArithImmOp::Adds => (0, 1),
        ArithImmOp::Sub => (1, 0),
        ArithImmOp::Subs => (1, 1),
    };
    let (shift_kind, amount) = shift.bits();
    ((size64 as u32) << 31)
        | (is_sub << 30)
        | (set_flags << 29)
        | (0b01011 << 24)
        | (shift_kind << 22)
        | (r(rm) << 16)
        | (amount << 10)
        | (r(rn) << 5)
        | r(rd)
}

/// `MADD`/`MSUB Rd, Rn, Rm, Ra` — `Rd = Ra +/- Rn*Rm`. Used for both multiply (`Ra = XZR`)
/// and modulo (`Ra` holds the dividend, after an `SDIV`/`UDIV` has computed the quotient
/// into `Rn`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MulAccOp {
    Madd,
    Msub,
}

pub fn mul_acc(op: MulAccOp, size64: bool, rd: PReg, rn: PReg, rm: PReg, ra: PReg) -> u32 {
    let o0 = matches!(op, MulAccOp::Msub) as u32;
    ((size64 as u32) << 31)
        | (0b0011011000 << 21)
        | (r(rm) << 16)
        | (o0 << 15)
        | (r(ra) << 10)
        | (r(rn) << 5)
        | r(rd)
}

/// Two-register data-processing family: shifts (`LSLV`/`LSRV`/`ASRV`/`RORV`) and divide
/// (`UDIV`/`SDIV`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TwoRegOp {
    Udiv,
    Sdiv,
    Lslv,
    Lsrv,
    Asrv,
    Rorv,
}

pub fn two_reg(op: TwoRegOp, size64: bool, rd: PReg, rn: PReg, rm: PReg) -> u32 {
    let opcode = match op {
        TwoRegOp::Udiv => 0b000010,
        TwoRegOp::Sdiv => 0b000011,
        TwoRegOp::Lslv => 0b001000,
        TwoRegOp::Lsrv => 0b001001,
        TwoRegOp::Asrv => 0b001010,
        TwoRegOp::Rorv => 0b001011,
    };
    ((size64 as u32) << 31) | (0b11010110 << 21) | (r(rm) << 16) | (opcode << 10) | (r(rn) << 5) | r(rd)
}

/// Access width for the load/store families below. The two-bit `size` field doubles as the
/// SIMD&FP element-size selector when `is_vector` is set (00=B/H not used there; 10=S,
/// 11=D).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AccessSize {
    Byte,
    Half,
    Word,
    Dword,
}

impl AccessSize {
    pub fn size_bits(self) -> u32 {
        match self {
            AccessSize::Byte => 0b00,
            AccessSize::Half => 0b01,
            AccessSize::Word => 0b10,
            AccessSize::Dword => 0b11,
        }
    }

    pub fn byte_size(self) -> u32 {
        match self {
            AccessSize::Byte => 1,
            AccessSize::Half => 2,
            AccessSize::Word => 4,
            AccessSize::Dword => 8,
        }
    }

    /// The `AccessSize` a VM type of this size maps onto for a plain (non-FP, non-GC)
    /// scalar access.
    pub fn for_byte_width(width: u32) -> AccessSize {
        match width {
            1 => AccessSize::Byte,
            2 => AccessSize::Half,
            4 => AccessSize::Word,
            8 => AccessSize::Dword,
            other => panic!("unsupported access width {other}"),
        }
    }
}

/// Scaled-offset `LDR`/`STR [Rn, #imm]`, immediate in units of the access size.
pub fn ldst_unsigned_imm(
    is_load: bool,
    size: AccessSize,
    is_vector: bool,
    rt: PReg,
    rn: PReg,
    imm: UImm12Scaled,
) -> u32 {
    let opc = is_load as u32;
    (size.size_bits() << 30)
        | (0b111 << 27)
        | ((is_vector as u32) << 26)
        | (0b01 << 24)
        | (opc << 22)
        | (imm.bits() << 10)
        | (r(rn) << 5)
        | r(rt)
}

/// Unscaled-offset `LDUR`/`STUR [Rn, #simm9]`.
pub fn ldst_unscaled_imm(
    is_load: bool,
    size: AccessSize,
    is_vector: bool,
    rt: PReg,
    rn: PReg,
    imm: SImm9,
) -> u32 {
    let opc = is_load as u32;
    (size.size_bits() << 30)
        | (0b111 << 27)
        | ((is_vector as u32) << 26)
        | (0b00 << 24)
        | (opc << 22)
        | (imm.bits() << 12)
        | (r(rn) << 5)
        | r(rt)
}

/// Register-offset `LDR`/`STR [Rn, Rm, {SXTX|LSL}]`.
pub fn ldst_reg_offset(
    is_load: bool,
    size: AccessSize,
    is_vector: bool,
    rt: PReg,
    rn: PReg,
    rm: PReg,
    extend: ExtendOp,
) -> u32 {
    let opc = is_load as u32;
    (size.size_bits() << 30)
        | (0b111 << 27)
        | ((is_vector as u32) << 26)
        | (0b00 << 24)
        | (opc << 22)
        | (1 << 21)
        | (r(rm) << 16)
        | (extend.option_bits() << 13)
        | (0b1 << 12) // S: scale index by access size
        | (0b10 << 10)
        | (r(rn) << 5)
        | r(rt)
}

/// Unconditional branch immediate: `B`/`BL`. `imm26` is in units of instructions (already
/// divided by 4); deferred branches are emitted with `imm26 = 0` and patched afterward.
pub fn branch_imm(is_link: bool, imm26: i32) -> u32 {
    assert!((-(1 << 25)..(1 << 25)).contains(&imm26), "B/BL offset out of range");
    ((is_link as u32) << 31) | (0b00101 << 26) | (imm26 as u32 & 0x03FF_FFFF)
}

/// Unconditional branch register: `BR`/`BLR`/`RET`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchRegOp {
    Br,
    Blr,
    Ret,
}

pub fn branch_reg(op: BranchRegOp, rn: PReg) -> u32 {
    let opc = match op {
        BranchRegOp::Br => 0b00,
        BranchRegOp::Blr => 0b01,
        BranchRegOp::Ret => 0b10,
    };
    0xD61F_0000 | (opc << 21) | (r(rn) << 5)
}

/// Conditional branch: `B.cond`. `imm19` is in units of instructions.
pub fn cond_branch(cond: Cond, imm19: i32) -> u32 {
    assert!((-(1 << 18)..(1 << 18)).contains(&imm19), "B.cond offset out of range");
    0x5400_0000 | ((imm19 as u32 & 0x0007_FFFF) << 5) | cond.bits()
}

/// `BRK #imm16` — used both as a debugger trap and, in this core, as the fallback for
/// opcodes the code generator does not implement.
pub fn brk(imm16: u16) -> u32 {
    0xD420_0000 | ((imm16 as u32) << 5)
}

/// `NOP`, used for 16-byte alignment padding.
pub fn nop() -> u32 {
    0xD503_201F
}

/// `DMB`/`DSB`/`ISB SY` (full system barrier).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Barrier {
    Dmb,
    Dsb,
    Isb,
}

pub fn barrier(kind: Barrier) -> u32 {
    match kind {
        Barrier::Dmb => 0xD503_30BF,
        Barrier::Dsb => 0xD503_349F,
        Barrier::Isb => 0xD503_3FDF,
    }
}

/// `FMOV`/`FNEG` (register, same precision).
pub fn fmov_reg(is_double: bool, rd: PReg, rn: PReg) -> u32 {
    let ptype = is_double as u32;
    0x1E20_4000 | (ptype << 22) | (r(rn) << 5) | r(rd)
}

pub fn fneg(is_double: bool, rd: PReg, rn: PReg) -> u32 {
    let ptype = is_double as u32;
    0x1E20_4000 | (ptype << 22) | (0b01 << 15) | (r(rn) << 5) | r(rd)
}

/// `FCVT` between single and double precision.
pub fn fcvt(to_double: bool, rd: PReg, rn: PReg) -> u32 {
    if to_double {
        0x1E22_C000 | (r(rn) << 5) | r(rd)
    } else {
        0x1E62_4000 | (r(rn) << 5) | r(rd)
    }
}

/// Two-operand floating-point arithmetic: `FADD`/`FSUB`/`FMUL`/`FDIV`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpBinOp {
    Fadd,
    Fsub,
    Fmul,
    Fdiv,
}

pub fn fp_binop(op: FpBinOp, is_double: bool, rd: PReg, rn: PReg, rm: PReg) -> u32 {
    let ptype = is_double as u32;
    let opcode = match op {
        FpBinOp::Fmul => 0b0000,
        FpBinOp::Fdiv => 0b0001,
        FpBinOp::Fadd => 0b0010,
        FpBinOp::Fsub => 0b0011,
    };
    0x1E20_0800 | (ptype << 22) | (r(rm) << 16) | (opcode << 12) | (r(rn) << 5) | r(rd)
}

/// Signed/unsigned integer-to-float conversion: `SCVTF`/`UCVTF`.
pub fn int_to_float(is_signed: bool, src_is_64: bool, dst_is_double: bool, rd: PReg, rn: PReg) -> u32 {
    let sf = src_is_64 as u32;
    let ptype = dst_is_double as u32;
    let rmode_opcode = if is_signed { 0b00_010 } else { 0b00_011 };
    (sf << 31) | (0b0_0_11110 << 24) | (ptype << 22) | (1 << 21) | (rmode_opcode << 16) | (r(rn) << 5) | r(rd)
}

/// Float-to-integer conversion, round-toward-zero: `FCVTZS`/`FCVTZU`.
pub fn float_to_int(is_signed: bool, dst_is_64: bool, src_is_double: bool, rd: PReg, rn: PReg) -> u32 {
    let sf = dst_is_64 as u32;
    let ptype = src_is_double as u32;
    let rmode_opcode = if is_signed { 0b11_000 } else { 0b11_001 };
    (sf << 31) | (0b0_0_11110 << 24) | (ptype << 22) | (1 << 21) | (rmode_opcode << 16) | (r(rn) << 5) | r(rd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regs::xreg;

    #[test]
    fn arith_imm_round_trips_immediate_field() {
        for val in 0u64..=0xFFF {
            let imm = Imm12::maybe_from_u64(val).unwrap();
            let word = arith_imm(ArithImmOp::Add, true, xreg(0), xreg(1), imm);
            assert_eq!((word >> 10) & 0xFFF, val as u32);
            assert_eq!(word & 0x1F, 0); // Rd = x0
            assert_eq!((word >> 5) & 0x1F, 1); // Rn = x1
        }
    }

    #[test]
    fn move_wide_cascade_materializes_arbitrary_64bit_constant() {
        let values = [0u64, 1, 0xFFFF_FFFF_FFFF_FFFF, 0x1234_5678_9ABC_DEF0, 0x8000_0000];
        for &v in &values {
            let words = load_constant_cascade(xreg(0), true, v);
            // Simulate execution: MOVZ sets, MOVK merges into a 16-bit lane.
            let mut acc: u64 = 0;
            for w in words {
                let opc = (w >> 29) & 0b11;
                let lane_shift = ((w >> 21) & 0b11) * 16;
                let imm16 = (w >> 5) & 0xFFFF;
                if opc == 0b10 {
                    acc = (imm16 as u64) << lane_shift;
                } else {
                    acc &= !(0xFFFFu64 << lane_shift);
                    acc |= (imm16 as u64) << lane_shift;
                }
            }
            assert_eq!(acc, v);
        }
    }

    #[test]
    fn branch_imm_offset_round_trips() {
        for off in [-1000i32, -1, 0, 1, 1000] {
            let word = branch_imm(true, off);
            let decoded = (word & 0x03FF_FFFF) as i32;
            let decoded = (decoded << 6) >> 6; // sign extend 26 -> 32
            assert_eq!(decoded, off);
        }
    }

    #[test]
    fn cond_branch_offset_round_trips() {
        for off in [-1000i32, -1, 0, 1, 1000] {
            let word = cond_branch(Cond::Eq, off);
            let decoded = ((word >> 5) & 0x0007_FFFF) as i32;
            let decoded = (decoded << 13) >> 13; // sign extend 19 -> 32
            assert_eq!(decoded, off);
        }
    }
}
