//! Small encoded operand kinds shared by several instruction families: condition codes,
//! shift kinds for shifted-register operands, and load/store sizes.
//!
//! Modeled on the `Cond`/`ShiftOpShiftImm` enums common to AArch64 backends,
//! trimmed to the subset this core's opcode set actually needs.

/// AArch64 condition codes, in their 4-bit hardware encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    /// Unsigned higher-or-same (`CS`/`HS`).
    Hs = 2,
    /// Unsigned lower (`CC`/`LO`).
    Lo = 3,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    /// Unsigned higher.
    Hi = 8,
    /// Unsigned lower-or-same.
    Ls = 9,
}

impl Cond {
    pub fn bits(self) -> u32 {
        self as u32
    }

    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Hs => Cond::Lo,
            Cond::Lo => Cond::Hs,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
        }
    }
}

/// Shift kind for a shifted-register operand (`ADD`/`SUB`/logical forms). This core only
/// ever emits `shift == 0`, so the code generator always passes `Lsl(0)`, but the encoding
/// supports the full family for completeness and for the encoder's own unit tests.
#[derive(Clone, Copy, Debug)]
pub enum ShiftOp {
    Lsl(u8),
    Lsr(u8),
    Asr(u8),
}

impl ShiftOp {
    pub fn bits(self) -> (u32, u32) {
        let (kind, amount) = match self {
            ShiftOp::Lsl(a) => (0b00, a),
            ShiftOp::Lsr(a) => (0b01, a),
            ShiftOp::Asr(a) => (0b10, a),
        };
        assert!(amount < 64, "shift amount {amount} out of range");
        (kind, amount as u32)
    }
}

/// Extend kind for a register-offset addressing mode (`LDR`/`STR` with a scaled index).
#[derive(Clone, Copy, Debug)]
pub enum ExtendOp {
    /// Sign-extended 64-bit index register.
    Sxtx,
    /// Raw (no extension) 64-bit index register, `LSL`-scaled.
    Lsl,
}

impl ExtendOp {
    pub fn option_bits(self) -> u32 {
        match self {
            ExtendOp::Sxtx => 0b110,
            ExtendOp::Lsl => 0b011,
        }
    }
}
