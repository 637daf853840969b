//! AArch64 physical register definitions.
//!
//! Follows the `xreg`/`vreg`/`zero_reg`/`fp_reg` helper style common to AArch64 backends, for this core's
//! own flat `PReg` index space rather than a `RealRegUniverse`: registers are addressed by a
//! single `u8` id, 0..31 for the general-purpose bank and 32..63 for the vector bank.

use std::fmt;

/// Which of the two independent allocation pools a [`PReg`] belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RegClass {
    /// X0..X30, plus the SP/ZR alias.
    Cpu,
    /// V0..V31.
    Fpu,
}

/// Number of addressable CPU registers, X0..X30 (X31 is the SP/ZR alias, modeled
/// separately since its meaning is instruction-context-dependent).
pub const CPU_REG_COUNT: u8 = 31;
/// Number of addressable FPU/vector registers, V0..V31.
pub const FPU_REG_COUNT: u8 = 32;

/// Intra-call scratch register, also used by this core to materialize call targets and
/// absolute addresses ("IP0" in the AAPCS64 naming).
pub const X16_SCRATCH: u8 = 16;
/// Second intra-call scratch register ("IP1").
pub const X17_SCRATCH: u8 = 17;
/// Platform register, reserved by the ABI for OS-specific use.
pub const X18_PLATFORM: u8 = 18;
/// Frame pointer.
pub const X29_FP: u8 = 29;
/// Link register.
pub const X30_LR: u8 = 30;

/// A physical AArch64 register. CPU registers are `id` 0..31 (X0..X30 plus the SP/ZR
/// sentinel at 31); FPU registers are `id` 0..31 within the `Fpu` class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PReg {
    pub class: RegClass,
    pub id: u8,
}

impl PReg {
    pub const fn cpu(id: u8) -> PReg {
        PReg {
            class: RegClass::Cpu,
            id,
        }
    }

    pub const fn fpu(id: u8) -> PReg {
        PReg {
            class: RegClass::Fpu,
            id,
        }
    }

    /// The 5-bit hardware encoding used inside an instruction word. For the CPU class this
    /// is the raw Xn/Wn number (31 denotes SP or ZR depending on instruction context); for
    /// the FPU class it's the raw Vn/Dn/Sn number.
    pub fn hw_enc(&self) -> u32 {
        self.id as u32
    }

    /// True for a register this core never hands to the allocator: the two intra-call
    /// scratch registers, the platform register, the frame pointer, and the link register.
    pub fn is_reserved(&self) -> bool {
        self.class == RegClass::Cpu
            && matches!(
                self.id,
                X16_SCRATCH | X17_SCRATCH | X18_PLATFORM | X29_FP | X30_LR
            )
    }

    /// True for a register the AAPCS64 caller-saved convention requires `start_call` to
    /// spill before a call: X0..X17 and all FPU registers except the sixteen callee-saved
    /// D8..D15 (which, for this core's scalar-only FPU use, are V8..V15).
    pub fn is_caller_saved(&self) -> bool {
        match self.class {
            RegClass::Cpu => self.id <= X17_SCRATCH,
            RegClass::Fpu => !(8..16).contains(&self.id),
        }
    }

    /// True for an AAPCS64 argument register: X0..X7 or V0..V7.
    pub fn is_arg_reg(&self) -> bool {
        self.id < 8
    }
}

impl fmt::Display for PReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.class {
            RegClass::Cpu if self.id == 31 => write!(f, "sp/xzr"),
            RegClass::Cpu => write!(f, "x{}", self.id),
            RegClass::Fpu => write!(f, "v{}", self.id),
        }
    }
}

/// X0..X30 (general-purpose).
pub fn xreg(num: u8) -> PReg {
    assert!(num <= 30, "x{num} is out of range");
    PReg::cpu(num)
}

/// The zero register / stack pointer encoding (X31, context-dependent meaning).
pub fn zero_or_sp_reg() -> PReg {
    PReg::cpu(31)
}

/// V0..V31 (vector/FP, used here only in scalar single/double precision role).
pub fn vreg_phys(num: u8) -> PReg {
    assert!(num < 32, "v{num} is out of range");
    PReg::fpu(num)
}

pub fn fp_reg() -> PReg {
    xreg(X29_FP)
}

pub fn link_reg() -> PReg {
    xreg(X30_LR)
}

pub fn spilltmp_reg() -> PReg {
    xreg(X16_SCRATCH)
}

pub fn tmp2_reg() -> PReg {
    xreg(X17_SCRATCH)
}

/// Enumerate the registers available to the allocator for a given class, in allocation
/// preference order (low-numbered first). Reserved registers are excluded.
pub fn allocatable(class: RegClass) -> impl Iterator<Item = PReg> {
    let count = match class {
        RegClass::Cpu => CPU_REG_COUNT,
        RegClass::Fpu => FPU_REG_COUNT,
    };
    (0..count)
        .map(move |id| PReg { class, id })
        .filter(|p| !p.is_reserved())
}
