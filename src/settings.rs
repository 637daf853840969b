//! Compile-time knobs for the backend.
//!
//! Most of the core's behavior is fixed by design (the AAPCS64 calling convention, the
//! allocator's eviction policy, and so on); this struct only carries the handful of switches
//! that are genuinely optional extensions or debug aids.

/// Configuration for a [`crate::JitContext`].
#[derive(Clone, Debug)]
pub struct Flags {
    /// When a cross-function call's relocated offset exceeds the ±128 MiB `BL` range,
    /// synthesize an indirect-branch veneer instead of aborting. Off by default, matching
    /// the core's stated behavior of aborting on out-of-range relocations.
    pub synthesize_veneers: bool,

    /// Bracket the code-buffer-to-executable-memory copy with write/execute toggling calls
    /// even on platforms that do not strictly require it. Harmless everywhere, but only
    /// load-bearing on platforms enforcing W^X (notably Apple Silicon); leaving it on by
    /// default keeps the behavior uniform across hosts.
    pub enforce_write_xor_execute: bool,

    /// Run the allocator's vreg/preg bidirectional-pointer consistency checks
    /// (spec invariant: `v.current == p` iff `p.holds == v`) after every opcode. Intended for
    /// development and the test suite; adds a linear scan per opcode so it is off by
    /// default.
    pub debug_assert_allocator_invariants: bool,
}

impl Default for Flags {
    fn default() -> Self {
        Flags {
            synthesize_veneers: false,
            enforce_write_xor_execute: true,
            debug_assert_allocator_invariants: false,
        }
    }
}

impl Flags {
    /// Flags tuned for test runs: turns on the allocator invariant checks.
    pub fn for_tests() -> Self {
        Flags {
            debug_assert_allocator_invariants: true,
            ..Flags::default()
        }
    }
}
