use crate::abi::{Abi, ErrorConvention};

// Word offsets into `struct pt_regs`: `gpr[32]`, then `nip, msr, orig_gpr3, ctr, link, xer,
// ccr`.
const R0: usize = 0;
const R3: usize = 3;
const CCR: usize = 38;

/// Summary overflow bit of condition register field 0.
const CR0_SO: u64 = 0x1000_0000;

/// The 64-bit PowerPC syscall ABI.
///
/// The syscall number is passed in `r0` and arguments in `r3` through `r8`. On failure the
/// kernel sets `CR0.SO` and returns the positive errno in `r3`.
pub const POWERPC64: Abi = Abi {
    name: "powerpc64",
    sysno: R0,
    sysno_mask: u64::MAX,
    args: [R3, R3 + 1, R3 + 2, R3 + 3, R3 + 4, R3 + 5],
    ret: [R3, R3 + 1],
    errors: ErrorConvention::Flag { reg: CCR, mask: CR0_SO },
};
