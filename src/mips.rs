use crate::abi::{Abi, ErrorConvention};

// Word offsets of general purpose registers in the n64 `NT_PRSTATUS` set.
const V0: usize = 2;
const V1: usize = 3;
const A0: usize = 4;
const A3: usize = 7;

/// The MIPS n64 syscall ABI.
///
/// The syscall number is passed in `v0`, which is also the return register, so it only
/// survives in the record cached at syscall-enter. On failure the kernel sets `a3` and
/// returns the positive errno in `v0`.
pub const MIPS64: Abi = Abi {
    name: "mips64",
    sysno: V0,
    sysno_mask: u64::MAX,
    args: [A0, A0 + 1, A0 + 2, A3, A3 + 1, A3 + 2],
    ret: [V0, V1],
    errors: ErrorConvention::Flag { reg: A3, mask: u64::MAX },
};
