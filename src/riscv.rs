use crate::abi::{Abi, ErrorConvention};

// Word offsets into `struct user_regs_struct`, which starts with `pc, ra, sp, gp, tp, t0..t2,
// s0, s1`.
const A0: usize = 10;
const A7: usize = 17;

/// The RISC-V 64-bit syscall ABI. The syscall number is passed in `a7`.
pub const RISCV64: Abi = Abi {
    name: "riscv64",
    sysno: A7,
    sysno_mask: u64::MAX,
    args: [A0, A0 + 1, A0 + 2, A0 + 3, A0 + 4, A0 + 5],
    ret: [A0, A0 + 1],
    errors: ErrorConvention::Negated,
};
