use crate::abi::{Abi, ErrorConvention};

/// Word offset of `regs[8]` in `struct user_pt_regs`.
const X8: usize = 8;

/// The AArch64 syscall ABI.
///
/// Defined in [`arch/arm64/include/uapi/asm/ptrace.h`](https://android.googlesource.com/kernel/common/+/refs/heads/android-mainline/arch/arm64/include/uapi/asm/ptrace.h#88),
/// the register set is `regs[31]`, then `sp`, `pc`, and `pstate`. The syscall number is
/// passed in `x8`, which survives the syscall, while `x0` is overwritten by the return value.
pub const AARCH64: Abi = Abi {
    name: "aarch64",
    sysno: X8,
    sysno_mask: u64::MAX,
    args: [0, 1, 2, 3, 4, 5],
    ret: [0, 1],
    errors: ErrorConvention::Negated,
};
