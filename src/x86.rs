use crate::abi::{Abi, ErrorConvention};

// Word offsets into `struct user_regs_struct`.
const R10: usize = 7;
const R9: usize = 8;
const R8: usize = 9;
const RAX: usize = 10;
const RDX: usize = 12;
const RSI: usize = 13;
const RDI: usize = 14;
const ORIG_RAX: usize = 15;

/// The x86-64 syscall ABI.
///
/// The kernel stores the syscall number in `orig_rax` and clobbers `rax` with the return
/// value. Only the low 32 bits of `orig_rax` are the syscall number.
pub const X86_64: Abi = Abi {
    name: "x86_64",
    sysno: ORIG_RAX,
    sysno_mask: 0xffff_ffff,
    args: [RDI, RSI, RDX, R10, R8, R9],
    ret: [RAX, RDX],
    errors: ErrorConvention::Negated,
};

/// Read the general purpose registers of a stopped tracee, as words in `user_regs_struct`
/// order.
#[cfg(target_arch = "x86_64")]
pub(crate) fn read_registers(pid: nix::unistd::Pid) -> nix::Result<Vec<u64>> {
    let r = nix::sys::ptrace::getregs(pid)?;

    Ok(vec![
        r.r15, r.r14, r.r13, r.r12, r.rbp, r.rbx, r.r11, r.r10, r.r9, r.r8,
        r.rax, r.rcx, r.rdx, r.rsi, r.rdi, r.orig_rax, r.rip, r.cs, r.eflags, r.rsp,
        r.ss, r.fs_base, r.gs_base, r.ds, r.es, r.fs, r.gs,
    ])
}
