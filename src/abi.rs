//! Syscall calling conventions, as decode tables over raw register snapshots.
//!
//! A register snapshot is the sequence of 64-bit words the kernel returns for the
//! `NT_PRSTATUS` register set of the architecture. Each [`Abi`] names which words hold the
//! syscall number, the six arguments, and the two return values. Decoding is total: any
//! snapshot, of any length, decodes to some record.

use std::convert::TryFrom;

use nix::errno::Errno;

use crate::syscall::{Return, SyscallArg, SyscallRecord};

pub use crate::aarch64::AARCH64;
pub use crate::mips::MIPS64;
pub use crate::powerpc::POWERPC64;
pub use crate::riscv::RISCV64;
pub use crate::x86::X86_64;

/// How a failed syscall reports its error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorConvention {
    /// The return register holds `-errno`.
    Negated,

    /// The word at `reg`, masked by `mask`, is nonzero on failure. The return register then
    /// holds the positive errno.
    Flag { reg: usize, mask: u64 },
}

/// Syscall calling convention of one architecture.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Abi {
    pub name: &'static str,

    /// Word holding the syscall number as it was at syscall-enter.
    pub sysno: usize,

    /// Significant bits of the syscall number word.
    pub sysno_mask: u64,

    /// Words holding arguments 0 through 5.
    pub args: [usize; 6],

    /// Words holding the primary and secondary return values.
    pub ret: [usize; 2],

    pub errors: ErrorConvention,
}

impl Abi {
    /// Decode the syscall number and arguments at syscall-enter.
    pub fn decode_enter(&self, regs: &[u64]) -> SyscallRecord {
        let sysno = (word(regs, self.sysno) & self.sysno_mask) as i64;

        let mut args = [SyscallArg::default(); 6];
        for (arg, reg) in args.iter_mut().zip(self.args.iter()) {
            *arg = SyscallArg::new(word(regs, *reg));
        }

        SyscallRecord::new(sysno, args)
    }

    /// Decode the return values at syscall-exit.
    ///
    /// The returned value is normalized so that a negative `ret` always denotes an error, and
    /// `errno` is set exactly in that case.
    pub fn decode_exit(&self, regs: &[u64]) -> Return {
        let raw = word(regs, self.ret[0]);
        let ret2 = SyscallArg::new(word(regs, self.ret[1]));

        let (ret, errno) = match self.errors {
            ErrorConvention::Negated => {
                let signed = raw as i64;
                let errno = if signed < 0 {
                    Some(errno_from_magnitude(signed.unsigned_abs()))
                } else {
                    None
                };
                (raw, errno)
            },
            ErrorConvention::Flag { reg, mask } => {
                if word(regs, reg) & mask != 0 {
                    (raw.wrapping_neg(), Some(errno_from_magnitude(raw)))
                } else {
                    (raw, None)
                }
            },
        };

        let ret = SyscallArg::new(ret);

        Return { ret, ret2, errno }
    }
}

// Out-of-range words read as zero, so that decoding never fails.
fn word(regs: &[u64], index: usize) -> u64 {
    regs.get(index).copied().unwrap_or(0)
}

fn errno_from_magnitude(magnitude: u64) -> Errno {
    match i32::try_from(magnitude) {
        Ok(errno) => Errno::from_i32(errno),
        Err(_) => Errno::UnknownErrno,
    }
}

/// The calling convention of the architecture we were built for.
pub fn native() -> &'static Abi {
    &NATIVE
}

#[cfg(target_arch = "x86_64")]
static NATIVE: Abi = X86_64;

#[cfg(target_arch = "aarch64")]
static NATIVE: Abi = AARCH64;

#[cfg(target_arch = "riscv64")]
static NATIVE: Abi = RISCV64;

#[cfg(target_arch = "mips64")]
static NATIVE: Abi = MIPS64;

#[cfg(target_arch = "powerpc64")]
static NATIVE: Abi = POWERPC64;

#[cfg(not(any(
    target_arch = "x86_64",
    target_arch = "aarch64",
    target_arch = "riscv64",
    target_arch = "mips64",
    target_arch = "powerpc64",
)))]
compile_error!("unsupported target architecture");

#[cfg(target_arch = "x86_64")]
pub(crate) use crate::x86::read_registers;

#[cfg(not(target_arch = "x86_64"))]
pub(crate) use regset::read_registers;

#[cfg(not(target_arch = "x86_64"))]
mod regset {
    use nix::errno::Errno;
    use nix::unistd::Pid;

    /// Linux constant defined in `include/uapi/linux/elf.h`.
    const NT_PRSTATUS: libc::c_int = 0x1;

    /// Upper bound on the size of any supported `NT_PRSTATUS` register set, in words.
    const MAX_WORDS: usize = 64;

    /// Read the general purpose registers of a stopped tracee via `PTRACE_GETREGSET`.
    pub(crate) fn read_registers(pid: Pid) -> nix::Result<Vec<u64>> {
        let mut words = [0u64; MAX_WORDS];
        let mut iov = libc::iovec {
            iov_base: words.as_mut_ptr() as *mut libc::c_void,
            iov_len: std::mem::size_of_val(&words),
        };

        // SAFETY: the kernel writes at most `iov_len` bytes into `words`, and shrinks
        // `iov_len` to the size of the register set.
        let res = unsafe {
            libc::ptrace(
                libc::PTRACE_GETREGSET,
                pid.as_raw(),
                NT_PRSTATUS,
                &mut iov as *mut _ as *mut libc::c_void,
            )
        };

        Errno::result(res)?;

        let len = iov.iov_len / std::mem::size_of::<u64>();

        Ok(words[..len].to_vec())
    }
}
