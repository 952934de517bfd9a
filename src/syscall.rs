//! Normalized, architecture-independent syscall records.

use std::fmt;

use nix::errno::Errno;

/// An untyped syscall argument or return word.
///
/// The kernel ABI carries no type information, so the word is kept raw and interpreted on
/// demand by whoever knows the convention for a given syscall and argument position.
#[derive(Clone, Copy, Default, Eq, Hash, PartialEq)]
pub struct SyscallArg(u64);

impl SyscallArg {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw machine word.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Interpret as a signed integer.
    pub const fn int64(self) -> i64 {
        self.0 as i64
    }

    /// Interpret as a 32-bit signed integer, such as a file descriptor.
    pub const fn int32(self) -> i32 {
        self.0 as i32
    }

    /// Interpret as an address in the tracee.
    pub const fn pointer(self) -> u64 {
        self.0
    }

    /// Interpret as an unsigned size.
    pub const fn size(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for SyscallArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for SyscallArg {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// The return half of a syscall, decoded at syscall-exit.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Return {
    pub ret: SyscallArg,
    pub ret2: SyscallArg,

    /// Set iff the normalized return value is negative.
    pub errno: Option<Errno>,
}

/// A decoded syscall.
///
/// At syscall-enter only `sysno` and `args` are meaningful. At syscall-exit the record also
/// carries the return values.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SyscallRecord {
    pub sysno: i64,
    pub args: [SyscallArg; 6],
    pub ret: SyscallArg,
    pub ret2: SyscallArg,
    pub errno: Option<Errno>,
}

impl SyscallRecord {
    pub fn new(sysno: i64, args: [SyscallArg; 6]) -> Self {
        Self {
            sysno,
            args,
            ret: SyscallArg::default(),
            ret2: SyscallArg::default(),
            errno: None,
        }
    }

    /// Complete an entered syscall with its return values.
    ///
    /// The syscall number and arguments are kept from syscall-enter, since some architectures
    /// clobber the registers holding them by the time of syscall-exit.
    pub fn complete(self, ret: Return) -> Self {
        Self {
            ret: ret.ret,
            ret2: ret.ret2,
            errno: ret.errno,
            ..self
        }
    }

    /// Syscall name, if known on the native architecture.
    pub fn name(&self) -> Option<&'static str> {
        if self.sysno < 0 {
            return None;
        }

        syscalls::Sysno::new(self.sysno as usize).map(|sysno| sysno.name())
    }
}
