//! Trace events, the stream handed to callbacks.

pub use nix::unistd::Pid;

use crate::signal::Signal;
use crate::syscall::SyscallRecord;

/// Something a traced task did, as observed at a ptrace-stop or termination.
///
/// Events for a single pid arrive in the order the kernel reported them. A `SyscallEnter` for
/// a pid is followed by its `SyscallExit` before any other `SyscallEnter` for that pid, unless
/// the task terminates first.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TraceEvent {
    /// The task is about to execute a syscall.
    SyscallEnter { pid: Pid, syscall: SyscallRecord },

    /// The task returned from the syscall of its last `SyscallEnter`.
    SyscallExit { pid: Pid, syscall: SyscallRecord },

    /// A signal is about to be delivered to the task. It is re-injected on restart.
    SignalStop { pid: Pid, signal: Signal },

    /// The task was terminated by a signal.
    SignalExit { pid: Pid, signal: Signal, core_dumped: bool },

    /// The task exited normally.
    ///
    /// `exit_code` is `WEXITSTATUS` of the wait status. The rest of a normal-exit wait status
    /// is fixed, see [`TraceEvent::wait_status()`].
    Exit { pid: Pid, exit_code: i32 },

    /// The task created a new thread or process, which is now also traced.
    NewChild { pid: Pid, child: Pid },
}

impl TraceEvent {
    /// The pid of the task which produced the event. For `NewChild`, this is the parent.
    pub fn pid(&self) -> Pid {
        use TraceEvent::*;

        match *self {
            SyscallEnter { pid, .. } |
            SyscallExit { pid, .. } |
            SignalStop { pid, .. } |
            SignalExit { pid, .. } |
            Exit { pid, .. } |
            NewChild { pid, .. } => pid,
        }
    }

    /// The decoded syscall, for syscall events.
    pub fn syscall(&self) -> Option<&SyscallRecord> {
        match self {
            TraceEvent::SyscallEnter { syscall, .. } |
            TraceEvent::SyscallExit { syscall, .. } => Some(syscall),
            _ => None,
        }
    }

    /// Returns `true` if this is the last event of its pid.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TraceEvent::Exit { .. } | TraceEvent::SignalExit { .. })
    }

    /// The raw wait status of a termination event, as `waitpid(2)` reports it.
    pub fn wait_status(&self) -> Option<i32> {
        match *self {
            TraceEvent::Exit { exit_code, .. } => Some((exit_code & 0xff) << 8),
            TraceEvent::SignalExit { signal, core_dumped, .. } => {
                let core = if core_dumped { 0x80 } else { 0 };
                Some(signal.as_raw() | core)
            },
            _ => None,
        }
    }

    /// Short name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::SyscallEnter { .. } => "syscall-enter",
            TraceEvent::SyscallExit { .. } => "syscall-exit",
            TraceEvent::SignalStop { .. } => "signal-stop",
            TraceEvent::SignalExit { .. } => "signal-exit",
            TraceEvent::Exit { .. } => "exit",
            TraceEvent::NewChild { .. } => "new-child",
        }
    }
}
