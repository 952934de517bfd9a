use std::io;

use nix::errno::Errno;

use crate::event::Pid;
use crate::signal::Signal;


pub type Result<T> = std::result::Result<T, Error>;

/// Error returned by a trace callback. Propagated verbatim by [`crate::trace()`].
pub type CallbackError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not spawn tracee")]
    Spawn {
        source: io::Error,
    },

    #[error("Could not attach to tracee = {pid}")]
    Attach {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not restart tracee = {pid} with signal = {signal:?}")]
    Restart {
        pid: Pid,
        signal: Option<Signal>,
        source: nix::Error,
    },

    #[error("Could not wait on tracee = {pid}")]
    Wait {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Tracee died while stopped, pid = {pid}")]
    TraceeDied {
        pid: Pid,
        source: nix::Error,
    },

    #[error("Could not access memory of pid = {pid} at {addr:#x} ({read} bytes transferred)")]
    Memory {
        pid: Pid,
        addr: u64,
        read: usize,
        source: io::Error,
    },

    #[error(transparent)]
    Callback(CallbackError),

    #[error("Trace cancelled")]
    Cancelled,

    #[error("Trace deadline exceeded")]
    DeadlineExceeded,

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns `true` if the error was caused by the tracee dying while we held it stopped.
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }

    /// For a memory access fault, the number of bytes transferred before the fault.
    pub fn partial_len(&self) -> Option<usize> {
        if let Error::Memory { read, .. } = self {
            Some(*read)
        } else {
            None
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`].
    ///
    /// From `ptrace(2)`, a tracee which is not stopped (or no longer exists) yields `ESRCH`
    /// for any request other than attach, seize, interrupt or kill.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for nix::Result<T> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| {
            if source == Errno::ESRCH {
                Error::TraceeDied { pid, source }
            } else {
                Error::OS(source)
            }
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err(crate::error::Error::Internal($msg.into()))
    };
}

pub(crate) use internal_error;
