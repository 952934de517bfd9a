//! Signal numbers and their display names.

use std::fmt;

/// A signal number, as reported by the kernel.
///
/// Unlike `nix::sys::signal::Signal`, any number the kernel can deliver is representable,
/// including the real-time signals `SIGRTMIN..=SIGRTMAX`.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Signal(i32);

macro_rules! standard_signals {
    ($($name: ident),* $(,)?) => {
        impl Signal {
            $(
                pub const $name: Signal = Signal(libc::$name);
            )*
        }

        /// Display names of the standard signals, keyed by the native signal number.
        static SIGNALS: &[(libc::c_int, &str)] = &[
            $(
                (libc::$name, stringify!($name)),
            )*
        ];
    };
}

standard_signals! {
    SIGHUP,
    SIGINT,
    SIGQUIT,
    SIGILL,
    SIGTRAP,
    SIGABRT,
    SIGBUS,
    SIGFPE,
    SIGKILL,
    SIGUSR1,
    SIGSEGV,
    SIGUSR2,
    SIGPIPE,
    SIGALRM,
    SIGTERM,
    SIGCHLD,
    SIGCONT,
    SIGSTOP,
    SIGTSTP,
    SIGTTIN,
    SIGTTOU,
    SIGURG,
    SIGXCPU,
    SIGXFSZ,
    SIGVTALRM,
    SIGPROF,
    SIGWINCH,
    SIGIO,
    SIGPWR,
    SIGSYS,
}

impl Signal {
    pub const fn from_raw(signo: i32) -> Self {
        Self(signo)
    }

    pub const fn as_raw(self) -> i32 {
        self.0
    }

    /// The first real-time signal usable by applications, as seen by the C library.
    pub fn rtmin() -> Self {
        Self(libc::SIGRTMIN())
    }

    pub fn rtmax() -> Self {
        Self(libc::SIGRTMAX())
    }

    /// Returns `true` for the real-time signals, including those reserved by the C library.
    pub fn is_realtime(self) -> bool {
        // The kernel's real-time range starts at 32. glibc reserves the first few.
        (32..=libc::SIGRTMAX()).contains(&self.0)
    }

    pub fn name(self) -> Option<&'static str> {
        signal_name(self.0)
    }
}

impl From<nix::sys::signal::Signal> for Signal {
    fn from(signal: nix::sys::signal::Signal) -> Self {
        Self(signal as i32)
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "Signal({})", self.0),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&signal_string(self.0))
    }
}

/// Look up the display name of a signal number.
///
/// Returns `None` for numbers outside the standard set, such as real-time signals.
pub fn signal_name(signo: i32) -> Option<&'static str> {
    SIGNALS
        .iter()
        .find(|(n, _)| *n == signo)
        .map(|(_, name)| *name)
}

/// Format a signal number for display, e.g. `SIGINT (2)`, `SIGRTMIN+2 (36)` or `signal 100`.
pub fn signal_string(signo: i32) -> String {
    if let Some(name) = signal_name(signo) {
        return format!("{} ({})", name, signo);
    }

    let rtmin = libc::SIGRTMIN();

    if (rtmin..=libc::SIGRTMAX()).contains(&signo) {
        match signo - rtmin {
            0 => format!("SIGRTMIN ({})", signo),
            n => format!("SIGRTMIN+{} ({})", n, signo),
        }
    } else {
        format!("signal {}", signo)
    }
}
