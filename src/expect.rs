//! Checking a trace for an ordered sequence of expected events.
//!
//! Expectations are matched in order. An event which doesn't match the next expectation is
//! skipped, so unrelated events may appear between matches.

use std::fmt;
use std::io::Write;
use std::process::Command;

use crate::error::{CallbackError, Error, Result};
use crate::event::TraceEvent;
use crate::pipeline::{Callback, Recorder};
use crate::print::Printer;
use crate::syscall::SyscallRecord;
use crate::task::Task;

/// An event or argument didn't match an expectation. Not fatal: the checker keeps looking.
#[derive(Debug, thiserror::Error)]
#[error("no match: {reason}")]
pub struct NoMatch {
    reason: String,
}

impl NoMatch {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// Some expectations were never met by the trace.
#[derive(Debug, thiserror::Error)]
#[error("expected event not found: {expectation}")]
pub struct Unmet {
    pub expectation: String,
}

fn no_match(reason: impl Into<String>) -> CallbackError {
    Box::new(NoMatch::new(reason))
}

/// Expectation for the syscall argument at some index.
pub trait ArgMatcher: fmt::Debug {
    /// Returns [`NoMatch`] if the argument at `index` doesn't match, or any other error if it
    /// could not be checked.
    fn matches(&self, task: &Task, syscall: &SyscallRecord, index: usize) -> std::result::Result<(), CallbackError>;
}

/// Expect an integer argument.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Int(pub i64);

impl ArgMatcher for Int {
    fn matches(&self, _task: &Task, syscall: &SyscallRecord, index: usize) -> std::result::Result<(), CallbackError> {
        let got = syscall.args[index].int64();

        if got != self.0 {
            return Err(no_match(format!("argument {} is {}, want {}", index, got, self.0)));
        }

        Ok(())
    }
}

/// Expect a buffer pointer at `index`, with its length at `index + 1`, and the buffer to hold
/// exactly these bytes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadWriteBuffer(pub Vec<u8>);

impl ArgMatcher for ReadWriteBuffer {
    fn matches(&self, task: &Task, syscall: &SyscallRecord, index: usize) -> std::result::Result<(), CallbackError> {
        let len = match syscall.args.get(index + 1) {
            Some(arg) => arg.size(),
            None => return Err(format!("no length argument after buffer argument {}", index).into()),
        };

        if len != self.0.len() {
            return Err(no_match(format!("argument {} has length {}, want {}", index, len, self.0.len())));
        }

        let addr = syscall.args[index].pointer();
        let mut got = vec![0; len];

        if let Err(err) = task.read(addr, &mut got) {
            match err.partial_len() {
                Some(read) => {
                    return Err(no_match(format!("argument {} at {:#x}: short read of {} bytes, want {}", index, addr, read, len)));
                },
                None => return Err(Box::new(err)),
            }
        }

        if got != self.0 {
            return Err(no_match(format!(
                "argument {} is {:?}, want {:?}",
                index,
                String::from_utf8_lossy(&got),
                String::from_utf8_lossy(&self.0),
            )));
        }

        Ok(())
    }
}

/// Expectation for a single event.
pub trait Expect: fmt::Debug {
    /// Returns [`NoMatch`] if `event` doesn't match, or any other error to abort the trace.
    fn check(&self, task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError>;
}

/// Expect entry into a syscall, optionally with matching arguments.
#[derive(Debug)]
pub struct SyscallEnter {
    pub sysno: i64,
    pub args: [Option<Box<dyn ArgMatcher>>; 6],
}

impl SyscallEnter {
    pub fn new(sysno: i64) -> Self {
        let args = [None, None, None, None, None, None];

        Self { sysno, args }
    }

    /// Match argument `index` of the syscall with `matcher`.
    ///
    /// # Panics
    ///
    /// If `index` is not a syscall argument index, that is, not less than 6.
    pub fn arg(mut self, index: usize, matcher: impl ArgMatcher + 'static) -> Self {
        assert!(index < self.args.len(), "syscall argument index {} out of range", index);

        self.args[index] = Some(Box::new(matcher));
        self
    }
}

impl Expect for SyscallEnter {
    fn check(&self, task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError> {
        let syscall = match event {
            TraceEvent::SyscallEnter { syscall, .. } => syscall,
            _ => return Err(no_match(format!("event is {}, want syscall-enter", event.kind()))),
        };

        if syscall.sysno != self.sysno {
            return Err(no_match(format!("syscall number is {}, want {}", syscall.sysno, self.sysno)));
        }

        for (index, matcher) in self.args.iter().enumerate() {
            let matcher = match matcher {
                Some(matcher) => matcher,
                None => continue,
            };

            match matcher.matches(task, syscall, index) {
                Ok(()) => {},
                Err(err) if err.is::<NoMatch>() => {
                    return Err(no_match(format!("syscall {}: {}", self.sysno, err)));
                },
                Err(err) => return Err(err),
            }
        }

        Ok(())
    }
}

/// Expect any entry into syscall `sysno`.
pub fn sysno(sysno: i64) -> SyscallEnter {
    SyscallEnter::new(sysno)
}

/// Expect `write(fd, buf, buf.len())`.
pub fn write_enter(fd: i64, buf: &[u8]) -> SyscallEnter {
    SyscallEnter::new(libc::SYS_write as i64)
        .arg(0, Int(fd))
        .arg(1, ReadWriteBuffer(buf.to_vec()))
}

/// Expect `exit_group(status)`.
pub fn exit_group(status: i64) -> SyscallEnter {
    SyscallEnter::new(libc::SYS_exit_group as i64).arg(0, Int(status))
}

/// Callback which matches expectations, in order, against the events it sees.
#[derive(Debug)]
pub struct Checker {
    expectations: Vec<Box<dyn Expect>>,
    matched: usize,
}

impl Checker {
    pub fn new(expectations: Vec<Box<dyn Expect>>) -> Self {
        let matched = 0;

        Self { expectations, matched }
    }

    /// Number of expectations met so far.
    pub fn matched(&self) -> usize {
        self.matched
    }

    /// Fail if any expectation is still unmet.
    pub fn finish(&self) -> std::result::Result<(), Unmet> {
        match self.expectations.get(self.matched) {
            Some(next) => Err(Unmet { expectation: format!("{:?}", next) }),
            None => Ok(()),
        }
    }
}

impl Callback for Checker {
    fn apply(&mut self, task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError> {
        let next = match self.expectations.get(self.matched) {
            Some(next) => next,
            None => return Ok(()),
        };

        match next.check(task, event) {
            Ok(()) => {
                self.matched += 1;
                Ok(())
            },
            Err(err) if err.is::<NoMatch>() => Ok(()),
            Err(err) => Err(err),
        }
    }
}

/// Result of [`trace()`].
#[derive(Debug)]
pub struct Outcome {
    /// Every event of the trace, including those dispatched before a failure.
    pub events: Vec<TraceEvent>,

    /// The trace error, else [`Unmet`] wrapped as [`Error::Callback`] if expectations remain.
    pub result: Result<()>,
}

/// Trace `cmd`, logging each event to `log`, and check the trace against `expectations`.
pub fn trace<W: Write>(log: W, cmd: Command, expectations: Vec<Box<dyn Expect>>) -> Outcome {
    let mut printer = Printer::new(log);
    let mut recorder = Recorder::new();
    let mut checker = Checker::new(expectations);

    let result = {
        let mut callbacks: [&mut dyn Callback; 3] = [&mut printer, &mut recorder, &mut checker];
        crate::trace(cmd, &mut callbacks)
    };

    let result = result.and_then(|()| {
        checker.finish().map_err(|unmet| Error::Callback(Box::new(unmet)))
    });

    Outcome { events: recorder.into_events(), result }
}
