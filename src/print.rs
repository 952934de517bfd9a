//! Human-readable rendering of the event stream.

use std::io::Write;

use crate::error::CallbackError;
use crate::event::TraceEvent;
use crate::pipeline::Callback;
use crate::signal::signal_string;
use crate::syscall::SyscallRecord;
use crate::task::Task;

/// Callback which writes one line per event to `out`.
#[derive(Debug)]
pub struct Printer<W> {
    out: W,
}

impl<W: Write> Printer<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> Callback for Printer<W> {
    fn apply(&mut self, _task: &Task, event: &TraceEvent) -> Result<(), CallbackError> {
        writeln!(self.out, "{}", format_event(event))?;
        Ok(())
    }
}

/// Format `event` as a single line, without a trailing newline.
pub fn format_event(event: &TraceEvent) -> String {
    match event {
        TraceEvent::SyscallEnter { pid, syscall } => {
            format!("PID {} {} ...", pid, format_call(syscall))
        },
        TraceEvent::SyscallExit { pid, syscall } => {
            let ret = match syscall.errno {
                Some(errno) => format!("{} {:?} ({})", syscall.ret.int64(), errno, errno.desc()),
                None => format!("{:#x}", syscall.ret.raw()),
            };
            format!("PID {} ... {} = {}", pid, format_call(syscall), ret)
        },
        TraceEvent::SignalStop { pid, signal } => {
            format!("PID {} got signal {}", pid, signal_string(signal.as_raw()))
        },
        TraceEvent::SignalExit { pid, signal, core_dumped } => {
            let core = if *core_dumped { " (core dumped)" } else { "" };
            format!("PID {} exited from signal {}{}", pid, signal_string(signal.as_raw()), core)
        },
        TraceEvent::Exit { pid, exit_code } => {
            format!("PID {} exited with code {}", pid, exit_code)
        },
        TraceEvent::NewChild { pid, child } => {
            format!("PID {} spawned new child {}", pid, child)
        },
    }
}

fn format_call(syscall: &SyscallRecord) -> String {
    let args: Vec<String> = syscall.args.iter().map(|arg| format!("{:?}", arg)).collect();

    match syscall.name() {
        Some(name) => format!("{}({})", name, args.join(", ")),
        None => format!("syscall_{}({})", syscall.sysno, args.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::event::Pid;
    use crate::signal::Signal;
    use crate::syscall::{Return, SyscallArg};

    fn write_call() -> SyscallRecord {
        let mut args = [SyscallArg::default(); 6];
        args[0] = SyscallArg::new(1);
        args[1] = SyscallArg::new(0x1000);
        args[2] = SyscallArg::new(6);

        SyscallRecord::new(libc::SYS_write, args)
    }

    #[test]
    fn test_format_syscalls() {
        let pid = Pid::from_raw(42);
        let enter = write_call();

        assert_eq!(
            format_event(&TraceEvent::SyscallEnter { pid, syscall: enter }),
            "PID 42 write(0x1, 0x1000, 0x6, 0x0, 0x0, 0x0) ...",
        );

        let exit = enter.complete(Return { ret: SyscallArg::new(6), ..Return::default() });
        assert_eq!(
            format_event(&TraceEvent::SyscallExit { pid, syscall: exit }),
            "PID 42 ... write(0x1, 0x1000, 0x6, 0x0, 0x0, 0x0) = 0x6",
        );

        let failed = enter.complete(Return {
            ret: SyscallArg::new(-(libc::EBADF as i64) as u64),
            ret2: SyscallArg::default(),
            errno: Some(Errno::EBADF),
        });
        assert_eq!(
            format_event(&TraceEvent::SyscallExit { pid, syscall: failed }),
            format!("PID 42 ... write(0x1, 0x1000, 0x6, 0x0, 0x0, 0x0) = -9 EBADF ({})", Errno::EBADF.desc()),
        );
    }

    #[test]
    fn test_format_unknown_syscall() {
        let syscall = SyscallRecord::new(100_000, Default::default());
        let line = format_event(&TraceEvent::SyscallEnter { pid: Pid::from_raw(1), syscall });

        assert!(line.starts_with("PID 1 syscall_100000("));
    }

    #[test]
    fn test_format_lifecycle() {
        let pid = Pid::from_raw(7);

        assert_eq!(
            format_event(&TraceEvent::SignalStop { pid, signal: Signal::SIGINT }),
            "PID 7 got signal SIGINT (2)",
        );

        let rt = Signal::from_raw(libc::SIGRTMIN() + 2);
        assert_eq!(
            format_event(&TraceEvent::SignalStop { pid, signal: rt }),
            format!("PID 7 got signal SIGRTMIN+2 ({})", rt.as_raw()),
        );
        assert_eq!(
            format_event(&TraceEvent::SignalExit { pid, signal: Signal::SIGKILL, core_dumped: false }),
            "PID 7 exited from signal SIGKILL (9)",
        );
        assert_eq!(
            format_event(&TraceEvent::Exit { pid, exit_code: 3 }),
            "PID 7 exited with code 3",
        );
        assert_eq!(
            format_event(&TraceEvent::NewChild { pid, child: Pid::from_raw(8) }),
            "PID 7 spawned new child 8",
        );
    }

    #[test]
    fn test_printer_writes_lines() {
        let mut printer = Printer::new(Vec::new());
        let pid = Pid::from_raw(7);
        let task = Task::new(pid);

        printer.apply(&task, &TraceEvent::Exit { pid, exit_code: 0 }).unwrap();
        printer.apply(&task, &TraceEvent::Exit { pid, exit_code: 1 }).unwrap();

        let out = String::from_utf8(printer.into_inner()).unwrap();
        assert_eq!(out, "PID 7 exited with code 0\nPID 7 exited with code 1\n");
    }
}
