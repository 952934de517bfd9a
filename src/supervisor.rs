//! Supervision of a single tracee, from the one thread allowed to trace it.
//!
//! Linux binds a tracee to the thread which attached to it: every ptrace request for the
//! tracee must come from that thread. So each tracee gets its own supervisor thread, which
//! runs the wait/classify/restart loop for it until it terminates, and talks to the
//! coordinator only by message passing.
//!
//! New children are auto-attached to the thread of their parent by the kernel. The parent's
//! supervisor hands them off: it parks the child with a queued `SIGSTOP`, detaches, and
//! reports the child to the coordinator, which starts a new supervisor that seizes the parked
//! child from its own thread.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::mem;
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::Command;
use std::ptr;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options, Request, RequestType};
use nix::sys::signal;
use nix::unistd;
use tracing::{debug, info, trace, warn};

use crate::abi::{self, Abi};
use crate::error::{internal_error, Error, Result, ResultExt};
use crate::event::{Pid, TraceEvent};
use crate::signal::Signal;
use crate::syscall::SyscallRecord;

/// Identifies a supervisor to the coordinator. Stable across tid changes of its tracee.
pub(crate) type Serial = u64;

/// How a supervisor acquires its tracee.
#[derive(Debug)]
pub(crate) enum Launch {
    /// Spawn the command with a pre-exec `PTRACE_TRACEME` request.
    Spawn(Command),

    /// Seize a child parked by the supervisor of its parent.
    Adopt(Pid),
}

/// Supervisor-to-coordinator messages.
#[derive(Debug)]
pub(crate) enum Message {
    /// The root tracee was spawned.
    Spawned { serial: Serial, pid: Pid },

    /// An event to dispatch. Answered with a [`Verdict`].
    Event { serial: Serial, event: TraceEvent },

    /// A `NewChild` event whose child is parked, pending adoption. Answered with a [`Verdict`].
    Adopt { serial: Serial, event: TraceEvent },

    /// The tracee changed its tid, by exec-ing off the thread group leader.
    Retarget { serial: Serial, pid: Pid },

    /// The tracee disappeared without a termination status.
    Vanished { serial: Serial },

    /// The supervisor failed, and its tracee was killed.
    Fault { serial: Serial, error: Error },
}

/// Coordinator-to-supervisor messages.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Verdict {
    /// Answers an event: restart the tracee.
    Resume,

    /// Answers an event: kill the tracee.
    Kill,

    /// Unsolicited. Another thread of the tracee's group exec'd, and took over its tid. The
    /// tracee is gone, and the supervisor must stop waiting for it.
    Retire,
}

/// The supervisor end of the channels to the coordinator.
#[derive(Debug)]
pub(crate) struct Link {
    pub serial: Serial,
    pub messages: Sender<Message>,
    pub verdicts: Receiver<Verdict>,
}

impl Link {
    fn send(&self, message: Message) -> Result<()> {
        self.messages
            .send(message)
            .map_err(|_| Error::Internal("coordinator hung up".into()))
    }

    fn recv(&self) -> Result<Verdict> {
        self.verdicts
            .recv()
            .map_err(|_| Error::Internal("coordinator hung up".into()))
    }

    fn try_recv(&self) -> Result<Option<Verdict>> {
        match self.verdicts.try_recv() {
            Ok(verdict) => Ok(Some(verdict)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Internal("coordinator hung up".into())),
        }
    }
}

/// Start a supervisor thread for the tracee described by `launch`.
pub(crate) fn spawn(launch: Launch, link: Link, options: Options) -> io::Result<JoinHandle<()>> {
    let name = format!("supervisor-{}", link.serial);

    thread::Builder::new().name(name).spawn(move || {
        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            Supervisor::launch(launch, &link, options).and_then(|mut supervisor| supervisor.run())
        }))
        .unwrap_or_else(|_| Err(Error::Internal("supervisor panicked".into())));

        if let Err(error) = res {
            warn!(serial = link.serial, %error, "supervisor fault");

            // The coordinator may already be gone, in which case there is no one to tell.
            let _ = link.send(Message::Fault { serial: link.serial, error });
        }
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum State {
    // Self-attached, via `spawn()` with a pre-exec `TRACEME` request. Expecting the `SIGTRAP`
    // of its `execve()`.
    Spawned,

    // Attached with options set. Inside a syscall iff a syscall is pending.
    Running,

    // Exited, killed, or vanished, and reaped.
    Terminated,
}

/// Options required for the supervisor state machine.
/// These are:
/// - [`PTRACE_O_TRACESYSGOOD`](Options::PTRACE_O_TRACESYSGOOD), to tell syscall-stops from
///   `SIGTRAP` deliveries
/// - [`PTRACE_O_TRACEEXEC`](Options::PTRACE_O_TRACEEXEC), which suppresses the legacy
///   post-exec `SIGTRAP`
/// - [`PTRACE_O_EXITKILL`](Options::PTRACE_O_EXITKILL), so tracees die with their
///   supervisor thread instead of running on untraced
pub const REQUIRED_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACESYSGOOD)
    .union(Options::PTRACE_O_TRACEEXEC)
    .union(Options::PTRACE_O_EXITKILL);

/// Options which make the kernel auto-attach new children and report them as ptrace-events.
pub const FOLLOW_OPTIONS: Options = Options::empty()
    .union(Options::PTRACE_O_TRACEFORK)
    .union(Options::PTRACE_O_TRACEVFORK)
    .union(Options::PTRACE_O_TRACECLONE);

// Only wait on tasks of this thread, be they threads or processes.
const WAIT_FLAGS: libc::c_int = libc::__WALL | libc::__WNOTHREAD;

// How long handoff waits for a parked child to stop before seizing it regardless.
const PARK_TIMEOUT: Duration = Duration::from_secs(1);

/// A decoded wait status.
///
/// Signals are kept as raw numbers, so that stops and deaths by real-time signals decode too.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Status {
    Exited(Pid, i32),
    Signaled(Pid, Signal, bool),

    /// Signal-delivery-stop, or group-stop of a tracee which wasn't seized.
    Stopped(Pid, Signal),

    PtraceEvent(Pid, Signal, libc::c_int),
    PtraceSyscall(Pid),
}

impl Status {
    // `None` for `WIFCONTINUED`, which we never ask for.
    fn from_raw(pid: Pid, status: libc::c_int) -> Option<Self> {
        let status = if libc::WIFEXITED(status) {
            Status::Exited(pid, libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            Status::Signaled(pid, Signal::from_raw(libc::WTERMSIG(status)), libc::WCOREDUMP(status))
        } else if libc::WIFSTOPPED(status) {
            let signo = libc::WSTOPSIG(status);

            if signo == libc::SIGTRAP | 0x80 {
                // Set by `PTRACE_O_TRACESYSGOOD`.
                Status::PtraceSyscall(pid)
            } else {
                match status >> 16 {
                    0 => Status::Stopped(pid, Signal::from_raw(signo)),
                    event => Status::PtraceEvent(pid, Signal::from_raw(signo), event),
                }
            }
        } else {
            return None;
        };

        Some(status)
    }

    fn pid(&self) -> Pid {
        match *self {
            Status::Exited(pid, ..) |
            Status::Signaled(pid, ..) |
            Status::Stopped(pid, ..) |
            Status::PtraceEvent(pid, ..) |
            Status::PtraceSyscall(pid) => pid,
        }
    }
}

/// A wait status seen with `WNOWAIT`, and so still pending.
#[derive(Clone, Copy, Debug)]
struct Peeked {
    pid: Pid,
    terminated: bool,
}

struct Supervisor<'l> {
    link: &'l Link,

    pid: Pid,
    state: State,
    options: Options,
    abi: &'static Abi,

    /// Syscall entered but not yet exited, as decoded at syscall-enter.
    pending: Option<SyscallRecord>,

    /// Children reported via `NewChild`.
    children: BTreeSet<Pid>,

    /// Child processes stopped by parking, whose `CLD_STOPPED` notification is yet to arrive.
    parked: BTreeSet<Pid>,

    /// Sender of our own parking signals, as recorded in their `siginfo`.
    tracer: Pid,

    /// Set once the coordinator asked for the tracee to be killed.
    killing: bool,

    /// Set once the coordinator told us another supervisor has taken over our tid.
    retired: bool,
}

impl<'l> Supervisor<'l> {
    fn launch(launch: Launch, link: &'l Link, options: Options) -> Result<Self> {
        let (pid, state) = match launch {
            Launch::Spawn(mut cmd) => {
                // On fork, request `PTRACE_TRACEME`. The tracer is the forking thread: this one.
                unsafe {
                    cmd.pre_exec(|| ptrace::traceme().map_err(|err| io::Error::from_raw_os_error(err as i32)))
                };

                let child = cmd.spawn().map_err(|source| Error::Spawn { source })?;
                let pid = Pid::from_raw(child.id() as i32);

                info!(pid = pid.as_raw(), "spawned tracee");

                (pid, State::Spawned)
            },
            Launch::Adopt(pid) => {
                match ptrace::seize(pid, options) {
                    Ok(()) => {
                        info!(pid = pid.as_raw(), "seized parked tracee");

                        (pid, State::Running)
                    },
                    Err(Errno::ESRCH) => {
                        // Killed while parked. Its death is reported to its parent, not to us.
                        info!(pid = pid.as_raw(), "parked tracee died before adoption");

                        (pid, State::Terminated)
                    },
                    Err(source) => return Err(Error::Attach { pid, source }),
                }
            },
        };

        let supervisor = Self {
            link,
            pid,
            state,
            options,
            abi: abi::native(),
            pending: None,
            children: BTreeSet::new(),
            parked: BTreeSet::new(),
            tracer: unistd::getpid(),
            killing: false,
            retired: false,
        };

        match state {
            State::Spawned => link.send(Message::Spawned { serial: link.serial, pid })?,
            State::Terminated => link.send(Message::Vanished { serial: link.serial })?,
            State::Running => {},
        }

        Ok(supervisor)
    }

    fn run(&mut self) -> Result<()> {
        while self.state != State::Terminated {
            let status = match self.wait()? {
                Some(status) => status,
                None => {
                    self.vanish()?;
                    break;
                },
            };

            match self.handle(status) {
                Err(err) if err.tracee_died() => {
                    // Killed while stopped. The next wait will report how it terminated.
                    debug!(pid = self.pid.as_raw(), %err, "tracee died mid-stop");
                },
                res => res?,
            }
        }

        Ok(())
    }

    // Wait for the next state change of our tracee.
    //
    // Returns `None` if the tracee is gone without a termination status. This happens to a
    // thread group leader when another thread of its group execs and takes over its tid.
    fn wait(&mut self) -> Result<Option<Status>> {
        // An exec off the thread group leader changes our tid. The old one is then unknown to
        // wait, and the new one can only be found by waiting on any tracee of this thread.
        let mut target = Some(self.pid);

        loop {
            if self.poll_retired()? {
                return Ok(None);
            }

            let peeked = match peek(target) {
                Ok(peeked) => peeked,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) if target.is_some() => {
                    debug!(pid = self.pid.as_raw(), "tracee unknown to wait, waiting on any");
                    target = None;
                    continue;
                },
                Err(Errno::ECHILD) => return Ok(None),
                Err(source) => return Err(Error::Wait { pid: self.pid, source }),
            };

            // The thread which spawned the root tracee is also its parent. If another thread
            // of the root execs, it takes over the tid of the root, and is then a plain child
            // of this thread that our waits can see, though another supervisor traces it.
            // Never consume a status which isn't ours.
            if self.poll_retired()? {
                return Ok(None);
            }

            if !peeked.terminated && !is_tracer_of(peeked.pid)? {
                trace!(pid = self.pid.as_raw(), other = peeked.pid.as_raw(), "stop of task traced elsewhere");
                thread::yield_now();
                continue;
            }

            let status = match reap(peeked.pid) {
                Ok(status) => status,
                Err(source) => return Err(Error::Wait { pid: peeked.pid, source }),
            };

            trace!(pid = self.pid.as_raw(), ?status, "wait status");

            return Ok(Some(status));
        }
    }

    fn handle(&mut self, status: Status) -> Result<()> {
        let exec = matches!(status, Status::PtraceEvent(_, _, libc::PTRACE_EVENT_EXEC));

        if status.pid() != self.pid && !exec {
            internal_error!(format!("wait status for pid = {} is not ours: {:?}", status.pid(), status));
        }

        match status {
            Status::Exited(pid, exit_code) => {
                self.terminate(TraceEvent::Exit { pid, exit_code })
            },
            Status::Signaled(pid, signal, core_dumped) => {
                self.terminate(TraceEvent::SignalExit { pid, signal, core_dumped })
            },
            Status::Stopped(_, signal) => {
                self.on_signal_stop(signal)
            },
            Status::PtraceEvent(pid, _signal, code) => {
                self.on_ptrace_event(pid, code)
            },
            // Syscall-enter-stop and syscall-exit-stop are indistinguishable from each other by
            // the tracer, so we track whether we are inside a syscall ourselves. From the
            // manual:
            //
            //     In general, a syscall-enter-stop is always followed by syscall-exit-stop,
            //     PTRACE_EVENT stop, or the tracee's death; no other kinds of ptrace-stop can
            //     occur in between.
            //
            // A signal-delivery-stop never happens between syscall-enter-stop and
            // syscall-exit-stop, so `pending` can't be confused by signals.
            Status::PtraceSyscall(_) => {
                self.on_syscall_stop()
            },
        }
    }

    fn on_syscall_stop(&mut self) -> Result<()> {
        let regs = abi::read_registers(self.pid).died_if_esrch(self.pid)?;

        let event = match self.pending.take() {
            None => {
                let syscall = self.abi.decode_enter(&regs);
                self.pending = Some(syscall);

                TraceEvent::SyscallEnter { pid: self.pid, syscall }
            },
            Some(entered) => {
                let syscall = entered.complete(self.abi.decode_exit(&regs));

                TraceEvent::SyscallExit { pid: self.pid, syscall }
            },
        };

        self.emit(event)?;
        self.restart(None)
    }

    fn on_signal_stop(&mut self, signal: Signal) -> Result<()> {
        if self.state == State::Spawned && signal == Signal::SIGTRAP {
            // A `SIGTRAP` for a tracee in the `Spawned` state means it has returned from a
            // successful `execve()` after requesting `PTRACE_TRACEME`. This is the first
            // stop of the root tracee: set options, which are inherited by auto-attached
            // children, and start tracing syscalls.
            ptrace::setoptions(self.pid, self.options).died_if_esrch(self.pid)?;
            self.state = State::Running;

            debug!(pid = self.pid.as_raw(), "root tracee stopped at exec");

            return self.restart(None);
        }

        if is_group_stop(self.pid, signal)? {
            // Not a signal delivery: the signal was already delivered to some thread of the
            // group. Restart without injecting anything.
            debug!(pid = self.pid.as_raw(), %signal, "group-stop");
            return self.restart(None);
        }

        if signal == Signal::SIGSTOP && self.is_parking_stop()? {
            // Our parking `SIGSTOP`, still pending when we seized: a group-stop of another
            // thread got to the tracee first. Suppress it.
            debug!(pid = self.pid.as_raw(), "late parking `SIGSTOP`");
            return self.restart(None);
        }

        if signal == Signal::SIGCHLD && self.is_parking_notice()? {
            // Hidden from callbacks, but still delivered: a pending `SIGCHLD` absorbs any
            // later one, such as for the exit of the same child.
            debug!(pid = self.pid.as_raw(), "`SIGCHLD` for parked child");
            return self.restart(Some(signal));
        }

        self.emit(TraceEvent::SignalStop { pid: self.pid, signal })?;

        // Re-inject, so that the tracee sees every signal it was sent.
        self.restart(Some(signal))
    }

    fn on_ptrace_event(&mut self, pid: Pid, code: i32) -> Result<()> {
        match code {
            libc::PTRACE_EVENT_FORK |
            libc::PTRACE_EVENT_VFORK |
            libc::PTRACE_EVENT_CLONE => {
                let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
                let child = Pid::from_raw(evt_data as u32 as i32);

                self.hand_off(child)?;
                self.restart(None)
            },
            libc::PTRACE_EVENT_EXEC => {
                if pid != self.pid {
                    // We exec'd off the thread group leader, and now have its tid. In this
                    // context, `PTRACE_GETEVENTMSG` returns our former tid.
                    let evt_data = ptrace::getevent(pid).died_if_esrch(pid)?;
                    let old = Pid::from_raw(evt_data as u32 as i32);

                    if old != self.pid {
                        internal_error!(format!("exec event for pid = {} from unknown tid = {}", pid, old));
                    }

                    info!(old = old.as_raw(), new = pid.as_raw(), "tracee changed tid on exec");

                    self.pid = pid;
                    self.link.send(Message::Retarget { serial: self.link.serial, pid })?;
                }

                // Still inside `execve()`: the syscall-exit-stop follows.
                self.restart(None)
            },
            libc::PTRACE_EVENT_STOP => {
                // For a seized tracee, this is either the first stop after we seized it while
                // parked, or a group-stop. Restarting lets it run in both cases.
                self.restart(None)
            },
            _ => {
                // All other events are disabled by our options.
                internal_error!(format!("unexpected ptrace-event-stop code = {}", code))
            },
        }
    }

    // Pass an auto-attached child on to a new supervisor.
    fn hand_off(&mut self, child: Pid) -> Result<()> {
        self.children.insert(child);

        // The child starts out attached to this thread, with an attach-stop pending. Collect it,
        // so we know the child is stopped before we detach.
        let status = reap(child).map_err(|source| Error::Wait { pid: child, source })?;

        let event = TraceEvent::NewChild { pid: self.pid, child };

        match status {
            Status::Stopped(_, signal) => {
                // Any signal other than the attach `SIGSTOP` is real, and must stay pending.
                let pending = if signal == Signal::SIGSTOP { None } else { Some(signal) };

                self.park(child, pending)?;
                self.adopt(event, child)
            },
            Status::PtraceEvent(_, _, libc::PTRACE_EVENT_STOP) => {
                // We were seized ourselves, so our children are reported as seized.
                self.park(child, None)?;
                self.adopt(event, child)
            },
            Status::Exited(_, exit_code) => {
                self.emit(event)?;
                self.emit(TraceEvent::Exit { pid: child, exit_code })
            },
            Status::Signaled(_, signal, core_dumped) => {
                self.emit(event)?;
                self.emit(TraceEvent::SignalExit { pid: child, signal, core_dumped })
            },
            status => {
                let _ = signal::kill(child, signal::Signal::SIGKILL);
                internal_error!(format!("unexpected first stop of child = {}: {:?}", child, status))
            },
        }
    }

    // Stop `child` outside of ptrace, and detach from it.
    //
    // A thread-directed `SIGSTOP` is queued before detaching. The child takes it on its way
    // back to user mode, so it never executes an instruction untraced. We wait until it has,
    // so that the `CLD_STOPPED` notification of a new process is sent to its parent, our
    // tracee, before we restart the parent.
    fn park(&mut self, child: Pid, pending: Option<Signal>) -> Result<()> {
        // SAFETY: `tkill` takes no pointers.
        let res = unsafe { libc::syscall(libc::SYS_tkill, child.as_raw(), libc::SIGSTOP) };
        Errno::result(res).died_if_esrch(child)?;

        restart_request(Request::PTRACE_DETACH, child, pending).died_if_esrch(child)?;

        match wait_parked(child) {
            Some(ParkedTask { stopped: true, tgid }) if tgid == child => {
                self.parked.insert(child);
            },
            Some(ParkedTask { stopped: false, .. }) => {
                // The new supervisor will see and suppress the `SIGSTOP`.
                warn!(pid = self.pid.as_raw(), child = child.as_raw(), "parked child did not stop in time");
            },
            // A parked thread stops its whole group, whose parent isn't our tracee.
            Some(_) |
            None => {},
        }

        debug!(pid = self.pid.as_raw(), child = child.as_raw(), "parked child");

        Ok(())
    }

    fn adopt(&mut self, event: TraceEvent, child: Pid) -> Result<()> {
        let verdict = self
            .link
            .send(Message::Adopt { serial: self.link.serial, event })
            .and_then(|()| self.verdict());

        match verdict {
            Ok(Verdict::Kill) => self.kill(),
            Ok(_) => {},
            Err(err) => {
                // No one will adopt the child, so don't leave it parked.
                let _ = signal::kill(child, signal::Signal::SIGKILL);
                return Err(err);
            },
        }

        Ok(())
    }

    // Check if the `SIGSTOP` we are stopped for was queued by some supervisor, to park us.
    fn is_parking_stop(&self) -> Result<bool> {
        let info = ptrace::getsiginfo(self.pid).died_if_esrch(self.pid)?;

        // SAFETY: `si_pid` is initialized for signals sent by `tkill()`.
        let sender = unsafe { info.si_pid() };

        Ok(info.si_code == libc::SI_TKILL && sender == self.tracer.as_raw())
    }

    // Check if the `SIGCHLD` we are stopped for only reports that a parked child stopped.
    fn is_parking_notice(&mut self) -> Result<bool> {
        if self.parked.is_empty() {
            return Ok(false);
        }

        let info = ptrace::getsiginfo(self.pid).died_if_esrch(self.pid)?;

        if info.si_code != libc::CLD_STOPPED {
            return Ok(false);
        }

        // SAFETY: `si_pid` and `si_status` are initialized for `SIGCHLD`.
        let (child, status) = unsafe { (Pid::from_raw(info.si_pid()), info.si_status()) };

        Ok(status == libc::SIGSTOP && self.parked.remove(&child))
    }

    // Wait for the answer to the event or adoption we just sent.
    fn verdict(&mut self) -> Result<Verdict> {
        loop {
            match self.link.recv()? {
                Verdict::Retire => self.retire(),
                verdict => return Ok(verdict),
            }
        }
    }

    // Check for an unsolicited retirement notice.
    fn poll_retired(&mut self) -> Result<bool> {
        while let Some(verdict) = self.link.try_recv()? {
            match verdict {
                Verdict::Retire => self.retire(),
                verdict => internal_error!(format!("unsolicited verdict = {:?}", verdict)),
            }
        }

        Ok(self.retired)
    }

    fn retire(&mut self) {
        info!(pid = self.pid.as_raw(), "tid taken over by exec of another thread");

        self.retired = true;
    }

    fn emit(&mut self, event: TraceEvent) -> Result<()> {
        trace!(?event, "emitting event");

        self.link.send(Message::Event { serial: self.link.serial, event })?;

        if self.verdict()? == Verdict::Kill {
            self.kill();
        }

        Ok(())
    }

    fn terminate(&mut self, event: TraceEvent) -> Result<()> {
        self.state = State::Terminated;

        if let Some(syscall) = self.pending.take() {
            debug!(pid = self.pid.as_raw(), sysno = syscall.sysno, "tracee terminated inside syscall");
        }

        info!(pid = self.pid.as_raw(), children = ?self.children, "tracee terminated");

        self.emit(event)
    }

    fn vanish(&mut self) -> Result<()> {
        info!(pid = self.pid.as_raw(), retired = self.retired, "tracee vanished");

        // Nothing left to kill: the tid may already belong to another supervisor's tracee.
        self.state = State::Terminated;
        self.link.send(Message::Vanished { serial: self.link.serial })
    }

    fn kill(&mut self) {
        if self.killing {
            return;
        }

        debug!(pid = self.pid.as_raw(), "killing tracee");

        self.killing = true;
        let _ = signal::kill(self.pid, signal::Signal::SIGKILL);
    }

    // Resume the stopped tracee until its next syscall-stop, delivering `signal`, if any.
    fn restart(&self, signal: Option<Signal>) -> Result<()> {
        match restart_request(Request::PTRACE_SYSCALL, self.pid, signal) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => {
                // Killed while stopped. This isn't a desync: the next wait reports the death.
                debug!(pid = self.pid.as_raw(), "tracee died before restart");
                Ok(())
            },
            Err(_) if self.killing => Ok(()),
            Err(source) => Err(Error::Restart { pid: self.pid, signal, source }),
        }
    }
}

impl Drop for Supervisor<'_> {
    // Never leave a tracee stopped without a tracer: kill and reap it.
    fn drop(&mut self) {
        if self.state == State::Terminated {
            return;
        }

        warn!(pid = self.pid.as_raw(), "supervisor exiting with live tracee, killing it");

        let _ = signal::kill(self.pid, signal::Signal::SIGKILL);

        loop {
            match reap(self.pid) {
                Ok(Status::Exited(..)) | Ok(Status::Signaled(..)) => break,
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(_) => break,
            }
        }

        self.state = State::Terminated;
    }
}

// Peek at the next wait status of `pid`, or of any task this thread waits on, leaving it to
// be consumed.
fn peek(pid: Option<Pid>) -> nix::Result<Peeked> {
    let (idtype, id) = match pid {
        Some(pid) => (libc::P_PID, pid.as_raw() as libc::id_t),
        None => (libc::P_ALL, 0),
    };

    let flags = libc::WEXITED | libc::WSTOPPED | libc::WNOWAIT | WAIT_FLAGS;

    // SAFETY: all-zero is a valid `siginfo_t`.
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };

    // SAFETY: the kernel writes a `siginfo_t` to `info`, and nothing else.
    let res = unsafe { libc::waitid(idtype, id, &mut info, flags) };
    Errno::result(res)?;

    // SAFETY: `si_pid` is initialized by a successful `waitid()`.
    let pid = Pid::from_raw(unsafe { info.si_pid() });
    let terminated = matches!(info.si_code, libc::CLD_EXITED | libc::CLD_KILLED | libc::CLD_DUMPED);

    Ok(Peeked { pid, terminated })
}

// Wait for, and consume, the next wait status of `pid`.
fn reap(pid: Pid) -> nix::Result<Status> {
    loop {
        let mut status: libc::c_int = 0;

        // SAFETY: the kernel writes the status to `status`, and nothing else.
        let res = unsafe { libc::waitpid(pid.as_raw(), &mut status, WAIT_FLAGS) };

        match Errno::result(res) {
            Ok(pid) => {
                // We never wait with `WCONTINUED`.
                return Status::from_raw(Pid::from_raw(pid), status).ok_or(Errno::EINVAL);
            },
            Err(Errno::EINTR) => continue,
            Err(err) => return Err(err),
        }
    }
}

// Check if `pid` is in a ptrace-stop for this thread.
fn is_tracer_of(pid: Pid) -> Result<bool> {
    match ptrace::getevent(pid) {
        Ok(_) => Ok(true),
        // Traced by another thread, or no longer stopped.
        Err(Errno::ESRCH) => Ok(false),
        Err(err) => Err(err.into()),
    }
}

// Issue a ptrace restart request which may deliver a signal. The signal is passed raw, so
// real-time signals can be delivered too.
fn restart_request(request: Request, pid: Pid, signal: Option<Signal>) -> nix::Result<()> {
    let data = signal.map_or(0, Signal::as_raw) as libc::c_long;

    // SAFETY: restart requests read no memory. The data argument is a signal number.
    let res = unsafe {
        libc::ptrace(
            request as RequestType,
            pid.as_raw(),
            ptr::null_mut::<libc::c_void>(),
            data as *mut libc::c_void,
        )
    };

    Errno::result(res).map(drop)
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct ParkedTask {
    stopped: bool,
    tgid: Pid,
}

// Wait for a parked task to take its `SIGSTOP`. Returns `None` if the task died instead.
fn wait_parked(tid: Pid) -> Option<ParkedTask> {
    let start = Instant::now();

    loop {
        let (state, tgid) = match task_status(tid) {
            Ok(status) => status,
            Err(err) => {
                debug!(pid = tid.as_raw(), %err, "parked task is gone");
                return None;
            },
        };

        match state {
            'T' => return Some(ParkedTask { stopped: true, tgid }),
            'Z' | 'X' => return None,
            _ if start.elapsed() > PARK_TIMEOUT => return Some(ParkedTask { stopped: false, tgid }),
            _ => thread::yield_now(),
        }
    }
}

// Read the scheduling state and thread group id of a task from `/proc/<tid>/status`.
fn task_status(tid: Pid) -> io::Result<(char, Pid)> {
    let status = fs::read_to_string(format!("/proc/{}/status", tid))?;

    let mut state = None;
    let mut tgid = None;

    for line in status.lines() {
        if let Some(value) = line.strip_prefix("State:") {
            state = value.trim().chars().next();
        } else if let Some(value) = line.strip_prefix("Tgid:") {
            tgid = value.trim().parse().ok().map(Pid::from_raw);
        }
    }

    match (state, tgid) {
        (Some(state), Some(tgid)) => Ok((state, tgid)),
        _ => Err(io::Error::new(io::ErrorKind::InvalidData, "malformed task status")),
    }
}

// Check if a wait stop with signal delivery is a group-stop.
//
// Assumes attach-stop has already been ruled out.
fn is_group_stop(pid: Pid, sig: Signal) -> Result<bool> {
    match sig {
        Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
            // Possible group-stop. Check `siginfo` to disambiguate.
            //
            // From the manual:
            //
            //     If PTRACE_GETSIGINFO fails with EINVAL, then it is definitely a
            //     group-stop.  (Other failure codes are possible, such as ESRCH
            //     ("no such process") if a SIGKILL killed the tracee.)
            //
            match ptrace::getsiginfo(pid) {
                Err(Errno::EINVAL) =>
                    Ok(true),
                Err(err) =>
                    Err(err).died_if_esrch(pid),
                Ok(_) =>
                    Ok(false)
            }
        },
        _ => {
            // Definitely not a group-stop.
            //
            // From the manual:
            //
            //     The call can be avoided if the signal is not SIGSTOP, SIGTSTP,
            //     SIGTTIN, or SIGTTOU; only these four signals are stopping signals.
            //     If the tracer sees something else, it can't be a group-stop.
            //
            Ok(false)
        },
    }
}
