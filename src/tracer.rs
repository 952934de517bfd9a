//! Tracing a command and its descendants to completion.

use std::collections::BTreeMap;
use std::mem;
use std::process::Command;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{self as channel, select, Receiver, Sender};
use nix::sys::ptrace::Options;
use nix::sys::signal;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::event::{Pid, TraceEvent};
use crate::pipeline::{Callback, Pipeline};
use crate::supervisor::{self, Launch, Link, Message, Serial, Verdict};
use crate::task::Task;

pub use crate::supervisor::{FOLLOW_OPTIONS, REQUIRED_OPTIONS};

// How long an aborted trace waits for supervisors to reap their killed tracees.
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Trace `cmd` with default configuration. See [`Tracer::trace()`].
pub fn trace(cmd: Command, callbacks: &mut [&mut dyn Callback]) -> Result<()> {
    Tracer::new().trace(cmd, callbacks)
}

/// Configures and runs traces.
///
/// ```no_run
/// use std::process::Command;
/// use std::time::Duration;
///
/// use systrace::{Recorder, Tracer};
///
/// let mut recorder = Recorder::new();
///
/// Tracer::new()
///     .deadline(Duration::from_secs(10))
///     .trace(Command::new("true"), &mut [&mut recorder])?;
///
/// println!("{:?}", recorder.events());
/// # Ok::<(), systrace::Error>(())
/// ```
#[derive(Debug)]
pub struct Tracer {
    follow_children: bool,
    deadline: Option<Duration>,

    // The tracer keeps its own sender, so the channel never disconnects.
    cancel_tx: Sender<()>,
    cancel_rx: Receiver<()>,
}

impl Default for Tracer {
    fn default() -> Self {
        let (cancel_tx, cancel_rx) = channel::bounded(1);

        Self {
            follow_children: true,
            deadline: None,
            cancel_tx,
            cancel_rx,
        }
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Trace new threads and processes created by tracees. Defaults to `true`.
    ///
    /// When disabled, children run untraced and no `NewChild` events are produced.
    pub fn follow_children(mut self, follow: bool) -> Self {
        self.follow_children = follow;
        self
    }

    /// Kill all tracees and fail with [`Error::DeadlineExceeded`] if a trace runs longer than
    /// `deadline`.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Handle for cancelling traces run by this tracer, from any thread.
    ///
    /// A cancellation requested while no trace is running applies to the next one.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle { tx: self.cancel_tx.clone() }
    }

    /// The ptrace options set on every tracee.
    pub fn options(&self) -> Options {
        if self.follow_children {
            REQUIRED_OPTIONS | FOLLOW_OPTIONS
        } else {
            REQUIRED_OPTIONS
        }
    }

    /// Spawn `cmd` as a tracee, and run the trace until every tracee has terminated.
    ///
    /// Each event is passed to every callback, in order, on the calling thread. Returns the
    /// first error: a callback error, a ptrace failure, cancellation, or an exceeded deadline.
    /// On error, all remaining tracees are killed. Supervisors which fail to reap theirs
    /// within a grace period are detached, and left to finish in the background.
    pub fn trace(&self, cmd: Command, callbacks: &mut [&mut dyn Callback]) -> Result<()> {
        info!(?cmd, follow_children = self.follow_children, "starting trace");

        let (messages, inbox) = channel::unbounded();
        let mut coordinator = Coordinator::new(Pipeline::new(callbacks), self.options(), messages);

        coordinator.launch(Launch::Spawn(cmd))?;
        coordinator.run(&inbox, &self.cancel_rx, self.deadline)
    }
}

/// Requests cancellation of a running trace.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Sender<()>,
}

impl CancelHandle {
    /// Kill all tracees and make the trace fail with [`Error::Cancelled`].
    pub fn cancel(&self) {
        // A full channel means a cancellation is already pending.
        let _ = self.tx.try_send(());
    }
}

struct Entry {
    // Unknown for the root tracee until it has been spawned.
    pid: Option<Pid>,
    verdicts: Sender<Verdict>,
    thread: JoinHandle<()>,
}

// Owns the callback pipeline, and every supervisor thread.
struct Coordinator<'c, 'a> {
    pipeline: Pipeline<'c, 'a>,
    options: Options,

    // Master sender, cloned into each link. Keeps the inbox connected while we run.
    messages: Sender<Message>,

    next_serial: Serial,
    entries: BTreeMap<Serial, Entry>,
    retired: Vec<JoinHandle<()>>,

    // First error, once the trace has been aborted.
    error: Option<Error>,
}

impl<'c, 'a> Coordinator<'c, 'a> {
    fn new(pipeline: Pipeline<'c, 'a>, options: Options, messages: Sender<Message>) -> Self {
        Self {
            pipeline,
            options,
            messages,
            next_serial: 0,
            entries: BTreeMap::new(),
            retired: Vec::new(),
            error: None,
        }
    }

    fn launch(&mut self, launch: Launch) -> Result<()> {
        let serial = self.next_serial;
        self.next_serial += 1;

        let pid = match &launch {
            Launch::Spawn(_) => None,
            Launch::Adopt(pid) => Some(*pid),
        };

        let (verdicts, verdicts_rx) = channel::unbounded();
        let link = Link { serial, messages: self.messages.clone(), verdicts: verdicts_rx };
        let thread = supervisor::spawn(launch, link, self.options)?;

        debug!(serial, ?pid, "started supervisor");

        self.entries.insert(serial, Entry { pid, verdicts, thread });

        Ok(())
    }

    fn run(
        mut self,
        inbox: &Receiver<Message>,
        cancel: &Receiver<()>,
        deadline: Option<Duration>,
    ) -> Result<()> {
        let mut cancel = cancel.clone();
        let mut timeout = deadline.map(channel::after).unwrap_or_else(channel::never);
        let mut grace = channel::never();

        while !self.entries.is_empty() {
            let aborted = self.error.is_some();

            select! {
                recv(inbox) -> message => {
                    match message {
                        Ok(message) => self.handle(message),
                        Err(_) => self.abort(Error::Internal("message channel disconnected".into())),
                    }
                },
                recv(cancel) -> _ => self.abort(Error::Cancelled),
                recv(timeout) -> _ => self.abort(Error::DeadlineExceeded),
                recv(grace) -> _ => {
                    self.abandon();
                    break;
                },
            }

            // Only the first error counts. Keep draining messages until all tracees have been
            // reaped, or the grace period is over.
            if !aborted && self.error.is_some() {
                cancel = channel::never();
                timeout = channel::never();
                grace = channel::after(ABORT_GRACE);
            }
        }

        self.join();

        match self.error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Spawned { serial, pid } => {
                self.set_pid(serial, pid);
            },
            Message::Retarget { serial, pid } => {
                // The supervisor of the thread whose tid was taken over can't see it go.
                for (other, entry) in &self.entries {
                    if *other != serial && entry.pid == Some(pid) {
                        debug!(serial = *other, pid = pid.as_raw(), "retiring replaced supervisor");
                        let _ = entry.verdicts.send(Verdict::Retire);
                    }
                }

                self.set_pid(serial, pid);
            },
            Message::Event { serial, event } => {
                let verdict = self.dispatch(&event);
                self.reply(serial, verdict);

                if event.is_terminal() && self.pid_of(serial) == Some(event.pid()) {
                    self.retire(serial);
                }
            },
            Message::Adopt { serial, event } => {
                if let TraceEvent::NewChild { child, .. } = event {
                    self.adopt(child);
                }

                // The child supervisor exists before its `NewChild` is dispatched, but can't
                // produce events until we return to the inbox.
                let verdict = self.dispatch(&event);
                self.reply(serial, verdict);
            },
            Message::Vanished { serial } => {
                self.retire(serial);
            },
            Message::Fault { serial, error } => {
                self.retire(serial);
                self.abort(error);
            },
        }
    }

    fn set_pid(&mut self, serial: Serial, pid: Pid) {
        if let Some(entry) = self.entries.get_mut(&serial) {
            entry.pid = Some(pid);
        }

        // Aborted before we knew whom to kill.
        if self.error.is_some() {
            kill(pid);
        }
    }

    fn adopt(&mut self, child: Pid) {
        if self.error.is_some() {
            // Parked children of an aborted trace are killed, not adopted.
            kill(child);
            return;
        }

        if let Err(err) = self.launch(Launch::Adopt(child)) {
            kill(child);
            self.abort(err);
        }
    }

    fn dispatch(&mut self, event: &TraceEvent) -> Verdict {
        if self.error.is_some() {
            return Verdict::Kill;
        }

        let task = Task::new(event.pid());

        match self.pipeline.apply(&task, event) {
            Ok(()) => Verdict::Resume,
            Err(err) => {
                self.abort(err);
                Verdict::Kill
            },
        }
    }

    fn reply(&self, serial: Serial, verdict: Verdict) {
        if let Some(entry) = self.entries.get(&serial) {
            // The supervisor may have faulted in the meantime.
            let _ = entry.verdicts.send(verdict);
        }
    }

    fn pid_of(&self, serial: Serial) -> Option<Pid> {
        self.entries.get(&serial).and_then(|entry| entry.pid)
    }

    fn retire(&mut self, serial: Serial) {
        if let Some(entry) = self.entries.remove(&serial) {
            debug!(serial, pid = ?entry.pid, "retired supervisor");
            self.retired.push(entry.thread);
        }
    }

    // Stop the trace. Live tracees are killed, and their remaining messages drained.
    fn abort(&mut self, err: Error) {
        if self.error.is_some() {
            debug!(%err, "error after abort");
            return;
        }

        info!(%err, "aborting trace");

        for entry in self.entries.values() {
            if let Some(pid) = entry.pid {
                kill(pid);
            }
        }

        self.error = Some(err);
    }

    // Give up on supervisors which did not finish in time. Their threads are detached, and
    // their tracees are killed once more.
    fn abandon(&mut self) {
        for (serial, entry) in mem::take(&mut self.entries) {
            warn!(serial, pid = ?entry.pid, "supervisor did not finish in time, detaching");

            if let Some(pid) = entry.pid {
                kill(pid);
            }
        }
    }

    fn join(&mut self) {
        for thread in self.retired.drain(..) {
            if thread.join().is_err() {
                error!("supervisor thread panicked");

                if self.error.is_none() {
                    self.error = Some(Error::Internal("supervisor thread panicked".into()));
                }
            }
        }
    }
}

fn kill(pid: Pid) {
    debug!(pid = pid.as_raw(), "killing tracee");

    let _ = signal::kill(pid, signal::Signal::SIGKILL);
}
