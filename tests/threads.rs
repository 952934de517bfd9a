//! Tracing multi-threaded tracees.
//!
//! The tracees are this test binary, re-run to execute one of the `tracee_*` functions below.
//! Those do nothing unless run that way.

use std::env;
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{Error, Recorder, Signal, TraceEvent, Tracer};

#[macro_use]
mod support;
use support::*;

const TRACEE_VAR: &str = "SYSTRACE_TEST_TRACEE";
const EXEC_VAR: &str = "SYSTRACE_TEST_EXEC";

// Command which runs the test function `name` of this binary as a tracee.
fn tracee(name: &str) -> Result<Command> {
    let mut cmd = Command::new(env::current_exe()?);
    cmd.args(&["--exact", name, "--nocapture", "--test-threads=1", "-q"]);
    cmd.env(TRACEE_VAR, "1");
    cmd.stdout(Stdio::null());

    Ok(cmd)
}

fn is_tracee() -> bool {
    env::var_os(TRACEE_VAR).is_some()
}

#[test]
fn tracee_threads() {
    if !is_tracee() {
        return;
    }

    let workers: Vec<_> = (0..4)
        .map(|_| thread::spawn(|| std::fs::metadata("/").is_ok()))
        .collect();

    for worker in workers {
        assert!(worker.join().unwrap());
    }
}

#[test]
fn tracee_exec_off_leader() {
    if !is_tracee() {
        return;
    }

    let argv = env::var(EXEC_VAR).unwrap();
    let mut argv = argv.split_whitespace();

    let mut cmd = Command::new(argv.next().unwrap());
    cmd.args(argv);

    // Killed by the exec of its sibling.
    thread::spawn(|| thread::sleep(Duration::from_secs(60)));
    thread::sleep(Duration::from_millis(100));

    let err = thread::spawn(move || cmd.exec()).join().unwrap();
    panic!("exec failed: {}", err);
}

fn is_sigstop(event: &TraceEvent) -> bool {
    matches!(event, TraceEvent::SignalStop { signal: Signal::SIGSTOP, .. })
}

#[test]
#[timeout(10000)]
fn test_threads() -> Result<()> {
    let cmd = tracee("tracee_threads")?;

    let mut recorder = Recorder::new();
    systrace::trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();

    assert_paired(&events);

    let lifecycle = lifecycle(&events);
    let children: Vec<_> = lifecycle
        .iter()
        .filter_map(|event| match event {
            TraceEvent::NewChild { child, .. } => Some(*child),
            _ => None,
        })
        .collect();

    // The workers, and the thread the test harness runs the tracee function on.
    assert!(children.len() >= 4, "children = {:?}", children);

    for child in children {
        assert!(lifecycle.iter().any(|event| event.is_terminal() && event.pid() == child));
    }

    assert_eq!(lifecycle_of(&events, 0).last(), Some(&TraceEvent::Exit { pid: pid!(0), exit_code: 0 }));

    // Parking new threads stops their whole group, which is never reported.
    assert!(!events.iter().any(is_sigstop));

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_exec_off_leader() -> Result<()> {
    let mut cmd = tracee("tracee_exec_off_leader")?;
    cmd.env(EXEC_VAR, "/bin/true");

    let mut recorder = Recorder::new();
    systrace::trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();
    let root = events[0].pid();

    // The exec'ing thread took the tid of the leader, and its events continue under it.
    let execve_exit = position(&events, |event| match event {
        TraceEvent::SyscallExit { pid, syscall } => *pid == root && syscall.sysno == libc::SYS_execve,
        _ => false,
    });
    assert!(execve_exit.is_some());

    let exit = position(&events, |event| *event == TraceEvent::Exit { pid: root, exit_code: 0 });
    let exit = exit.expect("no exit of the root tid");
    assert!(execve_exit < Some(exit));
    assert!(!events[exit + 1..].iter().any(|event| event.pid() == root));

    assert!(!events.iter().any(is_sigstop));

    Ok(())
}

#[test]
#[timeout(10000)]
fn test_deadline_after_exec_off_leader() -> Result<()> {
    let mut cmd = tracee("tracee_exec_off_leader")?;
    cmd.env(EXEC_VAR, "/bin/sleep 10");

    let start = Instant::now();

    let mut recorder = Recorder::new();
    let res = Tracer::new()
        .deadline(Duration::from_secs(3))
        .trace(cmd, &mut [&mut recorder]);

    assert!(matches!(res, Err(Error::DeadlineExceeded)), "res = {:?}", res);
    assert!(start.elapsed() < Duration::from_secs(8));

    Ok(())
}
