use std::process::{Command, Stdio};

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::{Callback, CallbackError, Recorder, Signal, Task, TraceEvent, Tracer};

#[macro_use]
mod support;
use support::*;

#[test]
#[timeout(2000)]
fn test_read_write_buffer() -> Result<()> {
    let mut cmd = Command::new("echo");
    cmd.arg("hello");
    cmd.stdout(Stdio::null());

    let mut written = vec![];

    let mut capture = |task: &Task, event: &TraceEvent| -> Result<(), CallbackError> {
        if let TraceEvent::SyscallEnter { syscall, .. } = event {
            if syscall.sysno == libc::SYS_write && syscall.args[0].int32() == 1 {
                let data = task.read_vec(syscall.args[1].pointer(), syscall.args[2].size())?;
                written.push(data);
            }
        }
        Ok(())
    };

    let mut recorder = Recorder::new();

    let mut callbacks: [&mut dyn Callback; 2] = [&mut capture, &mut recorder];
    systrace::trace(cmd, &mut callbacks)?;

    assert_eq!(written, vec![b"hello\n".to_vec()]);

    let events = recorder.into_events();
    assert_paired(&events);
    assert_eq!(lifecycle(&events), vec![
        TraceEvent::Exit { pid: pid!(0), exit_code: 0 },
    ]);

    // The write returned the number of bytes written.
    let ret = events.iter().find_map(|event| match event {
        TraceEvent::SyscallExit { syscall, .. } if syscall.sysno == libc::SYS_write => Some(syscall.ret.int64()),
        _ => None,
    });
    assert_eq!(ret, Some(6));

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_failed_syscall_has_errno() -> Result<()> {
    let mut cmd = Command::new("cat");
    cmd.arg("/nonexistent/file");
    cmd.stderr(Stdio::null());

    let mut recorder = Recorder::new();
    systrace::trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();
    assert_paired(&events);

    let failed = events
        .iter()
        .filter_map(|event| match event {
            TraceEvent::SyscallExit { syscall, .. } => Some(syscall),
            _ => None,
        })
        .find(|syscall| syscall.errno == Some(nix::errno::Errno::ENOENT));

    let failed = failed.expect("no syscall failed with `ENOENT`");
    assert_eq!(failed.ret.int64(), -(libc::ENOENT as i64));

    assert_eq!(lifecycle(&events).last(), Some(&TraceEvent::Exit { pid: pid!(0), exit_code: 1 }));

    Ok(())
}

#[test]
#[timeout(3000)]
fn test_follow_fork() -> Result<()> {
    let mut cmd = Command::new("/bin/bash");
    cmd.args(&["-c", "/bin/true; exit 3"]);

    let mut recorder = Recorder::new();
    systrace::trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();

    for event in &events {
        eprintln!("{:?}", event);
    }

    assert_paired(&events);

    // The child is reported before any of its own events.
    let lifecycle = lifecycle(&events);
    assert_eq!(lifecycle[0], TraceEvent::NewChild { pid: pid!(0), child: pid!(1) });

    assert_eq!(lifecycle_of(&events, 1), vec![
        TraceEvent::Exit { pid: pid!(1), exit_code: 0 },
    ]);

    // The shell may also see a `SIGCHLD` for the child.
    let root = lifecycle_of(&events, 0);
    assert_eq!(root.first(), Some(&TraceEvent::NewChild { pid: pid!(0), child: pid!(1) }));
    assert_eq!(root.last(), Some(&TraceEvent::Exit { pid: pid!(0), exit_code: 3 }));
    assert!(root[1..root.len() - 1]
        .iter()
        .all(|event| *event == TraceEvent::SignalStop { pid: pid!(0), signal: Signal::SIGCHLD }));

    // The child was traced from its first syscall, the `execve()` of `/bin/true`.
    let child = events
        .iter()
        .find_map(|event| match event {
            TraceEvent::NewChild { child, .. } => Some(*child),
            _ => None,
        })
        .expect("no child");
    let execve = events.iter().any(|event| {
        event.pid() == child && event.syscall().map(|syscall| syscall.sysno) == Some(libc::SYS_execve)
    });
    assert!(execve);

    eprintln!("ok!");

    Ok(())
}

#[test]
#[timeout(3000)]
fn test_follow_children_disabled() -> Result<()> {
    let mut cmd = Command::new("/bin/bash");
    cmd.args(&["-c", "/bin/true; exit 3"]);

    let mut recorder = Recorder::new();
    Tracer::new()
        .follow_children(false)
        .trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();
    let root = events[0].pid();

    assert_paired(&events);
    assert!(events.iter().all(|event| event.pid() == root));
    assert!(!events.iter().any(|event| matches!(event, TraceEvent::NewChild { .. })));
    assert_eq!(events.last(), Some(&TraceEvent::Exit { pid: root, exit_code: 3 }));

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_follow_pipeline() -> Result<()> {
    let mut cmd = Command::new("/bin/bash");
    cmd.args(&["-c", "echo hello | cat | cat > /dev/null"]);

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

    assert!(children.len() >= 3, "children = {:?}", children);

    // Every traced task terminated, and was reported before terminating.
    for child in children {
        let created = position(&lifecycle, |e| *e == TraceEvent::NewChild { pid: e.pid(), child }).unwrap();
        let exited = position(&lifecycle, |e| e.is_terminal() && e.pid() == child).unwrap();
        assert!(created < exited);
    }

    Ok(())
}

#[test]
#[timeout(5000)]
fn test_stop_of_parked_child_is_reported() -> Result<()> {
    // The child outlives the shell, so every `SIGCHLD` the shell gets is for a stop.
    let mut cmd = Command::new("/bin/bash");
    cmd.args(&["-c", "sleep 1 & kill -STOP $!; for ((i = 0; i < 500000; i++)); do :; done; exit 0"]);

    let mut recorder = Recorder::new();
    systrace::trace(cmd, &mut [&mut recorder])?;

    let events = recorder.into_events();

    assert_paired(&events);

    let child = lifecycle_of(&events, 1);
    let stops = child
        .iter()
        .filter(|event| **event == TraceEvent::SignalStop { pid: pid!(1), signal: Signal::SIGSTOP })
        .count();
    assert_eq!(stops, 1);
    assert_eq!(child.last(), Some(&TraceEvent::Exit { pid: pid!(1), exit_code: 0 }));

    // The stop notice for the parked child was hidden, but not the one for the real stop.
    let root = lifecycle_of(&events, 0);
    assert!(root.contains(&TraceEvent::SignalStop { pid: pid!(0), signal: Signal::SIGCHLD }));
    assert_eq!(root.last(), Some(&TraceEvent::Exit { pid: pid!(0), exit_code: 0 }));

    Ok(())
}
