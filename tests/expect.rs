use std::process::{Command, Stdio};

use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use systrace::expect::{self, Expect, Unmet};
use systrace::{Error, TraceEvent};

#[macro_use]
mod support;
use support::*;

fn echo_hello() -> Command {
    let mut cmd = Command::new("echo");
    cmd.arg("hello");
    cmd.stdout(Stdio::null());
    cmd
}

#[test]
#[timeout(2000)]
fn test_expected_write_and_exit() -> Result<()> {
    let expectations: Vec<Box<dyn Expect>> = vec![
        Box::new(expect::write_enter(1, b"hello\n")),
        Box::new(expect::exit_group(0)),
    ];

    let mut log = vec![];
    let outcome = expect::trace(&mut log, echo_hello(), expectations);

    outcome.result?;

    assert_paired(&outcome.events);
    assert_eq!(lifecycle(&outcome.events), vec![
        TraceEvent::Exit { pid: pid!(0), exit_code: 0 },
    ]);

    // One line per event.
    let log = String::from_utf8(log)?;
    assert_eq!(log.lines().count(), outcome.events.len());
    assert!(log.contains("write(0x1, "));
    assert!(log.lines().last().unwrap_or_default().ends_with("exited with code 0"));

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_unmet_expectation() -> Result<()> {
    let expectations: Vec<Box<dyn Expect>> = vec![
        Box::new(expect::write_enter(1, b"goodbye\n")),
    ];

    let outcome = expect::trace(std::io::sink(), echo_hello(), expectations);

    // Mismatches don't abort the trace.
    assert_eq!(lifecycle(&outcome.events).last(), Some(&TraceEvent::Exit { pid: pid!(0), exit_code: 0 }));

    match outcome.result {
        Err(Error::Callback(err)) => assert!(err.is::<Unmet>()),
        res => panic!("unexpected result: {:?}", res),
    }

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_expectations_are_ordered() -> Result<()> {
    // `exit_group()` can't be followed by a write.
    let expectations: Vec<Box<dyn Expect>> = vec![
        Box::new(expect::exit_group(0)),
        Box::new(expect::write_enter(1, b"hello\n")),
    ];

    let outcome = expect::trace(std::io::sink(), echo_hello(), expectations);

    assert!(outcome.result.is_err());

    Ok(())
}
