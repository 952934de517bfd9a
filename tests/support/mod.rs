#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::convert::TryInto;

use pretty_assertions::assert_eq;
use systrace::{Pid, TraceEvent};

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        systrace::Pid::from_raw($raw)
    };
}

/// Normalize a trace, then keep only the events which aren't syscall-stops.
pub fn lifecycle(trace: &[TraceEvent]) -> Vec<TraceEvent> {
    Normalizer::normalize(trace)
        .into_iter()
        .filter(|event| event.syscall().is_none())
        .collect()
}

/// Normalized lifecycle events of one normalized pid, in order.
pub fn lifecycle_of(trace: &[TraceEvent], raw: i32) -> Vec<TraceEvent> {
    lifecycle(trace)
        .into_iter()
        .filter(|event| event.pid() == Pid::from_raw(raw))
        .collect()
}

/// Check the per-pid ordering guarantees of a trace:
/// - every `SyscallExit` closes the `SyscallEnter` before it, with the same syscall number
/// - no `SyscallEnter` nests inside another
/// - nothing follows the termination of a pid
pub fn assert_paired(trace: &[TraceEvent]) {
    let mut pending: HashMap<Pid, i64> = HashMap::new();
    let mut terminated: HashSet<Pid> = HashSet::new();

    for event in trace {
        let pid = event.pid();

        assert!(!terminated.contains(&pid), "event after termination: {:?}", event);

        match event {
            TraceEvent::SyscallEnter { syscall, .. } => {
                let nested = pending.insert(pid, syscall.sysno);
                assert_eq!(nested, None, "nested syscall-enter: {:?}", event);
            },
            TraceEvent::SyscallExit { syscall, .. } => {
                let entered = pending.remove(&pid);
                assert_eq!(entered, Some(syscall.sysno), "unpaired syscall-exit: {:?}", event);
            },
            TraceEvent::Exit { .. } | TraceEvent::SignalExit { .. } => {
                // A task may die inside a syscall, e.g. `exit_group()`.
                pending.remove(&pid);
                terminated.insert(pid);
            },
            TraceEvent::SignalStop { .. } => {
                assert_eq!(pending.get(&pid), None, "signal-delivery-stop inside syscall: {:?}", event);
            },
            TraceEvent::NewChild { .. } => {
                // Reported from inside `fork()`, `vfork()`, or `clone()`.
            },
        }
    }
}

/// Index of the first event matching `pred`.
pub fn position(trace: &[TraceEvent], pred: impl Fn(&TraceEvent) -> bool) -> Option<usize> {
    trace.iter().position(pred)
}

/// Normalizes an event trace by substituting each concrete raw PID value with one that
/// matches its ordinal of appearance in the trace.
#[derive(Default)]
struct Normalizer {
    map: HashMap<Pid, Pid>,
}

impl Normalizer {
    pub fn normalize(trace: &[TraceEvent]) -> Vec<TraceEvent> {
        let mut normalizer = Normalizer::default();

        trace.iter().map(|event| normalizer.normalize_event(event)).collect()
    }

    fn normalize_event(&mut self, event: &TraceEvent) -> TraceEvent {
        use TraceEvent::*;

        match *event {
            SyscallEnter { pid, syscall } => SyscallEnter { pid: self.normalize_pid(pid), syscall },
            SyscallExit { pid, syscall } => SyscallExit { pid: self.normalize_pid(pid), syscall },
            SignalStop { pid, signal } => SignalStop { pid: self.normalize_pid(pid), signal },
            SignalExit { pid, signal, core_dumped } => {
                SignalExit { pid: self.normalize_pid(pid), signal, core_dumped }
            },
            Exit { pid, exit_code } => Exit { pid: self.normalize_pid(pid), exit_code },
            NewChild { pid, child } => {
                let pid = self.normalize_pid(pid);
                let child = self.normalize_pid(child);
                NewChild { pid, child }
            },
        }
    }

    fn normalize_pid(&mut self, pid: Pid) -> Pid {
        // Avoid borrowck error in `default` fn.
        let next_free = self.map.len();

        let entry = self.map.entry(pid).or_insert_with(|| {
            let raw: i32 = next_free.try_into().expect("exhausted free test PIDs");
            Pid::from_raw(raw)
        });

        *entry
    }
}
