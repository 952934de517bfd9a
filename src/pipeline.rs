//! Consumers of the trace event stream.

use crate::error::{CallbackError, Error, Result};
use crate::event::TraceEvent;
use crate::task::Task;

/// A consumer of trace events.
///
/// Callbacks run on the thread which called [`crate::trace()`], while the task which produced
/// the event is held stopped. Returning an error ends the trace, and the error is returned
/// from [`crate::trace()`] as [`Error::Callback`].
pub trait Callback {
    fn apply(&mut self, task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError>;
}

impl<F> Callback for F
where
    F: FnMut(&Task, &TraceEvent) -> std::result::Result<(), CallbackError>,
{
    fn apply(&mut self, task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError> {
        self(task, event)
    }
}

/// Broadcasts each event to an ordered list of callbacks.
pub struct Pipeline<'c, 'a> {
    callbacks: &'c mut [&'a mut dyn Callback],
    failed: bool,
}

impl<'c, 'a> Pipeline<'c, 'a> {
    pub fn new(callbacks: &'c mut [&'a mut dyn Callback]) -> Self {
        let failed = false;

        Self { callbacks, failed }
    }

    /// Apply every callback to `event`, in order.
    ///
    /// The first callback error stops dispatch of this event, and no further events are
    /// dispatched by this pipeline afterwards.
    pub fn apply(&mut self, task: &Task, event: &TraceEvent) -> Result<()> {
        if self.failed {
            return Ok(());
        }

        for callback in self.callbacks.iter_mut() {
            if let Err(err) = callback.apply(task, event) {
                self.failed = true;
                return Err(Error::Callback(err));
            }
        }

        Ok(())
    }

    /// Returns `true` once a callback has failed.
    pub fn failed(&self) -> bool {
        self.failed
    }
}

/// Callback which keeps every event it sees.
#[derive(Clone, Debug, Default)]
pub struct Recorder {
    events: Vec<TraceEvent>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }
}

impl Callback for Recorder {
    fn apply(&mut self, _task: &Task, event: &TraceEvent) -> std::result::Result<(), CallbackError> {
        self.events.push(*event);
        Ok(())
    }
}
