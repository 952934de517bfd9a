//! Trace the syscalls and signals of a command and all of its descendants.
//!
//! ```no_run
//! use std::process::Command;
//!
//! use systrace::{Callback, CallbackError, Task, TraceEvent};
//!
//! let mut cmd = Command::new("echo");
//! cmd.arg("hello");
//!
//! let mut writes = 0;
//! let mut count = |_: &Task, event: &TraceEvent| -> Result<(), CallbackError> {
//!     if let TraceEvent::SyscallEnter { syscall, .. } = event {
//!         if syscall.name() == Some("write") {
//!             writes += 1;
//!         }
//!     }
//!     Ok(())
//! };
//!
//! let mut callbacks: [&mut dyn Callback; 1] = [&mut count];
//! systrace::trace(cmd, &mut callbacks)?;
//! # Ok::<(), systrace::Error>(())
//! ```

pub mod abi;
pub mod aarch64;
pub mod error;
pub mod event;
pub mod expect;
pub mod mips;
pub mod pipeline;
pub mod powerpc;
pub mod print;
pub mod riscv;
pub mod signal;
pub mod syscall;
pub mod task;
pub mod tracer;
pub mod x86;

mod supervisor;

pub use error::{CallbackError, Error, Result};
pub use event::{Pid, TraceEvent};
pub use pipeline::{Callback, Pipeline, Recorder};
pub use print::Printer;
pub use signal::{signal_name, signal_string, Signal};
pub use syscall::{SyscallArg, SyscallRecord};
pub use task::Task;
pub use tracer::{trace, CancelHandle, Tracer};
