//! A minimal ptrace(2) debugger for a single x86-64 Linux tracee.

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("tdbg only supports x86-64 Linux");

#[macro_use]
pub mod error;

pub mod breakpoint;
pub mod cmd;
pub mod controller;
pub mod engine;
pub mod registers;
pub mod x86;

pub use breakpoint::{Breakpoint, BreakpointTable, SetOutcome};
pub use cmd::Command;
pub use controller::{Event, Pid, ProcessController, Restart, Signal, State};
pub use engine::{Action, CommandEngine, ParseError, Reply};
pub use error::{Error, MemoryAccessKind, Result};
pub use x86::{Register, Registers};
