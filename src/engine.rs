//! Operator command parsing and dispatch.
//!
//! [`CommandEngine::execute()`] never fails: every outcome, including errors from
//! the tracee, comes back as a [`Reply`] for the front end to print.

use std::fmt;

use tracing::{debug, warn};

use crate::breakpoint::{BreakpointTable, SetOutcome};
use crate::cmd::Command;
use crate::controller::{Event, Pid, ProcessController, Signal, State};
use crate::error::{Error, Result};
use crate::registers::{parse_address, parse_value};

/// A parsed operator command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Action {
    Continue,
    Next,
    Break(u64),
    Delete(u64),
    RegisterRead(String),
    RegisterWrite(String, u64),
    RegisterDump,
    Run,
    Kill,
    Detach,
    Info,
    Help,
    Quit,
}

#[derive(thiserror::Error, Clone, Debug, Eq, PartialEq)]
pub enum ParseError {
    #[error("unknown command `{0}`")]
    Unknown(String),

    #[error("ambiguous command `{word}`, could be: {}", .candidates.join(", "))]
    Ambiguous { word: String, candidates: Vec<&'static str> },

    #[error("usage: {0}")]
    Usage(&'static str),

    #[error("invalid number `{0}`")]
    InvalidNumber(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Verb {
    Continue,
    Next,
    Break,
    Delete,
    Register,
    Run,
    Kill,
    Detach,
    Info,
    Help,
    Exit,
    Quit,
}

const VERBS: &[(&str, Verb)] = &[
    ("continue", Verb::Continue),
    ("next", Verb::Next),
    ("break", Verb::Break),
    ("delete", Verb::Delete),
    ("register", Verb::Register),
    ("run", Verb::Run),
    ("kill", Verb::Kill),
    ("detach", Verb::Detach),
    ("info", Verb::Info),
    ("help", Verb::Help),
    ("exit", Verb::Exit),
    ("quit", Verb::Quit),
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum RegisterVerb {
    Read,
    Write,
    Dump,
}

const REGISTER_VERBS: &[(&str, RegisterVerb)] = &[
    ("read", RegisterVerb::Read),
    ("write", RegisterVerb::Write),
    ("dump", RegisterVerb::Dump),
];

const BREAK_USAGE: &str = "break <0xaddr>";
const DELETE_USAGE: &str = "delete <0xaddr>";
const REGISTER_USAGE: &str = "register read <name> | register write <name> <value> | register dump";

// Resolve a case-sensitive prefix of exactly one word in `table`.
fn resolve<T: Copy>(word: &str, table: &[(&'static str, T)]) -> std::result::Result<T, ParseError> {
    let candidates: Vec<_> = table
        .iter()
        .filter(|(name, _)| name.starts_with(word))
        .collect();

    match candidates.as_slice() {
        [] => Err(ParseError::Unknown(word.to_owned())),
        [(_, item)] => Ok(*item),
        many => Err(ParseError::Ambiguous {
            word: word.to_owned(),
            candidates: many.iter().map(|(name, _)| *name).collect(),
        }),
    }
}

fn address_arg(arg: Option<&str>, usage: &'static str) -> std::result::Result<u64, ParseError> {
    let arg = arg.ok_or(ParseError::Usage(usage))?;
    parse_address(arg).map_err(|_| ParseError::InvalidNumber(arg.to_owned()))
}

impl Action {
    /// Parse one line of space-separated tokens. Blank lines parse to `None`.
    pub fn parse(line: &str) -> std::result::Result<Option<Self>, ParseError> {
        let mut args = line.split_whitespace();

        let word = match args.next() {
            Some(word) => word,
            None => return Ok(None),
        };

        let action = match resolve(word, VERBS)? {
            Verb::Continue => Action::Continue,
            Verb::Next => Action::Next,
            Verb::Break => Action::Break(address_arg(args.next(), BREAK_USAGE)?),
            Verb::Delete => Action::Delete(address_arg(args.next(), DELETE_USAGE)?),
            Verb::Register => {
                let sub = args.next().ok_or(ParseError::Usage(REGISTER_USAGE))?;

                match resolve(sub, REGISTER_VERBS)? {
                    RegisterVerb::Read => {
                        let name = args.next().ok_or(ParseError::Usage(REGISTER_USAGE))?;
                        Action::RegisterRead(name.to_owned())
                    },
                    RegisterVerb::Write => {
                        let name = args.next().ok_or(ParseError::Usage(REGISTER_USAGE))?;
                        let value = args.next().ok_or(ParseError::Usage(REGISTER_USAGE))?;
                        let value = parse_value(value)
                            .map_err(|_| ParseError::InvalidNumber(value.to_owned()))?;
                        Action::RegisterWrite(name.to_owned(), value)
                    },
                    RegisterVerb::Dump => Action::RegisterDump,
                }
            },
            Verb::Run => Action::Run,
            Verb::Kill => Action::Kill,
            Verb::Detach => Action::Detach,
            Verb::Info => Action::Info,
            Verb::Help => Action::Help,
            Verb::Exit | Verb::Quit => Action::Quit,
        };

        Ok(Some(action))
    }
}

/// Outcome of one operator command.
#[derive(Debug)]
pub enum Reply {
    Nothing,
    Launched { pid: Pid },
    AlreadyRunning { pid: Pid },

    /// Stopped on a known breakpoint, with the instruction pointer rewound to it.
    Breakpoint { addr: u64 },

    /// Stopped somewhere that is not a known breakpoint.
    UnknownStop { pc: u64, signal: Signal, breakpoints: Vec<u64> },

    Stepped { pc: u64 },
    Exited { exit_code: i32 },
    Signaled { signal: Signal, core_dumped: bool },
    BreakpointSet { addr: u64 },
    BreakpointRearmed { addr: u64 },
    BreakpointAlreadySet { addr: u64 },
    BreakpointDeleted { addr: u64 },
    NoSuchBreakpoint { addr: u64 },
    Register { name: String, value: u64 },
    RegisterWritten { name: String, value: u64 },
    Registers(Vec<(&'static str, u64)>),
    Killed { pid: Pid },
    Detached { pid: Pid },
    Info { state: State, pid: Option<Pid>, breakpoints: Vec<u64> },
    Help,
    NoRunnableProcess,
    Invalid(ParseError),
    Failed(Error),
    Quit,
}

impl Reply {
    pub fn is_failure(&self) -> bool {
        matches!(self, Reply::Invalid(_) | Reply::Failed(_) | Reply::NoRunnableProcess)
    }
}

struct Addresses<'a>(&'a [u64]);

impl fmt::Display for Addresses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(none)");
        }

        for (i, addr) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{addr:#x}")?;
        }

        Ok(())
    }
}

const HELP: &str = "\
continue                        resume until a breakpoint, signal, or exit
next                            execute a single instruction
break <0xaddr>                  set a breakpoint
delete <0xaddr>                 remove a breakpoint
register read <name>            print a register
register write <name> <value>   set a register (0x-prefixed hex, or decimal)
register dump                   print every register
run                             launch the program if it is not running
kill                            kill the tracee
detach                          let the tracee run on untraced
info                            show the tracee and its breakpoints
exit, quit                      leave the debugger
Any unambiguous prefix of a command is accepted.";

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Nothing | Reply::Quit => Ok(()),
            Reply::Launched { pid } => write!(f, "launched process {pid}"),
            Reply::AlreadyRunning { pid } => write!(f, "process {pid} is already running"),
            Reply::Breakpoint { addr } => write!(f, "stopped at {addr:#x}"),
            Reply::UnknownStop { pc, signal, breakpoints } => write!(
                f,
                "stopped by {signal} at {pc:#x}, not a known breakpoint; breakpoints: {}",
                Addresses(breakpoints),
            ),
            Reply::Stepped { pc } => write!(f, "rip = {pc:#x}"),
            Reply::Exited { exit_code } => write!(f, "process exited with status {exit_code}"),
            Reply::Signaled { signal, core_dumped } => {
                write!(f, "process killed by {signal}")?;
                if *core_dumped {
                    write!(f, " (core dumped)")?;
                }
                Ok(())
            },
            Reply::BreakpointSet { addr } => write!(f, "breakpoint set at {addr:#x}"),
            Reply::BreakpointRearmed { addr } => write!(f, "breakpoint re-armed at {addr:#x}"),
            Reply::BreakpointAlreadySet { addr } => write!(f, "breakpoint already set at {addr:#x}"),
            Reply::BreakpointDeleted { addr } => write!(f, "breakpoint deleted at {addr:#x}"),
            Reply::NoSuchBreakpoint { addr } => write!(f, "no breakpoint at {addr:#x}"),
            Reply::Register { name, value } => write!(f, "{name} = {value} ({value:#x})"),
            Reply::RegisterWritten { name, value } => write!(f, "{name} <- {value:#x}"),
            Reply::Registers(values) => {
                for (i, (name, value)) in values.iter().enumerate() {
                    if i > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{name:<8} {value:#018x} {value}")?;
                }
                Ok(())
            },
            Reply::Killed { pid } => write!(f, "killed process {pid}"),
            Reply::Detached { pid } => write!(f, "detached from process {pid}"),
            Reply::Info { state, pid, breakpoints } => {
                match pid {
                    Some(pid) => write!(f, "process {pid}: {state:?}")?,
                    None => write!(f, "no process: {state:?}")?,
                }
                write!(f, "; breakpoints: {}", Addresses(breakpoints))
            },
            Reply::Help => f.write_str(HELP),
            Reply::NoRunnableProcess => write!(f, "no runnable process"),
            Reply::Invalid(err) => write!(f, "{err}"),
            Reply::Failed(err) => write!(f, "{err}"),
        }
    }
}

/// Maps operator commands onto the tracee, its registers, and its breakpoints.
#[derive(Debug)]
pub struct CommandEngine {
    /// Program to (re)launch on `run`. Absent for an attached tracee.
    command: Option<Command>,
    controller: ProcessController,
    breakpoints: BreakpointTable,
}

impl CommandEngine {
    /// An engine that will launch `command`. Nothing is started yet.
    pub fn new(command: Command) -> Self {
        Self {
            command: Some(command),
            controller: ProcessController::new(),
            breakpoints: BreakpointTable::new(),
        }
    }

    /// An engine for an already-running process.
    pub fn attach(pid: Pid) -> Result<Self> {
        let mut controller = ProcessController::new();
        controller.attach(pid)?;

        Ok(Self {
            command: None,
            controller,
            breakpoints: BreakpointTable::new(),
        })
    }

    pub fn controller(&self) -> &ProcessController {
        &self.controller
    }

    pub fn breakpoints(&self) -> &BreakpointTable {
        &self.breakpoints
    }

    pub fn state(&self) -> State {
        self.controller.state()
    }

    /// Launch the program, purging any breakpoints left from a previous tracee.
    pub fn launch(&mut self) -> Result<Pid> {
        let command = match &self.command {
            Some(command) => command,
            None => {
                return Err(Error::Launch {
                    program: String::new(),
                    reason: "attached to a running process, nothing to launch".into(),
                })
            },
        };

        self.breakpoints.clear();
        self.controller.launch(command)
    }

    /// Parse and run one line of operator input.
    pub fn execute(&mut self, line: &str) -> Reply {
        match Action::parse(line) {
            Ok(Some(action)) => {
                debug!(?action, "executing");
                self.dispatch(action)
            },
            Ok(None) => Reply::Nothing,
            Err(err) => Reply::Invalid(err),
        }
    }

    pub fn dispatch(&mut self, action: Action) -> Reply {
        match action {
            Action::Run => return self.run(),
            Action::Quit => return Reply::Quit,
            Action::Help => return Reply::Help,
            Action::Info => {
                return Reply::Info {
                    state: self.controller.state(),
                    pid: self.controller.pid(),
                    breakpoints: self.breakpoints.addresses(),
                }
            },
            _ => {},
        }

        let pid = match self.controller.require_stopped() {
            Ok(pid) => pid,
            Err(_) => return Reply::NoRunnableProcess,
        };

        let res = match action {
            Action::Continue => self
                .controller
                .continue_execution(&mut self.breakpoints)
                .map(|event| self.event_reply(event)),
            Action::Next => self
                .controller
                .single_step(&mut self.breakpoints)
                .map(|event| self.event_reply(event)),
            Action::Break(addr) => self.breakpoints.set(pid, addr).map(|outcome| match outcome {
                SetOutcome::Inserted => Reply::BreakpointSet { addr },
                SetOutcome::Rearmed => Reply::BreakpointRearmed { addr },
                SetOutcome::AlreadySet => Reply::BreakpointAlreadySet { addr },
            }),
            Action::Delete(addr) => self.breakpoints.remove(addr).map(|removed| {
                if removed {
                    Reply::BreakpointDeleted { addr }
                } else {
                    Reply::NoSuchBreakpoint { addr }
                }
            }),
            Action::RegisterRead(name) => self
                .controller
                .read_register(&name)
                .map(|value| Reply::Register { name, value }),
            Action::RegisterWrite(name, value) => self
                .controller
                .write_register(&name, value)
                .map(|()| Reply::RegisterWritten { name, value }),
            Action::RegisterDump => self.controller.dump_registers().map(Reply::Registers),
            Action::Kill => self
                .controller
                .kill(&mut self.breakpoints)
                .map(|()| Reply::Killed { pid }),
            Action::Detach => self
                .controller
                .detach(&mut self.breakpoints)
                .map(|()| Reply::Detached { pid }),
            Action::Run | Action::Quit | Action::Help | Action::Info => {
                unreachable!("handled before the liveness check")
            },
        };

        match res {
            Ok(reply) => reply,
            Err(Error::NotRunnable) => Reply::NoRunnableProcess,
            Err(err) => {
                warn!(%err, "command failed");
                Reply::Failed(err)
            },
        }
    }

    fn run(&mut self) -> Reply {
        if self.controller.is_alive() {
            if let Some(pid) = self.controller.pid() {
                return Reply::AlreadyRunning { pid };
            }
        }

        match self.launch() {
            Ok(pid) => Reply::Launched { pid },
            Err(err) => Reply::Failed(err),
        }
    }

    fn event_reply(&self, event: Event) -> Reply {
        match event {
            Event::Breakpoint { addr } => Reply::Breakpoint { addr },
            Event::Stopped { pc, signal } => Reply::UnknownStop {
                pc,
                signal,
                breakpoints: self.breakpoints.addresses(),
            },
            Event::Stepped { pc } => Reply::Stepped { pc },
            Event::Exited { exit_code } => Reply::Exited { exit_code },
            Event::Signaled { signal, core_dumped } => Reply::Signaled { signal, core_dumped },
        }
    }
}

impl Drop for CommandEngine {
    fn drop(&mut self) {
        if let Err(err) = self.controller.release(&mut self.breakpoints) {
            warn!(%err, "could not release tracee");
        }
    }
}
