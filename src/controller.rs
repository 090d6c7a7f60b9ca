//! Lifecycle of the single tracee: launch or attach, restart, wait, kill.
//!
//! This is the only place that blocks on `waitpid(2)`. Every restart is followed
//! synchronously by a wait, so the controller is never observed `Running`
//! between calls.

use nix::{
    errno::Errno,
    sys::{
        ptrace,
        signal,
        wait::{waitpid, WaitStatus},
    },
};
use tracing::{debug, info, warn};

use crate::breakpoint::BreakpointTable;
use crate::cmd::Command;
use crate::error::{Error, Result, ResultExt};
use crate::registers;

pub use nix::unistd::Pid;

/// POSIX signal.
pub use nix::sys::signal::Signal;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    NotStarted,
    Stopped,
    Running,
    Exited,
}

/// Restart requests, which resume the stopped tracee.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Restart {
    Step,
    Continue,
}

/// What a restart ended in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    /// Trapped on a known breakpoint. The original byte is back and the instruction
    /// pointer has been rewound to `addr`.
    Breakpoint { addr: u64 },

    /// Stopped on a signal that is not a known breakpoint.
    Stopped { pc: u64, signal: Signal },

    /// A single instruction was executed.
    Stepped { pc: u64 },

    Exited { exit_code: i32 },

    Signaled {
        signal: Signal,
        core_dumped: bool,
    },
}

// How we came to trace the current tracee, which decides how we let go of it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Origin {
    Spawned,
    Attached,
}

/// Owner of the tracee's pid and lifecycle state.
///
/// Breakpoints live in a [`BreakpointTable`] owned by the caller. Call
/// [`release()`](Self::release) with that table before dropping a controller:
/// dropping one that is still attached detaches without restoring any armed byte,
/// and the former tracee dies of `SIGTRAP` when it reaches one.
#[derive(Debug)]
pub struct ProcessController {
    pid: Option<Pid>,
    state: State,
    origin: Origin,

    /// Signal to deliver on the next restart.
    pending: Option<Signal>,
}

impl Default for ProcessController {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessController {
    pub fn new() -> Self {
        Self {
            pid: None,
            state: State::NotStarted,
            origin: Origin::Spawned,
            pending: None,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Pid of the current, or most recent, tracee.
    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn pending_signal(&self) -> Option<Signal> {
        self.pending
    }

    pub fn is_alive(&self) -> bool {
        matches!(self.state, State::Stopped | State::Running)
    }

    /// Pid of the tracee, if it is stopped and may be inspected or restarted.
    pub fn require_stopped(&self) -> Result<Pid> {
        match (self.state, self.pid) {
            (State::Stopped, Some(pid)) => Ok(pid),
            _ => Err(Error::NotRunnable),
        }
    }

    /// Fork and exec `cmd`, then wait for its post-exec `SIGTRAP`.
    ///
    /// If that first stop is not observed the controller stays `NotStarted`.
    pub fn launch(&mut self, cmd: &Command) -> Result<Pid> {
        if self.is_alive() {
            internal_error!("launch with a live tracee");
        }

        let program = cmd.program();
        let pid = cmd.fork_exec()?;

        let failure = |reason: String| Error::Launch { program: program.clone(), reason };

        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(errno) => return Err(failure(errno.desc().to_owned())),
        };

        debug!(?status, "initial wait status");

        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => {
                self.pid = Some(pid);
                self.state = State::Stopped;
                self.origin = Origin::Spawned;
                self.pending = None;

                info!(pid = pid.as_raw(), %program, "launched tracee");

                Ok(pid)
            },
            WaitStatus::Exited(_, exit_code) => {
                Err(failure(format!("exited with status {exit_code} before its first stop")))
            },
            WaitStatus::Signaled(_, signal, _) => {
                Err(failure(format!("killed by {signal} before its first stop")))
            },
            status => {
                reap_killed(pid);
                Err(failure(format!("unexpected first stop: {status:?}")))
            },
        }
    }

    /// Attach to a running process, and wait for the attach-stop.
    pub fn attach(&mut self, pid: Pid) -> Result<()> {
        if self.is_alive() {
            internal_error!("attach with a live tracee");
        }

        ptrace::attach(pid).map_err(|source| Error::Attach { pid, source })?;

        let pending = match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => None,
            // Some other signal won the race with the attach `SIGSTOP`; pass it on.
            Ok(WaitStatus::Stopped(_, signal)) => Some(signal),
            Ok(status) => {
                debug!(?status, "tracee gone during attach");
                return Err(Error::Attach { pid, source: Errno::ESRCH });
            },
            Err(source) => return Err(Error::Attach { pid, source }),
        };

        self.pid = Some(pid);
        self.state = State::Stopped;
        self.origin = Origin::Attached;
        self.pending = pending;

        info!(pid = pid.as_raw(), "attached to tracee");

        Ok(())
    }

    /// Resume until the next stop or exit.
    ///
    /// A `SIGTRAP` one byte past an armed breakpoint is that breakpoint firing: its
    /// byte is restored and the instruction pointer rewound onto it.
    pub fn continue_execution(&mut self, breakpoints: &mut BreakpointTable) -> Result<Event> {
        self.restart(breakpoints, Restart::Continue)
    }

    /// Execute one instruction.
    ///
    /// Unlike [`continue_execution()`](Self::continue_execution), this never restores
    /// or rewinds: stepping onto an armed `int3` executes the trap itself.
    pub fn single_step(&mut self, breakpoints: &mut BreakpointTable) -> Result<Event> {
        self.restart(breakpoints, Restart::Step)
    }

    fn restart(&mut self, breakpoints: &mut BreakpointTable, restart: Restart) -> Result<Event> {
        let pid = self.require_stopped()?;
        let pending = self.pending.take();

        debug!(pid = pid.as_raw(), ?restart, ?pending, "restarting tracee");

        let res = match restart {
            Restart::Step => ptrace::step(pid, pending),
            Restart::Continue => ptrace::cont(pid, pending),
        };

        match res {
            Ok(()) => {},
            Err(Errno::ESRCH) => {
                // Killed out from under us. The wait below collects its status.
                warn!(pid = pid.as_raw(), "tracee vanished before restart");
            },
            Err(source) => {
                self.pending = pending;
                return Err(Error::Restart { pid, mode: restart, source });
            },
        }

        self.state = State::Running;

        self.wait(pid, breakpoints, restart)
    }

    fn wait(&mut self, pid: Pid, breakpoints: &mut BreakpointTable, restart: Restart) -> Result<Event> {
        let status = match waitpid(pid, None) {
            Ok(status) => status,
            Err(source @ Errno::ECHILD) => {
                self.mark_exited(breakpoints);
                return Err(Error::TraceeDied { pid, source });
            },
            Err(errno) => return Err(errno.into()),
        };

        debug!(?status, "wait status");

        match status {
            WaitStatus::Stopped(_, signal) => {
                self.state = State::Stopped;

                let pc = registers::pc(pid)?;

                if signal != Signal::SIGTRAP {
                    // Not ours: deliver it when the operator resumes.
                    self.pending = Some(signal);
                    return Ok(Event::Stopped { pc, signal });
                }

                if restart == Restart::Step {
                    return Ok(Event::Stepped { pc });
                }

                let addr = pc.wrapping_sub(1);

                match breakpoints.lookup_mut(addr) {
                    Some(bp) if bp.is_armed() => {
                        bp.restore()?;
                        registers::set_pc(pid, addr)?;

                        info!(addr, "stopped at breakpoint");

                        Ok(Event::Breakpoint { addr })
                    },
                    _ => Ok(Event::Stopped { pc, signal }),
                }
            },
            WaitStatus::Exited(_, exit_code) => {
                info!(pid = pid.as_raw(), exit_code, "tracee exited");
                self.mark_exited(breakpoints);

                Ok(Event::Exited { exit_code })
            },
            WaitStatus::Signaled(_, signal, core_dumped) => {
                info!(pid = pid.as_raw(), %signal, core_dumped, "tracee killed by signal");
                self.mark_exited(breakpoints);

                Ok(Event::Signaled { signal, core_dumped })
            },
            // No ptrace options are set, and we never pass `WNOHANG` or `WCONTINUED`.
            status => internal_error!(format!("unexpected wait status: {status:?}")),
        }
    }

    /// Kill the tracee with `SIGKILL` and reap it.
    pub fn kill(&mut self, breakpoints: &mut BreakpointTable) -> Result<()> {
        let pid = self.require_stopped()?;

        match signal::kill(pid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {},
            Err(errno) => return Err(errno.into()),
        }

        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(Errno::ECHILD) => break,
                Ok(status) => debug!(?status, "draining stop of killed tracee"),
                Err(Errno::EINTR) => continue,
                Err(errno) => return Err(errno.into()),
            }
        }

        info!(pid = pid.as_raw(), "killed tracee");
        self.mark_exited(breakpoints);

        Ok(())
    }

    /// Disarm every breakpoint and let the tracee run on untraced.
    pub fn detach(&mut self, breakpoints: &mut BreakpointTable) -> Result<()> {
        let pid = self.require_stopped()?;

        breakpoints.disarm_all()?;
        ptrace::detach(pid, self.pending.take()).died_if_esrch(pid)?;

        info!(pid = pid.as_raw(), "detached from tracee");
        self.mark_exited(breakpoints);

        Ok(())
    }

    /// Let go of a live tracee: kill what we spawned, detach from what we attached to.
    ///
    /// Before detaching, every armed byte in `breakpoints` is restored.
    pub fn release(&mut self, breakpoints: &mut BreakpointTable) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        match self.origin {
            Origin::Spawned => self.kill(breakpoints),
            Origin::Attached => self.detach(breakpoints),
        }
    }

    pub fn read_register(&self, name: &str) -> Result<u64> {
        let pid = self.require_stopped()?;
        registers::get(pid, name)
    }

    pub fn write_register(&mut self, name: &str, value: u64) -> Result<()> {
        let pid = self.require_stopped()?;
        registers::set(pid, name, value)
    }

    pub fn dump_registers(&self) -> Result<Vec<(&'static str, u64)>> {
        let pid = self.require_stopped()?;
        registers::dump(pid)
    }

    pub fn pc(&self) -> Result<u64> {
        let pid = self.require_stopped()?;
        registers::pc(pid)
    }

    fn mark_exited(&mut self, breakpoints: &mut BreakpointTable) {
        debug!(pid = ?self.pid, "marking tracee exited");

        self.state = State::Exited;
        self.pending = None;
        breakpoints.clear();
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if self.is_alive() && self.origin == Origin::Attached {
            warn!(pid = ?self.pid, "detaching on drop, breakpoints may still be armed");
        }

        if let Err(err) = self.release(&mut BreakpointTable::new()) {
            warn!(%err, "could not release tracee");
        }
    }
}

// Kill a child whose first stop was not the one we expected, and reap it.
fn reap_killed(pid: Pid) {
    let _ = signal::kill(pid, Signal::SIGKILL);
    let _ = waitpid(pid, None);
}
