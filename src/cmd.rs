use std::ffi::{CString, NulError};

use nix::{
    sys::{personality::{self, Persona}, ptrace},
    unistd::{fork, ForkResult, Pid},
};
use tracing::debug;

use crate::error::Error;

/// Exit status of a forked child whose pre-exec setup or `execv()` failed.
const EXEC_FAILED: i32 = 127;

/// Command to spawn as a child process to be traced.
#[derive(Clone, Debug)]
pub struct Command {
    /// Argument vector to pass to `execv()`.
    argv: Vec<CString>,

    /// Request `ADDR_NO_RANDOMIZE` after forking, pre-exec.
    ///
    /// Defaults to `true`, so breakpoint addresses are stable across runs.
    disable_aslr: bool,
}

impl Command {
    pub fn new(argv: Vec<impl Into<Vec<u8>>>) -> Result<Self, Error> {
        if argv.is_empty() {
            return Err(Error::Launch {
                program: String::new(),
                reason: "no program given".into(),
            });
        }

        // Ensure we own NUL-terminated strings for the foreign exec call.
        //
        // We're heap-allocating, so always do this before forking.
        let argv: Result<Vec<_>, NulError> = argv
            .into_iter()
            .map(CString::new)
            .collect();
        let argv = argv.map_err(|err| Error::Launch {
            program: String::from_utf8_lossy(&err.into_vec()).into_owned(),
            reason: "argument contains a NUL byte".into(),
        })?;

        Ok(Self { argv, disable_aslr: true })
    }

    /// Set the value of the `disable_aslr` flag.
    pub fn disable_aslr(mut self, disable_aslr: bool) -> Self {
        self.disable_aslr = disable_aslr;
        self
    }

    /// Path of the program to exec, for reporting.
    pub fn program(&self) -> String {
        self.argv[0].to_string_lossy().into_owned()
    }

    /// Fork and exec a child process determined by `self.argv`.
    ///
    /// The child requests `PTRACE_TRACEME` before exec, so its first stop is the
    /// `SIGTRAP` delivered on a successful `execve()`. If setup or exec fails, the
    /// child exits with status 127 and no stop is ever observed.
    pub fn fork_exec(&self) -> Result<Pid, Error> {
        // Heap-allocates, must occur pre-fork.
        let argv = self.argv();
        let disable_aslr = self.disable_aslr;

        match unsafe { fork() }? {
            ForkResult::Child => {
                // Only async-signal-safe calls from here on: no `?`, no panics, no
                // allocation. Any failure ends the child with `EXEC_FAILED`.
                if ptrace::traceme().is_err() {
                    unsafe { libc::_exit(EXEC_FAILED) };
                }

                if disable_aslr {
                    // Best effort: a kernel that refuses still runs the tracee.
                    if let Ok(persona) = personality::get() {
                        let _ = personality::set(persona | Persona::ADDR_NO_RANDOMIZE);
                    }
                }

                // Use unsafe `libc::execv`, because the `nix` wrapper heap-allocates a
                // `Vec` internally, which is not async-signal-safe.
                unsafe {
                    libc::execv(argv[0], argv.as_ptr());
                    libc::_exit(EXEC_FAILED)
                }
            },
            ForkResult::Parent { child } => {
                debug!(pid = child.as_raw(), program = %self.program(), "forked tracee");
                Ok(child)
            },
        }
    }

    // Construct NUL-terminated arguments for `execv`. We heap-allocate to return a `Vec`,
    // and so must do this before calling `fork()`.
    fn argv(&self) -> Vec<*const libc::c_char> {
        let mut argv: Vec<_> = self.argv
            .iter()
            .map(|s| s.as_ptr())
            .collect();
        argv.push(std::ptr::null());
        argv
    }
}
