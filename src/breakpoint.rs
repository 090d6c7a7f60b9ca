//! Software breakpoints: a single `int3` byte spliced into tracee text.

use std::collections::BTreeMap;

use nix::{sys::ptrace, unistd::Pid};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// The x86 `int3` opcode.
pub const INT3: u8 = 0xcc;

/// Replace the low byte of a text word, leaving the other bytes untouched.
///
/// `PTRACE_PEEKTEXT` and `PTRACE_POKETEXT` move whole words, and on a little-endian
/// target the low byte of the word is the byte at the requested address.
pub fn splice_low_byte(word: u64, byte: u8) -> u64 {
    (word & !0xff) | u64::from(byte)
}

/// A software breakpoint at one address of one tracee.
///
/// `enabled` is the logical state requested by the operator. `armed` is the
/// physical one: whether `int3` is currently resident at `addr`. A breakpoint
/// that has been hit stays enabled but is no longer armed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Breakpoint {
    pid: Pid,
    addr: u64,
    saved: u8,
    enabled: bool,
    armed: bool,
}

impl Breakpoint {
    pub fn new(pid: Pid, addr: u64) -> Self {
        Self {
            pid,
            addr,
            saved: 0,
            enabled: false,
            armed: false,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    /// The original instruction byte, valid once enabled.
    pub fn saved_byte(&self) -> u8 {
        self.saved
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Save the original byte at `addr` and patch in `int3`.
    ///
    /// A no-op if already armed, so the saved byte is never overwritten with `int3`.
    pub fn enable(&mut self) -> Result<()> {
        if self.armed {
            return Ok(());
        }

        let word = self.read_word()?;
        let saved = (word & 0xff) as u8;
        self.write_word(splice_low_byte(word, INT3))?;

        debug!(addr = self.addr, saved, "armed breakpoint");

        self.saved = saved;
        self.enabled = true;
        self.armed = true;

        Ok(())
    }

    /// Restore the original byte, leaving the breakpoint logically set.
    pub fn restore(&mut self) -> Result<()> {
        if !self.armed {
            return Ok(());
        }

        let word = self.read_word()?;
        self.write_word(splice_low_byte(word, self.saved))?;

        debug!(addr = self.addr, saved = self.saved, "restored original byte");

        self.armed = false;

        Ok(())
    }

    /// Patch `int3` back in after a [`restore()`](Self::restore), keeping the byte
    /// saved by the first `enable()`.
    ///
    /// Falls back to `enable()` for a breakpoint that was never enabled.
    pub fn rearm(&mut self) -> Result<()> {
        if !self.enabled {
            return self.enable();
        }

        if self.armed {
            return Ok(());
        }

        let word = self.read_word()?;
        self.write_word(splice_low_byte(word, INT3))?;

        debug!(addr = self.addr, saved = self.saved, "re-armed breakpoint");

        self.armed = true;

        Ok(())
    }

    /// Restore the original byte and mark the breakpoint disabled.
    pub fn disable(&mut self) -> Result<()> {
        self.restore()?;
        self.enabled = false;

        Ok(())
    }

    fn read_word(&self) -> Result<u64> {
        let word = ptrace::read(self.pid, self.addr as ptrace::AddressType)
            .map_err(|errno| self.memory_error(errno))?;

        Ok(word as u64)
    }

    fn write_word(&self, word: u64) -> Result<()> {
        // SAFETY: `data` is passed by value as the word to store; the kernel never
        // dereferences it.
        unsafe {
            ptrace::write(
                self.pid,
                self.addr as ptrace::AddressType,
                word as ptrace::AddressType,
            )
        }
        .map_err(|errno| self.memory_error(errno))
    }

    fn memory_error(&self, errno: nix::Error) -> Error {
        Error::MemoryAccess { addr: self.addr, kind: errno.into() }
    }
}

/// Result of [`BreakpointTable::set()`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SetOutcome {
    Inserted,

    /// Already set, but not armed since it was last hit. The trap is back in place.
    Rearmed,

    /// Already set and armed. Nothing was written.
    AlreadySet,
}

/// All breakpoints of the current tracee, at most one per address.
#[derive(Debug, Default)]
pub struct BreakpointTable {
    breakpoints: BTreeMap<u64, Breakpoint>,
}

impl BreakpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set and arm a breakpoint at `addr`, or re-arm one that has been hit.
    ///
    /// On failure the table is left untouched.
    pub fn set(&mut self, pid: Pid, addr: u64) -> Result<SetOutcome> {
        if let Some(bp) = self.breakpoints.get_mut(&addr) {
            debug_assert_eq!(bp.pid, pid, "breakpoint of a previous tracee");

            if bp.is_armed() {
                debug!(addr, "breakpoint already set");
                return Ok(SetOutcome::AlreadySet);
            }

            bp.rearm()?;
            info!(pid = pid.as_raw(), addr, "re-armed breakpoint");

            return Ok(SetOutcome::Rearmed);
        }

        let mut bp = Breakpoint::new(pid, addr);
        bp.enable()?;
        self.breakpoints.insert(addr, bp);

        info!(pid = pid.as_raw(), addr, "set breakpoint");

        Ok(SetOutcome::Inserted)
    }

    /// Disable and forget the breakpoint at `addr`. Returns `false` if none was set.
    pub fn remove(&mut self, addr: u64) -> Result<bool> {
        let bp = match self.breakpoints.get_mut(&addr) {
            Some(bp) => bp,
            None => return Ok(false),
        };

        bp.disable()?;
        self.breakpoints.remove(&addr);

        info!(addr, "removed breakpoint");

        Ok(true)
    }

    pub fn lookup(&self, addr: u64) -> Option<&Breakpoint> {
        self.breakpoints.get(&addr)
    }

    pub fn lookup_mut(&mut self, addr: u64) -> Option<&mut Breakpoint> {
        self.breakpoints.get_mut(&addr)
    }

    /// Set addresses, ascending.
    pub fn addresses(&self) -> Vec<u64> {
        self.breakpoints.keys().copied().collect()
    }

    /// Restore every armed byte, e.g. before detaching from a live tracee.
    pub fn disarm_all(&mut self) -> Result<()> {
        for bp in self.breakpoints.values_mut() {
            bp.restore()?;
        }

        Ok(())
    }

    /// Forget every breakpoint without touching tracee memory, which may be gone.
    pub fn clear(&mut self) {
        if !self.breakpoints.is_empty() {
            debug!(count = self.breakpoints.len(), "clearing breakpoints");
        }

        self.breakpoints.clear();
    }

    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }
}
