#![allow(dead_code)]

use std::path::Path;

use anyhow::{anyhow, Result};
use tdbg::{Command, CommandEngine, Pid};

/// Absolute path of a system utility, since tracees are exec'd without a `PATH` search.
pub fn program(name: &str) -> String {
    ["/bin", "/usr/bin"]
        .iter()
        .map(|dir| format!("{dir}/{name}"))
        .find(|path| Path::new(path).exists())
        .unwrap_or_else(|| panic!("`{name}` not found in /bin or /usr/bin"))
}

/// Launch `argv`, leaving the tracee in its post-exec stop.
pub fn launch(argv: &[&str]) -> Result<CommandEngine> {
    let mut engine = CommandEngine::new(Command::new(argv.to_vec())?);
    engine.launch()?;
    Ok(engine)
}

pub fn pid(engine: &CommandEngine) -> Result<Pid> {
    engine.controller().pid().ok_or_else(|| anyhow!("no tracee"))
}

/// Read the text word at `addr` directly, bypassing the debugger.
pub fn read_word(pid: Pid, addr: u64) -> Result<u64> {
    let word = nix::sys::ptrace::read(pid, addr as nix::sys::ptrace::AddressType)?;
    Ok(word as u64)
}
