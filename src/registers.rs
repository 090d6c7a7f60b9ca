//! Register access for a stopped tracee.
//!
//! Nothing here is cached: every call goes to the kernel, so values are never
//! stale across a continue or step.

use nix::{errno::Errno, sys::ptrace, unistd::Pid};
use tracing::trace;

use crate::error::{Error, Result};
use crate::x86::{Register, Registers, REGISTERS};

/// Fetch the full general-purpose register block with one `PTRACE_GETREGS`.
pub fn snapshot(pid: Pid) -> Result<Registers> {
    ptrace::getregs(pid).map_err(|source| Error::RegisterFetch { pid, source })
}

pub fn get(pid: Pid, name: &str) -> Result<u64> {
    let reg = Register::from_name(name)?;
    let regs = snapshot(pid)?;

    Ok(reg.get(&regs))
}

pub fn set(pid: Pid, name: &str, value: u64) -> Result<()> {
    let reg = Register::from_name(name)?;
    poke_user(pid, reg, value)
}

/// Every register name and value, in [`REGISTERS`] order.
pub fn dump(pid: Pid) -> Result<Vec<(&'static str, u64)>> {
    let regs = snapshot(pid)?;

    Ok(REGISTERS
        .iter()
        .map(|d| (d.name, d.register.get(&regs)))
        .collect())
}

pub fn pc(pid: Pid) -> Result<u64> {
    Ok(snapshot(pid)?.rip)
}

pub fn set_pc(pid: Pid, pc: u64) -> Result<()> {
    poke_user(pid, Register::Rip, pc)
}

fn poke_user(pid: Pid, reg: Register, data: u64) -> Result<()> {
    let off = reg.user_offset();
    trace!(pid = pid.as_raw(), reg = reg.name(), off, data, "PTRACE_POKEUSER");

    // SAFETY: `off` is a register slot inside `struct user`, which the kernel
    // validates; no tracer memory is touched.
    let res = unsafe {
        libc::ptrace(
            libc::PTRACE_POKEUSER,
            pid.as_raw(),
            off,
            data,
        )
    };

    Errno::result(res)
        .map(drop)
        .map_err(|source| Error::RegisterWrite { pid, name: reg.name(), source })
}

/// Parse a register value: `0x`/`0X`-prefixed hexadecimal, otherwise decimal.
pub fn parse_value(text: &str) -> Result<u64> {
    let invalid = || Error::InvalidNumber(text.to_owned());

    match strip_hex_prefix(text) {
        Some(hex) => parse_hex(hex).ok_or_else(invalid),
        None => {
            if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            text.parse().map_err(|_| invalid())
        },
    }
}

/// Parse a breakpoint address, which must be `0x`-prefixed hexadecimal.
pub fn parse_address(text: &str) -> Result<u64> {
    strip_hex_prefix(text)
        .and_then(parse_hex)
        .ok_or_else(|| Error::InvalidNumber(text.to_owned()))
}

fn strip_hex_prefix(text: &str) -> Option<&str> {
    text.strip_prefix("0x").or_else(|| text.strip_prefix("0X"))
}

fn parse_hex(digits: &str) -> Option<u64> {
    // `from_str_radix` tolerates a leading `+`, which we don't.
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}
