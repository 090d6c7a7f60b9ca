use anyhow::Result;
use ntest::timeout;
use pretty_assertions::assert_eq;
use tdbg::{breakpoint::INT3, Breakpoint, Error, ParseError, Reply, State};

mod support;
use support::*;

#[test]
#[timeout(2000)]
fn test_enable_disable_round_trip() -> Result<()> {
    let engine = launch(&[&program("true")])?;
    let pid = pid(&engine)?;
    let entry = engine.controller().pc()?;

    let before = read_word(pid, entry)?;

    let mut bp = Breakpoint::new(pid, entry);
    bp.enable()?;

    let armed = read_word(pid, entry)?;
    assert_eq!(armed & 0xff, u64::from(INT3));
    assert_eq!(armed & !0xff, before & !0xff);
    assert_eq!(u64::from(bp.saved_byte()), before & 0xff);

    // Re-enabling must not save the trap byte as the original.
    bp.enable()?;
    assert_eq!(u64::from(bp.saved_byte()), before & 0xff);
    assert_eq!(read_word(pid, entry)?, armed);

    bp.disable()?;
    assert_eq!(read_word(pid, entry)?, before);
    assert!(!bp.is_enabled());

    bp.disable()?;
    assert_eq!(read_word(pid, entry)?, before);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_continue_stops_at_breakpoint() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;
    let pid = pid(&engine)?;
    let entry = engine.controller().pc()?;
    let before = read_word(pid, entry)?;

    let set = format!("break {entry:#x}");

    let reply = engine.execute(&set);
    assert!(matches!(reply, Reply::BreakpointSet { addr } if addr == entry), "{reply}");
    assert_eq!(read_word(pid, entry)? & 0xff, u64::from(INT3));

    let reply = engine.execute(&set);
    assert!(matches!(reply, Reply::BreakpointAlreadySet { addr } if addr == entry), "{reply}");
    assert_eq!(engine.breakpoints().len(), 1);

    let reply = engine.execute("continue");
    assert!(matches!(reply, Reply::Breakpoint { addr } if addr == entry), "{reply}");

    // Rewound onto the trapped instruction, with its original byte back.
    assert_eq!(engine.controller().pc()?, entry);
    assert_eq!(read_word(pid, entry)?, before);
    assert_eq!(engine.breakpoints().addresses(), vec![entry]);

    let bp = engine.breakpoints().lookup(entry).expect("breakpoint kept after hit");
    assert!(bp.is_enabled());
    assert!(!bp.is_armed());

    let reply = engine.execute("c");
    assert!(matches!(reply, Reply::Exited { exit_code: 0 }), "{reply}");
    assert_eq!(engine.state(), State::Exited);
    assert!(engine.breakpoints().is_empty());

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_break_again_rearms_hit_breakpoint() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;
    let pid = pid(&engine)?;
    let entry = engine.controller().pc()?;
    let before = read_word(pid, entry)?;

    let set = format!("break {entry:#x}");
    engine.execute(&set);

    let reply = engine.execute("continue");
    assert!(matches!(reply, Reply::Breakpoint { addr } if addr == entry), "{reply}");

    // Step off the trapped instruction before putting the trap back.
    let reply = engine.execute("next");
    assert!(matches!(reply, Reply::Stepped { pc } if pc != entry), "{reply}");
    assert_eq!(read_word(pid, entry)?, before);

    let reply = engine.execute(&set);
    assert!(matches!(reply, Reply::BreakpointRearmed { addr } if addr == entry), "{reply}");
    assert_eq!(reply.to_string(), format!("breakpoint re-armed at {entry:#x}"));

    let armed = read_word(pid, entry)?;
    assert_eq!(armed & 0xff, u64::from(INT3));
    assert_eq!(armed & !0xff, before & !0xff);

    let bp = engine.breakpoints().lookup(entry).expect("breakpoint still set");
    assert!(bp.is_enabled());
    assert!(bp.is_armed());
    assert_eq!(u64::from(bp.saved_byte()), before & 0xff);

    let reply = engine.execute(&set);
    assert!(matches!(reply, Reply::BreakpointAlreadySet { .. }), "{reply}");
    assert_eq!(engine.breakpoints().len(), 1);

    // The byte saved on the first `break` is the one put back.
    engine.execute(&format!("delete {entry:#x}"));
    assert_eq!(read_word(pid, entry)?, before);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_step_onto_breakpoint_does_not_restore() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;
    let pid = pid(&engine)?;
    let entry = engine.controller().pc()?;

    engine.execute(&format!("break {entry:#x}"));

    let reply = engine.execute("next");
    assert!(matches!(reply, Reply::Stepped { pc } if pc == entry + 1), "{reply}");
    assert_eq!(read_word(pid, entry)? & 0xff, u64::from(INT3));

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_unreached_breakpoint_then_exit() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;

    // Mapped and writable, but never executed.
    let addr = engine.controller().read_register("rsp")? - 64;

    let reply = engine.execute(&format!("break {addr:#x}"));
    assert!(matches!(reply, Reply::BreakpointSet { .. }), "{reply}");

    let reply = engine.execute("continue");
    assert!(matches!(reply, Reply::Exited { exit_code: 0 }), "{reply}");
    assert!(engine.breakpoints().is_empty());

    for line in ["continue", "next", "break 0x1000", "register read rax", "register dump", "kill"] {
        let reply = engine.execute(line);
        assert!(matches!(reply, Reply::NoRunnableProcess), "{line}: {reply}");
        assert_eq!(reply.to_string(), "no runnable process");
    }

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_bad_breakpoints_are_not_inserted() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;

    let reply = engine.execute("break 0xZZZ");
    assert!(matches!(reply, Reply::Invalid(ParseError::InvalidNumber(_))), "{reply}");

    let reply = engine.execute("break 0x8");
    assert!(matches!(reply, Reply::Failed(Error::MemoryAccess { addr: 0x8, .. })), "{reply}");

    assert!(engine.breakpoints().is_empty());
    assert_eq!(engine.state(), State::Stopped);

    Ok(())
}

#[test]
#[timeout(2000)]
fn test_delete_restores_byte() -> Result<()> {
    let mut engine = launch(&[&program("true")])?;
    let pid = pid(&engine)?;
    let entry = engine.controller().pc()?;
    let before = read_word(pid, entry)?;

    engine.execute(&format!("break {entry:#x}"));

    let reply = engine.execute(&format!("delete {entry:#x}"));
    assert!(matches!(reply, Reply::BreakpointDeleted { addr } if addr == entry), "{reply}");
    assert_eq!(read_word(pid, entry)?, before);
    assert!(engine.breakpoints().is_empty());

    let reply = engine.execute(&format!("delete {entry:#x}"));
    assert!(matches!(reply, Reply::NoSuchBreakpoint { .. }), "{reply}");

    // Nothing left to trap on.
    let reply = engine.execute("continue");
    assert!(matches!(reply, Reply::Exited { exit_code: 0 }), "{reply}");

    Ok(())
}
