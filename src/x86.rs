//! The x86-64 general-purpose register set, as laid out by `PTRACE_GETREGS`.

use crate::error::{Error, Result};

/// Register state of a tracee.
pub type Registers = libc::user_regs_struct;

/// A general-purpose register, in `user_regs_struct` order.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Register {
    R15 = 0,
    R14,
    R13,
    R12,
    Rbp,
    Rbx,
    R11,
    R10,
    R9,
    R8,
    Rax,
    Rcx,
    Rdx,
    Rsi,
    Rdi,
    OrigRax,
    Rip,
    Cs,
    Eflags,
    Rsp,
    Ss,
    FsBase,
    GsBase,
    Ds,
    Es,
    Fs,
    Gs,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegisterDescriptor {
    pub register: Register,

    /// Register number in the System V AMD64 DWARF mapping, if it has one.
    pub dwarf: Option<u16>,

    pub name: &'static str,
}

const fn desc(register: Register, dwarf: i32, name: &'static str) -> RegisterDescriptor {
    let dwarf = if dwarf < 0 { None } else { Some(dwarf as u16) };
    RegisterDescriptor { register, dwarf, name }
}

/// Every supported register. Dumps are printed in this order.
pub const REGISTERS: [RegisterDescriptor; 27] = [
    desc(Register::R15, 15, "r15"),
    desc(Register::R14, 14, "r14"),
    desc(Register::R13, 13, "r13"),
    desc(Register::R12, 12, "r12"),
    desc(Register::Rbp, 6, "rbp"),
    desc(Register::Rbx, 3, "rbx"),
    desc(Register::R11, 11, "r11"),
    desc(Register::R10, 10, "r10"),
    desc(Register::R9, 9, "r9"),
    desc(Register::R8, 8, "r8"),
    desc(Register::Rax, 0, "rax"),
    desc(Register::Rcx, 2, "rcx"),
    desc(Register::Rdx, 1, "rdx"),
    desc(Register::Rsi, 4, "rsi"),
    desc(Register::Rdi, 5, "rdi"),
    desc(Register::OrigRax, -1, "orig_rax"),
    desc(Register::Rip, -1, "rip"),
    desc(Register::Cs, 51, "cs"),
    desc(Register::Eflags, 49, "eflags"),
    desc(Register::Rsp, 7, "rsp"),
    desc(Register::Ss, 52, "ss"),
    desc(Register::FsBase, 58, "fs_base"),
    desc(Register::GsBase, 59, "gs_base"),
    desc(Register::Ds, 53, "ds"),
    desc(Register::Es, 50, "es"),
    desc(Register::Fs, 54, "fs"),
    desc(Register::Gs, 55, "gs"),
];

impl Register {
    /// Resolve a register by its exact name. Unknown names are an error, never a
    /// neighbouring slot.
    pub fn from_name(name: &str) -> Result<Self> {
        REGISTERS
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.register)
            .ok_or_else(|| Error::UnknownRegisterName(name.to_owned()))
    }

    pub fn from_dwarf(dwarf: u16) -> Option<Self> {
        REGISTERS
            .iter()
            .find(|d| d.dwarf == Some(dwarf))
            .map(|d| d.register)
    }

    pub fn descriptor(self) -> &'static RegisterDescriptor {
        &REGISTERS[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.descriptor().name
    }

    /// Return the offset of this register in the virtual `user` struct, as used by
    /// `PTRACE_PEEKUSER` and `PTRACE_POKEUSER`.
    pub(crate) fn user_offset(self) -> u64 {
        use memoffset::offset_of;

        let field = match self {
            Register::R15 => offset_of!(libc::user_regs_struct, r15),
            Register::R14 => offset_of!(libc::user_regs_struct, r14),
            Register::R13 => offset_of!(libc::user_regs_struct, r13),
            Register::R12 => offset_of!(libc::user_regs_struct, r12),
            Register::Rbp => offset_of!(libc::user_regs_struct, rbp),
            Register::Rbx => offset_of!(libc::user_regs_struct, rbx),
            Register::R11 => offset_of!(libc::user_regs_struct, r11),
            Register::R10 => offset_of!(libc::user_regs_struct, r10),
            Register::R9 => offset_of!(libc::user_regs_struct, r9),
            Register::R8 => offset_of!(libc::user_regs_struct, r8),
            Register::Rax => offset_of!(libc::user_regs_struct, rax),
            Register::Rcx => offset_of!(libc::user_regs_struct, rcx),
            Register::Rdx => offset_of!(libc::user_regs_struct, rdx),
            Register::Rsi => offset_of!(libc::user_regs_struct, rsi),
            Register::Rdi => offset_of!(libc::user_regs_struct, rdi),
            Register::OrigRax => offset_of!(libc::user_regs_struct, orig_rax),
            Register::Rip => offset_of!(libc::user_regs_struct, rip),
            Register::Cs => offset_of!(libc::user_regs_struct, cs),
            Register::Eflags => offset_of!(libc::user_regs_struct, eflags),
            Register::Rsp => offset_of!(libc::user_regs_struct, rsp),
            Register::Ss => offset_of!(libc::user_regs_struct, ss),
            Register::FsBase => offset_of!(libc::user_regs_struct, fs_base),
            Register::GsBase => offset_of!(libc::user_regs_struct, gs_base),
            Register::Ds => offset_of!(libc::user_regs_struct, ds),
            Register::Es => offset_of!(libc::user_regs_struct, es),
            Register::Fs => offset_of!(libc::user_regs_struct, fs),
            Register::Gs => offset_of!(libc::user_regs_struct, gs),
        };

        (offset_of!(libc::user, regs) + field) as u64
    }

    pub fn get(self, regs: &Registers) -> u64 {
        match self {
            Register::R15 => regs.r15,
            Register::R14 => regs.r14,
            Register::R13 => regs.r13,
            Register::R12 => regs.r12,
            Register::Rbp => regs.rbp,
            Register::Rbx => regs.rbx,
            Register::R11 => regs.r11,
            Register::R10 => regs.r10,
            Register::R9 => regs.r9,
            Register::R8 => regs.r8,
            Register::Rax => regs.rax,
            Register::Rcx => regs.rcx,
            Register::Rdx => regs.rdx,
            Register::Rsi => regs.rsi,
            Register::Rdi => regs.rdi,
            Register::OrigRax => regs.orig_rax,
            Register::Rip => regs.rip,
            Register::Cs => regs.cs,
            Register::Eflags => regs.eflags,
            Register::Rsp => regs.rsp,
            Register::Ss => regs.ss,
            Register::FsBase => regs.fs_base,
            Register::GsBase => regs.gs_base,
            Register::Ds => regs.ds,
            Register::Es => regs.es,
            Register::Fs => regs.fs,
            Register::Gs => regs.gs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_matches_enum_order() {
        for (i, d) in REGISTERS.iter().enumerate() {
            assert_eq!(d.register as usize, i, "{}", d.name);
            assert_eq!(d.register.name(), d.name);
        }
    }

    #[test]
    fn test_user_offsets_follow_struct_layout() {
        // `regs` leads the `user` struct, and every slot is one machine word.
        for d in REGISTERS.iter() {
            assert_eq!(d.register.user_offset(), 8 * d.register as u64, "{}", d.name);
        }
    }

    #[test]
    fn test_from_name() {
        assert_eq!(Register::from_name("rax").unwrap(), Register::Rax);
        assert_eq!(Register::from_name("orig_rax").unwrap(), Register::OrigRax);
        assert_eq!(Register::from_name("gs").unwrap(), Register::Gs);

        assert!(matches!(Register::from_name("RAX"), Err(Error::UnknownRegisterName(_))));
        assert!(matches!(Register::from_name("rflags"), Err(Error::UnknownRegisterName(_))));
        assert!(matches!(Register::from_name(""), Err(Error::UnknownRegisterName(_))));
    }

    #[test]
    fn test_from_dwarf() {
        assert_eq!(Register::from_dwarf(0), Some(Register::Rax));
        assert_eq!(Register::from_dwarf(7), Some(Register::Rsp));
        assert_eq!(Register::from_dwarf(49), Some(Register::Eflags));
        assert_eq!(Register::from_dwarf(16), None);
    }

    #[test]
    fn test_get_reads_named_field() {
        let mut regs: Registers = unsafe { std::mem::zeroed() };
        regs.rax = 0xdeadbeef;
        regs.rip = 0x401000;

        assert_eq!(Register::Rax.get(&regs), 0xdeadbeef);
        assert_eq!(Register::Rip.get(&regs), 0x401000);
        assert_eq!(Register::Rbx.get(&regs), 0);
    }
}
