use std::fmt;

use nix::errno::Errno;

use crate::controller::{Pid, Restart};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to launch `{program}`: {reason}")]
    Launch { program: String, reason: String },

    #[error("could not attach to tracee = {pid}")]
    Attach { pid: Pid, source: nix::Error },

    #[error("cannot access tracee memory at {addr:#x}: {kind}")]
    MemoryAccess { addr: u64, kind: MemoryAccessKind },

    #[error("could not fetch registers of tracee = {pid}")]
    RegisterFetch { pid: Pid, source: nix::Error },

    #[error("could not write register `{name}` of tracee = {pid}")]
    RegisterWrite { pid: Pid, name: &'static str, source: nix::Error },

    #[error("unknown register name `{0}`")]
    UnknownRegisterName(String),

    #[error("invalid number `{0}`")]
    InvalidNumber(String),

    #[error("no runnable process")]
    NotRunnable,

    #[error("tracee died, pid = {pid}")]
    TraceeDied { pid: Pid, source: nix::Error },

    #[error("could not restart tracee = {pid} with mode = {mode:?}")]
    Restart { pid: Pid, mode: Restart, source: nix::Error },

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn tracee_died(&self) -> bool {
        matches!(self, Error::TraceeDied { .. })
    }
}

/// Reason the OS rejected a read or write of tracee memory.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MemoryAccessKind {
    BadAddress,
    PermissionDenied,
    NoSuchProcess,
    IoFault,
    ResourceBusy,
    BadArgument,
    Other(Errno),
}

impl From<Errno> for MemoryAccessKind {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::EFAULT => MemoryAccessKind::BadAddress,
            Errno::EPERM => MemoryAccessKind::PermissionDenied,
            Errno::ESRCH => MemoryAccessKind::NoSuchProcess,
            Errno::EIO => MemoryAccessKind::IoFault,
            Errno::EBUSY => MemoryAccessKind::ResourceBusy,
            Errno::EINVAL => MemoryAccessKind::BadArgument,
            errno => MemoryAccessKind::Other(errno),
        }
    }
}

impl fmt::Display for MemoryAccessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryAccessKind::BadAddress => write!(f, "bad address (EFAULT)"),
            MemoryAccessKind::PermissionDenied => write!(f, "permission denied (EPERM)"),
            MemoryAccessKind::NoSuchProcess => write!(f, "no such process (ESRCH)"),
            MemoryAccessKind::IoFault => write!(f, "I/O fault (EIO)"),
            MemoryAccessKind::ResourceBusy => write!(f, "resource busy (EBUSY)"),
            MemoryAccessKind::BadArgument => write!(f, "bad argument (EINVAL)"),
            MemoryAccessKind::Other(errno) => write!(f, "{}", errno.desc()),
        }
    }
}

pub(crate) trait ResultExt<T> {
    /// Map `ESRCH` to [`Error::TraceeDied`], which callers treat as an exit.
    fn died_if_esrch(self, pid: Pid) -> Result<T>;
}

impl<T> ResultExt<T> for std::result::Result<T, nix::Error> {
    fn died_if_esrch(self, pid: Pid) -> Result<T> {
        self.map_err(|source| match source {
            Errno::ESRCH => Error::TraceeDied { pid, source },
            source => Error::OS(source),
        })
    }
}

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_access_kind_from_errno() {
        assert_eq!(MemoryAccessKind::from(Errno::EFAULT), MemoryAccessKind::BadAddress);
        assert_eq!(MemoryAccessKind::from(Errno::EPERM), MemoryAccessKind::PermissionDenied);
        assert_eq!(MemoryAccessKind::from(Errno::ESRCH), MemoryAccessKind::NoSuchProcess);
        assert_eq!(MemoryAccessKind::from(Errno::EIO), MemoryAccessKind::IoFault);
        assert_eq!(MemoryAccessKind::from(Errno::EBUSY), MemoryAccessKind::ResourceBusy);
        assert_eq!(MemoryAccessKind::from(Errno::EINVAL), MemoryAccessKind::BadArgument);
        assert_eq!(MemoryAccessKind::from(Errno::ENOMEM), MemoryAccessKind::Other(Errno::ENOMEM));
    }

    #[test]
    fn test_died_if_esrch() {
        let pid = Pid::from_raw(1);

        let err = Err::<(), _>(Errno::ESRCH).died_if_esrch(pid).unwrap_err();
        assert!(err.tracee_died());

        let err = Err::<(), _>(Errno::EIO).died_if_esrch(pid).unwrap_err();
        assert!(!err.tracee_died());
        assert!(matches!(err, Error::OS(Errno::EIO)));
    }
}
