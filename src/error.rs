use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::remote::Pid;
use crate::supervisor::State;


pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error raised by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

macro_rules! internal_error {
    ($msg: expr) => {
        return Err($crate::error::Error::Internal($msg.into()))
    };
}

/// Direction of a failed remote memory access.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Access {
    Read,
    Write,
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Read => write!(f, "read"),
            Access::Write => write!(f, "write"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Could not load supervisor library {path:?}: {message}")]
    Load {
        path: PathBuf,
        message: String,
    },

    #[error("Supervisor library does not export `{name}`: {message}")]
    Symbol {
        name: &'static str,
        message: String,
    },

    #[error("Unsupported architecture: {machine}")]
    UnsupportedArchitecture { machine: String },

    #[error("Cannot {operation} while the bridge is {state:?}")]
    Protocol {
        operation: &'static str,
        state: State,
    },

    #[error("A handler is already registered for syscall {nr}")]
    DuplicateHandler { nr: u32 },

    #[error("Cannot install more than {limit} handlers in one process")]
    HandlerSlots { limit: usize },

    #[error("Invalid error code for a failed syscall: {code}")]
    InvalidErrno { code: i32 },

    #[error("String size {max_size} exceeds the limit of {limit} bytes")]
    StringTooLong { max_size: usize, limit: usize },

    #[error("Failed to {access} {len} bytes at {addr:#x} in pid = {pid}")]
    MemoryAccess {
        pid: Pid,
        addr: u64,
        len: usize,
        access: Access,
    },

    #[error("Handler failed: {0}")]
    Handler(#[source] BoxError),

    #[error("Input/output error")]
    IO(#[from] io::Error),

    #[error("OS error")]
    OS(#[from] nix::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Wrap any error raised inside a handler.
    pub fn handler(err: impl Into<BoxError>) -> Self {
        Error::Handler(err.into())
    }

    /// Returns `true` if the error concerns a single event, as opposed to aborting
    /// initialization.
    pub fn recoverable(&self) -> bool {
        matches!(
            self,
            Error::MemoryAccess { .. }
                | Error::Handler(..)
                | Error::InvalidErrno { .. }
                | Error::StringTooLong { .. }
        )
    }
}

pub(crate) trait StatusExt {
    /// Map a collaborator status code to a memory access result.
    fn check_access(self, pid: Pid, addr: u64, len: usize, access: Access) -> Result<()>;
}

impl StatusExt for i32 {
    fn check_access(self, pid: Pid, addr: u64, len: usize, access: Access) -> Result<()> {
        if self == 0 {
            Ok(())
        } else {
            Err(Error::MemoryAccess { pid, addr, len, access })
        }
    }
}

impl StatusExt for i64 {
    fn check_access(self, pid: Pid, addr: u64, len: usize, access: Access) -> Result<()> {
        if self == 0 {
            Ok(())
        } else {
            Err(Error::MemoryAccess { pid, addr, len, access })
        }
    }
}
