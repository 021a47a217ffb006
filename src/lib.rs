//! Dispatch syscalls trapped by a privileged supervisor to Rust handlers.
//!
//! A [`Syshook`] binds to a supervisor (usually a [`DylibSupervisor`] loaded into the
//! monitored process), installs the handlers of a [`HandlerRegistry`] once, and resolves
//! every event those handlers see. Handlers inspect and modify the monitored process
//! through [`RemotePtr`]s.

#[macro_use]
pub mod error;

mod aarch64;
mod x86;

pub mod arch;
pub mod dylib;
pub mod registry;
pub mod remote;
pub mod response;
pub mod supervisor;

mod trampoline;

pub use arch::{Arch, SyscallTable};
pub use dylib::{DylibSupervisor, LoadOptions};
pub use error::{Access, Error, Result};
pub use nix::errno::Errno;
pub use registry::{Handler, HandlerRegistry, Syscall};
pub use remote::{Pid, RemoteAddress, RemoteMemory, RemotePtr, MAX_C_STRING_SIZE};
pub use response::{Response, Tag};
pub use supervisor::{RegistryHandle, ResolutionToken, State, Supervisor, Syshook, Thunk, ThunkFn};
