//! The contract with the privileged collaborator, and the binding that drives it.

use std::ffi::c_void;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::{debug, error, info};

use crate::arch::{Arch, SyscallTable};
use crate::dylib::{DylibSupervisor, LoadOptions};
use crate::error::{Error, Result};
use crate::registry::{HandlerRegistry, Installed};
use crate::remote::{Pid, RemoteMemory, RemotePtr};
use crate::response::{Response, Tag};
use crate::trampoline;

/// Entry point the collaborator calls when a syscall registered for it traps.
///
/// Arguments: resolution cookie, pid, syscall number, program counter, and the six raw
/// syscall arguments.
pub type ThunkFn =
    unsafe extern "C" fn(*mut c_void, u32, i32, u64, u64, u64, u64, u64, u64, u64);

/// A callback handed to the collaborator.
#[derive(Clone, Copy, Debug)]
pub struct Thunk {
    pub entry: ThunkFn,
}

impl Thunk {
    /// Deliver one trapped syscall, as the collaborator would.
    ///
    /// # Safety
    ///
    /// `self` must have been produced by [`Syshook::setup()`], and `token` must not have
    /// been resolved.
    pub unsafe fn invoke(&self, token: ResolutionToken, pid: u32, nr: i32, pc: u64, args: [u64; 6]) {
        let [a0, a1, a2, a3, a4, a5] = args;
        (self.entry)(token.into_raw(), pid, nr, pc, a0, a1, a2, a3, a4, a5)
    }
}

/// Single-use handle correlating a trapped syscall with its resolution.
///
/// Not `Clone`: resolving consumes it.
#[derive(Debug, Eq, PartialEq)]
pub struct ResolutionToken {
    cookie: *mut c_void,
}

// SAFETY: the cookie is opaque to us, and only ever passed back to the collaborator.
unsafe impl Send for ResolutionToken {}

impl ResolutionToken {
    /// # Safety
    ///
    /// `cookie` must identify a pending event of the collaborator, and must be wrapped at
    /// most once.
    pub unsafe fn from_raw(cookie: *mut c_void) -> Self {
        Self { cookie }
    }

    pub fn into_raw(self) -> *mut c_void {
        self.cookie
    }
}

/// Collaborator-side container of registered callbacks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RegistryHandle(pub *mut c_void);

// SAFETY: the handle is opaque to us, and only ever passed back to the collaborator.
unsafe impl Send for RegistryHandle {}
unsafe impl Sync for RegistryHandle {}

/// The privileged component that traps syscalls and performs remote memory I/O.
pub trait Supervisor: RemoteMemory {
    /// Allocate an empty callback container.
    fn new_registry(&self) -> Result<RegistryHandle>;

    /// Register `thunk` to be called whenever syscall `nr` traps.
    ///
    /// # Safety
    ///
    /// The collaborator may call `thunk` at any time after [`start()`](Supervisor::start),
    /// from any thread.
    unsafe fn add_callback(&self, registry: RegistryHandle, nr: u32, thunk: Thunk) -> Result<()>;

    /// Begin trapping syscalls. Irreversible.
    fn start(&self, registry: RegistryHandle) -> Result<()>;

    /// Complete one pending event.
    fn resolve(&self, token: ResolutionToken, tag: Tag, payload: u64);
}

/// Lifecycle of a [`Syshook`]. States are only ever left for a later one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum State {
    // Bound to a collaborator, nothing registered yet.
    Uninitialized = 0,

    // Setup claimed, handlers being registered.
    Configured = 1,

    // Interception requested. Terminal once the collaborator has started.
    Supervising = 2,

    // Setup did not complete. Terminal. Events that still arrive are resolved.
    Failed = 3,
}

impl State {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => State::Uninitialized,
            1 => State::Configured,
            2 => State::Supervising,
            _ => State::Failed,
        }
    }
}

/// Binding to a collaborator: installs handlers and resolves the events they handle.
///
/// Create one per process, share it by `Arc`, and call [`setup()`](Syshook::setup) once.
pub struct Syshook {
    arch: Arch,
    supervisor: Box<dyn Supervisor>,
    state: AtomicU8,

    /// Handlers referenced by the collaborator. Never freed.
    installed: OnceLock<Vec<&'static Installed>>,
}

impl Syshook {
    pub fn new(arch: Arch, supervisor: impl Supervisor + 'static) -> Arc<Self> {
        let supervisor = Box::new(supervisor);
        let state = AtomicU8::new(State::Uninitialized as u8);
        let installed = OnceLock::new();

        Arc::new(Self { arch, supervisor, state, installed })
    }

    /// Detect the architecture, then load the collaborator library described by `options`.
    pub fn load(options: &LoadOptions) -> Result<Arc<Self>> {
        let arch = Arch::detect()?;
        info!(?arch, path = ?options.path(), "loading supervisor");

        let supervisor = DylibSupervisor::load(options)?;

        Ok(Self::new(arch, supervisor))
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Syscall numbers of the running architecture.
    pub fn syscalls(&self) -> &'static SyscallTable {
        self.arch.syscalls()
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Pointer into `pid`, backed by this binding's memory primitives.
    pub fn ptr(&self, pid: Pid, addr: u64) -> RemotePtr<'_> {
        RemotePtr::new(self, pid, addr)
    }

    /// Syscall numbers with an installed handler, in ascending order.
    pub fn installed(&self) -> Vec<u32> {
        self.installed
            .get()
            .map(|entries| entries.iter().map(|entry| entry.nr()).collect())
            .unwrap_or_default()
    }

    /// Install every handler of `registry`, then start interception.
    ///
    /// May only be called once. A second call fails with [`Error::Protocol`], leaving the
    /// installed handlers as they were. If the first call fails, the bridge ends up
    /// [`State::Failed`].
    pub fn setup(self: &Arc<Self>, registry: HandlerRegistry) -> Result<()> {
        if let Err(state) = self.transition(State::Uninitialized, State::Configured) {
            return Err(Error::Protocol { operation: "set up", state });
        }

        info!(handlers = registry.len(), "configuring syscall interception");

        if let Err(err) = self.install(registry) {
            error!(%err, "could not set up syscall interception");
            self.state.store(State::Failed as u8, Ordering::Release);
            return Err(err);
        }

        info!("syscall interception active");

        Ok(())
    }

    fn install(self: &Arc<Self>, registry: HandlerRegistry) -> Result<()> {
        let handle = self.supervisor.new_registry()?;
        let mut installed = Vec::with_capacity(registry.len());

        for (nr, handler) in registry.into_handlers() {
            let entry = Installed::leak(nr, handler, Arc::clone(self));
            self.add_callback(handle, entry)?;
            installed.push(entry);
        }

        if self.installed.set(installed).is_err() {
            internal_error!("handler arena published twice");
        }

        // Events may arrive as soon as `start()` is called.
        if let Err(state) = self.transition(State::Configured, State::Supervising) {
            return Err(Error::Protocol { operation: "start supervising", state });
        }

        self.supervisor.start(handle)
    }

    fn add_callback(&self, handle: RegistryHandle, entry: &'static Installed) -> Result<()> {
        self.expect_state(State::Configured, "register a handler")?;

        debug!(nr = entry.nr(), "installing handler");

        let thunk = Thunk { entry: trampoline::bind(entry)? };

        // SAFETY: `entry` is leaked, so the trampoline bound to it never dangles.
        unsafe { self.supervisor.add_callback(handle, entry.nr(), thunk) }
    }

    /// Submit `response` as the resolution of the event identified by `token`.
    ///
    /// The token is always consumed. If no event can be pending in the current state,
    /// `Continue` is submitted instead, and an error returned.
    pub(crate) fn resolve(&self, token: ResolutionToken, response: Response) -> Result<()> {
        let state = self.state();

        let (res, response) = match state {
            State::Supervising | State::Failed => (Ok(()), response),
            _ => {
                let err = Error::Protocol { operation: "resolve a syscall", state };
                (Err(err), Response::Continue)
            },
        };

        let (tag, payload) = response.encode();
        self.supervisor.resolve(token, tag, payload);

        res
    }

    /// Move from `from` to `to`, or return the actual state.
    fn transition(&self, from: State, to: State) -> std::result::Result<(), State> {
        let res = self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire);

        match res {
            Ok(_) => {
                debug!(?from, ?to, "bridge state changed");
                Ok(())
            },
            Err(actual) => Err(State::from_u8(actual)),
        }
    }

    fn expect_state(&self, expected: State, operation: &'static str) -> Result<()> {
        let state = self.state();

        if state == expected {
            Ok(())
        } else {
            Err(Error::Protocol { operation, state })
        }
    }
}

impl RemoteMemory for Syshook {
    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64> {
        self.supervisor.read_word(pid, addr)
    }

    fn read_c_string(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.supervisor.read_c_string(pid, addr, buf)
    }

    fn read_bytes(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        self.supervisor.read_bytes(pid, addr, buf)
    }

    fn write_bytes(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        self.supervisor.write_bytes(pid, addr, data)
    }
}

impl fmt::Debug for Syshook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Syshook")
            .field("arch", &self.arch)
            .field("state", &self.state())
            .field("installed", &self.installed())
            .finish()
    }
}
