//! A [`Supervisor`] provided by a shared library, loaded into the monitored process.

use std::ffi::{c_void, CStr, CString};
use std::fmt;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::error::{Access, Error, Result, StatusExt};
use crate::remote::{Pid, RemoteMemory};
use crate::response::Tag;
use crate::supervisor::{RegistryHandle, ResolutionToken, State, Supervisor, Thunk, ThunkFn};

/// Set by the first successful [`Supervisor::start()`] of any library in this process.
static STARTED: AtomicBool = AtomicBool::new(false);

const WORD_SIZE: usize = mem::size_of::<u64>();

/// How to load a supervisor library.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LoadOptions {
    path: PathBuf,

    /// Resolve symbols lazily (`RTLD_LAZY`), instead of at load time (`RTLD_NOW`).
    ///
    /// Defaults to `true`.
    lazy: bool,

    /// Make the library's symbols available to subsequently-loaded libraries.
    ///
    /// Defaults to `false`.
    global: bool,
}

impl LoadOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        Self { path, lazy: true, global: false }
    }

    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn global(mut self, global: bool) -> Self {
        self.global = global;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flags(&self) -> libc::c_int {
        let mut flags = if self.lazy { libc::RTLD_LAZY } else { libc::RTLD_NOW };

        if self.global {
            flags |= libc::RTLD_GLOBAL;
        }

        flags
    }
}

/// Out-parameter of `read_usize`.
#[repr(C)]
struct WordRead {
    status: i64,
    value: u64,
}

type NewCallbackMapFn = unsafe extern "C" fn() -> *mut c_void;
type InsertCallbackFn = unsafe extern "C" fn(*mut c_void, u32, ThunkFn);
type SuperviseFn = unsafe extern "C" fn(*mut c_void);
type ResolveFn = unsafe extern "C" fn(*mut c_void, u8, u64);
type ReadUsizeFn = unsafe extern "C" fn(*mut WordRead, u32, u64);
type ReadBufFn = unsafe extern "C" fn(*mut u8, usize, u32, u64) -> i32;
type WriteBufFn = unsafe extern "C" fn(*const u8, usize, u32, u64) -> i32;

/// Functions exported by the supervisor library.
struct Exports {
    new_callback_map: NewCallbackMapFn,
    insert_callback: InsertCallbackFn,
    supervise: SuperviseFn,
    resolve: ResolveFn,
    read_usize: ReadUsizeFn,
    read_c_string: ReadBufFn,
    read_byte_array: ReadBufFn,
    write_buf: WriteBufFn,
}

impl Exports {
    unsafe fn resolve_all(handle: *mut c_void) -> Result<Self> {
        Ok(Self {
            new_callback_map: symbol(handle, "new_callback_map")?,
            insert_callback: symbol(handle, "insert_callback")?,
            supervise: symbol(handle, "supervise")?,
            resolve: symbol(handle, "resolve")?,
            read_usize: symbol(handle, "read_usize")?,
            read_c_string: symbol(handle, "read_c_string")?,
            read_byte_array: symbol(handle, "read_byte_array")?,
            write_buf: symbol(handle, "write_buf")?,
        })
    }
}

/// Supervisor library opened with `dlopen(3)`.
///
/// The library is never closed: installed callbacks and pending events refer into it.
pub struct DylibSupervisor {
    path: PathBuf,
    handle: *mut c_void,
    exports: Exports,
}

// SAFETY: the library's exports may be called from any thread, and `handle` is only
// used during construction.
unsafe impl Send for DylibSupervisor {}
unsafe impl Sync for DylibSupervisor {}

impl DylibSupervisor {
    pub fn load(options: &LoadOptions) -> Result<Self> {
        let path = options.path().to_owned();

        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::Load {
            path: path.clone(),
            message: "path contains a NUL byte".into(),
        })?;

        let handle = unsafe { libc::dlopen(c_path.as_ptr(), options.flags()) };

        if handle.is_null() {
            let message = dl_error();
            return Err(Error::Load { path, message });
        }

        debug!(?path, "opened supervisor library");

        let exports = unsafe { Exports::resolve_all(handle)? };

        info!(?path, "loaded supervisor library");

        Ok(Self { path, handle, exports })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl fmt::Debug for DylibSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DylibSupervisor")
            .field("path", &self.path)
            .field("handle", &self.handle)
            .finish()
    }
}

impl RemoteMemory for DylibSupervisor {
    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64> {
        let mut out = WordRead { status: 0, value: 0 };

        unsafe { (self.exports.read_usize)(&mut out, raw_pid(pid), addr) };
        out.status.check_access(pid, addr, WORD_SIZE, Access::Read)?;

        Ok(out.value)
    }

    fn read_c_string(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let status = unsafe {
            (self.exports.read_c_string)(buf.as_mut_ptr(), buf.len(), raw_pid(pid), addr)
        };

        status.check_access(pid, addr, buf.len(), Access::Read)
    }

    fn read_bytes(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let status = unsafe {
            (self.exports.read_byte_array)(buf.as_mut_ptr(), buf.len(), raw_pid(pid), addr)
        };

        status.check_access(pid, addr, buf.len(), Access::Read)
    }

    fn write_bytes(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let status = unsafe {
            (self.exports.write_buf)(data.as_ptr(), data.len(), raw_pid(pid), addr)
        };

        status.check_access(pid, addr, data.len(), Access::Write)
    }
}

impl Supervisor for DylibSupervisor {
    fn new_registry(&self) -> Result<RegistryHandle> {
        let map = unsafe { (self.exports.new_callback_map)() };

        if map.is_null() {
            internal_error!("supervisor returned a null callback map");
        }

        Ok(RegistryHandle(map))
    }

    unsafe fn add_callback(&self, registry: RegistryHandle, nr: u32, thunk: Thunk) -> Result<()> {
        (self.exports.insert_callback)(registry.0, nr, thunk.entry);

        Ok(())
    }

    fn start(&self, registry: RegistryHandle) -> Result<()> {
        if STARTED.swap(true, Ordering::AcqRel) {
            let state = State::Supervising;
            return Err(Error::Protocol { operation: "start another supervisor", state });
        }

        unsafe { (self.exports.supervise)(registry.0) };

        Ok(())
    }

    fn resolve(&self, token: ResolutionToken, tag: Tag, payload: u64) {
        unsafe { (self.exports.resolve)(token.into_raw(), tag.into(), payload) }
    }
}

fn raw_pid(pid: Pid) -> u32 {
    pid.as_raw() as u32
}

unsafe fn symbol<T: Copy>(handle: *mut c_void, name: &'static str) -> Result<T> {
    debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<*mut c_void>());

    let c_name = match CString::new(name) {
        Ok(c_name) => c_name,
        Err(_) => internal_error!("symbol name contains a NUL byte"),
    };

    // Clear any stale error, so a null symbol can be told apart from a failed lookup.
    libc::dlerror();

    let sym = libc::dlsym(handle, c_name.as_ptr());

    if sym.is_null() {
        let message = dl_error();
        return Err(Error::Symbol { name, message });
    }

    Ok(mem::transmute_copy(&sym))
}

fn dl_error() -> String {
    let msg = unsafe { libc::dlerror() };

    if msg.is_null() {
        return "unknown dynamic loader error".into();
    }

    unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
}
