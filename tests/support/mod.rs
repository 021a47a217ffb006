#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use syshook::{
    Access, Error, Pid, RegistryHandle, RemoteMemory, ResolutionToken, Result, Supervisor, Tag,
    Thunk,
};

lazy_static! {
    static ref TRACING: () = {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    };
}

/// Install a log subscriber for the test binary, configured by `RUST_LOG`.
pub fn init_tracing() {
    lazy_static::initialize(&TRACING);
}

#[allow(unused)]
macro_rules! pid {
    ($raw: expr) => {
        syshook::Pid::from_raw($raw)
    };
}

/// What the monitored process observes after issuing a syscall.
#[allow(unused)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Outcome {
    /// No handler is installed for the syscall: it ran unobserved.
    NotIntercepted,

    /// A handler let the real syscall run.
    Executed,

    /// The real syscall was skipped, and this value returned in its place.
    Returned(i64),

    /// The trapped thread was left blocked.
    Blocked,

    /// No resolution was submitted.
    Unresolved,
}

/// A resolution submitted for one event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Resolution {
    pub cookie: usize,
    pub tag: Tag,
    pub payload: u64,
}

/// In-process collaborator: sparse fake memory, plus bookkeeping of every event it
/// delivers, so tests can check that each one is resolved exactly once.
#[derive(Clone, Default)]
pub struct FakeSupervisor {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    // Keyed by `(pid, base)`.
    regions: Mutex<BTreeMap<(i32, u64), Vec<u8>>>,

    callbacks: Mutex<BTreeMap<u32, Thunk>>,
    registries: AtomicUsize,
    started: AtomicBool,
    fail_start: AtomicBool,

    next_cookie: AtomicUsize,
    pending: Mutex<BTreeSet<usize>>,
    resolutions: Mutex<Vec<Resolution>>,
    violations: Mutex<Vec<String>>,
}

#[allow(unused)]
impl FakeSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `start()` fail.
    pub fn fail_start(&self) {
        self.inner.fail_start.store(true, Ordering::SeqCst);
    }

    pub fn started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// Map `len` zeroed bytes at `base` in `pid`.
    pub fn map(&self, pid: Pid, base: u64, len: usize) {
        let mut regions = self.inner.regions.lock().unwrap();
        regions.insert((pid.as_raw(), base), vec![0; len]);
    }

    /// Write directly into fake memory, as the monitored process itself would.
    pub fn poke(&self, pid: Pid, addr: u64, data: &[u8]) {
        self.with_region(pid, addr, data.len(), |bytes| bytes.copy_from_slice(data))
            .expect("poke of unmapped memory");
    }

    /// Read directly from fake memory, as the monitored process itself would.
    pub fn peek(&self, pid: Pid, addr: u64, len: usize) -> Vec<u8> {
        self.with_region(pid, addr, len, |bytes| bytes.to_vec())
            .expect("peek of unmapped memory")
    }

    /// Syscall numbers with a registered callback.
    pub fn callbacks(&self) -> Vec<u32> {
        self.inner.callbacks.lock().unwrap().keys().copied().collect()
    }

    pub fn resolutions(&self) -> Vec<Resolution> {
        self.inner.resolutions.lock().unwrap().clone()
    }

    pub fn violations(&self) -> Vec<String> {
        self.inner.violations.lock().unwrap().clone()
    }

    /// Number of delivered events still awaiting resolution.
    pub fn pending(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }

    /// Issue syscall `nr` from `pid`, and report what the process observes.
    pub fn trap(&self, pid: Pid, nr: u32, args: [u64; 6]) -> Outcome {
        self.trap_at(pid, nr, 0x40_1000, args)
    }

    pub fn trap_at(&self, pid: Pid, nr: u32, pc: u64, args: [u64; 6]) -> Outcome {
        if !self.started() {
            return Outcome::NotIntercepted;
        }

        let thunk = match self.inner.callbacks.lock().unwrap().get(&nr) {
            Some(thunk) => *thunk,
            None => return Outcome::NotIntercepted,
        };

        let cookie = self.inner.next_cookie.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.pending.lock().unwrap().insert(cookie);

        unsafe {
            let token = ResolutionToken::from_raw(cookie as *mut c_void);
            thunk.invoke(token, pid.as_raw() as u32, nr as i32, pc, args);
        }

        let resolution = self
            .inner
            .resolutions
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.cookie == cookie)
            .copied();

        match resolution {
            None => {
                self.violation(format!("event {cookie} for syscall {nr} was never resolved"));
                Outcome::Unresolved
            },
            Some(Resolution { tag: Tag::Continue, .. }) => Outcome::Executed,
            Some(Resolution { tag: Tag::Return, payload, .. }) => Outcome::Returned(payload as i64),
            Some(Resolution { tag: Tag::Fail, payload, .. }) => Outcome::Returned(-(payload as i64)),
            Some(Resolution { tag: Tag::NeverRespond, .. }) => Outcome::Blocked,
        }
    }

    fn violation(&self, msg: String) {
        self.inner.violations.lock().unwrap().push(msg);
    }

    fn with_region<T>(
        &self,
        pid: Pid,
        addr: u64,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> T,
    ) -> Option<T> {
        let mut regions = self.inner.regions.lock().unwrap();

        let ((_, base), bytes) = regions
            .range_mut((pid.as_raw(), 0)..=(pid.as_raw(), addr))
            .next_back()?;

        let start = usize::try_from(addr - *base).ok()?;
        let end = start.checked_add(len)?;

        if end > bytes.len() {
            return None;
        }

        Some(f(&mut bytes[start..end]))
    }
}

impl RemoteMemory for FakeSupervisor {
    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64> {
        let mut word = [0; 8];
        self.read_bytes(pid, addr, &mut word)?;
        Ok(u64::from_ne_bytes(word))
    }

    fn read_c_string(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let at = addr + i as u64;
            let value = self.with_region(pid, at, 1, |b| b[0]).ok_or(Error::MemoryAccess {
                pid,
                addr: at,
                len: 1,
                access: Access::Read,
            })?;

            *byte = value;

            if value == 0 {
                break;
            }
        }

        Ok(())
    }

    fn read_bytes(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()> {
        let len = buf.len();
        self.with_region(pid, addr, len, |bytes| buf.copy_from_slice(bytes))
            .ok_or(Error::MemoryAccess { pid, addr, len, access: Access::Read })
    }

    fn write_bytes(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()> {
        let len = data.len();
        self.with_region(pid, addr, len, |bytes| bytes.copy_from_slice(data))
            .ok_or(Error::MemoryAccess { pid, addr, len, access: Access::Write })
    }
}

impl Supervisor for FakeSupervisor {
    fn new_registry(&self) -> Result<RegistryHandle> {
        let n = self.inner.registries.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(RegistryHandle(n as *mut c_void))
    }

    unsafe fn add_callback(&self, _registry: RegistryHandle, nr: u32, thunk: Thunk) -> Result<()> {
        if self.started() {
            self.violation(format!("callback for syscall {nr} added after start"));
        }

        self.inner.callbacks.lock().unwrap().insert(nr, thunk);
        Ok(())
    }

    fn start(&self, _registry: RegistryHandle) -> Result<()> {
        if self.inner.fail_start.swap(false, Ordering::SeqCst) {
            return Err(Error::Internal("fake start failure".into()));
        }

        if self.inner.started.swap(true, Ordering::SeqCst) {
            self.violation("started twice".into());
        }

        Ok(())
    }

    fn resolve(&self, token: ResolutionToken, tag: Tag, payload: u64) {
        let cookie = token.into_raw() as usize;

        if !self.inner.pending.lock().unwrap().remove(&cookie) {
            self.violation(format!("event {cookie} resolved twice, or never delivered"));
            return;
        }

        self.inner.resolutions.lock().unwrap().push(Resolution { cookie, tag, payload });
    }
}
