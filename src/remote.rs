//! Addresses in the monitored process, and memory access through them.

use std::fmt;

use tracing::trace;

use crate::error::{Error, Result};

pub use nix::unistd::Pid;

/// Largest `max_size` accepted by [`RemotePtr::read_c_string()`].
pub const MAX_C_STRING_SIZE: usize = 1 << 20;

/// Privileged memory primitives into a monitored process.
///
/// Every call names the process it targets. Implementations must fail instead of
/// performing a short read or write.
pub trait RemoteMemory: Send + Sync {
    /// Read one pointer-sized word.
    fn read_word(&self, pid: Pid, addr: u64) -> Result<u64>;

    /// Read a NUL-terminated string into `buf`, reading at most `buf.len()` bytes.
    fn read_c_string(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Fill `buf` with exactly `buf.len()` bytes.
    fn read_bytes(&self, pid: Pid, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `data`.
    fn write_bytes(&self, pid: Pid, addr: u64, data: &[u8]) -> Result<()>;
}

/// An address in the address space of one specific process.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RemoteAddress {
    pid: Pid,
    addr: u64,
}

impl RemoteAddress {
    pub fn new(pid: Pid, addr: u64) -> Self {
        Self { pid, addr }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Offset the address, staying in the same process.
    pub fn add(&self, offset: u64) -> Self {
        Self::new(self.pid, self.addr.wrapping_add(offset))
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x} (pid {})", self.addr, self.pid)
    }
}

/// A [`RemoteAddress`] bound to the memory primitives able to dereference it.
///
/// Syscall arguments arrive as `RemotePtr`s, whether the syscall treats them as
/// pointers or as plain integers. Use the `as_*` views for the latter.
#[derive(Clone, Copy)]
pub struct RemotePtr<'a> {
    address: RemoteAddress,
    memory: &'a dyn RemoteMemory,
}

impl<'a> RemotePtr<'a> {
    pub fn new(memory: &'a dyn RemoteMemory, pid: Pid, addr: u64) -> Self {
        let address = RemoteAddress::new(pid, addr);
        Self { address, memory }
    }

    pub fn address(&self) -> RemoteAddress {
        self.address
    }

    pub fn pid(&self) -> Pid {
        self.address.pid
    }

    pub fn is_null(&self) -> bool {
        self.address.is_null()
    }

    pub fn add(&self, offset: u64) -> Self {
        Self { address: self.address.add(offset), memory: self.memory }
    }

    /// Read the pointer stored at this address. The result refers to the same process.
    pub fn read_pointer(&self) -> Result<RemotePtr<'a>> {
        let RemoteAddress { pid, addr } = self.address;
        trace!(pid = pid.as_raw(), addr, "reading pointer");

        let value = self.memory.read_word(pid, addr)?;

        Ok(Self::new(self.memory, pid, value))
    }

    /// Read a NUL-terminated string of at most `max_size` bytes, excluding the NUL.
    ///
    /// **Note:** a zeroed buffer of `max_size + 1` bytes is always allocated, whatever
    /// the length of the string actually is. `max_size` may not exceed
    /// [`MAX_C_STRING_SIZE`].
    ///
    /// Returns `None` if no terminator was found within the buffer, or if the string
    /// is not valid UTF-8.
    pub fn read_c_string(&self, max_size: usize) -> Result<Option<String>> {
        let RemoteAddress { pid, addr } = self.address;
        trace!(pid = pid.as_raw(), addr, max_size, "reading C string");

        if max_size > MAX_C_STRING_SIZE {
            return Err(Error::StringTooLong { max_size, limit: MAX_C_STRING_SIZE });
        }

        let mut buf = vec![0; max_size + 1];
        self.memory.read_c_string(pid, addr, &mut buf)?;

        let nul = match buf.iter().position(|b| *b == 0) {
            Some(nul) => nul,
            None => return Ok(None),
        };
        buf.truncate(nul);

        Ok(String::from_utf8(buf).ok())
    }

    /// Read exactly `len` bytes.
    pub fn read_byte_array(&self, len: usize) -> Result<Vec<u8>> {
        let RemoteAddress { pid, addr } = self.address;
        trace!(pid = pid.as_raw(), addr, len, "reading bytes");

        let mut data = vec![0; len];
        self.memory.read_bytes(pid, addr, &mut data)?;

        Ok(data)
    }

    /// Write all of `data` at this address.
    pub fn write_byte_array(&self, data: &[u8]) -> Result<&Self> {
        let RemoteAddress { pid, addr } = self.address;
        trace!(pid = pid.as_raw(), addr, len = data.len(), "writing bytes");

        self.memory.write_bytes(pid, addr, data)?;

        Ok(self)
    }

    /// Write `value` as UTF-8, followed by a NUL byte.
    pub fn write_utf8_string(&self, value: &str) -> Result<&Self> {
        let mut data = Vec::with_capacity(value.len() + 1);
        data.extend_from_slice(value.as_bytes());
        data.push(0);

        self.write_byte_array(&data)
    }

    pub fn as_ptr(&self) -> u64 {
        self.address.addr
    }

    pub fn as_i32(&self) -> i32 {
        self.address.addr as i32
    }

    pub fn as_u32(&self) -> u32 {
        self.address.addr as u32
    }

    pub fn as_i64(&self) -> i64 {
        self.address.addr as i64
    }

    pub fn as_u64(&self) -> u64 {
        self.address.addr
    }

    pub fn as_usize(&self) -> usize {
        self.address.addr as usize
    }
}

impl PartialEq for RemotePtr<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.address == other.address
    }
}

impl Eq for RemotePtr<'_> {}

impl fmt::Debug for RemotePtr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemotePtr")
            .field("pid", &self.address.pid)
            .field("addr", &format_args!("{:#x}", self.address.addr))
            .finish()
    }
}

impl fmt::Display for RemotePtr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.address, f)
    }
}

impl From<RemotePtr<'_>> for RemoteAddress {
    fn from(ptr: RemotePtr<'_>) -> Self {
        ptr.address
    }
}
