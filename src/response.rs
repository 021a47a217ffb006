//! Outcomes a handler may choose for an intercepted syscall.

use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::remote::{RemoteAddress, RemotePtr};

/// Resolution of one intercepted syscall.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Response {
    /// Let the original syscall run.
    #[default]
    Continue,

    /// Skip the syscall, and report `value` as its return value.
    Return(u64),

    /// Skip the syscall, and fail it with the given positive error code.
    ///
    /// Codes unknown to [`Errno`] are passed through as they are.
    Fail(i32),

    /// Release the collaborator's bookkeeping for the event without publishing a result.
    ///
    /// The trapped thread stays blocked unless something else wakes it.
    NeverRespond,
}

/// Outcome tag, as understood by the collaborator.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Tag {
    Continue = 0,
    Return = 1,
    Fail = 2,
    NeverRespond = 3,
}

impl From<Tag> for u8 {
    fn from(tag: Tag) -> u8 {
        tag as u8
    }
}

impl Response {
    /// Encode as a `(tag, payload)` pair for [`Supervisor::resolve()`].
    ///
    /// [`Supervisor::resolve()`]: crate::Supervisor::resolve
    pub fn encode(self) -> (Tag, u64) {
        match self {
            Response::Continue => (Tag::Continue, 0),
            Response::Return(value) => (Tag::Return, value),
            Response::Fail(code) => (Tag::Fail, code as u32 as u64),
            Response::NeverRespond => (Tag::NeverRespond, 0),
        }
    }

    /// Check that the response can be delivered as meant.
    ///
    /// A `Fail` with a zero code would be observed as success, and a negative one as a
    /// bogus return value.
    pub fn validate(self) -> Result<Self> {
        match self {
            Response::Fail(code) if code <= 0 => Err(Error::InvalidErrno { code }),
            response => Ok(response),
        }
    }
}

impl From<()> for Response {
    fn from(_: ()) -> Self {
        Response::Continue
    }
}

impl<T: Into<Response>> From<Option<T>> for Response {
    fn from(value: Option<T>) -> Self {
        value.map_or(Response::Continue, Into::into)
    }
}

impl From<Errno> for Response {
    fn from(errno: Errno) -> Self {
        Response::Fail(errno as i32)
    }
}

impl From<RemoteAddress> for Response {
    fn from(address: RemoteAddress) -> Self {
        Response::Return(address.addr())
    }
}

impl From<RemotePtr<'_>> for Response {
    fn from(ptr: RemotePtr<'_>) -> Self {
        Response::Return(ptr.as_ptr())
    }
}

// Signed values are sign-extended, so `-1` is returned as `-1`.
macro_rules! return_value {
    ($($ty: ty => $wide: ty),* $(,)?) => {
        $(
            impl From<$ty> for Response {
                fn from(value: $ty) -> Self {
                    Response::Return(value as $wide as u64)
                }
            }
        )*
    };
}

return_value! {
    i8 => i64,
    i16 => i64,
    i32 => i64,
    i64 => i64,
    isize => i64,
    u8 => u64,
    u16 => u64,
    u32 => u64,
    u64 => u64,
    usize => u64,
}
