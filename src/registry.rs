//! Handlers for intercepted syscalls, and the glue that dispatches events to them.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{error, trace};

use crate::error::{Error, Result};
use crate::remote::{Pid, RemotePtr};
use crate::response::Response;
use crate::supervisor::{ResolutionToken, Syshook};

/// A trapped syscall of the monitored process.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Syscall<'a> {
    pub pid: Pid,
    pub nr: u32,
    pub pc: RemotePtr<'a>,
    pub args: [RemotePtr<'a>; 6],
}

/// Decides the outcome of a trapped syscall.
///
/// Handlers may run concurrently, once per trapping thread of the monitored process.
pub type Handler = Box<dyn Fn(&Syscall<'_>) -> Result<Response> + Send + Sync + 'static>;

/// Handlers keyed by syscall number, to be installed by [`Syshook::setup()`].
///
/// Registering two handlers for one syscall number is an error: the first one is kept.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<u32, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to syscall `nr`.
    ///
    /// A handler may return anything convertible to a [`Response`]: `()` to continue the
    /// syscall, an `Errno` to fail it, or an integer or remote address to return it.
    pub fn register<F, R>(&mut self, nr: u32, handler: F) -> Result<&mut Self>
    where
        F: Fn(&Syscall<'_>) -> Result<R> + Send + Sync + 'static,
        R: Into<Response>,
    {
        if self.handlers.contains_key(&nr) {
            return Err(Error::DuplicateHandler { nr });
        }

        let handler: Handler = Box::new(move |syscall: &Syscall<'_>| handler(syscall).map(Into::into));
        self.handlers.insert(nr, handler);

        Ok(self)
    }

    pub fn contains(&self, nr: u32) -> bool {
        self.handlers.contains_key(&nr)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered syscall numbers, in ascending order.
    pub fn syscalls(&self) -> impl Iterator<Item = u32> + '_ {
        self.handlers.keys().copied()
    }

    pub(crate) fn into_handlers(self) -> impl Iterator<Item = (u32, Handler)> {
        self.handlers.into_iter()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

/// A handler owned by the collaborator for the rest of the process lifetime.
pub(crate) struct Installed {
    nr: u32,
    handler: Handler,
    hook: Arc<Syshook>,
}

impl Installed {
    /// Move a handler to the heap and leak it, so raw references to it never dangle.
    pub(crate) fn leak(nr: u32, handler: Handler, hook: Arc<Syshook>) -> &'static Self {
        Box::leak(Box::new(Self { nr, handler, hook }))
    }

    pub(crate) fn nr(&self) -> u32 {
        self.nr
    }

    /// Run the handler for one trapped syscall, and resolve it. Always submits exactly one
    /// resolution, `Continue` unless the handler decided otherwise.
    pub(crate) fn dispatch(&self, token: ResolutionToken, pid: u32, nr: i32, pc: u64, args: [u64; 6]) {
        let hook = &*self.hook;
        let pid = Pid::from_raw(pid as i32);
        let nr = nr as u32;

        let syscall = Syscall {
            pid,
            nr,
            pc: RemotePtr::new(hook, pid, pc),
            args: args.map(|arg| RemotePtr::new(hook, pid, arg)),
        };

        trace!(pid = pid.as_raw(), nr, pc, "dispatching syscall");

        let res = panic::catch_unwind(AssertUnwindSafe(|| {
            (self.handler)(&syscall).and_then(Response::validate)
        }));

        let response = match res {
            Ok(Ok(response)) => response,
            Ok(Err(err)) => {
                error!(nr, %err, "handler failed, continuing syscall");
                Response::Continue
            },
            Err(panic) => {
                let msg = panic_message(&*panic);
                error!(nr, panic = msg, "handler panicked, continuing syscall");
                Response::Continue
            },
        };

        trace!(pid = pid.as_raw(), nr, ?response, "resolving syscall");

        if let Err(err) = hook.resolve(token, response) {
            error!(nr, %err, "syscall resolved out of protocol, continued");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        *msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.as_str()
    } else {
        "non-string panic payload"
    }
}
