//! C entry points for installed handlers.
//!
//! The collaborator calls back with `(cookie, pid, nr, pc, a0..a5)` and no user data, so
//! every installed handler gets an entry point of its own. Each one is a monomorphized
//! copy of [`trampoline()`], reading the handler bound to its slot.

use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::registry::Installed;
use crate::supervisor::{ResolutionToken, ThunkFn};

const ROW: usize = 16;
const ROWS: usize = 32;

/// Entry points available to one process.
pub(crate) const SLOTS: usize = ROW * ROWS;

#[allow(clippy::declare_interior_mutable_const)]
const UNBOUND: OnceLock<&'static Installed> = OnceLock::new();

static BOUND: [OnceLock<&'static Installed>; SLOTS] = [UNBOUND; SLOTS];
static NEXT: AtomicUsize = AtomicUsize::new(0);

macro_rules! row {
    ($hi: literal) => {
        [
            trampoline::<{ $hi * ROW }>,
            trampoline::<{ $hi * ROW + 1 }>,
            trampoline::<{ $hi * ROW + 2 }>,
            trampoline::<{ $hi * ROW + 3 }>,
            trampoline::<{ $hi * ROW + 4 }>,
            trampoline::<{ $hi * ROW + 5 }>,
            trampoline::<{ $hi * ROW + 6 }>,
            trampoline::<{ $hi * ROW + 7 }>,
            trampoline::<{ $hi * ROW + 8 }>,
            trampoline::<{ $hi * ROW + 9 }>,
            trampoline::<{ $hi * ROW + 10 }>,
            trampoline::<{ $hi * ROW + 11 }>,
            trampoline::<{ $hi * ROW + 12 }>,
            trampoline::<{ $hi * ROW + 13 }>,
            trampoline::<{ $hi * ROW + 14 }>,
            trampoline::<{ $hi * ROW + 15 }>,
        ]
    };
}

macro_rules! rows {
    ($($hi: literal)*) => {
        [$(row!($hi)),*]
    };
}

#[allow(clippy::erasing_op, clippy::identity_op)]
static ENTRIES: [[ThunkFn; ROW]; ROWS] = rows!(
    0 1 2 3 4 5 6 7 8 9 10 11 12 13 14 15
    16 17 18 19 20 21 22 23 24 25 26 27 28 29 30 31
);

/// Claim a free slot for `installed`, and return the entry point that calls it.
///
/// Slots are never released.
pub(crate) fn bind(installed: &'static Installed) -> Result<ThunkFn> {
    let slot = NEXT.fetch_add(1, Ordering::AcqRel);

    if slot >= SLOTS {
        return Err(Error::HandlerSlots { limit: SLOTS });
    }

    if BOUND[slot].set(installed).is_err() {
        internal_error!("trampoline slot bound twice");
    }

    debug!(slot, nr = installed.nr(), "bound trampoline");

    Ok(ENTRIES[slot / ROW][slot % ROW])
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn trampoline<const SLOT: usize>(
    cookie: *mut c_void,
    pid: u32,
    nr: i32,
    pc: u64,
    a0: u64,
    a1: u64,
    a2: u64,
    a3: u64,
    a4: u64,
    a5: u64,
) {
    let token = ResolutionToken::from_raw(cookie);

    match BOUND[SLOT].get() {
        Some(installed) => installed.dispatch(token, pid, nr, pc, [a0, a1, a2, a3, a4, a5]),

        // Entry points are only handed out after their slot is bound.
        None => error!(slot = SLOT, nr, "callback for an unbound trampoline"),
    }
}
