//! Instruction-set detection, and the matching syscall numbers.

use std::env::consts;

use tracing::debug;

use crate::aarch64;
use crate::error::{Error, Result};
use crate::x86;

/// A supported instruction-set architecture.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// The instruction set this process was compiled for.
    pub fn detect() -> Result<Self> {
        debug!(machine = consts::ARCH, "detecting architecture");

        Self::from_machine(consts::ARCH)
    }

    /// Parse an architecture name, as spelled by `std::env::consts::ARCH`.
    pub fn from_machine(machine: &str) -> Result<Self> {
        match machine {
            "x86_64" => Ok(Arch::X86_64),
            "aarch64" => Ok(Arch::Aarch64),
            _ => Err(Error::UnsupportedArchitecture { machine: machine.to_owned() }),
        }
    }

    pub fn syscalls(self) -> &'static SyscallTable {
        match self {
            Arch::X86_64 => &X86_64_TABLE,
            Arch::Aarch64 => &AARCH64_TABLE,
        }
    }
}

static X86_64_TABLE: SyscallTable = SyscallTable {
    arch: Arch::X86_64,
    entries: x86::SYSCALLS,
};

static AARCH64_TABLE: SyscallTable = SyscallTable {
    arch: Arch::Aarch64,
    entries: aarch64::SYSCALLS,
};

/// Names and numbers of commonly-intercepted syscalls for one architecture.
#[derive(Debug)]
pub struct SyscallTable {
    arch: Arch,
    entries: &'static [(&'static str, u32)],
}

impl SyscallTable {
    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn number(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, nr)| *nr)
    }

    pub fn name(&self, nr: u32) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(_, n)| *n == nr)
            .map(|(name, _)| *name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, u32)> + '_ {
        self.entries.iter().copied()
    }
}
