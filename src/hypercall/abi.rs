//! Hypercall numbers and register payload.

use std::convert::TryFrom;
use std::fmt;

/// Returned to the guest by any call that fails.
pub const FAILURE: u64 = u64::MAX;

/// Largest transfer a single read, write or getdents64 performs.
pub const MAX_TRANSFER: usize = 1 << 20;

/// Longest path `open` accepts, including the terminator.
pub const MAX_PATH: usize = 4096;

/// Hypercall numbers understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Hypercall {
    Write = 0,
    Exit = 1,
    Open = 2,
    Read = 3,
    Close = 4,
    Lseek = 5,
    Time = 6,
    Fstat = 7,
    Getdents64 = 8,
}

impl TryFrom<u64> for Hypercall {
    type Error = u64;

    fn try_from(nr: u64) -> Result<Self, u64> {
        Ok(match nr {
            0 => Hypercall::Write,
            1 => Hypercall::Exit,
            2 => Hypercall::Open,
            3 => Hypercall::Read,
            4 => Hypercall::Close,
            5 => Hypercall::Lseek,
            6 => Hypercall::Time,
            7 => Hypercall::Fstat,
            8 => Hypercall::Getdents64,
            other => return Err(other),
        })
    }
}

impl fmt::Display for Hypercall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hypercall::Write => "write",
            Hypercall::Exit => "exit",
            Hypercall::Open => "open",
            Hypercall::Read => "read",
            Hypercall::Close => "close",
            Hypercall::Lseek => "lseek",
            Hypercall::Time => "time",
            Hypercall::Fstat => "fstat",
            Hypercall::Getdents64 => "getdents64",
        };
        f.write_str(name)
    }
}

/// A hypercall as read from guest registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypercallArgs {
    pub nr: u64,
    pub args: [u64; 6],
    /// Program counter at the time of the call
    pub pc: u64,
}

/// What the run loop does after a hypercall.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Write the value into the result register and resume.
    Return(u64),
    /// The guest asked to stop with this exit code.
    Exit(u64),
}
