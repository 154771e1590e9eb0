//! Hypercall interface between the guest and the host.
//!
//! The guest traps to the host (port I/O on x86-64, an MMIO write on ARM64)
//! with a call number and up to six arguments in registers. Calls are
//! serviced by a [`Container`], which owns the guest's file descriptors and
//! confines `open` to an allow-list of host directories.

pub mod abi;
pub mod container;
mod dispatch;

pub use abi::{Hypercall, HypercallArgs, Outcome, FAILURE};
pub use container::Container;
