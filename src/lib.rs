//! # sandvisor
//!
//! A minimal KVM hypervisor that boots a bare ELF guest and serves a small
//! POSIX-like hypercall interface behind a filesystem sandbox.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sandvisor::{Container, Machine, Result};
//!
//! fn main() -> Result<()> {
//!     let image = std::fs::read("guest.elf")?;
//!     let mut machine = Machine::builder()
//!         .memory_mb(128)
//!         .container(Container::new(["/srv/guest-data"])?)
//!         .build()?;
//!
//!     machine.load_kernel(image.as_slice(), &["guest"])?;
//!     let reasons = machine.boot()?;
//!     println!("{:?}", reasons);
//!     Ok(())
//! }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux x86_64**: long mode or flat protected mode guests
//! - **Linux aarch64**: EL1 guests with an in-kernel GIC

mod builder;
pub mod debug;
mod error;
mod machine;
pub mod runner;
pub mod translate;
pub mod vcpu;

pub mod arch;
pub mod backend;
pub mod device;
pub mod hypercall;
pub mod loader;
pub mod memory;

// Re-exports
pub use arch::{Architecture, BootParams, CpuMode};
pub use builder::{MachineBuilder, MachineConfig};
pub use device::{GicVersion, IrqLine};
pub use error::{Error, Result};
pub use hypercall::Container;
pub use machine::{Machine, MachineState};
pub use runner::StopReason;
pub use translate::Translation;

/// Check if the current platform supports hardware virtualization.
///
/// Returns `true` if `/dev/kvm` can be opened.
pub fn is_supported() -> bool {
    backend::is_available()
}

/// Name of the hypervisor backend.
pub fn backend_name() -> &'static str {
    backend::name()
}
