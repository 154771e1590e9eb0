//! Machine builder.

use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::kvm::DEFAULT_DEVICE;
use crate::device::GicVersion;
use crate::error::{Error, Result};
use crate::hypercall::Container;
use crate::machine::Machine;
use crate::memory::layout;

/// Default guest RAM: 128 MiB.
pub const DEFAULT_MEMORY_SIZE: u64 = 128 << 20;

/// Most VCPUs a machine may have.
pub const MAX_VCPUS: usize = 64;

const MIB: u64 = 1 << 20;

/// Validated machine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Guest RAM in bytes
    pub memory_size: u64,
    pub vcpus: usize,
    /// Path of the KVM device
    pub device: PathBuf,
    /// Single-step and log every guest instruction
    pub trace: bool,
    /// Offer PSCI 0.2 to ARM64 guests when the host has it
    pub psci: bool,
    /// GIC version for ARM64 guests; `None` tries v3, then v2
    pub gic: Option<GicVersion>,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            vcpus: 1,
            device: PathBuf::from(DEFAULT_DEVICE),
            trace: false,
            psci: true,
            gic: None,
        }
    }
}

impl MachineConfig {
    /// Check sizes and counts against the guest memory layout.
    pub fn validate(&self) -> Result<()> {
        let size = self.memory_size;
        if size < layout::MIN_RAM_SIZE
            || size % MIB != 0
            || layout::RAM_START.checked_add(size).map_or(true, |end| end > layout::RAM_LIMIT)
        {
            return Err(Error::InvalidMemorySize(size));
        }
        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(Error::InvalidVcpuCount(self.vcpus));
        }
        Ok(())
    }
}

/// Builder for a [`Machine`].
///
/// # Example
///
/// ```rust,no_run
/// use sandvisor::{Container, Machine};
///
/// let machine = Machine::builder()
///     .memory_mb(64)
///     .vcpus(1)
///     .container(Container::new(["/tmp"])?)
///     .build()?;
/// # Ok::<(), sandvisor::Error>(())
/// ```
#[derive(Default)]
pub struct MachineBuilder {
    config: MachineConfig,
    container: Option<Container>,
}

impl MachineBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set guest RAM in bytes.
    ///
    /// Default: 128 MiB
    pub fn memory(mut self, bytes: u64) -> Self {
        self.config.memory_size = bytes;
        self
    }

    /// Set guest RAM in mebibytes.
    pub fn memory_mb(self, mb: u64) -> Self {
        self.memory(mb.saturating_mul(MIB))
    }

    /// Set the number of virtual CPUs.
    ///
    /// Default: 1
    pub fn vcpus(mut self, count: usize) -> Self {
        self.config.vcpus = count;
        self
    }

    /// Use a KVM device other than `/dev/kvm`.
    pub fn device(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.device = path.into();
        self
    }

    /// Trace every guest instruction.
    pub fn trace(mut self, enabled: bool) -> Self {
        self.config.trace = enabled;
        self
    }

    /// Offer PSCI 0.2 to ARM64 guests. Ignored on x86_64.
    pub fn psci(mut self, enabled: bool) -> Self {
        self.config.psci = enabled;
        self
    }

    /// Require a particular GIC version. Ignored on x86_64.
    pub fn gic_version(mut self, version: GicVersion) -> Self {
        self.config.gic = Some(version);
        self
    }

    /// Set the filesystem sandbox.
    ///
    /// Default: only the current directory is allowed.
    pub fn container(mut self, container: Container) -> Self {
        self.container = Some(container);
        self
    }

    /// The configuration collected so far.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Validate the configuration and create the machine.
    pub fn build(self) -> Result<Machine> {
        self.config.validate()?;
        let container = match self.container {
            Some(container) => container,
            None => Container::new(["."])?,
        };
        Machine::new(self.config, Arc::new(container))
    }
}
