//! Linux KVM backend.
//!
//! This module provides virtualization support on Linux using KVM,
//! through the rust-vmm `kvm-ioctls` and `kvm-bindings` crates.
//!
//! ## Requirements
//!
//! - Linux kernel with KVM support
//! - Read/write access to /dev/kvm
//! - CPU with VT-x/AMD-V (x86_64) or virtualization extensions (aarch64)

pub mod regs;
pub mod vcpu;
pub mod vm;

pub use vcpu::{Vcpu, VcpuExit};
pub use vm::Vm;

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::Path;

use kvm_ioctls::Kvm;
use tracing::debug;

use crate::error::{Error, Result};

/// The only KVM API version this crate speaks.
pub const KVM_API_VERSION: i32 = 12;

/// Default path of the KVM device.
pub const DEFAULT_DEVICE: &str = "/dev/kvm";

/// Check if KVM is available on this system.
pub fn is_available() -> bool {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(DEFAULT_DEVICE)
        .is_ok()
}

/// An open handle to the KVM device.
pub struct KvmDevice {
    kvm: Kvm,
}

impl KvmDevice {
    /// Open the KVM device at `path` and check its API version.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_CLOEXEC)
            .open(path)
            .map_err(|source| Error::DeviceOpen {
                path: path.to_path_buf(),
                source,
            })?;

        // Safety: the descriptor was just opened and ownership moves to Kvm.
        let kvm = unsafe { Kvm::from_raw_fd(file.into_raw_fd()) };

        let found = kvm.get_api_version();
        if found != KVM_API_VERSION {
            return Err(Error::ApiVersion {
                found,
                expected: KVM_API_VERSION,
            });
        }
        debug!(path = %path.display(), version = found, "opened kvm device");
        Ok(Self { kvm })
    }

    /// Size of the shared run-state mapping of each VCPU.
    pub fn vcpu_mmap_size(&self) -> Result<usize> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(Error::from_kvm("KVM_GET_VCPU_MMAP_SIZE"))
    }

    /// Create an empty virtual machine.
    pub fn create_vm(&self) -> Result<Vm> {
        let fd = self.kvm.create_vm().map_err(Error::from_kvm("KVM_CREATE_VM"))?;
        Ok(Vm::new(fd))
    }

    /// CPUID entries supported by this host.
    #[cfg(target_arch = "x86_64")]
    pub fn supported_cpuid(&self) -> Result<kvm_bindings::CpuId> {
        self.kvm
            .get_supported_cpuid(kvm_bindings::KVM_MAX_CPUID_ENTRIES)
            .map_err(Error::from_kvm("KVM_GET_SUPPORTED_CPUID"))
    }

    /// Whether the host offers PSCI 0.2 to guests.
    #[cfg(target_arch = "aarch64")]
    pub fn has_psci_0_2(&self) -> bool {
        self.kvm.check_extension(kvm_ioctls::Cap::ArmPsci02)
    }
}
