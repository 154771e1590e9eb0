//! KVM virtual machine handle.

use kvm_bindings::kvm_userspace_memory_region;
use kvm_ioctls::VmFd;
use tracing::debug;

use super::vcpu::Vcpu;
use crate::error::{Error, Result};
use crate::memory::GuestMemoryRegion;

const KVM_MEM_READONLY: u32 = 1 << 1;

/// A KVM virtual machine.
///
/// The handle is shared between the machine and every VCPU worker thread.
pub struct Vm {
    fd: VmFd,
}

impl Vm {
    pub(crate) fn new(fd: VmFd) -> Self {
        Self { fd }
    }

    /// The raw VM file descriptor, for device setup.
    pub fn fd(&self) -> &VmFd {
        &self.fd
    }

    /// Register a guest memory region with KVM.
    pub fn register_region(&self, region: &GuestMemoryRegion) -> Result<()> {
        let flags = if region.readonly { KVM_MEM_READONLY } else { 0 };
        let mem = kvm_userspace_memory_region {
            slot: region.slot,
            flags,
            guest_phys_addr: region.guest_addr,
            memory_size: region.size,
            userspace_addr: region.host_addr,
        };
        // Safety: the mapping behind host_addr is owned by GuestMemory, which
        // outlives every VCPU of this VM.
        unsafe { self.fd.set_user_memory_region(mem) }
            .map_err(Error::from_kvm("KVM_SET_USER_MEMORY_REGION"))?;
        debug!(
            slot = region.slot,
            guest_addr = format_args!("0x{:x}", region.guest_addr),
            "registered memory region"
        );
        Ok(())
    }

    /// Create VCPU `id`. Must be called on the thread that will run it.
    pub fn create_vcpu(&self, id: usize) -> Result<Vcpu> {
        let fd = self
            .fd
            .create_vcpu(id as u64)
            .map_err(Error::from_kvm("KVM_CREATE_VCPU"))?;
        Ok(Vcpu::new(id, fd))
    }

    /// Place the three-page TSS region KVM needs on Intel hosts.
    #[cfg(target_arch = "x86_64")]
    pub fn set_tss_address(&self, addr: u64) -> Result<()> {
        self.fd
            .set_tss_address(addr as usize)
            .map_err(Error::from_kvm("KVM_SET_TSS_ADDR"))
    }

    /// Drive an interrupt line of the in-kernel interrupt controller.
    pub fn set_irq_line(&self, irq: u32, level: bool) -> Result<()> {
        self.fd
            .set_irq_line(irq, level)
            .map_err(Error::from_kvm("KVM_IRQ_LINE"))
    }
}
