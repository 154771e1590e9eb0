//! In-kernel PIC, IOAPIC and PIT for x86-64 guests.

#[cfg(target_arch = "x86_64")]
use {
    crate::backend::kvm::Vm,
    crate::error::{Error, Result},
    kvm_bindings::{kvm_pit_config, KVM_PIT_SPEAKER_DUMMY},
    tracing::debug,
};

/// Marker for an x86 VM whose interrupt chips live in KVM.
#[derive(Debug)]
pub struct Pic {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl Pic {
    /// Create the irqchip and PIT. Must happen before any VCPU exists.
    pub fn create(vm: &Vm) -> Result<Self> {
        vm.fd()
            .create_irq_chip()
            .map_err(Error::from_kvm("KVM_CREATE_IRQCHIP"))?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.fd()
            .create_pit2(pit_config)
            .map_err(Error::from_kvm("KVM_CREATE_PIT2"))?;

        debug!("created in-kernel PIC and PIT");
        Ok(Self { _private: () })
    }
}
