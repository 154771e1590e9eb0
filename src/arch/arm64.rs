//! ARM64 CPU bootstrap.
//!
//! VCPUs are initialized with the host's preferred target and, when
//! available, PSCI 0.2. They start at EL1h with interrupts masked and the
//! MMU off. Hypercalls are MMIO writes to the read-only system page.

#[cfg(target_arch = "aarch64")]
use {
    super::{BootParams, CpuMode, HypercallArgs},
    crate::backend::kvm::regs::arm64::{x_offset, PC_OFFSET, PSTATE_BOOT, PSTATE_OFFSET},
    crate::backend::kvm::{Vcpu, Vm},
    crate::error::{Error, Result},
    crate::memory::GuestMemory,
    crate::translate::Translation,
};

/// Base of the kernel linear map.
pub const LINEAR_MAP_BASE: u64 = 0xffff_ffc0_0000_0000;

#[cfg(target_arch = "aarch64")]
const KVM_ARM_VCPU_PSCI_0_2: u32 = 2;

pub fn kernel_to_physical(va: u64) -> u64 {
    if va >= LINEAR_MAP_BASE {
        va - LINEAR_MAP_BASE
    } else {
        va
    }
}

pub fn physical_to_kernel(pa: u64) -> u64 {
    pa + LINEAR_MAP_BASE
}

/// Show an instruction word; there is no ARM64 decoder in the tree.
pub fn disassemble(_pc: u64, bytes: &[u8]) -> String {
    match bytes.get(..4) {
        Some(word) => format!(".inst 0x{:08x}", u32::from_le_bytes([word[0], word[1], word[2], word[3]])),
        None => "(bad)".to_string(),
    }
}

/// Preferred target for this host, with PSCI 0.2 when requested.
#[cfg(target_arch = "aarch64")]
pub fn vcpu_init_template(vm: &Vm, psci: bool) -> Result<kvm_bindings::kvm_vcpu_init> {
    let mut kvi = kvm_bindings::kvm_vcpu_init::default();
    vm.fd()
        .get_preferred_target(&mut kvi)
        .map_err(Error::from_kvm("KVM_ARM_PREFERRED_TARGET"))?;
    if psci {
        kvi.features[0] |= 1 << KVM_ARM_VCPU_PSCI_0_2;
    }
    Ok(kvi)
}

#[cfg(target_arch = "aarch64")]
pub fn bootstrap(vcpu: &Vcpu, _memory: &GuestMemory, boot: &BootParams) -> Result<()> {
    if boot.mode != CpuMode::Long64 {
        return Err(Error::NotSupported("32-bit images on arm64".to_string()));
    }
    vcpu.set_core_reg(PSTATE_OFFSET, PSTATE_BOOT)?;
    vcpu.set_core_reg(x_offset(0), boot.memory_size)?;
    vcpu.set_core_reg(x_offset(1), boot.argc)?;
    vcpu.set_core_reg(x_offset(2), boot.argv)?;
    vcpu.set_core_reg(PC_OFFSET, boot.entry)
}

/// KVM_TRANSLATE is x86-only. Guests here either run with the MMU off or
/// use the kernel linear map, so resolve by that convention.
#[cfg(target_arch = "aarch64")]
pub fn translate(memory: &GuestMemory, gva: u64) -> Result<Translation> {
    let pa = kernel_to_physical(gva);
    let region = memory.find_region(pa);
    Ok(Translation {
        virtual_address: gva,
        physical_address: pa,
        valid: region.is_some(),
        writable: region.map(|r| !r.readonly).unwrap_or(false),
        usermode: false,
    })
}

#[cfg(target_arch = "aarch64")]
pub fn pc(vcpu: &Vcpu) -> Result<u64> {
    vcpu.core_reg(PC_OFFSET)
}

#[cfg(target_arch = "aarch64")]
pub fn set_pc(vcpu: &Vcpu, pc: u64) -> Result<()> {
    vcpu.set_core_reg(PC_OFFSET, pc)
}

/// X8 holds the call number and X0..X5 the arguments, as for Linux syscalls.
#[cfg(target_arch = "aarch64")]
pub fn hypercall_args(vcpu: &Vcpu) -> Result<HypercallArgs> {
    let mut args = [0u64; 6];
    for (i, arg) in args.iter_mut().enumerate() {
        *arg = vcpu.core_reg(x_offset(i))?;
    }
    Ok(HypercallArgs {
        nr: vcpu.core_reg(x_offset(8))?,
        args,
        pc: vcpu.core_reg(PC_OFFSET)?,
    })
}

#[cfg(target_arch = "aarch64")]
pub fn set_hypercall_result(vcpu: &Vcpu, value: u64) -> Result<()> {
    vcpu.set_core_reg(x_offset(0), value)
}
