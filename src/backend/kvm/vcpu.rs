//! KVM VCPU handle.
//!
//! A [`Vcpu`] must only be used on the thread that created it. The machine
//! reaches its VCPUs through [`crate::vcpu::VcpuHandle`], which owns that
//! thread.

use kvm_bindings::kvm_guest_debug;
use kvm_ioctls::VcpuFd;

use super::regs::exit;
use crate::error::{Error, Result};

const KVM_GUESTDBG_ENABLE: u32 = 0x0000_0001;
const KVM_GUESTDBG_SINGLESTEP: u32 = 0x0000_0002;

/// Why `KVM_RUN` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuExit {
    /// Guest executed HLT
    Halt,
    /// Port I/O (x86 hypercall)
    Io,
    /// MMIO access (ARM64 hypercall)
    Mmio,
    /// Single step or breakpoint
    Debug,
    /// Interrupted by a signal, or asked to retry
    Interrupted,
    /// KVM_EXIT_UNKNOWN
    Unknown,
    /// Any other exit reason, carrying the raw value
    Unrecognized(u32),
}

impl VcpuExit {
    /// Classify a raw `kvm_run.exit_reason`.
    pub fn from_raw(reason: u32) -> Self {
        match reason {
            exit::HLT => VcpuExit::Halt,
            exit::IO => VcpuExit::Io,
            exit::MMIO => VcpuExit::Mmio,
            exit::DEBUG => VcpuExit::Debug,
            exit::INTR => VcpuExit::Interrupted,
            exit::UNKNOWN => VcpuExit::Unknown,
            other => VcpuExit::Unrecognized(other),
        }
    }
}

/// A KVM virtual CPU.
pub struct Vcpu {
    id: usize,
    fd: VcpuFd,
}

impl Vcpu {
    pub(crate) fn new(id: usize, fd: VcpuFd) -> Self {
        Self { id, fd }
    }

    /// VCPU index.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Enter the guest until the next exit.
    ///
    /// `EINTR` and `EAGAIN` from `KVM_RUN` are reported as
    /// [`VcpuExit::Interrupted`] rather than as errors.
    pub fn run(&mut self) -> Result<VcpuExit> {
        match self.fd.run() {
            Ok(_) => {}
            Err(e) if e.errno() == libc::EINTR || e.errno() == libc::EAGAIN => {
                return Ok(VcpuExit::Interrupted);
            }
            Err(e) => return Err(Error::from_kvm("KVM_RUN")(e)),
        }
        let reason = self.fd.get_kvm_run().exit_reason;
        Ok(VcpuExit::from_raw(reason))
    }

    /// Enable or disable single-step debugging.
    pub fn set_single_step(&self, enabled: bool) -> Result<()> {
        let control = if enabled {
            KVM_GUESTDBG_ENABLE | KVM_GUESTDBG_SINGLESTEP
        } else {
            0
        };
        let debug = kvm_guest_debug {
            control,
            ..Default::default()
        };
        self.fd
            .set_guest_debug(&debug)
            .map_err(Error::from_kvm("KVM_SET_GUEST_DEBUG"))
    }
}

#[cfg(target_arch = "x86_64")]
impl Vcpu {
    pub fn regs(&self) -> Result<kvm_bindings::kvm_regs> {
        self.fd.get_regs().map_err(Error::from_kvm("KVM_GET_REGS"))
    }

    pub fn set_regs(&self, regs: &kvm_bindings::kvm_regs) -> Result<()> {
        self.fd.set_regs(regs).map_err(Error::from_kvm("KVM_SET_REGS"))
    }

    pub fn sregs(&self) -> Result<kvm_bindings::kvm_sregs> {
        self.fd.get_sregs().map_err(Error::from_kvm("KVM_GET_SREGS"))
    }

    pub fn set_sregs(&self, sregs: &kvm_bindings::kvm_sregs) -> Result<()> {
        self.fd.set_sregs(sregs).map_err(Error::from_kvm("KVM_SET_SREGS"))
    }

    pub fn set_cpuid(&self, cpuid: &kvm_bindings::CpuId) -> Result<()> {
        self.fd.set_cpuid2(cpuid).map_err(Error::from_kvm("KVM_SET_CPUID2"))
    }

    /// Set the multiprocessing state; application processors start in
    /// `INIT_RECEIVED` under the in-kernel irqchip.
    pub fn set_mp_state(&self, state: u32) -> Result<()> {
        let mp_state = kvm_bindings::kvm_mp_state { mp_state: state };
        self.fd
            .set_mp_state(mp_state)
            .map_err(Error::from_kvm("KVM_SET_MP_STATE"))
    }

    /// Walk the guest page tables for `gva`.
    pub fn translate_gva(&self, gva: u64) -> Result<kvm_bindings::kvm_translation> {
        self.fd.translate_gva(gva).map_err(Error::from_kvm("KVM_TRANSLATE"))
    }
}

#[cfg(target_arch = "aarch64")]
impl Vcpu {
    pub fn init(&self, kvi: &kvm_bindings::kvm_vcpu_init) -> Result<()> {
        self.fd.vcpu_init(kvi).map_err(Error::from_kvm("KVM_ARM_VCPU_INIT"))
    }

    /// Read a 64-bit core register by byte offset.
    pub fn core_reg(&self, offset: u64) -> Result<u64> {
        let mut data = [0u8; 8];
        self.fd
            .get_one_reg(super::regs::arm64::core_reg(offset), &mut data)
            .map_err(Error::from_kvm("KVM_GET_ONE_REG"))?;
        Ok(u64::from_le_bytes(data))
    }

    /// Write a 64-bit core register by byte offset.
    pub fn set_core_reg(&self, offset: u64, value: u64) -> Result<()> {
        self.fd
            .set_one_reg(super::regs::arm64::core_reg(offset), &value.to_le_bytes())
            .map_err(Error::from_kvm("KVM_SET_ONE_REG"))?;
        Ok(())
    }
}
