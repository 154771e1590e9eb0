//! Architecture-specific CPU setup and register conventions.
//!
//! [`Architecture`] is picked once when the machine is built. Every
//! operation that depends on the guest ISA goes through it: VCPU
//! initialization, boot registers, address translation, program counter
//! access and the hypercall register convention.

pub mod arm64;
pub mod x86_64;

use crate::backend::kvm::{KvmDevice, Vcpu, Vm};
use crate::error::{Error, Result};
use crate::hypercall::HypercallArgs;
use crate::memory::GuestMemory;
use crate::translate::{Translation, Translator};

/// Supported guest architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    Arm64,
}

/// CPU mode the image expects at entry, taken from its ELF class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Protected32,
    Long64,
}

/// Entry state for every VCPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootParams {
    pub entry: u64,
    pub mode: CpuMode,
    /// RAM size reported to the guest
    pub memory_size: u64,
    pub argc: u64,
    /// Guest virtual address of the argv pointer array
    pub argv: u64,
}

/// Per-VCPU configuration computed once from the VM.
#[derive(Clone)]
pub struct VcpuSetup {
    #[cfg(target_arch = "x86_64")]
    cpuid: kvm_bindings::CpuId,
    #[cfg(target_arch = "aarch64")]
    init: kvm_bindings::kvm_vcpu_init,
}

impl Architecture {
    /// The architecture of the host, which KVM guests share.
    pub fn host() -> Result<Self> {
        if cfg!(target_arch = "x86_64") {
            Ok(Architecture::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Ok(Architecture::Arm64)
        } else {
            Err(Error::NotSupported(format!(
                "host architecture {}",
                std::env::consts::ARCH
            )))
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Architecture::X86_64 => "x86_64",
            Architecture::Arm64 => "arm64",
        }
    }

    fn unsupported(self) -> Error {
        Error::NotSupported(format!("{} guests on a {} host", self.name(), std::env::consts::ARCH))
    }

    /// Bytes at the top of RAM kept for boot structures.
    pub fn reserved_ram(self) -> u64 {
        match self {
            Architecture::X86_64 => x86_64::RESERVED_SIZE,
            Architecture::Arm64 => 0,
        }
    }

    /// Whether the interrupt controller must exist before VCPUs are created.
    pub fn irqchip_before_vcpus(self) -> bool {
        self == Architecture::X86_64
    }

    /// Map a kernel virtual address to the physical address it is loaded at.
    pub fn kernel_to_physical(self, va: u64) -> u64 {
        match self {
            Architecture::X86_64 => x86_64::kernel_to_physical(va),
            Architecture::Arm64 => arm64::kernel_to_physical(va),
        }
    }

    /// Map a physical address to the address the kernel sees it at.
    pub fn physical_to_kernel(self, pa: u64) -> u64 {
        match self {
            Architecture::X86_64 => pa,
            Architecture::Arm64 => arm64::physical_to_kernel(pa),
        }
    }

    /// VM-wide setup that must precede VCPU creation.
    pub fn init_vm(self, vm: &Vm) -> Result<()> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => vm.set_tss_address(x86_64::TSS_ADDRESS),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => {
                let _ = vm;
                Ok(())
            }
            #[allow(unreachable_patterns)]
            _ => Err(self.unsupported()),
        }
    }

    /// Compute the configuration applied to each new VCPU.
    pub fn vcpu_setup(self, kvm: &KvmDevice, vm: &Vm, psci: bool) -> Result<VcpuSetup> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => {
                let _ = (vm, psci);
                let mut cpuid = kvm.supported_cpuid()?;
                x86_64::patch_cpuid(&mut cpuid);
                Ok(VcpuSetup { cpuid })
            }
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => {
                let psci = psci && kvm.has_psci_0_2();
                Ok(VcpuSetup {
                    init: arm64::vcpu_init_template(vm, psci)?,
                })
            }
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (kvm, vm, psci);
                Err(self.unsupported())
            }
        }
    }

    /// Apply the per-VCPU configuration. Runs on the VCPU's own thread.
    pub fn prepare_vcpu(self, vcpu: &Vcpu, setup: &VcpuSetup) -> Result<()> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => vcpu.set_cpuid(&setup.cpuid),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => vcpu.init(&setup.init),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (vcpu, setup);
                Err(self.unsupported())
            }
        }
    }

    /// Put a VCPU into its entry mode and load the boot registers.
    pub fn bootstrap(self, vcpu: &Vcpu, memory: &GuestMemory, boot: &BootParams) -> Result<()> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => x86_64::bootstrap(vcpu, memory, boot),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => arm64::bootstrap(vcpu, memory, boot),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (vcpu, memory, boot);
                Err(self.unsupported())
            }
        }
    }

    /// Translate a guest virtual address in the VCPU's current context.
    pub fn translate(self, vcpu: &Vcpu, memory: &GuestMemory, gva: u64) -> Result<Translation> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => {
                let _ = memory;
                x86_64::translate(vcpu, gva)
            }
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => {
                let _ = vcpu;
                arm64::translate(memory, gva)
            }
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (vcpu, memory, gva);
                Err(self.unsupported())
            }
        }
    }

    pub fn pc(self, vcpu: &Vcpu) -> Result<u64> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => x86_64::pc(vcpu),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => arm64::pc(vcpu),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = vcpu;
                Err(self.unsupported())
            }
        }
    }

    pub fn set_pc(self, vcpu: &Vcpu, pc: u64) -> Result<()> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => x86_64::set_pc(vcpu, pc),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => arm64::set_pc(vcpu, pc),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (vcpu, pc);
                Err(self.unsupported())
            }
        }
    }

    /// Read the hypercall number and arguments from guest registers.
    pub fn hypercall_args(self, vcpu: &Vcpu) -> Result<HypercallArgs> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => x86_64::hypercall_args(vcpu),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => arm64::hypercall_args(vcpu),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = vcpu;
                Err(self.unsupported())
            }
        }
    }

    /// Write a hypercall's return value into the guest's result register.
    pub fn set_hypercall_result(self, vcpu: &Vcpu, value: u64) -> Result<()> {
        match self {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => x86_64::set_hypercall_result(vcpu, value),
            #[cfg(target_arch = "aarch64")]
            Architecture::Arm64 => arm64::set_hypercall_result(vcpu, value),
            #[allow(unreachable_patterns)]
            _ => {
                let _ = (vcpu, value);
                Err(self.unsupported())
            }
        }
    }

    /// Render the instruction at `pc` for the trace log.
    pub fn disassemble(self, mode: CpuMode, pc: u64, bytes: &[u8]) -> String {
        match self {
            Architecture::X86_64 => x86_64::disassemble(mode, pc, bytes),
            Architecture::Arm64 => arm64::disassemble(pc, bytes),
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Translates through a particular VCPU.
pub struct VcpuTranslator<'a> {
    pub arch: Architecture,
    pub vcpu: &'a Vcpu,
    pub memory: &'a GuestMemory,
}

impl Translator for VcpuTranslator<'_> {
    fn translate(&self, gva: u64) -> Result<Translation> {
        self.arch.translate(self.vcpu, self.memory, gva)
    }
}
