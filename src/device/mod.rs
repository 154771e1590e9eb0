//! Interrupt controllers.
//!
//! Both architectures use KVM's in-kernel controllers: PIC, IOAPIC and PIT
//! on x86-64, a GICv3 or GICv2 on ARM64.

pub mod gic;
pub mod pic;

pub use gic::{Gic, GicVersion};
pub use pic::Pic;

use std::sync::Arc;

use crate::arch::Architecture;
use crate::backend::kvm::Vm;
use crate::error::{Error, Result};

/// The machine's interrupt controller.
pub enum InterruptController {
    Pic(Pic),
    Gic(Gic),
}

impl InterruptController {
    /// Create the controller for `arch`.
    ///
    /// On x86-64 this must precede VCPU creation; on ARM64 it must follow it.
    /// `gic` picks the GIC version on ARM64 and is ignored elsewhere.
    pub fn create(arch: Architecture, vm: &Vm, gic: Option<GicVersion>) -> Result<Self> {
        match arch {
            #[cfg(target_arch = "x86_64")]
            Architecture::X86_64 => Ok(InterruptController::Pic(Pic::create(vm)?)),
            Architecture::Arm64 => Ok(InterruptController::Gic(Gic::create(vm, gic)?)),
            #[allow(unreachable_patterns)]
            _ => Err(Error::NotSupported(format!("{} interrupt controller", arch))),
        }
    }

    /// Complete setup. Called once, right before the first VCPU runs.
    pub fn finalize(&mut self) -> Result<()> {
        match self {
            InterruptController::Pic(_) => Ok(()),
            InterruptController::Gic(gic) => gic.finalize(),
        }
    }
}

/// Handle for raising interrupt lines, usable from any thread.
#[derive(Clone)]
pub struct IrqLine {
    arch: Architecture,
    vm: Arc<Vm>,
}

impl IrqLine {
    pub(crate) fn new(arch: Architecture, vm: Arc<Vm>) -> Self {
        Self { arch, vm }
    }

    /// Set IRQ `irq` to `level` (0 low, anything else high).
    pub fn inject(&self, irq: u32, level: u32) -> Result<()> {
        match self.arch {
            Architecture::X86_64 => self.vm.set_irq_line(irq, level != 0),
            Architecture::Arm64 => Err(Error::NotSupported(
                "level-triggered IRQ injection on arm64".to_string(),
            )),
        }
    }
}
