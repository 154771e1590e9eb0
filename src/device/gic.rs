//! In-kernel GIC for ARM64 guests.
//!
//! KVM emulates the interrupt controller. The VMM creates the device,
//! places its register frames and asks KVM to initialize it once, after
//! every VCPU exists and before any of them runs.

use kvm_bindings::{kvm_create_device, kvm_device_attr};
use kvm_ioctls::DeviceFd;
use tracing::{debug, info};

use crate::backend::kvm::Vm;
use crate::error::{Error, Result};

/// Distributor base address
pub const GICD_BASE: u64 = 0x10_0000;
/// Distributor size
pub const GICD_SIZE: u64 = 0x1_0000;

/// GICv3 redistributors, or the GICv2 CPU interface
pub const GICR_BASE: u64 = GICD_BASE + GICD_SIZE;
/// Redistributor frames per VCPU (GICv3)
pub const GICR_SIZE_PER_CPU: u64 = 0x2_0000;

/// Interrupt lines exposed to the guest
pub const NR_IRQS: u32 = 128;

/// Values from the KVM vGIC uapi.
mod vgic {
    pub const DEV_TYPE_V2: u32 = 5;
    pub const DEV_TYPE_V3: u32 = 7;

    pub const GRP_ADDR: u32 = 0;
    pub const GRP_NR_IRQS: u32 = 3;
    pub const GRP_CTRL: u32 = 4;
    pub const CTRL_INIT: u64 = 0;

    pub const V2_ADDR_DIST: u64 = 0;
    pub const V2_ADDR_CPU: u64 = 1;
    pub const V3_ADDR_DIST: u64 = 2;
    pub const V3_ADDR_REDIST: u64 = 3;
}

/// GIC architecture version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GicVersion {
    V2,
    V3,
}

impl GicVersion {
    fn device_type(self) -> u32 {
        match self {
            GicVersion::V2 => vgic::DEV_TYPE_V2,
            GicVersion::V3 => vgic::DEV_TYPE_V3,
        }
    }

    /// `(address attribute, guest physical address)` of each register frame.
    pub fn frames(self) -> [(u64, u64); 2] {
        match self {
            GicVersion::V2 => [(vgic::V2_ADDR_DIST, GICD_BASE), (vgic::V2_ADDR_CPU, GICR_BASE)],
            GicVersion::V3 => [(vgic::V3_ADDR_DIST, GICD_BASE), (vgic::V3_ADDR_REDIST, GICR_BASE)],
        }
    }
}

/// A KVM vGIC device.
pub struct Gic {
    device: DeviceFd,
    version: GicVersion,
    initialized: bool,
}

impl Gic {
    /// Create a GIC of the `preferred` version.
    ///
    /// With no preference a GICv3 is tried first, falling back to GICv2
    /// when the host has none.
    pub fn create(vm: &Vm, preferred: Option<GicVersion>) -> Result<Self> {
        let (device, version) = match preferred {
            Some(version) => (Self::create_device(vm, version)?, version),
            None => match Self::create_device(vm, GicVersion::V3) {
                Ok(device) => (device, GicVersion::V3),
                Err(e) => {
                    debug!(error = %e, "GICv3 unavailable, trying GICv2");
                    (Self::create_device(vm, GicVersion::V2)?, GicVersion::V2)
                }
            },
        };

        let gic = Self {
            device,
            version,
            initialized: false,
        };
        for (attr, addr) in version.frames() {
            gic.set_attr(vgic::GRP_ADDR, attr, &addr as *const u64 as u64)?;
        }
        let nr_irqs = NR_IRQS;
        gic.set_attr(vgic::GRP_NR_IRQS, 0, &nr_irqs as *const u32 as u64)?;

        info!(?version, "created in-kernel GIC");
        Ok(gic)
    }

    fn create_device(vm: &Vm, version: GicVersion) -> Result<DeviceFd> {
        let mut device = kvm_create_device {
            type_: version.device_type(),
            fd: 0,
            flags: 0,
        };
        vm.fd()
            .create_device(&mut device)
            .map_err(Error::from_kvm("KVM_CREATE_DEVICE"))
    }

    fn set_attr(&self, group: u32, attr: u64, addr: u64) -> Result<()> {
        let attr = kvm_device_attr {
            flags: 0,
            group,
            attr,
            addr,
        };
        self.device
            .set_device_attr(&attr)
            .map_err(Error::from_kvm("KVM_SET_DEVICE_ATTR"))
    }

    pub fn version(&self) -> GicVersion {
        self.version
    }

    /// Initialize the vGIC. Allowed exactly once, before the first run.
    pub fn finalize(&mut self) -> Result<()> {
        if self.initialized {
            return Err(Error::InvalidState {
                expected: "uninitialized GIC".to_string(),
                actual: "initialized GIC".to_string(),
            });
        }
        self.set_attr(vgic::GRP_CTRL, vgic::CTRL_INIT, 0)?;
        self.initialized = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_below_ram() {
        for version in [GicVersion::V2, GicVersion::V3] {
            for (_, addr) in version.frames() {
                assert!(addr >= GICD_BASE);
                assert!(addr + 64 * GICR_SIZE_PER_CPU < crate::memory::layout::RAM_START);
            }
        }
    }

    #[test]
    fn test_frames_clear_of_sys_page() {
        use crate::memory::layout::{SYS_SIZE, SYS_START};
        assert!(SYS_START + SYS_SIZE <= GICD_BASE);
        assert_eq!(GicVersion::V3.frames()[1], (3, 0x11_0000));
        assert_eq!(GicVersion::V2.frames()[1], (1, 0x11_0000));
    }
}
