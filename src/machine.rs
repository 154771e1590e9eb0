//! The virtual machine.
//!
//! A [`Machine`] owns the KVM VM, its guest memory, the interrupt controller
//! and one worker thread per VCPU. It moves through
//! [`MachineState`]: created, loaded with a kernel, running, stopped.

use std::sync::Arc;

use crossbeam_utils::sync::WaitGroup;
use object::ReadRef;
use tracing::{debug, error, info};

use crate::arch::{Architecture, BootParams, VcpuTranslator};
use crate::backend::kvm::{KvmDevice, Vcpu, Vm};
use crate::builder::{MachineBuilder, MachineConfig};
use crate::device::{InterruptController, IrqLine};
use crate::error::{Error, Result};
use crate::hypercall::Container;
use crate::loader;
use crate::memory::{layout, GuestMemory};
use crate::runner::{self, RunContext, StopReason};
use crate::translate::{GuestView, Translation};
use crate::vcpu::VcpuHandle;

/// Lifecycle of a [`Machine`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineState {
    /// VM, memory and VCPUs exist; nothing is loaded.
    Created,
    /// A kernel is loaded and every VCPU is at its entry point.
    Loaded,
    /// VCPUs are executing.
    Running,
    /// Every VCPU left its run loop.
    Stopped,
    /// A VCPU stopped on an error.
    Failed,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Created => write!(f, "created"),
            MachineState::Loaded => write!(f, "loaded"),
            MachineState::Running => write!(f, "running"),
            MachineState::Stopped => write!(f, "stopped"),
            MachineState::Failed => write!(f, "failed"),
        }
    }
}

/// A sandboxed virtual machine.
///
/// Use [`Machine::builder()`] to create one.
///
/// # Example
///
/// ```rust,no_run
/// use sandvisor::Machine;
///
/// let image = std::fs::read("guest.elf")?;
/// let mut machine = Machine::builder().memory_mb(64).build()?;
/// machine.load_kernel(image.as_slice(), &["guest", "--verbose"])?;
/// for reason in machine.boot()? {
///     println!("{:?}", reason);
/// }
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct Machine {
    // Workers go first so VCPU fds close before the VM and memory.
    vcpus: Vec<VcpuHandle>,
    irq: InterruptController,
    vm: Arc<Vm>,
    _kvm: KvmDevice,
    memory: Arc<GuestMemory>,
    container: Arc<Container>,
    arch: Architecture,
    config: MachineConfig,
    boot: Option<BootParams>,
    state: MachineState,
}

impl Machine {
    /// Create a new machine builder.
    pub fn builder() -> MachineBuilder {
        MachineBuilder::new()
    }

    /// Create the VM, map guest memory and start the VCPU threads.
    ///
    /// `config` must already be validated.
    pub fn new(config: MachineConfig, container: Arc<Container>) -> Result<Self> {
        let arch = Architecture::host()?;
        let kvm = KvmDevice::open(&config.device)?;
        let mmap_size = kvm.vcpu_mmap_size()?;
        debug!(target: "sandvisor::machine", mmap_size, "vcpu run area");

        let vm = Arc::new(kvm.create_vm()?);
        arch.init_vm(&vm)?;

        let mut memory = GuestMemory::new();
        memory.add_region(layout::RAM_START, config.memory_size, false)?;
        memory.add_region(layout::SYS_START, layout::SYS_SIZE, true)?;
        for region in memory.regions() {
            vm.register_region(region)?;
        }
        let memory = Arc::new(memory);

        let early_irq = if arch.irqchip_before_vcpus() {
            Some(InterruptController::create(arch, &vm, config.gic)?)
        } else {
            None
        };

        let setup = arch.vcpu_setup(&kvm, &vm, config.psci)?;
        let mut vcpus = Vec::with_capacity(config.vcpus);
        for id in 0..config.vcpus {
            let setup = setup.clone();
            vcpus.push(VcpuHandle::spawn(id, vm.clone(), move |vcpu| {
                arch.prepare_vcpu(vcpu, &setup)
            })?);
        }

        let irq = match early_irq {
            Some(irq) => irq,
            None => InterruptController::create(arch, &vm, config.gic)?,
        };

        info!(
            target: "sandvisor::machine",
            arch = %arch,
            memory = config.memory_size,
            vcpus = config.vcpus,
            "machine created"
        );

        Ok(Self {
            vcpus,
            irq,
            vm,
            _kvm: kvm,
            memory,
            container,
            arch,
            config,
            boot: None,
            state: MachineState::Created,
        })
    }

    /// Copy `image` into guest memory, place `args` and point every VCPU
    /// at the entry point.
    ///
    /// May be called again before [`boot`](Self::boot) to replace the image.
    pub fn load_kernel<'data, R, S>(&mut self, image: R, args: &[S]) -> Result<BootParams>
    where
        R: ReadRef<'data>,
        S: AsRef<str>,
    {
        if !matches!(self.state, MachineState::Created | MachineState::Loaded) {
            return Err(self.unexpected_state("created or loaded"));
        }

        let boot = loader::load(image, args, self.arch, &self.memory)?;
        for handle in &self.vcpus {
            let arch = self.arch;
            let memory = self.memory.clone();
            handle.call(move |vcpu| arch.bootstrap(vcpu, &memory, &boot))?;
        }

        self.boot = Some(boot);
        self.state = MachineState::Loaded;
        Ok(boot)
    }

    /// Run every VCPU until each one halts, exits, or fails.
    ///
    /// Returns the stop reasons in VCPU order, or the first error.
    pub fn boot(&mut self) -> Result<Vec<StopReason>> {
        let boot = match (self.state, self.boot) {
            (MachineState::Loaded, Some(boot)) => boot,
            _ => return Err(self.unexpected_state("loaded")),
        };
        self.irq.finalize()?;
        self.state = MachineState::Running;

        let ctx = RunContext {
            arch: self.arch,
            mode: boot.mode,
            memory: self.memory.clone(),
            container: self.container.clone(),
            trace: self.config.trace,
        };

        // Every run loop holds a clone until it returns.
        let done = WaitGroup::new();
        let mut pending = Vec::with_capacity(self.vcpus.len());
        for handle in &self.vcpus {
            let ctx = ctx.clone();
            let done = done.clone();
            let reply = handle.submit(move |vcpu| {
                let result = runner::run(vcpu, &ctx);
                drop(done);
                result
            });
            pending.push((handle.id(), reply));
        }
        info!(target: "sandvisor::machine", vcpus = pending.len(), "machine running");
        done.wait();

        let mut reasons = Vec::with_capacity(pending.len());
        let mut failure = None;
        for (id, reply) in pending {
            let result = reply.and_then(|rx| rx.blocking_recv().map_err(|_| Error::VcpuGone(id))?);
            match result {
                Ok(reason) => {
                    info!(target: "sandvisor::machine", vcpu = id, ?reason, "vcpu stopped");
                    reasons.push(reason);
                }
                Err(e) => {
                    error!(target: "sandvisor::machine", vcpu = id, error = %e, "vcpu failed");
                    failure.get_or_insert(e);
                }
            }
        }

        match failure {
            Some(e) => {
                self.state = MachineState::Failed;
                Err(e)
            }
            None => {
                self.state = MachineState::Stopped;
                Ok(reasons)
            }
        }
    }

    /// Run `f` on the thread that owns VCPU `cpu`.
    ///
    /// Blocks while that VCPU is inside its run loop.
    pub fn with_vcpu<T, F>(&self, cpu: usize, f: F) -> Result<T>
    where
        F: FnOnce(&Vcpu) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.handle(cpu)?.call(move |vcpu| f(vcpu))
    }

    /// Translate a guest virtual address through VCPU `cpu`.
    pub fn translate(&self, cpu: usize, gva: u64) -> Result<Translation> {
        let arch = self.arch;
        let memory = self.memory.clone();
        self.with_vcpu(cpu, move |vcpu| arch.translate(vcpu, &memory, gva))
    }

    /// Read `len` bytes at guest virtual address `gva` as seen by VCPU `cpu`.
    pub fn read_virtual(&self, cpu: usize, gva: u64, len: usize) -> Result<Vec<u8>> {
        let arch = self.arch;
        let memory = self.memory.clone();
        self.with_vcpu(cpu, move |vcpu| {
            let translator = VcpuTranslator {
                arch,
                vcpu,
                memory: &memory,
            };
            let mut buf = vec![0u8; len];
            GuestView::new(&memory, &translator).read(gva, &mut buf)?;
            Ok(buf)
        })
    }

    /// Program counter of VCPU `cpu`.
    pub fn pc(&self, cpu: usize) -> Result<u64> {
        let arch = self.arch;
        self.with_vcpu(cpu, move |vcpu| arch.pc(vcpu))
    }

    /// Move VCPU `cpu` to `pc`.
    pub fn set_pc(&self, cpu: usize, pc: u64) -> Result<()> {
        let arch = self.arch;
        self.with_vcpu(cpu, move |vcpu| arch.set_pc(vcpu, pc))
    }

    /// Toggle single-stepping on VCPU `cpu`.
    pub fn set_single_step(&self, cpu: usize, enabled: bool) -> Result<()> {
        self.with_vcpu(cpu, move |vcpu| vcpu.set_single_step(enabled))
    }

    /// Drive interrupt line `irq` to `level`.
    pub fn inject_irq(&self, irq: u32, level: u32) -> Result<()> {
        self.interrupt_line().inject(irq, level)
    }

    /// A handle for raising interrupt lines while the machine runs.
    pub fn interrupt_line(&self) -> IrqLine {
        IrqLine::new(self.arch, self.vm.clone())
    }

    /// Number of VCPUs.
    pub fn vcpu_count(&self) -> usize {
        self.vcpus.len()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> MachineState {
        self.state
    }

    /// Guest architecture.
    pub fn architecture(&self) -> Architecture {
        self.arch
    }

    /// Guest physical memory.
    pub fn memory(&self) -> &GuestMemory {
        &self.memory
    }

    /// The filesystem sandbox serving hypercalls.
    pub fn container(&self) -> &Container {
        &self.container
    }

    /// Boot parameters of the loaded kernel.
    pub fn boot_params(&self) -> Option<&BootParams> {
        self.boot.as_ref()
    }

    /// The configuration this machine was built from.
    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    fn handle(&self, cpu: usize) -> Result<&VcpuHandle> {
        self.vcpus.get(cpu).ok_or(Error::VcpuOutOfRange(cpu))
    }

    fn unexpected_state(&self, expected: &str) -> Error {
        Error::InvalidState {
            expected: expected.to_string(),
            actual: self.state.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(MachineState::Created.to_string(), "created");
        assert_eq!(MachineState::Loaded.to_string(), "loaded");
        assert_eq!(MachineState::Running.to_string(), "running");
        assert_eq!(MachineState::Stopped.to_string(), "stopped");
        assert_eq!(MachineState::Failed.to_string(), "failed");
    }

    fn machine() -> Option<Machine> {
        if !crate::backend::kvm::is_available() {
            return None;
        }
        Machine::builder()
            .memory_mb(32)
            .container(Container::unrestricted())
            .build()
            .ok()
    }

    #[test]
    fn test_new_machine() {
        let Some(machine) = machine() else { return };
        assert_eq!(machine.state(), MachineState::Created);
        assert_eq!(machine.vcpu_count(), 1);
        assert!(machine.boot_params().is_none());

        let sys = machine.memory().find_region(layout::SYS_START).unwrap();
        assert!(sys.readonly);
        let ram = machine.memory().find_region(layout::RAM_START).unwrap();
        assert_eq!(ram.size, 32 << 20);
    }

    #[test]
    fn test_boot_requires_kernel() {
        let Some(mut machine) = machine() else { return };
        match machine.boot() {
            Err(Error::InvalidState { expected, actual }) => {
                assert_eq!(expected, "loaded");
                assert_eq!(actual, "created");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_vcpu_out_of_range() {
        let Some(machine) = machine() else { return };
        assert!(matches!(machine.pc(1), Err(Error::VcpuOutOfRange(1))));
    }

    #[test]
    fn test_bad_image_leaves_machine_created() {
        let Some(mut machine) = machine() else { return };
        assert!(machine.load_kernel(&b"junk"[..], &["x"]).is_err());
        assert_eq!(machine.state(), MachineState::Created);
    }
}
