//! VCPU run loop.
//!
//! Each VCPU thread enters the guest, classifies the exit and either
//! services a hypercall, traces the instruction it stopped on, or stops.

use std::sync::Arc;

use tracing::{debug, info, trace};

use crate::arch::{Architecture, CpuMode, VcpuTranslator};
use crate::backend::kvm::regs::exit;
use crate::backend::kvm::{Vcpu, VcpuExit};
use crate::error::{Error, Result};
use crate::hypercall::{Container, Outcome};
use crate::memory::{GuestMemory, PAGE_SIZE};
use crate::translate::GuestView;

/// Bytes fetched at the program counter for trace output.
const TRACE_WINDOW: u64 = 16;

/// Where a VCPU is in its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuState {
    /// Bootstrapped, not yet entered
    Ready,
    /// Inside `KVM_RUN`
    Running,
    /// Back from `KVM_RUN`, exit not yet handled
    ExitPending,
    /// Servicing a hypercall
    HypercallDispatch,
    /// Stopped cleanly
    Halted,
    /// Stopped on a single step
    DebugTrap,
    /// Stopped on an error
    Fatal,
}

/// Why a VCPU left its run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The guest halted.
    Halted,
    /// The guest issued the `exit` hypercall with this code.
    Exited(u64),
}

/// Action to take after a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Enter the guest again.
    Continue,
    /// Read the hypercall registers and dispatch.
    Hypercall,
    /// Log the instruction at the program counter, then continue.
    Trace,
    /// Leave the run loop.
    Stop,
}

/// Decide what to do with `exit`.
///
/// A debug exit is only expected while tracing; otherwise it is an error.
pub fn classify(exit: VcpuExit, tracing: bool) -> Result<ExitAction> {
    match exit {
        VcpuExit::Halt => Ok(ExitAction::Stop),
        VcpuExit::Io | VcpuExit::Mmio => Ok(ExitAction::Hypercall),
        VcpuExit::Debug if tracing => Ok(ExitAction::Trace),
        VcpuExit::Debug => Err(Error::DebugTrap),
        VcpuExit::Interrupted | VcpuExit::Unknown => Ok(ExitAction::Continue),
        VcpuExit::Unrecognized(reason) => Err(Error::UnexpectedExit {
            reason,
            name: exit::name(reason),
        }),
    }
}

/// State shared by every run loop of a machine.
#[derive(Clone)]
pub struct RunContext {
    pub arch: Architecture,
    /// Mode the loaded image runs in
    pub mode: CpuMode,
    pub memory: Arc<GuestMemory>,
    pub container: Arc<Container>,
    /// Single-step and log every instruction
    pub trace: bool,
}

/// Drive `vcpu` until it halts, exits, or fails.
pub fn run(vcpu: &mut Vcpu, ctx: &RunContext) -> Result<StopReason> {
    let mut run_loop = RunLoop {
        vcpu,
        ctx,
        state: VcpuState::Ready,
    };
    let result = run_loop.drive();
    if result.is_err() {
        run_loop.enter(VcpuState::Fatal);
    }
    result
}

struct RunLoop<'a> {
    vcpu: &'a mut Vcpu,
    ctx: &'a RunContext,
    state: VcpuState,
}

impl RunLoop<'_> {
    fn enter(&mut self, next: VcpuState) {
        if self.state != next {
            trace!(target: "sandvisor::runner", vcpu = self.vcpu.id(), from = ?self.state, to = ?next);
            self.state = next;
        }
    }

    fn drive(&mut self) -> Result<StopReason> {
        loop {
            // KVM drops the single-step request after each debug exit.
            if self.ctx.trace {
                self.vcpu.set_single_step(true)?;
            }

            self.enter(VcpuState::Running);
            let exit = self.vcpu.run()?;
            self.enter(VcpuState::ExitPending);

            match classify(exit, self.ctx.trace)? {
                ExitAction::Continue => {}
                ExitAction::Stop => {
                    self.enter(VcpuState::Halted);
                    debug!(target: "sandvisor::runner", vcpu = self.vcpu.id(), "halted");
                    return Ok(StopReason::Halted);
                }
                ExitAction::Hypercall => {
                    self.enter(VcpuState::HypercallDispatch);
                    if let Some(code) = self.hypercall()? {
                        self.enter(VcpuState::Halted);
                        return Ok(StopReason::Exited(code));
                    }
                }
                ExitAction::Trace => {
                    self.enter(VcpuState::DebugTrap);
                    self.trace_instruction()?;
                }
            }
        }
    }

    /// Service one hypercall; `Some(code)` when the guest asked to exit.
    fn hypercall(&mut self) -> Result<Option<u64>> {
        let arch = self.ctx.arch;
        let vcpu: &Vcpu = self.vcpu;
        let call = arch.hypercall_args(vcpu)?;

        let translator = VcpuTranslator {
            arch,
            vcpu,
            memory: &self.ctx.memory,
        };
        let guest = GuestView::new(&self.ctx.memory, &translator);

        match self.ctx.container.dispatch(&call, &guest)? {
            Outcome::Return(value) => {
                arch.set_hypercall_result(vcpu, value)?;
                Ok(None)
            }
            Outcome::Exit(code) => Ok(Some(code)),
        }
    }

    fn trace_instruction(&mut self) -> Result<()> {
        let arch = self.ctx.arch;
        let vcpu: &Vcpu = self.vcpu;
        let pc = arch.pc(vcpu)?;

        let translator = VcpuTranslator {
            arch,
            vcpu,
            memory: &self.ctx.memory,
        };
        let guest = GuestView::new(&self.ctx.memory, &translator);

        // Stay on the current page; the next one may not be mapped.
        let len = TRACE_WINDOW.min(PAGE_SIZE - (pc & (PAGE_SIZE - 1))) as usize;
        let mut bytes = [0u8; TRACE_WINDOW as usize];
        let text = match guest.read(pc, &mut bytes[..len]) {
            Ok(()) => arch.disassemble(self.ctx.mode, pc, &bytes[..len]),
            Err(e) => format!("<unreadable: {}>", e),
        };
        info!(target: "sandvisor::trace", vcpu = vcpu.id(), "0x{:016x}: {}", pc, text);
        Ok(())
    }
}
