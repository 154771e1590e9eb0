//! x86-64 CPU bootstrap.
//!
//! 64-bit images start in long mode with the low 4 GiB identity mapped
//! through 2 MiB pages. 32-bit images start in flat protected mode without
//! paging. The GDT and page tables live in the last pages of RAM, which are
//! left out of the memory size reported to the guest.

use iced_x86::{Decoder, DecoderOptions, Formatter, IntelFormatter};

use crate::memory::PAGE_SIZE;

use super::CpuMode;

#[cfg(target_arch = "x86_64")]
use {
    super::{BootParams, HypercallArgs},
    crate::backend::kvm::regs::x86::*,
    crate::backend::kvm::Vcpu,
    crate::error::{Error, Result},
    crate::memory::{layout, GuestMemory},
    crate::translate::Translation,
    kvm_bindings::{kvm_regs, kvm_segment, KVM_MP_STATE_RUNNABLE},
};

/// Where KVM puts its three-page TSS on Intel hosts, just below 4 GiB.
pub const TSS_ADDRESS: u64 = 0xfffb_d000;

/// Pages at the top of RAM reserved for the GDT and page tables.
pub const RESERVED_PAGES: u64 = 7;
pub const RESERVED_SIZE: u64 = RESERVED_PAGES * PAGE_SIZE;

const GDT_OFFSET: u64 = 0;
const PML4_OFFSET: u64 = PAGE_SIZE;

const CODE_SELECTOR: u16 = 0x08;
const DATA_SELECTOR: u16 = 0x10;
const GDT_ENTRIES: usize = 3;

/// Number of page directories, one per GiB of identity map.
const PD_COUNT: u64 = 4;

/// GDT entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GdtEntry {
    pub limit_low: u16,
    pub base_low: u16,
    pub base_middle: u8,
    pub access: u8,
    pub granularity: u8,
    pub base_high: u8,
}

impl GdtEntry {
    /// Create a null descriptor.
    pub fn null() -> Self {
        Self::default()
    }

    /// Flat code segment for the given CPU mode.
    pub fn code(mode: CpuMode) -> Self {
        Self {
            limit_low: 0xffff,
            access: 0x9b, // present, ring 0, code, execute/read, accessed
            granularity: match mode {
                CpuMode::Long64 => 0xaf,      // 4K pages, L=1
                CpuMode::Protected32 => 0xcf, // 4K pages, D=1
            },
            ..Self::default()
        }
    }

    /// Flat read/write data segment.
    pub fn data() -> Self {
        Self {
            limit_low: 0xffff,
            access: 0x93,
            granularity: 0xcf,
            ..Self::default()
        }
    }

    pub fn base(&self) -> u64 {
        self.base_low as u64 | (self.base_middle as u64) << 16 | (self.base_high as u64) << 24
    }

    /// Segment limit in bytes, scaled by the granularity bit.
    pub fn limit(&self) -> u32 {
        let raw = self.limit_low as u32 | ((self.granularity as u32 & 0x0f) << 16);
        if self.granularity & 0x80 != 0 {
            (raw << 12) | 0xfff
        } else {
            raw
        }
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let mut bytes = [0u8; 8];
        bytes[0..2].copy_from_slice(&self.limit_low.to_le_bytes());
        bytes[2..4].copy_from_slice(&self.base_low.to_le_bytes());
        bytes[4] = self.base_middle;
        bytes[5] = self.access;
        bytes[6] = self.granularity;
        bytes[7] = self.base_high;
        bytes
    }

    /// The hidden segment register state KVM expects for this descriptor.
    #[cfg(target_arch = "x86_64")]
    pub fn segment(&self, selector: u16) -> kvm_segment {
        kvm_segment {
            base: self.base(),
            limit: self.limit(),
            selector,
            type_: self.access & 0x0f,
            present: (self.access >> 7) & 1,
            dpl: (self.access >> 5) & 3,
            db: (self.granularity >> 6) & 1,
            s: (self.access >> 4) & 1,
            l: (self.granularity >> 5) & 1,
            g: (self.granularity >> 7) & 1,
            avl: (self.granularity >> 4) & 1,
            unusable: 0,
            padding: 0,
        }
    }
}

/// Build the GDT: null, code (0x08), data (0x10).
pub fn build_gdt(mode: CpuMode) -> Vec<u8> {
    let mut gdt = Vec::with_capacity(GDT_ENTRIES * 8);
    gdt.extend_from_slice(&GdtEntry::null().to_bytes());
    gdt.extend_from_slice(&GdtEntry::code(mode).to_bytes());
    gdt.extend_from_slice(&GdtEntry::data().to_bytes());
    gdt
}

/// Build identity-mapping page tables for the low 4 GiB.
///
/// The result is one PML4 page at `pml4`, followed by one PDPT page and
/// four page directories of 2 MiB pages.
pub fn build_page_tables(pml4: u64) -> Vec<u8> {
    use crate::backend::kvm::regs::x86::{PTE_ACCESSED, PTE_DIRTY, PTE_PRESENT, PTE_PS, PTE_RW};

    let page = PAGE_SIZE as usize;
    let mut tables = vec![0u8; page * (2 + PD_COUNT as usize)];
    let mut put = |index: usize, value: u64| {
        tables[index * 8..index * 8 + 8].copy_from_slice(&value.to_le_bytes());
    };

    let pdpt = pml4 + PAGE_SIZE;
    put(0, pdpt | PTE_PRESENT | PTE_RW);

    for i in 0..PD_COUNT {
        let pd = pdpt + PAGE_SIZE * (1 + i);
        put(page / 8 + i as usize, pd | PTE_PRESENT | PTE_RW | PTE_ACCESSED | PTE_DIRTY);
        for j in 0..512u64 {
            let addr = (i << 30) | (j << 21);
            let slot = (2 + i as usize) * page / 8 + j as usize;
            put(slot, addr | PTE_PRESENT | PTE_RW | PTE_ACCESSED | PTE_DIRTY | PTE_PS);
        }
    }
    tables
}

/// Kernel virtual to physical: strip the kernel-text or direct-map offset.
pub fn kernel_to_physical(va: u64) -> u64 {
    const KERNEL_TEXT: u64 = 0xffff_ffff_8000_0000;
    const DIRECT_MAP: u64 = 0xffff_8000_0000_0000;
    if va >= KERNEL_TEXT {
        va - KERNEL_TEXT
    } else if va >= DIRECT_MAP {
        va - DIRECT_MAP
    } else {
        va
    }
}

/// Decode one instruction at `pc` with the bitness of `mode`.
pub fn disassemble(mode: CpuMode, pc: u64, bytes: &[u8]) -> String {
    let bitness = match mode {
        CpuMode::Long64 => 64,
        CpuMode::Protected32 => 32,
    };
    let mut decoder = Decoder::with_ip(bitness, bytes, pc, DecoderOptions::NONE);
    let instruction = decoder.decode();
    if instruction.is_invalid() {
        return "(bad)".to_string();
    }
    let mut formatter = IntelFormatter::new();
    let mut out = String::new();
    formatter.format(&instruction, &mut out);
    out
}

/// Hide the paravirtual PMU and advertise the KVM signature leaf.
#[cfg(target_arch = "x86_64")]
pub fn patch_cpuid(cpuid: &mut kvm_bindings::CpuId) {
    for entry in cpuid.as_mut_slice() {
        match entry.function {
            0xa => entry.eax = 0,
            0x4000_0000 => {
                entry.eax = 0x4000_0001;
                entry.ebx = 0x4b4d_564b; // "KVMK"
                entry.ecx = 0x564b_4d56; // "VMKV"
                entry.edx = 0x4d; // "M"
            }
            _ => {}
        }
    }
}

/// Program segments, control registers, page tables and entry registers.
#[cfg(target_arch = "x86_64")]
pub fn bootstrap(vcpu: &Vcpu, memory: &GuestMemory, boot: &BootParams) -> Result<()> {
    let ram = memory
        .find_region(layout::RAM_START)
        .ok_or(Error::InvalidGuestAddress(layout::RAM_START))?;
    let base = ram.end() - RESERVED_SIZE;

    memory.write(base + GDT_OFFSET, &build_gdt(boot.mode))?;

    let mut sregs = vcpu.sregs()?;
    sregs.gdt.base = base + GDT_OFFSET;
    sregs.gdt.limit = (GDT_ENTRIES * 8 - 1) as u16;

    let code = GdtEntry::code(boot.mode).segment(CODE_SELECTOR);
    let data = GdtEntry::data().segment(DATA_SELECTOR);
    sregs.cs = code;
    sregs.ds = data;
    sregs.es = data;
    sregs.fs = data;
    sregs.gs = data;
    sregs.ss = data;

    match boot.mode {
        CpuMode::Long64 => {
            let pml4 = base + PML4_OFFSET;
            memory.write(pml4, &build_page_tables(pml4))?;
            sregs.cr3 = pml4;
            sregs.cr4 = CR4_LONG_MODE;
            sregs.cr0 = CR0_LONG_MODE;
            sregs.efer = EFER_LONG_MODE;
        }
        CpuMode::Protected32 => {
            sregs.cr0 |= CR0_PE;
        }
    }
    vcpu.set_sregs(&sregs)?;

    let regs = kvm_regs {
        rflags: RFLAGS_RESERVED,
        rip: boot.entry,
        rdi: boot.memory_size,
        rsi: boot.argc,
        rdx: boot.argv,
        ..Default::default()
    };
    vcpu.set_regs(&regs)?;

    // Every VCPU starts at the entry point; none waits for a startup IPI.
    vcpu.set_mp_state(KVM_MP_STATE_RUNNABLE)
}

#[cfg(target_arch = "x86_64")]
pub fn translate(vcpu: &Vcpu, gva: u64) -> Result<Translation> {
    let t = vcpu.translate_gva(gva)?;
    Ok(Translation {
        virtual_address: gva,
        physical_address: t.physical_address,
        valid: t.valid != 0,
        writable: t.writeable != 0,
        usermode: t.usermode != 0,
    })
}

#[cfg(target_arch = "x86_64")]
pub fn pc(vcpu: &Vcpu) -> Result<u64> {
    Ok(vcpu.regs()?.rip)
}

#[cfg(target_arch = "x86_64")]
pub fn set_pc(vcpu: &Vcpu, pc: u64) -> Result<()> {
    let mut regs = vcpu.regs()?;
    regs.rip = pc;
    vcpu.set_regs(&regs)
}

/// RAX holds the call number; arguments follow the syscall convention.
#[cfg(target_arch = "x86_64")]
pub fn hypercall_args(vcpu: &Vcpu) -> Result<HypercallArgs> {
    let regs = vcpu.regs()?;
    Ok(HypercallArgs {
        nr: regs.rax,
        args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
        pc: regs.rip,
    })
}

#[cfg(target_arch = "x86_64")]
pub fn set_hypercall_result(vcpu: &Vcpu, value: u64) -> Result<()> {
    let mut regs = vcpu.regs()?;
    regs.rax = value;
    vcpu.set_regs(&regs)
}
