//! Register layouts and constants shared with KVM.
//!
//! Values here mirror the kernel's uapi headers. They are kept as plain
//! integers so they can be used (and tested) on any host architecture.

/// KVM exit reasons, as found in `kvm_run.exit_reason`.
pub mod exit {
    pub const UNKNOWN: u32 = 0;
    pub const EXCEPTION: u32 = 1;
    pub const IO: u32 = 2;
    pub const HYPERCALL: u32 = 3;
    pub const DEBUG: u32 = 4;
    pub const HLT: u32 = 5;
    pub const MMIO: u32 = 6;
    pub const IRQ_WINDOW_OPEN: u32 = 7;
    pub const SHUTDOWN: u32 = 8;
    pub const FAIL_ENTRY: u32 = 9;
    pub const INTR: u32 = 10;
    pub const INTERNAL_ERROR: u32 = 17;
    pub const SYSTEM_EVENT: u32 = 24;

    /// Human readable name of an exit reason.
    pub fn name(reason: u32) -> &'static str {
        const NAMES: [&str; 28] = [
            "KVM_EXIT_UNKNOWN",
            "KVM_EXIT_EXCEPTION",
            "KVM_EXIT_IO",
            "KVM_EXIT_HYPERCALL",
            "KVM_EXIT_DEBUG",
            "KVM_EXIT_HLT",
            "KVM_EXIT_MMIO",
            "KVM_EXIT_IRQ_WINDOW_OPEN",
            "KVM_EXIT_SHUTDOWN",
            "KVM_EXIT_FAIL_ENTRY",
            "KVM_EXIT_INTR",
            "KVM_EXIT_SET_TPR",
            "KVM_EXIT_TPR_ACCESS",
            "KVM_EXIT_S390_SIEIC",
            "KVM_EXIT_S390_RESET",
            "KVM_EXIT_DCR",
            "KVM_EXIT_NMI",
            "KVM_EXIT_INTERNAL_ERROR",
            "KVM_EXIT_OSI",
            "KVM_EXIT_PAPR_HCALL",
            "KVM_EXIT_S390_UCONTROL",
            "KVM_EXIT_WATCHDOG",
            "KVM_EXIT_S390_TSCH",
            "KVM_EXIT_EPR",
            "KVM_EXIT_SYSTEM_EVENT",
            "KVM_EXIT_S390_STSI",
            "KVM_EXIT_IOAPIC_EOI",
            "KVM_EXIT_HYPERV",
        ];
        NAMES.get(reason as usize).copied().unwrap_or("KVM_EXIT_UNRECOGNIZED")
    }
}

/// x86-64 control register, EFER and paging bits.
pub mod x86 {
    pub const CR0_PE: u64 = 1 << 0;
    pub const CR0_MP: u64 = 1 << 1;
    pub const CR0_ET: u64 = 1 << 4;
    pub const CR0_NE: u64 = 1 << 5;
    pub const CR0_WP: u64 = 1 << 16;
    pub const CR0_AM: u64 = 1 << 18;
    pub const CR0_PG: u64 = 1 << 31;

    pub const CR4_PAE: u64 = 1 << 5;
    pub const CR4_OSFXSR: u64 = 1 << 9;
    pub const CR4_OSXMMEXCPT: u64 = 1 << 10;

    pub const EFER_SCE: u64 = 1 << 0;
    pub const EFER_LME: u64 = 1 << 8;
    pub const EFER_LMA: u64 = 1 << 10;
    pub const EFER_NXE: u64 = 1 << 11;

    pub const PTE_PRESENT: u64 = 1 << 0;
    pub const PTE_RW: u64 = 1 << 1;
    pub const PTE_ACCESSED: u64 = 1 << 5;
    pub const PTE_DIRTY: u64 = 1 << 6;
    pub const PTE_PS: u64 = 1 << 7;

    /// Bit 1 of RFLAGS is reserved and always set.
    pub const RFLAGS_RESERVED: u64 = 1 << 1;

    pub const CR0_LONG_MODE: u64 = CR0_PE | CR0_MP | CR0_ET | CR0_NE | CR0_WP | CR0_AM | CR0_PG;
    pub const CR4_LONG_MODE: u64 = CR4_PAE | CR4_OSFXSR | CR4_OSXMMEXCPT;
    pub const EFER_LONG_MODE: u64 = EFER_LME | EFER_LMA | EFER_SCE | EFER_NXE;
}

/// ARM64 core register ids for `KVM_{GET,SET}_ONE_REG`.
pub mod arm64 {
    const KVM_REG_ARM64: u64 = 0x6000_0000_0000_0000;
    const KVM_REG_SIZE_U64: u64 = 0x0030_0000_0000_0000;
    const KVM_REG_ARM_CORE: u64 = 0x0010 << 16;

    /// Byte offsets into `struct kvm_regs` (which starts with `user_pt_regs`).
    pub const fn x_offset(n: usize) -> u64 {
        8 * n as u64
    }
    pub const SP_OFFSET: u64 = 8 * 31;
    pub const PC_OFFSET: u64 = 8 * 32;
    pub const PSTATE_OFFSET: u64 = 8 * 33;

    /// EL1h with D, A, I and F masked.
    pub const PSTATE_BOOT: u64 = 0x3c5;

    /// Register id of the 64-bit core register at byte `offset`.
    pub const fn core_reg(offset: u64) -> u64 {
        KVM_REG_ARM64 | KVM_REG_SIZE_U64 | KVM_REG_ARM_CORE | (offset / 4)
    }
}
