//! Guest physical memory.
//!
//! Memory is carved into anonymous host mappings, each registered with KVM
//! under its own slot. Everything else in the crate reaches guest memory
//! through [`GuestMemory`]; nothing dereferences a guest address directly.

mod guest;

pub use guest::{GuestMemory, GuestMemoryRegion};

/// Size of a guest page.
pub const PAGE_SIZE: u64 = 0x1000;

/// Guest physical memory layout shared by both architectures.
pub mod layout {
    /// Read-only low page. On ARM64 writes to it trap as MMIO and serve as
    /// the hypercall doorbell.
    pub const SYS_START: u64 = 0x4000;
    pub const SYS_SIZE: u64 = 0x1000;

    /// Guest RAM starts at 1 GiB.
    pub const RAM_START: u64 = 0x4000_0000;

    /// argv scratch area at the bottom of RAM, below the kernel.
    pub const ARGV_START: u64 = RAM_START;

    /// Default physical load address for kernels.
    pub const KERNEL_START: u64 = RAM_START + 0x8000;

    /// RAM must end below 4 GiB so the identity map covers it.
    pub const RAM_LIMIT: u64 = 0x1_0000_0000;

    /// Smallest accepted RAM size.
    pub const MIN_RAM_SIZE: u64 = 32 << 20;
}

/// Round `value` up to the next multiple of `align` (a power of two).
pub fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}
