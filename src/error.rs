//! Error types for sandvisor.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using sandvisor's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or running a machine.
#[derive(Error, Debug)]
pub enum Error {
    // Hypervisor setup errors
    #[error("cannot open KVM device {path}: {source}")]
    DeviceOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("KVM_GET_API_VERSION: got {found}, expected {expected}")]
    ApiVersion { found: i32, expected: i32 },

    #[error("{op}: {source}")]
    Kvm {
        op: &'static str,
        #[source]
        source: kvm_ioctls::Error,
    },

    #[error("feature not supported: {0}")]
    NotSupported(String),

    // Configuration errors
    #[error("invalid memory size: {0} bytes")]
    InvalidMemorySize(u64),

    #[error("invalid vCPU count: {0}")]
    InvalidVcpuCount(usize),

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("region at 0x{guest_addr:x} (+0x{size:x}) overlaps an existing region")]
    RegionOverlap { guest_addr: u64, size: u64 },

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    #[error("guest address 0x{0:x} is read-only")]
    ReadOnlyAddress(u64),

    #[error("no valid translation for guest virtual address 0x{0:x}")]
    TranslationFailed(u64),

    // Image errors
    #[error("invalid kernel format: {0}")]
    InvalidKernel(String),

    #[error("kernel is empty")]
    EmptyKernel,

    #[error("image too large: argv block of {0} bytes does not fit below the kernel")]
    ImageTooLarge(u64),

    // Runtime errors
    #[error("machine not in expected state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    #[error("unexpected kvm exit reason {reason} ({name})")]
    UnexpectedExit { reason: u32, name: &'static str },

    #[error("unknown hypercall {nr} at pc 0x{pc:x}")]
    UnknownHypercall { nr: u64, pc: u64 },

    #[error("debug exit")]
    DebugTrap,

    #[error("vCPU {0} worker is gone")]
    VcpuGone(usize),

    #[error("vCPU index {0} out of range")]
    VcpuOutOfRange(usize),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wrap a failed KVM ioctl, tagging it with the operation name.
    pub fn from_kvm(op: &'static str) -> impl FnOnce(kvm_ioctls::Error) -> Self {
        move |source| Error::Kvm { op, source }
    }
}
