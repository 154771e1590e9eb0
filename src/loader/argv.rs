//! Guest argv marshaling.
//!
//! The block sits at the bottom of RAM: the NUL-terminated strings back to
//! back, then an 8-byte aligned array of guest pointers to them ending with
//! a null pointer. It must end below the first byte of the kernel.

use crate::arch::Architecture;
use crate::error::{Error, Result};
use crate::memory::{align_up, layout, GuestMemory};

/// A serialized argv block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgvBlock {
    pub bytes: Vec<u8>,
    pub argc: u64,
    /// Guest address of the pointer array
    pub argv: u64,
}

/// Serialize `args` for placement at physical address `base`.
///
/// `to_guest` maps a physical address to the address the guest uses.
pub fn build<S: AsRef<str>>(args: &[S], base: u64, to_guest: impl Fn(u64) -> u64) -> ArgvBlock {
    let mut bytes = Vec::new();
    let mut offsets = Vec::with_capacity(args.len());
    for arg in args {
        offsets.push(bytes.len() as u64);
        bytes.extend_from_slice(arg.as_ref().as_bytes());
        bytes.push(0);
    }
    bytes.resize(align_up(bytes.len() as u64, 8) as usize, 0);

    let array = base + bytes.len() as u64;
    for offset in offsets {
        bytes.extend_from_slice(&to_guest(base + offset).to_le_bytes());
    }
    bytes.extend_from_slice(&0u64.to_le_bytes());

    ArgvBlock {
        bytes,
        argc: args.len() as u64,
        argv: to_guest(array),
    }
}

/// Write `args` into guest memory below `limit`; returns `(argc, argv)`.
pub fn place<S: AsRef<str>>(
    args: &[S],
    arch: Architecture,
    memory: &GuestMemory,
    limit: u64,
) -> Result<(u64, u64)> {
    let block = build(args, layout::ARGV_START, |pa| arch.physical_to_kernel(pa));
    let size = block.bytes.len() as u64;
    if layout::ARGV_START + size > limit {
        return Err(Error::ImageTooLarge(size));
    }
    memory.write(layout::ARGV_START, &block.bytes)?;
    Ok((block.argc, block.argv))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn test_layout() {
        let block = build(&["init", "-v"], 0x1000, |pa| pa);
        // "init\0-v\0" is 8 bytes, already aligned.
        assert_eq!(&block.bytes[..8], b"init\0-v\0");
        assert_eq!(block.argc, 2);
        assert_eq!(block.argv, 0x1008);
        assert_eq!(ptr(&block.bytes, 8), 0x1000);
        assert_eq!(ptr(&block.bytes, 16), 0x1005);
        assert_eq!(ptr(&block.bytes, 24), 0);
        assert_eq!(block.bytes.len(), 32);
    }

    #[test]
    fn test_alignment_and_translation() {
        let block = build(&["a"], 0x4000_0000, |pa| pa + 0x100_0000_0000);
        assert_eq!(&block.bytes[..2], b"a\0");
        assert_eq!(&block.bytes[2..8], &[0u8; 6]);
        assert_eq!(block.argv, 0x100_4000_0008);
        assert_eq!(ptr(&block.bytes, 8), 0x100_4000_0000);
    }

    #[test]
    fn test_empty_args() {
        let block = build::<&str>(&[], 0x1000, |pa| pa);
        assert_eq!(block.argc, 0);
        assert_eq!(block.bytes, vec![0u8; 8]);
        assert_eq!(block.argv, 0x1000);
    }

    #[test]
    fn test_place() {
        let mut mem = GuestMemory::new();
        mem.add_region(layout::RAM_START, 1 << 20, false).unwrap();

        let (argc, argv) = place(&["prog", "x"], Architecture::X86_64, &mem, layout::KERNEL_START).unwrap();
        assert_eq!(argc, 2);
        let first: u64 = mem.read_obj(argv).unwrap();
        let mut s = [0u8; 5];
        mem.read(first, &mut s).unwrap();
        assert_eq!(&s, b"prog\0");
    }

    #[test]
    fn test_too_large() {
        let mut mem = GuestMemory::new();
        mem.add_region(layout::RAM_START, 1 << 20, false).unwrap();

        let big = "x".repeat(0x8000);
        let err = place(&[big.as_str()], Architecture::X86_64, &mem, layout::KERNEL_START).unwrap_err();
        assert!(matches!(err, Error::ImageTooLarge(_)));
    }
}
