//! ELF image placement.

use object::{BinaryFormat, Object, ObjectSegment, ReadRef};
use tracing::debug;

use crate::arch::{Architecture, CpuMode};
use crate::error::{Error, Result};
use crate::memory::GuestMemory;

/// Information about a loaded image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedImage {
    /// Entry point from the ELF header
    pub entry: u64,
    /// Mode implied by the ELF class
    pub mode: CpuMode,
    /// Lowest physical address of any segment
    pub start: u64,
    /// One past the highest physical address of any segment
    pub end: u64,
    /// Bytes copied from the file (BSS excluded)
    pub loaded_bytes: u64,
}

fn cpu_mode(arch: Architecture, machine: object::Architecture) -> Result<CpuMode> {
    match (arch, machine) {
        (Architecture::X86_64, object::Architecture::X86_64) => Ok(CpuMode::Long64),
        (Architecture::X86_64, object::Architecture::I386) => Ok(CpuMode::Protected32),
        (Architecture::Arm64, object::Architecture::Aarch64) => Ok(CpuMode::Long64),
        (arch, other) => Err(Error::InvalidKernel(format!(
            "{:?} image cannot run on an {} guest",
            other, arch
        ))),
    }
}

/// Copy every `PT_LOAD` segment of `image` into guest memory.
///
/// Segments go to their virtual address, mapped through the architecture's
/// kernel-to-physical convention; the tail up to `p_memsz` is zeroed.
pub fn load<'data, R: ReadRef<'data>>(image: R, arch: Architecture, memory: &GuestMemory) -> Result<LoadedImage> {
    let file = object::File::parse(image).map_err(|e| Error::InvalidKernel(e.to_string()))?;
    if file.format() != BinaryFormat::Elf {
        return Err(Error::InvalidKernel(format!("{:?} is not ELF", file.format())));
    }
    let mode = cpu_mode(arch, file.architecture())?;

    let mut start = u64::MAX;
    let mut end = 0u64;
    let mut loaded_bytes = 0u64;

    for (index, segment) in file.segments().enumerate() {
        let data = segment
            .data()
            .map_err(|e| Error::InvalidKernel(format!("segment {}: {}", index, e)))?;
        let memsz = segment.size();
        let filesz = data.len() as u64;
        if filesz > memsz {
            return Err(Error::InvalidKernel(format!(
                "segment {}: file size 0x{:x} exceeds memory size 0x{:x}",
                index, filesz, memsz
            )));
        }
        if memsz == 0 {
            continue;
        }

        let pa = arch.kernel_to_physical(segment.address());
        let outside = |_| {
            Error::InvalidKernel(format!(
                "segment {} at 0x{:x} (+0x{:x}) is outside guest RAM",
                index, pa, memsz
            ))
        };
        memory.write(pa, data).map_err(outside)?;
        if memsz > filesz {
            memory.fill(pa + filesz, memsz - filesz, 0).map_err(outside)?;
        }

        debug!(
            index,
            vaddr = format_args!("0x{:x}", segment.address()),
            paddr = format_args!("0x{:x}", pa),
            filesz,
            memsz,
            "loaded segment"
        );

        start = start.min(pa);
        end = end.max(pa + memsz);
        loaded_bytes += filesz;
    }

    if loaded_bytes == 0 {
        return Err(Error::EmptyKernel);
    }

    Ok(LoadedImage {
        entry: file.entry(),
        mode,
        start,
        end,
        loaded_bytes,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory::layout;

    /// (virtual address, file bytes, memory size)
    pub(crate) type Segment<'a> = (u64, &'a [u8], u64);

    /// Minimal little-endian ELF64 executable with one PT_LOAD per segment.
    pub(crate) fn elf64(machine: u16, entry: u64, segments: &[Segment<'_>]) -> Vec<u8> {
        let phoff = 64u64;
        let mut data_off = phoff + 56 * segments.len() as u64;

        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 2, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        out.extend_from_slice(&machine.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&phoff.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        out.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&56u16.to_le_bytes());
        out.extend_from_slice(&(segments.len() as u16).to_le_bytes());
        out.extend_from_slice(&64u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        for (vaddr, bytes, memsz) in segments {
            out.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
            out.extend_from_slice(&7u32.to_le_bytes()); // RWX
            out.extend_from_slice(&data_off.to_le_bytes());
            out.extend_from_slice(&vaddr.to_le_bytes());
            out.extend_from_slice(&vaddr.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            out.extend_from_slice(&memsz.to_le_bytes());
            out.extend_from_slice(&0x1000u64.to_le_bytes());
            data_off += bytes.len() as u64;
        }
        for (_, bytes, _) in segments {
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Minimal ELF32 i386 executable with a single PT_LOAD.
    fn elf32(entry: u32, vaddr: u32, bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F', 1, 1, 1, 0]);
        out.extend_from_slice(&[0u8; 8]);
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&3u16.to_le_bytes()); // EM_386
        out.extend_from_slice(&1u32.to_le_bytes());
        out.extend_from_slice(&entry.to_le_bytes());
        out.extend_from_slice(&52u32.to_le_bytes()); // e_phoff
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&52u16.to_le_bytes());
        out.extend_from_slice(&32u16.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes());
        out.extend_from_slice(&40u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());

        let len = bytes.len() as u32;
        for field in [1u32, 84, vaddr, vaddr, len, len, 7, 0x1000] {
            out.extend_from_slice(&field.to_le_bytes());
        }
        out.extend_from_slice(bytes);
        out
    }

    pub(crate) const EM_X86_64: u16 = 0x3e;
    const EM_AARCH64: u16 = 0xb7;

    pub(crate) fn ram() -> GuestMemory {
        let mut mem = GuestMemory::new();
        mem.add_region(layout::RAM_START, 4 << 20, false).unwrap();
        mem
    }

    #[test]
    fn test_load_segments_and_bss() {
        let mem = ram();
        mem.write(layout::KERNEL_START + 4, &[0xaa; 12]).unwrap();

        let code = [0x90u8, 0x90, 0xf4, 0x00];
        let image = elf64(
            EM_X86_64,
            layout::KERNEL_START + 1,
            &[(layout::KERNEL_START, &code, 0x10), (layout::KERNEL_START + 0x1000, b"data", 4)],
        );
        let loaded = load(image.as_slice(), Architecture::X86_64, &mem).unwrap();

        assert_eq!(loaded.entry, layout::KERNEL_START + 1);
        assert_eq!(loaded.mode, CpuMode::Long64);
        assert_eq!(loaded.start, layout::KERNEL_START);
        assert_eq!(loaded.end, layout::KERNEL_START + 0x1004);
        assert_eq!(loaded.loaded_bytes, 8);

        let mut buf = [0xffu8; 16];
        mem.read(layout::KERNEL_START, &mut buf).unwrap();
        assert_eq!(&buf[..4], &code);
        assert_eq!(&buf[4..], &[0u8; 12]);

        let mut data = [0u8; 4];
        mem.read(layout::KERNEL_START + 0x1000, &mut data).unwrap();
        assert_eq!(&data, b"data");
    }

    #[test]
    fn test_empty_kernel() {
        let mem = ram();
        let image = elf64(EM_X86_64, layout::KERNEL_START, &[(layout::KERNEL_START, &[], 0x1000)]);
        assert!(matches!(
            load(image.as_slice(), Architecture::X86_64, &mem),
            Err(Error::EmptyKernel)
        ));
    }

    #[test]
    fn test_elf32_protected_mode() {
        let mem = ram();
        let start = layout::KERNEL_START as u32;
        let image = elf32(start, start, &[0xf4]);
        let loaded = load(image.as_slice(), Architecture::X86_64, &mem).unwrap();
        assert_eq!(loaded.mode, CpuMode::Protected32);
        assert_eq!(loaded.entry, layout::KERNEL_START);
    }

    #[test]
    fn test_higher_half_segment() {
        let mem = ram();
        let vaddr = 0xffff_ffc0_0000_0000 + layout::KERNEL_START;
        let image = elf64(EM_AARCH64, vaddr, &[(vaddr, &[1, 2, 3, 4], 4)]);
        let loaded = load(image.as_slice(), Architecture::Arm64, &mem).unwrap();
        assert_eq!(loaded.start, layout::KERNEL_START);
        assert_eq!(loaded.entry, vaddr);
        assert_eq!(mem.read_obj::<u32>(layout::KERNEL_START).unwrap(), 0x0403_0201);
    }

    #[test]
    fn test_wrong_machine() {
        let mem = ram();
        let image = elf64(EM_AARCH64, layout::KERNEL_START, &[(layout::KERNEL_START, &[0], 1)]);
        assert!(matches!(
            load(image.as_slice(), Architecture::X86_64, &mem),
            Err(Error::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_segment_outside_ram() {
        let mem = ram();
        let image = elf64(EM_X86_64, 0x1000, &[(0x1000, &[0xf4], 1)]);
        assert!(matches!(
            load(image.as_slice(), Architecture::X86_64, &mem),
            Err(Error::InvalidKernel(_))
        ));
    }

    #[test]
    fn test_not_elf() {
        let mem = ram();
        assert!(matches!(
            load(&b"definitely not an image"[..], Architecture::X86_64, &mem),
            Err(Error::InvalidKernel(_))
        ));
    }
}
