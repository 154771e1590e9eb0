//! Guest image loading.
//!
//! The loader copies an ELF image into guest RAM, places the argv block
//! below it and computes the entry state every VCPU starts from.

pub mod argv;
pub mod elf;

pub use elf::LoadedImage;

use object::ReadRef;
use tracing::info;

use crate::arch::{Architecture, BootParams};
use crate::error::{Error, Result};
use crate::memory::{layout, GuestMemory};

/// Load `image` and `args` into guest memory and return the boot state.
pub fn load<'data, R, S>(image: R, args: &[S], arch: Architecture, memory: &GuestMemory) -> Result<BootParams>
where
    R: ReadRef<'data>,
    S: AsRef<str>,
{
    let ram = memory
        .find_region(layout::RAM_START)
        .ok_or(Error::InvalidGuestAddress(layout::RAM_START))?;
    let usable_end = ram.end() - arch.reserved_ram();
    let memory_size = usable_end - ram.guest_addr;

    let loaded = elf::load(image, arch, memory)?;
    if loaded.end > usable_end {
        return Err(Error::InvalidKernel(format!(
            "image ends at 0x{:x}, past usable RAM at 0x{:x}",
            loaded.end, usable_end
        )));
    }

    let (argc, argv) = argv::place(args, arch, memory, loaded.start)?;

    info!(
        entry = format_args!("0x{:x}", loaded.entry),
        bytes = loaded.loaded_bytes,
        mode = ?loaded.mode,
        argc,
        "kernel loaded"
    );

    Ok(BootParams {
        entry: loaded.entry,
        mode: loaded.mode,
        memory_size,
        argc,
        argv,
    })
}
