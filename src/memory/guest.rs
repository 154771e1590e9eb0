//! Guest memory regions backed by anonymous host mappings.

use crate::error::{Error, Result};
use tracing::debug;

/// A region of guest physical memory as registered with KVM.
#[derive(Debug, Clone)]
pub struct GuestMemoryRegion {
    /// KVM memory slot
    pub slot: u32,
    /// Guest physical address
    pub guest_addr: u64,
    /// Size in bytes
    pub size: u64,
    /// Host virtual address of the backing mapping
    pub host_addr: u64,
    /// Whether this region is read-only to the guest
    pub readonly: bool,
}

impl GuestMemoryRegion {
    /// Check if an address falls within this region.
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.guest_addr && addr - self.guest_addr < self.size
    }

    /// Check if `[addr, addr + len)` lies entirely within this region.
    pub fn contains_range(&self, addr: u64, len: u64) -> bool {
        self.contains(addr) && len <= self.size - (addr - self.guest_addr)
    }

    /// Get the offset of an address within this region.
    pub fn offset(&self, addr: u64) -> Option<u64> {
        if self.contains(addr) {
            Some(addr - self.guest_addr)
        } else {
            None
        }
    }

    /// One past the last guest physical address of the region.
    pub fn end(&self) -> u64 {
        self.guest_addr + self.size
    }

    fn overlaps(&self, guest_addr: u64, size: u64) -> bool {
        guest_addr < self.end() && self.guest_addr < guest_addr + size
    }
}

/// Anonymous shared mapping that backs one region.
struct Mapping {
    ptr: *mut u8,
    size: usize,
}

impl Mapping {
    fn new(size: usize, readonly: bool) -> Result<Self> {
        let prot = if readonly {
            libc::PROT_READ
        } else {
            libc::PROT_READ | libc::PROT_WRITE
        };
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                prot,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::MemoryAllocationFailed(format!(
                "mmap of {} bytes failed: {}",
                size,
                std::io::Error::last_os_error()
            )));
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
        })
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.size);
        }
    }
}

/// All guest physical memory of a machine.
///
/// Regions never overlap and slots are handed out in increasing order.
/// Access is by copy: callers pass guest physical addresses and byte
/// buffers, never raw pointers into the mapping.
pub struct GuestMemory {
    regions: Vec<(GuestMemoryRegion, Mapping)>,
    next_slot: u32,
}

// Safety: the mappings are owned by GuestMemory and live as long as it does.
// Concurrent guest-side access is the guest's business, as on real hardware.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    pub fn new() -> Self {
        Self {
            regions: Vec::new(),
            next_slot: 0,
        }
    }

    /// Map a zeroed region of `size` bytes at `guest_addr`.
    ///
    /// The region is only known to this manager; registering it with KVM is
    /// the caller's job.
    pub fn add_region(&mut self, guest_addr: u64, size: u64, readonly: bool) -> Result<&GuestMemoryRegion> {
        if size == 0 || size % super::PAGE_SIZE != 0 || guest_addr % super::PAGE_SIZE != 0 {
            return Err(Error::MemoryAllocationFailed(format!(
                "region 0x{:x} (+0x{:x}) is not page aligned",
                guest_addr, size
            )));
        }
        if guest_addr.checked_add(size).is_none()
            || self.regions.iter().any(|(r, _)| r.overlaps(guest_addr, size))
        {
            return Err(Error::RegionOverlap { guest_addr, size });
        }

        let mapping = Mapping::new(size as usize, readonly)?;
        let region = GuestMemoryRegion {
            slot: self.next_slot,
            guest_addr,
            size,
            host_addr: mapping.ptr as u64,
            readonly,
        };
        self.next_slot += 1;

        debug!(
            slot = region.slot,
            guest_addr = format_args!("0x{:x}", guest_addr),
            size = format_args!("0x{:x}", size),
            readonly,
            "mapped guest memory region"
        );

        self.regions.push((region, mapping));
        let last = self.regions.len() - 1;
        Ok(&self.regions[last].0)
    }

    /// Registered regions in slot order.
    pub fn regions(&self) -> impl Iterator<Item = &GuestMemoryRegion> {
        self.regions.iter().map(|(r, _)| r)
    }

    /// The region containing `addr`, if any.
    pub fn find_region(&self, addr: u64) -> Option<&GuestMemoryRegion> {
        self.regions().find(|r| r.contains(addr))
    }

    /// Resolve a guest physical range to a host pointer.
    fn host_ptr(&self, addr: u64, len: usize) -> Result<(*mut u8, &GuestMemoryRegion)> {
        let (region, mapping) = self
            .regions
            .iter()
            .find(|(r, _)| r.contains_range(addr, len as u64))
            .ok_or(Error::InvalidGuestAddress(addr))?;
        let offset = (addr - region.guest_addr) as usize;
        Ok((unsafe { mapping.ptr.add(offset) }, region))
    }

    /// Read bytes from a guest physical address.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let (ptr, _) = self.host_ptr(addr, buf.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Check that `[addr, addr + len)` lies in one writable region.
    pub fn check_writable(&self, addr: u64, len: usize) -> Result<()> {
        let (_, region) = self.host_ptr(addr, len)?;
        if region.readonly {
            return Err(Error::ReadOnlyAddress(addr));
        }
        Ok(())
    }

    /// Write bytes to a guest physical address.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let (ptr, region) = self.host_ptr(addr, data.len())?;
        if region.readonly {
            return Err(Error::ReadOnlyAddress(addr));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    /// Fill `len` bytes at a guest physical address with `byte`.
    pub fn fill(&self, addr: u64, len: u64, byte: u8) -> Result<()> {
        let (ptr, region) = self.host_ptr(addr, len as usize)?;
        if region.readonly {
            return Err(Error::ReadOnlyAddress(addr));
        }
        unsafe {
            std::ptr::write_bytes(ptr, byte, len as usize);
        }
        Ok(())
    }

    /// Read a value from a guest physical address.
    pub fn read_obj<T: Copy>(&self, addr: u64) -> Result<T> {
        let (ptr, _) = self.host_ptr(addr, std::mem::size_of::<T>())?;
        unsafe { Ok(std::ptr::read_unaligned(ptr as *const T)) }
    }

    /// Write a value to a guest physical address.
    pub fn write_obj<T: Copy>(&self, addr: u64, value: T) -> Result<()> {
        let (ptr, region) = self.host_ptr(addr, std::mem::size_of::<T>())?;
        if region.readonly {
            return Err(Error::ReadOnlyAddress(addr));
        }
        unsafe {
            std::ptr::write_unaligned(ptr as *mut T, value);
        }
        Ok(())
    }
}

impl Default for GuestMemory {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_contains() {
        let region = GuestMemoryRegion {
            slot: 0,
            guest_addr: 0x1000,
            size: 0x1000,
            host_addr: 0,
            readonly: false,
        };
        assert!(region.contains(0x1000));
        assert!(region.contains(0x1fff));
        assert!(!region.contains(0x2000));
        assert!(!region.contains(0xfff));
        assert!(region.contains_range(0x1800, 0x800));
        assert!(!region.contains_range(0x1800, 0x801));
        assert_eq!(region.offset(0x1234), Some(0x234));
        assert_eq!(region.offset(0x2000), None);
    }

    #[test]
    fn test_slots_increase() {
        let mut mem = GuestMemory::new();
        let a = mem.add_region(0x4000, 0x1000, true).unwrap().slot;
        let b = mem.add_region(0x10_0000, 0x10_0000, false).unwrap().slot;
        assert!(b > a);
        assert_eq!(mem.regions().count(), 2);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x10_0000, 0x10_0000, false).unwrap();
        let err = mem.add_region(0x1f_f000, 0x2000, false).unwrap_err();
        assert!(matches!(err, Error::RegionOverlap { .. }));
        let err = mem.add_region(0x8_0000, 0x20_0000, false).unwrap_err();
        assert!(matches!(err, Error::RegionOverlap { .. }));
        // Adjacent is fine.
        mem.add_region(0x20_0000, 0x1000, false).unwrap();
    }

    #[test]
    fn test_read_write() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x10_0000, 0x2000, false).unwrap();

        let data = b"Hello, guest!";
        mem.write(0x10_0ff8, data).unwrap();
        let mut buf = [0u8; 13];
        mem.read(0x10_0ff8, &mut buf).unwrap();
        assert_eq!(&buf, data);

        mem.write_obj(0x10_0000, 0xdead_beef_u32).unwrap();
        assert_eq!(mem.read_obj::<u32>(0x10_0000).unwrap(), 0xdead_beef);
    }

    #[test]
    fn test_out_of_range() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x10_0000, 0x1000, false).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(
            mem.read(0x10_0ff8, &mut buf),
            Err(Error::InvalidGuestAddress(0x10_0ff8))
        ));
        assert!(mem.write(0x20_0000, &buf).is_err());
    }

    #[test]
    fn test_check_writable() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x1000, 0x1000, false).unwrap();
        mem.add_region(0x4000, 0x1000, true).unwrap();

        assert!(mem.check_writable(0x1000, 0x1000).is_ok());
        assert!(matches!(mem.check_writable(0x1800, 0x1000), Err(Error::InvalidGuestAddress(_))));
        assert!(matches!(mem.check_writable(0x4000, 8), Err(Error::ReadOnlyAddress(0x4000))));
    }

    #[test]
    fn test_readonly_region() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x4000, 0x1000, true).unwrap();
        let mut buf = [0xffu8; 8];
        mem.read(0x4000, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 8]);
        assert!(matches!(mem.write(0x4000, &buf), Err(Error::ReadOnlyAddress(0x4000))));
    }

    #[test]
    fn test_fill() {
        let mut mem = GuestMemory::new();
        mem.add_region(0x10_0000, 0x1000, false).unwrap();
        mem.write(0x10_0000, &[1u8; 32]).unwrap();
        mem.fill(0x10_0008, 16, 0).unwrap();
        let mut buf = [0u8; 32];
        mem.read(0x10_0000, &mut buf).unwrap();
        assert_eq!(&buf[..8], &[1u8; 8]);
        assert_eq!(&buf[8..24], &[0u8; 16]);
        assert_eq!(&buf[24..], &[1u8; 8]);
    }
}
