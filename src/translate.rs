//! Guest virtual address translation.
//!
//! Guest pointers handed to hypercalls are virtual addresses. They are
//! resolved one page at a time on every access; results are never cached
//! because the guest may change its page tables between calls.

use crate::error::{Error, Result};
use crate::memory::{GuestMemory, PAGE_SIZE};

/// Result of translating one guest virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub virtual_address: u64,
    pub physical_address: u64,
    pub valid: bool,
    pub writable: bool,
    pub usermode: bool,
}

/// Something that can translate guest virtual addresses.
pub trait Translator {
    fn translate(&self, gva: u64) -> Result<Translation>;
}

/// Identity mapping, for guests that run without paging.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl Translator for IdentityTranslator {
    fn translate(&self, gva: u64) -> Result<Translation> {
        Ok(Translation {
            virtual_address: gva,
            physical_address: gva,
            valid: true,
            writable: true,
            usermode: false,
        })
    }
}

/// Split `[gva, gva + len)` at page boundaries.
///
/// Yields `(address, offset into the buffer, chunk length)`.
pub fn page_chunks(gva: u64, len: usize) -> impl Iterator<Item = (u64, usize, usize)> {
    let mut offset = 0usize;
    std::iter::from_fn(move || {
        if offset >= len {
            return None;
        }
        let addr = gva.wrapping_add(offset as u64);
        let room = (PAGE_SIZE - (addr & (PAGE_SIZE - 1))) as usize;
        let chunk = room.min(len - offset);
        let item = (addr, offset, chunk);
        offset += chunk;
        Some(item)
    })
}

/// Guest memory as seen through a VCPU's current address space.
pub struct GuestView<'a> {
    memory: &'a GuestMemory,
    translator: &'a dyn Translator,
}

impl<'a> GuestView<'a> {
    pub fn new(memory: &'a GuestMemory, translator: &'a dyn Translator) -> Self {
        Self { memory, translator }
    }

    fn resolve(&self, gva: u64) -> Result<u64> {
        let t = self.translator.translate(gva)?;
        if !t.valid {
            return Err(Error::TranslationFailed(gva));
        }
        Ok(t.physical_address)
    }

    /// Copy guest memory at virtual address `gva` into `buf`.
    pub fn read(&self, gva: u64, buf: &mut [u8]) -> Result<()> {
        for (addr, offset, len) in page_chunks(gva, buf.len()) {
            let gpa = self.resolve(addr)?;
            self.memory.read(gpa, &mut buf[offset..offset + len])?;
        }
        Ok(())
    }

    /// Resolve every page of `[gva, gva + len)` and check it is writable.
    fn write_targets(&self, gva: u64, len: usize) -> Result<Vec<(u64, usize, usize)>> {
        let mut targets = Vec::new();
        for (addr, offset, len) in page_chunks(gva, len) {
            let gpa = self.resolve(addr)?;
            self.memory.check_writable(gpa, len)?;
            targets.push((gpa, offset, len));
        }
        Ok(targets)
    }

    /// Fail unless `len` bytes at `gva` could be written.
    pub fn check_writable(&self, gva: u64, len: usize) -> Result<()> {
        self.write_targets(gva, len).map(|_| ())
    }

    /// Copy `data` into guest memory at virtual address `gva`.
    ///
    /// Nothing is written unless every page of the range is writable.
    pub fn write(&self, gva: u64, data: &[u8]) -> Result<()> {
        for (gpa, offset, len) in self.write_targets(gva, data.len())? {
            self.memory.write(gpa, &data[offset..offset + len])?;
        }
        Ok(())
    }

    /// Read a NUL-terminated string of at most `max` bytes, without the NUL.
    pub fn read_cstr(&self, gva: u64, max: usize) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for (addr, _, len) in page_chunks(gva, max) {
            let mut chunk = vec![0u8; len];
            self.memory.read(self.resolve(addr)?, &mut chunk)?;
            if let Some(nul) = chunk.iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return Ok(out);
            }
            out.extend_from_slice(&chunk);
        }
        Err(Error::InvalidGuestAddress(gva))
    }
}
