use log::trace;
use memmem::{Searcher, TwoWaySearcher};

use crate::error::{Error, Result};
use crate::image::ByteImage;

/// A virtual-address view over a single `(base, size)` segment of an
/// image. All operations here take and return virtual addresses; offset
/// arithmetic into the underlying buffer is hidden.
#[derive(Clone, Copy, Debug)]
pub struct VMem<'a> {
    bytes: &'a [u8],
    base: u64,
}

impl<'a> VMem<'a> {
    pub fn new(image: &'a ByteImage<'a>) -> Self {
        VMem { bytes: image.bytes(), base: image.base() }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn end(&self) -> u64 {
        self.base + self.bytes.len() as u64
    }

    pub fn contains(&self, va: u64) -> bool {
        va >= self.base && va < self.end()
    }

    fn offset(&self, va: u64) -> Result<usize> {
        if !self.contains(va) {
            return Err(Error::OutOfBounds { va });
        }
        Ok((va - self.base) as usize)
    }

    /// Reads 8 little-endian bytes at `va`.
    pub fn deref(&self, va: u64) -> Result<u64> {
        let off = self.offset(va)?;
        let end = off.checked_add(8).ok_or(Error::OutOfBounds { va })?;
        let slice = self.bytes.get(off..end).ok_or(Error::OutOfBounds { va })?;
        Ok(u64::from_le_bytes(slice.try_into().unwrap()))
    }

    pub fn read_u8(&self, va: u64) -> Result<u8> {
        let off = self.offset(va)?;
        self.bytes.get(off).copied().ok_or(Error::OutOfBounds { va })
    }

    pub fn read_u32(&self, va: u64) -> Result<u32> {
        let off = self.offset(va)?;
        let end = off.checked_add(4).ok_or(Error::OutOfBounds { va })?;
        let slice = self.bytes.get(off..end).ok_or(Error::OutOfBounds { va })?;
        Ok(u32::from_le_bytes(slice.try_into().unwrap()))
    }

    /// Raw byte search, optionally starting the scan at `from_va`.
    /// Returns the virtual address of the first occurrence of `needle`.
    pub fn memmem(&self, needle: &[u8], from_va: Option<u64>) -> Result<u64> {
        let start_off = match from_va {
            Some(va) => self.offset(va)?,
            None => 0,
        };
        let haystack = &self.bytes[start_off..];
        let searcher = TwoWaySearcher::new(needle);
        let hit = searcher
            .search_in(haystack)
            .ok_or(Error::NotFound("memmem"))?;
        let va = self.base + (start_off + hit) as u64;
        trace!("memmem: found {} bytes at 0x{va:x}", needle.len());
        Ok(va)
    }

    /// Locates a NUL-terminated C string (the search pattern includes an
    /// implied trailing terminator, so it never matches a proper prefix
    /// of a longer string).
    pub fn memstr(&self, needle: &str) -> Result<u64> {
        let mut pattern = needle.as_bytes().to_vec();
        pattern.push(0);
        self.memmem(&pattern, None).map_err(|_| Error::NotFound("memstr"))
    }

    /// Like [`VMem::memstr`], but when `full_string` is set, only
    /// accepts a match whose preceding byte is `\0` — i.e. the string
    /// must start there, not merely be a suffix of a longer string.
    pub fn findstr(&self, needle: &str, full_string: bool) -> Result<u64> {
        if !full_string {
            return self.memstr(needle);
        }

        let mut pattern = needle.as_bytes().to_vec();
        pattern.push(0);
        let mut from = None;
        loop {
            let hit = self.memmem(&pattern, from).map_err(|_| Error::NotFound("findstr"))?;
            if hit == self.base {
                return Ok(hit);
            }
            let preceding = self.bytes[self.offset(hit)? - 1];
            if preceding == 0 {
                return Ok(hit);
            }
            from = Some(hit + 1);
        }
    }
}
