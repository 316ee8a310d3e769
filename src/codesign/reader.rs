//! Cursor over big-endian code-signing blobs.

use crate::error::{Error, Result};
use crate::util::{read_u32_be_at, read_u64_be_at, slice};

/// Sequential big-endian reader that reports failures at absolute file offsets.
pub(crate) struct BlobReader<'a> {
    data: &'a [u8],
    pos: usize,
    base: u64,
    what: &'static str,
}

impl<'a> BlobReader<'a> {
    /// Creates a reader over `data`, which starts at file offset `base`.
    pub fn new(data: &'a [u8], base: u64, what: &'static str) -> Self {
        Self {
            data,
            pos: 0,
            base,
            what,
        }
    }

    /// Returns the current position relative to the blob start.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn truncated(&self) -> Error {
        Error::malformed_signature(self.base + self.pos as u64, format!("truncated {}", self.what))
    }

    pub fn u8(&mut self) -> Result<u8> {
        let v = *self.data.get(self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 1;
        Ok(v)
    }

    pub fn u32(&mut self) -> Result<u32> {
        let v = read_u32_be_at(self.data, self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 4;
        Ok(v)
    }

    pub fn u64(&mut self) -> Result<u64> {
        let v = read_u64_be_at(self.data, self.pos).ok_or_else(|| self.truncated())?;
        self.pos += 8;
        Ok(v)
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let v = slice(self.data, self.pos, len).ok_or_else(|| self.truncated())?;
        self.pos += len;
        Ok(v)
    }

    /// Reads a length-prefixed item padded to a 4-byte boundary.
    pub fn data_item(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        let item = self.bytes(len)?;
        let padding = (4 - len % 4) % 4;
        self.bytes(padding)?;
        Ok(item)
    }
}
