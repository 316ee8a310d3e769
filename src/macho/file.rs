//! Standalone Mach-O files on disk.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;
use tracing::debug;
use zerocopy::FromBytes;

use super::constants::*;
use super::context::MachOContext;
use super::structs::{FatArch, FatArch64};
use crate::dyld::{LibraryDescriptor, LibraryParser};
use crate::error::{Error, Result};
use crate::util::read_u32_be_at;

/// Reads dylib identity from Mach-O files, thin or fat.
///
/// Fat files are resolved to their first slice.
#[derive(Debug, Clone, Copy, Default)]
pub struct MachOFileParser;

impl MachOFileParser {
    /// Creates a new parser.
    pub fn new() -> Self {
        Self
    }

    /// Parses the load commands of the image in `data`.
    pub fn parse_bytes(&self, data: &[u8]) -> Result<MachOContext> {
        let (offset, slice) = thin_slice(data)?;
        MachOContext::new(slice, offset)
    }
}

impl LibraryParser for MachOFileParser {
    fn parse_library(&self, path: &Path) -> Result<LibraryDescriptor> {
        let file = File::open(path).map_err(|e| Error::FileOpen {
            path: path.to_path_buf(),
            source: e,
        })?;
        // SAFETY: the file is opened read-only and only read through the map.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.to_path_buf(),
            source: e,
        })?;

        let ctx = self.parse_bytes(&mmap)?;
        let id = ctx.dylib_id().ok_or_else(|| {
            Error::invalid_macho(ctx.base_offset, "image has no LC_ID_DYLIB command")
        })?;
        debug!(path = %path.display(), identifier = %id.name, "parsed on-disk library");

        Ok(LibraryDescriptor {
            identifier: id.name.clone(),
            current_version: id.current_version,
            compatibility_version: id.compatibility_version,
            uuid: ctx.uuid(),
        })
    }
}

/// Returns the file offset and bytes of the first architecture slice.
fn thin_slice(data: &[u8]) -> Result<(u64, &[u8])> {
    let magic = read_u32_be_at(data, 0)
        .ok_or_else(|| Error::invalid_macho(0, "too small for a Mach-O header"))?;

    let (offset, size) = match magic {
        FAT_MAGIC => {
            let arch = data
                .get(8..)
                .and_then(|rest| FatArch::read_from_prefix(rest).ok())
                .ok_or_else(|| Error::invalid_macho(8, "truncated fat arch table"))?
                .0;
            (arch.offset(), arch.size())
        }
        FAT_MAGIC_64 => {
            let arch = data
                .get(8..)
                .and_then(|rest| FatArch64::read_from_prefix(rest).ok())
                .ok_or_else(|| Error::invalid_macho(8, "truncated fat arch table"))?
                .0;
            (arch.offset(), arch.size())
        }
        _ => return Ok((0, data)),
    };

    let slice = usize::try_from(offset)
        .ok()
        .zip(usize::try_from(size).ok())
        .and_then(|(start, len)| data.get(start..start.checked_add(len)?))
        .ok_or_else(|| {
            Error::invalid_macho(offset, format!("fat slice of {size:#x} bytes runs past end of file"))
        })?;
    Ok((offset, slice))
}
