//! Dyld shared cache context and file handling.
//!
//! This module provides the main interface for working with a dyld shared
//! cache: opening the backing source, validating the header and mapping
//! table, and converting between virtual addresses and file offsets. Image
//! tables and the code signature are decoded lazily and cached for the
//! lifetime of the context.

use std::fmt;
use std::fs::File;
use std::mem::{offset_of, size_of};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::Mmap;
use tracing::{debug, warn};
use zerocopy::{FromBytes, FromZeros, IntoBytes};

use super::image::{ImageEntry, Inventory, LibraryParser, ResolveOptions};
use super::structs::*;
use crate::codesign::CodeSignature;
use crate::error::{Error, Result};
use crate::util::{fixed_str, format_size, format_version, read_cstr, read_u32_le_at, uuid_to_string};

// =============================================================================
// Mapping Entry
// =============================================================================

/// A unified mapping entry that works with both basic and extended mapping formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum protection
    pub max_prot: VmProt,
    /// Initial protection
    pub init_prot: VmProt,
    /// File offset to slide info (0 if none)
    pub slide_info_offset: u64,
    /// Size of slide info (0 if none)
    pub slide_info_size: u64,
    /// Mapping flags
    pub flags: MappingFlags,
}

impl MappingEntry {
    /// Creates a mapping entry from basic mapping info.
    pub fn from_basic(info: &DyldCacheMappingInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: VmProt::from_bits_truncate(info.max_prot),
            init_prot: VmProt::from_bits_truncate(info.init_prot),
            slide_info_offset: 0,
            slide_info_size: 0,
            flags: MappingFlags::empty(),
        }
    }

    /// Creates a mapping entry from extended mapping info.
    pub fn from_extended(info: &DyldCacheMappingAndSlideInfo) -> Self {
        Self {
            address: info.address,
            size: info.size,
            file_offset: info.file_offset,
            max_prot: VmProt::from_bits_truncate(info.max_prot),
            init_prot: VmProt::from_bits_truncate(info.init_prot),
            slide_info_offset: info.slide_info_file_offset,
            slide_info_size: info.slide_info_file_size,
            flags: MappingFlags::from_bits_truncate(info.flags),
        }
    }

    /// Returns the end of the virtual address range (exclusive).
    #[inline]
    pub fn end_addr(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Returns the end of the file range (exclusive).
    #[inline]
    pub fn end_offset(&self) -> u64 {
        self.file_offset.saturating_add(self.size)
    }

    /// Returns true if this mapping contains the given virtual address.
    #[inline]
    pub fn contains_addr(&self, addr: u64) -> bool {
        addr >= self.address && addr < self.end_addr()
    }

    /// Returns true if this mapping contains the given file offset.
    #[inline]
    pub fn contains_offset(&self, offset: u64) -> bool {
        offset >= self.file_offset && offset < self.end_offset()
    }

    /// Converts a virtual address to a file offset.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> u64 {
        self.file_offset + (addr - self.address)
    }

    /// Converts a file offset to a virtual address.
    #[inline]
    pub fn offset_to_addr(&self, offset: u64) -> u64 {
        self.address + (offset - self.file_offset)
    }

    /// Returns true if this mapping has slide info.
    #[inline]
    pub fn has_slide_info(&self) -> bool {
        self.slide_info_size > 0
    }
}

impl fmt::Display for MappingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}  {:#x} -> {:#x}  file {:#x} -> {:#x}  ({})",
            self.init_prot,
            self.max_prot,
            self.address,
            self.end_addr(),
            self.file_offset,
            self.end_offset(),
            format_size(self.size)
        )?;
        if self.has_slide_info() {
            write!(
                f,
                "  slide info {:#x} ({})",
                self.slide_info_offset,
                format_size(self.slide_info_size)
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Backing Source
// =============================================================================

/// The bytes a cache was opened from.
#[derive(Debug)]
enum Source {
    Mapped(Mmap),
    Memory(Vec<u8>),
}

impl Deref for Source {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Source::Mapped(mmap) => mmap,
            Source::Memory(buf) => buf,
        }
    }
}

// =============================================================================
// Signature Status
// =============================================================================

/// Result of a signature query.
#[derive(Debug, Clone, Copy)]
pub enum SignatureStatus<'a> {
    /// The cache carries no code signature region.
    Unsigned,
    /// The decoded code signature.
    Signed(&'a CodeSignature),
}

impl<'a> SignatureStatus<'a> {
    /// Returns the signature, if any.
    pub fn signature(self) -> Option<&'a CodeSignature> {
        match self {
            SignatureStatus::Signed(sig) => Some(sig),
            SignatureStatus::Unsigned => None,
        }
    }

    /// Returns true if the cache is signed.
    pub fn is_signed(self) -> bool {
        matches!(self, SignatureStatus::Signed(_))
    }
}

// =============================================================================
// Dyld Context
// =============================================================================

/// Main context for working with a dyld shared cache.
///
/// The header and mapping table are validated on open; everything else is
/// decoded on first use and cached. The context never mutates its source,
/// so it can be shared across threads by reference.
#[derive(Debug)]
pub struct DyldContext {
    source: Source,
    /// Path to the cache file, when opened from disk
    pub path: Option<PathBuf>,
    /// Parsed header (fields past `mapping_offset` are zero)
    pub header: DyldCacheHeader,
    /// All mappings, in stored order
    pub mappings: Vec<MappingEntry>,
    format_version: FormatVersion,
    images: OnceLock<Vec<ImageEntry>>,
    text_info: OnceLock<Vec<DyldCacheImageTextInfo>>,
    inventory: OnceLock<Inventory>,
    signature: OnceLock<Option<CodeSignature>>,
}

impl DyldContext {
    /// Opens a dyld shared cache from the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let file = File::open(&path).map_err(|e| Error::FileOpen {
            path: path.clone(),
            source: e,
        })?;

        // SAFETY: the mapping is read-only and the cache file is not expected
        // to change while it is being inspected.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| Error::MemoryMap {
            path: path.clone(),
            source: e,
        })?;

        debug!(path = %path.display(), size = mmap.len(), "mapped cache file");
        Self::from_source(Source::Mapped(mmap), Some(path))
    }

    /// Creates a context over an in-memory cache image.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_source(Source::Memory(data), None)
    }

    fn from_source(source: Source, path: Option<PathBuf>) -> Result<Self> {
        let header = Self::parse_header(&source)?;
        let mappings = Self::parse_mappings(&source, &header)?;
        let format_version = header.format_version();

        debug!(
            arch = header.architecture().unwrap_or("unknown"),
            mappings = mappings.len(),
            images = header.actual_images_count(),
            %format_version,
            "parsed cache header"
        );

        Ok(Self {
            source,
            path,
            header,
            mappings,
            format_version,
            images: OnceLock::new(),
            text_info: OnceLock::new(),
            inventory: OnceLock::new(),
            signature: OnceLock::new(),
        })
    }

    /// Parses and validates the cache header.
    ///
    /// Only the bytes before `mapping_offset` belong to the header; the rest
    /// of the in-memory structure is left zeroed so that
    /// [`DyldCacheHeader::contains_field`] describes what the cache carries.
    fn parse_header(data: &[u8]) -> Result<DyldCacheHeader> {
        let available = data.len() as u64;
        if data.len() < MIN_HEADER_SIZE {
            return Err(Error::truncated(0, MIN_HEADER_SIZE as u64, available));
        }

        if &data[..4] != DYLD_CACHE_MAGIC_PREFIX {
            return Err(Error::malformed_container(
                0,
                format!("bad magic {:02x?}", &data[..4]),
            ));
        }

        let mapping_offset = read_u32_le_at(data, offset_of!(DyldCacheHeader, mapping_offset))
            .map(|v| v as usize)
            .unwrap_or(0);
        if mapping_offset < MIN_HEADER_SIZE {
            return Err(Error::malformed_container(
                offset_of!(DyldCacheHeader, mapping_offset) as u64,
                format!("mapping offset {mapping_offset:#x} lies inside the header"),
            ));
        }

        let present = mapping_offset.min(DyldCacheHeader::SIZE).min(data.len());
        let mut header = DyldCacheHeader::new_zeroed();
        header.as_mut_bytes()[..present].copy_from_slice(&data[..present]);

        if header.architecture().is_none() {
            return Err(Error::malformed_container(
                0,
                format!("unrecognized magic {:?}", fixed_str(&header.magic)),
            ));
        }

        // Tables read lazily later must already be in bounds.
        let (mapping_table, mapping_count, mapping_size) = Self::mapping_table(&header);
        check_table(available, mapping_table, mapping_count, mapping_size)?;
        check_table(
            available,
            header.actual_images_offset(),
            header.actual_images_count(),
            size_of::<DyldCacheImageInfo>(),
        )?;
        if let Some((offset, count)) = header.images_text_table() {
            check_table(available, offset, count, size_of::<DyldCacheImageTextInfo>())?;
        }

        Ok(header)
    }

    /// Returns the location, count and entry size of the mapping table in use.
    fn mapping_table(header: &DyldCacheHeader) -> (u64, u64, usize) {
        if header.uses_extended_mappings() {
            (
                header.mapping_with_slide_offset as u64,
                header.mapping_with_slide_count as u64,
                size_of::<DyldCacheMappingAndSlideInfo>(),
            )
        } else {
            (
                header.mapping_offset as u64,
                header.mapping_count as u64,
                size_of::<DyldCacheMappingInfo>(),
            )
        }
    }

    /// Parses mapping entries and enforces the non-overlap invariant.
    fn parse_mappings(data: &[u8], header: &DyldCacheHeader) -> Result<Vec<MappingEntry>> {
        let (table, count, entry_size) = Self::mapping_table(header);
        let mut mappings = Vec::with_capacity(count as usize);

        for i in 0..count as usize {
            let entry_offset = table as usize + i * entry_size;
            let entry = &data[entry_offset..entry_offset + entry_size];
            let mapping = if header.uses_extended_mappings() {
                DyldCacheMappingAndSlideInfo::read_from_bytes(entry)
                    .map(|info| MappingEntry::from_extended(&info))
                    .map_err(|_| {
                        Error::malformed_container(entry_offset as u64, "unreadable mapping")
                    })?
            } else {
                DyldCacheMappingInfo::read_from_bytes(entry)
                    .map(|info| MappingEntry::from_basic(&info))
                    .map_err(|_| {
                        Error::malformed_container(entry_offset as u64, "unreadable mapping")
                    })?
            };

            if mapping.file_offset.checked_add(mapping.size).is_none()
                || mapping.address.checked_add(mapping.size).is_none()
            {
                return Err(Error::malformed_container(
                    entry_offset as u64,
                    format!("mapping {i} wraps the address space"),
                ));
            }
            if mapping.end_offset() > data.len() as u64 {
                return Err(Error::truncated(
                    mapping.file_offset,
                    mapping.size,
                    data.len() as u64,
                ));
            }
            mappings.push(mapping);
        }

        let entry_offset = |i: usize| table + (i * entry_size) as u64;
        let mut order: Vec<usize> = (0..mappings.len())
            .filter(|&i| mappings[i].size > 0)
            .collect();

        order.sort_by_key(|&i| mappings[i].address);
        for pair in order.windows(2) {
            let (a, b) = (&mappings[pair[0]], &mappings[pair[1]]);
            if a.end_addr() > b.address {
                return Err(Error::malformed_container(
                    entry_offset(pair[1]),
                    format!(
                        "mapping {} overlaps mapping {} in address space",
                        pair[1], pair[0]
                    ),
                ));
            }
        }

        order.sort_by_key(|&i| mappings[i].file_offset);
        for pair in order.windows(2) {
            let (a, b) = (&mappings[pair[0]], &mappings[pair[1]]);
            if a.end_offset() > b.file_offset {
                return Err(Error::malformed_container(
                    entry_offset(pair[1]),
                    format!(
                        "mapping {} overlaps mapping {} in file space",
                        pair[1], pair[0]
                    ),
                ));
            }
        }

        Ok(mappings)
    }

    // =========================================================================
    // Address Translation
    // =========================================================================

    /// Converts a virtual address to a file offset.
    ///
    /// Fails with [`Error::AddressOutOfRange`] when no mapping covers `addr`.
    pub fn translate(&self, addr: u64) -> Result<u64> {
        self.addr_to_offset(addr)
            .ok_or(Error::AddressOutOfRange { addr })
    }

    /// Converts a virtual address to a file offset.
    /// Uses binary search when mappings are stored in address order.
    #[inline]
    pub fn addr_to_offset(&self, addr: u64) -> Option<u64> {
        self.mapping_for_addr(addr).map(|m| m.addr_to_offset(addr))
    }

    /// Converts a file offset to a virtual address.
    #[inline]
    pub fn offset_to_addr(&self, offset: u64) -> Option<u64> {
        // Mappings aren't sorted by file offset, so linear scan is necessary
        self.mappings
            .iter()
            .find(|m| m.contains_offset(offset))
            .map(|m| m.offset_to_addr(offset))
    }

    /// Returns the mapping for a given virtual address.
    #[inline]
    pub fn mapping_for_addr(&self, addr: u64) -> Option<&MappingEntry> {
        let idx = self.mappings.partition_point(|m| m.end_addr() <= addr);
        if let Some(mapping) = self.mappings.get(idx) {
            if mapping.contains_addr(addr) {
                return Some(mapping);
            }
        }
        // Fallback to linear search for caches with unsorted mappings
        self.mappings.iter().find(|m| m.contains_addr(addr))
    }

    /// Returns `length` bytes at a file offset.
    ///
    /// Fails with [`Error::TruncatedContainer`] when the range exceeds the source.
    pub fn slice_at(&self, offset: u64, length: u64) -> Result<&[u8]> {
        let available = self.source.len() as u64;
        match offset.checked_add(length) {
            Some(end) if end <= available => Ok(&self.source[offset as usize..end as usize]),
            _ => Err(Error::truncated(offset, length, available)),
        }
    }

    /// Reads a NUL-terminated string at a file offset.
    pub fn read_string(&self, offset: u64) -> Option<String> {
        read_cstr(&self.source, usize::try_from(offset).ok()?)
    }

    /// Returns the size of the backing source in bytes.
    pub fn size(&self) -> u64 {
        self.source.len() as u64
    }

    /// Returns the raw bytes of the cache.
    pub fn data(&self) -> &[u8] {
        &self.source
    }

    // =========================================================================
    // Header Queries
    // =========================================================================

    /// Returns the format version selected when the header was parsed.
    pub fn format_version(&self) -> FormatVersion {
        self.format_version
    }

    /// Returns the architecture of this cache.
    pub fn architecture(&self) -> &'static str {
        // Validated in `parse_header`.
        self.header.architecture().unwrap_or("unknown")
    }

    /// Returns the cache UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.header.uuid
    }

    /// Returns the platform the cache was built for.
    pub fn platform(&self) -> Platform {
        self.header.platform()
    }

    // =========================================================================
    // Images
    // =========================================================================

    /// Returns the image table in stored order.
    pub fn images(&self) -> &[ImageEntry] {
        self.images.get_or_init(|| self.parse_images())
    }

    /// Parses the image list.
    fn parse_images(&self) -> Vec<ImageEntry> {
        let count = self.header.actual_images_count();
        let offset = self.header.actual_images_offset();
        let entry_size = size_of::<DyldCacheImageInfo>();
        let table = self
            .slice_at(offset, count * entry_size as u64)
            .unwrap_or_default();

        let mut images = Vec::with_capacity(count as usize);
        for (index, chunk) in table.chunks_exact(entry_size).enumerate() {
            let Ok(info) = DyldCacheImageInfo::read_from_bytes(chunk) else {
                continue;
            };

            let path = self
                .read_string(info.path_file_offset as u64)
                .unwrap_or_else(|| {
                    warn!(index, offset = info.path_file_offset, "unreadable image path");
                    String::new()
                });

            images.push(ImageEntry {
                index,
                address: info.address,
                path,
                mod_time: info.mod_time,
                inode: info.inode,
                path_offset: info.path_file_offset,
            });
        }

        debug!(count = images.len(), "parsed image table");
        images
    }

    /// Returns the image text table, empty when the header carries none.
    pub fn image_text_info(&self) -> &[DyldCacheImageTextInfo] {
        self.text_info.get_or_init(|| {
            let Some((offset, count)) = self.header.images_text_table() else {
                return Vec::new();
            };
            let entry_size = size_of::<DyldCacheImageTextInfo>();
            self.slice_at(offset, count * entry_size as u64)
                .unwrap_or_default()
                .chunks_exact(entry_size)
                .filter_map(|chunk| DyldCacheImageTextInfo::read_from_bytes(chunk).ok())
                .collect()
        })
    }

    /// Returns the resolved image inventory.
    ///
    /// On-disk images are resolved to their install paths without being
    /// opened; use [`DyldContext::inventory_with`] to parse them.
    pub fn inventory(&self) -> &Inventory {
        self.inventory
            .get_or_init(|| Inventory::build(self, None, &ResolveOptions::default()))
    }

    /// Resolves the image inventory with a library parser for on-disk images.
    pub fn inventory_with(
        &self,
        parser: &dyn LibraryParser,
        options: &ResolveOptions,
    ) -> Inventory {
        Inventory::build(self, Some(parser), options)
    }

    // =========================================================================
    // Code Signature
    // =========================================================================

    /// Returns the decoded code signature, or [`SignatureStatus::Unsigned`].
    ///
    /// Decoding failures only affect this query; the successful result is
    /// cached.
    pub fn code_signature(&self) -> Result<SignatureStatus<'_>> {
        if let Some(cached) = self.signature.get() {
            return Ok(Self::status(cached.as_ref()));
        }

        let decoded = match self.header.code_signature_range() {
            None => None,
            Some((offset, size)) => {
                let region = self.slice_at(offset, size)?;
                Some(CodeSignature::parse(region, offset)?)
            }
        };

        Ok(Self::status(self.signature.get_or_init(|| decoded).as_ref()))
    }

    fn status(signature: Option<&CodeSignature>) -> SignatureStatus<'_> {
        match signature {
            Some(sig) => SignatureStatus::Signed(sig),
            None => SignatureStatus::Unsigned,
        }
    }
}

/// Checks that a table of `count` entries at `offset` fits in the source.
fn check_table(available: u64, offset: u64, count: u64, entry_size: usize) -> Result<()> {
    let length = count.checked_mul(entry_size as u64).unwrap_or(u64::MAX);
    match offset.checked_add(length) {
        Some(end) if end <= available => Ok(()),
        _ => Err(Error::truncated(offset, length, available)),
    }
}

impl fmt::Display for DyldContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let header = &self.header;
        writeln!(f, "Magic          = {:?}", fixed_str(&header.magic))?;
        writeln!(f, "Architecture   = {}", self.architecture())?;
        writeln!(f, "UUID           = {}", uuid_to_string(&header.uuid))?;
        writeln!(f, "Platform       = {}", header.platform())?;
        if let Some(v) = header.os_version() {
            writeln!(f, "OS Version     = {}", format_version(v))?;
        }
        writeln!(
            f,
            "Format         = {} (revision {})",
            self.format_version,
            header.format_revision()
        )?;
        writeln!(f, "Images         = {}", header.actual_images_count())?;
        match header.code_signature_range() {
            Some((offset, size)) => writeln!(
                f,
                "Code Signature = {:#x} -> {:#x} ({})",
                offset,
                offset + size,
                format_size(size)
            )?,
            None => writeln!(f, "Code Signature = none")?,
        }
        writeln!(f)?;
        writeln!(f, "Mappings")?;
        writeln!(f, "========")?;
        for mapping in &self.mappings {
            writeln!(f, "{mapping}")?;
        }
        Ok(())
    }
}
