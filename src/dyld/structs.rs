//! Dyld shared cache binary structures.
//!
//! These structures match the on-disk format of Apple's dyld shared cache.
//! They are designed for zero-copy parsing using the `zerocopy` crate.

use std::fmt;
use std::mem::offset_of;

use bitflags::bitflags;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::util::uuid_to_string;

/// The magic string prefix for all dyld caches.
pub const DYLD_CACHE_MAGIC_PREFIX: &[u8; 4] = b"dyld";

/// Versioned magic prefixes that precede the architecture name.
pub const DYLD_CACHE_MAGIC_VERSIONS: [&str; 2] = ["dyld_v0", "dyld_v1"];

/// Architecture names that may follow the versioned magic prefix.
pub const KNOWN_ARCHITECTURES: &[&str] = &[
    "i386", "x86_64", "x86_64h", "armv5", "armv6", "armv7", "armv7f", "armv7s", "armv7k",
    "armv6m", "armv7m", "armv7em", "arm64", "arm64e", "arm64_32",
];

/// Bytes of the header that every cache version carries (through `images_count_old`).
pub const MIN_HEADER_SIZE: usize = offset_of!(DyldCacheHeader, dyld_base_address);

// =============================================================================
// Header Structures
// =============================================================================

/// The main dyld shared cache header.
///
/// This is a variable-length structure. The actual size is determined by
/// `mapping_offset` - fields beyond `mapping_offset` may not exist in older caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheHeader {
    /// Magic identifier, e.g., "dyld_v0    i386" or "dyld_v1   arm64e"
    pub magic: [u8; 16],
    /// File offset to first `DyldCacheMappingInfo`
    pub mapping_offset: u32,
    /// Number of mapping entries
    pub mapping_count: u32,
    /// Legacy: file offset to `DyldCacheImageInfo` array
    pub images_offset_old: u32,
    /// Legacy: number of images
    pub images_count_old: u32,
    /// Base address of dyld when cache was built
    pub dyld_base_address: u64,
    /// File offset of code signature
    pub code_signature_offset: u64,
    /// Size of code signature
    pub code_signature_size: u64,
    /// Legacy: slide info offset
    pub slide_info_offset_unused: u64,
    /// Legacy: slide info size
    pub slide_info_size_unused: u64,
    /// File offset of local symbols info
    pub local_symbols_offset: u64,
    /// Size of local symbols info
    pub local_symbols_size: u64,
    /// UUID of this cache
    pub uuid: [u8; 16],
    /// Cache type: 0=development, 1=production, 2=multi-cache
    pub cache_type: u64,
    /// Offset to branch pool addresses
    pub branch_pools_offset: u32,
    /// Number of branch pool addresses
    pub branch_pools_count: u32,
    /// Unslid address of dyld in cache (mach_header)
    pub dyld_in_cache_mh: u64,
    /// Unslid address of dyld entry point in cache
    pub dyld_in_cache_entry: u64,
    /// File offset to array of image text info
    pub images_text_offset: u64,
    /// Number of image text info entries
    pub images_text_count: u64,
    /// Address of patch info
    pub patch_info_addr: u64,
    /// Size of patch info
    pub patch_info_size: u64,
    /// Unused (other image group addr)
    pub other_image_group_addr_unused: u64,
    /// Unused (other image group size)
    pub other_image_group_size_unused: u64,
    /// Address of program closures
    pub prog_closures_addr: u64,
    /// Size of program closures
    pub prog_closures_size: u64,
    /// Address of program closures trie
    pub prog_closures_trie_addr: u64,
    /// Size of program closures trie
    pub prog_closures_trie_size: u64,
    /// Platform type
    pub platform: u32,
    /// Format version and flags (8 bits version, followed by bit flags)
    pub format_version_and_flags: u32,
    /// Address of shared region start
    pub shared_region_start: u64,
    /// Size of shared region
    pub shared_region_size: u64,
    /// Maximum allowed slide value
    pub max_slide: u64,
    /// Address of dylibs image array
    pub dylibs_image_array_addr: u64,
    /// Size of dylibs image array
    pub dylibs_image_array_size: u64,
    /// Address of dylibs trie
    pub dylibs_trie_addr: u64,
    /// Size of dylibs trie
    pub dylibs_trie_size: u64,
    /// Address of other image array
    pub other_image_array_addr: u64,
    /// Size of other image array
    pub other_image_array_size: u64,
    /// Address of other trie
    pub other_trie_addr: u64,
    /// Size of other trie
    pub other_trie_size: u64,
    /// File offset to extended mappings with slide info
    pub mapping_with_slide_offset: u32,
    /// Count of extended mappings
    pub mapping_with_slide_count: u32,
    /// Unused (dylibs PBL state array addr)
    pub dylibs_pbl_state_array_addr_unused: u64,
    /// Address of dylibs PBL set
    pub dylibs_pbl_set_addr: u64,
    /// Address of programs PBL set pool
    pub programs_pbl_set_pool_addr: u64,
    /// Size of programs PBL set pool
    pub programs_pbl_set_pool_size: u64,
    /// Address of program trie
    pub program_trie_addr: u64,
    /// Size of program trie
    pub program_trie_size: u32,
    /// OS version
    pub os_version: u32,
    /// Alternative platform (e.g., iOSMac on macOS)
    pub alt_platform: u32,
    /// Alternative OS version
    pub alt_os_version: u32,
    /// VM offset to Swift optimizations header
    pub swift_opts_offset: u64,
    /// Size of Swift optimizations header
    pub swift_opts_size: u64,
    /// File offset to first subcache entry
    pub sub_cache_array_offset: u32,
    /// Number of subcache entries
    pub sub_cache_array_count: u32,
    /// UUID of the .symbols subcache file
    pub symbol_file_uuid: [u8; 16],
    /// Address of Rosetta read-only region
    pub rosetta_read_only_addr: u64,
    /// Size of Rosetta read-only region
    pub rosetta_read_only_size: u64,
    /// Address of Rosetta read-write region
    pub rosetta_read_write_addr: u64,
    /// Size of Rosetta read-write region
    pub rosetta_read_write_size: u64,
    /// File offset to new image info array
    pub images_offset: u32,
    /// Number of images (new location)
    pub images_count: u32,
    /// Sub-cache type: 0=development, 1=production
    pub cache_sub_type: u32,
    /// Padding
    pub pad1: u32,
    /// VM offset to ObjC optimizations header
    pub objc_opts_offset: u64,
    /// Size of ObjC optimizations header
    pub objc_opts_size: u64,
    /// VM offset to cache atlas
    pub cache_atlas_offset: u64,
    /// Size of cache atlas
    pub cache_atlas_size: u64,
    /// VM offset to dynamic data header
    pub dynamic_data_offset: u64,
    /// Maximum size of dynamic data
    pub dynamic_data_max_size: u64,
}

impl DyldCacheHeader {
    /// Size of the full (newest) header layout.
    pub const SIZE: usize = std::mem::size_of::<Self>();

    /// Returns the architecture named by the magic, if it is a recognized one.
    pub fn architecture(&self) -> Option<&'static str> {
        let magic = std::str::from_utf8(&self.magic).ok()?;
        let rest = DYLD_CACHE_MAGIC_VERSIONS
            .iter()
            .find_map(|v| magic.strip_prefix(v))?;
        let arch = rest.trim_matches(|c| c == ' ' || c == '\0');
        KNOWN_ARCHITECTURES.iter().copied().find(|a| *a == arch)
    }

    /// Checks if a header field exists based on mapping_offset.
    pub fn contains_field(&self, field_offset: usize) -> bool {
        field_offset < self.mapping_offset as usize
    }

    /// Returns the cache layout variant.
    ///
    /// Headers too short to carry the format bitfield predate dylibs being
    /// removed from disk.
    pub fn format_version(&self) -> FormatVersion {
        if !self.contains_field(offset_of!(Self, format_version_and_flags)) {
            return FormatVersion::DylibsOnDisk;
        }
        if self.format_flags().contains(CacheFormatFlags::DYLIBS_EXPECTED_ON_DISK) {
            FormatVersion::DylibsOnDisk
        } else {
            FormatVersion::DylibsEmbeddedOnly
        }
    }

    /// Returns the 8-bit format revision from the format bitfield.
    pub fn format_revision(&self) -> u8 {
        if self.contains_field(offset_of!(Self, format_version_and_flags)) {
            (self.format_version_and_flags & 0xFF) as u8
        } else {
            0
        }
    }

    /// Returns the flag bits that follow the format revision.
    pub fn format_flags(&self) -> CacheFormatFlags {
        CacheFormatFlags::from_bits_truncate(self.format_version_and_flags)
    }

    /// Returns the platform the cache was built for.
    pub fn platform(&self) -> Platform {
        if self.contains_field(offset_of!(Self, platform)) {
            Platform::from(self.platform)
        } else {
            Platform::Unknown(0)
        }
    }

    /// Returns the packed OS version, when recorded.
    pub fn os_version(&self) -> Option<u32> {
        (self.contains_field(offset_of!(Self, os_version)) && self.os_version != 0)
            .then_some(self.os_version)
    }

    /// Returns true if this cache uses the extended mapping table.
    pub fn uses_extended_mappings(&self) -> bool {
        self.contains_field(offset_of!(Self, mapping_with_slide_offset))
            && self.mapping_with_slide_offset != 0
    }

    /// Returns true if this cache uses the new images location.
    pub fn uses_new_images_offset(&self) -> bool {
        self.contains_field(offset_of!(Self, images_offset)) && self.images_offset != 0
    }

    /// Returns the actual images offset (new or legacy location).
    pub fn actual_images_offset(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_offset as u64
        } else {
            self.images_offset_old as u64
        }
    }

    /// Returns the actual images count (new or legacy location).
    pub fn actual_images_count(&self) -> u64 {
        if self.uses_new_images_offset() {
            self.images_count as u64
        } else {
            self.images_count_old as u64
        }
    }

    /// Returns the image text table location, when the header carries one.
    pub fn images_text_table(&self) -> Option<(u64, u64)> {
        (self.contains_field(offset_of!(Self, images_text_count))
            && self.images_text_offset != 0
            && self.images_text_count != 0)
            .then_some((self.images_text_offset, self.images_text_count))
    }

    /// Returns the code signature file range, when the cache is signed.
    pub fn code_signature_range(&self) -> Option<(u64, u64)> {
        (self.code_signature_offset != 0 && self.code_signature_size != 0)
            .then_some((self.code_signature_offset, self.code_signature_size))
    }
}

bitflags! {
    /// Flag bits packed above the 8-bit format revision.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheFormatFlags: u32 {
        /// Dylibs are still present on disk as standalone files
        const DYLIBS_EXPECTED_ON_DISK = 1 << 8;
        /// Cache is for a simulator runtime
        const SIMULATOR = 1 << 9;
        /// Cache was built locally on the device
        const LOCALLY_BUILT = 1 << 10;
        /// Cache was built from chained fixups
        const BUILT_FROM_CHAINED_FIXUPS = 1 << 11;
    }
}

// =============================================================================
// Format Version
// =============================================================================

/// Where a cache's images keep their full headers.
///
/// Chosen once when the header is parsed; every per-image accessor dispatches
/// on this value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatVersion {
    /// Each image still exists as a standalone file at its install path.
    DylibsOnDisk,
    /// Images only exist inside the cache; descriptors must be synthesized.
    DylibsEmbeddedOnly,
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatVersion::DylibsOnDisk => f.write_str("dylibs on disk"),
            FormatVersion::DylibsEmbeddedOnly => f.write_str("dylibs embedded only"),
        }
    }
}

// =============================================================================
// Platform
// =============================================================================

/// Platform recorded in the cache header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Platform {
    MacOS,
    IOS,
    TvOS,
    WatchOS,
    BridgeOS,
    MacCatalyst,
    IOSSimulator,
    TvOSSimulator,
    WatchOSSimulator,
    DriverKit,
    VisionOS,
    VisionOSSimulator,
    Firmware,
    SepOS,
    Unknown(u32),
}

impl From<u32> for Platform {
    fn from(v: u32) -> Self {
        match v {
            1 => Platform::MacOS,
            2 => Platform::IOS,
            3 => Platform::TvOS,
            4 => Platform::WatchOS,
            5 => Platform::BridgeOS,
            6 => Platform::MacCatalyst,
            7 => Platform::IOSSimulator,
            8 => Platform::TvOSSimulator,
            9 => Platform::WatchOSSimulator,
            10 => Platform::DriverKit,
            11 => Platform::VisionOS,
            12 => Platform::VisionOSSimulator,
            13 => Platform::Firmware,
            14 => Platform::SepOS,
            other => Platform::Unknown(other),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::MacOS => "macOS",
            Platform::IOS => "iOS",
            Platform::TvOS => "tvOS",
            Platform::WatchOS => "watchOS",
            Platform::BridgeOS => "bridgeOS",
            Platform::MacCatalyst => "macCatalyst",
            Platform::IOSSimulator => "iOS Simulator",
            Platform::TvOSSimulator => "tvOS Simulator",
            Platform::WatchOSSimulator => "watchOS Simulator",
            Platform::DriverKit => "DriverKit",
            Platform::VisionOS => "visionOS",
            Platform::VisionOSSimulator => "visionOS Simulator",
            Platform::Firmware => "firmware",
            Platform::SepOS => "sepOS",
            Platform::Unknown(v) => return write!(f, "unknown ({v})"),
        };
        f.write_str(name)
    }
}

// =============================================================================
// Mapping Structures
// =============================================================================

/// Basic mapping entry (older caches without slide info per-mapping).
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

/// Extended mapping entry with per-mapping slide info.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheMappingAndSlideInfo {
    /// Virtual memory address
    pub address: u64,
    /// Size in bytes
    pub size: u64,
    /// File offset
    pub file_offset: u64,
    /// Slide info file offset
    pub slide_info_file_offset: u64,
    /// Slide info file size
    pub slide_info_file_size: u64,
    /// Flags
    pub flags: u64,
    /// Maximum memory protection
    pub max_prot: u32,
    /// Initial memory protection
    pub init_prot: u32,
}

bitflags! {
    /// Flags for extended mapping entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MappingFlags: u64 {
        /// Mapping contains authenticated pointers
        const AUTH_DATA = 1 << 0;
        /// Mapping contains dirty data
        const DIRTY_DATA = 1 << 1;
        /// Mapping contains const data
        const CONST_DATA = 1 << 2;
        /// Mapping is in TEXT region
        const TEXT_STUBS = 1 << 3;
    }
}

bitflags! {
    /// VM protection bits of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmProt: u32 {
        /// Readable
        const READ = 1;
        /// Writable
        const WRITE = 2;
        /// Executable
        const EXECUTE = 4;
    }
}

impl fmt::Display for VmProt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.contains(VmProt::READ) { "r" } else { "-" },
            if self.contains(VmProt::WRITE) { "w" } else { "-" },
            if self.contains(VmProt::EXECUTE) { "x" } else { "-" },
        )
    }
}

// =============================================================================
// Image Structures
// =============================================================================

/// Information about a dylib in the cache.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageInfo {
    /// Address of the Mach-O header
    pub address: u64,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// Offset to path string
    pub path_file_offset: u32,
    /// Padding
    pub pad: u32,
}

/// Text segment info for an image.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
pub struct DyldCacheImageTextInfo {
    /// UUID of the image
    pub uuid: [u8; 16],
    /// Load address of the image
    pub load_address: u64,
    /// Size of the text segment
    pub text_segment_size: u32,
    /// Offset to path string
    pub path_offset: u32,
}

// =============================================================================
// Display Implementations
// =============================================================================

impl fmt::Display for DyldCacheHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DyldCache {{ magic: {:?}, arch: {}, uuid: {} }}",
            crate::util::fixed_str(&self.magic),
            self.architecture().unwrap_or("unknown"),
            uuid_to_string(&self.uuid)
        )
    }
}
