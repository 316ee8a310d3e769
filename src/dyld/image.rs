//! Image inventory and partial-image synthesis.
//!
//! Every image-table entry is resolved according to the cache's
//! [`FormatVersion`]: caches whose dylibs still live on disk resolve entries
//! to standalone paths (optionally parsed by a [`LibraryParser`]), while
//! caches that only embed their dylibs get a [`PartialImage`] synthesized
//! from the Mach-O header found inside the cache. Failures are recorded per
//! entry and never abort the enumeration.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::context::DyldContext;
use super::structs::{DyldCacheImageTextInfo, FormatVersion, VmProt};
use crate::error::{Error, Result};
use crate::macho::MachOContext;
use crate::util::format_version;

// =============================================================================
// Image Entry
// =============================================================================

/// Information about a dylib in the cache image table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Index in the images array
    pub index: usize,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Path of the dylib (e.g., "/usr/lib/libc.dylib")
    pub path: String,
    /// Modification time
    pub mod_time: u64,
    /// Inode
    pub inode: u64,
    /// File offset of the path string
    pub path_offset: u32,
}

impl ImageEntry {
    /// Returns the basename of the path.
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Returns true if the path matches the given filter.
    pub fn matches_filter(&self, filter: &str) -> bool {
        self.path.contains(filter) || self.basename().contains(filter)
    }
}

// =============================================================================
// Library Descriptors
// =============================================================================

/// Identity of a standalone library as reported by a [`LibraryParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryDescriptor {
    /// Install name from `LC_ID_DYLIB`
    pub identifier: String,
    /// Packed current version
    pub current_version: u32,
    /// Packed compatibility version
    pub compatibility_version: u32,
    /// UUID, if the image carries one
    pub uuid: Option<[u8; 16]>,
}

impl LibraryDescriptor {
    /// Returns the current version as a dotted string.
    pub fn current_version_string(&self) -> String {
        format_version(self.current_version)
    }
}

/// Parses standalone library files for caches whose dylibs live on disk.
pub trait LibraryParser: Send + Sync {
    /// Parses the library at `path` and returns its identity.
    fn parse_library(&self, path: &Path) -> Result<LibraryDescriptor>;
}

// =============================================================================
// Partial Image
// =============================================================================

/// A segment recovered from an embedded image's load commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSegment {
    /// Segment name
    pub name: String,
    /// Virtual address
    pub address: u64,
    /// Virtual size
    pub size: u64,
    /// Cache file offset of the segment start, if a mapping covers it
    pub file_offset: Option<u64>,
    /// Maximum protection
    pub max_prot: VmProt,
    /// Initial protection
    pub init_prot: VmProt,
}

/// A library descriptor synthesized from cache-internal structures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialImage {
    /// Index in the images array
    pub index: usize,
    /// Path from the image table
    pub path: String,
    /// Virtual address of the Mach-O header
    pub address: u64,
    /// Cache file offset of the Mach-O header
    pub file_offset: u64,
    /// Architecture name from the Mach-O header
    pub arch: &'static str,
    /// Mach-O file type
    pub filetype: u32,
    /// Install name (falls back to the image-table path)
    pub identifier: String,
    /// Packed current version (0 when the image has no `LC_ID_DYLIB`)
    pub current_version: u32,
    /// Packed compatibility version
    pub compatibility_version: u32,
    /// UUID from `LC_UUID` or the image text table
    pub uuid: Option<[u8; 16]>,
    /// Size of the text segment, when the text table records it
    pub text_size: Option<u64>,
    /// Segments in load-command order
    pub segments: Vec<PartialSegment>,
    /// Install names of dylib dependencies
    pub dependencies: Vec<String>,
}

impl PartialImage {
    /// Returns the current version as a dotted string.
    pub fn current_version_string(&self) -> String {
        format_version(self.current_version)
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&PartialSegment> {
        self.segments.iter().find(|s| s.name == name)
    }
}

// =============================================================================
// Inventory
// =============================================================================

/// How an image-table entry was resolved.
#[derive(Debug)]
pub enum Resolution {
    /// The image is a standalone file on disk.
    OnDisk {
        /// Resolved file path
        path: PathBuf,
        /// Identity, when a parser was supplied
        descriptor: Option<LibraryDescriptor>,
    },
    /// The image's descriptor was synthesized from the cache.
    Synthesized(PartialImage),
    /// The image could not be resolved.
    Unresolved(Error),
}

/// One image-table entry and its resolution status.
#[derive(Debug)]
pub struct InventoryEntry {
    /// The image-table entry
    pub image: ImageEntry,
    /// Resolution outcome
    pub resolution: Resolution,
}

impl InventoryEntry {
    /// Returns true unless the entry is unresolved.
    pub fn is_resolved(&self) -> bool {
        !matches!(self.resolution, Resolution::Unresolved(_))
    }

    /// Returns the packed current version, when known.
    pub fn current_version(&self) -> Option<u32> {
        match &self.resolution {
            Resolution::OnDisk {
                descriptor: Some(d),
                ..
            } => Some(d.current_version),
            Resolution::Synthesized(image) => Some(image.current_version),
            _ => None,
        }
    }

    /// Returns the resolution error, if any.
    pub fn error(&self) -> Option<&Error> {
        match &self.resolution {
            Resolution::Unresolved(err) => Some(err),
            _ => None,
        }
    }
}

/// Best-effort list of every image in the cache, in stored order.
#[derive(Debug)]
pub struct Inventory {
    /// Format the entries were resolved under
    pub format_version: FormatVersion,
    /// One entry per image-table entry
    pub entries: Vec<InventoryEntry>,
}

impl Inventory {
    /// Returns the number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the image table was empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns an iterator over all entries.
    pub fn iter(&self) -> impl Iterator<Item = &InventoryEntry> {
        self.entries.iter()
    }

    /// Returns the number of unresolved entries.
    pub fn unresolved_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_resolved()).count()
    }

    /// Returns an iterator over unresolved entries.
    pub fn unresolved(&self) -> impl Iterator<Item = &InventoryEntry> {
        self.entries.iter().filter(|e| !e.is_resolved())
    }

    /// Returns the first entry whose path matches `filter`.
    pub fn find(&self, filter: &str) -> Option<&InventoryEntry> {
        self.entries.iter().find(|e| e.image.matches_filter(filter))
    }
}

impl fmt::Display for Inventory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            let version = match entry.current_version() {
                Some(v) => format_version(v),
                None if entry.is_resolved() => "-".to_string(),
                None => "unresolved".to_string(),
            };
            writeln!(
                f,
                "{:4}: {:#x} ({}) {}",
                entry.image.index + 1,
                entry.image.address,
                version,
                entry.image.path
            )?;
        }
        Ok(())
    }
}

// =============================================================================
// Resolution
// =============================================================================

/// Knobs for resolving on-disk images.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    /// Root that image install paths are resolved against (e.g. a mounted
    /// system volume). Paths are used as-is when unset.
    pub root: Option<PathBuf>,
}

/// Resolves one image-table entry.
trait ImageResolver {
    fn resolve(&self, image: &ImageEntry) -> Result<Resolution>;
}

/// Resolver for caches whose dylibs are still present as standalone files.
struct OnDiskResolver<'a> {
    options: &'a ResolveOptions,
    parser: Option<&'a dyn LibraryParser>,
}

impl ImageResolver for OnDiskResolver<'_> {
    fn resolve(&self, image: &ImageEntry) -> Result<Resolution> {
        if image.path.is_empty() {
            return Err(Error::unresolvable(image.index, "image path is unreadable"));
        }

        let path = match &self.options.root {
            Some(root) => root.join(image.path.trim_start_matches('/')),
            None => PathBuf::from(&image.path),
        };

        let descriptor = match self.parser {
            Some(parser) => Some(
                parser
                    .parse_library(&path)
                    .map_err(|e| Error::unresolvable(image.index, e.to_string()))?,
            ),
            None => None,
        };

        Ok(Resolution::OnDisk { path, descriptor })
    }
}

/// Resolver that synthesizes descriptors from the embedded Mach-O headers.
struct EmbeddedResolver<'a> {
    ctx: &'a DyldContext,
    text_by_address: HashMap<u64, &'a DyldCacheImageTextInfo>,
}

impl<'a> EmbeddedResolver<'a> {
    fn new(ctx: &'a DyldContext) -> Self {
        let text_by_address = ctx
            .image_text_info()
            .iter()
            .map(|t| (t.load_address, t))
            .collect();
        Self {
            ctx,
            text_by_address,
        }
    }

    fn synthesize(&self, image: &ImageEntry) -> Result<PartialImage> {
        let ctx = self.ctx;
        let file_offset = ctx.translate(image.address)?;

        // The header and load commands must fit in the mapping holding the
        // image, and within the text segment when its size is known.
        let mapping = ctx
            .mapping_for_addr(image.address)
            .ok_or(Error::AddressOutOfRange {
                addr: image.address,
            })?;
        let mut window = mapping.address + mapping.size - image.address;
        let text = self.text_by_address.get(&image.address).copied();
        if let Some(text) = text {
            window = window.min(text.text_segment_size as u64);
        }
        let available = ctx.size().saturating_sub(file_offset);
        let data = ctx.slice_at(file_offset, window.min(available))?;

        let extent = MachOContext::commands_extent(data, file_offset)?;
        if extent > data.len() {
            return Err(Error::truncated(
                file_offset,
                extent as u64,
                data.len() as u64,
            ));
        }
        let macho = MachOContext::new(&data[..extent], file_offset)?;

        let segments = macho
            .segments()
            .map(|seg| PartialSegment {
                name: seg.name().to_string(),
                address: seg.command.vmaddr,
                size: seg.command.vmsize,
                file_offset: ctx.addr_to_offset(seg.command.vmaddr),
                max_prot: VmProt::from_bits_truncate(seg.command.maxprot),
                init_prot: VmProt::from_bits_truncate(seg.command.initprot),
            })
            .collect();

        let (identifier, current_version, compatibility_version) = match macho.dylib_id() {
            Some(id) => (id.name.clone(), id.current_version, id.compatibility_version),
            None => (image.path.clone(), 0, 0),
        };

        Ok(PartialImage {
            index: image.index,
            path: image.path.clone(),
            address: image.address,
            file_offset,
            arch: macho.header.arch_name(),
            filetype: macho.header.filetype,
            identifier,
            current_version,
            compatibility_version,
            uuid: macho.uuid().or_else(|| text.map(|t| t.uuid)),
            text_size: text.map(|t| t.text_segment_size as u64),
            segments,
            dependencies: macho.dependencies().map(str::to_string).collect(),
        })
    }
}

impl ImageResolver for EmbeddedResolver<'_> {
    fn resolve(&self, image: &ImageEntry) -> Result<Resolution> {
        self.synthesize(image)
            .map(Resolution::Synthesized)
            .map_err(|e| match e {
                Error::ImageUnresolvable { .. } => e,
                Error::AddressOutOfRange { addr } => Error::unresolvable(
                    image.index,
                    format!("address {addr:#x} has no backing mapping"),
                ),
                other => Error::unresolvable(image.index, other.to_string()),
            })
    }
}

impl Inventory {
    /// Resolves every image of `ctx`.
    ///
    /// The resolver is picked once from the cache's format version.
    pub(crate) fn build(
        ctx: &DyldContext,
        parser: Option<&dyn LibraryParser>,
        options: &ResolveOptions,
    ) -> Self {
        let format_version = ctx.format_version();
        let resolver: Box<dyn ImageResolver + '_> = match format_version {
            FormatVersion::DylibsOnDisk => Box::new(OnDiskResolver { options, parser }),
            FormatVersion::DylibsEmbeddedOnly => Box::new(EmbeddedResolver::new(ctx)),
        };

        let entries: Vec<InventoryEntry> = ctx
            .images()
            .iter()
            .map(|image| {
                let resolution = resolver.resolve(image).unwrap_or_else(|err| {
                    warn!(index = image.index, path = %image.path, %err, "image unresolved");
                    Resolution::Unresolved(err)
                });
                InventoryEntry {
                    image: image.clone(),
                    resolution,
                }
            })
            .collect();

        let inventory = Self {
            format_version,
            entries,
        };
        debug!(
            images = inventory.len(),
            unresolved = inventory.unresolved_count(),
            %format_version,
            "built image inventory"
        );
        inventory
    }
}
