//! dsc-inspect - dyld shared cache and code signature inspection.
//!
//! This library opens Apple's dyld shared cache, lists the images it packs,
//! and decodes the embedded code signature for offline analysis.
//!
//! # Features
//!
//! - Memory-mapped or in-memory cache sources
//! - Header, mapping table and address translation with bounds checking
//! - Image inventory for both on-disk and embedded-only cache layouts
//! - Partial image descriptors synthesized from embedded Mach-O headers
//! - SuperBlob, CodeDirectory and requirement decoding with CDHash
//! - Certificate summaries from the CMS signature
//!
//! # Example
//!
//! ```no_run
//! use dsc_inspect::{DyldContext, SignatureStatus};
//!
//! fn main() -> dsc_inspect::Result<()> {
//!     let cache = DyldContext::open("/path/to/dyld_shared_cache_arm64e")?;
//!
//!     for entry in cache.inventory().iter() {
//!         println!("{:#x} {}", entry.image.address, entry.image.path);
//!     }
//!
//!     if let SignatureStatus::Signed(sig) = cache.code_signature()? {
//!         for cd in &sig.code_directories {
//!             println!("{} cdhash={}", cd.identifier, cd.cdhash);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codesign;
pub mod dyld;
pub mod error;
pub mod extract;
pub mod macho;
pub mod util;

#[cfg(test)]
mod testutil;

// Re-export main types
pub use codesign::{CertificateSummary, CodeDirectory, CodeSignature};
pub use dyld::{
    DyldContext, FormatVersion, ImageEntry, Inventory, LibraryParser, MappingEntry, PartialImage,
    Resolution, SignatureStatus,
};
pub use error::{Error, Result};
pub use extract::{CacheExtractor, DirectoryExtractor, ExtractOptions};
pub use macho::{MachOContext, MachOFileParser};
