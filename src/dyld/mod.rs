//! Dyld shared cache handling.
//!
//! This module provides types for parsing Apple's dyld shared cache, the
//! single container that packs the system's dylibs together on iOS and macOS.
//!
//! # Cache Structure
//!
//! A dyld shared cache consists of:
//! - A header with metadata about the cache
//! - Mappings that describe how regions of the cache map to virtual memory
//! - Image information for each dylib in the cache
//! - An optional per-image text table (UUID, load address, text size)
//! - An optional embedded code signature at the end of the file
//!
//! # Format Versions
//!
//! Older caches keep every dylib on disk as well, so image entries resolve to
//! standalone files. Newer caches only embed their dylibs; for those a
//! partial image descriptor is synthesized from the header found inside the
//! cache.

mod context;
mod image;
mod structs;

pub use context::*;
pub use image::*;
pub use structs::*;
