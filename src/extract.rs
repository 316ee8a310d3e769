//! Locating shared cache files inside an unpacked firmware tree.
//!
//! Unpacking the firmware archive and mounting its disk image happen outside
//! this crate. [`DirectoryExtractor`] takes over from there: it walks the
//! mounted or unpacked tree, finds every `dyld_shared_cache_<arch>` file
//! (and optionally its sub-caches) and copies them to an output directory.

use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info};

use crate::dyld::DYLD_CACHE_MAGIC_PREFIX;
use crate::error::{Error, Result};

/// File name prefix of every cache file.
pub const CACHE_FILE_PREFIX: &str = "dyld_shared_cache_";

/// Directories, relative to a system volume root, that hold shared caches.
pub const KNOWN_CACHE_DIRS: &[&str] = &[
    "System/Library/Caches/com.apple.dyld",
    "System/Library/dyld",
    "System/Cryptexes/OS/System/Library/Caches/com.apple.dyld",
    "System/Cryptexes/OS/System/Library/dyld",
    "System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
];

/// Options for cache extraction.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Directory the caches are copied into
    pub output_dir: PathBuf,
    /// Also copy `.01`, `.symbols` and other sub-cache files
    pub include_subcaches: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("extracted"),
            include_subcaches: true,
        }
    }
}

/// A shared cache file found in a source tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheFile {
    /// Location in the source tree
    pub path: PathBuf,
    /// Architecture from the file name, e.g. "arm64e"
    pub arch: String,
    /// Whether this is a sub-cache (`.01`, `.symbols`, ...)
    pub is_subcache: bool,
}

impl CacheFile {
    /// Classifies a file name, returning `None` for anything that is not a cache.
    fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let rest = name.strip_prefix(CACHE_FILE_PREFIX)?;
        let (arch, suffix) = match rest.split_once('.') {
            Some((arch, suffix)) => (arch, Some(suffix)),
            None => (rest, None),
        };
        // Linker maps and other text side-files are not caches.
        if arch.is_empty() || matches!(suffix, Some("map") | Some("atlas")) {
            return None;
        }
        Some(Self {
            path: path.to_path_buf(),
            arch: arch.to_string(),
            is_subcache: suffix.is_some(),
        })
    }
}

/// Produces raw shared cache files from a firmware source.
pub trait CacheExtractor {
    /// Extracts every cache found in `source`, returning the written paths.
    fn extract(&self, source: &Path, options: &ExtractOptions) -> Result<Vec<PathBuf>>;
}

/// Extracts caches from an already unpacked or mounted directory tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryExtractor;

impl DirectoryExtractor {
    /// Creates a new extractor.
    pub fn new() -> Self {
        Self
    }

    /// Finds the cache files under `root`, sorted by path.
    ///
    /// Known cache directories are searched first; when none of them exist
    /// the whole tree is walked.
    pub fn discover(&self, root: &Path) -> Result<Vec<CacheFile>> {
        let failed = |reason: String| Error::ExtractionFailed {
            path: root.to_path_buf(),
            reason,
        };

        if root.is_file() {
            return CacheFile::from_path(root)
                .map(|c| vec![c])
                .ok_or_else(|| failed("not a dyld_shared_cache file".to_string()));
        }
        if !root.is_dir() {
            return Err(failed("source does not exist".to_string()));
        }

        let mut found = Vec::new();
        let known: Vec<PathBuf> = KNOWN_CACHE_DIRS
            .iter()
            .map(|dir| root.join(dir))
            .filter(|dir| dir.is_dir())
            .collect();
        if known.is_empty() {
            walk(root, &mut found).map_err(|e| failed(e.to_string()))?;
        } else {
            for dir in &known {
                debug!(dir = %dir.display(), "searching known cache directory");
                walk(dir, &mut found).map_err(|e| failed(e.to_string()))?;
            }
        }

        found.sort_by(|a, b| a.path.cmp(&b.path));
        found.dedup();
        Ok(found)
    }
}

impl CacheExtractor for DirectoryExtractor {
    fn extract(&self, source: &Path, options: &ExtractOptions) -> Result<Vec<PathBuf>> {
        let caches: Vec<CacheFile> = self
            .discover(source)?
            .into_iter()
            .filter(|c| options.include_subcaches || !c.is_subcache)
            .collect();
        if caches.is_empty() {
            return Err(Error::ExtractionFailed {
                path: source.to_path_buf(),
                reason: "no dyld_shared_cache found".to_string(),
            });
        }
        info!("Found {} cache file(s) in {}", caches.len(), source.display());

        fs::create_dir_all(&options.output_dir).map_err(|e| Error::FileWrite {
            path: options.output_dir.clone(),
            source: e,
        })?;

        caches
            .par_iter()
            .map(|cache| copy_cache(cache, &options.output_dir))
            .collect()
    }
}

/// Recursively collects cache files below `dir`, without following symlinks.
fn walk(dir: &Path, found: &mut Vec<CacheFile>) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            walk(&path, found)?;
        } else if file_type.is_file() {
            if let Some(cache) = CacheFile::from_path(&path) {
                found.push(cache);
            }
        }
    }
    Ok(())
}

fn copy_cache(cache: &CacheFile, output_dir: &Path) -> Result<PathBuf> {
    let failed = |reason: String| Error::ExtractionFailed {
        path: cache.path.clone(),
        reason,
    };

    // Main caches must carry the container magic; sub-caches are copied as-is.
    if !cache.is_subcache {
        let mut magic = [0u8; 4];
        let read = fs::File::open(&cache.path)
            .and_then(|mut f| std::io::Read::read_exact(&mut f, &mut magic));
        if read.is_err() || &magic != DYLD_CACHE_MAGIC_PREFIX {
            return Err(failed("file does not start with the dyld magic".to_string()));
        }
    }

    let Some(name) = cache.path.file_name() else {
        return Err(failed("path has no file name".to_string()));
    };
    let dest = output_dir.join(name);
    let bytes = fs::copy(&cache.path, &dest).map_err(|e| Error::FileWrite {
        path: dest.clone(),
        source: e,
    })?;
    info!("Extracted {} ({} bytes) to {}", cache.arch, bytes, dest.display());
    Ok(dest)
}
