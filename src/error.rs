//! Error types for shared cache inspection.
//!
//! Every variant that describes corrupt input carries the offending offset or
//! address so an analyst can find the damage in the source file.

use std::path::PathBuf;

use thiserror::Error;

/// The main error type for cache and signature decoding.
#[derive(Error, Debug)]
pub enum Error {
    // ==================== I/O Errors ====================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to open file '{path}': {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to memory map file '{path}': {source}")]
    MemoryMap {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write output file '{path}': {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ==================== Container Errors ====================
    #[error("malformed container at offset {offset:#x}: {reason}")]
    MalformedContainer { offset: u64, reason: String },

    #[error("truncated container: range {offset:#x}+{length:#x} exceeds source size {available:#x}")]
    TruncatedContainer {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("address {addr:#x} not covered by any cache mapping")]
    AddressOutOfRange { addr: u64 },

    #[error("image {index} is unresolvable: {reason}")]
    ImageUnresolvable { index: usize, reason: String },

    // ==================== Mach-O Errors ====================
    #[error("invalid Mach-O at offset {offset:#x}: {reason}")]
    InvalidMachO { offset: u64, reason: String },

    // ==================== Signature Errors ====================
    #[error("malformed signature at offset {offset:#x}: {reason}")]
    MalformedSignature { offset: u64, reason: String },

    #[error("{kind} slot count mismatch in code directory at {offset:#x}: expected {expected}, found {actual}")]
    SlotCountMismatch {
        offset: u64,
        kind: &'static str,
        expected: u64,
        actual: u64,
    },

    // ==================== Collaborator Errors ====================
    #[error("extraction from '{path}' failed: {reason}")]
    ExtractionFailed { path: PathBuf, reason: String },
}

/// A specialized Result type for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Returns true if this error only affects a single image.
    ///
    /// Per-image errors are collected into the inventory instead of aborting
    /// enumeration of the remaining images.
    #[inline]
    pub fn is_per_image(&self) -> bool {
        matches!(
            self,
            Error::ImageUnresolvable { .. } | Error::AddressOutOfRange { .. }
        )
    }

    /// Creates a malformed container error.
    #[inline]
    pub fn malformed_container(offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedContainer {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates a truncated container error.
    #[inline]
    pub fn truncated(offset: u64, length: u64, available: u64) -> Self {
        Error::TruncatedContainer {
            offset,
            length,
            available,
        }
    }

    /// Creates a malformed signature error.
    #[inline]
    pub fn malformed_signature(offset: u64, reason: impl Into<String>) -> Self {
        Error::MalformedSignature {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an invalid Mach-O error.
    #[inline]
    pub fn invalid_macho(offset: u64, reason: impl Into<String>) -> Self {
        Error::InvalidMachO {
            offset,
            reason: reason.into(),
        }
    }

    /// Creates an image-unresolvable error.
    #[inline]
    pub fn unresolvable(index: usize, reason: impl Into<String>) -> Self {
        Error::ImageUnresolvable {
            index,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_carry_offsets() {
        let err = Error::truncated(0x1000, 0x20, 0x1008);
        assert_eq!(
            err.to_string(),
            "truncated container: range 0x1000+0x20 exceeds source size 0x1008"
        );

        let err = Error::malformed_signature(0x40, "bad magic");
        assert!(err.to_string().contains("0x40"));

        let err = Error::SlotCountMismatch {
            offset: 0x8014,
            kind: "code",
            expected: 3,
            actual: 2,
        };
        assert_eq!(
            err.to_string(),
            "code slot count mismatch in code directory at 0x8014: expected 3, found 2"
        );
    }

    #[test]
    fn test_per_image_classification() {
        assert!(Error::unresolvable(3, "no mapping").is_per_image());
        assert!(Error::AddressOutOfRange { addr: 0x1 }.is_per_image());
        assert!(!Error::malformed_container(0, "bad magic").is_per_image());
    }
}
