//! CodeDirectory decoding and hash-slot model.

use std::fmt;

use tracing::debug;

use super::reader::BlobReader;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_cstr;

/// Offset of the `hashSize` byte within the directory header.
const HASH_SIZE_FIELD: u64 = 36;

// =============================================================================
// CDHash
// =============================================================================

/// Digest of a CodeDirectory's declared byte range.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CdHash(pub Vec<u8>);

impl CdHash {
    /// Returns the full digest.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the 20-byte form used by the kernel and trust caches.
    pub fn truncated(&self) -> &[u8] {
        &self.0[..self.0.len().min(20)]
    }
}

impl fmt::Display for CdHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

// =============================================================================
// Hash Slots
// =============================================================================

/// A negative-indexed hash slot with a fixed meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialSlot {
    /// Slot index (-1, -2, ...)
    pub index: i32,
    /// What the slot hashes
    pub kind: SlotType,
    /// Stored hash
    pub hash: Vec<u8>,
}

impl SpecialSlot {
    /// Returns true if the slot is unbound (all zero).
    pub fn is_empty(&self) -> bool {
        self.hash.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for SpecialSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "{:>6}: {} (Not Bound)", self.index, hex::encode(&self.hash))
        } else {
            write!(f, "{:>6}: {} ({})", self.index, hex::encode(&self.hash), self.kind)
        }
    }
}

/// Hash of one page of the signed range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSlot {
    /// Slot index
    pub index: u32,
    /// Offset of the page within the signed range
    pub page_offset: u64,
    /// Number of signed bytes in the page (the last page may be short)
    pub page_length: u64,
    /// Stored hash
    pub hash: Vec<u8>,
}

impl fmt::Display for CodeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:>6}: {} ({:#x}+{:#x})",
            self.index,
            hex::encode(&self.hash),
            self.page_offset,
            self.page_length
        )
    }
}

/// Executable segment description (version 0x20400+).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecSegment {
    /// File offset of the executable segment
    pub base: u64,
    /// Size of the executable segment
    pub limit: u64,
    /// Flags
    pub flags: ExecSegmentFlags,
}

// =============================================================================
// Code Directory
// =============================================================================

/// A decoded CodeDirectory blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeDirectory {
    /// File offset of the blob
    pub offset: u64,
    /// SuperBlob slot the directory was found in
    pub slot: SlotType,
    /// Declared blob length
    pub length: u32,
    /// Format version
    pub version: u32,
    /// Signing flags
    pub flags: CodeDirectoryFlags,
    /// Offset of slot zero, relative to the blob
    pub hash_offset: u32,
    /// Offset of the identifier string, relative to the blob
    pub ident_offset: u32,
    /// Declared special slot count
    pub n_special_slots: u32,
    /// Declared code slot count
    pub n_code_slots: u32,
    /// Limit of the signed range (`codeLimit64` when present)
    pub code_limit: u64,
    /// Size of each hash in bytes
    pub hash_size: u8,
    /// Hash algorithm
    pub hash_type: HashType,
    /// Platform identifier byte
    pub platform: u8,
    /// log2 of the page size (0 means a single unpaged slot)
    pub page_size_shift: u8,
    /// Scatter vector offset (version 0x20100+)
    pub scatter_offset: Option<u32>,
    /// Team identifier offset (version 0x20200+)
    pub team_offset: Option<u32>,
    /// Executable segment (version 0x20400+)
    pub exec_segment: Option<ExecSegment>,
    /// Hardened runtime version (version 0x20500+)
    pub runtime: Option<u32>,
    /// Pre-encryption hash offset (version 0x20500+)
    pub pre_encrypt_offset: Option<u32>,
    /// Signing identifier
    pub identifier: String,
    /// Team identifier, when present
    pub team_id: Option<String>,
    /// Digest over `[offset, offset + length)`
    pub cdhash: CdHash,
    /// Special slots, from -1 downwards
    pub special_slots: Vec<SpecialSlot>,
    /// Code slots, one per page
    pub code_slots: Vec<CodeSlot>,
}

impl CodeDirectory {
    /// Decodes a CodeDirectory.
    ///
    /// `data` starts at the blob and may extend past its declared length;
    /// `base` is the blob's file offset, used in error reports.
    pub fn parse(data: &[u8], base: u64, slot: SlotType) -> Result<Self> {
        let mut r = BlobReader::new(data, base, "code directory header");

        let magic = r.u32()?;
        if magic != CSMAGIC_CODEDIRECTORY {
            return Err(Error::malformed_signature(
                base,
                format!("bad code directory magic {magic:#010x}"),
            ));
        }
        let length = r.u32()?;
        if length as usize > data.len() {
            return Err(Error::malformed_signature(
                base,
                format!(
                    "code directory length {length:#x} exceeds available {:#x}",
                    data.len()
                ),
            ));
        }
        // Everything below is bounded by the declared length.
        let bytes = &data[..length as usize];
        let mut r = BlobReader::new(bytes, base, "code directory header");
        r.bytes(8)?;

        let version = r.u32()?;
        let flags = CodeDirectoryFlags::from_bits_retain(r.u32()?);
        let hash_offset = r.u32()?;
        let ident_offset = r.u32()?;
        let n_special_slots = r.u32()?;
        let n_code_slots = r.u32()?;
        let code_limit32 = r.u32()?;
        let hash_size = r.u8()?;
        let hash_type = HashType::from(r.u8()?);
        let platform = r.u8()?;
        let page_size_shift = r.u8()?;
        let _spare2 = r.u32()?;

        if let Some(expected) = hash_type.digest_len() {
            if hash_size as usize != expected {
                return Err(Error::malformed_signature(
                    base + HASH_SIZE_FIELD,
                    format!("hash size {hash_size} does not match {hash_type} ({expected} bytes)"),
                ));
            }
        }

        let scatter_offset = (version >= CS_SUPPORTSSCATTER).then(|| r.u32()).transpose()?;
        let team_offset = (version >= CS_SUPPORTSTEAMID).then(|| r.u32()).transpose()?;

        let mut code_limit = code_limit32 as u64;
        if version >= CS_SUPPORTSCODELIMIT64 {
            let _spare3 = r.u32()?;
            let code_limit64 = r.u64()?;
            if code_limit64 != 0 {
                code_limit = code_limit64;
            }
        }

        let exec_segment = if version >= CS_SUPPORTSEXECSEG {
            Some(ExecSegment {
                base: r.u64()?,
                limit: r.u64()?,
                flags: ExecSegmentFlags::from_bits_retain(r.u64()?),
            })
        } else {
            None
        };

        let (runtime, pre_encrypt_offset) = if version >= CS_SUPPORTSRUNTIME {
            (Some(r.u32()?), Some(r.u32()?))
        } else {
            (None, None)
        };

        let identifier = read_cstr(bytes, ident_offset as usize).ok_or_else(|| {
            Error::malformed_signature(
                base + ident_offset as u64,
                "identifier is out of bounds or unterminated",
            )
        })?;

        let team_id = match team_offset {
            Some(offset) if offset != 0 => Some(read_cstr(bytes, offset as usize).ok_or_else(
                || {
                    Error::malformed_signature(
                        base + offset as u64,
                        "team identifier is out of bounds or unterminated",
                    )
                },
            )?),
            _ => None,
        };

        let cdhash = hash_type.digest(bytes).map(CdHash).ok_or_else(|| {
            Error::malformed_signature(base, format!("unsupported hash type {hash_type}"))
        })?;

        let mut cd = Self {
            offset: base,
            slot,
            length,
            version,
            flags,
            hash_offset,
            ident_offset,
            n_special_slots,
            n_code_slots,
            code_limit,
            hash_size,
            hash_type,
            platform,
            page_size_shift,
            scatter_offset,
            team_offset,
            exec_segment,
            runtime,
            pre_encrypt_offset,
            identifier,
            team_id,
            cdhash,
            special_slots: Vec::new(),
            code_slots: Vec::new(),
        };
        cd.special_slots = cd.read_special_slots(bytes)?;
        cd.code_slots = cd.read_code_slots(bytes)?;

        debug!(
            identifier = %cd.identifier,
            version = format_args!("{:#x}", cd.version),
            code_slots = cd.code_slots.len(),
            special_slots = cd.special_slots.len(),
            "decoded code directory"
        );
        Ok(cd)
    }

    /// Returns the page size, or `None` for a single unpaged slot.
    pub fn page_size(&self) -> Option<u64> {
        match self.page_size_shift {
            0 => None,
            shift => 1u64.checked_shl(shift as u32),
        }
    }

    /// Returns the code slot count implied by `code_limit` and the page size.
    pub fn expected_code_slots(&self) -> u64 {
        if self.code_limit == 0 {
            return 0;
        }
        match self.page_size() {
            Some(page) => self.code_limit.div_ceil(page),
            None => 1,
        }
    }

    fn read_special_slots(&self, bytes: &[u8]) -> Result<Vec<SpecialSlot>> {
        let n = self.n_special_slots as u64;
        if n == 0 {
            return Ok(Vec::new());
        }
        let hash_size = self.hash_size as u64;
        // Special slots sit immediately before slot zero.
        let room = self.hash_offset as u64 / hash_size;
        if n > room {
            return Err(Error::SlotCountMismatch {
                offset: self.offset,
                kind: "special",
                expected: n,
                actual: room,
            });
        }

        (1..=n)
            .map(|i| {
                let start = self.hash_offset as u64 - i * hash_size;
                let hash = self.hash_at(bytes, start, hash_size)?;
                Ok(SpecialSlot {
                    index: -(i as i32),
                    kind: SlotType::from(i as u32),
                    hash,
                })
            })
            .collect()
    }

    fn read_code_slots(&self, bytes: &[u8]) -> Result<Vec<CodeSlot>> {
        if self.page_size_shift >= 64 {
            return Err(Error::malformed_signature(
                self.offset,
                format!("page size exponent {} is too large", self.page_size_shift),
            ));
        }
        let expected = self.expected_code_slots();
        if self.n_code_slots as u64 != expected {
            return Err(Error::SlotCountMismatch {
                offset: self.offset,
                kind: "code",
                expected,
                actual: self.n_code_slots as u64,
            });
        }
        if expected == 0 {
            return Ok(Vec::new());
        }

        let hash_size = self.hash_size as u64;
        let page = self.page_size().unwrap_or(self.code_limit);
        (0..self.n_code_slots)
            .map(|i| {
                let start = self.hash_offset as u64 + i as u64 * hash_size;
                let page_offset = i as u64 * page;
                Ok(CodeSlot {
                    index: i,
                    page_offset,
                    page_length: page.min(self.code_limit - page_offset),
                    hash: self.hash_at(bytes, start, hash_size)?,
                })
            })
            .collect()
    }

    fn hash_at(&self, bytes: &[u8], start: u64, len: u64) -> Result<Vec<u8>> {
        start
            .checked_add(len)
            .filter(|&end| end <= bytes.len() as u64)
            .map(|end| bytes[start as usize..end as usize].to_vec())
            .ok_or_else(|| {
                Error::malformed_signature(
                    self.offset + start,
                    format!("hash slot exceeds code directory length {:#x}", self.length),
                )
            })
    }
}

impl fmt::Display for CodeDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Code Directory ({} bytes)", self.length)?;
        writeln!(f, "\tVersion:     {:#x}", self.version)?;
        writeln!(f, "\tFlags:       {}", self.flags)?;
        writeln!(f, "\tCodeLimit:   {:#x}", self.code_limit)?;
        writeln!(
            f,
            "\tIdentifier:  {} (@{:#x})",
            self.identifier, self.ident_offset
        )?;
        writeln!(
            f,
            "\tTeamID:      {}",
            self.team_id.as_deref().unwrap_or("-")
        )?;
        writeln!(f, "\tCDHash:      {} (computed)", self.cdhash)?;
        writeln!(
            f,
            "\t# of hashes: {} code ({} pages) + {} special",
            self.n_code_slots,
            self.page_size().unwrap_or(self.code_limit),
            self.n_special_slots
        )?;
        write!(
            f,
            "\tHashes @{} size: {} Type: {}",
            self.hash_offset, self.hash_size, self.hash_type
        )
    }
}
