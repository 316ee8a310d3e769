//! Embedded signature SuperBlob decoding.
//!
//! A SuperBlob is a header (magic, total length, count) followed by `count`
//! index entries of `(slot type, offset)`. Each offset points at a blob that
//! starts with its own magic and length. Offsets are relative to the start
//! of the SuperBlob.

use std::fmt;

use tracing::{debug, warn};

use super::cms::{parse_certificates, CertificateSummary};
use super::directory::CodeDirectory;
use super::reader::BlobReader;
use super::requirement::{parse_requirement_set, Requirement};
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::read_u32_be_at;

/// SuperBlob header size (magic, length, count).
const SUPERBLOB_HEADER_SIZE: usize = 12;

/// Size of one index entry (type, offset).
const BLOB_INDEX_SIZE: usize = 8;

/// One entry of the SuperBlob index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobIndex {
    /// Slot type
    pub slot: SlotType,
    /// File offset of the blob
    pub offset: u64,
    /// Magic of the blob
    pub magic: u32,
    /// Declared length of the blob
    pub length: u32,
}

impl fmt::Display for BlobIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (magic: {:#010x}", self.slot, self.magic)?;
        if let Some(name) = magic_name(self.magic) {
            write!(f, " {name}")?;
        }
        write!(f, ", @{:#x}, {} bytes)", self.offset, self.length)
    }
}

/// A decoded code signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodeSignature {
    /// File offset of the SuperBlob
    pub offset: u64,
    /// Declared SuperBlob length
    pub length: u32,
    /// Every index entry, in stored order
    pub blobs: Vec<BlobIndex>,
    /// Primary and alternate CodeDirectories, in stored order
    pub code_directories: Vec<CodeDirectory>,
    /// Requirements from the requirement set
    pub requirements: Vec<Requirement>,
    /// Raw CMS envelope (empty when absent)
    pub cms: Vec<u8>,
    /// Certificates from the CMS envelope
    pub certificates: Vec<CertificateSummary>,
    /// XML entitlements, when present
    pub entitlements: Option<String>,
}

impl CodeSignature {
    /// Decodes an embedded-signature SuperBlob.
    ///
    /// `data` is the signature region and `base` its file offset. Unknown
    /// slots are recorded in [`CodeSignature::blobs`] and otherwise skipped.
    pub fn parse(data: &[u8], base: u64) -> Result<Self> {
        let mut r = BlobReader::new(data, base, "superblob header");
        let magic = r.u32()?;
        if magic != CSMAGIC_EMBEDDED_SIGNATURE {
            return Err(Error::malformed_signature(
                base,
                format!("bad superblob magic {magic:#010x}"),
            ));
        }
        let length = r.u32()?;
        let count = r.u32()?;

        if length as usize > data.len() {
            return Err(Error::malformed_signature(
                base,
                format!(
                    "superblob length {length:#x} exceeds signature region of {:#x} bytes",
                    data.len()
                ),
            ));
        }
        let data = &data[..length as usize];
        let index_end = (count as u64) * BLOB_INDEX_SIZE as u64 + SUPERBLOB_HEADER_SIZE as u64;
        if index_end > length as u64 {
            return Err(Error::malformed_signature(
                base,
                format!("{count} index entries overflow superblob length {length:#x}"),
            ));
        }

        let mut sig = Self {
            offset: base,
            length,
            ..Self::default()
        };

        for i in 0..count as usize {
            let entry_pos = SUPERBLOB_HEADER_SIZE + i * BLOB_INDEX_SIZE;
            let mut r = BlobReader::new(&data[entry_pos..], base + entry_pos as u64, "blob index");
            let slot = SlotType::from(r.u32()?);
            let offset = r.u32()? as usize;

            let (blob_magic, blob_len) = blob_header(data, offset).ok_or_else(|| {
                Error::malformed_signature(
                    base + entry_pos as u64,
                    format!("{slot} offset {offset:#x} outside superblob length {length:#x}"),
                )
            })?;
            if blob_len < BLOB_HEADER_SIZE || offset + blob_len > data.len() {
                return Err(Error::malformed_signature(
                    base + offset as u64,
                    format!("{slot} length {blob_len:#x} overflows superblob"),
                ));
            }

            let blob = &data[offset..offset + blob_len];
            let blob_base = base + offset as u64;
            sig.blobs.push(BlobIndex {
                slot,
                offset: blob_base,
                magic: blob_magic,
                length: blob_len as u32,
            });

            match slot {
                s if s.is_code_directory() => {
                    sig.code_directories
                        .push(CodeDirectory::parse(blob, blob_base, slot)?);
                }
                SlotType::Requirements => {
                    sig.requirements
                        .extend(parse_requirement_set(blob, blob_base)?);
                }
                SlotType::CmsSignature => {
                    if blob_magic != CSMAGIC_BLOBWRAPPER {
                        return Err(Error::malformed_signature(
                            blob_base,
                            format!("bad CMS wrapper magic {blob_magic:#010x}"),
                        ));
                    }
                    let payload = &blob[BLOB_HEADER_SIZE..];
                    if !payload.is_empty() {
                        sig.certificates =
                            parse_certificates(payload, blob_base + BLOB_HEADER_SIZE as u64)?;
                    }
                    sig.cms = payload.to_vec();
                }
                SlotType::Entitlements if blob_magic == CSMAGIC_EMBEDDED_ENTITLEMENTS => {
                    sig.entitlements =
                        Some(String::from_utf8_lossy(&blob[BLOB_HEADER_SIZE..]).into_owned());
                }
                other => {
                    debug!(slot = %other, offset = blob_base, "recorded sub-blob without decoding");
                }
            }
        }

        if sig.code_directories.is_empty() {
            warn!(offset = base, "signature has no code directory");
        }
        debug!(
            blobs = sig.blobs.len(),
            code_directories = sig.code_directories.len(),
            requirements = sig.requirements.len(),
            certificates = sig.certificates.len(),
            "decoded superblob"
        );
        Ok(sig)
    }

    /// Returns the primary CodeDirectory (slot zero), if present.
    pub fn code_directory(&self) -> Option<&CodeDirectory> {
        self.code_directories
            .iter()
            .find(|cd| cd.slot == SlotType::CodeDirectory)
    }

    /// Returns the index entry for a slot type.
    pub fn blob(&self, slot: SlotType) -> Option<&BlobIndex> {
        self.blobs.iter().find(|b| b.slot == slot)
    }
}

/// Reads the magic and length of the blob at `offset`.
fn blob_header(data: &[u8], offset: usize) -> Option<(u32, usize)> {
    let magic = read_u32_be_at(data, offset)?;
    let length = read_u32_be_at(data, offset + 4)? as usize;
    Some((magic, length))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{apple_root_cms, requirement_set, CodeDirectoryBuilder, ExprBuilder, SuperBlobBuilder};

    fn standard_directory() -> Vec<u8> {
        CodeDirectoryBuilder::new("com.apple.dyld.shared_cache")
            .code_limit(8192)
            .page_shift(12)
            .special_slots(2)
            .code_slots(2)
            .build()
    }

    #[test]
    fn test_single_code_directory_without_cms() {
        let blob = SuperBlobBuilder::new()
            .code_directory(standard_directory())
            .build();
        let sig = CodeSignature::parse(&blob, 0x8000).unwrap();

        assert_eq!(sig.code_directories.len(), 1);
        let cd = sig.code_directory().unwrap();
        assert_eq!(cd.code_slots.len(), 2);
        assert_eq!(cd.special_slots.len(), 2);
        assert_eq!(cd.offset, 0x8000 + 12 + 8);
        assert!(sig.certificates.is_empty());
        assert!(sig.cms.is_empty());
        assert!(sig.requirements.is_empty());
    }

    #[test]
    fn test_all_sub_blobs() {
        let sha1_cd = CodeDirectoryBuilder::new("com.apple.dyld.shared_cache")
            .hash_type(1, 20)
            .code_limit(8192)
            .page_shift(12)
            .code_slots(2)
            .build();
        let reqs = requirement_set(&[(3, ExprBuilder::new().op(3).build())]);
        let blob = SuperBlobBuilder::new()
            .code_directory(sha1_cd)
            .blob(CSSLOT_REQUIREMENTS, reqs)
            .wrapped(
                CSSLOT_ENTITLEMENTS,
                CSMAGIC_EMBEDDED_ENTITLEMENTS,
                b"<plist/>",
            )
            .blob(CSSLOT_ALTERNATE_CODEDIRECTORIES, standard_directory())
            .wrapped(CSSLOT_SIGNATURESLOT, CSMAGIC_BLOBWRAPPER, &apple_root_cms())
            .wrapped(0x4242, 0xfade9999, b"opaque")
            .build();
        let sig = CodeSignature::parse(&blob, 0).unwrap();

        assert_eq!(sig.blobs.len(), 6);
        assert_eq!(sig.code_directories.len(), 2);
        assert_eq!(
            sig.code_directories[1].slot,
            SlotType::AlternateCodeDirectory(0)
        );
        assert_eq!(sig.code_directory().unwrap().hash_type, HashType::Sha1);
        assert_eq!(sig.requirements.len(), 1);
        assert_eq!(sig.requirements[0].description, "anchor apple");
        assert_eq!(sig.entitlements.as_deref(), Some("<plist/>"));
        assert_eq!(sig.certificates.len(), 1);
        assert_eq!(sig.certificates[0].subject_cn, "Apple Root CA");
        assert!(!sig.cms.is_empty());
        assert_eq!(sig.blob(SlotType::Unknown(0x4242)).unwrap().length, 14);

        let cms = sig.blob(SlotType::CmsSignature).unwrap().to_string();
        assert!(cms.contains("0xfade0b01 blob wrapper"));
        let opaque = sig.blob(SlotType::Unknown(0x4242)).unwrap().to_string();
        assert!(opaque.contains("(magic: 0xfade9999, @"));
    }

    #[test]
    fn test_empty_superblob() {
        let blob = SuperBlobBuilder::new().build();
        let sig = CodeSignature::parse(&blob, 0).unwrap();
        assert!(sig.blobs.is_empty());
        assert!(sig.code_directories.is_empty());
    }

    #[test]
    fn test_unrecognized_blobs_only() {
        let blob = SuperBlobBuilder::new()
            .wrapped(0x4242, 0xfade9999, b"opaque")
            .build();
        let sig = CodeSignature::parse(&blob, 0).unwrap();
        assert_eq!(sig.blobs.len(), 1);
        assert!(sig.code_directories.is_empty());
        assert!(sig.requirements.is_empty());
    }

    #[test]
    fn test_empty_cms_wrapper() {
        let blob = SuperBlobBuilder::new()
            .code_directory(standard_directory())
            .wrapped(CSSLOT_SIGNATURESLOT, CSMAGIC_BLOBWRAPPER, &[])
            .build();
        let sig = CodeSignature::parse(&blob, 0).unwrap();
        assert!(sig.cms.is_empty());
        assert!(sig.certificates.is_empty());
    }

    #[test]
    fn test_malformed_index_offset() {
        let mut blob = SuperBlobBuilder::new()
            .code_directory(standard_directory())
            .build();
        let length = blob.len() as u32;
        // Point the first index entry just past the declared length.
        blob[16..20].copy_from_slice(&length.to_be_bytes());
        assert!(matches!(
            CodeSignature::parse(&blob, 0x100),
            Err(Error::MalformedSignature { offset: 0x10c, .. })
        ));
    }

    #[test]
    fn test_malformed_header() {
        let blob = SuperBlobBuilder::new()
            .code_directory(standard_directory())
            .build();

        let mut bad_magic = blob.clone();
        bad_magic[0] = 0;
        assert!(matches!(
            CodeSignature::parse(&bad_magic, 0),
            Err(Error::MalformedSignature { offset: 0, .. })
        ));

        // Declared length beyond the region.
        assert!(CodeSignature::parse(&blob[..blob.len() - 4], 0).is_err());

        // Index count larger than the superblob can hold.
        let mut bad_count = blob.clone();
        bad_count[8..12].copy_from_slice(&0x1000u32.to_be_bytes());
        assert!(matches!(
            CodeSignature::parse(&bad_count, 0),
            Err(Error::MalformedSignature { .. })
        ));
    }

    #[test]
    fn test_blob_overflowing_superblob() {
        let mut blob = SuperBlobBuilder::new()
            .code_directory(standard_directory())
            .build();
        // Inflate the code directory's own length field.
        blob[24..28].copy_from_slice(&0xFFFFu32.to_be_bytes());
        assert!(matches!(
            CodeSignature::parse(&blob, 0),
            Err(Error::MalformedSignature { offset: 20, .. })
        ));
    }
}
