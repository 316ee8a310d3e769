//! Code-signing constants, slot types and flag words.
//!
//! All code-signing structures are stored big-endian, independent of the
//! byte order of the image they sign.

use std::fmt;

use bitflags::bitflags;
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};

// =============================================================================
// Blob Magics
// =============================================================================

/// Single requirement blob
pub const CSMAGIC_REQUIREMENT: u32 = 0xfade0c00;
/// Requirement set (a SuperBlob of requirements)
pub const CSMAGIC_REQUIREMENTS: u32 = 0xfade0c01;
/// CodeDirectory blob
pub const CSMAGIC_CODEDIRECTORY: u32 = 0xfade0c02;
/// Embedded signature SuperBlob
pub const CSMAGIC_EMBEDDED_SIGNATURE: u32 = 0xfade0cc0;
/// Detached signature SuperBlob
pub const CSMAGIC_DETACHED_SIGNATURE: u32 = 0xfade0cc1;
/// CMS blob wrapper
pub const CSMAGIC_BLOBWRAPPER: u32 = 0xfade0b01;
/// XML entitlements
pub const CSMAGIC_EMBEDDED_ENTITLEMENTS: u32 = 0xfade7171;
/// DER entitlements
pub const CSMAGIC_EMBEDDED_DER_ENTITLEMENTS: u32 = 0xfade7172;
/// Launch constraints
pub const CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT: u32 = 0xfade8181;

/// Returns a short name for a blob magic, if it is a known one.
pub fn magic_name(magic: u32) -> Option<&'static str> {
    let name = match magic {
        CSMAGIC_REQUIREMENT => "requirement",
        CSMAGIC_REQUIREMENTS => "requirement set",
        CSMAGIC_CODEDIRECTORY => "code directory",
        CSMAGIC_EMBEDDED_SIGNATURE => "embedded signature",
        CSMAGIC_DETACHED_SIGNATURE => "detached signature",
        CSMAGIC_BLOBWRAPPER => "blob wrapper",
        CSMAGIC_EMBEDDED_ENTITLEMENTS => "entitlements",
        CSMAGIC_EMBEDDED_DER_ENTITLEMENTS => "DER entitlements",
        CSMAGIC_EMBEDDED_LAUNCH_CONSTRAINT => "launch constraint",
        _ => return None,
    };
    Some(name)
}

/// Size of the generic blob header (magic + length).
pub const BLOB_HEADER_SIZE: usize = 8;

// =============================================================================
// Slot Numbers
// =============================================================================

/// CodeDirectory slot
pub const CSSLOT_CODEDIRECTORY: u32 = 0;
/// Info.plist hash slot
pub const CSSLOT_INFOSLOT: u32 = 1;
/// Requirements slot
pub const CSSLOT_REQUIREMENTS: u32 = 2;
/// Resource directory slot
pub const CSSLOT_RESOURCEDIR: u32 = 3;
/// Application-specific slot
pub const CSSLOT_APPLICATION: u32 = 4;
/// Entitlements slot
pub const CSSLOT_ENTITLEMENTS: u32 = 5;
/// Representation-specific slot
pub const CSSLOT_REP_SPECIFIC: u32 = 6;
/// DER entitlements slot
pub const CSSLOT_DER_ENTITLEMENTS: u32 = 7;
/// Launch constraint (self) slot
pub const CSSLOT_LAUNCH_CONSTRAINT_SELF: u32 = 8;
/// Launch constraint (parent) slot
pub const CSSLOT_LAUNCH_CONSTRAINT_PARENT: u32 = 9;
/// Launch constraint (responsible) slot
pub const CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE: u32 = 10;
/// Library constraint slot
pub const CSSLOT_LIBRARY_CONSTRAINT: u32 = 11;
/// First alternate CodeDirectory slot
pub const CSSLOT_ALTERNATE_CODEDIRECTORIES: u32 = 0x1000;
/// Number of alternate CodeDirectory slots
pub const CSSLOT_ALTERNATE_CODEDIRECTORY_MAX: u32 = 5;
/// CMS signature slot
pub const CSSLOT_SIGNATURESLOT: u32 = 0x10000;
/// Identification slot
pub const CSSLOT_IDENTIFICATIONSLOT: u32 = 0x10001;
/// Notarization ticket slot
pub const CSSLOT_TICKETSLOT: u32 = 0x10002;

// =============================================================================
// CodeDirectory Versions
// =============================================================================

/// First version with `scatterOffset`
pub const CS_SUPPORTSSCATTER: u32 = 0x20100;
/// First version with `teamOffset`
pub const CS_SUPPORTSTEAMID: u32 = 0x20200;
/// First version with `codeLimit64`
pub const CS_SUPPORTSCODELIMIT64: u32 = 0x20300;
/// First version with the exec segment fields
pub const CS_SUPPORTSEXECSEG: u32 = 0x20400;
/// First version with `runtime` and `preEncryptOffset`
pub const CS_SUPPORTSRUNTIME: u32 = 0x20500;

// =============================================================================
// Slot Types
// =============================================================================

/// Type of a SuperBlob index entry or special slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum SlotType {
    CodeDirectory,
    InfoPlist,
    Requirements,
    ResourceDirectory,
    Application,
    Entitlements,
    RepSpecific,
    DerEntitlements,
    LaunchConstraintSelf,
    LaunchConstraintParent,
    LaunchConstraintResponsible,
    LibraryConstraint,
    AlternateCodeDirectory(u32),
    CmsSignature,
    Identification,
    Ticket,
    Unknown(u32),
}

impl SlotType {
    /// Returns true for the primary and alternate CodeDirectory slots.
    pub fn is_code_directory(self) -> bool {
        matches!(
            self,
            SlotType::CodeDirectory | SlotType::AlternateCodeDirectory(_)
        )
    }
}

impl From<u32> for SlotType {
    fn from(v: u32) -> Self {
        match v {
            CSSLOT_CODEDIRECTORY => SlotType::CodeDirectory,
            CSSLOT_INFOSLOT => SlotType::InfoPlist,
            CSSLOT_REQUIREMENTS => SlotType::Requirements,
            CSSLOT_RESOURCEDIR => SlotType::ResourceDirectory,
            CSSLOT_APPLICATION => SlotType::Application,
            CSSLOT_ENTITLEMENTS => SlotType::Entitlements,
            CSSLOT_REP_SPECIFIC => SlotType::RepSpecific,
            CSSLOT_DER_ENTITLEMENTS => SlotType::DerEntitlements,
            CSSLOT_LAUNCH_CONSTRAINT_SELF => SlotType::LaunchConstraintSelf,
            CSSLOT_LAUNCH_CONSTRAINT_PARENT => SlotType::LaunchConstraintParent,
            CSSLOT_LAUNCH_CONSTRAINT_RESPONSIBLE => SlotType::LaunchConstraintResponsible,
            CSSLOT_LIBRARY_CONSTRAINT => SlotType::LibraryConstraint,
            v if (CSSLOT_ALTERNATE_CODEDIRECTORIES
                ..CSSLOT_ALTERNATE_CODEDIRECTORIES + CSSLOT_ALTERNATE_CODEDIRECTORY_MAX)
                .contains(&v) =>
            {
                SlotType::AlternateCodeDirectory(v - CSSLOT_ALTERNATE_CODEDIRECTORIES)
            }
            CSSLOT_SIGNATURESLOT => SlotType::CmsSignature,
            CSSLOT_IDENTIFICATIONSLOT => SlotType::Identification,
            CSSLOT_TICKETSLOT => SlotType::Ticket,
            other => SlotType::Unknown(other),
        }
    }
}

impl fmt::Display for SlotType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SlotType::CodeDirectory => "CodeDirectory",
            SlotType::InfoPlist => "Info.plist",
            SlotType::Requirements => "Requirements Blob",
            SlotType::ResourceDirectory => "Resource Directory",
            SlotType::Application => "Application Specific",
            SlotType::Entitlements => "Entitlements Blob",
            SlotType::RepSpecific => "Rep Specific",
            SlotType::DerEntitlements => "DER Entitlements Blob",
            SlotType::LaunchConstraintSelf => "Launch Constraints (self)",
            SlotType::LaunchConstraintParent => "Launch Constraints (parent)",
            SlotType::LaunchConstraintResponsible => "Launch Constraints (responsible)",
            SlotType::LibraryConstraint => "Library Constraints",
            SlotType::AlternateCodeDirectory(n) => {
                return write!(f, "Alternate CodeDirectory {n}")
            }
            SlotType::CmsSignature => "CMS Signature",
            SlotType::Identification => "Identification",
            SlotType::Ticket => "Notarization Ticket",
            SlotType::Unknown(v) => return write!(f, "Unknown slot {v:#x}"),
        };
        f.write_str(name)
    }
}

// =============================================================================
// Hash Types
// =============================================================================

/// Digest algorithm used by a CodeDirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashType {
    /// SHA-1
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-256 truncated to 20 bytes
    Sha256Truncated,
    /// SHA-384
    Sha384,
    /// SHA-512
    Sha512,
    /// Unrecognized hash type byte
    Unknown(u8),
}

impl HashType {
    /// Returns the digest length in bytes, if the type is known.
    pub fn digest_len(self) -> Option<usize> {
        match self {
            HashType::Sha1 | HashType::Sha256Truncated => Some(20),
            HashType::Sha256 => Some(32),
            HashType::Sha384 => Some(48),
            HashType::Sha512 => Some(64),
            HashType::Unknown(_) => None,
        }
    }

    /// Computes the digest of `data`, or `None` for unknown types.
    pub fn digest(self, data: &[u8]) -> Option<Vec<u8>> {
        let digest = match self {
            HashType::Sha1 => Sha1::digest(data).to_vec(),
            HashType::Sha256 => Sha256::digest(data).to_vec(),
            HashType::Sha256Truncated => Sha256::digest(data)[..20].to_vec(),
            HashType::Sha384 => Sha384::digest(data).to_vec(),
            HashType::Sha512 => Sha512::digest(data).to_vec(),
            HashType::Unknown(_) => return None,
        };
        Some(digest)
    }
}

impl From<u8> for HashType {
    fn from(v: u8) -> Self {
        match v {
            1 => HashType::Sha1,
            2 => HashType::Sha256,
            3 => HashType::Sha256Truncated,
            4 => HashType::Sha384,
            5 => HashType::Sha512,
            other => HashType::Unknown(other),
        }
    }
}

impl fmt::Display for HashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashType::Sha1 => f.write_str("Sha1"),
            HashType::Sha256 => f.write_str("Sha256"),
            HashType::Sha256Truncated => f.write_str("Sha256 (Truncated)"),
            HashType::Sha384 => f.write_str("Sha384"),
            HashType::Sha512 => f.write_str("Sha512"),
            HashType::Unknown(v) => write!(f, "Unknown ({v})"),
        }
    }
}

// =============================================================================
// Flags
// =============================================================================

bitflags! {
    /// Code signing flags recorded in a CodeDirectory.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CodeDirectoryFlags: u32 {
        /// Dynamically valid
        const VALID = 0x1;
        /// Ad-hoc signed
        const ADHOC = 0x2;
        /// Has get-task-allow entitlement
        const GET_TASK_ALLOW = 0x4;
        /// Has installer entitlement
        const INSTALLER = 0x8;
        /// Library validation forced
        const FORCED_LV = 0x10;
        /// Invalid pages allowed
        const INVALID_ALLOWED = 0x20;
        /// Don't load invalid pages
        const HARD = 0x100;
        /// Kill process if it becomes invalid
        const KILL = 0x200;
        /// Force expiration checking
        const CHECK_EXPIRATION = 0x400;
        /// Restrict dyld loading
        const RESTRICT = 0x800;
        /// Require enforcement
        const ENFORCEMENT = 0x1000;
        /// Require library validation
        const REQUIRE_LV = 0x2000;
        /// Entitlements have been validated
        const ENTITLEMENTS_VALIDATED = 0x4000;
        /// NVRAM access unrestricted
        const NVRAM_UNRESTRICTED = 0x8000;
        /// Hardened runtime
        const RUNTIME = 0x10000;
        /// Signed by the linker
        const LINKER_SIGNED = 0x20000;
    }
}

impl fmt::Display for CodeDirectoryFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names: Vec<_> = self.iter_names().map(|(name, _)| name.to_lowercase()).collect();
        f.write_str(&names.join(", "))
    }
}

bitflags! {
    /// Executable segment flags (CodeDirectory version 0x20400+).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ExecSegmentFlags: u64 {
        /// Main binary
        const MAIN_BINARY = 0x1;
        /// Allow unsigned pages
        const ALLOW_UNSIGNED = 0x10;
        /// Main binary is debugger
        const DEBUGGER = 0x20;
        /// JIT enabled
        const JIT = 0x40;
        /// Skip library validation
        const SKIP_LV = 0x80;
        /// Can bless cdhash for execution
        const CAN_LOAD_CDHASH = 0x100;
        /// Can execute blessed cdhash
        const CAN_EXEC_CDHASH = 0x200;
    }
}

// =============================================================================
// Requirement Types
// =============================================================================

/// Kind of a requirement in a requirement set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum RequirementType {
    Host,
    Guest,
    Designated,
    Library,
    Plugin,
    Unknown(u32),
}

impl From<u32> for RequirementType {
    fn from(v: u32) -> Self {
        match v {
            1 => RequirementType::Host,
            2 => RequirementType::Guest,
            3 => RequirementType::Designated,
            4 => RequirementType::Library,
            5 => RequirementType::Plugin,
            other => RequirementType::Unknown(other),
        }
    }
}

impl fmt::Display for RequirementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequirementType::Host => f.write_str("Host Requirement"),
            RequirementType::Guest => f.write_str("Guest Requirement"),
            RequirementType::Designated => f.write_str("Designated Requirement"),
            RequirementType::Library => f.write_str("Library Requirement"),
            RequirementType::Plugin => f.write_str("Plugin Requirement"),
            RequirementType::Unknown(v) => write!(f, "Unknown Requirement ({v})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_types() {
        assert_eq!(SlotType::from(0), SlotType::CodeDirectory);
        assert_eq!(SlotType::from(0x1001), SlotType::AlternateCodeDirectory(1));
        assert!(SlotType::from(0x1004).is_code_directory());
        assert_eq!(SlotType::from(0x1005), SlotType::Unknown(0x1005));
        assert_eq!(SlotType::from(0x10000), SlotType::CmsSignature);
        assert_eq!(SlotType::from(1).to_string(), "Info.plist");
    }

    #[test]
    fn test_hash_digests() {
        assert_eq!(
            hex::encode(HashType::Sha1.digest(b"abc").unwrap()),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
        assert_eq!(
            hex::encode(HashType::Sha256.digest(b"abc").unwrap()),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(
            HashType::Sha256Truncated.digest(b"abc").unwrap(),
            HashType::Sha256.digest(b"abc").unwrap()[..20]
        );
        assert_eq!(HashType::Sha384.digest(b"").unwrap().len(), 48);
        assert!(HashType::Unknown(9).digest(b"abc").is_none());
    }

    #[test]
    fn test_flags_display() {
        let flags = CodeDirectoryFlags::ADHOC | CodeDirectoryFlags::LINKER_SIGNED;
        assert_eq!(flags.to_string(), "adhoc, linker_signed");
        assert_eq!(CodeDirectoryFlags::empty().to_string(), "none");
    }
}
