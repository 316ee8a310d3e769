//! Code signature decoding.
//!
//! This module handles:
//! - The embedded-signature SuperBlob and its index
//! - CodeDirectories with version-gated fields, slots and CDHash
//! - Requirement sets rendered as requirement-language text
//! - Certificate summaries from the CMS envelope

mod cms;
mod directory;
pub(crate) mod reader;
mod requirement;
pub mod structs;
mod superblob;

pub use cms::{parse_certificates, CertificateSummary};
pub use directory::{CdHash, CodeDirectory, CodeSlot, ExecSegment, SpecialSlot};
pub use requirement::{describe_expression, Requirement};
pub use structs::{CodeDirectoryFlags, ExecSegmentFlags, HashType, RequirementType, SlotType};
pub use superblob::{BlobIndex, CodeSignature};
