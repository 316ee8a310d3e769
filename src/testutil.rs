//! Builders for synthetic caches, Mach-O images and signature blobs used in tests.

use std::mem::size_of;

use zerocopy::{FromZeros, IntoBytes};

use crate::codesign::structs::*;
use crate::dyld::{
    DyldCacheHeader, DyldCacheImageInfo, DyldCacheImageTextInfo, DyldCacheMappingAndSlideInfo,
    DyldCacheMappingInfo, FormatVersion,
};
use crate::macho::*;

// =============================================================================
// Mach-O
// =============================================================================

enum Command {
    Segment {
        name: String,
        vmaddr: u64,
        vmsize: u64,
    },
    Dylib {
        cmd: u32,
        name: String,
        version: u32,
    },
    Uuid([u8; 16]),
}

/// Builds a little-endian Mach-O header followed by its load commands.
pub struct MachOBuilder {
    is_64: bool,
    commands: Vec<Command>,
}

impl MachOBuilder {
    /// 64-bit arm64e dylib.
    pub fn new() -> Self {
        Self {
            is_64: true,
            commands: Vec::new(),
        }
    }

    /// 32-bit arm64_32 dylib.
    pub fn new_32() -> Self {
        Self {
            is_64: false,
            commands: Vec::new(),
        }
    }

    pub fn segment(mut self, name: &str, vmaddr: u64, vmsize: u64) -> Self {
        self.commands.push(Command::Segment {
            name: name.to_string(),
            vmaddr,
            vmsize,
        });
        self
    }

    pub fn id_dylib(mut self, name: &str, version: u32) -> Self {
        self.commands.push(Command::Dylib {
            cmd: LC_ID_DYLIB,
            name: name.to_string(),
            version,
        });
        self
    }

    pub fn load_dylib(mut self, name: &str) -> Self {
        self.commands.push(Command::Dylib {
            cmd: LC_LOAD_DYLIB,
            name: name.to_string(),
            version: 0x0001_0000,
        });
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.commands.push(Command::Uuid(uuid));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let align = if self.is_64 { 8 } else { 4 };
        let mut cmds = Vec::new();
        for command in &self.commands {
            match command {
                Command::Segment {
                    name,
                    vmaddr,
                    vmsize,
                } => {
                    let prot = if name == "__TEXT" { 5 } else { 3 };
                    let mut seg = SegmentCommand64::new_zeroed();
                    seg.set_name(name);
                    if self.is_64 {
                        seg.cmd = LC_SEGMENT_64;
                        seg.cmdsize = SegmentCommand64::SIZE as u32;
                        seg.vmaddr = *vmaddr;
                        seg.vmsize = *vmsize;
                        seg.filesize = *vmsize;
                        seg.maxprot = prot;
                        seg.initprot = prot;
                        cmds.extend_from_slice(seg.as_bytes());
                    } else {
                        let mut seg32 = SegmentCommand32::new_zeroed();
                        seg32.cmd = LC_SEGMENT;
                        seg32.cmdsize = SegmentCommand32::SIZE as u32;
                        seg32.segname = seg.segname;
                        seg32.vmaddr = *vmaddr as u32;
                        seg32.vmsize = *vmsize as u32;
                        seg32.filesize = *vmsize as u32;
                        seg32.maxprot = prot;
                        seg32.initprot = prot;
                        cmds.extend_from_slice(seg32.as_bytes());
                    }
                }
                Command::Dylib { cmd, name, version } => {
                    let raw = name.len() + 1;
                    let cmdsize = (DylibCommand::SIZE + raw).next_multiple_of(align);
                    let mut dylib = DylibCommand::new_zeroed();
                    dylib.cmd = *cmd;
                    dylib.cmdsize = cmdsize as u32;
                    dylib.dylib.name_offset = DylibCommand::SIZE as u32;
                    dylib.dylib.timestamp = 2;
                    dylib.dylib.current_version = *version;
                    dylib.dylib.compatibility_version = 0x0001_0000;
                    cmds.extend_from_slice(dylib.as_bytes());
                    cmds.extend_from_slice(name.as_bytes());
                    cmds.resize(cmds.len() + cmdsize - DylibCommand::SIZE - name.len(), 0);
                }
                Command::Uuid(uuid) => {
                    let mut lc = UuidCommand::new_zeroed();
                    lc.cmd = LC_UUID;
                    lc.cmdsize = UuidCommand::SIZE as u32;
                    lc.uuid = *uuid;
                    cmds.extend_from_slice(lc.as_bytes());
                }
            }
        }

        let mut out = if self.is_64 {
            let mut header = MachHeader64::new_zeroed();
            header.magic = MH_MAGIC_64;
            header.cputype = CPU_TYPE_ARM64;
            header.cpusubtype = CPU_SUBTYPE_ARM64E;
            header.filetype = MH_DYLIB;
            header.ncmds = self.commands.len() as u32;
            header.sizeofcmds = cmds.len() as u32;
            header.as_bytes().to_vec()
        } else {
            let mut header = MachHeader32::new_zeroed();
            header.magic = MH_MAGIC;
            header.cputype = CPU_TYPE_ARM64_32;
            header.filetype = MH_DYLIB;
            header.ncmds = self.commands.len() as u32;
            header.sizeofcmds = cmds.len() as u32;
            header.as_bytes().to_vec()
        };
        out.extend_from_slice(&cmds);
        out
    }
}

/// Wraps thin images in a big-endian fat header, one slice per image.
pub fn fat_binary(slices: &[Vec<u8>]) -> Vec<u8> {
    const ALIGN: usize = 0x1000;
    let mut out = Vec::new();
    out.extend_from_slice(&FAT_MAGIC.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = ALIGN;
    let mut bodies = Vec::new();
    for slice in slices {
        out.extend_from_slice(&CPU_TYPE_ARM64.to_be_bytes());
        out.extend_from_slice(&CPU_SUBTYPE_ARM64E.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(slice.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
        bodies.push((offset, slice));
        offset = (offset + slice.len()).next_multiple_of(ALIGN);
    }
    for (offset, slice) in bodies {
        out.resize(offset, 0);
        out.extend_from_slice(slice);
    }
    out
}

// =============================================================================
// Cache
// =============================================================================

/// Builds a synthetic arm64e dyld shared cache.
///
/// Tables follow the 0x200-byte header; the file is padded to the end of the
/// last mapping and the signature, if any, is appended after that.
pub struct CacheBuilder {
    format: FormatVersion,
    extended: bool,
    mappings: Vec<(u64, u64, u64)>,
    images: Vec<(u64, String)>,
    text: Vec<([u8; 16], u64, u32)>,
    patches: Vec<(usize, Vec<u8>)>,
    signature: Option<Vec<u8>>,
}

impl CacheBuilder {
    pub fn new(format: FormatVersion) -> Self {
        Self {
            format,
            extended: false,
            mappings: Vec::new(),
            images: Vec::new(),
            text: Vec::new(),
            patches: Vec::new(),
            signature: None,
        }
    }

    /// Also emits the extended mapping table and points the header at it.
    pub fn extended_mappings(mut self) -> Self {
        self.extended = true;
        self
    }

    pub fn mapping(mut self, address: u64, size: u64, file_offset: u64) -> Self {
        self.mappings.push((address, size, file_offset));
        self
    }

    pub fn image(mut self, address: u64, path: &str) -> Self {
        self.images.push((address, path.to_string()));
        self
    }

    pub fn image_text(mut self, uuid: [u8; 16], load_address: u64, text_size: u32) -> Self {
        self.text.push((uuid, load_address, text_size));
        self
    }

    /// Copies `bytes` into the file at `offset` after the tables are laid out.
    pub fn write_at(mut self, offset: usize, bytes: &[u8]) -> Self {
        self.patches.push((offset, bytes.to_vec()));
        self
    }

    pub fn signature(mut self, blob: &[u8]) -> Self {
        self.signature = Some(blob.to_vec());
        self
    }

    pub fn build(self) -> Vec<u8> {
        let mut header = DyldCacheHeader::new_zeroed();
        header.magic = *b"dyld_v1  arm64e\0";
        header.uuid = [0x5A; 16];
        header.platform = 2;
        header.format_version_and_flags = match self.format {
            FormatVersion::DylibsOnDisk => 0x108,
            FormatVersion::DylibsEmbeddedOnly => 0x008,
        };

        let mut tables = Vec::new();
        let mut cursor = DyldCacheHeader::SIZE;

        header.mapping_offset = cursor as u32;
        header.mapping_count = self.mappings.len() as u32;
        for (i, &(address, size, file_offset)) in self.mappings.iter().enumerate() {
            let prot = if i == 0 { 5 } else { 3 };
            let info = DyldCacheMappingInfo {
                address,
                size,
                file_offset,
                max_prot: prot,
                init_prot: prot,
            };
            tables.extend_from_slice(info.as_bytes());
        }
        cursor += self.mappings.len() * size_of::<DyldCacheMappingInfo>();

        if self.extended {
            header.mapping_with_slide_offset = cursor as u32;
            header.mapping_with_slide_count = self.mappings.len() as u32;
            for (i, &(address, size, file_offset)) in self.mappings.iter().enumerate() {
                let prot = if i == 0 { 5 } else { 3 };
                let info = DyldCacheMappingAndSlideInfo {
                    address,
                    size,
                    file_offset,
                    slide_info_file_offset: 0,
                    slide_info_file_size: 0,
                    flags: 0,
                    max_prot: prot,
                    init_prot: prot,
                };
                tables.extend_from_slice(info.as_bytes());
            }
            cursor += self.mappings.len() * size_of::<DyldCacheMappingAndSlideInfo>();
        }

        header.images_offset = cursor as u32;
        header.images_count = self.images.len() as u32;
        cursor += self.images.len() * size_of::<DyldCacheImageInfo>();

        if !self.text.is_empty() {
            header.images_text_offset = cursor as u64;
            header.images_text_count = self.text.len() as u64;
            cursor += self.text.len() * size_of::<DyldCacheImageTextInfo>();
        }

        let mut strings = Vec::new();
        let mut path_offsets = Vec::new();
        for (_, path) in &self.images {
            path_offsets.push((cursor + strings.len()) as u32);
            strings.extend_from_slice(path.as_bytes());
            strings.push(0);
        }

        for (&(address, _), &path_file_offset) in self.images.iter().zip(&path_offsets) {
            let info = DyldCacheImageInfo {
                address,
                mod_time: 0,
                inode: 0,
                path_file_offset,
                pad: 0,
            };
            tables.extend_from_slice(info.as_bytes());
        }
        for &(uuid, load_address, text_segment_size) in &self.text {
            let path_offset = self
                .images
                .iter()
                .position(|(addr, _)| *addr == load_address)
                .map_or(0, |i| path_offsets[i]);
            let info = DyldCacheImageTextInfo {
                uuid,
                load_address,
                text_segment_size,
                path_offset,
            };
            tables.extend_from_slice(info.as_bytes());
        }
        tables.extend_from_slice(&strings);

        let mut len = DyldCacheHeader::SIZE + tables.len();
        for &(_, size, file_offset) in &self.mappings {
            len = len.max((file_offset + size) as usize);
        }
        for (offset, bytes) in &self.patches {
            len = len.max(offset + bytes.len());
        }
        if let Some(sig) = &self.signature {
            len = len.next_multiple_of(0x10);
            header.code_signature_offset = len as u64;
            header.code_signature_size = sig.len() as u64;
            len += sig.len();
        }

        let mut data = vec![0u8; len];
        data[..DyldCacheHeader::SIZE].copy_from_slice(header.as_bytes());
        data[DyldCacheHeader::SIZE..DyldCacheHeader::SIZE + tables.len()]
            .copy_from_slice(&tables);
        for (offset, bytes) in &self.patches {
            data[*offset..offset + bytes.len()].copy_from_slice(bytes);
        }
        if let Some(sig) = &self.signature {
            let start = header.code_signature_offset as usize;
            data[start..start + sig.len()].copy_from_slice(sig);
        }
        data
    }
}

// =============================================================================
// Code Signing
// =============================================================================

fn push_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_be_bytes());
}

/// Builds a version 0x20400 CodeDirectory.
///
/// Special slot `-i` is filled with `0xF0 + i` and code slot `i` with `i`.
pub struct CodeDirectoryBuilder {
    identifier: String,
    team_id: Option<String>,
    hash_type: u8,
    hash_size: u8,
    code_limit: u64,
    page_shift: u8,
    special_slots: u32,
    code_slots: u32,
}

impl CodeDirectoryBuilder {
    const HEADER_SIZE: usize = 88;

    pub fn new(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            team_id: None,
            hash_type: 2,
            hash_size: 32,
            code_limit: 0,
            page_shift: 12,
            special_slots: 0,
            code_slots: 0,
        }
    }

    pub fn team_id(mut self, team: &str) -> Self {
        self.team_id = Some(team.to_string());
        self
    }

    pub fn hash_type(mut self, hash_type: u8, hash_size: u8) -> Self {
        self.hash_type = hash_type;
        self.hash_size = hash_size;
        self
    }

    pub fn code_limit(mut self, limit: u64) -> Self {
        self.code_limit = limit;
        self
    }

    pub fn page_shift(mut self, shift: u8) -> Self {
        self.page_shift = shift;
        self
    }

    pub fn special_slots(mut self, n: u32) -> Self {
        self.special_slots = n;
        self
    }

    pub fn code_slots(mut self, n: u32) -> Self {
        self.code_slots = n;
        self
    }

    pub fn build(self) -> Vec<u8> {
        let hash_size = self.hash_size as usize;
        let ident_offset = Self::HEADER_SIZE;
        let mut tail = Vec::new();
        tail.extend_from_slice(self.identifier.as_bytes());
        tail.push(0);

        let team_offset = self.team_id.as_ref().map_or(0, |team| {
            let offset = ident_offset + tail.len();
            tail.extend_from_slice(team.as_bytes());
            tail.push(0);
            offset
        });

        for i in (1..=self.special_slots).rev() {
            tail.resize(tail.len() + hash_size, 0xF0u8.wrapping_add(i as u8));
        }
        let hash_offset = ident_offset + tail.len();
        for i in 0..self.code_slots {
            tail.resize(tail.len() + hash_size, i as u8);
        }
        let length = Self::HEADER_SIZE + tail.len();

        let mut out = Vec::with_capacity(length);
        push_u32(&mut out, CSMAGIC_CODEDIRECTORY);
        push_u32(&mut out, length as u32);
        push_u32(&mut out, CS_SUPPORTSEXECSEG);
        push_u32(&mut out, 0);
        push_u32(&mut out, hash_offset as u32);
        push_u32(&mut out, ident_offset as u32);
        push_u32(&mut out, self.special_slots);
        push_u32(&mut out, self.code_slots);
        push_u32(&mut out, u32::try_from(self.code_limit).unwrap_or(0));
        out.extend_from_slice(&[self.hash_size, self.hash_type, 0, self.page_shift]);
        push_u32(&mut out, 0); // spare2
        push_u32(&mut out, 0); // scatter
        push_u32(&mut out, team_offset as u32);
        push_u32(&mut out, 0); // spare3
        let limit64 = if self.code_limit > u32::MAX as u64 {
            self.code_limit
        } else {
            0
        };
        out.extend_from_slice(&limit64.to_be_bytes());
        out.extend_from_slice(&0u64.to_be_bytes());
        out.extend_from_slice(&self.code_limit.to_be_bytes());
        out.extend_from_slice(&1u64.to_be_bytes());
        assert_eq!(out.len(), Self::HEADER_SIZE);

        out.extend_from_slice(&tail);
        out
    }
}

/// Builds an embedded-signature SuperBlob with blobs in insertion order.
pub struct SuperBlobBuilder {
    blobs: Vec<(u32, Vec<u8>)>,
}

impl SuperBlobBuilder {
    pub fn new() -> Self {
        Self { blobs: Vec::new() }
    }

    pub fn code_directory(self, cd: Vec<u8>) -> Self {
        self.blob(CSSLOT_CODEDIRECTORY, cd)
    }

    /// Adds a complete blob (header included).
    pub fn blob(mut self, slot: u32, bytes: Vec<u8>) -> Self {
        self.blobs.push((slot, bytes));
        self
    }

    /// Adds `payload` behind a generic magic/length header.
    pub fn wrapped(self, slot: u32, magic: u32, payload: &[u8]) -> Self {
        self.blob(slot, blob_wrapper(magic, payload))
    }

    pub fn build(self) -> Vec<u8> {
        let index_end = 12 + self.blobs.len() * 8;
        let length = index_end + self.blobs.iter().map(|(_, b)| b.len()).sum::<usize>();

        let mut out = Vec::with_capacity(length);
        push_u32(&mut out, CSMAGIC_EMBEDDED_SIGNATURE);
        push_u32(&mut out, length as u32);
        push_u32(&mut out, self.blobs.len() as u32);
        let mut offset = index_end;
        for (slot, bytes) in &self.blobs {
            push_u32(&mut out, *slot);
            push_u32(&mut out, offset as u32);
            offset += bytes.len();
        }
        for (_, bytes) in &self.blobs {
            out.extend_from_slice(bytes);
        }
        out
    }
}

/// Prefixes `payload` with a blob header.
pub fn blob_wrapper(magic: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(BLOB_HEADER_SIZE + payload.len());
    push_u32(&mut out, magic);
    push_u32(&mut out, (BLOB_HEADER_SIZE + payload.len()) as u32);
    out.extend_from_slice(payload);
    out
}

/// Encodes a length-prefixed data item padded to four bytes.
pub fn data_item(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    push_u32(&mut out, bytes.len() as u32);
    out.extend_from_slice(bytes);
    out.resize(out.len().next_multiple_of(4), 0);
    out
}

/// Builds a compiled requirement expression.
pub struct ExprBuilder {
    out: Vec<u8>,
}

impl ExprBuilder {
    pub fn new() -> Self {
        Self { out: Vec::new() }
    }

    pub fn op(self, op: u32) -> Self {
        self.u32(op)
    }

    pub fn u32(mut self, v: u32) -> Self {
        push_u32(&mut self.out, v);
        self
    }

    pub fn data(mut self, bytes: &[u8]) -> Self {
        self.out.extend_from_slice(&data_item(bytes));
        self
    }

    pub fn build(self) -> Vec<u8> {
        self.out
    }
}

/// Builds a requirement set from `(type, expression)` pairs.
pub fn requirement_set(entries: &[(u32, Vec<u8>)]) -> Vec<u8> {
    let index_end = 12 + entries.len() * 8;
    let mut index = Vec::new();
    let mut blobs = Vec::new();
    for (kind, expr) in entries {
        push_u32(&mut index, *kind);
        push_u32(&mut index, (index_end + blobs.len()) as u32);
        push_u32(&mut blobs, CSMAGIC_REQUIREMENT);
        push_u32(&mut blobs, (12 + expr.len()) as u32);
        push_u32(&mut blobs, 1);
        blobs.extend_from_slice(expr);
    }

    let mut out = Vec::new();
    push_u32(&mut out, CSMAGIC_REQUIREMENTS);
    push_u32(&mut out, (index_end + blobs.len()) as u32);
    push_u32(&mut out, entries.len() as u32);
    out.extend_from_slice(&index);
    out.extend_from_slice(&blobs);
    out
}

// =============================================================================
// DER
// =============================================================================

/// Encodes one DER element.
pub fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        out.push(0x80 | bytes.len() as u8);
        out.extend_from_slice(&bytes);
    }
    out.extend_from_slice(content);
    out
}

fn seq(parts: &[Vec<u8>]) -> Vec<u8> {
    der(0x30, &parts.concat())
}

fn name_attr(oid_last: u8, value: &str) -> Vec<u8> {
    der(
        0x31,
        &seq(&[der(0x06, &[0x55, 0x04, oid_last]), der(0x13, value.as_bytes())]),
    )
}

/// OID arcs under 2.5.4 for the name attributes the fixtures use.
pub const OID_COUNTRY: u8 = 0x06;
pub const OID_ORGANIZATION: u8 = 0x0a;
pub const OID_ORGANIZATIONAL_UNIT: u8 = 0x0b;
pub const OID_COMMON_NAME: u8 = 0x03;

/// Encodes an RDN sequence from `(oid arc, value)` pairs.
pub fn x509_name(attrs: &[(u8, &str)]) -> Vec<u8> {
    let rdns: Vec<Vec<u8>> = attrs.iter().map(|(oid, v)| name_attr(*oid, v)).collect();
    seq(&rdns)
}

/// A minimal X.509 certificate. Validity times are UTCTime strings
/// (`YYMMDDHHMMSSZ`).
pub fn certificate(
    serial: u8,
    issuer: &[(u8, &str)],
    subject: &[(u8, &str)],
    not_before: &str,
    not_after: &str,
) -> Vec<u8> {
    let sha256_rsa = seq(&[
        der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]),
        der(0x05, &[]),
    ]);
    let validity = seq(&[
        der(0x17, not_before.as_bytes()),
        der(0x17, not_after.as_bytes()),
    ]);
    let spki = seq(&[
        seq(&[
            der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01]),
            der(0x05, &[]),
        ]),
        der(0x03, &[0x00, 0x30, 0x06, 0x02, 0x01, 0x0b, 0x02, 0x01, 0x03]),
    ]);
    let tbs = seq(&[
        der(0xa0, &der(0x02, &[0x02])),
        der(0x02, &[serial]),
        sha256_rsa.clone(),
        x509_name(issuer),
        validity,
        x509_name(subject),
        spki,
    ]);
    seq(&[tbs, sha256_rsa, der(0x03, &[0x00, 0x01, 0x02, 0x03])])
}

/// Wraps certificates, in order, in a CMS SignedData envelope with no signers.
pub fn cms_with_certificates(certificates: &[Vec<u8>]) -> Vec<u8> {
    let signed_data = seq(&[
        der(0x02, &[0x01]),
        der(0x31, &[]),
        seq(&[der(
            0x06,
            &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x01],
        )]),
        der(0xa0, &certificates.concat()),
        der(0x31, &[]),
    ]);
    seq(&[
        der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x07, 0x02]),
        der(0xa0, &signed_data),
    ])
}

/// The name of Apple's root certificate authority.
pub const APPLE_ROOT_NAME: &[(u8, &str)] = &[
    (OID_COUNTRY, "US"),
    (OID_ORGANIZATION, "Apple Inc."),
    (OID_ORGANIZATIONAL_UNIT, "Apple Certification Authority"),
    (OID_COMMON_NAME, "Apple Root CA"),
];

/// A CMS SignedData envelope carrying a self-signed "Apple Root CA" certificate
/// valid from 2006-04-25 through 2035-02-09.
pub fn apple_root_cms() -> Vec<u8> {
    cms_with_certificates(&[certificate(
        0x01,
        APPLE_ROOT_NAME,
        APPLE_ROOT_NAME,
        "060425214036Z",
        "350209214036Z",
    )])
}
