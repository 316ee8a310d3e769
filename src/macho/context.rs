//! Read-only Mach-O context for identity and layout queries.

use zerocopy::FromBytes;

use super::constants::*;
use super::structs::*;
use crate::error::{Error, Result};
use crate::util::{format_version, memchr_null, read_u32_le_at, slice};

// =============================================================================
// Segment Info
// =============================================================================

/// Parsed segment information.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
    /// The segment command (32-bit commands are widened)
    pub command: SegmentCommand64,
    /// Offset of the segment command in the image
    pub command_offset: usize,
}

impl SegmentInfo {
    /// Returns the segment name.
    pub fn name(&self) -> &str {
        self.command.name()
    }
}

// =============================================================================
// Dylib Identity
// =============================================================================

/// A dylib reference decoded from a dylib load command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DylibId {
    /// Install name
    pub name: String,
    /// Build timestamp
    pub timestamp: u32,
    /// Packed current version
    pub current_version: u32,
    /// Packed compatibility version
    pub compatibility_version: u32,
}

impl DylibId {
    /// Returns the current version as a dotted string.
    pub fn current_version_string(&self) -> String {
        format_version(self.current_version)
    }
}

// =============================================================================
// Load Command Info
// =============================================================================

/// Parsed load command information.
#[derive(Debug, Clone)]
#[allow(missing_docs)] // Variants are self-documenting via names
pub enum LoadCommandInfo {
    Segment(SegmentInfo),
    Dylib {
        cmd: u32,
        dylib: DylibId,
        offset: usize,
    },
    Uuid {
        uuid: [u8; 16],
        offset: usize,
    },
    Unknown {
        cmd: u32,
        cmdsize: u32,
        offset: usize,
    },
}

// =============================================================================
// Mach-O Context
// =============================================================================

/// Header and load commands of a single Mach-O image.
///
/// Only the region covered by the header and `sizeofcmds` is read, so the
/// context can be built from a window that ends right after the load
/// commands. Offsets in errors are relative to the start of `data` plus the
/// `base_offset` passed at construction.
#[derive(Debug, Clone)]
pub struct MachOContext {
    /// The Mach-O header (32-bit headers are widened)
    pub header: MachHeader64,
    /// Whether the image uses the 64-bit layout
    pub is_64: bool,
    /// Offset of this Mach-O within the containing file or cache
    pub base_offset: u64,
    /// Parsed load commands
    pub load_commands: Vec<LoadCommandInfo>,
}

impl MachOContext {
    /// Returns the number of bytes covering the header and its load commands.
    ///
    /// Used to size the window handed to [`MachOContext::new`] when the image
    /// lives inside a larger container.
    pub fn commands_extent(data: &[u8], base_offset: u64) -> Result<usize> {
        let (header, header_size) = Self::read_header(data, base_offset)?;
        Ok(header_size + header.sizeofcmds as usize)
    }

    /// Parses the header and load commands at the start of `data`.
    pub fn new(data: &[u8], base_offset: u64) -> Result<Self> {
        let (header, header_size) = Self::read_header(data, base_offset)?;

        let mut ctx = Self {
            header,
            is_64: header_size == MachHeader64::SIZE,
            base_offset,
            load_commands: Vec::new(),
        };
        ctx.parse_load_commands(data, header_size)?;
        Ok(ctx)
    }

    fn read_header(data: &[u8], base_offset: u64) -> Result<(MachHeader64, usize)> {
        let magic = read_u32_le_at(data, 0)
            .ok_or_else(|| Error::invalid_macho(base_offset, "too small for a Mach-O header"))?;

        match magic {
            MH_MAGIC_64 => {
                let header = MachHeader64::read_from_prefix(data)
                    .map_err(|_| Error::invalid_macho(base_offset, "truncated 64-bit header"))?
                    .0;
                Ok((header, MachHeader64::SIZE))
            }
            MH_MAGIC => {
                let header = MachHeader32::read_from_prefix(data)
                    .map_err(|_| Error::invalid_macho(base_offset, "truncated 32-bit header"))?
                    .0;
                Ok((header.widen(), MachHeader32::SIZE))
            }
            MH_CIGAM | MH_CIGAM_64 => Err(Error::invalid_macho(
                base_offset,
                "big-endian Mach-O images are not supported",
            )),
            other => Err(Error::invalid_macho(
                base_offset,
                format!("bad magic {other:#010x}"),
            )),
        }
    }

    /// Parses all load commands.
    fn parse_load_commands(&mut self, data: &[u8], header_size: usize) -> Result<()> {
        let mut offset = header_size;
        let end_offset = header_size + self.header.sizeofcmds as usize;

        for _ in 0..self.header.ncmds {
            let err_offset = self.base_offset + offset as u64;
            if offset + LoadCommand::SIZE > end_offset {
                return Err(Error::invalid_macho(err_offset, "load commands overflow sizeofcmds"));
            }

            let lc = slice(data, offset, LoadCommand::SIZE)
                .and_then(|b| LoadCommand::read_from_bytes(b).ok())
                .ok_or_else(|| Error::invalid_macho(err_offset, "truncated load command"))?;

            if (lc.cmdsize as usize) < LoadCommand::SIZE {
                return Err(Error::invalid_macho(
                    err_offset,
                    format!("load command size {:#x} is too small", lc.cmdsize),
                ));
            }

            let cmd_data = slice(data, offset, lc.cmdsize as usize)
                .filter(|_| offset + lc.cmdsize as usize <= end_offset)
                .ok_or_else(|| Error::invalid_macho(err_offset, "load command overflows image"))?;

            let info = self.parse_load_command(lc, cmd_data, offset)?;
            self.load_commands.push(info);
            offset += lc.cmdsize as usize;
        }

        Ok(())
    }

    /// Parses a single load command.
    fn parse_load_command(
        &self,
        lc: LoadCommand,
        data: &[u8],
        offset: usize,
    ) -> Result<LoadCommandInfo> {
        let err_offset = self.base_offset + offset as u64;
        let truncated = |what: &str| Error::invalid_macho(err_offset, format!("truncated {what}"));

        match lc.cmd {
            LC_SEGMENT_64 => {
                let seg = SegmentCommand64::read_from_prefix(data)
                    .map_err(|_| truncated("segment command"))?
                    .0;
                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg,
                    command_offset: offset,
                }))
            }

            LC_SEGMENT => {
                let seg = SegmentCommand32::read_from_prefix(data)
                    .map_err(|_| truncated("segment command"))?
                    .0;
                Ok(LoadCommandInfo::Segment(SegmentInfo {
                    command: seg.widen(),
                    command_offset: offset,
                }))
            }

            LC_ID_DYLIB | LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB
            | LC_LAZY_LOAD_DYLIB | LC_LOAD_UPWARD_DYLIB => {
                let cmd = DylibCommand::read_from_prefix(data)
                    .map_err(|_| truncated("dylib command"))?
                    .0;
                let name = data
                    .get(cmd.dylib.name_offset as usize..)
                    .map(|b| String::from_utf8_lossy(&b[..memchr_null(b)]).into_owned())
                    .ok_or_else(|| {
                        Error::invalid_macho(err_offset, "dylib name offset outside command")
                    })?;

                Ok(LoadCommandInfo::Dylib {
                    cmd: lc.cmd,
                    dylib: DylibId {
                        name,
                        timestamp: cmd.dylib.timestamp,
                        current_version: cmd.dylib.current_version,
                        compatibility_version: cmd.dylib.compatibility_version,
                    },
                    offset,
                })
            }

            LC_UUID => {
                let cmd = UuidCommand::read_from_prefix(data)
                    .map_err(|_| truncated("UUID command"))?
                    .0;
                Ok(LoadCommandInfo::Uuid {
                    uuid: cmd.uuid,
                    offset,
                })
            }

            _ => Ok(LoadCommandInfo::Unknown {
                cmd: lc.cmd,
                cmdsize: lc.cmdsize,
                offset,
            }),
        }
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Returns an iterator over all segments.
    pub fn segments(&self) -> impl Iterator<Item = &SegmentInfo> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Segment(seg) => Some(seg),
            _ => None,
        })
    }

    /// Returns a segment by name.
    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments().find(|s| s.name() == name)
    }

    /// Returns the identity from `LC_ID_DYLIB`, if present.
    pub fn dylib_id(&self) -> Option<&DylibId> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Dylib {
                cmd: LC_ID_DYLIB,
                dylib,
                ..
            } => Some(dylib),
            _ => None,
        })
    }

    /// Returns the install names of all dylib dependencies.
    pub fn dependencies(&self) -> impl Iterator<Item = &str> {
        self.load_commands.iter().filter_map(|lc| match lc {
            LoadCommandInfo::Dylib { cmd, dylib, .. } if *cmd != LC_ID_DYLIB => {
                Some(dylib.name.as_str())
            }
            _ => None,
        })
    }

    /// Returns the UUID from `LC_UUID`, if present.
    pub fn uuid(&self) -> Option<[u8; 16]> {
        self.load_commands.iter().find_map(|lc| match lc {
            LoadCommandInfo::Uuid { uuid, .. } => Some(*uuid),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::MachOBuilder;

    #[test]
    fn test_parse_dylib_identity() {
        let data = MachOBuilder::new()
            .segment("__TEXT", 0x1_8000_0000, 0x4000)
            .segment("__DATA", 0x1_8000_4000, 0x1000)
            .id_dylib("/usr/lib/libfoo.dylib", 0x04B7_0A03)
            .load_dylib("/usr/lib/libSystem.B.dylib")
            .uuid([0xAB; 16])
            .build();

        let ctx = MachOContext::new(&data, 0).unwrap();
        assert!(ctx.is_64);
        assert_eq!(ctx.segments().count(), 2);
        assert_eq!(ctx.segment("__DATA").unwrap().command.vmaddr, 0x1_8000_4000);

        let id = ctx.dylib_id().unwrap();
        assert_eq!(id.name, "/usr/lib/libfoo.dylib");
        assert_eq!(id.current_version_string(), "1207.10.3");
        assert_eq!(
            ctx.dependencies().collect::<Vec<_>>(),
            vec!["/usr/lib/libSystem.B.dylib"]
        );
        assert_eq!(ctx.uuid(), Some([0xAB; 16]));
        assert_eq!(
            MachOContext::commands_extent(&data, 0).unwrap(),
            data.len()
        );
    }

    #[test]
    fn test_parse_32bit_image() {
        let data = MachOBuilder::new_32()
            .segment("__TEXT", 0x3000_0000, 0x2000)
            .id_dylib("/usr/lib/libwatch.dylib", 0x0001_0000)
            .build();

        let ctx = MachOContext::new(&data, 0).unwrap();
        assert!(!ctx.is_64);
        assert_eq!(ctx.segment("__TEXT").unwrap().command.vmsize, 0x2000);
        assert_eq!(ctx.dylib_id().unwrap().current_version_string(), "1.0");
    }

    #[test]
    fn test_rejects_bad_magic_and_overflow() {
        let err = MachOContext::new(&[0u8; 64], 0x500).unwrap_err();
        assert!(matches!(err, Error::InvalidMachO { offset: 0x500, .. }));

        let mut data = MachOBuilder::new()
            .id_dylib("/usr/lib/libfoo.dylib", 0x0001_0000)
            .build();
        // Claim more commands than sizeofcmds covers.
        data[16..20].copy_from_slice(&5u32.to_le_bytes());
        assert!(matches!(
            MachOContext::new(&data, 0),
            Err(Error::InvalidMachO { .. })
        ));

        // A command count far beyond the data fails without preallocating.
        data[16..20].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            MachOContext::new(&data, 0x2000),
            Err(Error::InvalidMachO { .. })
        ));
    }

    #[test]
    fn test_dylib_name_with_invalid_utf8() {
        let mut data = MachOBuilder::new()
            .id_dylib("/usr/lib/libfoo.dylib", 0x0001_0000)
            .build();
        let pos = data
            .windows(6)
            .position(|w| w == b"libfoo")
            .unwrap();
        data[pos + 3] = 0xFF;

        let ctx = MachOContext::new(&data, 0).unwrap();
        assert_eq!(ctx.dylib_id().unwrap().name, "/usr/lib/lib\u{FFFD}oo.dylib");
    }
}
