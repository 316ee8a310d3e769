//! Byte-level helpers shared by the cache and signature decoders.
//!
//! Cache structures are little-endian; code-signing blobs are big-endian.
//! Every reader here is bounds-checked and returns `None` rather than
//! panicking, so callers can attach the right error kind and offset.

use byteorder::{BigEndian, ByteOrder, LittleEndian};

// =============================================================================
// Bounds-checked Reads
// =============================================================================

/// Returns `data[offset..offset + len]` if the whole range is in bounds.
#[inline]
pub fn slice(data: &[u8], offset: usize, len: usize) -> Option<&[u8]> {
    let end = offset.checked_add(len)?;
    data.get(offset..end)
}

/// Reads a little-endian u32 at the given offset.
#[inline]
pub fn read_u32_le_at(data: &[u8], offset: usize) -> Option<u32> {
    slice(data, offset, 4).map(LittleEndian::read_u32)
}

/// Reads a little-endian u64 at the given offset.
#[inline]
pub fn read_u64_le_at(data: &[u8], offset: usize) -> Option<u64> {
    slice(data, offset, 8).map(LittleEndian::read_u64)
}

/// Reads a big-endian u32 at the given offset.
#[inline]
pub fn read_u32_be_at(data: &[u8], offset: usize) -> Option<u32> {
    slice(data, offset, 4).map(BigEndian::read_u32)
}

/// Reads a big-endian u64 at the given offset.
#[inline]
pub fn read_u64_be_at(data: &[u8], offset: usize) -> Option<u64> {
    slice(data, offset, 8).map(BigEndian::read_u64)
}

// =============================================================================
// Strings
// =============================================================================

/// Finds the position of the first null byte in a slice.
///
/// Returns the slice length when there is no terminator.
#[inline(always)]
pub fn memchr_null(data: &[u8]) -> usize {
    memchr::memchr(0, data).unwrap_or(data.len())
}

/// Reads a NUL-terminated string starting at `offset`.
///
/// Returns `None` when `offset` is past the end of `data` or when no
/// terminator is found before the end of the slice.
pub fn read_cstr(data: &[u8], offset: usize) -> Option<String> {
    let bytes = data.get(offset..)?;
    let end = memchr::memchr(0, bytes)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// Reads a string from a fixed-size, NUL-padded field.
pub fn fixed_str(field: &[u8]) -> &str {
    let end = memchr_null(field);
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

// =============================================================================
// Formatting
// =============================================================================

/// Formats a packed `X.Y.Z` version number (16.8.8 bits).
pub fn format_version(v: u32) -> String {
    let (major, minor, patch) = (v >> 16, (v >> 8) & 0xFF, v & 0xFF);
    if patch == 0 {
        format!("{major}.{minor}")
    } else {
        format!("{major}.{minor}.{patch}")
    }
}

/// Formats a UUID as an upper-case hex string.
pub fn uuid_to_string(uuid: &[u8; 16]) -> String {
    let h = hex::encode_upper(uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &h[0..8],
        &h[8..12],
        &h[12..16],
        &h[16..20],
        &h[20..32]
    )
}

/// Formats a byte count with a binary unit suffix.
pub fn format_size(size: u64) -> String {
    if size >= 1024 * 1024 * 1024 {
        format!("{:.1}G", size as f64 / 1024.0 / 1024.0 / 1024.0)
    } else if size >= 1024 * 1024 {
        format!("{:.1}M", size as f64 / 1024.0 / 1024.0)
    } else if size >= 1024 {
        format!("{:.1}K", size as f64 / 1024.0)
    } else {
        format!("{}B", size)
    }
}
