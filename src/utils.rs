//! Utility functions.
//!
//! Alignment math plus the bounds-checked accessors every format backend goes
//! through. Offsets read out of a file are never used to index a buffer directly.

use anyhow::Result;
use object::pod::{from_bytes, from_bytes_mut, Pod};
use std::ops::Range;

use crate::error::invalid_format;

/// Aligns an address or size up to the next multiple of `align`.
/// `align` must be a power of two.
pub fn align_up(addr: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    if align == 0 {
        return addr;
    }
    (addr + align - 1) & !(align - 1)
}

/// Like [`align_up`], for alignments and values that come out of a file.
///
/// Rejects alignments that are not a power of two and results that would wrap.
pub fn checked_align_up(value: u64, align: u64) -> Result<u64> {
    if !align.is_power_of_two() {
        return Err(invalid_format(format!("alignment 0x{:x} is not a power of two", align)));
    }
    let aligned = value
        .checked_add(align - 1)
        .map(|v| v & !(align - 1))
        .ok_or_else(|| invalid_format(format!("aligning 0x{:x} to 0x{:x} overflows", value, align)))?;
    debug_assert!(aligned >= value);
    Ok(aligned)
}

/// Validate `offset..offset + len` against a buffer of `buf_len` bytes.
pub fn checked_range(buf_len: usize, offset: u64, len: u64, what: &str) -> Result<Range<usize>> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| invalid_format(format!("{} range overflows at 0x{:x}", what, offset)))?;
    if end > buf_len as u64 {
        return Err(invalid_format(format!(
            "{} out of bounds at 0x{:x} (+0x{:x}, file is 0x{:x} bytes)",
            what, offset, len, buf_len
        )));
    }
    Ok(offset as usize..end as usize)
}

pub fn bytes_at<'a>(buf: &'a [u8], offset: u64, len: u64, what: &str) -> Result<&'a [u8]> {
    let range = checked_range(buf.len(), offset, len, what)?;
    Ok(&buf[range])
}

pub fn bytes_at_mut<'a>(buf: &'a mut [u8], offset: u64, len: u64, what: &str) -> Result<&'a mut [u8]> {
    let range = checked_range(buf.len(), offset, len, what)?;
    Ok(&mut buf[range])
}

/// View a pod struct at `offset`.
pub fn pod_at<'a, T: Pod>(buf: &'a [u8], offset: u64, what: &str) -> Result<&'a T> {
    let bytes = bytes_at(buf, offset, std::mem::size_of::<T>() as u64, what)?;
    from_bytes::<T>(bytes)
        .map(|(value, _)| value)
        .map_err(|()| invalid_format(format!("{} misaligned at 0x{:x}", what, offset)))
}

/// Mutable view of a pod struct at `offset`.
pub fn pod_at_mut<'a, T: Pod>(buf: &'a mut [u8], offset: u64, what: &str) -> Result<&'a mut T> {
    let bytes = bytes_at_mut(buf, offset, std::mem::size_of::<T>() as u64, what)?;
    from_bytes_mut::<T>(bytes)
        .map(|(value, _)| value)
        .map_err(|()| invalid_format(format!("{} misaligned at 0x{:x}", what, offset)))
}

pub fn read_u16(buf: &[u8], offset: u64) -> Result<u16> {
    let bytes = bytes_at(buf, offset, 2, "u16")?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

pub fn read_u32(buf: &[u8], offset: u64) -> Result<u32> {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(bytes_at(buf, offset, 4, "u32")?);
    Ok(u32::from_le_bytes(raw))
}

pub fn read_u64(buf: &[u8], offset: u64) -> Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes_at(buf, offset, 8, "u64")?);
    Ok(u64::from_le_bytes(raw))
}

pub fn write_u32(buf: &mut [u8], offset: u64, value: u32) -> Result<()> {
    bytes_at_mut(buf, offset, 4, "u32")?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub fn write_u64(buf: &mut [u8], offset: u64, value: u64) -> Result<()> {
    bytes_at_mut(buf, offset, 8, "u64")?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// First occurrence of `needle` in `haystack`.
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

/// Fixed-width, NUL-padded name field (Mach-O segment/section names, PE section names).
pub fn fixed_name<const N: usize>(name: &str) -> Result<[u8; N]> {
    let bytes = name.as_bytes();
    if bytes.len() > N {
        return Err(invalid_format(format!("name {:?} longer than {} bytes", name, N)));
    }
    let mut out = [0u8; N];
    out[..bytes.len()].copy_from_slice(bytes);
    Ok(out)
}

/// A NUL-padded name field up to its first NUL.
pub fn trim_name(raw: &[u8]) -> &[u8] {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    &raw[..end]
}
