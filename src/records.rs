//! Fixed-size configuration records embedded next to payloads.
//!
//! Both records share one string encoding: a little-endian length prefix of one
//! or two bytes followed by a zero-padded area `max_len` bytes wide. Readers on
//! the runtime side index fields by absolute offset, so the widths never change.

use anyhow::Result;

use crate::error::{invalid_format, BinjectError};

pub mod update;
pub mod vfs;

pub use update::{UpdateConfig, UPDATE_CONFIG_SIZE};
pub use vfs::{VfsConfig, VfsMode, VFS_CONFIG_SIZE};

/// Width of a string field's length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Prefix {
    U8,
    U16,
}

impl Prefix {
    fn width(self) -> usize {
        match self {
            Prefix::U8 => 1,
            Prefix::U16 => 2,
        }
    }
}

/// Validate a string field before serialization.
pub(crate) fn check_field(field: &str, value: &str, max_len: usize) -> Result<()> {
    if value.len() > max_len {
        return Err(BinjectError::InvalidArgs(format!(
            "{} exceeds max length ({} > {})",
            field,
            value.len(),
            max_len
        ))
        .into());
    }
    Ok(())
}

/// Append one length-prefixed, padded string field. The value must already be checked.
pub(crate) fn put_field(out: &mut Vec<u8>, value: &str, max_len: usize, prefix: Prefix) {
    let len = value.len().min(max_len);
    match prefix {
        Prefix::U8 => out.push(len as u8),
        Prefix::U16 => out.extend_from_slice(&(len as u16).to_le_bytes()),
    }
    let start = out.len();
    out.extend_from_slice(&value.as_bytes()[..len]);
    out.resize(start + max_len, 0);
}

/// Read one string field written by [`put_field`], advancing `offset`.
pub(crate) fn take_field(bytes: &[u8], offset: &mut usize, max_len: usize, prefix: Prefix) -> Result<String> {
    let width = prefix.width();
    let end = *offset + width + max_len;
    if end > bytes.len() {
        return Err(invalid_format(format!("record field at {} runs past end of record", offset)));
    }
    let len = match prefix {
        Prefix::U8 => bytes[*offset] as usize,
        Prefix::U16 => u16::from_le_bytes([bytes[*offset], bytes[*offset + 1]]) as usize,
    };
    if len > max_len {
        return Err(invalid_format(format!("record field length {} exceeds {}", len, max_len)));
    }
    let start = *offset + width;
    let value = std::str::from_utf8(&bytes[start..start + len])
        .map_err(|e| invalid_format(format!("record field is not UTF-8: {}", e)))?
        .to_string();
    *offset = end;
    Ok(value)
}
