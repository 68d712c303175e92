//! SVFG: how the runtime should mount the embedded VFS image.

use anyhow::Result;
use std::fmt;
use std::str::FromStr;

use super::{check_field, put_field, take_field, Prefix};
use crate::error::{invalid_format, BinjectError};

pub const VFS_CONFIG_MAGIC: u32 = 0x5356_4647;
pub const VFS_CONFIG_VERSION: u16 = 1;
pub const VFS_CONFIG_SIZE: usize = 366;

const MAX_MODE_LEN: usize = 32;
const MAX_SOURCE_LEN: usize = 256;
const MAX_PREFIX_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VfsMode {
    /// Extract to disk on first run.
    #[default]
    OnDisk,
    InMemory,
    /// Empty VFS blob; the runtime only learns that the slot exists.
    Compat,
}

impl VfsMode {
    pub fn as_str(self) -> &'static str {
        match self {
            VfsMode::OnDisk => "on-disk",
            VfsMode::InMemory => "in-memory",
            VfsMode::Compat => "compat",
        }
    }
}

impl fmt::Display for VfsMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VfsMode {
    type Err = BinjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "on-disk" => Ok(VfsMode::OnDisk),
            "in-memory" => Ok(VfsMode::InMemory),
            "compat" => Ok(VfsMode::Compat),
            other => Err(BinjectError::InvalidArgs(format!(
                "unknown VFS mode {:?} (expected on-disk, in-memory or compat)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfsConfig {
    pub mode: VfsMode,
    pub source: String,
    /// Mount point inside the runtime, e.g. `/snapshot`.
    pub prefix: String,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            mode: VfsMode::OnDisk,
            source: String::new(),
            prefix: "/snapshot".to_string(),
        }
    }
}

impl VfsConfig {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        check_field("VFS source", &self.source, MAX_SOURCE_LEN)?;
        check_field("VFS prefix", &self.prefix, MAX_PREFIX_LEN)?;
        if !self.prefix.is_empty() && !self.prefix.starts_with('/') {
            return Err(BinjectError::InvalidArgs(format!(
                "VFS prefix must start with '/' (got {})",
                self.prefix
            ))
            .into());
        }

        let mut out = Vec::with_capacity(VFS_CONFIG_SIZE);
        out.extend_from_slice(&VFS_CONFIG_MAGIC.to_le_bytes());
        out.extend_from_slice(&VFS_CONFIG_VERSION.to_le_bytes());
        out.extend_from_slice(&[0, 0]);
        put_field(&mut out, self.mode.as_str(), MAX_MODE_LEN, Prefix::U16);
        put_field(&mut out, &self.source, MAX_SOURCE_LEN, Prefix::U16);
        put_field(&mut out, &self.prefix, MAX_PREFIX_LEN, Prefix::U16);

        debug_assert_eq!(out.len(), VFS_CONFIG_SIZE);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VFS_CONFIG_SIZE {
            return Err(invalid_format(format!(
                "VFS config is {} bytes, expected {}",
                bytes.len(),
                VFS_CONFIG_SIZE
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != VFS_CONFIG_MAGIC {
            return Err(invalid_format(format!("bad VFS config magic 0x{:08x}", magic)));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VFS_CONFIG_VERSION {
            return Err(invalid_format(format!("unsupported VFS config version {}", version)));
        }

        let mut offset = 8;
        let mode = take_field(bytes, &mut offset, MAX_MODE_LEN, Prefix::U16)?;
        let source = take_field(bytes, &mut offset, MAX_SOURCE_LEN, Prefix::U16)?;
        let prefix = take_field(bytes, &mut offset, MAX_PREFIX_LEN, Prefix::U16)?;
        Ok(Self {
            mode: mode.parse()?,
            source,
            prefix,
        })
    }
}
