//! SMFG: self-update configuration carried in a container's config slot.
//!
//! Layout (little-endian):
//!
//! | offset | size | field |
//! |---|---|---|
//! | 0 | 4 | magic `SMFG` |
//! | 4 | 2 | version |
//! | 6 | 1 | prompt |
//! | 7 | 1 | prompt default (`y`/`n`) |
//! | 8 | 8 | interval (ms) |
//! | 16 | 8 | notify interval (ms) |
//! | 24 | 1168 | string fields |

use anyhow::Result;

use super::{check_field, put_field, take_field, Prefix};
use crate::error::{invalid_format, BinjectError};

pub const UPDATE_CONFIG_MAGIC: u32 = 0x534D_4647;
pub const UPDATE_CONFIG_VERSION: u16 = 1;
pub const UPDATE_CONFIG_SIZE: usize = 1192;

const MAX_BINNAME_LEN: usize = 127;
const MAX_COMMAND_LEN: usize = 254;
const MAX_URL_LEN: usize = 510;
const MAX_TAG_LEN: usize = 127;
const MAX_SKIP_ENV_LEN: usize = 63;
const MAX_FAKE_ARGV_ENV_LEN: usize = 63;
const MAX_NODE_VERSION_LEN: usize = 15;

const DAY_MS: i64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateConfig {
    pub binname: String,
    pub command: String,
    /// Must be `http://` or `https://` when set.
    pub url: String,
    pub tag: String,
    /// Environment variable that disables update checks.
    pub skip_env: String,
    pub fake_argv_env: String,
    pub node_version: String,
    pub prompt: bool,
    /// Either `'y'` or `'n'`.
    pub prompt_default: char,
    pub interval: i64,
    pub notify_interval: i64,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            binname: String::new(),
            command: "self-update".to_string(),
            url: String::new(),
            tag: String::new(),
            skip_env: String::new(),
            fake_argv_env: "SMOL_FAKE_ARGV".to_string(),
            node_version: String::new(),
            prompt: false,
            prompt_default: 'n',
            interval: DAY_MS,
            notify_interval: DAY_MS,
        }
    }
}

/// `y`, `Y`, `yes` map to `'y'`; anything else is `'n'`.
pub fn normalize_prompt_default(value: &str) -> char {
    match value.chars().next() {
        Some(c) if c.eq_ignore_ascii_case(&'y') => 'y',
        _ => 'n',
    }
}

impl UpdateConfig {
    fn string_fields(&self) -> [(&'static str, &str, usize, Prefix); 7] {
        [
            ("binname", &self.binname, MAX_BINNAME_LEN, Prefix::U8),
            ("command", &self.command, MAX_COMMAND_LEN, Prefix::U16),
            ("url", &self.url, MAX_URL_LEN, Prefix::U16),
            ("tag", &self.tag, MAX_TAG_LEN, Prefix::U8),
            ("skipEnv", &self.skip_env, MAX_SKIP_ENV_LEN, Prefix::U8),
            ("fakeArgvEnv", &self.fake_argv_env, MAX_FAKE_ARGV_ENV_LEN, Prefix::U8),
            ("nodeVersion", &self.node_version, MAX_NODE_VERSION_LEN, Prefix::U8),
        ]
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value, max_len, _) in self.string_fields() {
            check_field(name, value, max_len)?;
        }
        if !self.url.is_empty() && !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(BinjectError::InvalidArgs(format!(
                "update url must start with http:// or https:// (got {})",
                self.url
            ))
            .into());
        }
        Ok(())
    }

    /// Serialize to the fixed 1192-byte record.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut out = Vec::with_capacity(UPDATE_CONFIG_SIZE);
        out.extend_from_slice(&UPDATE_CONFIG_MAGIC.to_le_bytes());
        out.extend_from_slice(&UPDATE_CONFIG_VERSION.to_le_bytes());
        out.push(self.prompt as u8);
        out.push(if self.prompt_default == 'y' { b'y' } else { b'n' });
        out.extend_from_slice(&self.interval.to_le_bytes());
        out.extend_from_slice(&self.notify_interval.to_le_bytes());
        for (_, value, max_len, prefix) in self.string_fields() {
            put_field(&mut out, value, max_len, prefix);
        }

        debug_assert_eq!(out.len(), UPDATE_CONFIG_SIZE);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < UPDATE_CONFIG_SIZE {
            return Err(invalid_format(format!(
                "update config is {} bytes, expected {}",
                bytes.len(),
                UPDATE_CONFIG_SIZE
            )));
        }
        let magic = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != UPDATE_CONFIG_MAGIC {
            return Err(invalid_format(format!("bad update config magic 0x{:08x}", magic)));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != UPDATE_CONFIG_VERSION {
            return Err(invalid_format(format!("unsupported update config version {}", version)));
        }

        let mut interval = [0u8; 8];
        interval.copy_from_slice(&bytes[8..16]);
        let mut notify_interval = [0u8; 8];
        notify_interval.copy_from_slice(&bytes[16..24]);

        let mut offset = 24;
        let mut next = |max_len, prefix| take_field(bytes, &mut offset, max_len, prefix);
        let binname = next(MAX_BINNAME_LEN, Prefix::U8)?;
        let command = next(MAX_COMMAND_LEN, Prefix::U16)?;
        let url = next(MAX_URL_LEN, Prefix::U16)?;
        let tag = next(MAX_TAG_LEN, Prefix::U8)?;
        let skip_env = next(MAX_SKIP_ENV_LEN, Prefix::U8)?;
        let fake_argv_env = next(MAX_FAKE_ARGV_ENV_LEN, Prefix::U8)?;
        let node_version = next(MAX_NODE_VERSION_LEN, Prefix::U8)?;

        Ok(Self {
            binname,
            command,
            url,
            tag,
            skip_env,
            fake_argv_env,
            node_version,
            prompt: bytes[6] != 0,
            prompt_default: if bytes[7] == b'y' { 'y' } else { 'n' },
            interval: i64::from_le_bytes(interval),
            notify_interval: i64::from_le_bytes(notify_interval),
        })
    }
}
