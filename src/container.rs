//! The compressed-payload container ("SMOL section").
//!
//! On disk, inside whatever section, segment or note the host format provides:
//!
//! ```text
//! marker (32) | compressed_size u64 | uncompressed_size u64 | cache_key (16 hex)
//!   | platform u8 | arch u8 | libc u8 | has_config u8 | [update config (1192)]
//!   | payload (compressed_size)
//! ```
//!
//! Everything is little-endian. Decompression is not done here; callers get a view
//! of the payload and hand it to the codec.

use anyhow::Result;
use sha2::{Digest, Sha512};
use std::fmt;
use std::str::FromStr;

use crate::error::BinjectError;
use crate::records::{UpdateConfig, UPDATE_CONFIG_SIZE};
use crate::utils::find_bytes;

pub const MARKER_LEN: usize = 32;
pub const CACHE_KEY_LEN: usize = 16;
pub const SIZE_HEADER_LEN: usize = 16;
pub const PLATFORM_METADATA_LEN: usize = 3;
/// Sizes, cache key and platform bytes.
pub const METADATA_HEADER_LEN: usize = SIZE_HEADER_LEN + CACHE_KEY_LEN + PLATFORM_METADATA_LEN;

/// Upper bound on either size field. Anything larger is treated as corruption.
pub const MAX_PAYLOAD_SIZE: u64 = 500 * 1024 * 1024;

const MARKER_PARTS: [&[u8]; 3] = [b"__SMOL", b"_PRESSED_DATA", b"_MAGIC_MARKER"];

const FNV_OFFSET_BASIS: u64 = 14_695_981_039_346_656_037;
const FNV_PRIME: u64 = 1_099_511_628_211;

/// The container marker.
///
/// Assembled from parts at run time so the whole string never sits in this
/// binary's own read-only data, where a scan would find it.
pub fn marker() -> [u8; MARKER_LEN] {
    let mut out = [0u8; MARKER_LEN];
    let mut at = 0;
    for part in MARKER_PARTS {
        let part = std::hint::black_box(part);
        out[at..at + part.len()].copy_from_slice(part);
        at += part.len();
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Platform {
    Linux = 0,
    Darwin = 1,
    Win32 = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Arch {
    X64 = 0,
    Arm64 = 1,
    Ia32 = 2,
    Arm = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Libc {
    Glibc = 0,
    Musl = 1,
    /// Not Linux.
    NotApplicable = 255,
}

impl TryFrom<u8> for Platform {
    type Error = BinjectError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Platform::Linux),
            1 => Ok(Platform::Darwin),
            2 => Ok(Platform::Win32),
            other => Err(BinjectError::DecompressionFailed(format!("invalid platform byte {}", other))),
        }
    }
}

impl TryFrom<u8> for Arch {
    type Error = BinjectError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Arch::X64),
            1 => Ok(Arch::Arm64),
            2 => Ok(Arch::Ia32),
            3 => Ok(Arch::Arm),
            other => Err(BinjectError::DecompressionFailed(format!("invalid arch byte {}", other))),
        }
    }
}

impl TryFrom<u8> for Libc {
    type Error = BinjectError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Libc::Glibc),
            1 => Ok(Libc::Musl),
            255 => Ok(Libc::NotApplicable),
            other => Err(BinjectError::DecompressionFailed(format!("invalid libc byte {}", other))),
        }
    }
}

impl FromStr for Platform {
    type Err = BinjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" => Ok(Platform::Linux),
            "darwin" | "macos" => Ok(Platform::Darwin),
            "win32" | "windows" => Ok(Platform::Win32),
            other => Err(BinjectError::InvalidArgs(format!("unknown platform {:?}", other))),
        }
    }
}

impl FromStr for Arch {
    type Err = BinjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x64" | "x86_64" => Ok(Arch::X64),
            "arm64" | "aarch64" => Ok(Arch::Arm64),
            "ia32" | "x86" => Ok(Arch::Ia32),
            "arm" => Ok(Arch::Arm),
            other => Err(BinjectError::InvalidArgs(format!("unknown arch {:?}", other))),
        }
    }
}

impl FromStr for Libc {
    type Err = BinjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "glibc" => Ok(Libc::Glibc),
            "musl" => Ok(Libc::Musl),
            "none" | "na" => Ok(Libc::NotApplicable),
            other => Err(BinjectError::InvalidArgs(format!("unknown libc {:?}", other))),
        }
    }
}

/// Target the compressed payload was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformMetadata {
    pub platform: Platform,
    pub arch: Arch,
    pub libc: Libc,
}

impl PlatformMetadata {
    /// Metadata describing the machine this crate was compiled for.
    pub fn host() -> Self {
        let platform = if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "windows") {
            Platform::Win32
        } else {
            Platform::Linux
        };
        let arch = if cfg!(target_arch = "aarch64") {
            Arch::Arm64
        } else if cfg!(target_arch = "x86") {
            Arch::Ia32
        } else if cfg!(target_arch = "arm") {
            Arch::Arm
        } else {
            Arch::X64
        };
        let libc = if platform != Platform::Linux {
            Libc::NotApplicable
        } else if cfg!(target_env = "musl") {
            Libc::Musl
        } else {
            Libc::Glibc
        };
        Self { platform, arch, libc }
    }

    pub fn to_bytes(self) -> [u8; PLATFORM_METADATA_LEN] {
        [self.platform as u8, self.arch as u8, self.libc as u8]
    }

    pub fn from_bytes(bytes: [u8; PLATFORM_METADATA_LEN]) -> Result<Self, BinjectError> {
        Ok(Self {
            platform: Platform::try_from(bytes[0])?,
            arch: Arch::try_from(bytes[1])?,
            libc: Libc::try_from(bytes[2])?,
        })
    }
}

/// Hash used to derive the cache key from the compressed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKeyHash {
    /// First 8 bytes of SHA-512.
    Sha512,
    /// 64-bit FNV-1a.
    Fnv1a,
}

impl CacheKeyHash {
    /// SHA-512 on macOS hosts, FNV-1a elsewhere.
    pub fn native() -> Self {
        if cfg!(target_os = "macos") {
            CacheKeyHash::Sha512
        } else {
            CacheKeyHash::Fnv1a
        }
    }
}

impl fmt::Display for CacheKeyHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKeyHash::Sha512 => f.write_str("sha512"),
            CacheKeyHash::Fnv1a => f.write_str("fnv1a"),
        }
    }
}

impl FromStr for CacheKeyHash {
    type Err = BinjectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha512" => Ok(CacheKeyHash::Sha512),
            "fnv1a" => Ok(CacheKeyHash::Fnv1a),
            other => Err(BinjectError::InvalidArgs(format!("unknown cache key hash {:?}", other))),
        }
    }
}

fn fnv1a_64(data: &[u8]) -> u64 {
    data.iter().fold(FNV_OFFSET_BASIS, |hash, &byte| {
        (hash ^ byte as u64).wrapping_mul(FNV_PRIME)
    })
}

/// 16 lowercase hex characters derived from `payload`.
pub fn cache_key(payload: &[u8], hash: CacheKeyHash) -> String {
    match hash {
        CacheKeyHash::Sha512 => {
            let digest = Sha512::digest(payload);
            hex::encode(&digest[..CACHE_KEY_LEN / 2])
        }
        CacheKeyHash::Fnv1a => format!("{:016x}", fnv1a_64(payload)),
    }
}

/// Exactly 16 lowercase hex characters.
pub fn is_valid_cache_key(key: &str) -> bool {
    key.len() == CACHE_KEY_LEN && key.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A decoded container. Borrows the payload from the buffer it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container<'a> {
    /// Offset of the marker in the scanned buffer.
    pub offset: usize,
    pub payload: &'a [u8],
    pub uncompressed_size: u64,
    pub cache_key: String,
    pub platform: PlatformMetadata,
    pub update_config: Option<UpdateConfig>,
}

/// Size of an encoded container: marker, header, config flag, optional record, payload.
pub fn encode_len(payload_len: usize, has_config: bool) -> usize {
    let config = if has_config { UPDATE_CONFIG_SIZE } else { 0 };
    MARKER_LEN + METADATA_HEADER_LEN + 1 + config + payload_len
}

impl Container<'_> {
    /// Encoded length from the marker through the end of the payload.
    pub fn encoded_len(&self) -> usize {
        encode_len(self.payload.len(), self.update_config.is_some())
    }

    /// Byte range of this container within the buffer it was decoded from.
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset..self.offset + self.encoded_len()
    }
}

/// Build a container around an already-compressed payload.
pub fn encode(
    payload: &[u8],
    uncompressed_size: u64,
    platform: PlatformMetadata,
    update_config: Option<&UpdateConfig>,
    hash: CacheKeyHash,
) -> Result<Vec<u8>> {
    if payload.is_empty() {
        return Err(BinjectError::CompressionFailed("compressed payload is empty".into()).into());
    }
    let compressed_size = payload.len() as u64;
    for (what, size) in [("compressed", compressed_size), ("uncompressed", uncompressed_size)] {
        if size == 0 || size > MAX_PAYLOAD_SIZE {
            return Err(BinjectError::CompressionFailed(format!(
                "{} size {} outside 1..={}",
                what, size, MAX_PAYLOAD_SIZE
            ))
            .into());
        }
    }

    let config = update_config.map(UpdateConfig::to_bytes).transpose()?;
    let config_len = config.as_ref().map_or(0, Vec::len);
    let total = (MARKER_LEN + METADATA_HEADER_LEN + 1 + config_len)
        .checked_add(payload.len())
        .ok_or_else(|| BinjectError::CompressionFailed("container size overflows".into()))?;

    let key = cache_key(payload, hash);
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&marker());
    out.extend_from_slice(&compressed_size.to_le_bytes());
    out.extend_from_slice(&uncompressed_size.to_le_bytes());
    out.extend_from_slice(key.as_bytes());
    out.extend_from_slice(&platform.to_bytes());
    match config {
        Some(config) => {
            out.push(1);
            out.extend_from_slice(&config);
        }
        None => out.push(0),
    }
    out.extend_from_slice(payload);

    debug_assert_eq!(out.len(), total);
    Ok(out)
}

fn corrupt(msg: String) -> anyhow::Error {
    BinjectError::DecompressionFailed(msg).into()
}

/// Find and parse the first container in `bytes`.
///
/// `Ok(None)` means there is no marker at all, which is the ordinary answer for
/// an uncompressed binary. A marker followed by a bad header is an error.
pub fn decode(bytes: &[u8]) -> Result<Option<Container<'_>>> {
    let Some(offset) = find_bytes(bytes, &marker()) else {
        return Ok(None);
    };
    let header = &bytes[offset + MARKER_LEN..];
    if header.len() < METADATA_HEADER_LEN + 1 {
        return Err(corrupt(format!("truncated header ({} bytes after marker)", header.len())));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&header[0..8]);
    let compressed_size = u64::from_le_bytes(word);
    word.copy_from_slice(&header[8..16]);
    let uncompressed_size = u64::from_le_bytes(word);
    for (what, size) in [("compressed", compressed_size), ("uncompressed", uncompressed_size)] {
        if size == 0 || size > MAX_PAYLOAD_SIZE {
            return Err(corrupt(format!("{} size {} outside 1..={}", what, size, MAX_PAYLOAD_SIZE)));
        }
    }

    let key = &header[SIZE_HEADER_LEN..SIZE_HEADER_LEN + CACHE_KEY_LEN];
    let cache_key = std::str::from_utf8(key)
        .ok()
        .filter(|k| is_valid_cache_key(k))
        .ok_or_else(|| corrupt(format!("cache key {:02x?} is not 16 lowercase hex characters", key)))?
        .to_string();

    let meta_at = SIZE_HEADER_LEN + CACHE_KEY_LEN;
    let platform =
        PlatformMetadata::from_bytes([header[meta_at], header[meta_at + 1], header[meta_at + 2]])?;

    let mut at = METADATA_HEADER_LEN;
    let update_config = match header[at] {
        0 => {
            at += 1;
            None
        }
        1 => {
            at += 1;
            let record = header
                .get(at..at + UPDATE_CONFIG_SIZE)
                .ok_or_else(|| corrupt("truncated update config".into()))?;
            at += UPDATE_CONFIG_SIZE;
            Some(UpdateConfig::from_bytes(record)?)
        }
        other => return Err(corrupt(format!("invalid config flag {}", other))),
    };

    let payload = header
        .get(at..at + compressed_size as usize)
        .ok_or_else(|| {
            corrupt(format!(
                "payload needs {} bytes, only {} present",
                compressed_size,
                header.len() - at
            ))
        })?;

    Ok(Some(Container {
        offset,
        payload,
        uncompressed_size,
        cache_key,
        platform,
        update_config,
    }))
}
