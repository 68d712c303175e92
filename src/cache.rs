//! Where decompressed binaries are cached.
//!
//! Stubs extract to `<base>/<cache_key>/<binary_name>` and drop a
//! `.dlx-metadata.json` beside it. The base directory resolves, in order, from
//! `SOCKET_DLX_DIR`, `SOCKET_HOME/_dlx`, `$HOME/.socket/_dlx`, then the temp dir.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::container::is_valid_cache_key;
use crate::error::BinjectError;

pub const DLX_DIR_NAME: &str = "_dlx";
pub const METADATA_FILE_NAME: &str = ".dlx-metadata.json";

/// The environment variables cache resolution looks at, captured once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheEnv {
    pub dlx_dir: Option<PathBuf>,
    pub socket_home: Option<PathBuf>,
    pub home: Option<PathBuf>,
}

fn non_empty(value: Option<std::ffi::OsString>) -> Option<PathBuf> {
    value.filter(|v| !v.is_empty()).map(PathBuf::from)
}

impl CacheEnv {
    pub fn from_process() -> Self {
        Self {
            dlx_dir: non_empty(std::env::var_os("SOCKET_DLX_DIR")),
            socket_home: non_empty(std::env::var_os("SOCKET_HOME")),
            home: non_empty(std::env::var_os("HOME")).or_else(|| non_empty(std::env::var_os("USERPROFILE"))),
        }
    }

    pub fn base_dir(&self) -> PathBuf {
        if let Some(dir) = &self.dlx_dir {
            return dir.clone();
        }
        if let Some(home) = &self.socket_home {
            return home.join(DLX_DIR_NAME);
        }
        let root = self.home.clone().unwrap_or_else(std::env::temp_dir);
        root.join(".socket").join(DLX_DIR_NAME)
    }
}

/// `<base>/<cache_key>`
pub fn entry_dir(base: &Path, cache_key: &str) -> Result<PathBuf> {
    if !is_valid_cache_key(cache_key) {
        return Err(
            BinjectError::InvalidArgs(format!("cache key {:?} is not 16 lowercase hex characters", cache_key)).into(),
        );
    }
    Ok(base.join(cache_key))
}

/// `<base>/<cache_key>/<binary_name>`
pub fn binary_path(base: &Path, cache_key: &str, binary_name: &str) -> Result<PathBuf> {
    let invalid = binary_name.is_empty()
        || binary_name == "."
        || binary_name == ".."
        || binary_name.contains(['/', '\\']);
    if invalid {
        return Err(BinjectError::InvalidArgs(format!("invalid binary name {:?}", binary_name)).into());
    }
    Ok(entry_dir(base, cache_key)?.join(binary_name))
}

/// `<base>/<cache_key>/.dlx-metadata.json`
pub fn metadata_path(base: &Path, cache_key: &str) -> Result<PathBuf> {
    Ok(entry_dir(base, cache_key)?.join(METADATA_FILE_NAME))
}
