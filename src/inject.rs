//! SEA/VFS injection and the read-only `list`, `extract` and `verify` operations.
//!
//! Injection reads the target once, applies the whole batch through one backend
//! call and writes once.

use anyhow::{Context as _, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::backend::{backend_for, InjectBatch, Resource, ResourceInfo};
use crate::cache::{self, CacheEnv};
use crate::container;
use crate::context::Context;
use crate::error::BinjectError;
use crate::fileio::{self, read_binary, read_input, write_data, write_executable};
use crate::format::{detect_format, Format};
use crate::records::{VfsConfig, VfsMode};
use crate::repack::probe;

/// Where the VFS blob comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VfsSource {
    /// Archive file to embed.
    Archive(PathBuf),
    /// Embed a 0-byte blob; the runtime only needs to see the slot.
    Compat,
}

#[derive(Debug, Clone, Default)]
pub struct InjectOptions {
    pub sea: Option<PathBuf>,
    pub vfs: Option<VfsSource>,
    pub vfs_mode: VfsMode,
    /// Recorded in the SVFG record; defaults to the archive path.
    pub vfs_source: Option<String>,
    pub vfs_prefix: Option<String>,
    /// Treat a compressed stub as an ordinary binary.
    pub skip_repack: bool,
}

impl InjectOptions {
    fn validate(&self) -> Result<()> {
        if self.sea.is_none() && self.vfs.is_none() {
            return Err(BinjectError::InvalidArgs("inject needs --sea and/or --vfs".into()).into());
        }
        if self.vfs.is_some() && self.sea.is_none() {
            return Err(BinjectError::InvalidArgs("--vfs must be injected together with --sea".into()).into());
        }
        Ok(())
    }

    /// The SVFG record to inject next to the VFS blob.
    pub fn vfs_config(&self) -> Option<VfsConfig> {
        let vfs = self.vfs.as_ref()?;
        let defaults = VfsConfig::default();
        let (mode, source) = match vfs {
            VfsSource::Compat => (VfsMode::Compat, String::new()),
            VfsSource::Archive(path) => (
                self.vfs_mode,
                self.vfs_source
                    .clone()
                    .unwrap_or_else(|| path.display().to_string()),
            ),
        };
        Some(VfsConfig {
            mode,
            source,
            prefix: self.vfs_prefix.clone().unwrap_or(defaults.prefix),
        })
    }
}

/// What an injection did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectReport {
    pub format: Format,
    pub injected: Vec<(Resource, usize)>,
}

fn read_resource(path: &Path, what: &str) -> Result<Vec<u8>> {
    let data = read_input(path).with_context(|| format!("failed to read {}", what))?;
    if data.is_empty() {
        return Err(BinjectError::InvalidArgs(format!("{} {} is empty", what, path.display())).into());
    }
    Ok(data)
}

/// Where a compressed stub's payload would have been extracted.
fn cached_extraction(exe: &Path, cache_key: &str) -> Option<PathBuf> {
    let name = exe.file_name()?.to_str()?;
    cache::binary_path(&CacheEnv::from_process().base_dir(), cache_key, name).ok()
}

/// Inject SEA and/or VFS blobs from `options` into `exe`, writing `out`.
pub fn inject_file(ctx: &Context, exe: &Path, out: &Path, options: &InjectOptions) -> Result<InjectReport> {
    options.validate()?;

    let sea = options
        .sea
        .as_deref()
        .map(|path| read_resource(path, "SEA blob"))
        .transpose()?;
    let vfs = match &options.vfs {
        Some(VfsSource::Archive(path)) => Some(read_resource(path, "VFS archive")?),
        Some(VfsSource::Compat) => Some(Vec::new()),
        None => None,
    };
    let vfs_config = options.vfs_config().map(|c| c.to_bytes()).transpose()?;

    let image = read_binary(exe)?;
    let format = detect_format(&image);
    let backend = backend_for(format)?;
    info!("injecting into {} ({})", exe.display(), format);

    if !options.skip_repack {
        if let Some(found) = probe(&image)? {
            let hint = cached_extraction(exe, &found.cache_key)
                .map(|p| format!(" (extracted copy: {})", p.display()))
                .unwrap_or_default();
            return Err(BinjectError::InvalidArgs(format!(
                "{} is a compressed stub{}; inject into the uncompressed binary and rebuild the stub with `repack`, \
                 or pass --skip-repack to inject into the stub itself",
                exe.display(),
                hint
            ))
            .into());
        }
    }

    let batch = InjectBatch {
        sea: sea.as_deref(),
        vfs: vfs.as_deref(),
        vfs_config: vfs_config.as_deref(),
    };
    let injected: Vec<(Resource, usize)> = batch.entries().iter().map(|(r, d)| (*r, d.len())).collect();
    for (resource, len) in &injected {
        debug!("{}: {} bytes", resource, len);
    }

    let output = backend.inject(image, &batch)?;
    write_executable(out, &output, format, ctx.signer.as_ref())?;
    Ok(InjectReport { format, injected })
}

/// Every known resource present in `exe`.
pub fn list(exe: &Path) -> Result<(Format, Vec<ResourceInfo>)> {
    let image = fileio::MappedFile::open(exe)?;
    let format = detect_format(&image);
    let found = backend_for(format)?.list(&image)?;
    Ok((format, found))
}

fn locate<'a>(image: &'a [u8], resource: Resource) -> Result<(String, &'a [u8])> {
    let backend = backend_for(detect_format(image))?;
    backend
        .find(image, resource)?
        .ok_or_else(|| BinjectError::SectionNotFound(format!("no {} found", resource)).into())
}

/// Trim pressed data to the container itself; sections may carry alignment padding.
fn trim_container(data: &[u8]) -> Result<&[u8]> {
    match container::decode(data)? {
        Some(found) => Ok(&data[found.range()]),
        None => Err(BinjectError::DecompressionFailed("no container marker in pressed data".into()).into()),
    }
}

/// Write one resource's bytes to `out`. Returns the number of bytes written.
pub fn extract(exe: &Path, resource: Resource, out: &Path) -> Result<usize> {
    let image = fileio::MappedFile::open(exe)?;
    let (location, data) = locate(&image, resource)?;
    let data = if resource == Resource::Pressed {
        trim_container(data)?
    } else {
        data
    };
    write_data(out, data)?;
    info!("extracted {} from {}", resource, location);
    Ok(data.len())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    pub location: String,
    pub size: usize,
    /// Cache key of the decoded container, for pressed data.
    pub cache_key: Option<String>,
    /// The decoded SVFG record, for the VFS config.
    pub vfs_config: Option<VfsConfig>,
}

/// Check a resource is present and usable.
pub fn verify(exe: &Path, resource: Resource) -> Result<VerifyReport> {
    let image = fileio::MappedFile::open(exe)?;
    let (location, data) = locate(&image, resource)?;
    if data.is_empty() && !resource.may_be_empty() {
        return Err(BinjectError::InvalidFormat(format!("{} at {} is empty", resource, location)).into());
    }

    let cache_key = if resource == Resource::Pressed {
        let found = container::decode(data)?
            .ok_or_else(|| BinjectError::DecompressionFailed("no container marker in pressed data".into()))?;
        Some(found.cache_key)
    } else {
        None
    };
    let vfs_config = if resource == Resource::VfsConfig {
        Some(VfsConfig::from_bytes(data).with_context(|| format!("{} at {} does not decode", resource, location))?)
    } else {
        None
    };
    Ok(VerifyReport {
        location,
        size: data.len(),
        cache_key,
        vfs_config,
    })
}
