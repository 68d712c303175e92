//! File input and output.
//!
//! Inputs are memory-mapped read-only. Outputs are always written to
//! `<out>.tmp.<pid>`, flushed, optionally signed, then renamed over the target,
//! so a reader never sees a half-written file. A failed write removes the temp file.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::Write;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::BinjectError;
use crate::format::Format;
use crate::signer::Signer;

/// A read-only mapping of an input file.
pub struct MappedFile {
    map: Mmap,
}

impl MappedFile {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(BinjectError::FileNotFound(path.to_path_buf()).into());
        }
        let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
        let len = file
            .metadata()
            .with_context(|| format!("failed to stat {}", path.display()))?
            .len();
        if len == 0 {
            return Err(BinjectError::InvalidFormat(format!("{} is empty", path.display())).into());
        }
        // SAFETY: the mapping is read-only and dropped before any write to the same path.
        let map = unsafe { Mmap::map(&file) }.with_context(|| format!("failed to map {}", path.display()))?;
        debug!("mapped {} ({} bytes)", path.display(), map.len());
        Ok(Self { map })
    }
}

impl Deref for MappedFile {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.map
    }
}

/// Read a whole file into memory for mutation.
pub fn read_binary(path: &Path) -> Result<Vec<u8>> {
    Ok(MappedFile::open(path)?.to_vec())
}

/// Read a resource or payload file. Unlike [`read_binary`], empty files are allowed.
pub fn read_input(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(BinjectError::FileNotFound(path.to_path_buf()).into());
    }
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

/// `<path>.tmp.<pid>`
pub fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(format!(".tmp.{}", std::process::id()));
    PathBuf::from(name)
}

fn write_failed(path: &Path, err: std::io::Error) -> anyhow::Error {
    BinjectError::WriteFailed(format!("{}: {}", path.display(), err)).into()
}

fn write_synced(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    let mut file = File::create(path).map_err(|e| write_failed(path, e))?;
    file.write_all(data).map_err(|e| write_failed(path, e))?;
    file.sync_all().map_err(|e| write_failed(path, e))?;
    drop(file);

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| write_failed(path, e))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

fn write_atomic(path: &Path, data: &[u8], mode: u32, finish: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| write_failed(parent, e))?;
    }

    let tmp = temp_path(path);
    let result = write_synced(&tmp, data, mode)
        .and_then(|()| finish(&tmp))
        .and_then(|()| fs::rename(&tmp, path).map_err(|e| write_failed(path, e)));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Write an executable (mode 0755), signing the temp file before it is renamed into place.
pub fn write_executable(path: &Path, data: &[u8], format: Format, signer: &dyn Signer) -> Result<()> {
    write_atomic(path, data, 0o755, |tmp| signer.sign(tmp, format))?;
    info!("wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}

/// Write a plain data file (mode 0644).
pub fn write_data(path: &Path, data: &[u8]) -> Result<()> {
    write_atomic(path, data, 0o644, |_| Ok(()))?;
    debug!("wrote {} ({} bytes)", path.display(), data.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::NoopSigner;

    struct FailingSigner;

    impl Signer for FailingSigner {
        fn name(&self) -> &'static str {
            "failing"
        }

        fn sign(&self, _path: &Path, _format: Format) -> Result<()> {
            anyhow::bail!("signing refused")
        }
    }

    #[test]
    fn writes_through_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/dir/app");
        write_executable(&out, b"\x7fELF....", Format::Elf, &NoopSigner).unwrap();

        assert_eq!(fs::read(&out).unwrap(), b"\x7fELF....");
        assert!(!temp_path(&out).exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(fs::metadata(&out).unwrap().permissions().mode() & 0o777, 0o755);
        }
    }

    #[test]
    fn failed_sign_leaves_target_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("app");
        fs::write(&out, b"original").unwrap();

        assert!(write_executable(&out, b"new", Format::MachO, &FailingSigner).is_err());
        assert_eq!(fs::read(&out).unwrap(), b"original");
        assert!(!temp_path(&out).exists());
    }

    #[test]
    fn missing_and_empty_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let err = MappedFile::open(&dir.path().join("nope")).err().unwrap();
        assert_eq!(crate::error::exit_code(&err), crate::error::FILE_NOT_FOUND);

        let empty = dir.path().join("empty");
        fs::write(&empty, b"").unwrap();
        assert!(MappedFile::open(&empty).is_err());
    }
}
