//! Code signing after a write.
//!
//! Mutating a Mach-O invalidates its signature, and arm64 macOS refuses to run
//! unsigned code. The write path hands the temp file to a [`Signer`] before the
//! final rename so the target path is never observed unsigned.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info};

use crate::error::BinjectError;
use crate::format::Format;

pub trait Signer {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Sign the file at `path` in place. Formats the signer does not handle are left alone.
    fn sign(&self, path: &Path, format: Format) -> Result<()>;
}

/// Signs nothing. Used off macOS and when signing is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn name(&self) -> &'static str {
        "none"
    }

    fn sign(&self, path: &Path, format: Format) -> Result<()> {
        debug!("skipping signature for {} ({})", path.display(), format);
        Ok(())
    }
}

/// Ad-hoc signing through Apple's `codesign` tool.
#[derive(Debug, Clone)]
pub struct CodesignSigner {
    program: PathBuf,
}

impl Default for CodesignSigner {
    fn default() -> Self {
        Self {
            program: PathBuf::from("/usr/bin/codesign"),
        }
    }
}

impl CodesignSigner {
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Signer for CodesignSigner {
    fn name(&self) -> &'static str {
        "codesign"
    }

    fn sign(&self, path: &Path, format: Format) -> Result<()> {
        if format != Format::MachO {
            return NoopSigner.sign(path, format);
        }
        if !self.program.exists() {
            return Err(BinjectError::WriteFailed(format!(
                "{} not found; install the Xcode command line tools or pass --no-sign",
                self.program.display()
            ))
            .into());
        }

        debug!("running {} --sign - --force {}", self.program.display(), path.display());
        let output = Command::new(&self.program)
            .args(["--sign", "-", "--force"])
            .arg(path)
            .output()
            .with_context(|| format!("failed to run {}", self.program.display()))?;
        if !output.status.success() {
            return Err(BinjectError::WriteFailed(format!(
                "codesign exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        info!("ad-hoc signed {}", path.display());
        Ok(())
    }
}

/// The signer appropriate for the host.
pub fn native() -> Box<dyn Signer> {
    if cfg!(target_os = "macos") {
        Box::new(CodesignSigner::default())
    } else {
        Box::new(NoopSigner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codesign_ignores_other_formats() {
        let signer = CodesignSigner::with_program("/nonexistent/codesign");
        assert!(signer.sign(Path::new("/tmp/x"), Format::Elf).is_ok());
        assert!(signer.sign(Path::new("/tmp/x"), Format::Pe).is_ok());
    }

    #[test]
    fn missing_tool_is_a_write_failure() {
        let signer = CodesignSigner::with_program("/nonexistent/codesign");
        let err = signer.sign(Path::new("/tmp/x"), Format::MachO).unwrap_err();
        assert_eq!(crate::error::exit_code(&err), crate::error::WRITE_FAILED);
    }
}
