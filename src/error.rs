//! Error taxonomy.
//!
//! Functions throughout the crate return `anyhow::Result`. Failures that map to a
//! specific exit code are raised as a [`BinjectError`] somewhere in the chain, and
//! [`exit_code`] digs it back out at the top.

use std::path::PathBuf;
use thiserror::Error;

pub const OK: i32 = 0;
pub const ERROR: i32 = -1;
pub const INVALID_ARGS: i32 = -2;
pub const FILE_NOT_FOUND: i32 = -3;
pub const INVALID_FORMAT: i32 = -4;
pub const SECTION_EXISTS: i32 = -5;
pub const SECTION_NOT_FOUND: i32 = -6;
pub const COMPRESSION_FAILED: i32 = -7;
pub const DECOMPRESSION_FAILED: i32 = -8;
pub const WRITE_FAILED: i32 = -9;

#[derive(Debug, Error)]
pub enum BinjectError {
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// Malformed headers, out-of-bounds offsets, unsupported layouts.
    #[error("invalid binary format: {0}")]
    InvalidFormat(String),

    #[error("section already exists: {0}")]
    SectionExists(String),

    #[error("section not found: {0}")]
    SectionNotFound(String),

    /// The container could not be built from the given payload.
    #[error("cannot build container: {0}")]
    CompressionFailed(String),

    /// A container was found but its header is corrupt.
    #[error("corrupt container: {0}")]
    DecompressionFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),
}

impl BinjectError {
    pub fn code(&self) -> i32 {
        match self {
            BinjectError::InvalidArgs(_) => INVALID_ARGS,
            BinjectError::FileNotFound(_) => FILE_NOT_FOUND,
            BinjectError::InvalidFormat(_) => INVALID_FORMAT,
            BinjectError::SectionExists(_) => SECTION_EXISTS,
            BinjectError::SectionNotFound(_) => SECTION_NOT_FOUND,
            BinjectError::CompressionFailed(_) => COMPRESSION_FAILED,
            BinjectError::DecompressionFailed(_) => DECOMPRESSION_FAILED,
            BinjectError::WriteFailed(_) => WRITE_FAILED,
        }
    }
}

/// Shorthand for the most common failure: a header that does not add up.
pub fn invalid_format(msg: impl Into<String>) -> anyhow::Error {
    BinjectError::InvalidFormat(msg.into()).into()
}

/// Map an error chain to the process exit code.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<BinjectError>())
        .map_or(ERROR, BinjectError::code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_code_survives_context() {
        let err = Err::<(), _>(BinjectError::SectionNotFound("NODE_SEA_BLOB".into()))
            .context("while extracting")
            .unwrap_err();
        assert_eq!(exit_code(&err), SECTION_NOT_FOUND);
    }

    #[test]
    fn unclassified_errors_are_generic() {
        let err = anyhow::anyhow!("boom");
        assert_eq!(exit_code(&err), ERROR);
    }
}
