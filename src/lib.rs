//! Binary injection and compressed-stub repacking.
//!
//! This library provides the core components for the `binject` tool.
//! It is organized into several modules:
//! - `format`: Executable format detection.
//! - `container`: The compressed-payload container embedded in stubs.
//! - `records`: Fixed-size update and VFS config records.
//! - `backend`: Per-format (ELF, Mach-O, PE) mutation and lookup.
//! - `inject`: SEA/VFS injection plus list, extract and verify.
//! - `repack`: Stub rebuilding around a new payload.
//! - `fileio`, `signer`, `cache`: Output writing, code signing and cache paths.
//! - `config`, `context`, `error`: CLI, per-operation settings and error codes.

pub mod backend;
pub mod cache;
pub mod config;
pub mod container;
pub mod context;
pub mod error;
pub mod fileio;
pub mod format;
pub mod fuse;
pub mod inject;
pub mod records;
pub mod repack;
pub mod signer;
pub mod utils;
