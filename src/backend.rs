//! Format backends.
//!
//! This module defines the `Backend` trait, one implementation per executable format.
//! Callers resolve a backend once from the detected [`Format`] and never branch on
//! the format again.

use anyhow::Result;
use std::fmt;

use crate::error::BinjectError;
use crate::format::Format;

pub mod elf;
pub mod macho;
pub mod pe;

/// A blob this tool knows where to put in each format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Node single-executable-application blob.
    Sea,
    /// Embedded filesystem image.
    Vfs,
    /// SVFG record describing how to mount the VFS.
    VfsConfig,
    /// Compressed-stub container.
    Pressed,
}

impl Resource {
    pub const ALL: [Resource; 4] = [Resource::Sea, Resource::Vfs, Resource::VfsConfig, Resource::Pressed];

    /// ELF note owner name; also the PE resource name for the SEA/VFS blobs.
    pub fn note_name(self) -> &'static str {
        match self {
            Resource::Sea => "NODE_SEA_BLOB",
            Resource::Vfs => "SMOL_VFS_BLOB",
            Resource::VfsConfig => "SMOL_VFS_CONFIG",
            Resource::Pressed => "pressed_data",
        }
    }

    /// Mach-O `(segment, section)`.
    pub fn macho_location(self) -> (&'static str, &'static str) {
        match self {
            Resource::Sea => ("NODE_SEA", "__NODE_SEA_BLOB"),
            Resource::Vfs => ("NODE_SEA", "__SMOL_VFS_BLOB"),
            Resource::VfsConfig => ("NODE_SEA", "__SMOL_VFS_CONFIG"),
            Resource::Pressed => ("SMOL", "__PRESSED_DATA"),
        }
    }

    /// An empty VFS blob is how compat mode advertises the slot.
    pub fn may_be_empty(self) -> bool {
        self == Resource::Vfs
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Resource::Sea => "SEA blob",
            Resource::Vfs => "VFS blob",
            Resource::VfsConfig => "VFS config",
            Resource::Pressed => "compressed data",
        };
        f.pad(name)
    }
}

/// One entry in a `list` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub resource: Resource,
    /// Where it lives, in the format's own terms (note owner, `SEG,__sect`, resource name).
    pub location: String,
    pub size: u64,
}

/// Everything injected in one SEA/VFS pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct InjectBatch<'a> {
    pub sea: Option<&'a [u8]>,
    pub vfs: Option<&'a [u8]>,
    pub vfs_config: Option<&'a [u8]>,
}

impl<'a> InjectBatch<'a> {
    pub fn entries(&self) -> Vec<(Resource, &'a [u8])> {
        [
            (Resource::Sea, self.sea),
            (Resource::Vfs, self.vfs),
            (Resource::VfsConfig, self.vfs_config),
        ]
        .into_iter()
        .filter_map(|(resource, data)| data.map(|d| (resource, d)))
        .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sea.is_none() && self.vfs.is_none() && self.vfs_config.is_none()
    }
}

/// Per-format mutation and lookup.
///
/// Mutating methods take the whole image and return the rewritten image; nothing
/// touches the filesystem here.
pub trait Backend {
    fn format(&self) -> Format;

    /// Inject a batch of SEA/VFS resources in a single parse and rewrite.
    ///
    /// Existing resources with the same names are replaced. The SEA fuse is flipped
    /// only when the image did not already carry a SEA blob.
    fn inject(&self, image: Vec<u8>, batch: &InjectBatch) -> Result<Vec<u8>>;

    /// Place (or replace) the compressed container.
    fn embed_container(&self, image: Vec<u8>, container: &[u8]) -> Result<Vec<u8>>;

    /// Contents and location of a resource, if the image has it.
    fn find<'a>(&self, image: &'a [u8], resource: Resource) -> Result<Option<(String, &'a [u8])>>;

    fn list(&self, image: &[u8]) -> Result<Vec<ResourceInfo>> {
        let mut found = Vec::new();
        for resource in Resource::ALL {
            if let Some((location, data)) = self.find(image, resource)? {
                found.push(ResourceInfo {
                    resource,
                    location,
                    size: data.len() as u64,
                });
            }
        }
        Ok(found)
    }
}

/// The backend for a detected format.
pub fn backend_for(format: Format) -> Result<&'static dyn Backend> {
    match format {
        Format::Elf => Ok(&elf::ElfBackend),
        Format::MachO => Ok(&macho::MachOBackend),
        Format::Pe => Ok(&pe::PeBackend),
        Format::Unknown => Err(BinjectError::InvalidFormat("not an ELF, Mach-O or PE executable".into()).into()),
    }
}
