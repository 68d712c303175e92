//! Command-line interface.
//!
//! Everything here is plain argument parsing with `clap`; the conversion helpers
//! turn parsed arguments into the option types the library operations take.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::backend::Resource;
use crate::container::{Arch, CacheKeyHash, Libc, Platform, PlatformMetadata};
use crate::inject::{InjectOptions, VfsSource};
use crate::records::{update::normalize_prompt_default, UpdateConfig, VfsMode};

/// Inject resources into executables and rebuild compressed stubs.
///
/// Works on ELF, Mach-O and PE files.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info", help = "Set the logging level")]
    pub log_level: String,

    /// Skip ad-hoc signing of Mach-O outputs
    #[arg(long, global = true)]
    pub no_sign: bool,

    /// Hash used for cache keys (sha512, fnv1a); defaults to the host's native choice
    #[arg(long, global = true)]
    pub cache_key_hash: Option<CacheKeyHash>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Inject a SEA blob and optionally a VFS archive
    Inject(InjectArgs),
    /// List the resources present in an executable
    List {
        executable: PathBuf,
    },
    /// Write one resource out to a file
    Extract {
        #[arg(short = 'e', long)]
        executable: PathBuf,
        #[command(flatten)]
        resource: ResourceArg,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Check that a resource is present and well formed
    Verify {
        #[arg(short = 'e', long)]
        executable: PathBuf,
        #[command(flatten)]
        resource: ResourceArg,
    },
    /// Embed a compressed payload into a decompressor stub
    Repack(RepackArgs),
    /// Print where a stub extracts its payload
    CachePath {
        #[arg(long)]
        cache_key: String,
        #[arg(long)]
        name: String,
        /// Also print the metadata file written beside the binary
        #[arg(long)]
        metadata: bool,
    },
}

#[derive(Args, Debug)]
pub struct InjectArgs {
    #[arg(short = 'e', long)]
    pub executable: PathBuf,

    #[arg(short, long)]
    pub output: PathBuf,

    /// SEA blob to embed
    #[arg(long)]
    pub sea: Option<PathBuf>,

    /// VFS archive to embed
    #[arg(long, conflicts_with = "vfs_compat")]
    pub vfs: Option<PathBuf>,

    /// Embed an empty VFS blob
    #[arg(long)]
    pub vfs_compat: bool,

    /// How the runtime mounts the VFS (on-disk, in-memory)
    #[arg(long, default_value = "on-disk")]
    pub vfs_mode: VfsMode,

    /// Mount prefix recorded for the VFS
    #[arg(long)]
    pub vfs_prefix: Option<String>,

    /// Source recorded for the VFS; defaults to the archive path
    #[arg(long)]
    pub vfs_source: Option<String>,

    /// Inject into a compressed stub as if it were a plain binary
    #[arg(long)]
    pub skip_repack: bool,
}

impl InjectArgs {
    pub fn options(&self) -> InjectOptions {
        let vfs = if self.vfs_compat {
            Some(VfsSource::Compat)
        } else {
            self.vfs.clone().map(VfsSource::Archive)
        };
        InjectOptions {
            sea: self.sea.clone(),
            vfs,
            vfs_mode: self.vfs_mode,
            vfs_source: self.vfs_source.clone(),
            vfs_prefix: self.vfs_prefix.clone(),
            skip_repack: self.skip_repack,
        }
    }
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
pub struct ResourceArg {
    #[arg(long)]
    pub sea: bool,
    #[arg(long)]
    pub vfs: bool,
    #[arg(long)]
    pub vfs_config: bool,
    #[arg(long)]
    pub pressed: bool,
}

impl ResourceArg {
    pub fn resource(&self) -> Resource {
        if self.sea {
            Resource::Sea
        } else if self.vfs {
            Resource::Vfs
        } else if self.vfs_config {
            Resource::VfsConfig
        } else {
            Resource::Pressed
        }
    }
}

#[derive(Args, Debug)]
pub struct RepackArgs {
    #[arg(long)]
    pub stub: PathBuf,

    /// Already-compressed payload
    #[arg(long)]
    pub payload: PathBuf,

    #[arg(long)]
    pub uncompressed_size: u64,

    #[arg(short, long)]
    pub output: PathBuf,

    /// Target platform (linux, darwin, win32); defaults to the host
    #[arg(long)]
    pub platform: Option<Platform>,

    /// Target architecture (x64, arm64, ia32, arm); defaults to the host
    #[arg(long)]
    pub arch: Option<Arch>,

    /// Target libc (glibc, musl, none); defaults to the host
    #[arg(long)]
    pub libc: Option<Libc>,

    #[arg(long)]
    pub update_url: Option<String>,
    #[arg(long)]
    pub update_binname: Option<String>,
    #[arg(long)]
    pub update_tag: Option<String>,
    #[arg(long)]
    pub update_command: Option<String>,
    #[arg(long)]
    pub update_skip_env: Option<String>,
    #[arg(long)]
    pub update_prompt: bool,
    /// Answer assumed when the user just presses enter (y, n)
    #[arg(long)]
    pub update_prompt_default: Option<String>,
    /// Milliseconds between update checks
    #[arg(long)]
    pub update_interval: Option<i64>,
    /// Milliseconds between update notifications
    #[arg(long)]
    pub update_notify_interval: Option<i64>,
    #[arg(long)]
    pub node_version: Option<String>,
}

impl RepackArgs {
    pub fn platform(&self) -> PlatformMetadata {
        let host = PlatformMetadata::host();
        PlatformMetadata {
            platform: self.platform.unwrap_or(host.platform),
            arch: self.arch.unwrap_or(host.arch),
            libc: self.libc.unwrap_or(host.libc),
        }
    }

    /// The SMFG record, when any update option was given.
    pub fn update_config(&self) -> Option<UpdateConfig> {
        let any = self.update_url.is_some()
            || self.update_binname.is_some()
            || self.update_tag.is_some()
            || self.update_command.is_some()
            || self.update_skip_env.is_some()
            || self.update_prompt
            || self.update_prompt_default.is_some()
            || self.update_interval.is_some()
            || self.update_notify_interval.is_some()
            || self.node_version.is_some();
        if !any {
            return None;
        }

        let mut config = UpdateConfig::default();
        let strings = [
            (&self.update_url, &mut config.url),
            (&self.update_binname, &mut config.binname),
            (&self.update_tag, &mut config.tag),
            (&self.update_command, &mut config.command),
            (&self.update_skip_env, &mut config.skip_env),
            (&self.node_version, &mut config.node_version),
        ];
        for (arg, field) in strings {
            if let Some(value) = arg {
                *field = value.clone();
            }
        }
        config.prompt = self.update_prompt;
        if let Some(answer) = &self.update_prompt_default {
            config.prompt_default = normalize_prompt_default(answer);
        }
        if let Some(ms) = self.update_interval {
            config.interval = ms;
        }
        if let Some(ms) = self.update_notify_interval {
            config.notify_interval = ms;
        }
        Some(config)
    }
}
