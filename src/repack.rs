//! Rebuild a decompressor stub around a new compressed payload.
//!
//! The container is re-derived from the payload every time, so the cache key
//! always matches the bytes that ship; nothing is carried over from the old stub.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::backend::{backend_for, Resource};
use crate::container::{self, CacheKeyHash, Container, PlatformMetadata};
use crate::context::Context;
use crate::fileio::{read_binary, read_input, write_executable};
use crate::format::{detect_format, Format};
use crate::records::UpdateConfig;

#[derive(Debug, Clone)]
pub struct RepackRequest<'a> {
    pub stub: &'a Path,
    pub payload: &'a Path,
    pub uncompressed_size: u64,
    pub platform: PlatformMetadata,
    pub update_config: Option<UpdateConfig>,
    pub output: &'a Path,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepackReport {
    pub format: Format,
    pub cache_key: String,
    pub container_size: usize,
    pub output_size: usize,
}

/// Embed `payload` into an in-memory stub image. Pure: same inputs, same bytes.
pub fn repack_image(
    stub: Vec<u8>,
    payload: &[u8],
    uncompressed_size: u64,
    platform: PlatformMetadata,
    update_config: Option<&UpdateConfig>,
    hash: CacheKeyHash,
) -> Result<(Format, Vec<u8>)> {
    let section = container::encode(payload, uncompressed_size, platform, update_config, hash)?;
    let format = detect_format(&stub);
    let image = backend_for(format)?.embed_container(stub, &section)?;
    Ok((format, image))
}

pub fn repack(ctx: &Context, request: &RepackRequest) -> Result<RepackReport> {
    let payload = read_input(request.payload)?;
    let stub = read_binary(request.stub)?;
    info!(
        "repacking {} with {} ({} bytes compressed, {} uncompressed)",
        request.stub.display(),
        request.payload.display(),
        payload.len(),
        request.uncompressed_size
    );

    let (format, image) = repack_image(
        stub,
        &payload,
        request.uncompressed_size,
        request.platform,
        request.update_config.as_ref(),
        ctx.cache_key_hash,
    )?;
    write_executable(request.output, &image, format, ctx.signer.as_ref())?;

    let cache_key = container::cache_key(&payload, ctx.cache_key_hash);
    info!("cache key {}", cache_key);
    Ok(RepackReport {
        format,
        cache_key,
        container_size: container::encode_len(payload.len(), request.update_config.is_some()),
        output_size: image.len(),
    })
}

/// The container embedded in a stub, if any.
///
/// Looks in the format's designated location first, then falls back to
/// scanning the whole file. `Ok(None)` means the binary is not compressed.
pub fn probe(image: &[u8]) -> Result<Option<Container<'_>>> {
    if let Ok(backend) = backend_for(detect_format(image)) {
        if let Some((_, data)) = backend.find(image, Resource::Pressed)? {
            if let Some(found) = container::decode(data)? {
                return Ok(Some(found));
            }
        }
    }
    container::decode(image)
}
