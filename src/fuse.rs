//! The SEA fuse.
//!
//! Node checks a sentinel string compiled into its own image to decide whether
//! to look for an embedded application blob. Injection flips the trailing `0`
//! of that string to `1`.

use std::ops::Range;
use tracing::{debug, warn};

use crate::utils::find_bytes;

const FUSE_PREFIX: &[u8] = b"NODE_SEA_FUSE_";
const FUSE_HASH: &[u8] = b"fce680ab2cc467b6e072b8b5df1996b2";

/// The unflipped sentinel, built from parts so this binary does not carry it whole.
pub fn sentinel() -> Vec<u8> {
    let mut out = Vec::with_capacity(FUSE_PREFIX.len() + FUSE_HASH.len() + 2);
    out.extend_from_slice(std::hint::black_box(FUSE_PREFIX));
    out.extend_from_slice(std::hint::black_box(FUSE_HASH));
    out.extend_from_slice(b":0");
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuseState {
    Flipped,
    AlreadyFlipped,
    NotFound,
}

/// Flip the first unflipped fuse found inside any of `ranges`.
///
/// Ranges are file offsets (section contents for Mach-O, the whole image for the
/// others). Ranges outside the buffer are skipped.
pub fn flip_in_ranges(data: &mut [u8], ranges: &[Range<usize>]) -> FuseState {
    let needle = sentinel();
    let mut flipped_seen = false;
    for range in ranges {
        let Some(region) = data.get_mut(range.clone()) else {
            continue;
        };
        if let Some(at) = find_bytes(region, &needle) {
            let last = at + needle.len() - 1;
            region[last] = b'1';
            debug!("flipped SEA fuse at file offset 0x{:x}", range.start + at);
            return FuseState::Flipped;
        }
        if !flipped_seen {
            let prefix = &needle[..needle.len() - 1];
            flipped_seen = find_bytes(region, &[prefix, &b"1"[..]].concat()).is_some();
        }
    }
    if flipped_seen {
        debug!("SEA fuse already flipped");
        FuseState::AlreadyFlipped
    } else {
        warn!("SEA fuse not found; the runtime may not look for the injected blob");
        FuseState::NotFound
    }
}

/// Flip the fuse anywhere in the image.
pub fn flip(data: &mut [u8]) -> FuseState {
    let len = data.len();
    flip_in_ranges(data, &[0..len])
}
