//! Per-operation configuration.
//!
//! Built once in `main` from the command line and environment, then passed by
//! reference into every operation. Nothing below reads the environment itself.

use crate::container::CacheKeyHash;
use crate::signer::{self, NoopSigner, Signer};

pub struct Context {
    pub signer: Box<dyn Signer>,
    pub cache_key_hash: CacheKeyHash,
}

impl Context {
    pub fn new(signer: Box<dyn Signer>, cache_key_hash: CacheKeyHash) -> Self {
        Self { signer, cache_key_hash }
    }

    /// Host defaults: native signer and native cache-key hash.
    pub fn native() -> Self {
        Self::new(signer::native(), CacheKeyHash::native())
    }
}

impl Default for Context {
    /// No signing, FNV-1a cache keys. Deterministic on every host.
    fn default() -> Self {
        Self::new(Box::new(NoopSigner), CacheKeyHash::Fnv1a)
    }
}

/// Interpret the `DEBUG` environment variable.
pub fn debug_enabled(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") | Some("0") => false,
        Some(v) => !v.eq_ignore_ascii_case("false"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_env_values() {
        assert!(!debug_enabled(None));
        assert!(!debug_enabled(Some("")));
        assert!(!debug_enabled(Some("0")));
        assert!(!debug_enabled(Some("FALSE")));
        assert!(debug_enabled(Some("1")));
        assert!(debug_enabled(Some("binject:*")));
    }
}
