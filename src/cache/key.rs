use sha2::{Digest, Sha256};
use std::fmt;

/// Identifier binding a logical request to a stored artifact.
///
/// Keys contain only hex digits, digits, underscores and `true`/`false`, so they are
/// valid file names and key-value keys as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for an optimized source image.
    pub fn for_source(url: &str, width: u32, height: u32, quality: u8, accepts_webp: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(url.as_bytes());
        let digest = hex::encode(hasher.finalize());
        Self(format!("{digest}_{quality}_{width}_{height}_{accepts_webp}"))
    }

    /// Key for a variant of the broken-image placeholder.
    pub fn for_placeholder(width: u32, height: u32, quality: u8, accepts_webp: bool) -> Self {
        Self(format!("broken_{quality}_{width}_{height}_{accepts_webp}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
