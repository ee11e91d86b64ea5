//! The [CacheKey] names one resolvable file: a variant of an asset inside a pack.
use std::fmt;

use serde::{Deserialize, Serialize};

/// `(pack_id, asset_id, variant_id)`.
///
/// The same key is used by the resolver, both transfer queues and the disk cache, and it travels over the wire in
/// peer streaming messages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    pub pack_id: String,
    pub asset_id: String,
    pub variant_id: String,
}

impl CacheKey {
    pub fn new(
        pack_id: impl Into<String>,
        asset_id: impl Into<String>,
        variant_id: impl Into<String>,
    ) -> CacheKey {
        CacheKey {
            pack_id: pack_id.into(),
            asset_id: asset_id.into(),
            variant_id: variant_id.into(),
        }
    }

    /// Whether every component may be used as a single path segment.
    ///
    /// Keys arriving from peers are untrusted, and the disk cache lays files out by key, so anything which could
    /// escape the cache root is rejected before touching the filesystem.
    pub fn is_path_safe(&self) -> bool {
        [&self.pack_id, &self.asset_id, &self.variant_id]
            .iter()
            .all(|c| is_safe_segment(c))
    }
}

pub(crate) fn is_safe_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && !segment.starts_with('.')
        && !segment.contains(|c: char| c == '/' || c == '\\' || c == ':' || c.is_control())
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.pack_id, self.asset_id, self.variant_id)
    }
}
