use std::path::{Path, PathBuf};
use std::sync::Arc;

use relative_path::RelativePath;

use crate::*;

/// Finds files shipped with the application under each local pack's install root.
///
/// Manifest paths are joined logically rather than through the filesystem, which keeps `..` segments from walking
/// out of the install root (and avoids canonicalize, which is unreliable on Windows for paths with relative segments
/// in the middle).  Remote packs have no install root and never resolve here.
#[derive(Clone)]
pub struct BundledFiles {
    registry: Arc<PackRegistry>,
}

/// Join `relative` under `root`, refusing results which land outside of it.
pub fn resolve_under_root(root: &Path, relative: &RelativePath) -> Option<PathBuf> {
    let absolute = relative.to_logical_path(root);
    if absolute.starts_with(root) {
        Some(absolute)
    } else {
        None
    }
}

/// A usable file is a regular, non-empty file.
pub(crate) fn usable_file(path: PathBuf) -> Option<PathBuf> {
    let meta = std::fs::metadata(&path).ok()?;
    if meta.is_file() && meta.len() > 0 {
        Some(path)
    } else {
        None
    }
}

impl BundledFiles {
    pub fn new(registry: Arc<PackRegistry>) -> BundledFiles {
        BundledFiles { registry }
    }

    pub fn model_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let lookup = self.registry.get_variant(key)?;
        let root = lookup.pack.install_root()?;
        usable_file(resolve_under_root(
            root,
            &lookup.variant.model_relative_path,
        )?)
    }

    pub fn icon_path(&self, key: &CacheKey) -> Option<PathBuf> {
        let lookup = self.registry.get_variant(key)?;
        let root = lookup.pack.install_root()?;
        usable_file(resolve_under_root(root, &lookup.variant.icon_relative_path)?)
    }
}

impl LocalSource for BundledFiles {
    fn local_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.model_path(key)
    }
}
