//! The [PackRegistry] holds validated metadata for every known pack.
//!
//! Manifests are parsed once, at registration, into strongly typed [Pack]s.  A manifest with any problem is rejected
//! as a whole; nothing about a rejected pack becomes visible.  Packs are stored behind `Arc`, so re-registering a
//! pack id swaps the entire pack at once and readers holding the old one are unaffected.
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use relative_path::{Component, RelativePath, RelativePathBuf};
use serde::Deserialize;

use crate::key::is_safe_segment;
use crate::*;

type PackMap = HashMap<String, Arc<Pack>, ahash::RandomState>;
pub type IdMap<V> = HashMap<String, V, ahash::RandomState>;

/// The name the pack tooling gives the manifest inside a pack directory.
pub const MANIFEST_FILE_NAME: &str = "manifest.json";

#[derive(Debug, Deserialize)]
struct ManifestFile {
    pack_id: String,
    display_name: String,
    version: String,
    #[serde(default)]
    base_url: Option<String>,
    assets: BTreeMap<String, ManifestAsset>,
}

#[derive(Debug, Deserialize)]
struct ManifestAsset {
    display_name: String,
    variants: BTreeMap<String, ManifestVariant>,
}

#[derive(Debug, Deserialize)]
struct ManifestVariant {
    model: String,
    icon: String,
    #[serde(default)]
    model_url: Option<String>,
    #[serde(default)]
    icon_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackOrigin {
    /// Shipped with the application; files live under the install root.
    Local { install_root: PathBuf },
    /// Known only by manifest, typically announced by the host of a session.
    Remote,
}

#[derive(Debug, Clone)]
pub struct Pack {
    pub pack_id: String,
    pub display_name: String,
    pub version: String,
    pub base_url: Option<String>,
    pub origin: PackOrigin,
    pub assets: IdMap<AssetEntry>,
}

impl Pack {
    pub fn install_root(&self) -> Option<&Path> {
        match &self.origin {
            PackOrigin::Local { install_root } => Some(install_root),
            PackOrigin::Remote => None,
        }
    }

    pub fn variant(&self, asset_id: &str, variant_id: &str) -> Option<&AssetVariant> {
        self.assets.get(asset_id)?.variants.get(variant_id)
    }
}

#[derive(Debug, Clone)]
pub struct AssetEntry {
    pub asset_id: String,
    pub display_name: String,
    pub variants: IdMap<AssetVariant>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetVariant {
    pub variant_id: String,
    pub model_relative_path: RelativePathBuf,
    pub icon_relative_path: RelativePathBuf,
    pub model_url_override: Option<String>,
    pub icon_url_override: Option<String>,
}

fn join_url(base: &str, relative: &RelativePath) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative.as_str().trim_start_matches('/')
    )
}

impl AssetVariant {
    /// The override if there is one, otherwise `base_url` joined with the model path.
    pub fn model_url(&self, base_url: Option<&str>) -> Option<String> {
        self.model_url_override
            .clone()
            .or_else(|| base_url.map(|b| join_url(b, &self.model_relative_path)))
    }

    pub fn icon_url(&self, base_url: Option<&str>) -> Option<String> {
        self.icon_url_override
            .clone()
            .or_else(|| base_url.map(|b| join_url(b, &self.icon_relative_path)))
    }

    /// Extension used for this variant's file in the disk cache.
    pub fn model_extension(&self) -> &str {
        self.model_relative_path.extension().unwrap_or("glb")
    }
}

/// A variant together with the pack it belongs to.
#[derive(Debug, Clone)]
pub struct VariantLookup {
    pub pack: Arc<Pack>,
    pub variant: AssetVariant,
}

impl VariantLookup {
    pub fn model_url(&self) -> Option<String> {
        self.variant.model_url(self.pack.base_url.as_deref())
    }
}

fn check_id(field: &'static str, id: &str) -> Result<(), ManifestError> {
    if is_safe_segment(id) {
        Ok(())
    } else {
        Err(ManifestError::InvalidId {
            field,
            id: id.to_string(),
        })
    }
}

/// Parse a relative path, refusing anything that would normalize to somewhere above the pack root.
fn check_path(asset_id: &str, path: &str) -> Result<RelativePathBuf, ManifestError> {
    let invalid = || ManifestError::InvalidPath {
        asset_id: asset_id.to_string(),
        path: path.to_string(),
    };
    if path.is_empty() || path.starts_with('/') || path.contains('\\') {
        return Err(invalid());
    }
    let rel = RelativePathBuf::from(path.to_string());
    let normalized = rel.normalize();
    let escapes = matches!(normalized.components().next(), Some(Component::ParentDir));
    if normalized.as_str().is_empty() || escapes {
        return Err(invalid());
    }
    Ok(normalized)
}

fn parse_manifest(json: &str, origin: PackOrigin) -> Result<Pack, ManifestError> {
    let file: ManifestFile = serde_json::from_str(json)?;
    check_id("pack_id", &file.pack_id)?;

    let mut assets = IdMap::with_capacity_and_hasher(file.assets.len(), Default::default());
    for (asset_id, asset) in file.assets {
        check_id("asset_id", &asset_id)?;
        if asset.variants.is_empty() {
            return Err(ManifestError::NoVariants(asset_id));
        }

        let mut variants = IdMap::with_capacity_and_hasher(asset.variants.len(), Default::default());
        for (variant_id, v) in asset.variants {
            check_id("variant_id", &variant_id)?;
            let variant = AssetVariant {
                variant_id: variant_id.clone(),
                model_relative_path: check_path(&asset_id, &v.model)?,
                icon_relative_path: check_path(&asset_id, &v.icon)?,
                model_url_override: v.model_url,
                icon_url_override: v.icon_url,
            };
            variants.insert(variant_id, variant);
        }

        assets.insert(
            asset_id.clone(),
            AssetEntry {
                asset_id,
                display_name: asset.display_name,
                variants,
            },
        );
    }

    Ok(Pack {
        pack_id: file.pack_id,
        display_name: file.display_name,
        version: file.version,
        base_url: file.base_url.filter(|u| !u.is_empty()),
        origin,
        assets,
    })
}

#[derive(Default)]
pub struct PackRegistry {
    packs: RwLock<PackMap>,
}

impl PackRegistry {
    pub fn new() -> PackRegistry {
        Default::default()
    }

    fn register(&self, json: &str, origin: PackOrigin) -> Result<Arc<Pack>, ManifestError> {
        let pack = match parse_manifest(json, origin) {
            Ok(p) => Arc::new(p),
            Err(e) => {
                tracing::warn!("Rejected pack manifest: {}", e);
                return Err(e);
            }
        };

        let replaced = self
            .packs
            .write()
            .insert(pack.pack_id.clone(), pack.clone())
            .is_some();
        tracing::info!(
            pack_id = %pack.pack_id,
            assets = pack.assets.len(),
            replaced,
            "Registered pack"
        );
        Ok(pack)
    }

    /// Register a pack whose files are installed under `install_root`.
    pub fn register_local_pack(
        &self,
        manifest_json: &str,
        install_root: impl Into<PathBuf>,
    ) -> Result<Arc<Pack>, ManifestError> {
        self.register(
            manifest_json,
            PackOrigin::Local {
                install_root: install_root.into(),
            },
        )
    }

    /// Register a pack known only by its manifest.
    pub fn register_remote_pack(&self, manifest_json: &str) -> Result<Arc<Pack>, ManifestError> {
        self.register(manifest_json, PackOrigin::Remote)
    }

    /// Register the pack in `dir`, reading `dir/manifest.json`.
    pub fn load_local_pack_dir(&self, dir: &Path) -> Result<Arc<Pack>, ManifestError> {
        let json = std::fs::read_to_string(dir.join(MANIFEST_FILE_NAME))?;
        self.register_local_pack(&json, dir)
    }

    pub fn unregister_pack(&self, pack_id: &str) -> Option<Arc<Pack>> {
        self.packs.write().remove(pack_id)
    }

    pub fn get_pack(&self, pack_id: &str) -> Option<Arc<Pack>> {
        self.packs.read().get(pack_id).cloned()
    }

    pub fn get_variant(&self, key: &CacheKey) -> Option<VariantLookup> {
        let pack = self.get_pack(&key.pack_id)?;
        let variant = pack.variant(&key.asset_id, &key.variant_id)?.clone();
        Some(VariantLookup { pack, variant })
    }

    pub fn pack_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.packs.read().keys().cloned().collect();
        ids.sort();
        ids
    }
}
