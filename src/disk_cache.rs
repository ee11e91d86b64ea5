//! The [DiskCache] is the persistent tier: files which were downloaded or streamed, laid out as
//! `root/{pack_id}/{asset_id}/{variant_id}.{ext}` and evicted least recently used first once the total size goes
//! over budget.
//!
//! Files are written to a temporary name in the destination directory and renamed into place, so a file under its
//! final name is always complete.  The in-memory index is guarded by a single mutex; the rename and the index update
//! happen together under it, while the bulk write happens before taking it.
//!
//! Readers which are about to use a cached file (for example to parse it) take a [CacheLease], which pins the entry
//! against eviction until dropped.  A reader which is still waiting for the file to be written takes a
//! [CacheReservation] instead; the entry is pinned the moment it lands, so nothing can evict it in between.
//!
//! Files removed behind the cache's back are noticed on lookup, and their entries forgotten.
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::bundled_files::usable_file;
use crate::lru_index::LruIndex;
use crate::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskCacheEntry {
    pub key: CacheKey,
    pub file_path: PathBuf,
    pub size_bytes: u64,
}

struct CacheIndex {
    lru: LruIndex<CacheKey, DiskCacheEntry>,
    /// Outstanding leases and reservations per key.  An entry's pin count always equals its count here.
    readers: HashMap<CacheKey, u32, ahash::RandomState>,
}

impl CacheIndex {
    /// The entry for `key` if its file is still there.  An entry whose file vanished is dropped.
    fn live(&mut self, key: &CacheKey) -> Option<Arc<DiskCacheEntry>> {
        let entry = self.lru.peek(key)?;
        if usable_file(entry.file_path.clone()).is_some() {
            return Some(entry);
        }
        tracing::warn!(%key, path = %entry.file_path.display(), "Cached file is missing; forgetting it");
        self.lru.remove(key);
        None
    }

    fn add_reader(&mut self, key: &CacheKey) {
        *self.readers.entry(key.clone()).or_insert(0) += 1;
        self.lru.pin(key);
    }

    fn remove_reader(&mut self, key: &CacheKey) {
        if let Some(count) = self.readers.get_mut(key) {
            *count -= 1;
            if *count == 0 {
                self.readers.remove(key);
            }
        }
        self.lru.unpin(key);
    }
}

pub struct DiskCache {
    root: PathBuf,
    index: Mutex<CacheIndex>,
}

/// Pins the entry for a key, whether or not it exists yet, until dropped.
pub struct CacheReservation {
    cache: Arc<DiskCache>,
    key: CacheKey,
}

impl CacheReservation {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

impl Drop for CacheReservation {
    fn drop(&mut self) {
        self.cache.index.lock().remove_reader(&self.key);
    }
}

/// Keeps a cache entry from being evicted while held.
pub struct CacheLease {
    reservation: CacheReservation,
    path: PathBuf,
}

impl CacheLease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn key(&self) -> &CacheKey {
        self.reservation.key()
    }
}

fn write_failed(key: &CacheKey, e: impl std::fmt::Display) -> AssetError {
    AssetError::CacheWriteFailed {
        key: key.clone(),
        reason: e.to_string(),
    }
}

fn dir_entries(dir: &Path) -> impl Iterator<Item = std::fs::DirEntry> {
    std::fs::read_dir(dir)
        .into_iter()
        .flatten()
        .filter_map(|e| e.ok())
}

fn segment_name(entry: &std::fs::DirEntry) -> Option<String> {
    entry.file_name().into_string().ok()
}

impl DiskCache {
    /// Open the cache at `root`, creating the directory if needed and rebuilding the index from whatever a previous
    /// run left behind.
    ///
    /// Leftover temporary files are deleted.  Entries are ordered by modification time, which is when they were
    /// written; recency of use from a previous run isn't persisted.
    pub fn open(root: impl Into<PathBuf>, max_bytes: u64) -> std::io::Result<DiskCache> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;

        let mut found = vec![];
        for pack in dir_entries(&root).filter(|e| e.path().is_dir()) {
            let pack_id = match segment_name(&pack) {
                Some(x) => x,
                None => continue,
            };
            for asset in dir_entries(&pack.path()).filter(|e| e.path().is_dir()) {
                let asset_id = match segment_name(&asset) {
                    Some(x) => x,
                    None => continue,
                };
                for file in dir_entries(&asset.path()) {
                    let path = file.path();
                    let name = match segment_name(&file) {
                        Some(x) => x,
                        None => continue,
                    };
                    if name.starts_with('.') {
                        tracing::debug!("Removing stale temporary file {}", path.display());
                        let _ = std::fs::remove_file(&path);
                        continue;
                    }
                    let meta = match file.metadata() {
                        Ok(m) if m.is_file() => m,
                        _ => continue,
                    };
                    let variant_id = match path.file_stem().and_then(|s| s.to_str()) {
                        Some(s) => s.to_string(),
                        None => continue,
                    };
                    let key = CacheKey::new(pack_id.clone(), asset_id.clone(), variant_id);
                    if !key.is_path_safe() || meta.len() == 0 {
                        continue;
                    }
                    let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                    found.push((modified, key, path, meta.len()));
                }
            }
        }

        // Oldest first, so the newest ends up most recently used.
        found.sort_by(|a, b| a.0.cmp(&b.0));
        let mut index = LruIndex::new(max_bytes);
        for (modified, key, file_path, size_bytes) in found {
            let entry = DiskCacheEntry {
                key: key.clone(),
                file_path,
                size_bytes,
            };
            index.insert_at(key, entry, size_bytes, modified);
        }
        tracing::info!(
            root = %root.display(),
            entries = index.len(),
            bytes = index.current_cost(),
            "Opened disk cache"
        );

        let cache = DiskCache {
            root,
            index: Mutex::new(CacheIndex {
                lru: index,
                readers: Default::default(),
            }),
        };
        cache.evict_if_over_budget();
        Ok(cache)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where the file for `key` lives (or would live) with the given extension.
    pub fn target_path(&self, key: &CacheKey, ext: &str) -> PathBuf {
        self.root
            .join(&key.pack_id)
            .join(&key.asset_id)
            .join(format!("{}.{}", key.variant_id, ext))
    }

    pub fn has(&self, key: &CacheKey) -> bool {
        self.index.lock().live(key).is_some()
    }

    /// The path of a completed entry whose file is still on disk.  Doesn't count as a use.
    pub fn path_for(&self, key: &CacheKey) -> Option<PathBuf> {
        self.index.lock().live(key).map(|e| e.file_path.clone())
    }

    pub fn entry(&self, key: &CacheKey) -> Option<DiskCacheEntry> {
        self.index.lock().live(key).map(|e| (*e).clone())
    }

    /// Mark an entry as used.  Returns whether it was present.
    pub fn touch(&self, key: &CacheKey) -> bool {
        self.index.lock().lru.touch(key)
    }

    pub fn last_access(&self, key: &CacheKey) -> Option<SystemTime> {
        self.index.lock().lru.last_used(key)
    }

    /// Pin an entry and mark it used, for as long as the returned lease lives.
    pub fn acquire(self: &Arc<Self>, key: &CacheKey) -> Option<CacheLease> {
        let path = {
            let mut guard = self.index.lock();
            let path = guard.live(key)?.file_path.clone();
            guard.lru.touch(key);
            guard.add_reader(key);
            path
        };
        Some(CacheLease {
            reservation: CacheReservation {
                cache: self.clone(),
                key: key.clone(),
            },
            path,
        })
    }

    /// Pin the entry for `key` for as long as the returned reservation lives, including an entry written after this
    /// call.
    pub fn reserve(self: &Arc<Self>, key: &CacheKey) -> CacheReservation {
        self.index.lock().add_reader(key);
        CacheReservation {
            cache: self.clone(),
            key: key.clone(),
        }
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.index.lock().lru.is_pinned(key)
    }

    /// Store `bytes` as the file for `key`.
    pub fn put(&self, key: &CacheKey, ext: &str, bytes: &[u8]) -> Result<PathBuf> {
        self.put_reader(key, ext, bytes)
    }

    /// Store everything `reader` produces as the file for `key`, returning the final path.
    pub fn put_reader<R: Read>(&self, key: &CacheKey, ext: &str, mut reader: R) -> Result<PathBuf> {
        if !key.is_path_safe() || !crate::key::is_safe_segment(ext) {
            return Err(write_failed(key, "key is not usable as a cache path"));
        }

        let final_path = self.target_path(key, ext);
        let dir = final_path
            .parent()
            .ok_or_else(|| write_failed(key, "no parent directory"))?;
        std::fs::create_dir_all(dir).map_err(|e| write_failed(key, e))?;

        // Temp files start with a dot, which no key segment may, so a crash can't leave one that looks like an entry.
        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(dir)
            .map_err(|e| write_failed(key, e))?;
        let size = std::io::copy(&mut reader, &mut tmp).map_err(|e| write_failed(key, e))?;
        tmp.flush().map_err(|e| write_failed(key, e))?;
        tmp.as_file().sync_all().map_err(|e| write_failed(key, e))?;
        if size == 0 {
            return Err(write_failed(key, "refusing to cache an empty file"));
        }

        let mut guard = self.index.lock();
        tmp.persist(&final_path)
            .map_err(|e| write_failed(key, e.error))?;

        let entry = DiskCacheEntry {
            key: key.clone(),
            file_path: final_path.clone(),
            size_bytes: size,
        };
        if let Some(old) = guard.lru.insert(key.clone(), entry, size) {
            // Same key under a different extension leaves the old file orphaned otherwise.
            if old.file_path != final_path {
                let _ = std::fs::remove_file(&old.file_path);
            }
        }
        let readers = guard.readers.get(key).copied().unwrap_or(0);
        guard.lru.set_pins(key, readers);

        // The entry we just wrote must survive its own eviction pass.
        guard.lru.pin(key);
        let evicted = guard.lru.evict_over_budget();
        guard.lru.unpin(key);
        Self::remove_evicted(evicted);
        drop(guard);

        tracing::debug!(%key, size, path = %final_path.display(), "Cached file");
        Ok(final_path)
    }

    fn remove_evicted(evicted: Vec<(Arc<CacheKey>, Arc<DiskCacheEntry>)>) {
        for (key, entry) in evicted {
            tracing::debug!(%key, size = entry.size_bytes, "Evicting cached file");
            if let Err(e) = std::fs::remove_file(&entry.file_path) {
                tracing::warn!(%key, "Failed to remove evicted file: {}", e);
            }
        }
    }

    /// Evict least recently used entries without readers until the cache is within budget.  Returns the evicted
    /// keys.
    pub fn evict_if_over_budget(&self) -> Vec<CacheKey> {
        let mut guard = self.index.lock();
        let evicted = guard.lru.evict_over_budget();
        let keys = evicted.iter().map(|(k, _)| (**k).clone()).collect();
        // Deleting under the lock keeps a concurrent put of the same key from having its new file removed.
        Self::remove_evicted(evicted);
        keys
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().lru.current_cost()
    }

    pub fn max_bytes(&self) -> u64 {
        self.index.lock().lru.max_cost()
    }

    pub fn len(&self) -> usize {
        self.index.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.lock().lru.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(asset: &str) -> CacheKey {
        CacheKey::new("trainers", asset, "default")
    }

    #[test]
    fn test_put_layout_and_lookup() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp_dir.path().join("cache"), 1000).unwrap();
        let k = key("pikachu");
        assert!(!cache.has(&k));

        let path = cache.put(&k, "glb", b"model bytes").unwrap();
        assert_eq!(
            path,
            tmp_dir
                .path()
                .join("cache")
                .join("trainers")
                .join("pikachu")
                .join("default.glb")
        );
        assert_eq!(std::fs::read(&path).unwrap(), b"model bytes");
        assert!(cache.has(&k));
        assert_eq!(cache.path_for(&k), Some(path.clone()));
        assert_eq!(cache.total_bytes(), 11);

        // No temporary files left lying around.
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("default.glb")]);
    }

    #[test]
    fn test_put_rejects_bad_input() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp_dir.path(), 1000).unwrap();
        let evil = CacheKey::new("..", "x", "y");
        assert!(matches!(
            cache.put(&evil, "glb", b"abc"),
            Err(AssetError::CacheWriteFailed { .. })
        ));
        assert!(matches!(
            cache.put(&key("empty"), "glb", b""),
            Err(AssetError::CacheWriteFailed { .. })
        ));
        assert!(!cache.has(&key("empty")));
        assert!(!cache.target_path(&key("empty"), "glb").exists());
    }

    #[test]
    fn test_lru_eviction_order() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp_dir.path(), 10).unwrap();

        let a = cache.put(&key("a"), "glb", b"aaaa").unwrap();
        let b = cache.put(&key("b"), "glb", b"bbbb").unwrap();
        // Using a makes b the oldest.
        assert!(cache.touch(&key("a")));
        let c = cache.put(&key("c"), "glb", b"cccc").unwrap();

        assert!(a.exists());
        assert!(!b.exists());
        assert!(c.exists());
        assert!(!cache.has(&key("b")));
        assert_eq!(cache.total_bytes(), 8);
    }

    #[test]
    fn test_active_reader_is_never_evicted() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(tmp_dir.path(), 10).unwrap());

        let a = cache.put(&key("a"), "glb", b"aaaa").unwrap();
        let lease = cache.acquire(&key("a")).unwrap();
        assert_eq!(lease.path(), a.as_path());
        assert!(cache.is_pinned(&key("a")));

        cache.put(&key("b"), "glb", b"bbbb").unwrap();
        cache.put(&key("c"), "glb", b"cccc").unwrap();

        // a is the oldest but leased, so b went instead.
        assert!(a.exists());
        assert!(cache.has(&key("a")));
        assert!(!cache.has(&key("b")));

        drop(lease);
        assert!(!cache.is_pinned(&key("a")));
        cache.put(&key("d"), "glb", b"dddd").unwrap();
        assert!(!cache.has(&key("a")));
        assert!(!a.exists());
    }

    #[test]
    fn test_reservation_pins_an_entry_written_later() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(tmp_dir.path(), 10).unwrap());

        let reservation = cache.reserve(&key("a"));
        assert!(!cache.has(&key("a")));
        let a = cache.put(&key("a"), "glb", b"aaaa").unwrap();
        assert!(cache.is_pinned(&key("a")));

        // Rewriting the entry keeps the pin; the next two puts push the cache over budget.
        cache.put(&key("a"), "glb", b"AAAA").unwrap();
        cache.put(&key("b"), "glb", b"bbbb").unwrap();
        cache.put(&key("c"), "glb", b"cccc").unwrap();
        assert!(a.exists());
        assert!(!cache.has(&key("b")));

        let lease = cache.acquire(&key("a")).unwrap();
        drop(reservation);
        assert!(cache.is_pinned(&key("a")));
        drop(lease);
        assert!(!cache.is_pinned(&key("a")));
        cache.put(&key("d"), "glb", b"dddddddd").unwrap();
        assert!(!cache.has(&key("a")));
        assert!(!a.exists());
    }

    #[test]
    fn test_missing_file_is_forgotten() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(tmp_dir.path(), 1000).unwrap());
        let a = cache.put(&key("a"), "glb", b"aaaa").unwrap();
        let b = cache.put(&key("b"), "glb", b"bbbb").unwrap();

        std::fs::remove_file(&a).unwrap();
        std::fs::write(&b, "").unwrap();
        assert_eq!(cache.path_for(&key("a")), None);
        assert!(cache.acquire(&key("b")).is_none());
        assert!(!cache.has(&key("a")));
        assert!(cache.is_empty());
        assert_eq!(cache.total_bytes(), 0);

        // Writing it again brings it back.
        cache.put(&key("a"), "glb", b"aaaa").unwrap();
        assert_eq!(cache.path_for(&key("a")), Some(a));
    }

    #[test]
    fn test_oversized_put_survives_its_own_eviction() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp_dir.path(), 4).unwrap();
        cache.put(&key("a"), "glb", b"aa").unwrap();
        let big = cache.put(&key("big"), "glb", b"0123456789").unwrap();
        assert!(big.exists());
        assert!(!cache.has(&key("a")));
        assert_eq!(cache.total_bytes(), 10);

        // A later pass is free to take it.
        assert_eq!(cache.evict_if_over_budget(), vec![key("big")]);
        assert!(!big.exists());
        assert_eq!(cache.total_bytes(), 0);
    }

    #[test]
    fn test_reopen_rebuilds_index() {
        let tmp_dir = tempfile::tempdir().unwrap();
        {
            let cache = DiskCache::open(tmp_dir.path(), 1000).unwrap();
            cache.put(&key("a"), "glb", b"aaaa").unwrap();
            cache.put(&key("b"), "png", b"bb").unwrap();
        }
        // Simulate a crash mid-write.
        let stale = tmp_dir.path().join("trainers").join("a").join(".tmpXYZ");
        std::fs::write(&stale, "partial").unwrap();

        let cache = DiskCache::open(tmp_dir.path(), 1000).unwrap();
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_bytes(), 6);
        assert_eq!(
            cache.path_for(&key("b")),
            Some(cache.target_path(&key("b"), "png"))
        );
        assert!(!stale.exists());
    }
}
