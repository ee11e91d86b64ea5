//! The [Resolver]: turns a [CacheKey] into a local file or a loaded model, and is the surface the rest of an
//! application talks to.
//!
//! Resolution is a waterfall, first success wins:
//!
//! 1. A bundled file under a local pack's install root.  Nothing else is touched.
//! 2. A completed entry in the [DiskCache], which counts as a use of that entry.
//! 3. The variant's effective URL, queued on the [Downloader].
//! 4. If this process is a network client, a peer transfer from the host, queued on the [Streamer].
//! 5. Otherwise, [AssetError::NotFound], immediately and without any background work.
//!
//! Steps 1 and 2 answer synchronously.  Steps 3 and 4 answer with a [TransferHandle]; when the transfer finishes
//! the resolver announces it on the event bus with [AssetEvent::AssetAvailable] or [AssetEvent::AssetFailed].
//! Failures aren't remembered: asking again for a key whose transfer failed starts a fresh one.
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::runtime::Handle;

use crate::*;

/// What part this process plays in a networked session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkRole {
    /// Not in a session.  Nothing is ever streamed.
    Offline,
    /// Serving a session.  Answers peer requests but never makes them.
    Host,
    /// Joined someone else's session.  Missing files without a URL are streamed from the host.
    Client,
}

impl NetworkRole {
    fn to_u8(self) -> u8 {
        match self {
            NetworkRole::Offline => 0,
            NetworkRole::Host => 1,
            NetworkRole::Client => 2,
        }
    }

    fn from_u8(value: u8) -> NetworkRole {
        match value {
            1 => NetworkRole::Host,
            2 => NetworkRole::Client,
            _ => NetworkRole::Offline,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resolution {
    /// Usable right now.
    Ready(PathBuf),
    /// Being downloaded or streamed.
    Pending(TransferHandle),
}

struct ResolverInner<L: ModelLoader> {
    registry: Arc<PackRegistry>,
    bundled: BundledFiles,
    disk: Arc<DiskCache>,
    memory: MemoryCache<L>,
    downloader: Downloader,
    streamer: Streamer,
    events: Arc<EventBus>,
    runtime: Handle,
    role: AtomicU8,
}

pub struct Resolver<L: ModelLoader> {
    inner: Arc<ResolverInner<L>>,
}

impl<L: ModelLoader> Clone for Resolver<L> {
    fn clone(&self) -> Self {
        Resolver {
            inner: self.inner.clone(),
        }
    }
}

impl<L: ModelLoader> Resolver<L> {
    /// Build the whole pipeline from a config, fetching over HTTP.
    ///
    /// `runtime` is where background work runs; the resolver may be used from threads outside of it.
    pub fn from_config(
        config: &AssetConfig,
        registry: Arc<PackRegistry>,
        loader: L,
        runtime: Handle,
    ) -> Result<Resolver<L>, ConfigError> {
        let fetcher =
            HttpFetcher::new(&config.user_agent).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Resolver::with_fetcher(config, registry, loader, Arc::new(fetcher), runtime)
    }

    /// Like [Resolver::from_config], but fetching through `fetcher`.
    pub fn with_fetcher(
        config: &AssetConfig,
        registry: Arc<PackRegistry>,
        loader: L,
        fetcher: Arc<dyn Fetcher>,
        runtime: Handle,
    ) -> Result<Resolver<L>, ConfigError> {
        config.validate()?;
        let disk = Arc::new(DiskCache::open(&config.cache_root, config.max_cache_bytes)?);
        let events = Arc::new(EventBus::new());
        let bundled = BundledFiles::new(registry.clone());
        let downloader = Downloader::new(fetcher, disk.clone(), events.clone(), runtime.clone(), config);
        let streamer = Streamer::new(
            Arc::new(bundled.clone()),
            disk.clone(),
            events.clone(),
            runtime.clone(),
            config,
        );
        tracing::info!(
            cache_root = %config.cache_root.display(),
            cached_files = disk.len(),
            "Asset resolver ready"
        );

        Ok(Resolver {
            inner: Arc::new(ResolverInner {
                registry,
                bundled,
                disk,
                memory: MemoryCache::new(loader),
                downloader,
                streamer,
                events,
                runtime,
                role: AtomicU8::new(NetworkRole::Offline.to_u8()),
            }),
        })
    }

    /// Run the waterfall for `key`.  Lower `priority` values are served sooner.
    pub fn schedule(&self, key: &CacheKey, priority: i32) -> Result<Resolution> {
        let inner = &self.inner;
        if let Some(path) = inner.bundled.model_path(key) {
            tracing::trace!(%key, "Resolved to bundled file");
            return Ok(Resolution::Ready(path));
        }
        if let Some(path) = inner.disk.path_for(key) {
            inner.disk.touch(key);
            tracing::debug!(%key, "Disk cache hit");
            return Ok(Resolution::Ready(path));
        }

        let lookup = inner
            .registry
            .get_variant(key)
            .ok_or_else(|| AssetError::NotFound(key.clone()))?;
        let ext = lookup.variant.model_extension();
        let enqueued = if let Some(url) = lookup.model_url() {
            inner.downloader.enqueue(key, &url, ext, priority)
        } else if self.role() == NetworkRole::Client {
            inner.streamer.request(key, ext, priority)
        } else {
            tracing::debug!(%key, "No way to acquire asset");
            return Err(AssetError::NotFound(key.clone()));
        };

        if enqueued.is_new {
            self.announce_when_done(enqueued.handle.clone());
        }
        Ok(Resolution::Pending(enqueued.handle))
    }

    /// Follow a new transfer and announce how it ended.
    fn announce_when_done(&self, handle: TransferHandle) {
        let events = self.inner.events.clone();
        self.inner.runtime.spawn(async move {
            let key = handle.key().clone();
            let event = match handle.wait().await {
                Ok(path) => AssetEvent::AssetAvailable { key, path },
                Err(error) => AssetEvent::AssetFailed { key, error },
            };
            events.emit(event);
        });
    }

    /// A usable path if there is one right now; otherwise `None`, with the asset on its way and
    /// [AssetEvent::AssetAvailable] to follow.
    pub fn resolve_path(&self, key: &CacheKey, priority: i32) -> Result<Option<PathBuf>> {
        Ok(match self.schedule(key, priority)? {
            Resolution::Ready(path) => Some(path),
            Resolution::Pending(_) => None,
        })
    }

    /// The bundled file or cached file for `key`, without scheduling anything or counting as a use.
    pub fn local_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.inner
            .bundled
            .model_path(key)
            .or_else(|| self.inner.disk.path_for(key))
    }

    pub fn local_icon_path(&self, key: &CacheKey) -> Option<PathBuf> {
        self.inner.bundled.icon_path(key)
    }

    /// Where the icon for `key` can be fetched from, if anywhere.
    pub fn icon_url(&self, key: &CacheKey) -> Option<String> {
        let lookup = self.inner.registry.get_variant(key)?;
        lookup.variant.icon_url(lookup.pack.base_url.as_deref())
    }

    pub fn is_available(&self, key: &CacheKey) -> bool {
        self.local_path(key).is_some()
    }

    /// Whether `key` is known but would have to be downloaded or streamed before use.
    pub fn needs_download(&self, key: &CacheKey) -> bool {
        !self.is_available(key) && self.inner.registry.get_variant(key).is_some()
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.downloader.is_pending(key) || self.inner.streamer.is_pending(key)
    }

    pub fn has_cached_template(&self, key: &CacheKey) -> bool {
        self.local_path(key)
            .map(|p| self.inner.memory.contains(&p))
            .unwrap_or(false)
    }

    /// Resolve `key`, waiting for any transfer, then return a fresh instance of its model.
    pub async fn get_model_instance(&self, key: &CacheKey, priority: i32) -> Result<L::Model> {
        // Pins the cached file from the moment it is written until the parse is done.
        let _reservation = self.inner.disk.reserve(key);
        let path = match self.schedule(key, priority)? {
            Resolution::Ready(path) => path,
            Resolution::Pending(handle) => handle.wait().await?,
        };
        self.inner.memory.get_or_load(&path).await
    }

    /// [Resolver::get_model_instance] for threads outside the runtime.  Must not be called from a runtime thread.
    pub fn get_model_instance_blocking(&self, key: &CacheKey, priority: i32) -> Result<L::Model> {
        let (tx, rx) = std::sync::mpsc::channel();
        let this = self.clone();
        let task_key = key.clone();
        self.inner.runtime.spawn(async move {
            let result = this.get_model_instance(&task_key, priority).await;
            // The caller only goes away by panicking; nobody is left to tell.
            let _ = tx.send(result);
        });
        rx.recv()
            .unwrap_or_else(|_| Err(AssetError::NotFound(key.clone())))
    }

    /// End the current session, dropping every parsed template.
    pub fn end_session(&self) {
        self.inner.memory.clear();
    }

    pub fn set_role(&self, role: NetworkRole) {
        tracing::info!(?role, "Network role changed");
        self.inner.role.store(role.to_u8(), Ordering::SeqCst);
    }

    pub fn role(&self) -> NetworkRole {
        NetworkRole::from_u8(self.inner.role.load(Ordering::SeqCst))
    }

    /// Where background work runs.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.inner.events.subscribe(filter)
    }

    pub fn registry(&self) -> &Arc<PackRegistry> {
        &self.inner.registry
    }

    pub fn disk(&self) -> &Arc<DiskCache> {
        &self.inner.disk
    }

    pub fn memory(&self) -> &MemoryCache<L> {
        &self.inner.memory
    }

    pub fn downloader(&self) -> &Downloader {
        &self.inner.downloader
    }

    /// The streamer, for wiring up the transport.
    pub fn streamer(&self) -> &Streamer {
        &self.inner.streamer
    }
}
