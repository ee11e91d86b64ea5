//! Events announcing what the pipeline did, and an [EventBus] to subscribe to them.
//!
//! Every subscriber gets its own unbounded queue, so a slow subscriber never loses events and never slows down the
//! emitter.  Dropping a [Subscription] unsubscribes.
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::*;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssetEvent {
    /// A key can now be resolved without waiting.
    AssetAvailable { key: CacheKey, path: PathBuf },
    /// Resolution of a key failed.  Nothing retries on its own.
    AssetFailed { key: CacheKey, error: AssetError },
    DownloadStarted { key: CacheKey, url: String },
    DownloadProgress {
        key: CacheKey,
        bytes_received: u64,
        bytes_total: Option<u64>,
    },
    DownloadCompleted { key: CacheKey, path: PathBuf },
    DownloadFailed { key: CacheKey, reason: String },
    StreamStarted { key: CacheKey },
    StreamProgress {
        key: CacheKey,
        chunks_received: u32,
        total: u32,
    },
    StreamCompleted { key: CacheKey, path: PathBuf },
    StreamFailed { key: CacheKey, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AssetAvailable,
    AssetFailed,
    DownloadStarted,
    DownloadProgress,
    DownloadCompleted,
    DownloadFailed,
    StreamStarted,
    StreamProgress,
    StreamCompleted,
    StreamFailed,
}

impl AssetEvent {
    pub fn key(&self) -> &CacheKey {
        use AssetEvent::*;

        match self {
            AssetAvailable { key, .. }
            | AssetFailed { key, .. }
            | DownloadStarted { key, .. }
            | DownloadProgress { key, .. }
            | DownloadCompleted { key, .. }
            | DownloadFailed { key, .. }
            | StreamStarted { key }
            | StreamProgress { key, .. }
            | StreamCompleted { key, .. }
            | StreamFailed { key, .. } => key,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            AssetEvent::AssetAvailable { .. } => EventKind::AssetAvailable,
            AssetEvent::AssetFailed { .. } => EventKind::AssetFailed,
            AssetEvent::DownloadStarted { .. } => EventKind::DownloadStarted,
            AssetEvent::DownloadProgress { .. } => EventKind::DownloadProgress,
            AssetEvent::DownloadCompleted { .. } => EventKind::DownloadCompleted,
            AssetEvent::DownloadFailed { .. } => EventKind::DownloadFailed,
            AssetEvent::StreamStarted { .. } => EventKind::StreamStarted,
            AssetEvent::StreamProgress { .. } => EventKind::StreamProgress,
            AssetEvent::StreamCompleted { .. } => EventKind::StreamCompleted,
            AssetEvent::StreamFailed { .. } => EventKind::StreamFailed,
        }
    }
}

/// Which events a subscriber wants.  The default matches everything.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    kinds: Option<Vec<EventKind>>,
    key: Option<CacheKey>,
}

impl EventFilter {
    pub fn all() -> EventFilter {
        Default::default()
    }

    /// Also accept events of `kind`.  The first call narrows the filter from "everything" to just this kind.
    pub fn kind(mut self, kind: EventKind) -> EventFilter {
        self.kinds.get_or_insert_with(Vec::new).push(kind);
        self
    }

    pub fn key(mut self, key: CacheKey) -> EventFilter {
        self.key = Some(key);
        self
    }

    pub fn matches(&self, event: &AssetEvent) -> bool {
        let kind_ok = self
            .kinds
            .as_ref()
            .map(|k| k.contains(&event.kind()))
            .unwrap_or(true);
        let key_ok = self.key.as_ref().map(|k| k == event.key()).unwrap_or(true);
        kind_ok && key_ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    filter: EventFilter,
    tx: mpsc::UnboundedSender<AssetEvent>,
}

pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<AssetEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next event.  Returns `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<AssetEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AssetEvent> {
        self.rx.try_recv().ok()
    }
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> EventBus {
        Default::default()
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(Subscriber { id, filter, tx });
        Subscription { id, rx }
    }

    /// Stop delivering to a subscription.  Events already queued can still be drained from it.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn emit(&self, event: AssetEvent) {
        tracing::trace!(?event, "Emitting asset event");
        let mut guard = self.subscribers.lock();
        // Sending fails only for dropped subscriptions; prune those as we go.
        guard.retain(|s| !s.filter.matches(&event) || s.tx.send(event.clone()).is_ok());
    }
}
