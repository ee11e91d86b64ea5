//! The [Downloader]: a priority queue of HTTP fetches with bounded concurrency, writing into the [DiskCache].
//!
//! There is no cancellation.  Once a fetch starts it runs to success, failure or timeout, and whoever still cares
//! hears about it through the [TransferHandle] or the event bus.
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::runtime::Handle;

use crate::transfer::{Completion, QueueEntry};
use crate::*;

/// Reports `(bytes_received, bytes_total)` while a fetch is running.
pub type ProgressFn<'a> = &'a (dyn Fn(u64, Option<u64>) + Send + Sync);

/// Fetches the bytes behind a URL.
pub trait Fetcher: Send + Sync + 'static {
    fn fetch<'a>(&'a self, url: &'a str, progress: ProgressFn<'a>) -> BoxFuture<'a, Result<Vec<u8>, String>>;
}

/// The production [Fetcher], over HTTP(S).
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(user_agent: &str) -> Result<HttpFetcher, reqwest::Error> {
        let client = reqwest::Client::builder().user_agent(user_agent).build()?;
        Ok(HttpFetcher { client })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a str, progress: ProgressFn<'a>) -> BoxFuture<'a, Result<Vec<u8>, String>> {
        async move {
            let response = self
                .client
                .get(url)
                .send()
                .await
                .and_then(|r| r.error_for_status())
                .map_err(|e| e.to_string())?;
            let total = response.content_length();

            let mut body = Vec::with_capacity(total.unwrap_or(0).min(64 * 1024 * 1024) as usize);
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| e.to_string())?;
                body.extend_from_slice(&chunk);
                progress(body.len() as u64, total);
            }

            if let Some(expected) = total {
                if expected != body.len() as u64 {
                    return Err(format!(
                        "truncated response: expected {} bytes, got {}",
                        expected,
                        body.len()
                    ));
                }
            }
            Ok(body)
        }
        .boxed()
    }
}

struct DownloadTask {
    url: String,
    ext: String,
    priority: i32,
    /// Sequence number of the queue entry that may start this task.
    seq: u64,
    status: TransferStatus,
    progress: Option<f32>,
    completion: Completion,
}

#[derive(Default)]
struct DownloadQueue {
    pending: BinaryHeap<QueueEntry>,
    /// Queued and active tasks.  Finished tasks are removed.
    tasks: HashMap<CacheKey, DownloadTask, ahash::RandomState>,
    active: usize,
    next_seq: u64,
    started: u64,
}

struct DownloaderInner {
    fetcher: Arc<dyn Fetcher>,
    disk: Arc<DiskCache>,
    events: Arc<EventBus>,
    runtime: Handle,
    timeout: Duration,
    max_active: usize,
    queue: Mutex<DownloadQueue>,
}

#[derive(Clone)]
pub struct Downloader {
    inner: Arc<DownloaderInner>,
}

impl Downloader {
    pub fn new(
        fetcher: Arc<dyn Fetcher>,
        disk: Arc<DiskCache>,
        events: Arc<EventBus>,
        runtime: Handle,
        config: &AssetConfig,
    ) -> Downloader {
        Downloader {
            inner: Arc::new(DownloaderInner {
                fetcher,
                disk,
                events,
                runtime,
                timeout: config.download_timeout(),
                max_active: config.max_concurrent_downloads,
                queue: Default::default(),
            }),
        }
    }

    /// Queue a download of `url` into the cache entry for `key`.  Lower `priority` values are served first.
    ///
    /// A request for a key which is already queued or downloading attaches to that download.  If it is still queued
    /// and this request is more urgent, it moves up.
    pub fn enqueue(&self, key: &CacheKey, url: &str, ext: &str, priority: i32) -> Enqueued {
        let enqueued = {
            let mut guard = self.inner.queue.lock();
            let queue = &mut *guard;
            if let Some(task) = queue.tasks.get_mut(key) {
                if task.status == TransferStatus::Queued && priority < task.priority {
                    task.priority = priority;
                    let seq = queue.next_seq;
                    queue.next_seq += 1;
                    // The old heap slot becomes stale and is skipped when popped.
                    task.seq = seq;
                    queue.pending.push(QueueEntry {
                        priority,
                        seq,
                        key: key.clone(),
                    });
                }
                tracing::debug!(%key, "Merged download request into existing task");
                Enqueued {
                    handle: task.completion.handle(),
                    is_new: false,
                }
            } else {
                let completion = Completion::new(key.clone());
                let handle = completion.handle();
                let seq = queue.next_seq;
                queue.next_seq += 1;
                queue.tasks.insert(
                    key.clone(),
                    DownloadTask {
                        url: url.to_string(),
                        ext: ext.to_string(),
                        priority,
                        seq,
                        status: TransferStatus::Queued,
                        progress: None,
                        completion,
                    },
                );
                queue.pending.push(QueueEntry {
                    priority,
                    seq,
                    key: key.clone(),
                });
                tracing::debug!(%key, url, priority, "Queued download");
                Enqueued {
                    handle,
                    is_new: true,
                }
            }
        };
        self.pump();
        enqueued
    }

    /// Start queued downloads while there is capacity.
    fn pump(&self) {
        loop {
            let (key, url, ext) = {
                let mut guard = self.inner.queue.lock();
                let queue = &mut *guard;
                if queue.active >= self.inner.max_active {
                    return;
                }
                let entry = match queue.pending.pop() {
                    Some(e) => e,
                    None => return,
                };
                let task = match queue.tasks.get_mut(&entry.key) {
                    Some(t) if t.status == TransferStatus::Queued && t.seq == entry.seq => t,
                    _ => continue,
                };
                task.status = TransferStatus::Active;
                task.progress = Some(0.0);
                queue.active += 1;
                queue.started += 1;
                (entry.key, task.url.clone(), task.ext.clone())
            };

            let this = self.clone();
            self.inner
                .runtime
                .spawn(async move { this.run(key, url, ext).await });
        }
    }

    async fn run(self, key: CacheKey, url: String, ext: String) {
        let inner = &self.inner;
        inner.events.emit(AssetEvent::DownloadStarted {
            key: key.clone(),
            url: url.clone(),
        });

        let progress = |received: u64, total: Option<u64>| {
            if let Some(task) = inner.queue.lock().tasks.get_mut(&key) {
                task.progress = total
                    .filter(|t| *t > 0)
                    .map(|t| (received as f32 / t as f32).min(1.0));
            }
            inner.events.emit(AssetEvent::DownloadProgress {
                key: key.clone(),
                bytes_received: received,
                bytes_total: total,
            });
        };

        let fetched = match tokio::time::timeout(inner.timeout, inner.fetcher.fetch(&url, &progress)).await {
            Ok(Ok(bytes)) if bytes.is_empty() => Err("empty response".to_string()),
            Ok(r) => r,
            Err(_) => Err(format!("timed out after {}s", inner.timeout.as_secs())),
        };

        let result = match fetched {
            Ok(bytes) => {
                let disk = inner.disk.clone();
                let write_key = key.clone();
                match tokio::task::spawn_blocking(move || disk.put(&write_key, &ext, &bytes)).await {
                    Ok(r) => r,
                    Err(e) => Err(AssetError::CacheWriteFailed {
                        key: key.clone(),
                        reason: e.to_string(),
                    }),
                }
            }
            Err(reason) => Err(AssetError::DownloadFailed {
                key: key.clone(),
                reason,
            }),
        };

        match &result {
            Ok(path) => {
                tracing::info!(%key, path = %path.display(), "Download completed");
                inner.events.emit(AssetEvent::DownloadCompleted {
                    key: key.clone(),
                    path: path.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(%key, url = %url, "Download failed: {}", e);
                inner.events.emit(AssetEvent::DownloadFailed {
                    key: key.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let task = {
            let mut queue = inner.queue.lock();
            queue.active -= 1;
            queue.tasks.remove(&key)
        };
        if let Some(task) = task {
            task.completion.finish(result);
        }
        self.pump();
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.queue.lock().tasks.contains_key(key)
    }

    pub fn handle_for(&self, key: &CacheKey) -> Option<TransferHandle> {
        self.inner
            .queue
            .lock()
            .tasks
            .get(key)
            .map(|t| t.completion.handle())
    }

    pub fn info(&self, key: &CacheKey) -> Option<TransferInfo> {
        self.inner.queue.lock().tasks.get(key).map(|t| TransferInfo {
            key: key.clone(),
            priority: t.priority,
            status: t.status,
            progress: t.progress,
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.queue.lock().active
    }

    pub fn queued_count(&self) -> usize {
        self.inner
            .queue
            .lock()
            .tasks
            .values()
            .filter(|t| t.status == TransferStatus::Queued)
            .count()
    }

    /// How many downloads have ever been started, counting each deduplicated task once.
    pub fn started_count(&self) -> u64 {
        self.inner.queue.lock().started
    }
}
