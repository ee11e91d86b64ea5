//! Peer-to-peer streaming of asset files, for when there is no URL to download from.
//!
//! The same [Streamer] plays both roles.  As a requester (a network client missing a file) it queues transfers,
//! runs at most a fixed number at once, asks the host for each, and reassembles the chunks into the [DiskCache].
//! As a responder it answers requests from peers, but only with files that are authoritative locally according to
//! its [LocalSource]; it never downloads or streams on a peer's behalf.
//!
//! The transport is external.  Outgoing messages go through a [PeerChannel]; the transport hands every incoming
//! message to [Streamer::handle_message], along with a channel for replying to whoever sent it.
//!
//! Streamed bytes are trusted as-is: the host is the authority for its own packs and there is no content hash in
//! the manifest to check them against.
mod protocol;

pub use protocol::*;

use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::Semaphore;

use crate::transfer::{Completion, QueueEntry};
use crate::*;

/// Sends messages to one connected peer over a reliable, ordered channel.
pub trait PeerChannel: Send + Sync + 'static {
    fn send(&self, message: StreamMessage) -> Result<(), String>;
}

struct Transfer {
    id: u64,
    /// Sequence number of the queue entry that may start this transfer.
    queue_seq: u64,
    ext: String,
    priority: i32,
    status: TransferStatus,
    assembler: Option<ChunkAssembler>,
    /// Set once every chunk arrived and the file is being written.
    assembling: bool,
    chunks_seen: u64,
    completion: Completion,
}

#[derive(Default)]
struct StreamState {
    pending: BinaryHeap<QueueEntry>,
    transfers: HashMap<CacheKey, Transfer, ahash::RandomState>,
    active: usize,
    next_seq: u64,
    started: u64,
}

struct StreamerInner {
    runtime: Handle,
    disk: Arc<DiskCache>,
    events: Arc<EventBus>,
    local: Arc<dyn LocalSource>,
    chunk_size: usize,
    /// Largest chunk count accepted from a host.
    max_chunks: u32,
    timeout: Duration,
    max_active: usize,
    host: RwLock<Option<Arc<dyn PeerChannel>>>,
    state: Mutex<StreamState>,
    /// Bounds how many requests from peers are served at once.
    responders: Arc<Semaphore>,
}

#[derive(Clone)]
pub struct Streamer {
    inner: Arc<StreamerInner>,
}

fn stream_failed(key: &CacheKey, reason: impl Into<String>) -> AssetError {
    AssetError::StreamFailed {
        key: key.clone(),
        reason: reason.into(),
    }
}

impl Streamer {
    pub fn new(
        local: Arc<dyn LocalSource>,
        disk: Arc<DiskCache>,
        events: Arc<EventBus>,
        runtime: Handle,
        config: &AssetConfig,
    ) -> Streamer {
        let max_chunks = config
            .max_cache_bytes
            .div_ceil(config.stream_chunk_size.max(1) as u64)
            .clamp(1, u32::MAX as u64) as u32;
        Streamer {
            inner: Arc::new(StreamerInner {
                runtime,
                disk,
                events,
                local,
                chunk_size: config.stream_chunk_size,
                max_chunks,
                timeout: config.stream_timeout(),
                max_active: config.max_concurrent_streams,
                host: RwLock::new(None),
                state: Default::default(),
                responders: Arc::new(Semaphore::new(config.max_concurrent_streams)),
            }),
        }
    }

    /// Set the channel requests are sent over.
    pub fn connect_host(&self, channel: Arc<dyn PeerChannel>) {
        *self.inner.host.write() = Some(channel);
    }

    /// Forget the host.  Transfers already waiting on it fail by timeout.
    pub fn disconnect_host(&self) {
        *self.inner.host.write() = None;
    }

    pub fn has_host(&self) -> bool {
        self.inner.host.read().is_some()
    }

    /// Queue a transfer of `key` from the host.  Duplicate requests attach to the existing transfer.
    pub fn request(&self, key: &CacheKey, ext: &str, priority: i32) -> Enqueued {
        let enqueued = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            if let Some(t) = state.transfers.get_mut(key) {
                if t.status == TransferStatus::Queued && priority < t.priority {
                    t.priority = priority;
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    t.queue_seq = seq;
                    state.pending.push(QueueEntry {
                        priority,
                        seq,
                        key: key.clone(),
                    });
                }
                tracing::debug!(%key, "Merged stream request into existing transfer");
                Enqueued {
                    handle: t.completion.handle(),
                    is_new: false,
                }
            } else {
                let completion = Completion::new(key.clone());
                let handle = completion.handle();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.transfers.insert(
                    key.clone(),
                    Transfer {
                        id: seq,
                        queue_seq: seq,
                        ext: ext.to_string(),
                        priority,
                        status: TransferStatus::Queued,
                        assembler: None,
                        assembling: false,
                        chunks_seen: 0,
                        completion,
                    },
                );
                state.pending.push(QueueEntry {
                    priority,
                    seq,
                    key: key.clone(),
                });
                tracing::debug!(%key, priority, "Queued stream transfer");
                Enqueued {
                    handle,
                    is_new: true,
                }
            }
        };
        self.pump();
        enqueued
    }

    /// Start queued transfers while there is capacity.
    fn pump(&self) {
        loop {
            let (key, id) = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;
                if state.active >= self.inner.max_active {
                    return;
                }
                let entry = match state.pending.pop() {
                    Some(e) => e,
                    None => return,
                };
                let t = match state.transfers.get_mut(&entry.key) {
                    Some(t) if t.status == TransferStatus::Queued && t.queue_seq == entry.seq => t,
                    _ => continue,
                };
                t.status = TransferStatus::Active;
                state.active += 1;
                state.started += 1;
                (entry.key, t.id)
            };

            self.inner
                .events
                .emit(AssetEvent::StreamStarted { key: key.clone() });
            let host = self.inner.host.read().clone();
            let sent = match host {
                Some(h) => h.send(StreamMessage::AssetRequest { key: key.clone() }),
                None => Err("not connected to a host".to_string()),
            };
            match sent {
                Ok(()) => {
                    let this = self.clone();
                    self.inner
                        .runtime
                        .spawn(async move { this.watchdog(key, id).await });
                }
                Err(reason) => self.finish(&key, id, Err(stream_failed(&key, reason))),
            }
        }
    }

    /// Fail a transfer if a whole timeout window passes without a chunk.
    async fn watchdog(self, key: CacheKey, id: u64) {
        let seen = |state: &StreamState| {
            state
                .transfers
                .get(&key)
                .filter(|t| t.id == id && !t.assembling)
                .map(|t| t.chunks_seen)
        };
        let current = seen(&*self.inner.state.lock());
        let mut last = match current {
            Some(x) => x,
            None => return,
        };
        loop {
            tokio::time::sleep(self.inner.timeout).await;
            let current = seen(&*self.inner.state.lock());
            let now = match current {
                Some(x) => x,
                None => return,
            };
            if now == last {
                self.finish(&key, id, Err(stream_failed(&key, "timeout")));
                return;
            }
            last = now;
        }
    }

    /// Remove a finished transfer, announce the result, and make room for the next one.
    fn finish(&self, key: &CacheKey, id: u64, result: TransferResult) {
        let transfer = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            match state.transfers.get(key).map(|t| t.id) {
                Some(current) if current == id => {
                    let t = state.transfers.remove(key);
                    if t.as_ref().map(|t| t.status) == Some(TransferStatus::Active) {
                        state.active -= 1;
                    }
                    t
                }
                _ => None,
            }
        };
        let transfer = match transfer {
            Some(t) => t,
            // Already finished by someone else, e.g. the watchdog racing the last chunk.
            None => return,
        };

        match &result {
            Ok(path) => {
                tracing::info!(%key, path = %path.display(), "Stream completed");
                self.inner.events.emit(AssetEvent::StreamCompleted {
                    key: key.clone(),
                    path: path.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(%key, "Stream failed: {}", e);
                self.inner.events.emit(AssetEvent::StreamFailed {
                    key: key.clone(),
                    reason: match e {
                        AssetError::StreamFailed { reason, .. } => reason.clone(),
                        other => other.to_string(),
                    },
                });
            }
        }
        transfer.completion.finish(result);
        self.pump();
    }

    /// Decode a frame from the transport and handle it.
    pub fn handle_frame(&self, from: Arc<dyn PeerChannel>, frame: &[u8]) -> Result<(), ProtocolError> {
        let message = StreamMessage::decode(frame)?;
        self.handle_message(from, message);
        Ok(())
    }

    /// Handle a message from a peer.  `from` is how to reply to that peer.
    ///
    /// Replies to our own requests are only taken from the connected host channel.
    pub fn handle_message(&self, from: Arc<dyn PeerChannel>, message: StreamMessage) {
        if !matches!(message, StreamMessage::AssetRequest { .. }) && !self.is_host(&from) {
            tracing::debug!(key = %message.key(), "Ignoring transfer reply from a peer that isn't our host");
            return;
        }
        match message {
            StreamMessage::AssetRequest { key } => self.respond(from, key),
            StreamMessage::AssetChunk {
                key,
                index,
                total,
                compressed_bytes,
            } => self.on_chunk(key, index, total, compressed_bytes),
            StreamMessage::AssetComplete { key } => self.on_complete(key),
            StreamMessage::AssetFailed { key, reason } => {
                if let Some(id) = self.active_id(&key) {
                    self.finish(&key, id, Err(stream_failed(&key, reason)));
                }
            }
        }
    }

    fn is_host(&self, channel: &Arc<dyn PeerChannel>) -> bool {
        self.inner
            .host
            .read()
            .as_ref()
            .is_some_and(|host| std::ptr::addr_eq(Arc::as_ptr(host), Arc::as_ptr(channel)))
    }

    fn active_id(&self, key: &CacheKey) -> Option<u64> {
        self.inner
            .state
            .lock()
            .transfers
            .get(key)
            .filter(|t| t.status == TransferStatus::Active)
            .map(|t| t.id)
    }

    fn on_chunk(&self, key: CacheKey, index: u32, total: u32, compressed: Vec<u8>) {
        enum Next {
            Wait(u32),
            Assemble(u64, String, ChunkAssembler),
            Fail(u64, ProtocolError),
        }

        let chunk_size = self.inner.chunk_size;
        let max_chunks = self.inner.max_chunks;
        let next = {
            let mut state = self.inner.state.lock();
            let t = match state.transfers.get_mut(&key) {
                Some(t) if t.status == TransferStatus::Active && !t.assembling => t,
                _ => {
                    tracing::debug!(%key, index, "Ignoring chunk for a transfer that isn't running");
                    return;
                }
            };
            t.chunks_seen += 1;
            if total == 0 {
                Next::Fail(t.id, ProtocolError::ChunkOutOfRange { index, total })
            } else if total > max_chunks {
                Next::Fail(
                    t.id,
                    ProtocolError::TooManyChunks {
                        total,
                        max: max_chunks,
                    },
                )
            } else {
                let assembler = t
                    .assembler
                    .get_or_insert_with(|| ChunkAssembler::new(total, chunk_size));
                match assembler.accept(index, total, compressed) {
                    Err(e) => Next::Fail(t.id, e),
                    Ok(()) if assembler.is_complete() => {
                        t.assembling = true;
                        match t.assembler.take() {
                            Some(a) => Next::Assemble(t.id, t.ext.clone(), a),
                            None => Next::Wait(0),
                        }
                    }
                    Ok(()) => Next::Wait(assembler.received()),
                }
            }
        };

        match next {
            Next::Wait(received) => self.inner.events.emit(AssetEvent::StreamProgress {
                key,
                chunks_received: received,
                total,
            }),
            Next::Fail(id, e) => self.finish(&key, id, Err(stream_failed(&key, e.to_string()))),
            Next::Assemble(id, ext, assembler) => {
                self.inner.events.emit(AssetEvent::StreamProgress {
                    key: key.clone(),
                    chunks_received: total,
                    total,
                });
                let this = self.clone();
                self.inner.runtime.spawn(async move {
                    let disk = this.inner.disk.clone();
                    let write_key = key.clone();
                    let written = tokio::task::spawn_blocking(move || {
                        let bytes = assembler
                            .assemble()
                            .map_err(|e| stream_failed(&write_key, e.to_string()))?;
                        disk.put(&write_key, &ext, &bytes)
                    })
                    .await;
                    let result = written.unwrap_or_else(|e| Err(stream_failed(&key, e.to_string())));
                    this.finish(&key, id, result);
                });
            }
        }
    }

    fn on_complete(&self, key: CacheKey) {
        let missing = {
            let state = self.inner.state.lock();
            match state.transfers.get(&key) {
                Some(t) if t.status == TransferStatus::Active && !t.assembling => {
                    let missing = t
                        .assembler
                        .as_ref()
                        .map(|a| a.total() - a.received())
                        .unwrap_or(1);
                    Some((t.id, missing))
                }
                _ => None,
            }
        };
        if let Some((id, missing)) = missing {
            let reason = ProtocolError::Incomplete(missing).to_string();
            self.finish(&key, id, Err(stream_failed(&key, reason)));
        }
    }

    /// Serve a peer's request from a locally authoritative file.
    fn respond(&self, reply: Arc<dyn PeerChannel>, key: CacheKey) {
        let inner = self.inner.clone();
        self.inner.runtime.spawn(async move {
            let _permit = match inner.responders.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => return,
            };
            let local = inner.local.clone();
            let chunk_size = inner.chunk_size;
            let lookup_key = key.clone();
            let prepared = tokio::task::spawn_blocking(move || {
                let path = local
                    .local_path(&lookup_key)
                    .ok_or_else(|| "no local file for this asset".to_string())?;
                let bytes = std::fs::read(&path).map_err(|e| e.to_string())?;
                Ok::<_, String>(split_into_chunks(&lookup_key, &bytes, chunk_size))
            })
            .await
            .unwrap_or_else(|e| Err(e.to_string()));

            let outcome = match prepared {
                Ok(chunks) => {
                    let count = chunks.len();
                    chunks
                        .into_iter()
                        .try_for_each(|c| reply.send(c))
                        .and_then(|_| reply.send(StreamMessage::AssetComplete { key: key.clone() }))
                        .map(|_| count)
                }
                Err(reason) => {
                    tracing::debug!(%key, "Refusing stream request: {}", reason);
                    reply
                        .send(StreamMessage::AssetFailed {
                            key: key.clone(),
                            reason,
                        })
                        .map(|_| 0)
                }
            };
            match outcome {
                Ok(chunks) if chunks > 0 => tracing::info!(%key, chunks, "Served stream request"),
                Ok(_) => {}
                Err(e) => tracing::warn!(%key, "Failed to reply to stream request: {}", e),
            }
        });
    }

    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().transfers.contains_key(key)
    }

    pub fn handle_for(&self, key: &CacheKey) -> Option<TransferHandle> {
        self.inner
            .state
            .lock()
            .transfers
            .get(key)
            .map(|t| t.completion.handle())
    }

    pub fn info(&self, key: &CacheKey) -> Option<TransferInfo> {
        self.inner.state.lock().transfers.get(key).map(|t| TransferInfo {
            key: key.clone(),
            priority: t.priority,
            status: t.status,
            progress: t
                .assembler
                .as_ref()
                .map(|a| a.received() as f32 / a.total() as f32),
        })
    }

    pub fn active_count(&self) -> usize {
        self.inner.state.lock().active
    }

    /// How many transfers have ever been started, counting each deduplicated request once.
    pub fn started_count(&self) -> u64 {
        self.inner.state.lock().started
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::path::PathBuf;

    use tokio::sync::mpsc;

    use super::*;

    /// One direction of an in-memory connection: messages are delivered to `target` on a separate task, in order.
    pub(crate) struct Loopback {
        tx: mpsc::UnboundedSender<StreamMessage>,
        pub(crate) sent: Mutex<Vec<StreamMessage>>,
    }

    impl PeerChannel for Loopback {
        fn send(&self, message: StreamMessage) -> Result<(), String> {
            self.sent.lock().push(message.clone());
            self.tx.send(message).map_err(|e| e.to_string())
        }
    }

    /// Wire `client` to `host`, returning the client's channel to the host and the host's channel back.
    pub(crate) fn connect(client: &Streamer, host: &Streamer) -> (Arc<Loopback>, Arc<Loopback>) {
        let (to_host_tx, mut to_host_rx) = mpsc::unbounded_channel();
        let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel();
        let to_host = Arc::new(Loopback {
            tx: to_host_tx,
            sent: Default::default(),
        });
        let to_client = Arc::new(Loopback {
            tx: to_client_tx,
            sent: Default::default(),
        });

        let host_side = host.clone();
        let reply: Arc<dyn PeerChannel> = to_client.clone();
        tokio::spawn(async move {
            while let Some(m) = to_host_rx.recv().await {
                host_side.handle_message(reply.clone(), m);
            }
        });
        let client_side = client.clone();
        let back: Arc<dyn PeerChannel> = to_host.clone();
        tokio::spawn(async move {
            while let Some(m) = to_client_rx.recv().await {
                client_side.handle_message(back.clone(), m);
            }
        });

        client.connect_host(to_host.clone());
        (to_host, to_client)
    }

    pub(crate) struct MapSource(pub(crate) HashMap<CacheKey, PathBuf>);

    impl LocalSource for MapSource {
        fn local_path(&self, key: &CacheKey) -> Option<PathBuf> {
            self.0.get(key).cloned()
        }
    }

    fn streamer(
        dir: &std::path::Path,
        local: HashMap<CacheKey, PathBuf>,
        max_streams: usize,
        timeout_secs: u64,
    ) -> (Arc<EventBus>, Arc<DiskCache>, Streamer) {
        let disk = Arc::new(DiskCache::open(dir, 1 << 24).unwrap());
        let events = Arc::new(EventBus::new());
        let config = AssetConfigBuilder::default()
            .max_concurrent_streams(max_streams)
            .stream_timeout_secs(timeout_secs)
            .build()
            .unwrap();
        let s = Streamer::new(
            Arc::new(MapSource(local)),
            disk.clone(),
            events.clone(),
            Handle::current(),
            &config,
        );
        (events, disk, s)
    }

    fn key(asset: &str) -> CacheKey {
        CacheKey::new("trainers", asset, "default")
    }

    #[tokio::test]
    async fn test_streams_100k_file_in_four_chunks() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let source_path = tmp_dir.path().join("pikachu.glb");
        let source: Vec<u8> = (0..100 * 1024).map(|i| (i % 253) as u8).collect();
        std::fs::write(&source_path, &source).unwrap();

        let mut local = HashMap::new();
        local.insert(key("pikachu"), source_path);
        let (_, _, host) = streamer(&tmp_dir.path().join("host"), local, 2, 30);
        let (events, disk, client) = streamer(&tmp_dir.path().join("client"), HashMap::new(), 2, 30);
        let (_, to_client) = connect(&client, &host);
        let mut progress = events.subscribe(EventFilter::all().kind(EventKind::StreamProgress));

        let enqueued = client.request(&key("pikachu"), "glb", 0);
        let path = enqueued.handle.wait().await.unwrap();

        assert_eq!(path, disk.target_path(&key("pikachu"), "glb"));
        assert_eq!(std::fs::read(&path).unwrap(), source);

        let sent = to_client.sent.lock().clone();
        let chunk_indices: Vec<u32> = sent
            .iter()
            .filter_map(|m| match m {
                StreamMessage::AssetChunk { index, total, .. } => {
                    assert_eq!(*total, 4);
                    Some(*index)
                }
                _ => None,
            })
            .collect();
        assert_eq!(chunk_indices, vec![0, 1, 2, 3]);
        assert_eq!(
            sent.last(),
            Some(&StreamMessage::AssetComplete { key: key("pikachu") })
        );

        let mut last = None;
        while let Some(e) = progress.try_recv() {
            last = Some(e);
        }
        assert_eq!(
            last,
            Some(AssetEvent::StreamProgress {
                key: key("pikachu"),
                chunks_received: 4,
                total: 4
            })
        );
    }

    #[tokio::test]
    async fn test_responder_without_file_fails_immediately() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, host) = streamer(&tmp_dir.path().join("host"), HashMap::new(), 2, 30);
        let (events, disk, client) = streamer(&tmp_dir.path().join("client"), HashMap::new(), 2, 30);
        connect(&client, &host);
        let mut failures = events.subscribe(EventFilter::all().kind(EventKind::StreamFailed));

        let result = client.request(&key("missing"), "glb", 0).handle.wait().await;
        assert!(matches!(result, Err(AssetError::StreamFailed { .. })));
        assert!(!disk.has(&key("missing")));
        assert!(matches!(
            failures.recv().await,
            Some(AssetEvent::StreamFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_host_fails() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 30);
        assert!(!client.has_host());
        client.connect_host(Arc::new(Silent(Default::default())));
        client.disconnect_host();
        assert!(!client.has_host());
        let result = client.request(&key("a"), "glb", 0).handle.wait().await;
        assert!(matches!(result, Err(AssetError::StreamFailed { .. })));
        assert_eq!(client.active_count(), 0);
    }

    /// A host that never answers.
    struct Silent(Mutex<Vec<StreamMessage>>);

    impl PeerChannel for Silent {
        fn send(&self, message: StreamMessage) -> Result<(), String> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_host_times_out() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 5);
        client.connect_host(Arc::new(Silent(Default::default())));

        let result = client.request(&key("a"), "glb", 0).handle.wait().await;
        match result {
            Err(AssetError::StreamFailed { reason, .. }) => assert_eq!(reason, "timeout"),
            other => panic!("Expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_and_dedup() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 30);
        let host = Arc::new(Silent(Default::default()));
        client.connect_host(host.clone());

        let a = client.request(&key("a"), "glb", 0);
        let a_again = client.request(&key("a"), "glb", 0);
        let b = client.request(&key("b"), "glb", 0);
        let c = client.request(&key("c"), "glb", 0);
        assert!(a.is_new);
        assert!(!a_again.is_new);
        assert!(b.is_new && c.is_new);

        // Two run, the third waits its turn; only one request went out for "a".
        assert_eq!(client.active_count(), 2);
        assert_eq!(
            client.info(&key("c")).map(|i| i.status),
            Some(TransferStatus::Queued)
        );
        assert_eq!(host.0.lock().len(), 2);

        // The host refusing "a" frees a slot for "c".
        let reply: Arc<dyn PeerChannel> = host.clone();
        client.handle_message(
            reply,
            StreamMessage::AssetFailed {
                key: key("a"),
                reason: "nope".into(),
            },
        );
        assert!(a_again.handle.wait().await.is_err());
        assert_eq!(
            client.info(&key("c")).map(|i| i.status),
            Some(TransferStatus::Active)
        );
        assert_eq!(
            *host.0.lock().last().unwrap(),
            StreamMessage::AssetRequest { key: key("c") }
        );
        assert_eq!(client.started_count(), 3);
    }

    #[tokio::test]
    async fn test_bad_chunk_fails_transfer() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 30);
        let host = Arc::new(Silent(Default::default()));
        client.connect_host(host.clone());

        let enqueued = client.request(&key("a"), "glb", 0);
        let frame = StreamMessage::AssetChunk {
            key: key("a"),
            index: 7,
            total: 2,
            compressed_bytes: vec![],
        }
        .encode()
        .unwrap();
        client.handle_frame(host, &frame).unwrap();

        match enqueued.handle.wait().await {
            Err(AssetError::StreamFailed { reason, .. }) => assert!(reason.contains("out of range")),
            other => panic!("Expected a failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_huge_chunk_total_fails_transfer() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, disk, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 30);
        let host = Arc::new(Silent(Default::default()));
        client.connect_host(host.clone());

        let enqueued = client.request(&key("a"), "glb", 0);
        client.handle_message(
            host,
            StreamMessage::AssetChunk {
                key: key("a"),
                index: 0,
                total: u32::MAX,
                compressed_bytes: vec![0],
            },
        );

        match enqueued.handle.wait().await {
            Err(AssetError::StreamFailed { reason, .. }) => assert!(reason.contains("over the limit")),
            other => panic!("Expected a failure, got {:?}", other),
        }
        assert!(!disk.has(&key("a")));
        assert_eq!(client.active_count(), 0);
    }

    #[tokio::test]
    async fn test_replies_from_other_peers_are_ignored() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let (_, _, client) = streamer(tmp_dir.path(), HashMap::new(), 2, 30);
        let host = Arc::new(Silent(Default::default()));
        client.connect_host(host.clone());
        let stranger = Arc::new(Silent(Default::default()));

        let enqueued = client.request(&key("a"), "glb", 0);
        client.handle_message(
            stranger.clone(),
            StreamMessage::AssetFailed {
                key: key("a"),
                reason: "nope".into(),
            },
        );
        client.handle_message(
            stranger.clone(),
            StreamMessage::AssetChunk {
                key: key("a"),
                index: 0,
                total: 1,
                compressed_bytes: lz4_flex::compress_prepend_size(b"forged"),
            },
        );
        client.handle_message(stranger, StreamMessage::AssetComplete { key: key("a") });
        assert_eq!(
            client.info(&key("a")).map(|i| (i.status, i.progress)),
            Some((TransferStatus::Active, None))
        );
        assert!(enqueued.handle.try_result().is_none());

        // The same refusal from the host does end it.
        client.handle_message(
            host,
            StreamMessage::AssetFailed {
                key: key("a"),
                reason: "nope".into(),
            },
        );
        assert!(matches!(
            enqueued.handle.wait().await,
            Err(AssetError::StreamFailed { .. })
        ));
    }
}
