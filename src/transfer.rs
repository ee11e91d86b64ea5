//! Bookkeeping shared by the download and stream queues.
//!
//! Each queued or running transfer has exactly one [Completion]; every request for the same key gets a clone of the
//! same [TransferHandle], which is how duplicate requests attach to the existing transfer instead of starting a new
//! one.
use std::cmp::Ordering;
use std::path::PathBuf;

use tokio::sync::watch;

use crate::*;

pub type TransferResult = Result<PathBuf>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Active,
    Done,
    Failed,
}

/// A snapshot of one transfer, for status displays.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferInfo {
    pub key: CacheKey,
    pub priority: i32,
    pub status: TransferStatus,
    /// From 0 to 1, when known.
    pub progress: Option<f32>,
}

/// Awaitable result of a transfer.
#[derive(Debug, Clone)]
pub struct TransferHandle {
    key: CacheKey,
    rx: watch::Receiver<Option<TransferResult>>,
}

impl TransferHandle {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// The result, if the transfer has finished.
    pub fn try_result(&self) -> Option<TransferResult> {
        self.rx.borrow().clone()
    }

    /// `Done` or `Failed` once finished; `None` while queued or running.
    pub fn finished_status(&self) -> Option<TransferStatus> {
        self.rx.borrow().as_ref().map(|r| match r {
            Ok(_) => TransferStatus::Done,
            Err(_) => TransferStatus::Failed,
        })
    }

    /// Wait for the transfer to finish.
    pub async fn wait(mut self) -> TransferResult {
        loop {
            if let Some(r) = self.rx.borrow().clone() {
                return r;
            }
            if self.rx.changed().await.is_err() {
                // The sender went away without a result; only possible if the runtime shut down mid-transfer.
                return self.rx.borrow().clone().unwrap_or_else(|| {
                    Err(AssetError::NotFound(self.key.clone()))
                });
            }
        }
    }
}

/// What a queue did with a request.
#[derive(Debug, Clone)]
pub struct Enqueued {
    pub handle: TransferHandle,
    /// False when the request attached to a transfer which was already queued or running.
    pub is_new: bool,
}

/// The sending side of a [TransferHandle].
pub(crate) struct Completion {
    tx: watch::Sender<Option<TransferResult>>,
    handle: TransferHandle,
}

impl Completion {
    pub(crate) fn new(key: CacheKey) -> Completion {
        let (tx, rx) = watch::channel(None);
        Completion {
            tx,
            handle: TransferHandle { key, rx },
        }
    }

    pub(crate) fn handle(&self) -> TransferHandle {
        self.handle.clone()
    }

    pub(crate) fn finish(&self, result: TransferResult) {
        // send_replace can't fail for lack of receivers, unlike send.
        self.tx.send_replace(Some(result));
    }
}

/// A queue slot.  Lower priority values are served first, then the order of arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub(crate) priority: i32,
    pub(crate) seq: u64,
    pub(crate) key: CacheKey,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap, so the most urgent entry must compare greatest.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
