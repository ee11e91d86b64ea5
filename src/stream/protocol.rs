//! Wire messages for peer streaming, and the chunking on either side of them.
//!
//! A transfer is `AssetRequest` from the requester, answered by either `AssetFailed`, or by every `AssetChunk` in
//! index order followed by `AssetComplete`.  Each chunk is a fixed-size slice of the file (the last may be shorter),
//! compressed on its own so the requester can decompress as chunks arrive.  The transport carrying the frames is
//! someone else's problem; it only has to be reliable.
use serde::{Deserialize, Serialize};

use crate::*;

pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamMessage {
    AssetRequest {
        key: CacheKey,
    },
    AssetChunk {
        key: CacheKey,
        index: u32,
        total: u32,
        compressed_bytes: Vec<u8>,
    },
    AssetComplete {
        key: CacheKey,
    },
    AssetFailed {
        key: CacheKey,
        reason: String,
    },
}

impl StreamMessage {
    pub fn key(&self) -> &CacheKey {
        match self {
            StreamMessage::AssetRequest { key }
            | StreamMessage::AssetChunk { key, .. }
            | StreamMessage::AssetComplete { key }
            | StreamMessage::AssetFailed { key, .. } => key,
        }
    }

    /// Encode into a frame for the transport.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(bincode::serde::encode_to_vec(
            self,
            bincode::config::standard(),
        )?)
    }

    pub fn decode(frame: &[u8]) -> Result<StreamMessage, ProtocolError> {
        let (message, _) = bincode::serde::decode_from_slice(frame, bincode::config::standard())?;
        Ok(message)
    }
}

/// Split a whole file into compressed chunk messages, in the order they must be sent.
///
/// An empty file still produces one (empty) chunk, so every transfer carries at least one chunk.
pub fn split_into_chunks(key: &CacheKey, bytes: &[u8], chunk_size: usize) -> Vec<StreamMessage> {
    let chunk_size = chunk_size.max(1);
    let total = bytes.len().div_ceil(chunk_size).max(1) as u32;
    (0..total)
        .map(|index| {
            let start = index as usize * chunk_size;
            let end = (start + chunk_size).min(bytes.len());
            StreamMessage::AssetChunk {
                key: key.clone(),
                index,
                total,
                compressed_bytes: lz4_flex::compress_prepend_size(&bytes[start..end]),
            }
        })
        .collect()
}

/// Collects the chunks of one transfer and reassembles them in index order.
///
/// Every chunk carries its decompressed size in a four byte little-endian prefix.  Chunks claiming more than
/// `max_chunk_bytes` are rejected before anything is decompressed.
#[derive(Debug)]
pub struct ChunkAssembler {
    total: u32,
    max_chunk_bytes: usize,
    chunks: Vec<Option<Vec<u8>>>,
    received: u32,
}

fn declared_size(index: u32, compressed: &[u8]) -> Result<usize, ProtocolError> {
    let prefix: [u8; 4] = compressed
        .get(..4)
        .and_then(|p| p.try_into().ok())
        .ok_or_else(|| ProtocolError::Decompress {
            index,
            reason: "missing size prefix".to_string(),
        })?;
    Ok(u32::from_le_bytes(prefix) as usize)
}

impl ChunkAssembler {
    /// The caller bounds `total`; this allocates one slot per chunk.
    pub fn new(total: u32, max_chunk_bytes: usize) -> ChunkAssembler {
        ChunkAssembler {
            total,
            max_chunk_bytes,
            chunks: vec![None; total as usize],
            received: 0,
        }
    }

    pub fn total(&self) -> u32 {
        self.total
    }

    pub fn received(&self) -> u32 {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.total
    }

    /// Record a chunk.  A repeated index replaces the earlier copy without counting twice.
    pub fn accept(&mut self, index: u32, total: u32, compressed: Vec<u8>) -> Result<(), ProtocolError> {
        if total != self.total {
            return Err(ProtocolError::TotalMismatch {
                expected: self.total,
                got: total,
            });
        }
        if index >= self.total {
            return Err(ProtocolError::ChunkOutOfRange { index, total });
        }
        let size = declared_size(index, &compressed)?;
        if size > self.max_chunk_bytes {
            return Err(ProtocolError::ChunkTooLarge {
                index,
                size,
                max: self.max_chunk_bytes,
            });
        }
        let slot = &mut self.chunks[index as usize];
        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(compressed);
        Ok(())
    }

    /// Decompress and concatenate every chunk in index order.
    pub fn assemble(self) -> Result<Vec<u8>, ProtocolError> {
        if !self.is_complete() {
            return Err(ProtocolError::Incomplete(self.total - self.received));
        }
        let mut out = vec![];
        for (index, chunk) in self.chunks.into_iter().enumerate() {
            let index = index as u32;
            let compressed = chunk.ok_or(ProtocolError::Incomplete(1))?;
            let size = declared_size(index, &compressed)?;
            let start = out.len();
            out.resize(start + size, 0);
            let written = lz4_flex::block::decompress_into(&compressed[4..], &mut out[start..]).map_err(|e| {
                ProtocolError::Decompress {
                    index,
                    reason: e.to_string(),
                }
            })?;
            if written != size {
                return Err(ProtocolError::Decompress {
                    index,
                    reason: format!("expected {} bytes, got {}", size, written),
                });
            }
        }
        Ok(out)
    }
}
