//! Error types.
//!
//! [AssetError] is what resolution produces. It is `Clone` because one finished transfer or parse is handed to
//! every caller waiting on it.
use std::path::PathBuf;

use crate::CacheKey;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssetError {
    #[error("no way to resolve {0}")]
    NotFound(CacheKey),

    #[error("download of {key} failed: {reason}")]
    DownloadFailed { key: CacheKey, reason: String },

    #[error("stream of {key} failed: {reason}")]
    StreamFailed { key: CacheKey, reason: String },

    #[error("failed to parse {}: {reason}", path.display())]
    ParseFailed { path: PathBuf, reason: String },

    #[error("failed to write cache entry for {key}: {reason}")]
    CacheWriteFailed { key: CacheKey, reason: String },
}

pub type Result<T, E = AssetError> = std::result::Result<T, E>;

/// Why a pack manifest was rejected.  The whole pack is rejected, never individual assets.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    #[error("could not read manifest: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed manifest: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid identifier {id:?} in {field}")]
    InvalidId { field: &'static str, id: String },

    #[error("asset {0:?} has no variants")]
    NoVariants(String),

    #[error("path {path:?} in asset {asset_id:?} is not a valid relative path")]
    InvalidPath { asset_id: String, path: String },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Problems with peer streaming frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("could not encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("could not decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("could not decompress chunk {index}: {reason}")]
    Decompress { index: u32, reason: String },

    #[error("chunk {index} is out of range for a transfer of {total} chunks")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("transfer of {total} chunks is over the limit of {max}")]
    TooManyChunks { total: u32, max: u32 },

    #[error("chunk {index} claims {size} bytes, more than the chunk size of {max}")]
    ChunkTooLarge { index: u32, size: usize, max: usize },

    #[error("chunk total changed from {expected} to {got} mid-transfer")]
    TotalMismatch { expected: u32, got: u32 },

    #[error("transfer is missing {0} chunks")]
    Incomplete(u32),
}
