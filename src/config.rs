//! Configuration for the caches and transfer queues.
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_builder::Builder)]
#[builder(default, setter(into), build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct AssetConfig {
    /// Directory holding downloaded and streamed files.
    pub cache_root: PathBuf,
    /// Point past which the disk cache starts evicting, in bytes.
    pub max_cache_bytes: u64,
    pub max_concurrent_downloads: usize,
    pub download_timeout_secs: u64,
    pub max_concurrent_streams: usize,
    /// Size of each chunk before compression.
    pub stream_chunk_size: usize,
    /// How long a peer transfer may go without receiving a chunk.
    pub stream_timeout_secs: u64,
    pub user_agent: String,
}

impl Default for AssetConfig {
    fn default() -> Self {
        AssetConfig {
            cache_root: dirs::cache_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("asset_relay"),
            max_cache_bytes: 512 * 1024 * 1024,
            max_concurrent_downloads: 3,
            download_timeout_secs: 60,
            max_concurrent_streams: 2,
            stream_chunk_size: crate::stream::DEFAULT_CHUNK_SIZE,
            stream_timeout_secs: 30,
            user_agent: concat!("asset_relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl AssetConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        let defaults = AssetConfig::default();
        let candidate = AssetConfig {
            cache_root: self.cache_root.clone().unwrap_or(defaults.cache_root),
            max_cache_bytes: self.max_cache_bytes.unwrap_or(defaults.max_cache_bytes),
            max_concurrent_downloads: self
                .max_concurrent_downloads
                .unwrap_or(defaults.max_concurrent_downloads),
            download_timeout_secs: self
                .download_timeout_secs
                .unwrap_or(defaults.download_timeout_secs),
            max_concurrent_streams: self
                .max_concurrent_streams
                .unwrap_or(defaults.max_concurrent_streams),
            stream_chunk_size: self.stream_chunk_size.unwrap_or(defaults.stream_chunk_size),
            stream_timeout_secs: self
                .stream_timeout_secs
                .unwrap_or(defaults.stream_timeout_secs),
            user_agent: self.user_agent.clone().unwrap_or(defaults.user_agent),
        };
        candidate.validate().map_err(|e| e.to_string())
    }
}

impl AssetConfig {
    /// Load a config from a JSON file.  Missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> Result<AssetConfig, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: AssetConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.max_cache_bytes == 0, "max_cache_bytes must be non-zero"),
            (
                self.max_concurrent_downloads == 0,
                "max_concurrent_downloads must be at least 1",
            ),
            (
                self.max_concurrent_streams == 0,
                "max_concurrent_streams must be at least 1",
            ),
            (self.stream_chunk_size == 0, "stream_chunk_size must be non-zero"),
            (
                self.download_timeout_secs == 0,
                "download_timeout_secs must be non-zero",
            ),
            (
                self.stream_timeout_secs == 0,
                "stream_timeout_secs must be non-zero",
            ),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, msg)) => Err(ConfigError::Invalid(msg.to_string())),
            None => Ok(()),
        }
    }

    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }
}
