//! Seams where the application plugs into the pipeline.
//!
//! A [ModelLoader] turns file bytes into a model template, the way the application's renderer wants it; the caches
//! only ever store and clone what it returns.  A [LocalSource] answers "is this key already on this machine?", which
//! is all a peer responder is allowed to ask.
use std::io::Read;
use std::path::PathBuf;

use crate::CacheKey;

/// Knows how to get from a reader to a decoded model template in memory.
///
/// The template is cloned for every instance handed out, so it should be cheap to clone (typically `Arc`s inside).
pub trait ModelLoader: Send + Sync + 'static {
    type Model: Clone + Send + Sync + 'static;
    type Error: std::error::Error;

    fn decode<R: Read>(&self, reader: R) -> Result<Self::Model, Self::Error>;
}

/// Resolve a key to a file that is authoritative on this machine, without any network or cache involvement.
pub trait LocalSource: Send + Sync + 'static {
    fn local_path(&self, key: &CacheKey) -> Option<PathBuf>;
}
