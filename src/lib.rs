//! Resolution, caching, and distribution of 3D model assets organized into packs.
//!
//! Games with user-installable content packs want three things from their asset layer: an answer *now* when a file
//! is already on this machine, a background fetch when it isn't, and never parsing the same model twice.  Files which
//! aren't shipped with the application may come from a CDN, or, in a networked session, from whichever peer is
//! hosting it.  This crate provides that pipeline:
//!
//! - [PackRegistry] holds validated pack manifests, mapping each [CacheKey] to a relative path and optional URLs.
//! - [DiskCache] is a persistent, size-capped, least-recently-used store of fetched files, built on the [LruIndex],
//!   which is exposed because it's useful in other contexts.  Files are written atomically, and a file which is being
//!   read is never evicted out from under its reader.
//! - [MemoryCache] keeps parsed model templates for the current session, parsing each file at most once no matter how
//!   many callers ask for it at the same time.
//! - [Downloader] and [Streamer] are bounded priority queues of HTTP fetches and peer transfers respectively.
//! - [Resolver] ties all of the above into one waterfall, and is what applications should talk to.
//! - [PlaceholderUpgrade] shows a stand-in for an entity and swaps the real model in once it arrives.
//!
//! Progress and completion are announced on an [EventBus].  To use this crate, implement [ModelLoader] for your
//! renderer's model type, register some packs, and build a [Resolver] from an [AssetConfig].  To take part in
//! networked sessions, implement [PeerChannel] over your transport and feed received messages to
//! [Streamer::handle_message].
mod bundled_files;
mod config;
mod disk_cache;
mod download;
mod error;
mod events;
mod key;
mod lru_index;
mod memory_cache;
mod placeholder;
mod registry;
mod resolver;
mod stream;
mod traits;
mod transfer;

pub use bundled_files::*;
pub use config::*;
pub use disk_cache::*;
pub use download::*;
pub use error::*;
pub use events::*;
pub use key::*;
pub use lru_index::*;
pub use memory_cache::*;
pub use placeholder::*;
pub use registry::*;
pub use resolver::*;
pub use stream::*;
pub use traits::*;
pub use transfer::*;
