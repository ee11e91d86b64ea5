//! The [MemoryCache]: parsed model templates for the current session, keyed by the file they came from.
//!
//! Keying by resolved path rather than [CacheKey] means two keys resolving to the same bundled file share one parse.
//! Only one parse per path is ever running; everyone asking for that path while it runs waits on the same future.
//!
//! Sessions end with [MemoryCache::clear].  A parse that started in an earlier session still finishes and its waiters
//! still get the result, but it is never stored into the new session's map.
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

use crate::*;

type ParseFuture<M> = Shared<BoxFuture<'static, Result<M>>>;
type PathMap<V> = std::collections::HashMap<PathBuf, V, ahash::RandomState>;

struct Session<M> {
    generation: u64,
    templates: PathMap<M>,
    in_flight: PathMap<ParseFuture<M>>,
}

pub struct MemoryCache<L: ModelLoader> {
    loader: Arc<L>,
    session: Arc<Mutex<Session<L::Model>>>,
    parses: Arc<AtomicUsize>,
}

impl<L: ModelLoader> Clone for MemoryCache<L> {
    fn clone(&self) -> Self {
        MemoryCache {
            loader: self.loader.clone(),
            session: self.session.clone(),
            parses: self.parses.clone(),
        }
    }
}

fn parse_failed(path: &Path, reason: impl ToString) -> AssetError {
    AssetError::ParseFailed {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

impl<L: ModelLoader> MemoryCache<L> {
    pub fn new(loader: L) -> MemoryCache<L> {
        MemoryCache {
            loader: Arc::new(loader),
            session: Arc::new(Mutex::new(Session {
                generation: 0,
                templates: Default::default(),
                in_flight: Default::default(),
            })),
            parses: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn loader(&self) -> &L {
        &self.loader
    }

    /// Get a clone of the template for `path`, parsing it on the blocking pool if nobody has yet.
    pub async fn get_or_load(&self, path: &Path) -> Result<L::Model> {
        let parse = {
            let mut session = self.session.lock();
            if let Some(t) = session.templates.get(path) {
                tracing::debug!(path = %path.display(), "Template cache hit");
                return Ok(t.clone());
            }
            match session.in_flight.get(path) {
                Some(f) => f.clone(),
                None => {
                    let f = self.start_parse(path.to_path_buf(), session.generation);
                    session.in_flight.insert(path.to_path_buf(), f.clone());
                    f
                }
            }
        };
        parse.await
    }

    fn start_parse(&self, path: PathBuf, generation: u64) -> ParseFuture<L::Model> {
        let loader = self.loader.clone();
        let session = self.session.clone();
        let parses = self.parses.clone();

        // Spawned rather than driven by the waiters, so that the parse completes even if every waiter goes away.
        let task = tokio::spawn(async move {
            let parse_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                parses.fetch_add(1, Ordering::SeqCst);
                let file = File::open(&parse_path).map_err(|e| parse_failed(&parse_path, e))?;
                loader
                    .decode(BufReader::new(file))
                    .map_err(|e| parse_failed(&parse_path, e))
            })
            .await
            .unwrap_or_else(|e| Err(parse_failed(&path, e)));

            let mut session = session.lock();
            if session.generation == generation {
                session.in_flight.remove(&path);
                match &result {
                    Ok(model) => {
                        session.templates.insert(path.clone(), model.clone());
                    }
                    Err(e) => tracing::warn!("{}", e),
                }
            } else {
                tracing::debug!(path = %path.display(), "Discarding template parsed for an ended session");
            }
            result
        });

        async move {
            match task.await {
                Ok(r) => r,
                Err(e) => Err(AssetError::ParseFailed {
                    path: PathBuf::new(),
                    reason: e.to_string(),
                }),
            }
        }
        .boxed()
        .shared()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.session.lock().templates.contains_key(path)
    }

    /// Drop every template and start a new session.
    pub fn clear(&self) {
        let mut session = self.session.lock();
        session.generation += 1;
        session.templates.clear();
        session.in_flight.clear();
        tracing::debug!(generation = session.generation, "Started new template session");
    }

    pub fn len(&self) -> usize {
        self.session.lock().templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight_count(&self) -> usize {
        self.session.lock().in_flight.len()
    }

    /// How many parses have been started over the lifetime of this cache.
    pub fn parse_count(&self) -> usize {
        self.parses.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::io::Read;

    use super::*;

    /// Reads the whole file as a string.  Files starting with `bad` fail to parse.
    #[derive(Default)]
    pub(crate) struct StringLoader {
        pub(crate) gate: Mutex<()>,
    }

    #[derive(Debug, thiserror::Error)]
    #[error("not a model: {0}")]
    pub(crate) struct NotAModel(pub(crate) String);

    impl ModelLoader for StringLoader {
        type Model = String;
        type Error = NotAModel;

        fn decode<R: Read>(&self, mut reader: R) -> std::result::Result<String, NotAModel> {
            let _gate = self.gate.lock();
            let mut out = String::new();
            reader
                .read_to_string(&mut out)
                .map_err(|e| NotAModel(e.to_string()))?;
            if out.starts_with("bad") {
                return Err(NotAModel(out));
            }
            Ok(out)
        }
    }

    fn write(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[tokio::test]
    async fn test_concurrent_loads_parse_once() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = write(tmp_dir.path(), "pikachu.glb", "pikachu mesh");
        let cache = MemoryCache::new(StringLoader::default());

        let loads = (0..8).map(|_| cache.get_or_load(&path));
        let results = futures_util::future::join_all(loads).await;

        assert_eq!(results.len(), 8);
        for r in results {
            assert_eq!(r.unwrap(), "pikachu mesh");
        }
        assert_eq!(cache.parse_count(), 1);
        assert!(cache.contains(&path));
        assert_eq!(cache.in_flight_count(), 0);

        // Later loads are plain hits.
        assert_eq!(cache.get_or_load(&path).await.unwrap(), "pikachu mesh");
        assert_eq!(cache.parse_count(), 1);
    }

    #[tokio::test]
    async fn test_parse_from_ended_session_is_not_stored() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let path = write(tmp_dir.path(), "eevee.glb", "eevee mesh");
        let cache = MemoryCache::new(StringLoader::default());

        let gate = cache.loader().gate.lock();
        let pending = tokio::spawn({
            let cache = cache.clone();
            let path = path.clone();
            async move { cache.get_or_load(&path).await }
        });
        while cache.parse_count() == 0 {
            tokio::task::yield_now().await;
        }

        cache.clear();
        drop(gate);

        // The waiter still gets its template...
        assert_eq!(pending.await.unwrap().unwrap(), "eevee mesh");
        // ...but the new session never sees it.
        assert!(!cache.contains(&path));
        assert!(cache.is_empty());

        assert_eq!(cache.get_or_load(&path).await.unwrap(), "eevee mesh");
        assert_eq!(cache.parse_count(), 2);
        assert!(cache.contains(&path));
    }

    #[tokio::test]
    async fn test_parse_failures() {
        let tmp_dir = tempfile::tempdir().unwrap();
        let bad = write(tmp_dir.path(), "bad.glb", "bad bytes");
        let cache = MemoryCache::new(StringLoader::default());

        assert!(matches!(
            cache.get_or_load(&bad).await,
            Err(AssetError::ParseFailed { .. })
        ));
        assert!(!cache.contains(&bad));

        // Failures aren't remembered; asking again parses again.
        assert!(cache.get_or_load(&bad).await.is_err());
        assert_eq!(cache.parse_count(), 2);

        let missing = tmp_dir.path().join("missing.glb");
        match cache.get_or_load(&missing).await {
            Err(AssetError::ParseFailed { path, .. }) => assert_eq!(path, missing),
            other => panic!("Expected a parse failure, got {:?}", other),
        }
    }
}
