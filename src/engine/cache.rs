use std::collections::HashMap;
use std::sync::Arc;

use moka::future::Cache;

use crate::diff;
use crate::git::LocalRepo;
use crate::types::CommitId;

/// A cached per-PR value, or the message of the fetch that failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEntry<T> {
    Ready(T),
    Failed(String),
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup<T> {
    Hit(T),
    Miss,
    /// A previous fetch failed. Callers re-fetch; the message is kept for display.
    Failed(String),
}

/// Per-PR cache scoped to one refresh epoch.
///
/// Values go in and come out by clone, so nothing outside the cache holds a
/// reference into it. An entry is only ever replaced wholesale.
pub struct PrCache<T> {
    entries: HashMap<u64, CacheEntry<T>>,
}

impl<T> Default for PrCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: Clone> PrCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, number: u64) -> Lookup<T> {
        match self.entries.get(&number) {
            Some(CacheEntry::Ready(value)) => Lookup::Hit(value.clone()),
            Some(CacheEntry::Failed(message)) => Lookup::Failed(message.clone()),
            None => Lookup::Miss,
        }
    }

    /// Whether a read for `number` would have to go to the source.
    pub fn needs_fetch(&self, number: u64) -> bool {
        !matches!(self.entries.get(&number), Some(CacheEntry::Ready(_)))
    }

    pub fn store(&mut self, number: u64, result: Result<T, String>) {
        let entry = match result {
            Ok(value) => CacheEntry::Ready(value),
            Err(message) => CacheEntry::Failed(message),
        };
        self.entries.insert(number, entry);
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }
}

/// File contents keyed by `(commit, path)`.
///
/// Commit objects are immutable, so entries never need invalidation; the
/// capacity bound is the only eviction.
#[derive(Clone)]
pub struct ContentCache {
    inner: Cache<(CommitId, String), Arc<str>>,
}

impl ContentCache {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Cache::builder().max_capacity(capacity).build(),
        }
    }

    /// Content of `path` at `rev`, loading it on the blocking pool on a miss.
    pub async fn load(&self, repo: Arc<dyn LocalRepo>, rev: CommitId, path: String) -> Arc<str> {
        let key = (rev.clone(), path.clone());
        let load_blob = move || diff::file_content(repo.as_ref(), &rev, &path);
        self.inner
            .get_with(key, async move {
                let content = tokio::task::spawn_blocking(load_blob)
                    .await
                    .unwrap_or_else(|e| {
                        tracing::warn!("cache: content loader failed: {e}");
                        String::new()
                    });
                Arc::from(content)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::stub::StubRepo;

    #[test]
    fn failure_marker_is_a_refetch() {
        let mut cache: PrCache<u32> = PrCache::new();
        assert_eq!(cache.lookup(3), Lookup::Miss);
        cache.store(3, Err("boom".to_owned()));
        assert_eq!(cache.lookup(3), Lookup::Failed("boom".to_owned()));
        assert!(cache.needs_fetch(3));

        cache.store(3, Ok(9));
        assert_eq!(cache.lookup(3), Lookup::Hit(9));
        assert!(!cache.needs_fetch(3));
    }

    #[test]
    fn invalidate_clears_everything() {
        let mut cache: PrCache<u32> = PrCache::new();
        cache.store(1, Ok(1));
        cache.store(2, Err("x".to_owned()));
        cache.invalidate_all();
        assert_eq!(cache.lookup(1), Lookup::Miss);
        assert_eq!(cache.lookup(2), Lookup::Miss);
    }

    #[tokio::test]
    async fn content_cache_reads_once_per_key() {
        let stub = Arc::new(StubRepo::new());
        stub.add_commit("c1", &[], &[("a.txt", "hello")]);
        stub.make_local("c1");
        let repo: Arc<dyn LocalRepo> = stub.clone();
        let cache = ContentCache::new(16);
        let c1 = CommitId::from("c1");

        let first = cache.load(repo.clone(), c1.clone(), "a.txt".into()).await;
        assert_eq!(&*first, "hello");
        // A later change to the store is invisible: content at a commit never changes.
        stub.add_commit("c1", &[], &[("a.txt", "rewritten")]);
        let second = cache.load(repo, c1.clone(), "a.txt".into()).await;
        assert_eq!(&*second, "hello");

        let missing = cache.load(stub, c1, "nope.txt".into()).await;
        assert_eq!(&*missing, "");
    }
}
