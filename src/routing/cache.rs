//! Memoized route resolution keyed by method and exact path.

use crate::{routing::Params, Method};
use dashmap::DashMap;
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

/// Outcome of resolving a (method, path) pair against the route table.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum CachedMatch {
    /// Index into the method's route list plus the captured parameters.
    Found { index: usize, params: Arc<Params> },
    NotFound,
}

#[derive(Debug)]
struct Entry {
    outcome: CachedMatch,
    generation: u64,
    last_access: AtomicU64,
}

/// Hit/miss counters of the route match cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RouteCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl RouteCacheStats {
    /// Share of lookups answered from the cache, `0.0` before any lookup.
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

/// Concurrent cache of route lookups.
///
/// Every outcome is stored, including misses. `clear` bumps a generation
/// counter so results computed against an older table are never stored.
#[derive(Debug)]
pub(crate) struct RouteMatchCache {
    entries: DashMap<String, Entry>,
    capacity: usize,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    epoch: Instant,
}

impl RouteMatchCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(4),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    #[inline]
    fn key(method: Method, path: &str) -> String {
        let mut key = String::with_capacity(method.as_str().len() + 1 + path.len());
        key.push_str(method.as_str());
        key.push(' ');
        key.push_str(path);
        key
    }

    #[inline]
    fn now(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Current generation; read it before resolving a path.
    #[inline]
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, method: Method, path: &str) -> Option<CachedMatch> {
        let generation = self.generation();

        let found = self
            .entries
            .get(&Self::key(method, path))
            .filter(|entry| entry.generation == generation)
            .map(|entry| {
                entry.last_access.store(self.now(), Ordering::Relaxed);
                entry.outcome.clone()
            });

        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Stores an outcome computed while `generation` was current.
    pub(crate) fn insert(&self, method: Method, path: &str, outcome: CachedMatch, generation: u64) {
        if generation != self.generation() {
            return;
        }

        if self.entries.len() >= self.capacity {
            self.evict();
        }

        self.entries.insert(
            Self::key(method, path),
            Entry {
                outcome,
                generation,
                last_access: AtomicU64::new(self.now()),
            },
        );
    }

    /// Drops the least recently used entries down to three quarters of capacity.
    fn evict(&self) {
        let target = self.capacity * 3 / 4;
        let len = self.entries.len();
        if len <= target {
            return;
        }

        let mut ages: Vec<(u64, String)> = self
            .entries
            .iter()
            .map(|e| (e.last_access.load(Ordering::Relaxed), e.key().clone()))
            .collect();

        let remove = len - target;
        if remove < ages.len() {
            ages.select_nth_unstable_by_key(remove, |(age, _)| *age);
        }

        for (_, key) in ages.into_iter().take(remove) {
            self.entries.remove(&key);
        }

        tracing::debug!(removed = remove, "Route cache evicted entries");
    }

    pub(crate) fn clear(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.entries.clear();
    }

    pub(crate) fn stats(&self) -> RouteCacheStats {
        RouteCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod cache_tests {
    use super::*;

    fn found(index: usize) -> CachedMatch {
        CachedMatch::Found {
            index,
            params: Arc::new(Params::default()),
        }
    }

    #[test]
    fn hit_and_miss() {
        let cache = RouteMatchCache::new(16);
        let gen = cache.generation();

        assert_eq!(cache.get(Method::Get, "/a"), None);
        cache.insert(Method::Get, "/a", found(3), gen);
        cache.insert(Method::Get, "/missing", CachedMatch::NotFound, gen);

        assert_eq!(cache.get(Method::Get, "/a"), Some(found(3)));
        assert_eq!(cache.get(Method::Post, "/a"), None);
        assert_eq!(cache.get(Method::Get, "/missing"), Some(CachedMatch::NotFound));

        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (2, 2, 2));
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn stale_generation_is_ignored() {
        let cache = RouteMatchCache::new(16);
        let gen = cache.generation();
        cache.insert(Method::Get, "/a", found(0), gen);

        cache.clear();
        assert_eq!(cache.get(Method::Get, "/a"), None);

        cache.insert(Method::Get, "/a", found(0), gen);
        assert_eq!(cache.get(Method::Get, "/a"), None);
        assert_eq!(cache.stats().entries, 0);
    }

    #[test]
    fn eviction_keeps_recent_entries() {
        let cache = RouteMatchCache::new(8);
        let gen = cache.generation();

        for i in 0..8 {
            cache.insert(Method::Get, &format!("/{i}"), found(i), gen);
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        // Touch the oldest so it survives
        assert!(cache.get(Method::Get, "/0").is_some());

        cache.insert(Method::Get, "/new", found(99), gen);

        let stats = cache.stats();
        assert_eq!(stats.entries, 7);
        assert!(cache.get(Method::Get, "/0").is_some());
        assert!(cache.get(Method::Get, "/new").is_some());
        assert!(cache.get(Method::Get, "/1").is_none());
    }
}
