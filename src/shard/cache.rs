use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::metrics::metrics;

use super::Shard;

/// Process-wide store of discovered shard maps, one per cache key (user).
///
/// Every operation takes the one mutex; none of them does I/O.
pub struct ShardCache {
    inner: Mutex<Inner>,
    update_limit: usize,
}

#[derive(Default)]
struct Inner {
    maps: HashMap<String, Shard>,
    /// Discoveries in flight per key; survives `clear`
    in_flight: HashMap<String, usize>,
    stats: CacheStats,
}

/// Snapshot of cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub updates: u64,
    pub stale: u64,
    pub entries: usize,
}

impl ShardCache {
    pub fn new(update_limit: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            update_limit: update_limit.max(1),
        }
    }

    /// Cached shard for `key` if it is at most `max_age` old
    pub fn get(&self, key: &str, max_age: Duration) -> Option<Shard> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let found = match inner.maps.get(key) {
            None => None,
            Some(shard) if age(shard) <= max_age => Some(shard.clone()),
            Some(_) => {
                inner.stats.stale += 1;
                metrics().record_cache_stale();
                debug!(key = key, "Cached shard map is stale");
                return None;
            }
        };

        match found {
            Some(shard) => {
                inner.stats.hits += 1;
                metrics().record_cache_hit();
                Some(shard)
            }
            None => {
                inner.stats.misses += 1;
                metrics().record_cache_miss();
                None
            }
        }
    }

    /// Like [`get`](Self::get) but tolerates `max_staleness` on top of
    /// `max_age`. Entries older than that are dropped.
    pub fn get_stale(&self, key: &str, max_age: Duration, max_staleness: Duration) -> Option<Shard> {
        let mut inner = self.inner.lock();
        let limit = max_age.saturating_add(max_staleness);
        let shard_age = inner.maps.get(key).map(age)?;

        if shard_age <= limit {
            inner.stats.stale += 1;
            metrics().record_cache_stale();
            return inner.maps.get(key).cloned();
        }

        inner.maps.remove(key);
        inner.stats.misses += 1;
        metrics().record_cache_miss();
        debug!(key = key, age_secs = shard_age.as_secs(), "Dropped expired shard map");
        None
    }

    /// Install `shard` unless a newer one is already cached, and release one
    /// in-flight slot for `key`
    pub fn update(&self, shard: Shard, key: &str) {
        let mut inner = self.inner.lock();
        let install = inner
            .maps
            .get(key)
            .map_or(true, |current| shard.newer_than(current));

        if install {
            inner.maps.insert(key.to_string(), shard.snapshot());
            inner.stats.updates += 1;
            metrics().record_cache_update();
            info!(key = key, "Updated shard map");
        }
        release(&mut inner, key);
    }

    /// Claim an in-flight slot for `key`; true obliges the caller to call
    /// [`update`](Self::update) or [`cancel_update`](Self::cancel_update)
    pub fn start_update(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let count = inner.in_flight.entry(key.to_string()).or_insert(0);
        if *count < self.update_limit {
            *count += 1;
            true
        } else {
            false
        }
    }

    pub fn cancel_update(&self, key: &str) {
        let mut inner = self.inner.lock();
        release(&mut inner, key);
        debug!(key = key, "Cancelled shard map update");
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let dropped = inner.maps.len();
        inner.maps.clear();
        info!(entries = dropped, "Cleared shard cache");
    }

    /// Force the next `get` to miss while keeping data for `get_stale`
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.lock();
        for shard in inner.maps.values_mut() {
            shard.last_updated = UNIX_EPOCH;
        }
        info!(entries = inner.maps.len(), "Invalidated shard cache");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            entries: inner.maps.len(),
            ..inner.stats
        }
    }

    pub fn in_flight(&self, key: &str) -> usize {
        self.inner.lock().in_flight.get(key).copied().unwrap_or(0)
    }
}

fn release(inner: &mut Inner, key: &str) {
    if let Some(count) = inner.in_flight.get_mut(key) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            inner.in_flight.remove(key);
        }
    }
}

/// A timestamp in the future counts as fresh
fn age(shard: &Shard) -> Duration {
    SystemTime::now()
        .duration_since(shard.last_updated)
        .unwrap_or(Duration::ZERO)
}
