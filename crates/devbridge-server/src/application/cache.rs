//! TTL + capacity bounded response cache with single-flight fetches.
//!
//! # Eviction is FIFO, not LRU
//!
//! When an insert pushes the cache past its capacity, the entry with the
//! oldest *insertion* is evicted.  Reading an entry does not refresh it.
//! A stale frame is still stale no matter how often it is read, so access
//! recency says nothing useful here.
//!
//! # Single flight
//!
//! `fetch_or_get` on a miss records the key as in flight.  Concurrent callers
//! for the same key subscribe to that fetch instead of starting their own, so
//! N simultaneous misses cost one device round trip and all N callers see the
//! same result.  A failed fetch is shared the same way but never stored.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use devbridge_core::task::ScheduledTask;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::debug;

use crate::domain::{BridgeError, CacheConfig};
use crate::infrastructure::events::lock;

/// Builds a cache key from the request target and its options.
///
/// Requests without an explicit target share the `"default"` namespace.
pub fn cache_key<O: Serialize>(target: Option<&str>, options: &O) -> String {
    let options = serde_json::to_string(options).unwrap_or_default();
    format!("{}:{options}", target.unwrap_or("default"))
}

/// Counters reported by [`ResponseCache::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub evictions: u64,
    pub entries: usize,
}

struct CacheEntry<T> {
    value: T,
    inserted_at: Instant,
    seq: u64,
}

type FetchResult<T> = Result<T, BridgeError>;

struct CacheState<T> {
    entries: HashMap<String, CacheEntry<T>>,
    /// Insertion sequence → key; the first entry is the eviction victim.
    order: BTreeMap<u64, String>,
    in_flight: HashMap<String, broadcast::Sender<FetchResult<T>>>,
    next_seq: u64,
    stats: CacheStats,
}

impl<T: Clone> CacheState<T> {
    fn fresh(&mut self, key: &str, ttl: Duration) -> Option<T> {
        let expired = match self.entries.get(key) {
            Some(entry) if entry.inserted_at.elapsed() <= ttl => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.remove(key);
        }
        None
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn insert(&mut self, key: &str, value: T, capacity: usize) {
        self.remove(key);
        self.next_seq += 1;
        let seq = self.next_seq;
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                seq,
            },
        );
        self.order.insert(seq, key.to_string());

        while self.entries.len() > capacity {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            self.stats.evictions += 1;
        }
    }
}

/// Memoizes device responses per key.
pub struct ResponseCache<T> {
    name: &'static str,
    capacity: usize,
    ttl: Duration,
    state: Mutex<CacheState<T>>,
    sweeper: Mutex<Option<ScheduledTask>>,
}

impl<T> ResponseCache<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            capacity: capacity.max(1),
            ttl,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                order: BTreeMap::new(),
                in_flight: HashMap::new(),
                next_seq: 0,
                stats: CacheStats::default(),
            }),
            sweeper: Mutex::new(None),
        }
    }

    pub fn from_config(name: &'static str, config: &CacheConfig) -> Self {
        Self::new(name, config.capacity, config.ttl)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Starts the background sweep.  The task holds only a weak reference,
    /// so it stops by itself once the cache is dropped.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let task = ScheduledTask::every("cache-sweep", interval, move || {
            let weak = weak.clone();
            async move {
                match weak.upgrade() {
                    Some(cache) => {
                        cache.sweep();
                        true
                    }
                    None => false,
                }
            }
        });
        *lock(&self.sweeper) = Some(task);
    }

    pub fn stop_sweeper(&self) {
        lock(&self.sweeper).take();
    }

    /// Returns the cached value if it is younger than the TTL.
    pub fn get(&self, key: &str) -> Option<T> {
        let mut state = lock(&self.state);
        let value = state.fresh(key, self.ttl);
        match value {
            Some(_) => state.stats.hits += 1,
            None => state.stats.misses += 1,
        }
        value
    }

    pub fn insert(&self, key: &str, value: T) {
        lock(&self.state).insert(key, value, self.capacity);
    }

    /// Returns the cached value, or runs `fetcher` once for all concurrent
    /// callers of this key and caches its success.
    ///
    /// # Errors
    ///
    /// Returns the fetcher's error, shared with every caller that joined the
    /// same fetch.
    pub async fn fetch_or_get<F, Fut>(&self, key: &str, fetcher: F) -> Result<T, BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, BridgeError>>,
    {
        let leader = {
            let mut state = lock(&self.state);
            if let Some(value) = state.fresh(key, self.ttl) {
                state.stats.hits += 1;
                return Ok(value);
            }
            state.stats.misses += 1;
            match state.in_flight.get(key) {
                Some(tx) => Err(tx.subscribe()),
                None => {
                    let (tx, _) = broadcast::channel(1);
                    state.in_flight.insert(key.to_string(), tx.clone());
                    state.stats.fetches += 1;
                    Ok(tx)
                }
            }
        };

        let tx = match leader {
            Ok(tx) => tx,
            Err(mut rx) => {
                debug!("{}: joining in-flight fetch for {key}", self.name);
                return rx.recv().await.unwrap_or_else(|_| {
                    Err(BridgeError::Internal(format!(
                        "in-flight fetch for {key} was abandoned"
                    )))
                });
            }
        };

        let mut guard = InFlightGuard {
            state: &self.state,
            key,
            armed: true,
        };
        let result = fetcher().await;
        {
            let mut state = lock(&self.state);
            state.in_flight.remove(key);
            if let Ok(value) = &result {
                state.insert(key, value.clone(), self.capacity);
            }
        }
        guard.armed = false;
        let _ = tx.send(result.clone());
        result
    }

    /// Applies `update` to every live entry whose key satisfies `matches`.
    /// Returns how many entries were updated.  Insertion order is unchanged.
    pub fn update_where<P, U>(&self, mut matches: P, mut update: U) -> usize
    where
        P: FnMut(&str) -> bool,
        U: FnMut(&mut T),
    {
        let mut state = lock(&self.state);
        let ttl = self.ttl;
        let mut count = 0;
        for (key, entry) in state.entries.iter_mut() {
            if entry.inserted_at.elapsed() <= ttl && matches(key.as_str()) {
                update(&mut entry.value);
                count += 1;
            }
        }
        count
    }

    pub fn invalidate(&self, key: &str) -> bool {
        lock(&self.state).remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.order.clear();
    }

    /// Removes every entry older than the TTL.  Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut state = lock(&self.state);
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.inserted_at.elapsed() > self.ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        if !expired.is_empty() {
            debug!("{}: swept {} expired entries", self.name, expired.len());
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            entries: state.entries.len(),
            ..state.stats
        }
    }
}

/// Clears the in-flight marker if the leading fetch is dropped midway, so
/// waiters fail fast and the next caller starts a new fetch.
struct InFlightGuard<'a, T> {
    state: &'a Mutex<CacheState<T>>,
    key: &'a str,
    armed: bool,
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.state).in_flight.remove(self.key);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
