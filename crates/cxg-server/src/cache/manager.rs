// SPDX-License-Identifier: Apache-2.0

//! Bounded LRU + TTL map of cache entries behind one async mutex.

use crate::cache::entry::{CacheEntry, CacheLease, CacheValue};
use cxg_core::CxgError;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub max_entries: usize,
    /// Idle time after which an unused entry is evicted. `None` disables it.
    pub ttl: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 8,
            ttl: None,
        }
    }
}

#[derive(Default)]
pub struct CacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub loads: AtomicU64,
    pub load_failures: AtomicU64,
    pub evictions: AtomicU64,
    /// Admissions refused because every eviction candidate was in use.
    pub thrash: AtomicU64,
}

struct Slot<V> {
    entry: Arc<CacheEntry<V>>,
    last_access: Instant,
    access_count: u64,
}

pub struct CacheManager<V> {
    name: &'static str,
    config: CacheConfig,
    slots: Mutex<HashMap<String, Slot<V>>>,
    pub metrics: Arc<CacheMetrics>,
}

impl<V: CacheValue> CacheManager<V> {
    #[must_use]
    pub fn new(name: &'static str, config: CacheConfig) -> Self {
        Self {
            name,
            config,
            slots: Mutex::new(HashMap::new()),
            metrics: Arc::new(CacheMetrics::default()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Returns the value for `key` with a reader lock held by the lease.
    ///
    /// Loads run while the map mutex is held, so at most one load is in
    /// flight per manager. Terminal load errors stay in the map and fail
    /// later calls until [`CacheManager::evict`] removes them.
    pub async fn get<F, Fut>(&self, key: &str, loader: F) -> Result<CacheLease<V>, CxgError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, CxgError>>,
    {
        let mut slots = self.slots.lock().await;
        self.evict_expired(&mut slots);

        if let Some(slot) = slots.get_mut(key) {
            slot.last_access = Instant::now();
            slot.access_count += 1;
            self.metrics.hits.fetch_add(1, Ordering::Relaxed);
            debug!(cache = self.name, key, accesses = slot.access_count, "cache hit");
            let entry = Arc::clone(&slot.entry);
            return entry.get(key, loader).await;
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.name, key, "cache miss");
        self.evict_lru(&mut slots)?;

        let entry = Arc::new(CacheEntry::new());
        self.metrics.loads.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = entry.get(key, loader).await;
        let keep = match &result {
            Ok(_) => true,
            Err(e) => {
                self.metrics.load_failures.fetch_add(1, Ordering::Relaxed);
                e.is_terminal()
            }
        };
        if keep {
            slots.insert(
                key.to_string(),
                Slot {
                    entry,
                    last_access: Instant::now(),
                    access_count: 1,
                },
            );
        }
        info!(
            cache = self.name,
            key,
            ok = result.is_ok(),
            entries = slots.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cache load"
        );
        result
    }

    fn evict_expired(&self, slots: &mut HashMap<String, Slot<V>>) {
        let Some(ttl) = self.config.ttl else {
            return;
        };
        let now = Instant::now();
        let expired: Vec<String> = slots
            .iter()
            .filter(|(_, s)| now.duration_since(s.last_access) > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if slots.get(&key).is_some_and(|s| s.entry.try_delete()) {
                slots.remove(&key);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                info!(cache = self.name, key = %key, reason = "ttl", "cache evict");
            }
        }
    }

    /// Frees slots, least recently used first, skipping entries in use.
    fn evict_lru(&self, slots: &mut HashMap<String, Slot<V>>) -> Result<(), CxgError> {
        while slots.len() >= self.config.max_entries {
            let mut by_age: Vec<(Instant, &String)> =
                slots.iter().map(|(k, s)| (s.last_access, k)).collect();
            by_age.sort();
            let victim = by_age
                .into_iter()
                .find(|(_, k)| slots[*k].entry.try_delete())
                .map(|(_, k)| k.clone());
            match victim {
                Some(key) => {
                    slots.remove(&key);
                    self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                    info!(cache = self.name, key = %key, reason = "lru", "cache evict");
                }
                None => {
                    self.metrics.thrash.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        cache = self.name,
                        entries = slots.len(),
                        "cache thrash: every entry is in use"
                    );
                    return Err(CxgError::CacheExhausted(format!(
                        "all {} {} cache slots are in use",
                        slots.len(),
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Removes `key` and clears its value once current readers are gone.
    /// The caller must not hold a lease on `key`.
    pub async fn evict(&self, key: &str) -> bool {
        let slot = self.slots.lock().await.remove(key);
        match slot {
            Some(slot) => {
                slot.entry.delete().await;
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                info!(cache = self.name, key, reason = "explicit", "cache evict");
                true
            }
            None => false,
        }
    }

    /// Empties the cache, waiting for readers of each entry.
    pub async fn evict_all(&self) {
        let drained: Vec<(String, Slot<V>)> = self.slots.lock().await.drain().collect();
        for (key, slot) in drained {
            slot.entry.delete().await;
            debug!(cache = self.name, key = %key, reason = "shutdown", "cache evict");
        }
    }

    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}
