//! LRU + TTL memoization of completed job results.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_secs: u64,
    /// Minimum interval between sweeps of expired entries.
    pub sweep_interval_secs: u64,
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            default_ttl_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_size: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntryInfo {
    pub age: Duration,
    pub idle: Duration,
    pub ttl_left: Duration,
    pub access_count: u64,
}

/// Content hash identifying a job input under a given configuration.
///
/// Lowercase hex SHA-256 of `input|config`.
pub fn generate_key(input: &str, config: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hasher.update(b"|");
    hasher.update(config.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Longest TTL honoured; larger values are clamped.
const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

fn expiry_after(now: Instant, ttl: Duration) -> Instant {
    let ttl = ttl.min(MAX_TTL);
    now.checked_add(ttl)
        .or_else(|| now.checked_add(Duration::from_secs(u32::MAX as u64)))
        .unwrap_or(now)
}

#[derive(Debug)]
struct CacheEntry<V> {
    data: V,
    created_at: Instant,
    expiry: Instant,
    last_accessed: Instant,
    access_count: u64,
    /// Position in the recency index.
    tick: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired_at(&self, now: Instant) -> bool {
        now > self.expiry
    }
}

struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    /// Access tick -> key, oldest first.
    recency: BTreeMap<u64, String>,
    next_tick: u64,
    last_sweep: Instant,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
}

impl<V> CacheState<V> {
    fn touch(&mut self, key: &str, now: Instant) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            entry.last_accessed = now;
            self.recency.insert(tick, key.to_owned());
        }
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_lru(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }

    fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired_at(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        self.expirations += expired.len() as u64;
        self.last_sweep = now;
        expired.len()
    }
}

/// Thread-safe cache with a hard entry cap.
///
/// Expired entries are logically absent: `get` treats them as a miss and
/// removes them, and `size` does not count them.
pub struct ResultCache<V> {
    cfg: CacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V: Clone> ResultCache<V> {
    pub fn new(cfg: CacheConfig) -> Self {
        Self::new_at(cfg, Instant::now())
    }

    pub fn new_at(cfg: CacheConfig, now: Instant) -> Self {
        debug_assert!(cfg.max_size > 0, "cache capacity must be positive");
        Self {
            cfg,
            state: Mutex::new(CacheState {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                next_tick: 0,
                last_sweep: now,
                hits: 0,
                misses: 0,
                evictions: 0,
                expirations: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CacheState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key`. `None` or a zero TTL uses the default.
    pub fn put(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.put_at(key, value, ttl, Instant::now());
    }

    pub fn put_at(&self, key: &str, value: V, ttl: Option<Duration>, now: Instant) {
        let ttl = ttl.filter(|t| !t.is_zero()).unwrap_or(self.cfg.default_ttl());
        let mut state = self.lock();

        if now.saturating_duration_since(state.last_sweep) >= self.cfg.sweep_interval() {
            let removed = state.sweep(now);
            if removed > 0 {
                tracing::debug!(removed, "cache sweep");
            }
        }

        if state.remove(key).is_none() {
            let capacity = self.cfg.max_size.max(1);
            if state.entries.len() >= capacity {
                // expired entries give up their slots before live ones are evicted
                let removed = state.sweep(now);
                if removed > 0 {
                    tracing::debug!(removed, "cache full, expired entries swept");
                }
            }
            while state.entries.len() >= capacity {
                state.evict_lru();
            }
        }

        let tick = state.next_tick;
        state.next_tick += 1;
        state.recency.insert(tick, key.to_owned());
        state.entries.insert(
            key.to_owned(),
            CacheEntry {
                data: value,
                created_at: now,
                expiry: expiry_after(now, ttl),
                last_accessed: now,
                access_count: 0,
                tick,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut state = self.lock();
        let Some(expired) = state.entries.get(key).map(|e| e.is_expired_at(now)) else {
            state.misses += 1;
            return None;
        };

        if expired {
            state.remove(key);
            state.expirations += 1;
            state.misses += 1;
            return None;
        }

        state.touch(key, now);
        state.hits += 1;
        let entry = state.entries.get_mut(key)?;
        entry.access_count += 1;
        Some(entry.data.clone())
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Drop every entry whose key contains `pattern`.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let mut state = self.lock();
        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.contains(pattern))
            .cloned()
            .collect();
        for key in &matching {
            state.remove(key);
        }
        if !matching.is_empty() {
            tracing::debug!(pattern, removed = matching.len(), "cache entries invalidated");
        }
        matching.len()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.recency.clear();
    }

    /// Live (non-expired) entries.
    pub fn size(&self) -> usize {
        self.size_at(Instant::now())
    }

    pub fn size_at(&self, now: Instant) -> usize {
        self.lock()
            .entries
            .values()
            .filter(|e| !e.is_expired_at(now))
            .count()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        self.lock().sweep(now)
    }

    /// Bookkeeping of a live entry.
    pub fn entry_info_at(&self, key: &str, now: Instant) -> Option<CacheEntryInfo> {
        let state = self.lock();
        state
            .entries
            .get(key)
            .filter(|e| !e.is_expired_at(now))
            .map(|e| CacheEntryInfo {
                age: now.saturating_duration_since(e.created_at),
                idle: now.saturating_duration_since(e.last_accessed),
                ttl_left: e.expiry.saturating_duration_since(now),
                access_count: e.access_count,
            })
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let state = self.lock();
        let lookups = state.hits + state.misses;
        CacheStats {
            entries: state.entries.values().filter(|e| !e.is_expired_at(now)).count(),
            max_size: self.cfg.max_size,
            hits: state.hits,
            misses: state.misses,
            hit_rate: if lookups > 0 {
                state.hits as f64 / lookups as f64
            } else {
                0.0
            },
            evictions: state.evictions,
            expirations: state.expirations,
        }
    }
}
