//! In-memory TTL cache for successful upstream reads.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::config::CacheConfig;

const MIN_SWEEP_PERIOD: Duration = Duration::from_millis(1);

/// Defines how a single request interacts with the response cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    /// Read from the cache if a live entry is present;
    /// otherwise fetch from the network and write the response to the cache. (Default)
    #[default]
    Use,
    /// Always fetch from the network and write the fresh response to the cache.
    Refresh,
    /// Always fetch from the network and do not read from or write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        matches!(self, Self::Use | Self::Refresh)
    }
}

/// Canonical cache key: the endpoint followed by `name=value` pairs sorted by name.
///
/// Parameter order never yields distinct keys for the same logical request. Names and
/// values are percent-encoded, so separators inside a value cannot forge another pair.
pub fn cache_key<I, K, V>(endpoint: &str, params: I) -> String
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    let mut pairs: Vec<(String, String)> = params
        .into_iter()
        .map(|(k, v)| {
            (
                urlencoding::encode(k.as_ref()).into_owned(),
                urlencoding::encode(v.as_ref()).into_owned(),
            )
        })
        .collect();
    pairs.sort();

    let mut key = endpoint.replace('%', "%25").replace('|', "%7C");
    for (name, value) in pairs {
        key.push('|');
        key.push_str(&name);
        key.push('=');
        key.push_str(&value);
    }
    key
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    map: HashMap<String, CacheEntry>,
}

impl CacheInner {
    fn clear_expired(&mut self, now: Instant) -> usize {
        let before = self.map.len();
        self.map.retain(|_, entry| entry.is_live(now));
        before - self.map.len()
    }

    /// Drop the entry closest to expiry.
    fn evict_one(&mut self) {
        let victim = self
            .map
            .iter()
            .min_by_key(|(_, entry)| entry.expires_at)
            .map(|(key, _)| key.clone());
        if let Some(key) = victim {
            self.map.remove(&key);
        }
    }
}

/// Thread-safe response cache shared by every API client handle.
///
/// Expiry is lazy: an expired entry is removed by the `get` that finds it, by
/// [`clear_expired`](Self::clear_expired), or by the optional sweeper task.
#[derive(Debug)]
pub struct ResponseCache {
    inner: Mutex<CacheInner>,
    default_ttl: Duration,
    max_entries: Option<usize>,
    enabled: bool,
}

impl ResponseCache {
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            default_ttl,
            max_entries: None,
            enabled: true,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        let cache = if config.enabled {
            Self::new(config.default_ttl())
        } else {
            Self::disabled()
        };
        match config.max_entries {
            Some(max) => cache.with_max_entries(max),
            None => cache,
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new(Duration::ZERO)
        }
    }

    /// Bound the number of entries; a full cache evicts the entry closest to expiry.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn lock(&self) -> MutexGuard<'_, CacheInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the value only while it is unexpired; an expired entry is evicted.
    pub fn get(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        let mut store = self.lock();
        match store.map.get(key) {
            Some(entry) if entry.is_live(now) => Some(entry.value.clone()),
            Some(_) => {
                store.map.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store `value` for `ttl` (or the default TTL), replacing any previous entry.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) {
        if !self.enabled {
            return;
        }
        let key = key.into();
        let now = Instant::now();
        let expires_at = now + ttl.unwrap_or(self.default_ttl);

        let mut store = self.lock();
        if let Some(max) = self.max_entries {
            if !store.map.contains_key(&key) && store.map.len() >= max {
                store.clear_expired(now);
                if store.map.len() >= max {
                    store.evict_one();
                }
            }
        }
        store.map.insert(key, CacheEntry { value, expires_at });
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn clear_expired(&self) -> usize {
        let now = Instant::now();
        self.lock().clear_expired(now)
    }

    pub fn clear(&self) {
        self.lock().map.clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired entries. The task ends once the cache is dropped.
    ///
    /// A zero period is raised to one millisecond.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let every = every.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.clear_expired();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        })
    }
}
