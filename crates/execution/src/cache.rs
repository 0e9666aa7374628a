//! Result cache - TTL expiry with least-recently-accessed eviction.

use chrono::Utc;
use parking_lot::Mutex;
use probekit_core::{CacheSettings, ExecutionMode, ExecutionResult, Step, TestCase, Time};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

/// Bumped whenever the canonical encoding changes.
const KEY_VERSION: &str = "v1";

/// Content hash of (name, steps, mode).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

#[derive(Serialize)]
struct Canonical<'a> {
    name: &'a str,
    steps: &'a [Step],
    mode: ExecutionMode,
}

impl CacheKey {
    /// Hash the canonical JSON encoding (object keys sorted).
    pub fn compute(name: &str, steps: &[Step], mode: ExecutionMode) -> Self {
        let canonical = Canonical { name, steps, mode };
        // via Value so every object's keys come out sorted
        let encoded = serde_json::to_value(&canonical)
            .and_then(|value| serde_json::to_vec(&value))
            .unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        Self(format!("{}-{}", KEY_VERSION, hex::encode(digest)))
    }

    /// Key for a test case in a mode.
    pub fn for_testcase(testcase: &TestCase, mode: ExecutionMode) -> Self {
        Self::compute(&testcase.name, &testcase.steps, mode)
    }

    /// Hex digest.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for logs.
    pub fn short(&self) -> &str {
        let end = self.0.len().min(KEY_VERSION.len() + 1 + 8);
        &self.0[..end]
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A cached result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Stored result
    pub result: ExecutionResult,
    /// When it was stored
    pub cached_at: Time,
    /// Last hit, for LRU eviction
    pub accessed_at: Time,
}

/// Cache counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries held
    pub size: usize,
    /// Capacity
    pub max_size: usize,
    /// Entry lifetime
    pub ttl_hours: u64,
    /// Lookups answered
    pub hits: u64,
    /// Lookups missed
    pub misses: u64,
}

/// Memoizes completed results by content hash.
pub struct ExecutionCache {
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    max_size: usize,
    ttl_hours: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ExecutionCache {
    /// Create a cache from settings.
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: settings.max_size,
            ttl_hours: settings.ttl_hours,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Saturates instead of overflowing for out-of-range settings.
    fn ttl(&self) -> chrono::Duration {
        i64::try_from(self.ttl_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }

    /// Look up a result.
    pub fn get(&self, key: &CacheKey) -> Option<ExecutionResult> {
        self.get_at(key, Utc::now())
    }

    /// Look up a result as of `now`. Expired entries are removed and miss.
    pub fn get_at(&self, key: &CacheKey, now: Time) -> Option<ExecutionResult> {
        let mut entries = self.entries.lock();

        let expired = match entries.get(key) {
            Some(entry) => now - entry.cached_at > self.ttl(),
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        if expired {
            entries.remove(key);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!("Cache entry expired: {}", key.short());
            return None;
        }

        let entry = entries.get_mut(key)?;
        entry.accessed_at = now;
        self.hits.fetch_add(1, Ordering::Relaxed);
        info!("Cache hit: {} - {}", key.short(), entry.result.name);
        Some(entry.result.clone())
    }

    /// Store a result.
    pub fn set(&self, key: CacheKey, result: ExecutionResult) {
        self.set_at(key, result, Utc::now())
    }

    /// Store a result as of `now`: purge expired, evict one LRU if full, insert.
    pub fn set_at(&self, key: CacheKey, result: ExecutionResult, now: Time) {
        if self.max_size == 0 {
            return;
        }

        let mut entries = self.entries.lock();
        let ttl = self.ttl();
        entries.retain(|_, entry| now - entry.cached_at <= ttl);

        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            let lru = entries
                .iter()
                .min_by_key(|(_, entry)| entry.accessed_at)
                .map(|(k, _)| k.clone());
            if let Some(lru) = lru {
                debug!("Evicting least recently used entry {}", lru.short());
                entries.remove(&lru);
            }
        }

        info!("Cache store: {} - {}", key.short(), result.name);
        entries.insert(
            key,
            CacheEntry {
                result,
                cached_at: now,
                accessed_at: now,
            },
        );
    }

    /// Drop all expired entries as of `now`.
    pub fn purge_expired_at(&self, now: Time) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        let ttl = self.ttl();
        entries.retain(|_, entry| now - entry.cached_at <= ttl);
        before - entries.len()
    }

    /// Entries currently held, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether `key` has an entry, expired or not.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            size: self.len(),
            max_size: self.max_size,
            ttl_hours: self.ttl_hours,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probekit_core::{ExecutionId, ExecutionType};
    use serde_json::{json, Map, Value};

    fn cache(max_size: usize) -> ExecutionCache {
        ExecutionCache::new(&CacheSettings {
            max_size,
            ttl_hours: 24,
        })
    }

    fn result(name: &str) -> ExecutionResult {
        let mut result = ExecutionResult::started(
            ExecutionId::new(),
            name,
            ExecutionMode::Headless,
            ExecutionType::Full,
        );
        result.complete();
        result
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::compute(name, &[], ExecutionMode::Headless)
    }

    #[test]
    fn test_key_is_versioned_and_stable() {
        let steps = vec![Step::new("navigate", "open").param("url", "https://example.com")];
        let a = CacheKey::compute("login", &steps, ExecutionMode::Headless);
        let b = CacheKey::compute("login", &steps.clone(), ExecutionMode::Headless);
        assert_eq!(a, b);
        assert!(a.as_str().starts_with("v1-"));
        assert_eq!(a.as_str().len(), 3 + 64);
        assert_eq!(a.short().len(), 11);

        assert_ne!(a, CacheKey::compute("login", &steps, ExecutionMode::Browser));
        assert_ne!(a, CacheKey::compute("logout", &steps, ExecutionMode::Headless));
    }

    #[test]
    fn test_key_ignores_param_order() {
        let mut forward = Map::new();
        forward.insert("text".into(), json!("rust"));
        forward.insert("locate".into(), json!("search box"));
        let mut backward = Map::new();
        backward.insert("locate".into(), json!("search box"));
        backward.insert("text".into(), json!("rust"));

        let step = |params: Map<String, Value>| Step {
            action: "ai_input".into(),
            params,
            description: String::new(),
            output_variable: None,
        };
        assert_eq!(
            CacheKey::compute("s", &[step(forward)], ExecutionMode::Headless),
            CacheKey::compute("s", &[step(backward)], ExecutionMode::Headless)
        );
    }

    #[test]
    fn test_hit_and_miss_counters() {
        let cache = cache(10);
        assert!(cache.get(&key("a")).is_none());
        cache.set(key("a"), result("a"));
        assert_eq!(cache.get(&key("a")).unwrap().name, "a");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_expired_entry_never_returned() {
        let cache = cache(10);
        let t0 = Utc::now();
        cache.set_at(key("a"), result("a"), t0);

        assert!(cache.get_at(&key("a"), t0 + chrono::Duration::hours(23)).is_some());
        let later = t0 + chrono::Duration::hours(24) + chrono::Duration::seconds(1);
        assert!(cache.get_at(&key("a"), later).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_unrepresentable_ttl_never_expires() {
        let cache = ExecutionCache::new(&CacheSettings {
            max_size: 10,
            ttl_hours: 100_000_000_000_000_000,
        });
        let t0 = Utc::now();
        cache.set_at(key("a"), result("a"), t0);
        assert!(cache.get_at(&key("a"), t0 + chrono::Duration::days(3650)).is_some());

        let wrapped = ExecutionCache::new(&CacheSettings {
            max_size: 10,
            ttl_hours: u64::MAX,
        });
        wrapped.set_at(key("b"), result("b"), t0);
        assert!(wrapped.get_at(&key("b"), t0).is_some());
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = cache(2);
        let t0 = Utc::now();
        cache.set_at(key("a"), result("a"), t0);
        cache.set_at(key("b"), result("b"), t0 + chrono::Duration::seconds(1));
        cache.get_at(&key("a"), t0 + chrono::Duration::seconds(2));
        cache.set_at(key("c"), result("c"), t0 + chrono::Duration::seconds(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains(&key("a")));
        assert!(!cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn test_set_purges_expired_before_evicting() {
        let cache = cache(2);
        let t0 = Utc::now();
        cache.set_at(key("a"), result("a"), t0);
        cache.set_at(key("b"), result("b"), t0 + chrono::Duration::hours(23));
        cache.set_at(key("c"), result("c"), t0 + chrono::Duration::hours(25));

        assert!(!cache.contains(&key("a")));
        assert!(cache.contains(&key("b")));
        assert!(cache.contains(&key("c")));
    }

    #[test]
    fn test_purge_expired_at() {
        let cache = cache(10);
        let t0 = Utc::now();
        cache.set_at(key("a"), result("a"), t0);
        cache.set_at(key("b"), result("b"), t0 + chrono::Duration::hours(2));
        assert_eq!(cache.purge_expired_at(t0 + chrono::Duration::hours(25)), 1);
        assert_eq!(cache.len(), 1);
    }
}
