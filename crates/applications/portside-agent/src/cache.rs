//! TTL cache
//!
//! Key/value store with per-entry expiry. Memoizes the agent's expensive
//! lookups (load balancer resolution, target health) and is the single source
//! of truth for per-container load balancer metadata.
//!
//! Entries are stored as `Arc<dyn Any>` so one cache can hold every lookup
//! family; readers downcast to the type they expect, and a wrongly-typed
//! entry is observable as a distinct outcome rather than a panic.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::debug;

/// Expiry used for transient lookup results unless a caller picks its own
pub const DEFAULT_TTL: Duration = Duration::from_secs(10);

/// Per-entry lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Expire this long after insertion
    After(Duration),
    /// Never expire
    NoExpiry,
}

impl Ttl {
    /// Convenience constructor for whole seconds
    pub fn seconds(secs: u64) -> Self {
        Ttl::After(Duration::from_secs(secs))
    }
}

/// Outcome of a typed cache read
#[derive(Debug)]
pub enum CacheRead<T> {
    /// Present, unexpired, and of the expected type
    Hit(Arc<T>),
    /// Present and unexpired, but stored as a different type
    WrongType,
    /// Absent or expired
    Miss,
}

struct Entry {
    value: Arc<dyn Any + Send + Sync>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }
}

/// Writes double as the cleanup pass, so expired entries do not pile up in a
/// long-running agent
fn purge_locked(entries: &mut HashMap<String, Entry>) {
    entries.retain(|_, entry| !entry.expired());
}

/// Thread-safe key/value store with per-entry expiry.
///
/// Storage is in-memory only; a restart loses it.
pub struct TtlCache {
    entries: RwLock<HashMap<String, Entry>>,
    default_ttl: Duration,
}

impl Default for TtlCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TtlCache {
    /// Create a cache with the standard transient TTL
    pub fn new() -> Self {
        Self::with_default_ttl(DEFAULT_TTL)
    }

    /// Create a cache with a custom default TTL
    pub fn with_default_ttl(default_ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            default_ttl,
        }
    }

    /// The TTL used when callers ask for the cache default
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Store a value under `key`
    pub async fn insert<T: Send + Sync + 'static>(&self, key: &str, value: T, ttl: Ttl) {
        let expires_at = match ttl {
            Ttl::After(d) => Some(Instant::now() + d),
            Ttl::NoExpiry => None,
        };
        let mut entries = self.entries.write().await;
        purge_locked(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: Arc::new(value),
                expires_at,
            },
        );
    }

    /// Number of live (unexpired) entries
    pub async fn len(&self) -> usize {
        let entries = self.entries.read().await;
        entries.values().filter(|e| !e.expired()).count()
    }

    /// Typed read distinguishing miss from a wrongly-typed entry
    pub async fn read<T: Send + Sync + 'static>(&self, key: &str) -> CacheRead<T> {
        let entries = self.entries.read().await;
        match entries.get(key) {
            Some(entry) if !entry.expired() => match entry.value.clone().downcast::<T>() {
                Ok(value) => CacheRead::Hit(value),
                Err(_) => CacheRead::WrongType,
            },
            _ => CacheRead::Miss,
        }
    }

    /// Typed read collapsing wrong-type into a miss
    pub async fn get<T: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<T>> {
        match self.read::<T>(key).await {
            CacheRead::Hit(value) => Some(value),
            _ => None,
        }
    }

    /// Drop the entry under `key`, if any
    pub async fn remove(&self, key: &str) {
        let mut entries = self.entries.write().await;
        entries.remove(key);
    }

    /// Memoize a fallible computation under `key`.
    ///
    /// Returns the cached value if present and unexpired; otherwise runs
    /// `compute`, stores the value on success, and returns it. Errors are
    /// never cached, so the next caller retries.
    pub async fn get_or_compute<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Ttl,
        compute: F,
    ) -> std::result::Result<Arc<T>, E>
    where
        T: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get::<T>(key).await {
            return Ok(value);
        }
        debug!(key = %key, "cache miss, computing");
        let value = compute().await?;
        let value = Arc::new(value);
        let expires_at = match ttl {
            Ttl::After(d) => Some(Instant::now() + d),
            Ttl::NoExpiry => None,
        };
        let mut entries = self.entries.write().await;
        purge_locked(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value: value.clone(),
                expires_at,
            },
        );
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn entries_expire_after_ttl() {
        let cache = TtlCache::new();
        cache
            .insert("k", "v".to_string(), Ttl::After(Duration::from_millis(5)))
            .await;
        assert!(cache.get::<String>("k").await.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.get::<String>("k").await.is_none());
    }

    #[tokio::test]
    async fn no_expiry_entries_survive() {
        let cache = TtlCache::new();
        cache.insert("k", 7u32, Ttl::NoExpiry).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(*cache.get::<u32>("k").await.unwrap(), 7);
    }

    #[tokio::test]
    async fn wrong_type_is_distinguished_from_miss() {
        let cache = TtlCache::new();
        cache.insert("k", 7u32, Ttl::NoExpiry).await;
        assert!(matches!(cache.read::<String>("k").await, CacheRead::WrongType));
        assert!(matches!(cache.read::<String>("absent").await, CacheRead::Miss));
    }

    #[tokio::test]
    async fn get_or_compute_runs_at_most_once_per_key() {
        let cache = TtlCache::new();
        let calls = AtomicUsize::new(0);

        for _ in 0..3 {
            let value: Arc<String> = cache
                .get_or_compute("k", Ttl::NoExpiry, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ()>("computed".to_string())
                })
                .await
                .unwrap();
            assert_eq!(*value, "computed");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn errors_are_not_cached() {
        let cache = TtlCache::new();
        let calls = AtomicUsize::new(0);

        let first: std::result::Result<Arc<u32>, String> = cache
            .get_or_compute("k", Ttl::NoExpiry, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom".to_string())
            })
            .await;
        assert!(first.is_err());

        let second: std::result::Result<Arc<u32>, String> = cache
            .get_or_compute("k", Ttl::NoExpiry, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(9)
            })
            .await;
        assert_eq!(*second.unwrap(), 9);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn writes_purge_expired_entries() {
        let cache = TtlCache::new();
        cache
            .insert("stale", 1u8, Ttl::After(Duration::from_millis(5)))
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.insert("fresh", 2u8, Ttl::NoExpiry).await;

        assert_eq!(cache.len().await, 1);
        assert!(cache.get::<u8>("stale").await.is_none());
    }

    #[tokio::test]
    async fn remove_drops_the_entry() {
        let cache = TtlCache::new();
        cache.insert("k", 1i64, Ttl::NoExpiry).await;
        cache.remove("k").await;
        assert!(cache.get::<i64>("k").await.is_none());
    }
}
