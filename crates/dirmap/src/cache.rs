//! Result cache in front of directory reads.
//!
//! Two disjoint key schemes are used:
//!
//! - search-scoped keys hash the connection endpoint together with the full
//!   [`SearchParams`], and hold counts or entry lists
//! - record-scoped keys hash a single DN, and hold one entry
//!
//! A record-level write invalidates its record-scoped key only; structural
//! writes (add, rename, move, delete) flush everything, since they can change
//! which entries any cached search would return. Cached search results may
//! therefore trail a record-level update until their TTL runs out.
//!
//! Caching is best-effort: store failures are logged and treated as misses.

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::error::DirectoryResult;
use crate::operation::{CanonicalEntry, SearchParams};

/// A cached read result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CachedValue {
    /// Number of entries matched by a search.
    Count(u64),
    /// All entries returned by a search.
    Entries(Vec<CanonicalEntry>),
    /// One entry, looked up by DN.
    Entry(CanonicalEntry),
}

/// Key into the result cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key for the entry count of a search.
    pub fn count(endpoint: &str, params: &SearchParams) -> Self {
        Self(format!("count.{}", search_digest(endpoint, params)))
    }

    /// Key for the entry list of a search.
    pub fn search(endpoint: &str, params: &SearchParams) -> Self {
        Self(format!("search.{}", search_digest(endpoint, params)))
    }

    /// Key for a single entry, independent of the search that found it.
    pub fn record(dn: &str) -> Self {
        Self(format!("entry.{}", sha256_hex(dn.as_bytes())))
    }

    /// The key as stored.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn search_digest(endpoint: &str, params: &SearchParams) -> String {
    let serialized = serde_json::to_string(params).unwrap_or_else(|_| format!("{params:?}"));
    let mut hasher = Sha256::new();
    hasher.update(endpoint.as_bytes());
    hasher.update(b"\n");
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// A key-value cache service with per-entry TTL.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Check whether a live value is stored under `key`.
    async fn exists(&self, key: &str) -> DirectoryResult<bool>;

    /// Fetch the value stored under `key`.
    async fn get(&self, key: &str) -> DirectoryResult<Option<CachedValue>>;

    /// Store `value` under `key` for `ttl`.
    async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> DirectoryResult<()>;

    /// Remove `key`.
    async fn clear(&self, key: &str) -> DirectoryResult<()>;

    /// Remove every key.
    async fn reset(&self) -> DirectoryResult<()>;
}

#[derive(Clone)]
struct TimedValue {
    value: CachedValue,
    ttl: Duration,
}

struct PerEntryTtl;

impl Expiry<String, TimedValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &TimedValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &TimedValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// In-process [`CacheStore`] backed by `moka`.
pub struct MokaCacheStore {
    cache: Cache<String, TimedValue>,
}

impl MokaCacheStore {
    /// Create a store holding at most `max_capacity` results.
    pub fn new(max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .expire_after(PerEntryTtl)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl CacheStore for MokaCacheStore {
    async fn exists(&self, key: &str) -> DirectoryResult<bool> {
        Ok(self.cache.contains_key(key))
    }

    async fn get(&self, key: &str) -> DirectoryResult<Option<CachedValue>> {
        Ok(self.cache.get(key).await.map(|timed| timed.value))
    }

    async fn set(&self, key: &str, value: CachedValue, ttl: Duration) -> DirectoryResult<()> {
        self.cache
            .insert(key.to_string(), TimedValue { value, ttl })
            .await;
        Ok(())
    }

    async fn clear(&self, key: &str) -> DirectoryResult<()> {
        self.cache.invalidate(key).await;
        Ok(())
    }

    async fn reset(&self) -> DirectoryResult<()> {
        self.cache.invalidate_all();
        Ok(())
    }
}

/// Best-effort cache of normalized read results.
///
/// Cloning shares the underlying store.
#[derive(Clone)]
pub struct ResultCache {
    store: Option<Arc<dyn CacheStore>>,
}

impl ResultCache {
    /// Wrap an external cache service.
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self { store: Some(store) }
    }

    /// Build an in-process cache from settings.
    pub fn from_settings(settings: &CacheSettings) -> Self {
        if settings.enabled {
            Self::new(Arc::new(MokaCacheStore::new(settings.max_capacity)))
        } else {
            Self::disabled()
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self { store: None }
    }

    /// Whether a store is attached.
    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Whether a live value is stored under `key`.
    pub async fn contains(&self, key: &CacheKey) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        match store.exists(key.as_str()).await {
            Ok(found) => found,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed");
                false
            }
        }
    }

    /// Fetch a cached value; store failures read as a miss.
    pub async fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        let store = self.store.as_ref()?;
        match store.get(key.as_str()).await {
            Ok(Some(value)) => {
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Ok(None) => {
                debug!(key = %key, "Cache miss");
                None
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache read failed, falling through to directory");
                None
            }
        }
    }

    /// Store a value for `ttl`. A zero TTL stores nothing.
    pub async fn set(&self, key: &CacheKey, value: CachedValue, ttl: Duration) {
        if ttl.is_zero() {
            return;
        }
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.set(key.as_str(), value, ttl).await {
            warn!(key = %key, error = %e, "Cache write failed");
        }
    }

    /// Drop one key.
    pub async fn invalidate(&self, key: &CacheKey) {
        let Some(store) = &self.store else {
            return;
        };
        debug!(key = %key, "Invalidating cache key");
        if let Err(e) = store.clear(key.as_str()).await {
            warn!(key = %key, error = %e, "Cache invalidation failed");
        }
    }

    /// Drop every key.
    pub async fn invalidate_all(&self) {
        let Some(store) = &self.store else {
            return;
        };
        debug!("Flushing result cache");
        if let Err(e) = store.reset().await {
            warn!(error = %e, "Cache flush failed");
        }
    }

    /// Cached entry count for a search key.
    pub async fn get_count(&self, key: &CacheKey) -> Option<u64> {
        match self.get(key).await? {
            CachedValue::Count(count) => Some(count),
            _ => None,
        }
    }

    /// Cached entry list for a search key.
    pub async fn get_entries(&self, key: &CacheKey) -> Option<Vec<CanonicalEntry>> {
        match self.get(key).await? {
            CachedValue::Entries(entries) => Some(entries),
            _ => None,
        }
    }

    /// Cached entry for a record key.
    pub async fn get_entry(&self, key: &CacheKey) -> Option<CanonicalEntry> {
        match self.get(key).await? {
            CachedValue::Entry(entry) => Some(entry),
            _ => None,
        }
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DirectoryError;
    use crate::operation::SearchScope;

    const TTL: Duration = Duration::from_secs(60);

    struct UnavailableStore;

    #[async_trait]
    impl CacheStore for UnavailableStore {
        async fn exists(&self, _key: &str) -> DirectoryResult<bool> {
            Err(DirectoryError::cache_unavailable("connection refused"))
        }

        async fn get(&self, _key: &str) -> DirectoryResult<Option<CachedValue>> {
            Err(DirectoryError::cache_unavailable("connection refused"))
        }

        async fn set(
            &self,
            _key: &str,
            _value: CachedValue,
            _ttl: Duration,
        ) -> DirectoryResult<()> {
            Err(DirectoryError::cache_unavailable("connection refused"))
        }

        async fn clear(&self, _key: &str) -> DirectoryResult<()> {
            Err(DirectoryError::cache_unavailable("connection refused"))
        }

        async fn reset(&self) -> DirectoryResult<()> {
            Err(DirectoryError::cache_unavailable("connection refused"))
        }
    }

    fn params() -> SearchParams {
        SearchParams::new("dc=example,dc=com", "(objectClass=person)")
    }

    fn cache() -> ResultCache {
        ResultCache::from_settings(&CacheSettings::default())
    }

    #[test]
    fn test_search_key_is_deterministic() {
        assert_eq!(
            CacheKey::search("ldap://a:389", &params()),
            CacheKey::search("ldap://a:389", &params())
        );
    }

    #[test]
    fn test_search_key_depends_on_every_parameter() {
        let base = CacheKey::search("ldap://a:389", &params());
        let variants = vec![
            params().with_scope(SearchScope::OneLevel),
            params().with_attributes(["cn"]),
            params().with_attrs_only(true),
            params().with_size_limit(5),
            params().with_time_limit(5),
            params().with_deref(crate::operation::DerefPolicy::Always),
            SearchParams::new("dc=other,dc=com", "(objectClass=person)"),
            SearchParams::new("dc=example,dc=com", "(objectClass=group)"),
        ];
        for variant in variants {
            assert_ne!(base, CacheKey::search("ldap://a:389", &variant), "{variant:?}");
        }
        assert_ne!(base, CacheKey::search("ldap://b:389", &params()));
    }

    #[test]
    fn test_attribute_order_matters() {
        assert_ne!(
            CacheKey::search("h", &params().with_attributes(["cn", "mail"])),
            CacheKey::search("h", &params().with_attributes(["mail", "cn"]))
        );
    }

    #[test]
    fn test_key_schemes_are_disjoint() {
        let count = CacheKey::count("h", &params());
        let search = CacheKey::search("h", &params());
        assert_ne!(count, search);
        assert!(count.as_str().starts_with("count."));
        assert!(search.as_str().starts_with("search."));
        assert!(CacheKey::record("cn=a,dc=example").as_str().starts_with("entry."));
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let cache = cache();
        let key = CacheKey::count("h", &params());
        cache.set(&key, CachedValue::Count(3), TTL).await;

        assert!(cache.contains(&key).await);
        assert_eq!(cache.get_count(&key).await, Some(3));
        assert_eq!(cache.get_entries(&key).await, None);
    }

    #[tokio::test]
    async fn test_zero_ttl_is_not_cached() {
        let cache = cache();
        let key = CacheKey::count("h", &params());
        cache.set(&key, CachedValue::Count(3), Duration::ZERO).await;

        assert!(!cache.contains(&key).await);
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let cache = cache();
        let key = CacheKey::record("cn=a,dc=example");
        cache
            .set(
                &key,
                CachedValue::Entry(CanonicalEntry::new("cn=a,dc=example")),
                Duration::from_millis(50),
            )
            .await;
        assert!(cache.get_entry(&key).await.is_some());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.get_entry(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_invalidate_single_key() {
        let cache = cache();
        let record = CacheKey::record("cn=a,dc=example");
        let search = CacheKey::search("h", &params());
        cache
            .set(&record, CachedValue::Entry(CanonicalEntry::new("cn=a,dc=example")), TTL)
            .await;
        cache.set(&search, CachedValue::Entries(vec![]), TTL).await;

        cache.invalidate(&record).await;

        assert!(cache.get(&record).await.is_none());
        assert!(cache.get(&search).await.is_some());
    }

    #[tokio::test]
    async fn test_invalidate_all() {
        let cache = cache();
        let record = CacheKey::record("cn=a,dc=example");
        let search = CacheKey::search("h", &params());
        cache
            .set(&record, CachedValue::Entry(CanonicalEntry::new("cn=a,dc=example")), TTL)
            .await;
        cache.set(&search, CachedValue::Entries(vec![]), TTL).await;

        cache.invalidate_all().await;

        assert!(cache.get(&record).await.is_none());
        assert!(cache.get(&search).await.is_none());
    }

    #[tokio::test]
    async fn test_unavailable_store_degrades_to_miss() {
        let cache = ResultCache::new(Arc::new(UnavailableStore));
        let key = CacheKey::count("h", &params());

        cache.set(&key, CachedValue::Count(1), TTL).await;
        assert!(!cache.contains(&key).await);
        assert_eq!(cache.get(&key).await, None);
        cache.invalidate(&key).await;
        cache.invalidate_all().await;
    }

    #[tokio::test]
    async fn test_disabled_cache() {
        let cache = ResultCache::from_settings(&CacheSettings::disabled());
        let key = CacheKey::count("h", &params());
        cache.set(&key, CachedValue::Count(1), TTL).await;
        assert!(!cache.is_enabled());
        assert_eq!(cache.get(&key).await, None);
    }
}
