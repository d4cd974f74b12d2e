//! Time-to-live cache for explorer records and analysis results.
//!
//! Entries carry their own `stored_at` timestamp. Reads only return entries
//! younger than the TTL, and a background sweeper drops expired ones so that
//! memory does not stay pinned after a burst of traffic.

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use tokio::task::JoinHandle;

use crate::address::Address;
use crate::records::{ActivityRecord, RecordKind};
use crate::scoring::ScoreResult;

pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Clone)]
struct Entry<V> {
    value: V,
    stored_at: Instant,
}

impl<V> Entry<V> {
    fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.stored_at) < ttl
    }
}

/// Concurrent TTL map. Cloning shares the underlying storage.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    inner: Arc<Cache<K, Entry<V>>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache with the given TTL, bounded to `max_entries`.
    pub fn new(ttl: Duration, max_entries: u64) -> Self {
        let cache = Cache::builder().max_capacity(max_entries).build();
        Self {
            inner: Arc::new(cache),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Get a value if present and fresh.
    pub fn get(&self, key: &K) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Get a value if it was stored less than one TTL before `now`.
    pub fn get_at(&self, key: &K, now: Instant) -> Option<V> {
        self.inner
            .get(key)
            .filter(|entry| entry.is_fresh(now, self.ttl))
            .map(|entry| entry.value)
    }

    /// Store a value stamped with the current time, replacing any prior entry.
    pub fn set(&self, key: K, value: V) {
        self.set_at(key, value, Instant::now());
    }

    pub fn set_at(&self, key: K, value: V, stored_at: Instant) {
        self.inner.insert(key, Entry { value, stored_at });
    }

    /// Remove every entry whose age at `now` is at least the TTL.
    ///
    /// Each removal re-checks the entry atomically, so a value written after
    /// the scan started is never dropped. Returns the number removed.
    pub fn sweep(&self, now: Instant) -> usize {
        let ttl = self.ttl;
        let stale: Vec<Arc<K>> = self
            .inner
            .iter()
            .filter(|(_, entry)| !entry.is_fresh(now, ttl))
            .map(|(key, _)| key)
            .collect();

        let mut removed = 0;
        for key in stale {
            let result = self
                .inner
                .entry_by_ref(key.as_ref())
                .and_compute_with(|current| match current {
                    Some(entry) if !entry.value().is_fresh(now, ttl) => Op::Remove,
                    _ => Op::Nop,
                });
            if matches!(result, CompResult::Removed(_)) {
                removed += 1;
            }
        }
        self.inner.run_pending_tasks();
        removed
    }

    /// Number of entries held, fresh or not.
    pub fn len(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sweep on a fixed interval until the returned task is aborted.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = cache.sweep(Instant::now());
                if removed > 0 {
                    crate::metrics::record_cache_evictions(removed);
                    tracing::info!(removed, remaining = cache.len(), "cache swept");
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Analysis cache
// ---------------------------------------------------------------------------

/// What a cache entry holds for an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    Records(RecordKind),
    FullAnalysis,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: CacheKind,
    pub address: Address,
}

impl CacheKey {
    pub fn records(kind: RecordKind, address: &Address) -> Self {
        Self {
            kind: CacheKind::Records(kind),
            address: address.clone(),
        }
    }

    pub fn analysis(address: &Address) -> Self {
        Self {
            kind: CacheKind::FullAnalysis,
            address: address.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CachedPayload {
    Records(Arc<Vec<ActivityRecord>>),
    Score(Arc<ScoreResult>),
}

/// The cache shared by the analyzer and the HTTP layer.
pub type AnalysisCache = TtlCache<CacheKey, CachedPayload>;

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64) -> TtlCache<String, u32> {
        TtlCache::new(Duration::from_secs(ttl_secs), 100)
    }

    #[test]
    fn test_get_fresh_entry() {
        let c = cache(300);
        let t0 = Instant::now();
        c.set_at("a".into(), 1, t0);
        assert_eq!(c.get_at(&"a".into(), t0), Some(1));
        assert_eq!(c.get_at(&"a".into(), t0 + Duration::from_secs(299)), Some(1));
    }

    #[test]
    fn test_stale_entry_reported_missing() {
        let c = cache(300);
        let t0 = Instant::now();
        c.set_at("a".into(), 1, t0);
        assert_eq!(c.get_at(&"a".into(), t0 + Duration::from_secs(300)), None);
        // Still held until swept.
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_set_replaces() {
        let c = cache(300);
        let t0 = Instant::now();
        c.set_at("a".into(), 1, t0);
        c.set_at("a".into(), 2, t0 + Duration::from_secs(400));
        assert_eq!(c.get_at(&"a".into(), t0 + Duration::from_secs(500)), Some(2));
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let c = cache(300);
        let t0 = Instant::now();
        c.set_at("old".into(), 1, t0);
        c.set_at("edge".into(), 2, t0 + Duration::from_secs(100));
        c.set_at("new".into(), 3, t0 + Duration::from_secs(200));

        let removed = c.sweep(t0 + Duration::from_secs(400));
        assert_eq!(removed, 2);
        assert_eq!(c.len(), 1);
        assert_eq!(c.get_at(&"new".into(), t0 + Duration::from_secs(400)), Some(3));
    }

    #[test]
    fn test_sweep_empty_cache() {
        let c = cache(1);
        assert_eq!(c.sweep(Instant::now()), 0);
        assert!(c.is_empty());
    }

    #[test]
    fn test_cache_keys_distinguish_kind() {
        let addr = Address::parse("0x4200000000000000000000000000000000000006").unwrap();
        let c: AnalysisCache = TtlCache::new(DEFAULT_TTL, 10);
        c.set(
            CacheKey::records(RecordKind::Transaction, &addr),
            CachedPayload::Records(Arc::new(vec![])),
        );
        assert!(c.get(&CacheKey::records(RecordKind::Transaction, &addr)).is_some());
        assert!(c.get(&CacheKey::records(RecordKind::TokenTransfer, &addr)).is_none());
        assert!(c.get(&CacheKey::analysis(&addr)).is_none());
    }

    #[tokio::test]
    async fn test_sweeper_task_evicts() {
        let c: TtlCache<String, u32> = TtlCache::new(Duration::from_millis(10), 100);
        c.set("a".into(), 1);
        let handle = c.spawn_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(c.is_empty());
        handle.abort();
    }
}
