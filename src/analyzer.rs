//! Wallet analysis orchestrator.
//!
//! For one address: return the cached score if fresh, otherwise fetch the
//! three record kinds in parallel, score them and cache the result.
//! Concurrent misses for the same key share a single upstream fetch.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::cache::{AnalysisCache, CacheKey, CachedPayload};
use crate::error::{AnalysisError, FetchError};
use crate::explorer::ExplorerProvider;
use crate::records::{ActivityRecord, RecordKind, WalletActivity};
use crate::scoring::{score_wallet, RankTable, ScoreResult};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// What to do when one of the three record kinds cannot be fetched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Fail the whole analysis.
    #[default]
    Strict,
    /// Score the missing kind as empty and report it in `details.unavailable`.
    /// Degraded results are not cached.
    Degrade,
}

impl std::str::FromStr for PartialFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "degrade" => Ok(Self::Degrade),
            other => Err(format!(
                "unknown partial failure policy '{other}', expected strict/degrade"
            )),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalyzerConfig {
    pub policy: PartialFailurePolicy,
    pub ranks: RankTable,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// A score plus whether it came from the cache.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub score: Arc<ScoreResult>,
    pub cached: bool,
}

/// Raw records of one kind plus whether they came from the cache.
#[derive(Debug, Clone)]
pub struct RecordsResult {
    pub records: Arc<Vec<ActivityRecord>>,
    pub cached: bool,
}

// ---------------------------------------------------------------------------
// Single-flight registry
// ---------------------------------------------------------------------------

type Pending<T> = Shared<BoxFuture<'static, Result<T, AnalysisError>>>;

/// Per-key registry of in-flight work. Callers for a key that is already being
/// computed await the same shared future instead of starting their own.
struct InFlight<T> {
    pending: Arc<Mutex<HashMap<CacheKey, Pending<T>>>>,
}

impl<T> InFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join the in-flight computation for `key` or start one with `work`.
    ///
    /// `recheck` runs under the registry lock and short-circuits when a result
    /// landed in the cache since the caller's own lookup. `work` must store its
    /// result in the cache before completing.
    ///
    /// `work` runs on its own task, so it completes and clears its registry
    /// entry even when every caller waiting on it has been dropped.
    async fn run<F>(
        &self,
        key: CacheKey,
        recheck: impl FnOnce() -> Option<T>,
        work: F,
    ) -> Result<(T, bool), AnalysisError>
    where
        F: Future<Output = Result<T, AnalysisError>> + Send + 'static,
    {
        let shared = {
            let mut pending = self.pending.lock().await;
            if let Some(existing) = pending.get(&key) {
                crate::metrics::record_inflight_join();
                debug!(address = %key.address, "joining in-flight fetch");
                existing.clone()
            } else if let Some(value) = recheck() {
                return Ok((value, true));
            } else {
                let registry = Arc::clone(&self.pending);
                let done_key = key.clone();
                // The registry lock is held until the insert below, so the
                // removal cannot run ahead of it.
                let handle = tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(work).catch_unwind().await;
                    registry.lock().await.remove(&done_key);
                    outcome.unwrap_or_else(|_| {
                        Err(AnalysisError::Internal("analysis task panicked".to_string()))
                    })
                });
                let shared = async move {
                    handle
                        .await
                        .unwrap_or_else(|e| Err(AnalysisError::Internal(e.to_string())))
                }
                .boxed()
                .shared();
                pending.insert(key, shared.clone());
                shared
            }
        };
        shared.await.map(|value| (value, false))
    }

    async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

impl<T> Clone for InFlight<T> {
    fn clone(&self) -> Self {
        Self {
            pending: Arc::clone(&self.pending),
        }
    }
}

// ---------------------------------------------------------------------------
// Analyzer
// ---------------------------------------------------------------------------

struct Inner {
    provider: Arc<dyn ExplorerProvider>,
    cache: AnalysisCache,
    config: AnalyzerConfig,
    scores: InFlight<Arc<ScoreResult>>,
    records: InFlight<Arc<Vec<ActivityRecord>>>,
}

/// Analysis entry point. Cheap to clone; clones share cache and registry.
#[derive(Clone)]
pub struct Analyzer {
    inner: Arc<Inner>,
}

impl Analyzer {
    pub fn new(
        provider: Arc<dyn ExplorerProvider>,
        cache: AnalysisCache,
        config: AnalyzerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                provider,
                cache,
                config,
                scores: InFlight::new(),
                records: InFlight::new(),
            }),
        }
    }

    pub fn cache(&self) -> &AnalysisCache {
        &self.inner.cache
    }

    pub fn policy(&self) -> PartialFailurePolicy {
        self.inner.config.policy
    }

    /// Number of analyses and record fetches currently in flight.
    pub async fn in_flight(&self) -> usize {
        self.inner.scores.len().await + self.inner.records.len().await
    }

    /// Score an address, from cache when fresh.
    pub async fn analyze(&self, address: &Address) -> Result<Analysis, AnalysisError> {
        let key = CacheKey::analysis(address);
        if let Some(score) = cached_score(&self.inner.cache, &key) {
            crate::metrics::record_cache_hit("analysis");
            debug!(%address, "analysis cache hit");
            return Ok(Analysis { score, cached: true });
        }
        crate::metrics::record_cache_miss("analysis");

        let inner = Arc::clone(&self.inner);
        let target = address.clone();
        let (score, cached) = self
            .inner
            .scores
            .run(
                key.clone(),
                || cached_score(&self.inner.cache, &key),
                async move { inner.compute_analysis(&target).await },
            )
            .await?;
        Ok(Analysis { score, cached })
    }

    /// Raw records of one kind for an address, from cache when fresh.
    pub async fn records(
        &self,
        kind: RecordKind,
        address: &Address,
    ) -> Result<RecordsResult, AnalysisError> {
        let key = CacheKey::records(kind, address);
        if let Some(records) = cached_records(&self.inner.cache, &key) {
            crate::metrics::record_cache_hit(kind.as_str());
            debug!(%address, kind = kind.as_str(), "records cache hit");
            return Ok(RecordsResult {
                records,
                cached: true,
            });
        }
        crate::metrics::record_cache_miss(kind.as_str());

        let inner = Arc::clone(&self.inner);
        let target = address.clone();
        let store_key = key.clone();
        let (records, cached) = self
            .inner
            .records
            .run(
                key.clone(),
                || cached_records(&self.inner.cache, &key),
                async move {
                    let records = Arc::new(inner.provider.fetch(kind, &target).await?);
                    inner
                        .cache
                        .set(store_key, CachedPayload::Records(Arc::clone(&records)));
                    Ok::<_, AnalysisError>(records)
                },
            )
            .await?;
        Ok(RecordsResult { records, cached })
    }
}

impl Inner {
    async fn compute_analysis(&self, address: &Address) -> Result<Arc<ScoreResult>, AnalysisError> {
        let start = Instant::now();
        info!(%address, "analyzing wallet");

        let provider = &self.provider;
        let results: [Result<Vec<ActivityRecord>, FetchError>; 3] = match self.config.policy {
            PartialFailurePolicy::Strict => {
                let (txs, nfts, tokens) = tokio::try_join!(
                    provider.fetch(RecordKind::Transaction, address),
                    provider.fetch(RecordKind::NftTransfer, address),
                    provider.fetch(RecordKind::TokenTransfer, address),
                )?;
                [Ok(txs), Ok(nfts), Ok(tokens)]
            }
            PartialFailurePolicy::Degrade => {
                let (txs, nfts, tokens) = tokio::join!(
                    provider.fetch(RecordKind::Transaction, address),
                    provider.fetch(RecordKind::NftTransfer, address),
                    provider.fetch(RecordKind::TokenTransfer, address),
                );
                [txs, nfts, tokens]
            }
        };

        let mut activity = WalletActivity::default();
        let mut unavailable = Vec::new();
        for result in results {
            match result {
                Ok(records) => activity.extend(records),
                Err(err) => {
                    warn!(%address, kind = err.kind.as_str(), error = %err.failure, "scoring without record kind");
                    unavailable.push(err.kind);
                }
            }
        }

        info!(
            %address,
            txs = activity.transactions.len(),
            nfts = activity.nft_transfers.len(),
            tokens = activity.token_transfers.len(),
            "activity fetched"
        );

        let mut result = score_wallet(
            &activity.transactions,
            &activity.nft_transfers,
            &activity.token_transfers,
            address,
            &self.config.ranks,
        );
        result.details.unavailable = unavailable;
        result.check().map_err(AnalysisError::Scoring)?;

        let score = Arc::new(result);
        if score.details.unavailable.is_empty() {
            self.cache.set(
                CacheKey::analysis(address),
                CachedPayload::Score(Arc::clone(&score)),
            );
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        crate::metrics::record_analysis(&score.rank, duration_ms);
        info!(
            %address,
            total_score = score.total_score,
            rank = %score.rank,
            degraded = !score.details.unavailable.is_empty(),
            duration_ms,
            "score calculated"
        );
        Ok(score)
    }
}

fn cached_score(cache: &AnalysisCache, key: &CacheKey) -> Option<Arc<ScoreResult>> {
    match cache.get(key)? {
        CachedPayload::Score(score) => Some(score),
        CachedPayload::Records(_) => None,
    }
}

fn cached_records(cache: &AnalysisCache, key: &CacheKey) -> Option<Arc<Vec<ActivityRecord>>> {
    match cache.get(key)? {
        CachedPayload::Records(records) => Some(records),
        CachedPayload::Score(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::cache::TtlCache;
    use crate::error::FetchFailure;
    use crate::records::{NativeTransaction, TokenTransfer};

    const WALLET: &str = "0x1111111111111111111111111111111111111111";
    const UNISWAP: &str = "0x4752ba5dbc23f44d87826276bf6fd6b1c372ad24";

    /// Canned explorer: one DeFi tx, one received token, optional failing kind.
    #[derive(Default)]
    struct MockExplorer {
        calls: AtomicUsize,
        delay: Duration,
        failing: Option<RecordKind>,
    }

    #[async_trait]
    impl ExplorerProvider for MockExplorer {
        async fn fetch(
            &self,
            kind: RecordKind,
            _address: &Address,
        ) -> Result<Vec<ActivityRecord>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing == Some(kind) {
                return Err(FetchError::new(kind, FetchFailure::Upstream("NOTOK".into())));
            }
            Ok(match kind {
                RecordKind::Transaction => vec![ActivityRecord::Transaction(NativeTransaction {
                    to: Some(UNISWAP.to_string()),
                    ..Default::default()
                })],
                RecordKind::NftTransfer => vec![],
                RecordKind::TokenTransfer => vec![ActivityRecord::TokenTransfer(TokenTransfer {
                    to: Some(WALLET.to_string()),
                    contract_address: Some("0xabc".to_string()),
                    ..Default::default()
                })],
            })
        }
    }

    fn analyzer(mock: Arc<MockExplorer>, ttl: Duration, policy: PartialFailurePolicy) -> Analyzer {
        Analyzer::new(
            mock,
            TtlCache::new(ttl, 100),
            AnalyzerConfig {
                policy,
                ranks: RankTable::default(),
            },
        )
    }

    fn wallet() -> Address {
        Address::parse(WALLET).unwrap()
    }

    #[tokio::test]
    async fn test_second_call_is_cached() {
        let mock = Arc::new(MockExplorer::default());
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        let first = a.analyze(&wallet()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.score.breakdown.defi, 5);
        assert_eq!(first.score.breakdown.airdrop, 2);
        assert_eq!(first.score.total_score, 7);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);

        let second = a.analyze(&wallet()).await.unwrap();
        assert!(second.cached);
        assert_eq!(*second.score, *first.score);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_refetch_after_ttl() {
        let mock = Arc::new(MockExplorer::default());
        let a = analyzer(mock.clone(), Duration::from_millis(30), PartialFailurePolicy::Strict);

        a.analyze(&wallet()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        let again = a.analyze(&wallet()).await.unwrap();
        assert!(!again.cached);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let mock = Arc::new(MockExplorer {
            delay: Duration::from_millis(50),
            ..Default::default()
        });
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let a = a.clone();
                tokio::spawn(async move { a.analyze(&wallet()).await })
            })
            .collect();
        for handle in handles {
            let analysis = handle.await.unwrap().unwrap();
            assert_eq!(analysis.score.total_score, 7);
        }

        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
        assert_eq!(a.in_flight().await, 0);
        assert_eq!(a.cache().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_strand_fetch() {
        let mock = Arc::new(MockExplorer {
            delay: Duration::from_millis(200),
            ..Default::default()
        });
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        // The only caller gives up long before the fetch finishes.
        let abandoned = tokio::time::timeout(Duration::from_millis(20), a.analyze(&wallet())).await;
        assert!(abandoned.is_err());
        assert_eq!(a.in_flight().await, 1);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(a.in_flight().await, 0);
        assert_eq!(a.cache().len(), 1);

        let next = a.analyze(&wallet()).await.unwrap();
        assert!(next.cached);
        assert_eq!(next.score.total_score, 7);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_caller_joining_after_leader_dropped_gets_result() {
        let mock = Arc::new(MockExplorer {
            delay: Duration::from_millis(150),
            ..Default::default()
        });
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        let abandoned = tokio::time::timeout(Duration::from_millis(20), a.analyze(&wallet())).await;
        assert!(abandoned.is_err());

        // Joins the fetch the dropped caller started.
        let joined = a.analyze(&wallet()).await.unwrap();
        assert!(!joined.cached);
        assert_eq!(joined.score.total_score, 7);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 3);
        assert_eq!(a.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_dropped_records_caller_does_not_strand_fetch() {
        let mock = Arc::new(MockExplorer {
            delay: Duration::from_millis(100),
            ..Default::default()
        });
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            a.records(RecordKind::Transaction, &wallet()),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(a.in_flight().await, 0);
        let next = a.records(RecordKind::Transaction, &wallet()).await.unwrap();
        assert!(next.cached);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_policy_fails_and_caches_nothing() {
        let mock = Arc::new(MockExplorer {
            failing: Some(RecordKind::TokenTransfer),
            ..Default::default()
        });
        let a = analyzer(mock, Duration::from_secs(300), PartialFailurePolicy::Strict);

        let err = a.analyze(&wallet()).await.unwrap_err();
        match err {
            AnalysisError::Fetch(fetch) => assert_eq!(fetch.kind, RecordKind::TokenTransfer),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(a.cache().is_empty());
        assert_eq!(a.in_flight().await, 0);
    }

    #[tokio::test]
    async fn test_degrade_policy_scores_without_failed_kind() {
        let mock = Arc::new(MockExplorer {
            failing: Some(RecordKind::TokenTransfer),
            ..Default::default()
        });
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Degrade);

        let first = a.analyze(&wallet()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.score.breakdown.airdrop, 0);
        assert_eq!(first.score.breakdown.defi, 5);
        assert_eq!(first.score.details.unavailable, vec![RecordKind::TokenTransfer]);

        // Degraded results are not cached.
        let second = a.analyze(&wallet()).await.unwrap();
        assert!(!second.cached);
        assert_eq!(mock.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_records_cached_per_kind() {
        let mock = Arc::new(MockExplorer::default());
        let a = analyzer(mock.clone(), Duration::from_secs(300), PartialFailurePolicy::Strict);

        let first = a.records(RecordKind::Transaction, &wallet()).await.unwrap();
        assert!(!first.cached);
        assert_eq!(first.records.len(), 1);

        let second = a.records(RecordKind::Transaction, &wallet()).await.unwrap();
        assert!(second.cached);

        let other = a.records(RecordKind::NftTransfer, &wallet()).await.unwrap();
        assert!(!other.cached);
        assert!(other.records.is_empty());
        assert_eq!(mock.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_records_failure_propagates() {
        let mock = Arc::new(MockExplorer {
            failing: Some(RecordKind::NftTransfer),
            ..Default::default()
        });
        let a = analyzer(mock, Duration::from_secs(300), PartialFailurePolicy::Degrade);
        let err = a.records(RecordKind::NftTransfer, &wallet()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Fetch(_)));
        assert!(a.cache().is_empty());
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("strict".parse::<PartialFailurePolicy>().unwrap(), PartialFailurePolicy::Strict);
        assert_eq!("Degrade".parse::<PartialFailurePolicy>().unwrap(), PartialFailurePolicy::Degrade);
        assert!("lenient".parse::<PartialFailurePolicy>().is_err());
    }
}
