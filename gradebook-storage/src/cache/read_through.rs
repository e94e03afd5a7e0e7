//! Read-through query cache over a [`CacheBackend`].
//!
//! Report payloads are stored as serialized JSON bytes. A miss samples the
//! invalidation watermark before computing, so a fill that raced with an
//! invalidation is discarded by the backend instead of resurrecting stale
//! data.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use gradebook_core::{CacheError, GradebookResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::dependency::DependencyTag;
use super::fingerprint::Fingerprint;
use super::freshness::{CacheRead, Freshness};
use super::traits::{CacheBackend, CacheStats, CachedPayload, PutOutcome};
use super::watermark::Watermark;

/// Configuration for the query cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL applied to entries stored by `get_or_compute`.
    pub entry_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            entry_ttl: Duration::from_secs(300),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.entry_ttl = ttl;
        self
    }
}

/// A freshly computed report and the ledger data it was computed from.
#[derive(Debug, Clone)]
pub struct Computed<T> {
    pub value: T,
    pub dependencies: Vec<DependencyTag>,
}

impl<T> Computed<T> {
    pub fn new(value: T, dependencies: Vec<DependencyTag>) -> Self {
        Self {
            value,
            dependencies,
        }
    }
}

/// Fingerprint-keyed cache of serialized report payloads.
pub struct QueryCache<C>
where
    C: CacheBackend + ?Sized,
{
    backend: Arc<C>,
    config: CacheConfig,
}

impl<C> Clone for QueryCache<C>
where
    C: CacheBackend + ?Sized,
{
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<C> QueryCache<C>
where
    C: CacheBackend + ?Sized,
{
    pub fn new(backend: Arc<C>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    pub fn with_defaults(backend: Arc<C>) -> Self {
        Self::new(backend, CacheConfig::default())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &C {
        &self.backend
    }

    /// Raw lookup.
    pub async fn get(&self, fingerprint: &Fingerprint) -> GradebookResult<Option<CachedPayload>> {
        self.backend.get(fingerprint).await
    }

    /// Serialize and store `value`, computed after `observed` was sampled.
    pub async fn put<T: Serialize>(
        &self,
        fingerprint: Fingerprint,
        value: &T,
        ttl: Duration,
        dependencies: Vec<DependencyTag>,
        observed: Watermark,
    ) -> GradebookResult<PutOutcome> {
        let bytes = serde_json::to_vec(value).map_err(|e| CacheError::Serialization {
            endpoint: fingerprint.endpoint().to_string(),
            reason: e.to_string(),
        })?;
        self.backend
            .put(fingerprint, CachedPayload::new(bytes, ttl, dependencies), observed)
            .await
    }

    /// Serve `fingerprint` from the cache when `freshness` allows, otherwise
    /// run `compute` and store its result under the declared dependencies.
    ///
    /// A cached payload that no longer deserializes into `T` is treated as a miss.
    pub async fn get_or_compute<T, F, Fut>(
        &self,
        fingerprint: Fingerprint,
        freshness: Freshness,
        compute: F,
    ) -> GradebookResult<CacheRead<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = GradebookResult<Computed<T>>>,
    {
        if freshness != Freshness::Consistent {
            if let Some(payload) = self.backend.get(&fingerprint).await? {
                if freshness.accepts(payload.age(Utc::now())) {
                    if let Ok(value) = serde_json::from_slice::<T>(&payload.bytes) {
                        return Ok(CacheRead::from_cache(value, payload.created_at, None));
                    }
                }
            }
        }

        let observed = self.backend.current_watermark().await?;
        let computed = compute().await?;
        self.put(
            fingerprint,
            &computed.value,
            self.config.entry_ttl,
            computed.dependencies,
            observed,
        )
        .await?;
        Ok(CacheRead::from_storage(computed.value, Some(observed)))
    }

    pub async fn invalidate(&self, fingerprint: &Fingerprint) -> GradebookResult<bool> {
        self.backend.invalidate(fingerprint).await
    }

    pub async fn invalidate_tags(&self, tags: &[DependencyTag]) -> GradebookResult<u64> {
        self.backend.invalidate_tags(tags).await
    }

    pub async fn invalidate_endpoint(&self, endpoint: &str) -> GradebookResult<u64> {
        self.backend.invalidate_endpoint(endpoint).await
    }

    pub async fn invalidate_all(&self) -> GradebookResult<u64> {
        self.backend.invalidate_all().await
    }

    pub async fn current_watermark(&self) -> GradebookResult<Watermark> {
        self.backend.current_watermark().await
    }

    pub async fn stats(&self) -> GradebookResult<CacheStats> {
        self.backend.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::QueryParams;
    use crate::cache::memory_backend::InMemoryCacheBackend;
    use gradebook_core::StudentId;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Report {
        average: f64,
    }

    fn cache() -> QueryCache<InMemoryCacheBackend> {
        QueryCache::with_defaults(Arc::new(InMemoryCacheBackend::new()))
    }

    fn key() -> Fingerprint {
        Fingerprint::new("student_performance", &QueryParams::new().with("student_id", 1))
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let cache = cache();
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let compute = || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Computed::new(
                Report { average: 78.0 },
                vec![DependencyTag::Student(StudentId(1))],
            ))
        };

        let first = cache.get_or_compute(key(), Freshness::Cached, compute).await.unwrap();
        assert!(first.was_cache_miss());
        assert!(first.watermark().is_some());

        let second = cache
            .get_or_compute(key(), Freshness::Cached, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Computed::new(Report { average: 0.0 }, vec![]))
            })
            .await
            .unwrap();
        assert!(second.was_cache_hit());
        assert_eq!(second.into_value(), Report { average: 78.0 });
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_consistent_recomputes_and_refreshes() {
        let cache = cache();
        cache
            .get_or_compute(key(), Freshness::Cached, || async {
                Ok(Computed::new(Report { average: 70.0 }, vec![]))
            })
            .await
            .unwrap();

        let read = cache
            .get_or_compute(key(), Freshness::Consistent, || async {
                Ok(Computed::new(Report { average: 90.0 }, vec![]))
            })
            .await
            .unwrap();
        assert!(read.was_cache_miss());

        let cached = cache
            .get_or_compute(key(), Freshness::Cached, || async {
                Ok(Computed::new(Report { average: 0.0 }, vec![]))
            })
            .await
            .unwrap();
        assert_eq!(cached.into_value(), Report { average: 90.0 });
    }

    #[tokio::test]
    async fn test_fill_racing_with_invalidation_is_dropped() {
        let cache = cache();
        let racing = cache.clone();
        let read = cache
            .get_or_compute(key(), Freshness::Cached, || async move {
                racing.invalidate_all().await?;
                Ok(Computed::new(Report { average: 50.0 }, vec![]))
            })
            .await
            .unwrap();
        assert_eq!(read.value(), &Report { average: 50.0 });
        assert!(cache.get(&key()).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().rejected_puts, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_a_miss() {
        let cache = cache();
        let watermark = cache.current_watermark().await.unwrap();
        cache
            .put(key(), &"not a report", Duration::from_secs(60), vec![], watermark)
            .await
            .unwrap();

        let read = cache
            .get_or_compute(key(), Freshness::Cached, || async {
                Ok(Computed::new(Report { average: 81.0 }, vec![]))
            })
            .await
            .unwrap();
        assert!(read.was_cache_miss());
    }

    #[tokio::test]
    async fn test_compute_error_stores_nothing() {
        let cache = cache();
        let result: GradebookResult<CacheRead<Report>> = cache
            .get_or_compute(key(), Freshness::Cached, || async {
                Err(gradebook_core::LedgerError::Backend {
                    reason: "offline".to_string(),
                }
                .into())
            })
            .await;
        assert!(result.is_err());
        assert!(cache.get(&key()).await.unwrap().is_none());
    }
}
