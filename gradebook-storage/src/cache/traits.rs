//! Cache backend trait and the entry types it stores.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gradebook_core::GradebookResult;
use std::time::Duration;

use super::dependency::DependencyTag;
use super::fingerprint::Fingerprint;
use super::watermark::Watermark;

/// A serialized report payload and its bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedPayload {
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub ttl: Duration,
    pub dependencies: Vec<DependencyTag>,
}

impl CachedPayload {
    pub fn new(bytes: Vec<u8>, ttl: Duration, dependencies: Vec<DependencyTag>) -> Self {
        Self {
            bytes,
            created_at: Utc::now(),
            ttl,
            dependencies,
        }
    }

    /// Age of the entry at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Visible only while `now - created_at < ttl`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.age(now) < self.ttl
    }
}

/// What happened to a put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    /// An invalidation happened after the payload's watermark was sampled.
    Rejected { observed: Watermark, current: Watermark },
}

impl PutOutcome {
    pub fn is_stored(&self) -> bool {
        matches!(self, PutOutcome::Stored)
    }
}

/// Pluggable store of report payloads.
///
/// Every invalidating call must advance the watermark, even when it
/// removes nothing, and a put must be rejected when its observed watermark
/// is older than the current one.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Live entry for `fingerprint`. Expired entries are misses.
    async fn get(&self, fingerprint: &Fingerprint) -> GradebookResult<Option<CachedPayload>>;

    /// Store an entry computed after `observed` was sampled.
    async fn put(
        &self,
        fingerprint: Fingerprint,
        payload: CachedPayload,
        observed: Watermark,
    ) -> GradebookResult<PutOutcome>;

    /// Remove one entry. Returns whether it existed.
    async fn invalidate(&self, fingerprint: &Fingerprint) -> GradebookResult<bool>;

    /// Remove every entry registered under any of `tags`.
    async fn invalidate_tags(&self, tags: &[DependencyTag]) -> GradebookResult<u64>;

    /// Remove every entry of one endpoint.
    async fn invalidate_endpoint(&self, endpoint: &str) -> GradebookResult<u64>;

    /// Remove everything.
    async fn invalidate_all(&self) -> GradebookResult<u64>;

    async fn current_watermark(&self) -> GradebookResult<Watermark>;

    async fn stats(&self) -> GradebookResult<CacheStats>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entry_count: u64,
    /// Approximate payload bytes held.
    pub memory_bytes: u64,
    /// Entries dropped to stay under capacity.
    pub evictions: u64,
    /// Entries dropped because their TTL ran out.
    pub expirations: u64,
    /// Entries removed by invalidation.
    pub invalidations: u64,
    /// Puts refused because of a newer watermark.
    pub rejected_puts: u64,
}

impl CacheStats {
    /// Hit rate in `[0.0, 1.0]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);
        assert_eq!(CacheStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn test_payload_liveness() {
        let payload = CachedPayload::new(vec![1, 2, 3], Duration::from_secs(300), vec![]);
        let now = payload.created_at;
        assert!(payload.is_live(now));
        assert!(payload.is_live(now + chrono::Duration::seconds(299)));
        assert!(!payload.is_live(now + chrono::Duration::seconds(300)));
    }
}
