//! In-memory cache backend with TTL expiry, capacity eviction and an
//! invalidation watermark.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gradebook_core::GradebookResult;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

use super::dependency::{DependencyIndex, DependencyTag};
use super::fingerprint::Fingerprint;
use super::traits::{CacheBackend, CacheStats, CachedPayload, PutOutcome};
use super::watermark::Watermark;

/// Default entry count above which the oldest entries are evicted.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
struct StoredEntry {
    payload: CachedPayload,
    /// Insertion order; lower is older.
    slot: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Fingerprint, StoredEntry>,
    order: BTreeMap<u64, Fingerprint>,
    index: DependencyIndex,
    watermark: Watermark,
    next_slot: u64,
    memory_bytes: u64,
    evictions: u64,
    expirations: u64,
    invalidations: u64,
    rejected_puts: u64,
}

impl CacheState {
    fn insert(&mut self, fingerprint: Fingerprint, payload: CachedPayload) {
        self.remove(&fingerprint);

        let slot = self.next_slot;
        self.next_slot += 1;
        self.index.register(&fingerprint, &payload.dependencies);
        self.memory_bytes += payload.bytes.len() as u64;
        self.order.insert(slot, fingerprint.clone());
        self.entries.insert(fingerprint, StoredEntry { payload, slot });
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.entries.remove(fingerprint) {
            Some(entry) => {
                self.order.remove(&entry.slot);
                self.index.remove(fingerprint);
                self.memory_bytes = self
                    .memory_bytes
                    .saturating_sub(entry.payload.bytes.len() as u64);
                true
            }
            None => false,
        }
    }

    fn remove_all<'a>(&mut self, fingerprints: impl IntoIterator<Item = &'a Fingerprint>) -> u64 {
        let mut removed = 0;
        for fingerprint in fingerprints {
            if self.remove(fingerprint) {
                removed += 1;
            }
        }
        self.invalidations += removed;
        removed
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired: Vec<Fingerprint> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.payload.is_live(now))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fingerprint in &expired {
            self.remove(fingerprint);
        }
        self.expirations += expired.len() as u64;
    }

    /// Drop expired entries, then the oldest, until at most `capacity` remain.
    fn enforce_capacity(&mut self, capacity: usize, now: DateTime<Utc>) {
        if self.entries.len() <= capacity {
            return;
        }
        self.purge_expired(now);
        while self.entries.len() > capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            // `remove` also clears the (already popped) order slot.
            if self.remove(&oldest) {
                self.evictions += 1;
            }
        }
    }

    fn advance_watermark(&mut self) {
        self.watermark = self.watermark.advance();
    }
}

/// Process-local [`CacheBackend`].
#[derive(Debug)]
pub struct InMemoryCacheBackend {
    state: RwLock<CacheState>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InMemoryCacheBackend {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Backend holding at most `capacity` entries (at least one).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: RwLock::new(CacheState::default()),
            capacity: capacity.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored entries, expired ones included until purged.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Tags an entry was registered under.
    pub async fn dependencies_of(&self, fingerprint: &Fingerprint) -> Option<Vec<DependencyTag>> {
        let state = self.state.read().await;
        state.index.tags_of(fingerprint).map(<[DependencyTag]>::to_vec)
    }
}

impl Default for InMemoryCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, fingerprint: &Fingerprint) -> GradebookResult<Option<CachedPayload>> {
        let now = Utc::now();
        {
            let state = self.state.read().await;
            match state.entries.get(fingerprint) {
                Some(entry) if entry.payload.is_live(now) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(Some(entry.payload.clone()));
                }
                Some(_) => {}
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
            }
        }

        // Expired: drop it unless a fresh put replaced it meanwhile.
        let mut state = self.state.write().await;
        let expired = state
            .entries
            .get(fingerprint)
            .is_some_and(|e| !e.payload.is_live(now));
        if expired {
            state.remove(fingerprint);
            state.expirations += 1;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(None)
    }

    async fn put(
        &self,
        fingerprint: Fingerprint,
        payload: CachedPayload,
        observed: Watermark,
    ) -> GradebookResult<PutOutcome> {
        let mut state = self.state.write().await;
        if state.watermark.is_newer_than(&observed) {
            state.rejected_puts += 1;
            return Ok(PutOutcome::Rejected {
                observed,
                current: state.watermark,
            });
        }

        state.insert(fingerprint, payload);
        state.enforce_capacity(self.capacity, Utc::now());
        Ok(PutOutcome::Stored)
    }

    async fn invalidate(&self, fingerprint: &Fingerprint) -> GradebookResult<bool> {
        let mut state = self.state.write().await;
        state.advance_watermark();
        Ok(state.remove_all([fingerprint]) == 1)
    }

    async fn invalidate_tags(&self, tags: &[DependencyTag]) -> GradebookResult<u64> {
        let mut state = self.state.write().await;
        state.advance_watermark();
        let matching = state.index.matching(tags);
        Ok(state.remove_all(&matching))
    }

    async fn invalidate_endpoint(&self, endpoint: &str) -> GradebookResult<u64> {
        let mut state = self.state.write().await;
        state.advance_watermark();
        let matching: Vec<Fingerprint> = state
            .entries
            .keys()
            .filter(|fp| fp.belongs_to(endpoint))
            .cloned()
            .collect();
        Ok(state.remove_all(&matching))
    }

    async fn invalidate_all(&self) -> GradebookResult<u64> {
        let mut state = self.state.write().await;
        state.advance_watermark();
        let removed = state.entries.len() as u64;
        state.entries.clear();
        state.order.clear();
        state.index.clear();
        state.memory_bytes = 0;
        state.invalidations += removed;
        Ok(removed)
    }

    async fn current_watermark(&self) -> GradebookResult<Watermark> {
        Ok(self.state.read().await.watermark)
    }

    async fn stats(&self) -> GradebookResult<CacheStats> {
        let state = self.state.read().await;
        Ok(CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entry_count: state.entries.len() as u64,
            memory_bytes: state.memory_bytes,
            evictions: state.evictions,
            expirations: state.expirations,
            invalidations: state.invalidations,
            rejected_puts: state.rejected_puts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::fingerprint::QueryParams;
    use gradebook_core::{SemesterId, StudentId, SubjectCode};
    use std::time::Duration;

    fn fp(endpoint: &str, page: i64) -> Fingerprint {
        Fingerprint::new(endpoint, &QueryParams::new().with("page", page))
    }

    fn payload(tags: Vec<DependencyTag>) -> CachedPayload {
        CachedPayload::new(b"{}".to_vec(), Duration::from_secs(300), tags)
    }

    #[tokio::test]
    async fn test_put_get_and_stats() {
        let cache = InMemoryCacheBackend::new();
        let key = fp("a", 1);
        assert!(cache.get(&key).await.unwrap().is_none());

        let watermark = cache.current_watermark().await.unwrap();
        let outcome = cache.put(key.clone(), payload(vec![]), watermark).await.unwrap();
        assert!(outcome.is_stored());
        assert_eq!(cache.get(&key).await.unwrap().map(|p| p.bytes), Some(b"{}".to_vec()));

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.memory_bytes, 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = InMemoryCacheBackend::new();
        let key = fp("a", 1);
        let mut stale = payload(vec![]);
        stale.created_at = Utc::now() - chrono::Duration::seconds(301);
        cache.put(key.clone(), stale, Watermark::zero()).await.unwrap();

        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(cache.is_empty().await);
        assert_eq!(cache.stats().await.unwrap().expirations, 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let cache = InMemoryCacheBackend::with_capacity(2);
        for page in 1..=3 {
            cache.put(fp("a", page), payload(vec![]), Watermark::zero()).await.unwrap();
        }
        assert_eq!(cache.len().await, 2);
        assert!(cache.get(&fp("a", 1)).await.unwrap().is_none());
        assert!(cache.get(&fp("a", 3)).await.unwrap().is_some());
        assert_eq!(cache.stats().await.unwrap().evictions, 1);
        assert!(cache.dependencies_of(&fp("a", 1)).await.is_none());
    }

    #[tokio::test]
    async fn test_stale_put_is_rejected_after_invalidation() {
        let cache = InMemoryCacheBackend::new();
        let key = fp("a", 1);
        let before = cache.current_watermark().await.unwrap();

        assert!(!cache.invalidate(&key).await.unwrap());

        let outcome = cache.put(key.clone(), payload(vec![]), before).await.unwrap();
        assert!(matches!(outcome, PutOutcome::Rejected { .. }));
        assert!(cache.get(&key).await.unwrap().is_none());
        assert_eq!(cache.stats().await.unwrap().rejected_puts, 1);

        let after = cache.current_watermark().await.unwrap();
        assert!(cache.put(key.clone(), payload(vec![]), after).await.unwrap().is_stored());
    }

    #[tokio::test]
    async fn test_invalidate_tags_removes_dependents_and_unindexed() {
        let cache = InMemoryCacheBackend::new();
        let w = Watermark::zero();
        let student_one = fp("student_performance", 1);
        let student_two = fp("student_performance", 2);
        let untagged = fp("custom", 1);
        cache
            .put(student_one.clone(), payload(vec![DependencyTag::Student(StudentId(1))]), w)
            .await
            .unwrap();
        cache
            .put(student_two.clone(), payload(vec![DependencyTag::Student(StudentId(2))]), w)
            .await
            .unwrap();
        cache.put(untagged.clone(), payload(vec![]), w).await.unwrap();

        let tags = DependencyTag::for_grade_change(
            StudentId(1),
            SemesterId(1),
            &SubjectCode::from("MATH101"),
            None,
        );
        assert_eq!(cache.invalidate_tags(&tags).await.unwrap(), 2);
        assert!(cache.get(&student_one).await.unwrap().is_none());
        assert!(cache.get(&untagged).await.unwrap().is_none());
        assert!(cache.get(&student_two).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalidate_endpoint_and_all() {
        let cache = InMemoryCacheBackend::new();
        let w = Watermark::zero();
        for page in 1..=3 {
            cache.put(fp("a", page), payload(vec![]), w).await.unwrap();
        }
        cache.put(fp("b", 1), payload(vec![]), w).await.unwrap();

        assert_eq!(cache.invalidate_endpoint("a").await.unwrap(), 3);
        assert_eq!(cache.len().await, 1);
        assert_eq!(cache.invalidate_all().await.unwrap(), 1);
        assert!(cache.is_empty().await);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.invalidations, 4);
        assert_eq!(stats.memory_bytes, 0);
        assert_eq!(cache.current_watermark().await.unwrap().sequence, 2);
    }
}
