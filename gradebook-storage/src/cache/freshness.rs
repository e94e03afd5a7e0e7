//! Freshness contracts for cache reads.
//!
//! Callers say how stale a report may be via [`Freshness`]; every read
//! comes back as a [`CacheRead<T>`] that records whether it was served from
//! the cache and how old it is.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::watermark::Watermark;

/// Staleness tolerance of a cache read.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Freshness {
    /// Serve any live entry. Entries live until their TTL runs out or an
    /// invalidation removes them.
    #[default]
    Cached,

    /// Serve an entry only if it was stored at most `max_staleness` ago.
    BestEffort {
        max_staleness: Duration,
    },

    /// Skip the lookup, recompute, and refresh the entry.
    Consistent,
}

impl Freshness {
    pub fn best_effort(max_staleness: Duration) -> Self {
        Self::BestEffort { max_staleness }
    }

    pub fn consistent() -> Self {
        Self::Consistent
    }

    /// Whether an entry stored `age` ago may be served.
    pub fn accepts(&self, age: Duration) -> bool {
        match self {
            Self::Cached => true,
            Self::BestEffort { max_staleness } => age <= *max_staleness,
            Self::Consistent => false,
        }
    }
}

/// A report value plus where it came from.
///
/// Hits carry the time the payload was stored. Misses carry the compute
/// time and the watermark the fill was checked against.
#[derive(Debug, Clone)]
pub struct CacheRead<T> {
    value: T,
    produced_at: DateTime<Utc>,
    watermark: Option<Watermark>,
    hit: bool,
}

impl<T> CacheRead<T> {
    pub fn from_cache(value: T, stored_at: DateTime<Utc>, watermark: Option<Watermark>) -> Self {
        Self {
            value,
            produced_at: stored_at,
            watermark,
            hit: true,
        }
    }

    pub fn from_storage(value: T, watermark: Option<Watermark>) -> Self {
        Self {
            value,
            produced_at: Utc::now(),
            watermark,
            hit: false,
        }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    /// Age of the value; zero for a fresh miss.
    pub fn staleness(&self) -> Duration {
        (Utc::now() - self.produced_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn watermark(&self) -> Option<&Watermark> {
        self.watermark.as_ref()
    }

    pub fn was_cache_hit(&self) -> bool {
        self.hit
    }

    pub fn was_cache_miss(&self) -> bool {
        !self.hit
    }
}
