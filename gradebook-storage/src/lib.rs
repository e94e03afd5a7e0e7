//! GRADEBOOK Storage
//!
//! Adapter traits and in-memory implementations for the grade ledger and the
//! aggregate store, plus the query result cache.

pub mod aggregates;
pub mod cache;
pub mod ledger;

pub use aggregates::{AggregateStore, InMemoryAggregateStore, StudentAggregateKey};
pub use cache::{
    CacheBackend, CacheConfig, CacheRead, CacheStats, CachedPayload, Computed, DependencyIndex,
    DependencyTag, Endpoint, Fingerprint, Freshness, InMemoryCacheBackend, PutOutcome,
    QueryCache, QueryParams, Watermark,
};
pub use ledger::{GradeLedger, InMemoryLedger};
