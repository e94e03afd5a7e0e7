//! Query result cache.
//!
//! Report payloads are keyed by a [`Fingerprint`] (endpoint plus canonical
//! query parameters) and registered under [`DependencyTag`]s describing the
//! ledger data they were computed from. Invalidation removes entries by tag,
//! by endpoint, or wholesale, and every invalidation advances a
//! [`Watermark`] so that a fill computed before it is refused.
//!
//! # Example
//!
//! ```ignore
//! let cache = QueryCache::with_defaults(Arc::new(InMemoryCacheBackend::new()));
//! let fingerprint = Fingerprint::for_endpoint(
//!     Endpoint::StudentPerformance,
//!     &QueryParams::new().with("student_id", 1),
//! );
//! let read = cache
//!     .get_or_compute(fingerprint, Freshness::Cached, || async {
//!         Ok(Computed::new(report, vec![DependencyTag::Student(StudentId(1))]))
//!     })
//!     .await?;
//! if read.was_cache_hit() { /* ... */ }
//! ```

pub mod dependency;
pub mod fingerprint;
pub mod freshness;
pub mod memory_backend;
pub mod read_through;
pub mod traits;
pub mod watermark;

pub use dependency::{DependencyIndex, DependencyTag};
pub use fingerprint::{Endpoint, Fingerprint, QueryParams};
pub use freshness::{CacheRead, Freshness};
pub use memory_backend::{InMemoryCacheBackend, DEFAULT_CAPACITY};
pub use read_through::{CacheConfig, Computed, QueryCache};
pub use traits::{CacheBackend, CacheStats, CachedPayload, PutOutcome};
pub use watermark::Watermark;
