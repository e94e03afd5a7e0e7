//! Shared engine setup for integration tests.

#![allow(dead_code)]

use gradebook_core::EngineConfig;
use gradebook_engine::{Engine, EngineContext};
use gradebook_storage::{CacheBackend, GradeLedger, InMemoryAggregateStore, InMemoryCacheBackend};
use gradebook_test_utils::fixtures::seeded_ledger;
use std::sync::Arc;

/// Engine over the seeded fixture ledger with every aggregate materialized.
pub async fn seeded_engine(config: EngineConfig) -> Engine {
    let ctx = EngineContext::in_memory(config, seeded_ledger().await).expect("valid config");
    rebuilt(ctx).await
}

/// Same, over a caller-supplied cache backend.
pub async fn seeded_engine_with_cache(
    config: EngineConfig,
    cache: Arc<dyn CacheBackend>,
) -> Engine {
    let ctx = EngineContext::new(
        config,
        Arc::new(seeded_ledger().await),
        Arc::new(InMemoryAggregateStore::new()),
        cache,
    )
    .expect("valid config");
    rebuilt(ctx).await
}

/// Engine over a caller-supplied ledger, rebuilt before it is returned.
pub async fn engine_over_ledger(config: EngineConfig, ledger: Arc<dyn GradeLedger>) -> Engine {
    let capacity = config.cache_capacity;
    let ctx = EngineContext::new(
        config,
        ledger,
        Arc::new(InMemoryAggregateStore::new()),
        Arc::new(InMemoryCacheBackend::with_capacity(capacity)),
    )
    .expect("valid config");
    rebuilt(ctx).await
}

async fn rebuilt(ctx: EngineContext) -> Engine {
    let engine = Engine::new(ctx);
    engine
        .maintainer()
        .rebuild_all()
        .await
        .expect("rebuild over fixtures");
    engine
}
