//! Engine context: the shared handles every component works through.

use gradebook_core::{EngineConfig, GradebookResult, RecordKey};
use gradebook_storage::{
    AggregateStore, CacheBackend, CacheConfig, GradeLedger, InMemoryAggregateStore,
    InMemoryCacheBackend, InMemoryLedger, QueryCache,
};
use std::sync::Arc;

use crate::locks::{AggregateLocks, KeyedLocks};

/// Built once at start-up and cloned into every component.
#[derive(Clone)]
pub struct EngineContext {
    config: Arc<EngineConfig>,
    ledger: Arc<dyn GradeLedger>,
    aggregates: Arc<dyn AggregateStore>,
    cache: QueryCache<dyn CacheBackend>,
    record_locks: KeyedLocks<RecordKey>,
    aggregate_locks: AggregateLocks,
}

impl EngineContext {
    /// Assemble a context from adapters. Fails if `config` does not validate.
    pub fn new(
        config: EngineConfig,
        ledger: Arc<dyn GradeLedger>,
        aggregates: Arc<dyn AggregateStore>,
        cache_backend: Arc<dyn CacheBackend>,
    ) -> GradebookResult<Self> {
        config.validate()?;
        let cache = QueryCache::new(
            cache_backend,
            CacheConfig::new().with_ttl(config.report_ttl),
        );
        Ok(Self {
            config: Arc::new(config),
            ledger,
            aggregates,
            cache,
            record_locks: KeyedLocks::new(),
            aggregate_locks: AggregateLocks::default(),
        })
    }

    /// Context over the given in-memory ledger, with fresh in-memory
    /// aggregate and cache stores.
    pub fn in_memory(config: EngineConfig, ledger: InMemoryLedger) -> GradebookResult<Self> {
        let capacity = config.cache_capacity;
        Self::new(
            config,
            Arc::new(ledger),
            Arc::new(InMemoryAggregateStore::new()),
            Arc::new(InMemoryCacheBackend::with_capacity(capacity)),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &dyn GradeLedger {
        self.ledger.as_ref()
    }

    pub fn aggregates(&self) -> &dyn AggregateStore {
        self.aggregates.as_ref()
    }

    pub fn cache(&self) -> &QueryCache<dyn CacheBackend> {
        &self.cache
    }

    pub fn record_locks(&self) -> &KeyedLocks<RecordKey> {
        &self.record_locks
    }

    pub fn aggregate_locks(&self) -> &AggregateLocks {
        &self.aggregate_locks
    }
}

impl std::fmt::Debug for EngineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineContext")
            .field("config", &self.config)
            .field("locked_records", &self.record_locks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_invalid_config_rejected() {
        let config = EngineConfig::default().with_report_ttl(Duration::ZERO);
        let err = EngineContext::in_memory(config, InMemoryLedger::new()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_cache_ttl_follows_config() {
        let config = EngineConfig::default().with_report_ttl(Duration::from_secs(42));
        let ctx = EngineContext::in_memory(config, InMemoryLedger::new()).unwrap();
        assert_eq!(ctx.cache().config().entry_ttl, Duration::from_secs(42));
    }
}
