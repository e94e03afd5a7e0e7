//! GRADEBOOK Engine
//!
//! Keeps the derived aggregate tables consistent with the grade ledger and
//! the report cache coherent with both.
//!
//! Writes go through the [`MutationGateway`]: ledger write, aggregate
//! recompute ([`AggregateMaintainer`]), then cache invalidation
//! ([`InvalidationCoordinator`]). Reads go through the [`ReportService`].
//! All components share one [`EngineContext`].

pub mod context;
pub mod coordinator;
pub mod gateway;
pub mod locks;
pub mod maintainer;
pub mod reports;
pub mod telemetry;

pub use context::EngineContext;
pub use coordinator::{
    AffectedKeys, CacheInvalidationFailure, InvalidationCoordinator, InvalidationReport,
};
pub use gateway::{
    BatchItemError, BatchOutcome, GradeChangeItem, GradeChangeResult, MutationGateway,
};
pub use locks::{AggregateLocks, KeyedGuard, KeyedLocks};
pub use maintainer::{AggregateMaintainer, RebuildSummary, RecomputeOutcome, SkipReason};
pub use reports::{
    AtRiskPage, AtRiskStudent, FailingSubject, ReportService, SchoolYearSummary,
    SemesterChanges, SemesterSummary, StudentPerformance, StudentSubject, StudentSummary,
    StudentsPage, SubjectPerformance,
};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig, TelemetryError};

/// Gateway, report service and maintainer over one context.
#[derive(Debug, Clone)]
pub struct Engine {
    context: EngineContext,
    gateway: MutationGateway,
    reports: ReportService,
}

impl Engine {
    pub fn new(context: EngineContext) -> Self {
        Self {
            gateway: MutationGateway::new(context.clone()),
            reports: ReportService::new(context.clone()),
            context,
        }
    }

    pub fn context(&self) -> &EngineContext {
        &self.context
    }

    pub fn gateway(&self) -> &MutationGateway {
        &self.gateway
    }

    pub fn reports(&self) -> &ReportService {
        &self.reports
    }

    pub fn maintainer(&self) -> &AggregateMaintainer {
        self.gateway.maintainer()
    }
}
